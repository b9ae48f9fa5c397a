//! Contract instance filesystem materialization
//!
//! Builds a fresh contract directory from the node's template: copies the
//! template tree into a `/tmp` staging area, generates the instance's
//! ed25519 keypair and self-signed TLS material, patches `cfg/hp.cfg`, then
//! atomically moves the staged tree into its final location and chowns it
//! to the instance's dedicated Linux user. Any failure along the way
//! removes the staging directory and never touches the final path, so a
//! half-built contract tree never becomes visible.

mod template;

use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use template::HpCfgFields;

/// Keys and cert material generated for a single contract instance.
pub struct InstanceIdentity {
    pub public_key_hex: String,
    pub private_key_hex: String,
    pub tls_cert_pem: String,
    pub tls_key_pem: String,
}

/// Generate a fresh ed25519 keypair for a contract instance, matching the
/// original's per-instance node key (distinct from the owning user's
/// account key, which is supplied by the caller).
pub fn generate_node_keypair() -> (String, String) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (
        format!("ed{}", hex::encode(verifying_key.to_bytes())),
        format!("ed{}", hex::encode(signing_key.to_bytes())),
    )
}

/// Generate a self-signed TLS certificate/key pair for `CN=<username>`,
/// replacing the original's `openssl req` subprocess call with an in-process
/// equivalent.
pub fn generate_tls_material(username: &str) -> Result<(String, String)> {
    let cert = rcgen::generate_simple_self_signed(vec![username.to_string()])
        .map_err(|e| AgentError::ExternalFailure(format!("tls cert generation failed: {e}")))?;
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();
    Ok((cert_pem, key_pem))
}

pub struct ContractMaterializer {
    template_path: PathBuf,
}

pub struct MaterializeRequest<'a> {
    pub owner_pubkey: &'a str,
    pub contract_id: &'a str,
    pub username: &'a str,
    pub user_id: u32,
    pub bin_path: &'a str,
    pub peer_port: u16,
    pub user_port: u16,
    /// Final destination, normally `/home/<username>/contract_<username>`.
    pub destination: &'a Path,
}

impl ContractMaterializer {
    pub fn new(template_path: PathBuf) -> Self {
        Self { template_path }
    }

    pub async fn materialize(&self, req: MaterializeRequest<'_>) -> Result<InstanceIdentity> {
        let staging = tempfile::Builder::new()
            .prefix("sashi-contract-")
            .tempdir_in("/tmp")
            .map_err(|e| AgentError::ExternalFailure(format!("failed to create staging dir: {e}")))?;

        match self.materialize_into(staging.path(), &req).await {
            Ok(identity) => {
                move_into_place(staging.path(), req.destination)?;
                chown_recursive(req.destination, req.user_id)?;
                // staging dir was moved, not removed; `staging` still owns
                // the (now empty or nonexistent) path, dropped harmlessly.
                info!(
                    "materialized contract for {} at {:?}",
                    req.username, req.destination
                );
                Ok(identity)
            }
            Err(e) => {
                debug!("contract materialization failed, discarding staging dir: {e}");
                Err(e)
            }
        }
    }

    async fn materialize_into(
        &self,
        staging: &Path,
        req: &MaterializeRequest<'_>,
    ) -> Result<InstanceIdentity> {
        copy_dir_recursive(&self.template_path, staging)?;

        let (node_public_key, node_private_key) = generate_node_keypair();
        let (tls_cert_pem, tls_key_pem) = generate_tls_material(req.username)?;

        let hp_cfg_path = staging.join("cfg/hp.cfg");
        let template_cfg = std::fs::read_to_string(&hp_cfg_path).map_err(|e| {
            AgentError::ExternalFailure(format!("template missing cfg/hp.cfg: {e}"))
        })?;

        let patched = template::patch_hp_cfg(
            &template_cfg,
            &HpCfgFields {
                contract_id: req.contract_id,
                owner_pubkey: req.owner_pubkey,
                node_public_key: &node_public_key,
                node_private_key: &node_private_key,
                bin_path: req.bin_path,
                peer_port: req.peer_port,
                user_port: req.user_port,
            },
        )?;
        std::fs::write(&hp_cfg_path, patched)?;

        let cfg_dir = staging.join("cfg");
        std::fs::write(cfg_dir.join("tlscert.pem"), &tls_cert_pem)?;
        std::fs::write(cfg_dir.join("tlskey.pem"), &tls_key_pem)?;

        Ok(InstanceIdentity {
            public_key_hex: node_public_key,
            private_key_hex: node_private_key,
            tls_cert_pem,
            tls_key_pem,
        })
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let dest_path = dst.join(entry.file_name());
        if ty.is_dir() {
            std::fs::create_dir_all(&dest_path)?;
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

fn move_into_place(staging: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(staging, destination).map_err(|e| {
        AgentError::ExternalFailure(format!(
            "failed to move staged contract into place at {:?}: {e}",
            destination
        ))
    })
}

/// Recursively chowns the materialized tree to the instance's Linux user.
/// Requires `CAP_CHOWN` (the agent normally runs as root); a permission
/// failure is logged rather than propagated so an unprivileged development
/// run still produces a usable contract tree owned by the invoking user.
fn chown_recursive(path: &Path, uid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::unistd::{chown, Gid, Uid};

    let uid = Uid::from_raw(uid);
    let gid = Gid::from_raw(uid.as_raw());

    match chown(path, Some(uid), Some(gid)) {
        Ok(()) => {}
        Err(Errno::EPERM) => {
            debug!("skipping chown of {:?}: insufficient privilege", path);
            return Ok(());
        }
        Err(e) => {
            return Err(AgentError::ExternalFailure(format!(
                "chown failed on {:?}: {e}",
                path
            )))
        }
    }

    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            chown_recursive(&entry.path(), uid.as_raw())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_template(dir: &Path) {
        std::fs::create_dir_all(dir.join("cfg")).unwrap();
        std::fs::write(
            dir.join("cfg/hp.cfg"),
            r#"{"history": {"shards": 2}, "log": {"log_level": "inf"}}"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.join("contract_fs/seed")).unwrap();
        std::fs::write(dir.join("contract_fs/seed/README"), "seed contents").unwrap();
    }

    #[tokio::test]
    async fn materialize_copies_template_and_patches_cfg() {
        let root = tempfile::tempdir().unwrap();
        let template_dir = root.path().join("template");
        write_template(&template_dir);

        let dest = root.path().join("dest");

        let materializer = ContractMaterializer::new(template_dir);
        let identity = materializer
            .materialize(MaterializeRequest {
                owner_pubkey: "owner-pub",
                contract_id: "contract-1",
                username: "sashi01",
                user_id: 2001,
                bin_path: "bootstrap_contract",
                peer_port: 22861,
                user_port: 26201,
                destination: &dest,
            })
            .await
            .unwrap();

        assert!(!identity.public_key_hex.is_empty());
        assert!(dest.join("cfg/hp.cfg").exists());
        assert!(dest.join("contract_fs/seed/README").exists());
        assert!(dest.join("cfg/tlscert.pem").exists());

        let cfg: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dest.join("cfg/hp.cfg")).unwrap())
                .unwrap();
        assert_eq!(cfg["contract"]["id"], "contract-1");
        assert_eq!(cfg["mesh"]["port"], 22861);
    }

    #[tokio::test]
    async fn missing_template_cfg_fails_without_touching_destination() {
        let root = tempfile::tempdir().unwrap();
        let template_dir = root.path().join("template");
        std::fs::create_dir_all(&template_dir).unwrap();
        let dest = root.path().join("dest");

        let materializer = ContractMaterializer::new(template_dir);
        let result = materializer
            .materialize(MaterializeRequest {
                owner_pubkey: "owner-pub",
                contract_id: "contract-1",
                username: "sashi01",
                user_id: 2001,
                bin_path: "bootstrap_contract",
                peer_port: 22861,
                user_port: 26201,
                destination: &dest,
            })
            .await;

        assert!(result.is_err());
        assert!(!dest.exists());
    }
}
