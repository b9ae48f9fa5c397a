//! Linux user provisioning
//!
//! Privilege separation boundary: the agent never creates or removes
//! system users directly. It shells out to two site-configured scripts and
//! trusts only their last output line, matching
//! `original_source/src/hp_manager.cpp`'s `install_user`/`uninstall_user`.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::manager::InstanceResources;

const INST_SUCCESS_PREFIX: &str = "INST_SUC";
const INST_ERROR_PREFIX: &str = "INST_ERR";
const UNINST_SUCCESS_PREFIX: &str = "UNINST_SUC";
const UNINST_ERROR_PREFIX: &str = "UNINST_ERR";

/// Fixed uid:gid the contract process runs as inside every instance's
/// container, matching `contract::template::CONTRACT_RUN_AS`.
const CONTRACT_UID: u32 = 10000;
const CONTRACT_GID: u32 = 10000;

/// A freshly provisioned Linux user.
#[derive(Debug, Clone)]
pub struct ProvisionedUser {
    pub user_id: u32,
    pub username: String,
}

pub struct UserProvisioner {
    install_script: PathBuf,
    uninstall_script: PathBuf,
}

impl UserProvisioner {
    pub fn new(install_script: PathBuf, uninstall_script: PathBuf) -> Self {
        Self {
            install_script,
            uninstall_script,
        }
    }

    /// Run the install script for `container_name` with the per-instance
    /// resource budget. Positional args match
    /// `original_source/src/hp_manager.cpp`'s `install_user`: `max_cpu_us`,
    /// `max_mem_kbytes`, `storage_kbytes`, `container_name`, `contract_uid`,
    /// `contract_gid`. The script's first printed line is the new user's
    /// numeric id, the second is the username, and the last non-empty line
    /// is the sentinel — indices are absolute, not counted back from the
    /// sentinel, so any extra diagnostic output the script prints in
    /// between doesn't shift the fields.
    pub async fn install(
        &self,
        resources: InstanceResources,
        container_name: &str,
    ) -> Result<ProvisionedUser> {
        let output = Command::new(&self.install_script)
            .arg(resources.cpu_us.to_string())
            .arg(resources.mem_kbytes.to_string())
            .arg(resources.storage_kbytes.to_string())
            .arg(container_name)
            .arg(CONTRACT_UID.to_string())
            .arg(CONTRACT_GID.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                AgentError::ExternalFailure(format!("user install script failed to run: {e}"))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();

        let last = lines.last().copied().unwrap_or("");
        if !last.starts_with(INST_SUCCESS_PREFIX) {
            if last.starts_with(INST_ERROR_PREFIX) {
                return Err(AgentError::ExternalFailure(format!(
                    "user install reported failure: {last}"
                )));
            }
            return Err(AgentError::ExternalFailure(format!(
                "user install script produced no recognizable sentinel, last line: {last:?}"
            )));
        }

        if lines.len() < 3 {
            return Err(AgentError::ExternalFailure(
                "user install script succeeded but did not print user id/username".into(),
            ));
        }
        let user_id: u32 = lines[0]
            .trim()
            .parse()
            .map_err(|_| AgentError::ExternalFailure("invalid user id from install script".into()))?;
        let username = lines[1].trim().to_string();

        debug!("provisioned user {} (uid {}) for {}", username, user_id, container_name);
        Ok(ProvisionedUser { user_id, username })
    }

    /// Run the uninstall script for `username`. Best-effort: a failure here
    /// is logged by the caller as part of a rollback chain, not propagated
    /// as a hard error unless the caller is the primary operation.
    pub async fn uninstall(&self, username: &str) -> Result<()> {
        let output = Command::new(&self.uninstall_script)
            .arg(username)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                AgentError::ExternalFailure(format!("user uninstall script failed to run: {e}"))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last = stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .last()
            .unwrap_or("");

        if last.starts_with(UNINST_SUCCESS_PREFIX) {
            Ok(())
        } else if last.starts_with(UNINST_ERROR_PREFIX) {
            warn!("user uninstall reported failure for {}: {}", username, last);
            Err(AgentError::ExternalFailure(format!(
                "user uninstall reported failure: {last}"
            )))
        } else {
            Err(AgentError::ExternalFailure(format!(
                "user uninstall script produced no recognizable sentinel, last line: {last:?}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn sample_resources() -> InstanceResources {
        InstanceResources {
            cpu_us: 100_000,
            mem_kbytes: 500_000,
            storage_kbytes: 1_000_000,
        }
    }

    #[tokio::test]
    async fn install_parses_sentinel_and_user_fields() {
        let dir = tempfile::tempdir().unwrap();
        let install = write_script(
            dir.path(),
            "install.sh",
            "echo 2001\necho sashi01\necho INST_SUC",
        );
        let uninstall = write_script(dir.path(), "uninstall.sh", "echo UNINST_SUC");

        let prov = UserProvisioner::new(install, uninstall);
        let user = prov.install(sample_resources(), "sashi01").await.unwrap();
        assert_eq!(user.user_id, 2001);
        assert_eq!(user.username, "sashi01");
    }

    #[tokio::test]
    async fn install_ignores_extra_diagnostic_lines_before_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let install = write_script(
            dir.path(),
            "install.sh",
            "echo 2002\necho sashi02\necho some diagnostic chatter\necho INST_SUC",
        );
        let uninstall = write_script(dir.path(), "uninstall.sh", "echo UNINST_SUC");

        let prov = UserProvisioner::new(install, uninstall);
        let user = prov.install(sample_resources(), "sashi02").await.unwrap();
        assert_eq!(user.user_id, 2002);
        assert_eq!(user.username, "sashi02");
    }

    #[tokio::test]
    async fn install_failure_sentinel_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let install = write_script(dir.path(), "install.sh", "echo INST_ERR no space left");
        let uninstall = write_script(dir.path(), "uninstall.sh", "echo UNINST_SUC");

        let prov = UserProvisioner::new(install, uninstall);
        assert!(prov.install(sample_resources(), "sashi01").await.is_err());
    }

    #[tokio::test]
    async fn uninstall_parses_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let install = write_script(dir.path(), "install.sh", "echo INST_SUC");
        let uninstall = write_script(dir.path(), "uninstall.sh", "echo UNINST_SUC");

        let prov = UserProvisioner::new(install, uninstall);
        prov.uninstall("sashi01").await.unwrap();
    }
}
