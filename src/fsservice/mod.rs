//! Filesystem service driver
//!
//! Each contract instance has two systemd user-mode units,
//! `contract_fs.service` and `ledger_fs.service`, that mount the instance's
//! hpfs-backed filesystems before the container starts. No direct teacher
//! counterpart exists for this (the teacher has no systemd-user-unit
//! concept); the shelling pattern follows the same
//! `tokio::process::Command` idiom the teacher uses for its own
//! subprocess-driven installers.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{AgentError, Result};

pub const CONTRACT_FS_UNIT: &str = "contract_fs";
pub const LEDGER_FS_UNIT: &str = "ledger_fs";

pub struct FsServiceDriver;

impl FsServiceDriver {
    pub fn new() -> Self {
        Self
    }

    async fn systemctl(&self, username: &str, user_id: u32, args: &[&str]) -> Result<()> {
        let runtime_dir = format!("/run/user/{user_id}");
        let status = Command::new("sudo")
            .arg("-u")
            .arg(username)
            .env("XDG_RUNTIME_DIR", &runtime_dir)
            .arg("systemctl")
            .arg("--user")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .status()
            .await
            .map_err(|e| AgentError::ExternalFailure(format!("failed to invoke systemctl: {e}")))?;

        if !status.success() {
            return Err(AgentError::ExternalFailure(format!(
                "systemctl {:?} for {} exited with {:?}",
                args, username, status.code()
            )));
        }
        Ok(())
    }

    /// Enable and start both filesystem services for an instance.
    pub async fn start_all(&self, username: &str, user_id: u32) -> Result<()> {
        for unit in [CONTRACT_FS_UNIT, LEDGER_FS_UNIT] {
            self.systemctl(username, user_id, &["enable", "--now", unit])
                .await?;
        }
        info!("started filesystem services for {}", username);
        Ok(())
    }

    /// Stop and disable both filesystem services for an instance.
    pub async fn stop_all(&self, username: &str, user_id: u32) -> Result<()> {
        for unit in [CONTRACT_FS_UNIT, LEDGER_FS_UNIT] {
            self.systemctl(username, user_id, &["disable", "--now", unit])
                .await?;
        }
        debug!("stopped filesystem services for {}", username);
        Ok(())
    }
}

impl Default for FsServiceDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Patches a `KEY=VALUE` service env file in place, preserving unrelated
/// keys and comments, matching the line-oriented parsing style the teacher
/// uses in its own `parser` module.
pub fn patch_env_file(path: &Path, updates: &BTreeMap<String, String>) -> Result<()> {
    let existing = std::fs::read_to_string(path).unwrap_or_default();
    let mut seen: BTreeMap<String, bool> = updates.keys().map(|k| (k.clone(), false)).collect();
    let mut out_lines = Vec::new();

    for line in existing.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            out_lines.push(line.to_string());
            continue;
        }
        if let Some((key, _)) = trimmed.split_once('=') {
            if let Some(new_value) = updates.get(key) {
                out_lines.push(format!("{key}={new_value}"));
                seen.insert(key.to_string(), true);
                continue;
            }
        }
        out_lines.push(line.to_string());
    }

    for (key, value) in updates {
        if !seen.get(key).copied().unwrap_or(false) {
            out_lines.push(format!("{key}={value}"));
        }
    }

    std::fs::write(path, out_lines.join("\n") + "\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_env_file_preserves_unrelated_keys_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contract_fs.env");
        std::fs::write(&path, "# comment\nMOUNT_POINT=/old\nOTHER=1\n").unwrap();

        let mut updates = BTreeMap::new();
        updates.insert("MOUNT_POINT".to_string(), "/new".to_string());
        updates.insert("NEW_KEY".to_string(), "added".to_string());

        patch_env_file(&path, &updates).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# comment"));
        assert!(content.contains("MOUNT_POINT=/new"));
        assert!(content.contains("OTHER=1"));
        assert!(content.contains("NEW_KEY=added"));
    }
}
