//! Configuration structures and loading
//!
//! `sa.cfg` is JSON (unlike the ambient toolchain's usual TOML), matching
//! the wire format the original agent used for its own on-disk config and
//! for the `initiate` message's config patch.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top level configuration loaded from `sa.cfg`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Configuration {
    /// Config schema version, carried through verbatim on save.
    #[serde(default = "default_version")]
    pub version: String,

    pub hp: HpConfiguration,

    #[serde(default)]
    pub system: SystemConfiguration,

    #[serde(default)]
    pub docker: DockerConfiguration,

    #[serde(default)]
    pub log: LogConfiguration,

    /// Filesystem locations resolved relative to the config file's
    /// directory. Not part of the on-disk schema itself (paths instead).
    #[serde(skip)]
    pub paths: Paths,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl Configuration {
    /// Load configuration from a JSON file, resolving all on-disk paths
    /// relative to the config's own directory and the data directory's
    /// `contract_template`/`user_install.sh`/`user_uninstall.sh` layout.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config: Configuration =
            serde_json::from_str(&content).with_context(|| "failed to parse sa.cfg")?;

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.paths = Paths::resolve(&base_dir, &config.system.data_dir);

        std::fs::create_dir_all(&config.paths.data_dir)?;
        std::fs::create_dir_all(&config.paths.log_dir)?;

        Ok(config)
    }
}

/// Filesystem locations the agent reads/writes at runtime, grounded on
/// `original_source/src/conf.hpp`'s `sa_context`.
#[derive(Debug, Clone, Default)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub db_path: PathBuf,
    pub local_socket_path: PathBuf,
    pub contract_template_path: PathBuf,
    pub user_install_sh: PathBuf,
    pub user_uninstall_sh: PathBuf,
    pub hpws_exe_path: PathBuf,
}

impl Paths {
    fn resolve(base_dir: &Path, data_dir: &Path) -> Self {
        let data_dir = if data_dir.is_absolute() {
            data_dir.to_path_buf()
        } else {
            base_dir.join(data_dir)
        };

        Self {
            log_dir: data_dir.join("log"),
            db_path: data_dir.join("sa.sqlite"),
            local_socket_path: data_dir.join("sa.sock"),
            contract_template_path: base_dir.join("contract_template"),
            user_install_sh: base_dir.join("scripts/user_install.sh"),
            user_uninstall_sh: base_dir.join("scripts/user_uninstall.sh"),
            hpws_exe_path: base_dir.join("bin/hpws"),
            data_dir,
        }
    }
}

/// Hot Pocket instance networking defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HpConfiguration {
    #[serde(default = "default_host_address")]
    pub host_address: String,

    #[serde(default = "default_init_peer_port")]
    pub init_peer_port: u16,

    #[serde(default = "default_init_user_port")]
    pub init_user_port: u16,
}

fn default_host_address() -> String {
    "0.0.0.0".into()
}

fn default_init_peer_port() -> u16 {
    22861
}

fn default_init_user_port() -> u16 {
    26201
}

/// Node capacity and resource-sharing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemConfiguration {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub max_cpu_us: u64,

    #[serde(default)]
    pub max_mem_kbytes: u64,

    #[serde(default)]
    pub max_swap_kbytes: u64,

    #[serde(default)]
    pub max_storage_kbytes: u64,

    #[serde(default = "default_max_instance_count")]
    pub max_instance_count: u32,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_cpu_us: 0,
            max_mem_kbytes: 0,
            max_swap_kbytes: 0,
            max_storage_kbytes: 0,
            max_instance_count: default_max_instance_count(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".sashiagent")
}

fn default_max_instance_count() -> u32 {
    8
}

/// Docker image configuration: contract version string -> image reference.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DockerConfiguration {
    #[serde(default = "default_images")]
    pub images: std::collections::HashMap<String, String>,
}

fn default_images() -> std::collections::HashMap<String, String> {
    let mut m = std::collections::HashMap::new();
    m.insert(
        "hp-2.2".to_string(),
        "evernode/sashimono:hp.latest-ubt.20.04-njs.16".to_string(),
    );
    m
}

/// Logging configuration, consumed by `main` when wiring up `tracing-subscriber`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfiguration {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_loggers")]
    pub loggers: Vec<String>,

    #[serde(default = "default_max_mbytes_per_file")]
    pub max_mbytes_per_file: u64,

    #[serde(default = "default_max_file_count")]
    pub max_file_count: u32,
}

impl Default for LogConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            loggers: default_loggers(),
            max_mbytes_per_file: default_max_mbytes_per_file(),
            max_file_count: default_max_file_count(),
        }
    }
}

fn default_log_level() -> String {
    "inf".into()
}

fn default_loggers() -> Vec<String> {
    vec!["console".to_string(), "file".to_string()]
}

fn default_max_mbytes_per_file() -> u64 {
    10
}

fn default_max_file_count() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("sa.cfg");
        let mut f = std::fs::File::create(&cfg_path).unwrap();
        write!(
            f,
            r#"{{"hp": {{"host_address": "10.0.0.5"}}, "system": {{"data_dir": "data"}}}}"#
        )
        .unwrap();

        let config = Configuration::load(&cfg_path).unwrap();
        assert_eq!(config.hp.host_address, "10.0.0.5");
        assert_eq!(config.hp.init_peer_port, 22861);
        assert_eq!(config.system.max_instance_count, 8);
        assert!(config.paths.data_dir.ends_with("data"));
        assert!(config.paths.data_dir.is_dir());
    }
}
