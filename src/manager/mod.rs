//! Instance lifecycle orchestration
//!
//! `InstanceManager` is the single place that sequences the other
//! components into the lifecycle transitions of §3/§4.G: `create` through
//! `destroy`, with rollback on any failed step so a half-provisioned
//! instance never lingers. It holds no in-memory cache of instance rows —
//! every call re-reads the authoritative record from the `Store` — only
//! the `PortAllocator`'s transient counter/vacant-stack state and a mutex
//! serializing transitions live here.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Configuration;
use crate::container::{ContainerDriver, ContainerSpec, ObservedState};
use crate::contract::{ContractMaterializer, MaterializeRequest};
use crate::error::{AgentError, Result};
use crate::fsservice::{self, FsServiceDriver};
use crate::message::InstanceSummary;
use crate::ports::PortAllocator;
use crate::provision::UserProvisioner;
use crate::store::{InstanceRecord, InstanceStatus, Store};

/// Fixed bootstrap binary every contract container runs, matching
/// `original_source/src/hp_manager.cpp`'s `create_contract`, which never
/// takes a binary path from the client request.
const CONTRACT_BIN_PATH: &str = "bootstrap_contract";

/// Cap on container-name collisions retried before `create` gives up,
/// matching `original_source/src/hp_manager.cpp`'s `MAX_UNIQUE_NAME_RETRIES`.
const MAX_UNIQUE_NAME_RETRIES: u32 = 10;

/// Per-instance resource budget, computed once at startup as
/// `system.* / system.max_instance_count` and handed to every provisioning
/// call, grounded on `original_source/src/hp_manager.cpp`'s startup
/// resource-division block.
#[derive(Debug, Clone, Copy)]
pub struct InstanceResources {
    pub cpu_us: u64,
    pub mem_kbytes: u64,
    pub storage_kbytes: u64,
}

impl InstanceResources {
    pub fn from_config(config: &Configuration) -> Self {
        let divisor = config.system.max_instance_count.max(1) as u64;
        Self {
            cpu_us: config.system.max_cpu_us / divisor,
            mem_kbytes: config.system.max_mem_kbytes / divisor,
            storage_kbytes: config.system.max_storage_kbytes / divisor,
        }
    }
}

pub struct CreateRequest {
    pub owner_pubkey: String,
    pub contract_id: String,
    pub image: String,
}

pub struct InstanceManager {
    store: Arc<Store>,
    ports: Mutex<PortAllocator>,
    provisioner: UserProvisioner,
    materializer: ContractMaterializer,
    containers: Arc<ContainerDriver>,
    fs: FsServiceDriver,
    config: Arc<Configuration>,
    transition_lock: Mutex<()>,
    resources: InstanceResources,
}

impl InstanceManager {
    pub async fn new(
        store: Arc<Store>,
        provisioner: UserProvisioner,
        materializer: ContractMaterializer,
        containers: Arc<ContainerDriver>,
        fs: FsServiceDriver,
        config: Arc<Configuration>,
    ) -> Result<Self> {
        let ports = PortAllocator::load(&store, config.hp.init_peer_port, config.hp.init_user_port)
            .await?;
        let resources = InstanceResources::from_config(&config);

        Ok(Self {
            store,
            ports: Mutex::new(ports),
            provisioner,
            materializer,
            containers,
            fs,
            config,
            transition_lock: Mutex::new(()),
            resources,
        })
    }

    pub fn resources(&self) -> InstanceResources {
        self.resources
    }

    pub fn containers(&self) -> &ContainerDriver {
        &self.containers
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Provision a brand-new contract instance: a Linux user, a port pair,
    /// a materialized contract directory with fresh keys, and a created
    /// (not yet started) container. Any failure rolls back everything
    /// allocated so far. Validates `contract_id` (must be a UUIDv4) and
    /// `image` (must be a configured image reference) before any side
    /// effect, per `spec.md` scenario 6.
    pub async fn create(&self, req: CreateRequest) -> Result<InstanceRecord> {
        let _lock = self.transition_lock.lock().await;

        if Uuid::parse_str(&req.contract_id).is_err() {
            return Err(AgentError::BadRequest(format!(
                "contract_id {:?} is not a valid uuid",
                req.contract_id
            )));
        }

        if !self.config.docker.images.values().any(|img| img == &req.image) {
            return Err(AgentError::BadRequest(format!(
                "image {:?} is not a configured image",
                req.image
            )));
        }

        let allocated = self.store.allocated_count().await?;
        if allocated >= self.config.system.max_instance_count {
            return Err(AgentError::PreconditionFailed(format!(
                "Max instance count reached ({allocated}/{})",
                self.config.system.max_instance_count
            )));
        }

        let container_name = self.unique_container_name().await?;

        let pair = {
            let mut ports = self.ports.lock().await;
            ports.allocate(&self.store).await?
        };

        // Rollback ladder: each step registers what must be undone if a
        // later step fails. Defused once the instance is durably recorded.
        let user = match self.provisioner.install(self.resources, &container_name).await {
            Ok(user) => user,
            Err(e) => {
                let mut ports = self.ports.lock().await;
                ports.release(pair);
                return Err(e);
            }
        };

        let contract_dir = format!("/home/{}/contract_{}", user.username, user.username);
        let materialize_result = self
            .materializer
            .materialize(MaterializeRequest {
                owner_pubkey: &req.owner_pubkey,
                contract_id: &req.contract_id,
                username: &user.username,
                user_id: user.user_id,
                bin_path: CONTRACT_BIN_PATH,
                peer_port: pair.peer_port,
                user_port: pair.user_port,
                destination: std::path::Path::new(&contract_dir),
            })
            .await;

        let identity = match materialize_result {
            Ok(identity) => identity,
            Err(e) => {
                self.undo_user_and_ports(&user.username, pair).await;
                return Err(e);
            }
        };

        let create_result = self
            .containers
            .create(ContainerSpec {
                container_name: &container_name,
                image: &req.image,
                user_id: user.user_id,
                contract_dir: &contract_dir,
                peer_port: pair.peer_port,
                user_port: pair.user_port,
            })
            .await;

        if let Err(e) = create_result {
            self.undo_user_and_ports(&user.username, pair).await;
            return Err(e);
        }

        let record = InstanceRecord {
            container_name: container_name.clone(),
            owner_pubkey: req.owner_pubkey.clone(),
            contract_id: req.contract_id.clone(),
            pubkey: identity.public_key_hex,
            ip: self.config.hp.host_address.clone(),
            image: req.image.clone(),
            username: user.username.clone(),
            user_id: user.user_id,
            peer_port: pair.peer_port,
            user_port: pair.user_port,
            status: InstanceStatus::Created,
            current_status: None,
            created_at: now_secs(),
        };

        if let Err(e) = self.store.insert_instance(&record).await {
            warn!(
                "store insert failed for {}, rolling back container and user",
                container_name
            );
            if let Err(remove_err) = self.containers.remove(user.user_id, &container_name).await {
                warn!("rollback: failed to remove container {}: {}", container_name, remove_err);
            }
            self.undo_user_and_ports(&user.username, pair).await;
            return Err(e);
        }

        info!(
            "created instance {} for owner {} on ports {}/{}",
            container_name, req.owner_pubkey, pair.peer_port, pair.user_port
        );

        Ok(record)
    }

    /// Generate a fresh UUIDv4 container name, retrying on collision against
    /// the Store up to `MAX_UNIQUE_NAME_RETRIES` times, matching the
    /// original's `create_new_instance` retry loop.
    async fn unique_container_name(&self) -> Result<String> {
        for _ in 0..MAX_UNIQUE_NAME_RETRIES {
            let candidate = Uuid::new_v4().to_string();
            if self.store.get_instance(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(AgentError::PreconditionFailed(
            "failed to generate a unique container name after 10 retries".into(),
        ))
    }

    async fn undo_user_and_ports(&self, username: &str, pair: crate::ports::PortPair) {
        if let Err(e) = self.provisioner.uninstall(username).await {
            warn!("rollback: failed to uninstall user {}: {}", username, e);
        }
        let mut ports = self.ports.lock().await;
        ports.release(pair);
    }

    /// Apply the `initiate` config patch and boot a `created` instance for
    /// the first time.
    pub async fn initiate(&self, container_name: &str, config_patch: serde_json::Value) -> Result<()> {
        let _lock = self.transition_lock.lock().await;
        let record = self.require_instance(container_name).await?;

        if record.status != InstanceStatus::Created {
            return Err(AgentError::PreconditionFailed(format!(
                "instance {} is {:?}, expected created",
                container_name, record.status
            )));
        }

        validate_config_patch(&config_patch)?;
        self.apply_config_patch(&record.username, &config_patch)?;
        self.patch_fs_serviceconf(&record.username)?;

        self.fs.start_all(&record.username, record.user_id).await?;
        if let Err(e) = self.containers.start(record.user_id, container_name).await {
            self.fs.stop_all(&record.username, record.user_id).await.ok();
            return Err(e);
        }

        self.store
            .update_status(container_name, InstanceStatus::Running)
            .await?;
        info!("initiated instance {}", container_name);
        Ok(())
    }

    pub async fn start(&self, container_name: &str) -> Result<()> {
        let _lock = self.transition_lock.lock().await;
        let record = self.require_instance(container_name).await?;

        if !matches!(record.status, InstanceStatus::Stopped | InstanceStatus::Exited) {
            return Err(AgentError::PreconditionFailed(format!(
                "instance {} is {:?}, not stopped, cannot start",
                container_name, record.status
            )));
        }

        self.patch_fs_serviceconf(&record.username)?;
        self.fs.start_all(&record.username, record.user_id).await?;
        self.containers.start(record.user_id, container_name).await?;
        self.store
            .update_status(container_name, InstanceStatus::Running)
            .await?;
        self.store.clear_current_status(container_name).await?;
        info!("started instance {}", container_name);
        Ok(())
    }

    /// Reads the instance's current `hp.cfg` history mode and hpfs log
    /// level and rewrites `~<username>/.serviceconf` accordingly, per
    /// `spec.md` §4.F: `HPFS_MERGE = true` iff history mode is not `full`,
    /// `HPFS_TRACE` mirrors the hpfs log level.
    fn patch_fs_serviceconf(&self, username: &str) -> Result<()> {
        let hp_cfg_path = format!("/home/{username}/contract_{username}/cfg/hp.cfg");
        let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&hp_cfg_path)?)
            .map_err(|e| AgentError::PersistenceFailure(format!("corrupt hp.cfg for {username}: {e}")))?;

        let history_mode = doc["node"]["history"].as_str().unwrap_or("full");
        let hpfs_trace = doc["hpfs"]["log"]["log_level"].as_str().unwrap_or("err");

        let mut updates = BTreeMap::new();
        updates.insert("HPFS_MERGE".to_string(), (history_mode != "full").to_string());
        updates.insert("HPFS_TRACE".to_string(), hpfs_trace.to_string());

        let serviceconf_path = std::path::PathBuf::from(format!("/home/{username}/.serviceconf"));
        fsservice::patch_env_file(&serviceconf_path, &updates)
    }

    pub async fn stop(&self, container_name: &str) -> Result<()> {
        let _lock = self.transition_lock.lock().await;
        let record = self.require_instance(container_name).await?;

        if record.status != InstanceStatus::Running {
            return Err(AgentError::PreconditionFailed(format!(
                "instance {} is {:?}, not running, cannot stop",
                container_name, record.status
            )));
        }

        self.containers.stop(record.user_id, container_name).await?;
        self.fs.stop_all(&record.username, record.user_id).await?;
        self.store
            .update_status(container_name, InstanceStatus::Stopped)
            .await?;
        info!("stopped instance {}", container_name);
        Ok(())
    }

    pub async fn destroy(&self, container_name: &str) -> Result<()> {
        let _lock = self.transition_lock.lock().await;
        let record = self.require_instance(container_name).await?;

        if record.status == InstanceStatus::Destroyed {
            return Err(AgentError::PreconditionFailed(format!(
                "instance {container_name} is already destroyed"
            )));
        }

        if record.status == InstanceStatus::Running {
            self.containers.stop(record.user_id, container_name).await.ok();
            self.fs.stop_all(&record.username, record.user_id).await.ok();
        }

        self.containers.kill(record.user_id, container_name).await.ok();
        self.containers.remove(record.user_id, container_name).await?;

        let uninstall_result = self.provisioner.uninstall(&record.username).await;

        self.store
            .update_status(container_name, InstanceStatus::Destroyed)
            .await?;

        {
            let mut ports = self.ports.lock().await;
            ports.release(crate::ports::PortPair {
                peer_port: record.peer_port,
                user_port: record.user_port,
            });
        }

        if let Err(e) = uninstall_result {
            warn!("failed to uninstall user {} during destroy: {}", record.username, e);
            return Err(e);
        }

        info!("destroyed instance {}", container_name);
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<InstanceSummary>> {
        let records = self.store.list_instances().await?;
        Ok(records.into_iter().map(InstanceSummary::from).collect())
    }

    pub async fn inspect(&self, container_name: &str) -> Result<InstanceSummary> {
        let record = self.require_instance(container_name).await?;
        Ok(record.into())
    }

    /// Used by the Supervisor to walk every instance the Store reports as
    /// `running`, without going through the transition lock (read-only).
    pub async fn running_instances(&self) -> Result<Vec<InstanceRecord>> {
        self.store.running_instances().await
    }

    pub async fn observe(&self, record: &InstanceRecord) -> Result<ObservedState> {
        self.containers
            .inspect(record.user_id, &record.container_name)
            .await
    }

    pub async fn restart_drifted(&self, record: &InstanceRecord) -> Result<()> {
        self.fs.start_all(&record.username, record.user_id).await?;
        self.containers
            .start(record.user_id, &record.container_name)
            .await
    }

    /// Resolved per spec §9's open question: `exited` is never auto-retried
    /// by the Supervisor. It only clears on an explicit user `start`.
    pub async fn mark_exited(&self, container_name: &str) -> Result<()> {
        self.store
            .update_status(container_name, InstanceStatus::Exited)
            .await
    }

    /// Deep-merge the `initiate` request's config patch into the
    /// instance's already-materialized `hp.cfg`.
    fn apply_config_patch(&self, username: &str, patch: &serde_json::Value) -> Result<()> {
        let hp_cfg_path = format!("/home/{username}/contract_{username}/cfg/hp.cfg");
        let existing = std::fs::read_to_string(&hp_cfg_path)?;
        let mut doc: serde_json::Value = serde_json::from_str(&existing).map_err(|e| {
            AgentError::PersistenceFailure(format!("corrupt hp.cfg for {username}: {e}"))
        })?;

        crate::message::merge_config_patch(&mut doc, patch);

        let rewritten = serde_json::to_string_pretty(&doc)
            .map_err(|e| AgentError::ExternalFailure(format!("failed to serialize hp.cfg: {e}")))?;
        std::fs::write(&hp_cfg_path, rewritten)?;
        Ok(())
    }

    async fn require_instance(&self, container_name: &str) -> Result<InstanceRecord> {
        self.store
            .get_instance(container_name)
            .await?
            .ok_or_else(|| AgentError::BadRequest(format!("no such instance: {container_name}")))
    }
}

/// Validates the `initiate` request's partial config patch against §6's
/// enum constraints before any of it is merged into `hp.cfg`. Unknown/absent
/// fields are always fine; only present-but-invalid values are rejected.
fn validate_config_patch(patch: &serde_json::Value) -> Result<()> {
    if let Some(history) = patch["node"]["history"].as_str() {
        if history != "full" && history != "custom" {
            return Err(AgentError::BadRequest(format!(
                "node.history must be \"full\" or \"custom\", got {history:?}"
            )));
        }
        if history == "custom" {
            if let Some(0) = patch["node"]["history_config"]["max_primary_shards"].as_u64() {
                return Err(AgentError::BadRequest(
                    "node.history_config.max_primary_shards must be nonzero for history=\"custom\""
                        .into(),
                ));
            }
        }
    }

    if let Some(role) = patch["node"]["role"].as_str() {
        if role != "observer" && role != "validator" {
            return Err(AgentError::BadRequest(format!(
                "node.role must be \"observer\" or \"validator\", got {role:?}"
            )));
        }
    }

    for log_level in [
        &patch["contract"]["log"]["log_level"],
        &patch["hpfs"]["log"]["log_level"],
        &patch["log"]["log_level"],
    ] {
        if let Some(level) = log_level.as_str() {
            if !["dbg", "inf", "wrn", "err"].contains(&level) {
                return Err(AgentError::BadRequest(format!(
                    "log level must be one of dbg|inf|wrn|err, got {level:?}"
                )));
            }
        }
    }

    Ok(())
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_divide_evenly_by_instance_cap() {
        let mut config = test_config();
        config.system.max_cpu_us = 800_000;
        config.system.max_mem_kbytes = 8_000_000;
        config.system.max_instance_count = 4;

        let resources = InstanceResources::from_config(&config);
        assert_eq!(resources.cpu_us, 200_000);
        assert_eq!(resources.mem_kbytes, 2_000_000);
    }

    #[test]
    fn resources_never_divide_by_zero_instance_cap() {
        let mut config = test_config();
        config.system.max_instance_count = 0;
        config.system.max_cpu_us = 100;

        let resources = InstanceResources::from_config(&config);
        assert_eq!(resources.cpu_us, 100);
    }

    fn test_config() -> Configuration {
        serde_json::from_value(serde_json::json!({
            "hp": {"host_address": "0.0.0.0"},
            "system": {"data_dir": "."}
        }))
        .unwrap()
    }

    #[test]
    fn validate_config_patch_accepts_identity_patch() {
        validate_config_patch(&serde_json::json!({})).unwrap();
    }

    #[test]
    fn validate_config_patch_rejects_bad_history_enum() {
        let patch = serde_json::json!({"node": {"history": "partial"}});
        assert!(validate_config_patch(&patch).is_err());
    }

    #[test]
    fn validate_config_patch_rejects_zero_shards_with_custom_history() {
        let patch = serde_json::json!({
            "node": {"history": "custom", "history_config": {"max_primary_shards": 0}}
        });
        assert!(validate_config_patch(&patch).is_err());
    }

    #[test]
    fn validate_config_patch_accepts_full_history_with_any_shards() {
        let patch = serde_json::json!({"node": {"history": "full"}});
        validate_config_patch(&patch).unwrap();
    }

    #[test]
    fn validate_config_patch_rejects_bad_log_level() {
        let patch = serde_json::json!({"log": {"log_level": "verbose"}});
        assert!(validate_config_patch(&patch).is_err());
    }
}
