//! Container lifecycle driver
//!
//! Each contract instance's container lives behind its own user's rootless
//! Docker daemon, so unlike a single shared `bollard::Docker` client this
//! driver keeps a small per-user client cache keyed by uid, each bound to
//! `/run/user/<uid>/docker.sock`.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};

/// Parameters needed to create a contract instance's container.
pub struct ContainerSpec<'a> {
    pub container_name: &'a str,
    pub image: &'a str,
    pub user_id: u32,
    pub contract_dir: &'a str,
    pub peer_port: u16,
    pub user_port: u16,
}

/// Observed container state, collapsed to what the Supervisor needs to
/// decide whether a restart is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    Running,
    Stopped,
    Missing,
}

pub struct ContainerDriver {
    clients: Mutex<HashMap<u32, Arc<Docker>>>,
}

impl ContainerDriver {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, uid: u32) -> Result<Arc<Docker>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&uid) {
            return Ok(client.clone());
        }

        let socket = format!("/run/user/{uid}/docker.sock");
        let client = Docker::connect_with_unix(&socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| {
                AgentError::ExternalFailure(format!("failed to connect to docker at {socket}: {e}"))
            })?;
        let client = Arc::new(client);
        clients.insert(uid, client.clone());
        Ok(client)
    }

    pub async fn create(&self, spec: ContainerSpec<'_>) -> Result<()> {
        let docker = self.client_for(spec.user_id).await?;

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in [spec.peer_port, spec.user_port] {
            port_bindings.insert(
                format!("{port}/tcp"),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(vec![Mount {
                target: Some("/contract".to_string()),
                source: Some(spec.contract_dir.to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            }]),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                ..Default::default()
            }),
            stop_signal: Some("SIGINT".to_string()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.to_string()),
            host_config: Some(host_config),
            working_dir: Some("/contract".to_string()),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.container_name,
            platform: None,
        };

        docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                if let bollard::errors::Error::DockerResponseServerError { status_code: 409, .. } = e {
                    AgentError::PreconditionFailed(format!(
                        "container {} already exists",
                        spec.container_name
                    ))
                } else {
                    AgentError::from(e)
                }
            })?;

        info!("created container {}", spec.container_name);
        Ok(())
    }

    pub async fn start(&self, uid: u32, container_name: &str) -> Result<()> {
        let docker = self.client_for(uid).await?;
        docker
            .start_container(container_name, None::<StartContainerOptions<String>>)
            .await?;
        info!("started container {}", container_name);
        Ok(())
    }

    pub async fn stop(&self, uid: u32, container_name: &str) -> Result<()> {
        let docker = self.client_for(uid).await?;
        match docker
            .stop_container(container_name, Some(StopContainerOptions { t: 30 }))
            .await
        {
            Ok(_) => {
                info!("stopped container {}", container_name);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                debug!("container {} already stopped", container_name);
                Ok(())
            }
            Err(e) => Err(AgentError::from(e)),
        }
    }

    pub async fn kill(&self, uid: u32, container_name: &str) -> Result<()> {
        let docker = self.client_for(uid).await?;
        match docker
            .kill_container(container_name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => Ok(()),
            Err(e) => Err(AgentError::from(e)),
        }
    }

    pub async fn remove(&self, uid: u32, container_name: &str) -> Result<()> {
        let docker = self.client_for(uid).await?;
        match docker
            .remove_container(
                container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: false,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(_) => {
                info!("removed container {}", container_name);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                debug!("container {} already absent", container_name);
                Ok(())
            }
            Err(e) => Err(AgentError::from(e)),
        }
    }

    /// Used by the Supervisor to decide whether a `running` instance has
    /// drifted out from under it.
    pub async fn inspect(&self, uid: u32, container_name: &str) -> Result<ObservedState> {
        let docker = self.client_for(uid).await?;
        match docker
            .inspect_container(container_name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let running = details
                    .state
                    .as_ref()
                    .and_then(|s| s.status)
                    .map(|s| s == ContainerStateStatusEnum::RUNNING)
                    .unwrap_or(false);
                Ok(if running {
                    ObservedState::Running
                } else {
                    ObservedState::Stopped
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                warn!("container {} missing on inspect", container_name);
                Ok(ObservedState::Missing)
            }
            Err(e) => Err(AgentError::from(e)),
        }
    }
}

impl Default for ContainerDriver {
    fn default() -> Self {
        Self::new()
    }
}
