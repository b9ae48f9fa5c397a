//! Main daemon command - starts the agent

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sashi_agentd::config::Configuration;
use sashi_agentd::container::ContainerDriver;
use sashi_agentd::contract::ContractMaterializer;
use sashi_agentd::fsservice::FsServiceDriver;
use sashi_agentd::local::LocalControlServer;
use sashi_agentd::manager::InstanceManager;
use sashi_agentd::provision::UserProvisioner;
use sashi_agentd::remote::RemoteSession;
use sashi_agentd::store::Store;
use sashi_agentd::supervisor::Supervisor;

/// Run the agent.
pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Configuration::load(config_path)?;
    let config = Arc::new(config);

    info!("Configuration loaded successfully");
    info!("  HP host address: {}", config.hp.host_address);
    info!("  Data directory: {}", config.paths.data_dir.display());
    info!(
        "  Max instance count: {}",
        config.system.max_instance_count
    );

    let store = Arc::new(Store::open(&config.paths.db_path)?);
    let provisioner = UserProvisioner::new(
        config.paths.user_install_sh.clone(),
        config.paths.user_uninstall_sh.clone(),
    );
    let materializer = ContractMaterializer::new(config.paths.contract_template_path.clone());
    let containers = Arc::new(ContainerDriver::new());
    let fs = FsServiceDriver::new();

    let manager = Arc::new(
        InstanceManager::new(
            store.clone(),
            provisioner,
            materializer,
            containers,
            fs,
            config.clone(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize instance manager: {}", e))?,
    );

    let shutdown = CancellationToken::new();

    let supervisor = Supervisor::new(manager.clone());
    let supervisor_shutdown = shutdown.clone();
    tokio::spawn(async move {
        supervisor.run(supervisor_shutdown).await;
    });
    info!("Supervisor started");

    let local_server = Arc::new(LocalControlServer::new(
        config.paths.local_socket_path.clone(),
        manager.clone(),
    ));
    let local_shutdown = shutdown.clone();
    let local_handle = local_server.spawn(local_shutdown);
    info!(
        "Local control socket listening at {:?}",
        config.paths.local_socket_path
    );

    let remote_session = match std::env::var("SASHI_CONTROLLER_URL") {
        Ok(controller_url) if !controller_url.is_empty() => {
            match RemoteSession::start(
                config.paths.hpws_exe_path.clone(),
                controller_url,
                manager.clone(),
                shutdown.clone(),
            ) {
                Ok(session) => {
                    info!("Remote control session started");
                    Some(session)
                }
                Err(e) => {
                    warn!("Failed to start remote control session: {}", e);
                    None
                }
            }
        }
        _ => {
            info!("No controller URL configured, remote session disabled");
            None
        }
    };

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        warn!("Received shutdown signal, stopping agent...");
        shutdown_signal.cancel();
    });

    shutdown.cancelled().await;

    if let Some(session) = &remote_session {
        session.request_close();
    }

    if let Err(e) = local_handle.join() {
        error!("local control server thread panicked: {:?}", e);
    }

    info!("Agent stopped");
    Ok(())
}
