//! Main entry point for a raftable database node.
//!
//! Binds cluster messaging, activates the database and runs until Ctrl+C or
//! SIGTERM, then deactivates in order.

use std::sync::Arc;

use clap::Parser;
use raftable_cluster::heartbeat::start_heartbeat;
use raftable_cluster::tcp::{TcpCommunicator, TcpConfig};
use raftable_cluster::{ClusterCommunicator, Membership};
use raftable_consistency::{DatabaseManager, Tablet};
use raftable_server::cli::Cli;
use raftable_server::logging::init_logging;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logging_guard = init_logging(&cli.logging_config())?;

    let config = cli.raft_config()?;
    let tablet = Tablet::load(config.member_file_path(), &config.tablet_name).await?;
    let local = cli.local_node(&tablet)?;
    info!(
        node = %local,
        data_dir = %config.data_dir.display(),
        config_dir = %config.config_dir.display(),
        "Starting raftable node"
    );

    let membership = Arc::new(Membership::new(local));
    let communicator = TcpCommunicator::bind(membership.clone(), TcpConfig::default()).await?;

    let cancel = CancellationToken::new();
    let heartbeat = start_heartbeat(
        membership.clone(),
        communicator.clone() as Arc<dyn ClusterCommunicator>,
        cli.heartbeat_interval(),
        cancel.clone(),
    );

    let manager = DatabaseManager::activate_with_tablet(
        config,
        tablet,
        communicator.clone() as Arc<dyn ClusterCommunicator>,
        membership,
    )
    .await?;
    info!(
        member = manager.is_member(),
        leader = ?manager.leader(),
        "raftable node ready"
    );

    shutdown_signal().await;

    manager.deactivate().await;
    cancel.cancel();
    let _ = heartbeat.await;
    communicator.shutdown();
    info!("raftable node stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
