mod cli;

use clap::Parser;
use cli::Cli;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wardnet_common::ClusterConfig;
use wardnet_coordinator::Coordinator;
use wardnet_election::{Election, LeadershipSink};
use wardnet_mutex::DistributedMutex;
use wardnet_store::InMemoryStore;
use wardnet_transport::Transport;

/// Logs every accepted leader change; stands in for the out-of-scope
/// terminal UI the original program rendered on the same event.
struct TracingSink;
impl LeadershipSink for TracingSink {
    fn on_leader_change(&self, leader: wardnet_common::NodeId, term: u64) {
        info!(leader, term, "leadership changed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    info!(node_id = config.node_id, peers = config.cluster_directory.len(), "loaded configuration");

    let (tcp_port, udp_port) = ClusterConfig::reference_ports(config.node_id);
    let transport = Transport::new("0.0.0.0", tcp_port, udp_port);

    let election = Election::new(config.clone(), transport.clone(), Arc::new(TracingSink));
    election.register_handlers();

    let mutex = DistributedMutex::new(&config, transport.clone());
    mutex.register_handlers();

    transport.start().await?;
    info!(tcp_port, udp_port, "transport listening");

    election.start().await;

    let store = Arc::new(InMemoryStore::new());
    let _coordinator = Coordinator::new(election.clone(), mutex, store);

    info!("node running, waiting for shutdown signal");
    shutdown_signal().await;
    info!("shutdown signal received, stopping");
    election.stop();
    transport.stop();

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
}
