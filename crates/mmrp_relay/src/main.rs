//! mmrp-relay — runs one mesh node as a daemon.
//!
//! Usage: `mmrp-relay [CONFIG]`, where `CONFIG` defaults to
//! `~/.mmrp/relay.json` (created with defaults on first run).

mod config;
mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use mmrp_network::discovery::{self, Announcement, DiscoveryConfig, DiscoveryService};
use mmrp_network::{MeshNode, PeerMeta};

use crate::config::RelayDaemonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => RelayDaemonConfig::default_path()?,
    };
    let mut config = RelayDaemonConfig::load_from_path(&config_path)?;
    let _log_guard = logging::init_logging_to_dir(&config.logs_dir()?, &config.log_filter)?;
    info!(
        "mmrp-relay {} starting with {}",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    config.resolve_advertise_host().await?;

    let node = MeshNode::bind(&config.node)
        .await
        .context("Failed to start mesh node")?;
    let started = PeerMeta::now(node.cluster_id());
    if let Some(endpoint) = node.endpoint() {
        info!("Relay {} accepting links at {endpoint}", node.identity());
    }

    for relay in &config.static_relays {
        let node = node.clone();
        let relay = relay.clone();
        tokio::spawn(async move {
            let meta = PeerMeta::now(relay.cluster_id.as_str());
            if let Err(e) = node.relay_up(&relay.uri, meta).await {
                warn!("Static relay {} at {} unreachable: {e}", relay.cluster_id, relay.uri);
            }
        });
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    if config.discovery.enabled {
        let (events_tx, events_rx) = mpsc::channel(64);
        let discovery_config = DiscoveryConfig {
            port: config.discovery.port,
            interval: config.discovery.interval(),
            expiry: config.discovery.expiry(),
            announcement: node.endpoint().map(|uri| Announcement {
                cluster_id: node.cluster_id().to_string(),
                uri,
                timestamp: started.timestamp,
            }),
        };
        match DiscoveryService::start(discovery_config, events_tx, shutdown_tx.subscribe()).await {
            Ok(()) => {
                tokio::spawn(discovery::drive(node.clone(), events_rx));
            }
            Err(e) => warn!("Discovery start failed (non-fatal): {e}"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    let _ = shutdown_tx.send(());
    node.close();
    Ok(())
}
