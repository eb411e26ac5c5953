//! tetherd: tether node daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use tether_core::config::TetherConfig;
use tether_services::{PeerDirectory, ServiceGateway};

mod discovery;

use discovery::Beacon;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TetherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });
    if let Some(interface) = std::env::args().nth(1) {
        config.discovery.interface = interface;
    }

    let node_id = config.identity.node_id();
    tracing::info!(
        node = %node_id,
        endpoints = ?config.network.endpoints,
        "tetherd starting"
    );
    if config.network.endpoints.is_empty() {
        tracing::warn!("no endpoints configured, peers will see this node but cannot reach it");
    }

    // Shared state
    let gateway = ServiceGateway::new();
    let directory = Arc::new(PeerDirectory::new(gateway.clone()));

    let beacon = Beacon::bind(
        &config.discovery,
        node_id,
        config.network.endpoints.clone(),
        directory.clone(),
    )
    .context("failed to start discovery")?;
    let beacon = beacon.start();

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let snapshot_printer = {
        let gateway = gateway.clone();
        let directory = directory.clone();
        let announcing = beacon.peers().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                tracing::info!(
                    peers = directory.len(),
                    announcing = announcing.len(),
                    services = gateway.len(),
                    "discovery snapshot"
                );
                for name in gateway.services() {
                    let providers: Vec<String> =
                        gateway.providers(&name).iter().map(|p| p.short()).collect();
                    tracing::info!(service = %name, ?providers, "  service");
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = snapshot_printer   => tracing::error!("snapshot printer exited: {:?}", r),
    }

    beacon.shutdown().await;
    Ok(())
}
