//! Static IP Controller
//!
//! Assigns static network configuration to Cluster API vSphere resources:
//! - VSphereMachine: one IPClaim per static network device, written back as
//!   `ipAddrs`, gateway, nameservers and search domains
//! - VSphereCluster: one IPClaim for the control-plane endpoint
//!
//! Addresses come from IPPools and are returned to them when the owner is
//! deleted. Devices marked DHCP are never touched.

mod address_pool;
mod backoff;
mod claims;
mod config;
mod context;
mod controller;
mod dhcp;
mod error;
mod metrics;
mod queue;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::context::{Context, Settings};
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use anyhow::Context as _;
use clap::Parser;
use crds::{IPClaim, IPPool, VSphereCluster, VSphereMachine};
use kube::Client;
use resource_store::KubeStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kube=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install the rustls crypto provider"))?;

    let config = Config::parse();
    config.validate()?;

    info!("Starting static IP controller");
    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace().unwrap_or("all namespaces"));
    info!("  Sync period: {:?}", config.sync_period);
    info!("  Max concurrency: {}", config.max_concurrency);
    info!("  Metrics address: {}", config.metrics_addr);
    if config.enable_leader_election {
        warn!("Leader election is not built in; run a single replica of this controller");
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let client = Client::try_default()
        .await
        .map_err(ControllerError::from)
        .context("cannot connect to the Kubernetes API")?;

    let metrics = Metrics::new().map_err(ControllerError::from)?;
    let listener = TcpListener::bind(config.metrics_addr)
        .await
        .map_err(ControllerError::from)
        .with_context(|| format!("cannot bind metrics address {}", config.metrics_addr))?;
    let metrics_server = tokio::spawn(metrics::serve(listener, metrics.clone(), shutdown.clone()));

    let ctx = Arc::new(Context {
        pools: Arc::new(KubeStore::<IPPool>::new(client.clone())),
        claims: Arc::new(KubeStore::<IPClaim>::new(client.clone())),
        machines: Arc::new(KubeStore::<VSphereMachine>::new(client.clone())),
        clusters: Arc::new(KubeStore::<VSphereCluster>::new(client)),
        settings: Settings {
            store_timeout: config.store_timeout,
            sync_period: config.sync_period,
            backoff_min: config.backoff_min,
            backoff_max: config.backoff_max,
        },
        metrics,
    });

    let controller = Controller::start(
        ctx,
        config.watch_namespace().map(str::to_string),
        config.max_concurrency,
        shutdown.clone(),
    );
    let result = controller.run().await;

    shutdown.cancel();
    match metrics_server.await {
        Ok(Err(e)) => warn!("Metrics endpoint error during shutdown: {}", e),
        Err(e) => warn!("Metrics endpoint task failed: {}", e),
        Ok(Ok(())) => {}
    }

    result?;
    info!("Shutdown complete");
    Ok(())
}

/// Cancels `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<(), ControllerError> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
    Ok(())
}
