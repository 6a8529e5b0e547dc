//! Arrakis Shard Router - process entry point
//!
//! Loads the cluster layout, connects every shard, binds the declared
//! models and serves health/ready/metrics endpoints until shutdown.
//! An empty or invalid topology stops the process before it serves.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use arrakis_shard_router::config::RouterConfig;
use arrakis_shard_router::health::{self, AppState};
use arrakis_shard_router::metrics::RouterMetrics;
use arrakis_shard_router::{MemoryConnector, RouterSettings, ShardCluster};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let router_config = RouterConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_shard_router={}", router_config.log_level).parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        groups = router_config.groups.len(),
        models = router_config.models.len(),
        "Starting Arrakis Shard Router"
    );

    let metrics = match RouterMetrics::install() {
        Ok(metrics) => {
            info!("Prometheus metrics initialized");
            Some(metrics)
        }
        Err(e) => {
            warn!(error = %e, "Metrics disabled");
            None
        }
    };

    let registry = router_config.registry()?;

    // Only the process-local driver ships with the router; real drivers
    // plug in through the Connector trait.
    let cluster = ShardCluster::connect(
        &router_config.groups,
        registry,
        RouterSettings::from(&router_config),
        &MemoryConnector,
    )
    .await?;
    let cluster = Arc::new(cluster);

    info!(models = ?cluster.model_names(), "Shard cluster bound");

    let app_state = AppState {
        cluster: Arc::clone(&cluster),
        metrics,
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], router_config.http_port).into();

    info!(port = router_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down shard router...");
    cluster.close().await;
    info!("Shard router shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
