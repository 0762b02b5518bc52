//! Arrakis Socket Pool - real-time connection pool service
//!
//! This service:
//! - Accepts WebSocket clients and registers them in a sharded pool
//! - Batches outbound messages and supervises reconnects
//! - Forwards lifecycle, reconnect and metrics events to NATS JetStream
//! - Exposes health/ready endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use arrakis_socket_pool::health::{self, AppState};
use arrakis_socket_pool::metrics::PrometheusExporter;
use arrakis_socket_pool::nats::{run_forwarder, EventPublisher};
use arrakis_socket_pool::{ws, ConnectionPool, HostConfig, PoolConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let host_config = HostConfig::from_env()?;
    let pool_config = PoolConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(
                    format!("arrakis_socket_pool={}", host_config.log_level).parse()?,
                )
                .add_directive("tungstenite=warn".parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pool_id = host_config.pool_id,
        shards = pool_config.shards,
        max_per_shard = pool_config.max_connections_per_shard,
        "Starting Arrakis Socket Pool"
    );

    // Initialize metrics
    let exporter = PrometheusExporter::install()?;
    info!("Prometheus metrics initialized");

    // Connect to NATS if configured
    let nats = if let Some(ref url) = host_config.nats_url {
        match EventPublisher::connect(url).await {
            Ok(publisher) => {
                info!(url, "Connected to NATS");
                if let Err(e) = publisher.ensure_streams().await {
                    warn!(error = %e, "Could not configure POOL stream");
                }
                exporter.set_nats_connected(true);
                Some(publisher)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                exporter.set_nats_connected(false);
                None
            }
        }
    } else {
        info!("No NATS_URL configured - running in local mode");
        None
    };

    // Create the pool and start its timers
    let pool = ConnectionPool::new(pool_config)?;
    let timers = pool.start();

    let forwarder = nats.clone().map(|publisher| {
        tokio::spawn(run_forwarder(
            publisher,
            host_config.pool_id,
            pool.subscribe(),
        ))
    });

    // WebSocket listener
    let ws_addr: SocketAddr = ([0, 0, 0, 0], host_config.ws_port).into();
    let ws_listener = TcpListener::bind(ws_addr).await?;
    info!(port = host_config.ws_port, "Accepting WebSocket clients");
    let ws_server = tokio::spawn(ws::serve(ws_listener, pool.clone()));

    // Start health server
    let app_state = AppState {
        pool: pool.clone(),
        pool_id: host_config.pool_id,
        nats: nats.clone(),
        exporter,
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], host_config.http_port).into();

    info!(port = host_config.http_port, "Starting HTTP server");

    let http_server = axum::serve(TcpListener::bind(addr).await?, health_router);

    // Run until the HTTP server fails or a signal arrives
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

    // Graceful shutdown
    info!("Shutting down socket pool...");

    pool.shutdown();
    for timer in timers {
        let _ = timer.await;
    }
    let _ = ws_server.await;

    if let Some(forwarder) = forwarder {
        let _ = forwarder.await;
    }
    if let Some(ref nats) = nats {
        nats.close().await;
    }

    info!("Socket pool shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
