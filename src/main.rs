//! Arrakis Client - Discord gateway shard pool with a rate-limited REST client
//!
//! This process:
//! - Asks the REST API for the gateway URL and recommended shard count
//! - Runs one shard pool and hands every event to a dispatcher task
//! - Exposes health/ready endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

use arrakis_client::config::ClientConfig;
use arrakis_client::events::{self, EventHandler, GatewayEvent};
use arrakis_client::health::{self, AppState};
use arrakis_client::metrics::GatewayMetrics;
use arrakis_client::rest::{fetch_gateway_bot, RestExecutor};
use arrakis_client::shard::{ShardManager, WebSocketOpener};

/// Dispatcher that logs every event; downstream consumers replace it.
struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: GatewayEvent) {
        debug!(
            shard_id = event.shard_id,
            seq = event.sequence,
            event_type = %event.event_type,
            guild_id = ?event.guild_id,
            "Gateway event"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let config = ClientConfig::from_env()?;

    // Initialize tracing with configured log level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("arrakis_client={}", config.log_level).parse()?)
                .add_directive("tokio_tungstenite=info".parse()?)
                .add_directive("reqwest=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pool_id = config.pool_id,
        "Starting Arrakis client"
    );

    let metrics = Arc::new(GatewayMetrics::install()?);
    info!("Prometheus metrics initialized");

    let rest = Arc::new(RestExecutor::new(config.rest.clone(), Some(config.token.clone()))?);
    let gateway_bot = fetch_gateway_bot(&rest).await?;
    let limit = &gateway_bot.session_start_limit;
    info!(
        url = %gateway_bot.url,
        recommended_shards = gateway_bot.shards,
        session_starts_remaining = limit.remaining,
        max_concurrency = limit.max_concurrency,
        "Fetched gateway info"
    );
    if limit.remaining == 0 {
        warn!(
            reset_after_ms = limit.reset_after,
            "No session starts remaining, identifies will be rejected until reset"
        );
    }

    let total_shards = config.total_shards.unwrap_or(gateway_bot.shards.max(1));
    let gateway_url = config.gateway_url.clone().unwrap_or_else(|| gateway_bot.url.clone());

    let (sink, events_rx) = events::channel(config.event_buffer);
    let dispatcher = tokio::spawn(events::run_dispatcher(events_rx, LoggingHandler));

    let manager = Arc::new(ShardManager::new(
        config.session_settings(gateway_url),
        config.manager_settings(total_shards, limit.max_concurrency.max(1)),
        Arc::new(WebSocketOpener),
        sink,
    ));
    let shard_state = manager.state();
    info!(
        pool_id = config.pool_id,
        total_shards,
        shard_count = shard_state.shard_count(),
        "Shard manager created"
    );

    // Start health server
    let app_state = AppState {
        shard_state: shard_state.clone(),
        metrics: Some(Arc::clone(&metrics)),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();

    info!(port = config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    let starter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.start().await })
    };

    // Run everything concurrently
    let mut failed = None;
    tokio::select! {
        result = manager.run() => {
            if let Err(e) = result {
                error!(error = %e, error_type = e.error_type_label(), "Shard manager stopped on fatal error");
                failed = Some(e);
            }
        }
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
    info!("Shutting down client...");
    starter.abort();
    let _ = starter.await;
    manager.shutdown().await;
    rest.close();
    drop(manager);

    match dispatcher.await {
        Ok(handled) => info!(events_handled = handled, "Event dispatcher drained"),
        Err(e) => warn!(error = %e, "Event dispatcher did not finish cleanly"),
    }

    info!("Client shutdown complete");
    match failed {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
