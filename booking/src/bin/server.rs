//! Slotbook Server
//!
//! Runs the booking engine behind HTTP and WebSocket:
//! - Booking store and expiry reaper
//! - REST API under `/api`, channel transport at `/ws`
//! - Prometheus scrape endpoint on the metrics address
//!
//! # Usage
//!
//! ```bash
//! PAYMENT_KEY_SECRET=... cargo run --bin slotbook-server
//! ```

use axum::{Router, routing::get};
use slotbook::server::{AppState, build_router};
use slotbook::{BookingApp, Config};
use slotbook_runtime::metrics::MetricsServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,slotbook=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Slotbook Server...");

    let config = Config::from_env();
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        lock_ttl_secs = config.booking.lock_ttl,
        reaper_interval_secs = config.booking.reaper_interval,
        "Configuration loaded"
    );

    // Metrics
    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.metrics_host, config.server.metrics_port).parse()?;
    let mut metrics_server = MetricsServer::new(metrics_addr);
    metrics_server.start()?;
    slotbook::metrics::register_business_metrics();
    let metrics_server = Arc::new(metrics_server);
    tokio::spawn(serve_metrics(Arc::clone(&metrics_server)));

    // Engine
    let app = Arc::new(BookingApp::new(config.clone()));
    app.start().await;

    // HTTP
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Slotbook Server is running! Press Ctrl+C to shutdown");

    axum::serve(listener, build_router(AppState::new(&app)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down gracefully...");
    if let Err(error) = app
        .shutdown(Duration::from_secs(config.server.shutdown_timeout))
        .await
    {
        tracing::warn!(%error, "Booking store did not drain cleanly");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn serve_metrics(metrics_server: Arc<MetricsServer>) {
    let addr = metrics_server.addr();
    let router = Router::new().route(
        "/metrics",
        get(move || {
            let metrics_server = Arc::clone(&metrics_server);
            async move { metrics_server.render().unwrap_or_default() }
        }),
    );

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(error) = axum::serve(listener, router).await {
                tracing::error!(%error, "Metrics server failed");
            }
        },
        Err(error) => tracing::error!(%error, %addr, "Failed to bind metrics server"),
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
    }
}
