//! Mediaspool - self-hosted media download queue service
//!
//! This is the main entry point. It initializes logging, loads the
//! configuration, restores persisted jobs, and serves the HTTP API until a
//! shutdown signal arrives.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use mediaspool::api;
use mediaspool::config::Settings;
use mediaspool::manager::DownloadManager;
use mediaspool::observability;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    observability::init_tracing();

    info!("Starting mediaspool v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        host = %settings.server.host,
        port = %settings.server.port,
        download_dir = %settings.download.download_dir.display(),
        max_concurrent = settings.download.max_concurrent,
        max_retries = settings.download.max_retries,
        persistence = settings.download.data_dir.is_some(),
        auth = settings.auth.password.is_some(),
        "Configuration loaded"
    );

    // Root cancellation token observed by every attempt, backoff sleep, and
    // admission check
    let shutdown = CancellationToken::new();

    // Restores persisted jobs and dispatches queued work up to the cap
    let manager = DownloadManager::start(settings.download.clone(), shutdown.clone()).await;
    info!("Download manager started");

    let state = api::AppState::new(manager.clone(), settings.clone());
    let app = api::router(state);

    let addr = SocketAddr::new(settings.server.host.parse()?, settings.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining downloads");

    // Cancel running attempts and backoff sleeps, wait for every in-flight
    // task to return, then flush the final state snapshot
    shutdown.cancel();
    manager.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (Ctrl+C or SIGTERM)
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
