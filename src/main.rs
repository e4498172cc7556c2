use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use clap::Parser;
use serde_json::json;
use tokio::signal;
use tracing::{info, Level};

use floodgate::config::AppConfig;
use floodgate::http::{HttpServer, RateLimitLayer};
use floodgate::ratelimit::{spawn_purge_task, CounterStore, SqliteCounterStore, TierLimiters};

/// Persistent tiered rate limiting service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    info!("Starting Floodgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration; invalid values are fatal at startup
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        database_url = %config.storage.database_url,
        enabled = config.rate_limiting.enabled,
        "Configuration loaded"
    );

    // Open the counter store
    let store: Arc<dyn CounterStore> =
        Arc::new(SqliteCounterStore::connect(&config.storage.database_url).await?);
    info!("Counter store initialized");

    // One limiter per tier, all sharing the store
    let limiters = TierLimiters::from_config(&config.rate_limiting, Arc::clone(&store));

    // Best-effort background purge of expired counters
    let _sweeper = spawn_purge_task(
        Arc::clone(&store),
        Duration::from_secs(config.rate_limiting.purge_interval_secs),
    );

    let router = app_router(&config, &limiters);
    let server = HttpServer::new(config.server.listen_addr, router);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Floodgate Rate Limiting Service stopped");
    Ok(())
}

/// Build the demo router.
///
/// The handlers are stubs standing in for the real application; they exist
/// so the tier wiring can be exercised end to end: authentication routes get
/// the strict tier, machine endpoints the api tier, everything else general.
/// `/health` is deliberately left outside all limiters.
fn app_router(config: &AppConfig, limiters: &TierLimiters) -> Router {
    let rl = &config.rate_limiting;

    let auth_routes = Router::new()
        .route("/login", post(accepted))
        .route("/register", post(accepted))
        .layer(RateLimitLayer::new(limiters.strict.clone(), rl));

    let api_routes = Router::new()
        .route("/status", get(status))
        .layer(RateLimitLayer::new(limiters.api.clone(), rl));

    Router::new()
        .route("/", get(status))
        .layer(RateLimitLayer::new(limiters.general.clone(), rl))
        .nest("/auth", auth_routes)
        .nest("/api", api_routes)
        .route("/health", get(status))
}

async fn status() -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn accepted() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
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
