//! Booking Recovery Server - Main entry point.
//!
//! This binary starts the ingestion server with:
//! - Structured JSON logging
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - The recovery email dispatch loop
//! - Background rate limiter cleanup
//!
//! # Configuration
//!
//! See [`recovery_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (in-memory store, emails only logged)
//! RECOVERY_ADMIN_TOKEN=dev cargo run --bin recovery-server
//!
//! # Production mode
//! RECOVERY_DATABASE_PATH=/var/lib/recovery/recovery.db \
//! RECOVERY_EMAIL_API_KEY=re_xxx \
//! RECOVERY_ADMIN_TOKEN="secret-token" \
//! PORT=8080 \
//! cargo run --release --bin recovery-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use recovery_server::config::Config;
use recovery_server::email::{EmailTransport, LogTransport, ResendTransport};
use recovery_server::routes::{create_router, AppState};
use recovery_server::store::{MemoryStore, SqliteStore, Store};

/// Cleanup interval for stale rate limiter entries (30 seconds).
const RATE_LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for the dispatch loop to finish its current pass.
const DISPATCH_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                            - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                        - Log level filter (default: info)");
            eprintln!("  RECOVERY_DATABASE_PATH          - SQLite file (default: in-memory)");
            eprintln!("  RECOVERY_EMAIL_API_KEY          - Email provider key (default: log only)");
            eprintln!("  RECOVERY_EMAIL_API_URL          - Email provider base URL");
            eprintln!("  RECOVERY_FROM_EMAIL             - Sender address");
            eprintln!("  RECOVERY_DISPATCH_INTERVAL_SECS - Dispatcher poll interval (default: 15)");
            eprintln!("  RECOVERY_MAX_SEND_ATTEMPTS      - Delivery attempts (default: 5)");
            eprintln!("  RECOVERY_ENFORCE_ORIGIN         - Check Origin against website domain");
            eprintln!("  RECOVERY_ADMIN_TOKEN            - Enables the management API");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format_args!("{err:#}"), "Server failed");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let transport = build_transport(&config)?;

    info!(
        port = config.port,
        durable_store = config.database_path.is_some(),
        email_delivery = config.email_api_key.is_some(),
        enforce_origin = config.enforce_origin,
        management_api = config.admin_token.is_some(),
        "Recovery server starting"
    );

    let state = AppState::new(config.clone(), store, transport);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch_handle = state
        .scheduler
        .spawn_dispatch_loop(config.dispatch_interval, shutdown_rx);

    let cleanup_handle = state
        .rate_limiter
        .spawn_cleanup_task(RATE_LIMITER_CLEANUP_INTERVAL);
    info!(
        interval_secs = RATE_LIMITER_CLEANUP_INTERVAL.as_secs(),
        "Rate limiter cleanup task started"
    );

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(port = config.port, address = %bind_addr, "Server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Server shutting down gracefully");

    cleanup_handle.abort();

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(DISPATCH_SHUTDOWN_TIMEOUT, dispatch_handle).await {
        Ok(Ok(())) => info!("Dispatch loop stopped"),
        Ok(Err(err)) => warn!(error = %err, "Dispatch loop ended abnormally"),
        Err(_) => warn!(
            timeout_secs = DISPATCH_SHUTDOWN_TIMEOUT.as_secs(),
            "Dispatch loop did not stop in time"
        ),
    }

    served.context("server error")
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match &config.database_path {
        Some(path) => {
            let store = SqliteStore::open(path)
                .with_context(|| format!("failed to open database {}", path.display()))?;
            info!(path = %path.display(), "Using SQLite store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("Using in-memory store, scheduled emails will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_transport(config: &Config) -> anyhow::Result<Arc<dyn EmailTransport>> {
    match &config.email_api_key {
        Some(key) => {
            let transport = ResendTransport::new(config.email_api_url.clone(), key.clone())
                .context("failed to create email transport")?;
            Ok(Arc::new(transport))
        }
        None => Ok(Arc::new(LogTransport)),
    }
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default `info,tower_http=debug`).
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGTERM or SIGINT is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
