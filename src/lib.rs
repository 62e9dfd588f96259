pub mod changeset;
pub mod config;
pub mod db;
pub mod diff;
pub mod errors;
pub mod http;
pub mod models;
pub mod service;
pub mod session;
pub mod validation;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::service::MetricsService;
use std::path::Path;
use tokio::net::TcpListener;
use tracing_appender::non_blocking::WorkerGuard;

pub use crate::http::build_router;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Opens storage and serves the HTTP API until `shutdown` resolves.
pub async fn serve(config: &AppConfig, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> AppResult<()> {
    let service = MetricsService::open(&config.data_dir, &config.database_options())?;
    let database = service.database().path().display().to_string();
    let router = build_router(service);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| AppError::Io(format!("failed to bind {}: {}", config.bind_addr, error)))?;
    tracing::info!(address = %config.bind_addr, database = %database, "metrics service listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(AppError::from)
}

/// JSON logs to a daily file under `<data_dir>/logs`, or stderr when that directory can't be made.
pub fn init_tracing(data_dir: &Path, default_level: &str) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_dir = data_dir.join("logs");
    match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, "metrics-service.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(non_blocking)
                .try_init()
                .map_err(|error| error.to_string())
        }
        Err(error) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|error| error.to_string())?;
            tracing::warn!(error = %error, "log directory unavailable; logging to stderr");
            Ok(())
        }
    }
}
