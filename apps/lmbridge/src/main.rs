use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

/// OpenAI-compatible bridge serving chat completions through browser tabs on
/// an upstream chat arena, or through direct model APIs.
#[derive(Debug, Parser)]
#[command(name = "lmbridge", version)]
struct Cli {
    /// Bind address.
    #[arg(long, env = "LMBRIDGE_HOST", default_value = "127.0.0.1")]
    host: String,
    /// HTTP port (OpenAI surface, tab WebSocket, internal endpoints).
    #[arg(long, env = "LMBRIDGE_PORT", default_value_t = 5102)]
    port: u16,
    /// Directory holding config.jsonc / model_endpoint_map.json / models.json.
    #[arg(long, env = "LMBRIDGE_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,
    /// Directory for logs and downloaded images.
    #[arg(long, env = "LMBRIDGE_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = Arc::new(lmbridge_config::ConfigStore::load(
        lmbridge_config::ConfigPaths::in_dir(&cli.config_dir),
    ));
    let snapshot = config.config();

    let log_dir = cli.data_dir.join("logs");
    tokio::fs::create_dir_all(&log_dir)
        .await
        .with_context(|| format!("creating {}", log_dir.display()))?;

    let monitoring = Arc::new(lmbridge_core::MonitoringService::new(
        log_dir.clone(),
        snapshot.request_details_limit,
        snapshot.request_details_max_bytes,
    ));

    // The request log is best-effort: a missing database never blocks boot.
    let dsn = format!("sqlite://{}?mode=rwc", log_dir.join("requests.db").display());
    match lmbridge_storage::RequestLogStore::connect(&dsn).await {
        Ok(store) => {
            monitoring
                .add_sink(Arc::new(lmbridge_storage::DbRequestLogSink::new(store)))
                .await;
            info!("request log attached at {dsn}");
        }
        Err(err) => warn!(%err, "request log unavailable; continuing without it"),
    }

    let state = lmbridge_core::AppState::new(config.clone(), monitoring, cli.data_dir.clone())
        .map_err(anyhow::Error::msg)?;

    tokio::spawn(lmbridge_config::watch_config_files(
        config.clone(),
        Duration::from_secs(30),
    ));
    tokio::spawn(lmbridge_core::lifecycle::stale_request_sweeper(state.clone()));
    tokio::spawn(lmbridge_core::lifecycle::idle_restart_watchdog(state.clone()));

    let app = lmbridge_router::bridge_router(state);

    let bind = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!("listening on {bind}");
    info!("tab WebSocket endpoint: ws://{bind}/ws");
    axum::serve(listener, app).await?;
    Ok(())
}
