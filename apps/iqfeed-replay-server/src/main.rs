//! IQFeed Replay Server Binary
//!
//! Starts the feed emulator.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin iqfeed-replay-server
//! ```
//!
//! # Environment Variables
//!
//! All optional.
//!
//! - `IQFEED_REPLAY_HOST`: Bind address (default: 0.0.0.0)
//! - `IQFEED_REPLAY_PORT`: Feed port (default: 9999)
//! - `IQFEED_REPLAY_MAX_CONNECTIONS`: Connection cap, 0 = unlimited (default: 0)
//! - `IQFEED_REPLAY_DATA_DIR`: Directory of `<SYMBOL>.csv` files (default: ./data)
//! - `IQFEED_REPLAY_SPEED`: Replay speed multiplier, 0 freezes (default: 1.0)
//! - `IQFEED_REPLAY_ON_END`: `loop` | `hold` (default: hold)
//! - `IQFEED_REPLAY_HEALTH_PORT`: Health check HTTP port, 0 = disabled (default: 8082)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: iqfeed-replay-server)
//! - `RUST_LOG`: Log level (default: info)
//!
//! Queue, heartbeat and timeout tuning variables are listed on
//! `ServerConfig::from_lookup`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use iqfeed_replay_server::infrastructure::health::{HealthServer, HealthServerState};
use iqfeed_replay_server::infrastructure::telemetry;
use iqfeed_replay_server::{
    ConnectionContext, CsvDirectoryStore, HistoryStore, ReplayServer, ServerConfig, ServerError,
    SystemClock, init_metrics,
};
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting IQFeed replay server");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let pacer = config.replay.pacer()?;
    if !config.replay.data_dir.is_dir() {
        tracing::warn!(
            data_dir = %config.replay.data_dir.display(),
            "Data directory not found, every symbol will report no data"
        );
    }

    let store: Arc<dyn HistoryStore> =
        Arc::new(CsvDirectoryStore::new(config.replay.data_dir.clone()));
    let context = ConnectionContext {
        pacer,
        store,
        clock: Arc::new(SystemClock),
        settings: config.connection,
    };

    let shutdown_token = CancellationToken::new();
    let server = Arc::new(ReplayServer::new(
        context,
        config.listener.max_connections,
        shutdown_token.clone(),
    ));

    // Spawn health server
    if config.health_port == 0 {
        tracing::info!("Health server disabled");
    } else {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            config.listener.max_connections,
            server.stats(),
        ));
        let health_server =
            HealthServer::new(config.health_port, health_state, shutdown_token.clone());
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    // Spawn feed server
    let addr = config.listener.addr();
    let mut server_task = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve(addr).await }
    });

    tokio::select! {
        joined = &mut server_task => {
            // Only a bind failure ends the server before a shutdown signal.
            shutdown_token.cancel();
            return server_outcome(joined);
        }
        () = await_shutdown(shutdown_token.clone()) => {}
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server_task).await {
        Ok(joined) => server_outcome(joined)?,
        Err(_) => tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Sessions still open at shutdown timeout"
        ),
    }

    tracing::info!("IQFeed replay server stopped");
    Ok(())
}

fn server_outcome(joined: Result<Result<(), ServerError>, JoinError>) -> anyhow::Result<()> {
    joined
        .context("feed server task panicked")?
        .context("feed server failed")
}

/// Log the parsed configuration.
fn log_config(config: &ServerConfig) {
    tracing::info!(
        addr = %config.listener.addr(),
        max_connections = config.listener.max_connections,
        data_dir = %config.replay.data_dir.display(),
        speed = config.replay.speed,
        on_end = config.replay.on_end.as_str(),
        health_port = config.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        queue_capacity = config.connection.queue_capacity,
        max_line_length = config.connection.max_line_length,
        poll_interval_ms = config.connection.poll_interval.as_millis(),
        drain_timeout_secs = config.connection.drain_timeout.as_secs(),
        batch_limit = config.connection.session.batch_limit,
        max_malformed = config.connection.session.max_malformed,
        "Connection settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
