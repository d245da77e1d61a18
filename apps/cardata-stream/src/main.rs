//! CarData Stream Binary
//!
//! Starts the telemetry stream consumer.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin cardata-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `CARDATA_GCID`: Account identifier (MQTT username)
//! - `CARDATA_ID_TOKEN`: Current ID token (MQTT password)
//!
//! ## Optional
//! - `CARDATA_STREAM_HOST` / `CARDATA_STREAM_PORT`: Broker (default: customer.streaming-cardata.bmwgroup.com:9000)
//! - `CARDATA_MQTT_KEEPALIVE_SECS`: Keepalive (default: 120)
//! - `CARDATA_CONNECT_TIMEOUT_SECS`: CONNACK wait (default: 30)
//! - `CARDATA_RECONNECT_DELAY_INITIAL_SECS` / `CARDATA_RECONNECT_DELAY_MAX_SECS`: Backoff (default: 5 / 300)
//! - `CARDATA_DIAGNOSTIC_INTERVAL_SECS`: Watchdog tick (default: 60)
//! - `CARDATA_REQUEST_LIMIT` / `CARDATA_REQUEST_WINDOW_SECS`: API quota (default: 50 / 86400)
//! - `CARDATA_STATE_DIR`: Persisted state (default: ./data)
//! - `CARDATA_HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8083)
//! - `CARDATA_DEBUG_LOG`: Verbose logging (default: false)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Extra log directives

use std::sync::Arc;

use anyhow::Context;
use cardata_stream::infrastructure::health::{HealthServer, HealthServerState};
use cardata_stream::infrastructure::telemetry;
use cardata_stream::{
    AppConfig, BlobStore, ConnectionState, EventHub, EventHubConfig, JsonFileStore, QuotaManager,
    StateCoordinator, StreamManager, StreamNotice, TelemetryConfig, init_metrics,
};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let config = AppConfig::from_env().context("invalid configuration")?;

    // Initialize telemetry (tracing + optional OpenTelemetry)
    let _telemetry_guard = telemetry::init(TelemetryConfig::from_env(config.debug_log));

    tracing::info!("Starting CarData stream consumer");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Quota manager: a store that cannot be read is fatal
    let quota_store: Arc<dyn BlobStore> =
        Arc::new(JsonFileStore::new(config.state.request_log_path()));
    let quota = Arc::new(
        QuotaManager::create(quota_store, config.quota)
            .await
            .context("failed to load API quota log")?,
    );

    // Coordinator, restored from the last snapshot when possible
    let events = Arc::new(EventHub::new(EventHubConfig::default()));
    let coordinator = Arc::new(StateCoordinator::new(
        Arc::clone(&events),
        config.coordinator_config(),
    ));
    let state_store = JsonFileStore::new(config.state.descriptor_state_path());
    match coordinator.load(&state_store).await {
        Ok(vehicles) => tracing::info!(vehicles, "Restored coordinator state"),
        Err(e) => tracing::warn!(error = %e, "Starting without previous coordinator state"),
    }

    // Stream manager wired into the coordinator
    let stream = StreamManager::new(
        config.stream_manager_config(),
        config.credentials.clone(),
        CancellationToken::new(),
    );
    wire_stream(&stream, &coordinator);

    stream
        .start()
        .await
        .context("failed to connect to CarData stream")?;

    let watchdog = coordinator.spawn_watchdog(
        config.state.diagnostic_interval,
        shutdown_token.child_token(),
    );

    // Spawn health server
    if config.server.health_port == 0 {
        tracing::info!("Health server disabled");
    } else {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&coordinator),
            Arc::clone(&quota),
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.child_token(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    let logger = spawn_notification_logger(&coordinator, shutdown_token.child_token());

    tracing::info!("CarData stream consumer ready");

    await_shutdown(shutdown_token).await;

    if let Err(e) = watchdog.await {
        tracing::warn!(error = %e, "Watchdog ended abnormally");
    }
    stream.shutdown().await;
    quota.close().await;
    coordinator.persist(&state_store).await;
    if let Err(e) = logger.await {
        tracing::warn!(error = %e, "Notification logger ended abnormally");
    }

    tracing::info!("CarData stream consumer stopped");
    Ok(())
}

/// Route stream messages and state changes into the coordinator.
fn wire_stream(stream: &StreamManager, coordinator: &Arc<StateCoordinator>) {
    let sink = Arc::clone(coordinator);
    stream.set_message_callback(Arc::new(
        move |vin: String, data: Value| -> BoxFuture<'static, ()> {
            let coordinator = Arc::clone(&sink);
            Box::pin(async move { coordinator.handle_message(&vin, &data) })
        },
    ));

    let sink = Arc::clone(coordinator);
    stream.set_status_callback(Arc::new(
        move |state: ConnectionState, reason: Option<String>| -> BoxFuture<'static, ()> {
            let coordinator = Arc::clone(&sink);
            Box::pin(async move { coordinator.handle_connection_event(state, reason) })
        },
    ));

    stream.set_error_callback(Arc::new(|notice: StreamNotice| -> BoxFuture<'static, ()> {
        Box::pin(async move {
            match notice {
                StreamNotice::Unauthorized => tracing::warn!(
                    reason = notice.reason(),
                    "Stream credentials rejected; waiting for a new ID token"
                ),
                StreamNotice::Recovered => {
                    tracing::info!(reason = notice.reason(), "Stream authorization recovered");
                }
            }
        })
    }));
}

/// Log new descriptors and SOC estimate changes until cancelled.
fn spawn_notification_logger(
    coordinator: &Arc<StateCoordinator>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let coordinator = Arc::clone(coordinator);
    let mut new_descriptors = coordinator.events().new_descriptors_rx();
    let mut soc_updates = coordinator.events().soc_rx();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = new_descriptors.recv() => match received {
                    Ok(event) => tracing::info!(
                        vin = %event.vin,
                        descriptor = %event.descriptor,
                        kind = ?event.kind,
                        "New descriptor"
                    ),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Notification logger lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                received = soc_updates.recv() => match received {
                    Ok(event) => tracing::debug!(
                        vin = %event.vin,
                        estimate = ?coordinator.get_soc_estimate(&event.vin),
                        rate = ?coordinator.get_soc_rate(&event.vin),
                        "SOC estimate updated"
                    ),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Notification logger lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Log the parsed configuration.
fn log_config(config: &AppConfig) {
    tracing::info!(
        gcid = %config.credentials.gcid(),
        host = %config.stream.host,
        port = config.stream.port,
        health_port = config.server.health_port,
        state_dir = %config.state.state_dir.display(),
        request_limit = config.quota.limit,
        debug_log = config.debug_log,
        "Configuration loaded"
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
    tracing::info!("Graceful shutdown started");
}
