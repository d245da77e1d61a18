//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, stream status reporting, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness check (simple OK)
//! - `GET /readyz` - Readiness check (stream connected)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{QuotaManager, StateCoordinator};
use crate::domain::connection::ConnectionState;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Stream connection status.
    pub stream: StreamStatus,
    /// API quota usage.
    pub quota: QuotaStatus,
    /// Tracked telemetry.
    pub telemetry: TelemetryStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Stream connected.
    Healthy,
    /// Stream connecting or reconnecting.
    Degraded,
    /// Credentials rejected; needs a new token.
    Unhealthy,
}

/// Stream connection status.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    /// Connection state, if one was reported yet.
    pub state: Option<ConnectionState>,
    /// Reason attached to the state.
    pub reason: Option<String>,
    /// Whether the stream is live.
    pub connected: bool,
    /// Messages processed since start.
    pub messages_processed: u64,
    /// When the last message was processed.
    pub last_message_at: Option<DateTime<Utc>>,
}

/// API quota usage.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    /// Calls inside the window.
    pub used: usize,
    /// Calls left inside the window.
    pub remaining: usize,
    /// When the oldest counted call expires.
    pub next_reset: Option<String>,
}

/// Tracked telemetry counts.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryStatus {
    /// Vehicles with stored state.
    pub vehicles: usize,
    /// Stored descriptors across vehicles.
    pub descriptors: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    coordinator: Arc<StateCoordinator>,
    quota: Arc<QuotaManager>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        coordinator: Arc<StateCoordinator>,
        quota: Arc<QuotaManager>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            coordinator,
            quota,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by [`HealthServer`].
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let connected = state
        .coordinator
        .diagnostics()
        .connection_status
        .is_some_and(|s| s.is_connected());

    if connected {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let diagnostics = state.coordinator.diagnostics();
    let connected = diagnostics
        .connection_status
        .is_some_and(|s| s.is_connected());

    HealthResponse {
        status: determine_health_status(diagnostics.connection_status),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        stream: StreamStatus {
            state: diagnostics.connection_status,
            reason: diagnostics.connection_reason,
            connected,
            messages_processed: diagnostics.messages_processed,
            last_message_at: diagnostics.last_message_at,
        },
        quota: QuotaStatus {
            used: state.quota.used(),
            remaining: state.quota.remaining(),
            next_reset: state.quota.next_reset_iso(),
        },
        telemetry: TelemetryStatus {
            vehicles: diagnostics.tracked_vehicles,
            descriptors: diagnostics.descriptor_count,
        },
    }
}

const fn determine_health_status(state: Option<ConnectionState>) -> HealthStatus {
    match state {
        Some(ConnectionState::Connected | ConnectionState::Recovered) => HealthStatus::Healthy,
        Some(ConnectionState::Unauthorized) => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::services::CoordinatorConfig;
    use crate::domain::quota::QuotaConfig;
    use crate::infrastructure::events::EventHub;
    use crate::infrastructure::persistence::InMemoryBlobStore;

    async fn state() -> Arc<HealthServerState> {
        let coordinator = Arc::new(StateCoordinator::new(
            Arc::new(EventHub::default()),
            CoordinatorConfig::default(),
        ));
        let quota = QuotaManager::create(Arc::new(InMemoryBlobStore::new()), QuotaConfig::default())
            .await
            .unwrap();
        Arc::new(HealthServerState::new(
            "0.1.0".to_string(),
            coordinator,
            Arc::new(quota),
        ))
    }

    async fn get(state: Arc<HealthServerState>, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn status_follows_connection_state() {
        assert_eq!(
            determine_health_status(Some(ConnectionState::Connected)),
            HealthStatus::Healthy
        );
        assert_eq!(
            determine_health_status(Some(ConnectionState::Recovered)),
            HealthStatus::Healthy
        );
        assert_eq!(
            determine_health_status(Some(ConnectionState::Disconnected)),
            HealthStatus::Degraded
        );
        assert_eq!(determine_health_status(None), HealthStatus::Degraded);
        assert_eq!(
            determine_health_status(Some(ConnectionState::Unauthorized)),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        let (status, body) = get(state().await, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }

    #[tokio::test]
    async fn readiness_tracks_stream() {
        let state = state().await;
        let (status, _) = get(Arc::clone(&state), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state
            .coordinator
            .handle_connection_event(ConnectionState::Connected, None);
        let (status, body) = get(state, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"READY");
    }

    #[tokio::test]
    async fn health_reports_quota_and_stream() {
        let state = state().await;
        state.quota.claim().await.unwrap();
        state.coordinator.handle_connection_event(
            ConnectionState::Unauthorized,
            Some("not authorized".to_string()),
        );

        let (status, body) = get(state, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["stream"]["state"], "unauthorized");
        assert_eq!(json["stream"]["reason"], "not authorized");
        assert_eq!(json["quota"]["used"], 1);
        assert_eq!(json["quota"]["remaining"], 49);
        assert_eq!(json["telemetry"]["vehicles"], 0);
    }
}
