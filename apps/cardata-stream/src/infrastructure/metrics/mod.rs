//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: telemetry messages received and dropped
//! - **Connection**: stream connection state and reconnect attempts
//! - **Quota**: API quota claims by outcome
//! - **State**: tracked vehicles and descriptors
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::connection::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder was already installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "cardata_messages_received_total",
        "Telemetry messages received from the stream"
    );
    describe_counter!(
        "cardata_messages_dropped_total",
        "Telemetry messages dropped by reason"
    );
    describe_histogram!(
        "cardata_message_processing_seconds",
        "Time spent applying one telemetry message"
    );

    describe_gauge!(
        "cardata_stream_connection_state",
        "Stream connection state (0 connecting, 1 connected, 2 disconnected, 3 unauthorized, 4 failed, 5 recovered)"
    );
    describe_counter!(
        "cardata_stream_reconnects_total",
        "Stream reconnection attempts"
    );

    describe_counter!(
        "cardata_quota_claims_total",
        "API quota claims by outcome"
    );

    describe_gauge!("cardata_tracked_vehicles", "Vehicles with stored state");
    describe_gauge!(
        "cardata_tracked_descriptors",
        "Stored descriptor values across all vehicles"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a message was dropped.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// Payload was not a JSON object with `vin` and `data`.
    Malformed,
    /// Payload had an empty vehicle identifier or a non-object `data`.
    Incomplete,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Incomplete => "incomplete",
        }
    }
}

/// Outcome of a quota claim.
#[derive(Debug, Clone, Copy)]
pub enum ClaimOutcome {
    /// Call was recorded.
    Granted,
    /// Window was full.
    Rejected,
}

impl ClaimOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Rejected => "rejected",
        }
    }
}

/// Record a telemetry message received from the stream.
pub fn record_message_received() {
    counter!("cardata_messages_received_total").increment(1);
}

/// Record a dropped telemetry message.
pub fn record_message_dropped(reason: DropReason) {
    counter!(
        "cardata_messages_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record how long one message took to apply.
pub fn record_processing_duration(duration: Duration) {
    histogram!("cardata_message_processing_seconds").record(duration.as_secs_f64());
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("cardata_stream_connection_state").set(state.as_gauge());
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("cardata_stream_reconnects_total").increment(1);
}

/// Record a quota claim.
pub fn record_quota_claim(outcome: ClaimOutcome) {
    counter!(
        "cardata_quota_claims_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Update the tracked state gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_tracked_state(vehicles: usize, descriptors: usize) {
    gauge!("cardata_tracked_vehicles").set(vehicles as f64);
    gauge!("cardata_tracked_descriptors").set(descriptors as f64);
}

// =============================================================================
// Tests
// =============================================================================
