//! Coordinator Event Hub
//!
//! Typed fan-out of coordinator notifications over tokio broadcast
//! channels. Downstream consumers (entity layers, loggers, the health
//! endpoint) subscribe to the channels they care about.
//!
//! # Architecture
//!
//! One channel per notification kind:
//! - descriptor updates (every stored value)
//! - new descriptors (first value per vehicle and descriptor)
//! - SOC estimate changes
//! - diagnostics snapshots
//! - connection state changes
//!
//! Sending with no receivers is not an error. Delivery is at-least-once per
//! live receiver with no ordering across channels; a lagging receiver drops
//! the oldest messages.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::connection::ConnectionState;

// =============================================================================
// Event Messages
// =============================================================================

/// A descriptor value was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorUpdate {
    /// Vehicle identification number.
    pub vin: String,
    /// Descriptor name.
    pub descriptor: String,
}

/// Classification of a first-seen descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    /// Non-boolean value.
    Sensor,
    /// Boolean value.
    Binary,
}

/// A descriptor was seen for a vehicle for the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDescriptor {
    /// Vehicle identification number.
    pub vin: String,
    /// Descriptor name.
    pub descriptor: String,
    /// Boolean or not.
    pub kind: DescriptorKind,
}

/// The SOC estimate or rate of a vehicle changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocEstimateUpdate {
    /// Vehicle identification number.
    pub vin: String,
}

/// Estimator figures of one vehicle in a diagnostics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VehicleDiagnostics {
    /// Primary estimate (%).
    pub soc_estimate: Option<f64>,
    /// Net-of-house-load estimate (%).
    pub soc_estimate_testing: Option<f64>,
    /// Charging rate (%/h).
    pub soc_rate: Option<f64>,
    /// Whether the vehicle reports active charging.
    pub charging_active: bool,
    /// Number of stored descriptors.
    pub descriptors: usize,
}

/// Coordinator diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Last reported connection state.
    pub connection_status: Option<ConnectionState>,
    /// Reason attached to the last connection state.
    pub connection_reason: Option<String>,
    /// When the last telemetry message was processed.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Messages processed since start.
    pub messages_processed: u64,
    /// Number of vehicles with stored state.
    pub tracked_vehicles: usize,
    /// Total stored descriptors across vehicles.
    pub descriptor_count: usize,
    /// Per-vehicle estimator figures.
    pub vehicles: BTreeMap<String, VehicleDiagnostics>,
}

/// Connection state change as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// New state.
    pub state: ConnectionState,
    /// Optional reason text.
    pub reason: Option<String>,
}

// =============================================================================
// Event Hub
// =============================================================================

/// Channel capacities.
#[derive(Debug, Clone, Copy)]
pub struct EventHubConfig {
    /// Capacity for descriptor updates.
    pub updates_capacity: usize,
    /// Capacity for new-descriptor notifications.
    pub new_descriptors_capacity: usize,
    /// Capacity for SOC estimate notifications.
    pub soc_capacity: usize,
    /// Capacity for diagnostics snapshots.
    pub diagnostics_capacity: usize,
    /// Capacity for connection events.
    pub connection_capacity: usize,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            updates_capacity: 4_096,
            new_descriptors_capacity: 1_024,
            soc_capacity: 256,
            diagnostics_capacity: 16,
            connection_capacity: 64,
        }
    }
}

/// Central hub for coordinator notifications.
#[derive(Debug)]
#[allow(clippy::struct_field_names)]
pub struct EventHub {
    updates_tx: broadcast::Sender<DescriptorUpdate>,
    new_descriptors_tx: broadcast::Sender<NewDescriptor>,
    soc_tx: broadcast::Sender<SocEstimateUpdate>,
    diagnostics_tx: broadcast::Sender<DiagnosticsSnapshot>,
    connection_tx: broadcast::Sender<ConnectionEvent>,
}

impl EventHub {
    /// Create a new hub with the given capacities.
    #[must_use]
    pub fn new(config: EventHubConfig) -> Self {
        Self {
            updates_tx: broadcast::channel(config.updates_capacity).0,
            new_descriptors_tx: broadcast::channel(config.new_descriptors_capacity).0,
            soc_tx: broadcast::channel(config.soc_capacity).0,
            diagnostics_tx: broadcast::channel(config.diagnostics_capacity).0,
            connection_tx: broadcast::channel(config.connection_capacity).0,
        }
    }

    /// Create a new hub with default capacities.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(EventHubConfig::default())
    }

    // =========================================================================
    // Descriptor Updates
    // =========================================================================

    /// Announce a stored descriptor value.
    ///
    /// Returns the number of receivers, or `None` if there are none.
    pub fn send_update(&self, vin: &str, descriptor: &str) -> Option<usize> {
        self.updates_tx
            .send(DescriptorUpdate {
                vin: vin.to_string(),
                descriptor: descriptor.to_string(),
            })
            .ok()
    }

    /// Get a new receiver for descriptor updates.
    #[must_use]
    pub fn updates_rx(&self) -> broadcast::Receiver<DescriptorUpdate> {
        self.updates_tx.subscribe()
    }

    // =========================================================================
    // New Descriptors
    // =========================================================================

    /// Announce a first-seen descriptor.
    pub fn send_new_descriptor(
        &self,
        vin: &str,
        descriptor: &str,
        kind: DescriptorKind,
    ) -> Option<usize> {
        self.new_descriptors_tx
            .send(NewDescriptor {
                vin: vin.to_string(),
                descriptor: descriptor.to_string(),
                kind,
            })
            .ok()
    }

    /// Get a new receiver for first-seen descriptors.
    #[must_use]
    pub fn new_descriptors_rx(&self) -> broadcast::Receiver<NewDescriptor> {
        self.new_descriptors_tx.subscribe()
    }

    // =========================================================================
    // SOC Estimates
    // =========================================================================

    /// Announce a changed SOC estimate.
    pub fn send_soc_estimate(&self, vin: &str) -> Option<usize> {
        self.soc_tx
            .send(SocEstimateUpdate {
                vin: vin.to_string(),
            })
            .ok()
    }

    /// Get a new receiver for SOC estimate changes.
    #[must_use]
    pub fn soc_rx(&self) -> broadcast::Receiver<SocEstimateUpdate> {
        self.soc_tx.subscribe()
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Publish a diagnostics snapshot.
    pub fn send_diagnostics(&self, snapshot: DiagnosticsSnapshot) -> Option<usize> {
        self.diagnostics_tx.send(snapshot).ok()
    }

    /// Get a new receiver for diagnostics snapshots.
    #[must_use]
    pub fn diagnostics_rx(&self) -> broadcast::Receiver<DiagnosticsSnapshot> {
        self.diagnostics_tx.subscribe()
    }

    // =========================================================================
    // Connection Events
    // =========================================================================

    /// Publish a connection state change.
    pub fn send_connection(&self, state: ConnectionState, reason: Option<String>) -> Option<usize> {
        self.connection_tx
            .send(ConnectionEvent { state, reason })
            .ok()
    }

    /// Get a new receiver for connection state changes.
    #[must_use]
    pub fn connection_rx(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_tx.subscribe()
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Receiver counts of all channels.
    #[must_use]
    pub fn stats(&self) -> EventHubStats {
        EventHubStats {
            updates_receivers: self.updates_tx.receiver_count(),
            new_descriptors_receivers: self.new_descriptors_tx.receiver_count(),
            soc_receivers: self.soc_tx.receiver_count(),
            diagnostics_receivers: self.diagnostics_tx.receiver_count(),
            connection_receivers: self.connection_tx.receiver_count(),
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Shared event hub reference.
pub type SharedEventHub = Arc<EventHub>;

/// Receiver counts per channel.
#[derive(Debug, Clone, Default)]
pub struct EventHubStats {
    /// Descriptor update receivers.
    pub updates_receivers: usize,
    /// New-descriptor receivers.
    pub new_descriptors_receivers: usize,
    /// SOC estimate receivers.
    pub soc_receivers: usize,
    /// Diagnostics receivers.
    pub diagnostics_receivers: usize,
    /// Connection event receivers.
    pub connection_receivers: usize,
}

impl EventHubStats {
    /// Total receivers across all channels.
    #[must_use]
    pub const fn total_receivers(&self) -> usize {
        self.updates_receivers
            + self.new_descriptors_receivers
            + self.soc_receivers
            + self.diagnostics_receivers
            + self.connection_receivers
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_starts_without_receivers() {
        let hub = EventHub::with_defaults();
        assert_eq!(hub.stats().total_receivers(), 0);
    }

    #[test]
    fn send_without_receivers_is_none() {
        let hub = EventHub::with_defaults();
        assert!(hub.send_update("VIN1", "a.b").is_none());
        assert!(hub.send_soc_estimate("VIN1").is_none());
        assert!(hub.send_diagnostics(DiagnosticsSnapshot::default()).is_none());
    }

    #[tokio::test]
    async fn update_reaches_receiver() {
        let hub = EventHub::with_defaults();
        let mut rx = hub.updates_rx();

        assert_eq!(hub.send_update("VIN1", "vehicle.cabin.door"), Some(1));
        let update = rx.recv().await.unwrap();
        assert_eq!(update.vin, "VIN1");
        assert_eq!(update.descriptor, "vehicle.cabin.door");
    }

    #[tokio::test]
    async fn multiple_receivers_each_get_new_descriptor() {
        let hub = EventHub::with_defaults();
        let mut rx1 = hub.new_descriptors_rx();
        let mut rx2 = hub.new_descriptors_rx();
        assert_eq!(hub.stats().new_descriptors_receivers, 2);

        hub.send_new_descriptor("VIN1", "vehicle.isMoving", DescriptorKind::Binary);

        assert_eq!(rx1.recv().await.unwrap().kind, DescriptorKind::Binary);
        assert_eq!(rx2.recv().await.unwrap().descriptor, "vehicle.isMoving");
    }

    #[tokio::test]
    async fn connection_event_carries_reason() {
        let hub = EventHub::with_defaults();
        let mut rx = hub.connection_rx();

        hub.send_connection(ConnectionState::Disconnected, Some("keepalive".to_string()));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, ConnectionState::Disconnected);
        assert_eq!(event.reason.as_deref(), Some("keepalive"));
    }

    #[test]
    fn dropped_receiver_is_not_counted() {
        let hub = EventHub::with_defaults();
        let rx = hub.soc_rx();
        assert_eq!(hub.stats().soc_receivers, 1);
        drop(rx);
        assert_eq!(hub.stats().soc_receivers, 0);
    }
}
