//! State Coordinator
//!
//! Owns the latest value of every descriptor per vehicle and the per-vehicle
//! SOC estimator. Telemetry messages and connection events come in from the
//! stream manager; change notifications go out through the event hub.
//!
//! # Concurrency
//!
//! All state sits behind one `parking_lot` mutex, so message ingestion and
//! the watchdog never advance an estimator concurrently. The lock is never
//! held across an await or while notifications are sent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{BlobStore, StoreError};
use crate::domain::connection::ConnectionState;
use crate::domain::descriptor::{
    DescriptorReading, DescriptorState, DescriptorValue, energy_to_kwh, names, power_to_watts,
};
use crate::domain::soc::{ChargingInput, Extrapolation, SocTracking};
use crate::infrastructure::events::{
    DescriptorKind, DiagnosticsSnapshot, SharedEventHub, VehicleDiagnostics,
};
use crate::infrastructure::metrics::{self, DropReason};

/// Estimate drift (percentage points) from the last authoritative reading
/// before the primary SOC descriptor is overwritten with the estimate.
const SOC_MIRROR_THRESHOLD: f64 = 0.1;

// =============================================================================
// Configuration
// =============================================================================

/// Coordinator settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorConfig {
    /// Log every diagnostics snapshot.
    pub debug_log: bool,
}

// =============================================================================
// Snapshots
// =============================================================================

/// A cached SOC extrapolation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SocCache {
    /// Estimate (%).
    pub estimate: f64,
    /// Rate (%/h).
    pub rate: Option<f64>,
    /// When the estimate was last advanced.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Persistable state of one vehicle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    /// Stored descriptor values.
    #[serde(default)]
    pub descriptors: BTreeMap<String, DescriptorState>,
    /// Primary SOC extrapolation.
    #[serde(default)]
    pub soc: Option<SocCache>,
    /// Net-of-house-load SOC extrapolation.
    #[serde(default)]
    pub soc_testing: Option<SocCache>,
}

/// Persistable coordinator state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSnapshot {
    /// Per-vehicle state keyed by VIN.
    #[serde(default)]
    pub vehicles: BTreeMap<String, VehicleSnapshot>,
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct EmittedSoc {
    estimate: Option<f64>,
    testing: Option<f64>,
    rate: Option<f64>,
}

impl EmittedSoc {
    const fn of(soc: &SocTracking) -> Self {
        Self {
            estimate: soc.primary.estimated_percent,
            testing: soc.testing.estimated_percent,
            rate: soc.primary.rate_per_hour,
        }
    }
}

#[derive(Debug, Default)]
struct VehicleState {
    descriptors: BTreeMap<String, DescriptorState>,
    soc: SocTracking,
    emitted: EmittedSoc,
}

impl VehicleState {
    /// Overwrite the primary SOC descriptor with the estimate once it has
    /// drifted from the last authoritative reading. Returns `true` if the
    /// stored value changed.
    fn mirror_estimate(&mut self) -> bool {
        let (Some(estimate), Some(authoritative)) =
            (self.soc.estimated_percent(), self.soc.last_soc_percent)
        else {
            return false;
        };
        if (estimate - authoritative).abs() <= SOC_MIRROR_THRESHOLD {
            return false;
        }
        let Some(state) = self.descriptors.get_mut(names::BATTERY_SOC) else {
            return false;
        };

        let rounded = (estimate * 10.0).round() / 10.0;
        if state.value.as_f64() == Some(rounded) {
            return false;
        }
        state.value = DescriptorValue::Number(rounded);
        true
    }

    /// Whether the SOC figures differ from the last announced ones. Marks
    /// the current figures as announced.
    fn take_soc_change(&mut self) -> bool {
        let current = EmittedSoc::of(&self.soc);
        if current == self.emitted {
            return false;
        }
        self.emitted = current;
        true
    }
}

#[derive(Debug, Default)]
struct Inner {
    vehicles: BTreeMap<String, VehicleState>,
    connection_status: Option<ConnectionState>,
    connection_reason: Option<String>,
    last_message_at: Option<DateTime<Utc>>,
    messages_processed: u64,
    last_diagnostics: Option<DiagnosticsSnapshot>,
}

impl Inner {
    fn diagnostics(&self) -> DiagnosticsSnapshot {
        let vehicles = self
            .vehicles
            .iter()
            .map(|(vin, vehicle)| {
                (
                    vin.clone(),
                    VehicleDiagnostics {
                        soc_estimate: vehicle.soc.estimated_percent(),
                        soc_estimate_testing: vehicle.soc.testing_percent(),
                        soc_rate: vehicle.soc.rate_per_hour(),
                        charging_active: vehicle.soc.charging_active,
                        descriptors: vehicle.descriptors.len(),
                    },
                )
            })
            .collect();

        DiagnosticsSnapshot {
            connection_status: self.connection_status,
            connection_reason: self.connection_reason.clone(),
            last_message_at: self.last_message_at,
            messages_processed: self.messages_processed,
            tracked_vehicles: self.vehicles.len(),
            descriptor_count: self.descriptor_count(),
            vehicles,
        }
    }

    fn descriptor_count(&self) -> usize {
        self.vehicles.values().map(|v| v.descriptors.len()).sum()
    }
}

/// Notifications collected under the lock, sent after it is released.
#[derive(Debug, Default)]
struct Pending {
    updates: Vec<(String, String)>,
    new_sensors: Vec<(String, String)>,
    new_binaries: Vec<(String, String)>,
    soc: Vec<String>,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Descriptor store plus SOC estimation for all vehicles of one account.
#[derive(Debug)]
pub struct StateCoordinator {
    inner: Mutex<Inner>,
    events: SharedEventHub,
    config: CoordinatorConfig,
}

impl StateCoordinator {
    /// Create an empty coordinator publishing to `events`.
    #[must_use]
    pub fn new(events: SharedEventHub, config: CoordinatorConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            config,
        }
    }

    /// The hub notifications are published to.
    #[must_use]
    pub fn events(&self) -> &SharedEventHub {
        &self.events
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Apply one telemetry message.
    ///
    /// `data` maps descriptor names to `{value, unit, timestamp}` objects.
    /// Messages with an empty VIN or a non-object `data` are ignored.
    pub fn handle_message(&self, vin: &str, data: &Value) {
        self.handle_message_at(vin, data, Utc::now());
    }

    /// [`Self::handle_message`] with an explicit clock.
    pub fn handle_message_at(&self, vin: &str, data: &Value, now: DateTime<Utc>) {
        let Some(descriptors) = data.as_object() else {
            metrics::record_message_dropped(DropReason::Incomplete);
            return;
        };
        if vin.is_empty() {
            metrics::record_message_dropped(DropReason::Incomplete);
            return;
        }

        let started = Instant::now();
        let mut pending = Pending::default();
        let (diagnostics, vehicles, descriptor_count) = {
            let mut inner = self.inner.lock();
            inner.messages_processed += 1;
            inner.last_message_at = Some(now);

            let vehicle = inner.vehicles.entry(vin.to_string()).or_default();
            for (name, payload) in descriptors {
                let Some(reading) = DescriptorReading::from_json(payload) else {
                    continue;
                };
                route_to_estimator(&mut vehicle.soc, name, &reading, now);

                let Some(value) = reading.value else {
                    continue;
                };
                let is_new = !vehicle.descriptors.contains_key(name);
                let kind = if value.is_bool() {
                    DescriptorKind::Binary
                } else {
                    DescriptorKind::Sensor
                };
                vehicle.descriptors.insert(
                    name.clone(),
                    DescriptorState {
                        value,
                        unit: reading.unit,
                        timestamp: reading.timestamp,
                    },
                );

                pending.updates.push((vin.to_string(), name.clone()));
                if is_new {
                    match kind {
                        DescriptorKind::Sensor => pending.new_sensors.push((vin.to_string(), name.clone())),
                        DescriptorKind::Binary => pending.new_binaries.push((vin.to_string(), name.clone())),
                    }
                }
            }

            vehicle.soc.advance(now);
            if vehicle.mirror_estimate() {
                pending
                    .updates
                    .push((vin.to_string(), names::BATTERY_SOC.to_string()));
            }
            if vehicle.take_soc_change() {
                pending.soc.push(vin.to_string());
            }

            let diagnostics = inner.diagnostics();
            inner.last_diagnostics = Some(diagnostics.clone());
            (diagnostics, inner.vehicles.len(), inner.descriptor_count())
        };

        metrics::record_processing_duration(started.elapsed());
        metrics::set_tracked_state(vehicles, descriptor_count);
        tracing::trace!(vin = %vin, descriptors = descriptors.len(), "Applied telemetry message");

        self.publish(pending);
        self.publish_diagnostics(diagnostics);
    }

    /// Record a connection state change and re-emit diagnostics.
    pub fn handle_connection_event(&self, status: ConnectionState, reason: Option<String>) {
        let diagnostics = {
            let mut inner = self.inner.lock();
            inner.connection_status = Some(status);
            inner.connection_reason.clone_from(&reason);
            let diagnostics = inner.diagnostics();
            inner.last_diagnostics = Some(diagnostics.clone());
            diagnostics
        };

        tracing::debug!(status = %status, reason = ?reason, "Connection event");
        self.events.send_connection(status, reason);
        self.publish_diagnostics(diagnostics);
    }

    /// Advance every vehicle's estimator to `now`.
    ///
    /// Notifications are only sent for values that actually changed, and
    /// diagnostics only when the snapshot differs from the last one sent.
    pub fn refresh_estimates(&self, now: DateTime<Utc>) {
        let mut pending = Pending::default();
        let diagnostics = {
            let mut inner = self.inner.lock();
            for (vin, vehicle) in &mut inner.vehicles {
                vehicle.soc.advance(now);
                if vehicle.mirror_estimate() {
                    pending
                        .updates
                        .push((vin.clone(), names::BATTERY_SOC.to_string()));
                }
                if vehicle.take_soc_change() {
                    pending.soc.push(vin.clone());
                }
            }

            let diagnostics = inner.diagnostics();
            if inner.last_diagnostics.as_ref() == Some(&diagnostics) {
                None
            } else {
                inner.last_diagnostics = Some(diagnostics.clone());
                Some(diagnostics)
            }
        };

        self.publish(pending);
        if let Some(diagnostics) = diagnostics {
            self.publish_diagnostics(diagnostics);
        }
    }

    /// Run [`Self::refresh_estimates`] every `interval` until `cancel` fires.
    pub fn spawn_watchdog(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("SOC watchdog stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        coordinator.refresh_estimates(Utc::now());
                    }
                }
            }
        })
    }

    fn publish(&self, pending: Pending) {
        for (vin, descriptor) in &pending.updates {
            self.events.send_update(vin, descriptor);
        }
        for (vin, descriptor) in &pending.new_sensors {
            self.events
                .send_new_descriptor(vin, descriptor, DescriptorKind::Sensor);
        }
        for (vin, descriptor) in &pending.new_binaries {
            self.events
                .send_new_descriptor(vin, descriptor, DescriptorKind::Binary);
        }
        for vin in &pending.soc {
            self.events.send_soc_estimate(vin);
        }
    }

    fn publish_diagnostics(&self, diagnostics: DiagnosticsSnapshot) {
        if self.config.debug_log {
            tracing::info!(
                status = ?diagnostics.connection_status,
                reason = ?diagnostics.connection_reason,
                messages = diagnostics.messages_processed,
                vehicles = diagnostics.tracked_vehicles,
                descriptors = diagnostics.descriptor_count,
                "Coordinator diagnostics"
            );
        }
        self.events.send_diagnostics(diagnostics);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Latest stored value of a descriptor.
    #[must_use]
    pub fn get_state(&self, vin: &str, descriptor: &str) -> Option<DescriptorState> {
        self.inner
            .lock()
            .vehicles
            .get(vin)?
            .descriptors
            .get(descriptor)
            .cloned()
    }

    /// Primary SOC estimate (%).
    #[must_use]
    pub fn get_soc_estimate(&self, vin: &str) -> Option<f64> {
        self.inner.lock().vehicles.get(vin)?.soc.estimated_percent()
    }

    /// Net-of-house-load SOC estimate (%).
    #[must_use]
    pub fn get_testing_soc_estimate(&self, vin: &str) -> Option<f64> {
        self.inner.lock().vehicles.get(vin)?.soc.testing_percent()
    }

    /// Charging rate (%/h).
    #[must_use]
    pub fn get_soc_rate(&self, vin: &str) -> Option<f64> {
        self.inner.lock().vehicles.get(vin)?.soc.rate_per_hour()
    }

    /// Snapshot of `(vin, descriptor)` pairs whose stored value is (or is
    /// not) boolean.
    pub fn iter_descriptors(&self, binary: bool) -> impl Iterator<Item = (String, String)> {
        let pairs: Vec<(String, String)> = self
            .inner
            .lock()
            .vehicles
            .iter()
            .flat_map(|(vin, vehicle)| {
                vehicle
                    .descriptors
                    .iter()
                    .filter(move |(_, state)| state.value.is_bool() == binary)
                    .map(move |(name, _)| (vin.clone(), name.clone()))
            })
            .collect();
        pairs.into_iter()
    }

    /// VINs with stored state.
    #[must_use]
    pub fn vins(&self) -> Vec<String> {
        self.inner.lock().vehicles.keys().cloned().collect()
    }

    /// Current diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.inner.lock().diagnostics()
    }

    // =========================================================================
    // Restoration
    // =========================================================================

    /// Seed the primary estimator from a cached value when no live estimate
    /// exists.
    pub fn restore_soc_cache(
        &self,
        vin: &str,
        estimate: Option<f64>,
        rate: Option<f64>,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let mut inner = self.inner.lock();
        let vehicle = inner.vehicles.entry(vin.to_string()).or_default();
        vehicle.soc.restore(estimate, rate, timestamp);
        vehicle.emitted = EmittedSoc::of(&vehicle.soc);
    }

    /// Seed the testing estimator from a cached value when no live estimate
    /// exists.
    pub fn restore_testing_soc_cache(
        &self,
        vin: &str,
        estimate: Option<f64>,
        rate: Option<f64>,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let mut inner = self.inner.lock();
        let vehicle = inner.vehicles.entry(vin.to_string()).or_default();
        vehicle.soc.restore_testing(estimate, rate, timestamp);
        vehicle.emitted = EmittedSoc::of(&vehicle.soc);
    }

    /// Persistable copy of all descriptor values and SOC caches.
    #[must_use]
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let inner = self.inner.lock();
        let vehicles = inner
            .vehicles
            .iter()
            .map(|(vin, vehicle)| {
                (
                    vin.clone(),
                    VehicleSnapshot {
                        descriptors: vehicle.descriptors.clone(),
                        soc: cache_of(&vehicle.soc.primary),
                        soc_testing: cache_of(&vehicle.soc.testing),
                    },
                )
            })
            .collect();
        CoordinatorSnapshot { vehicles }
    }

    /// Restore descriptor values and SOC caches.
    ///
    /// Capacity and target are replayed into the estimator, then the SOC
    /// caches; the SOC descriptor seeds the baseline only if no cache did.
    /// Charging inputs (power, AC values, status) are not replayed, so
    /// nothing is extrapolated across downtime until fresh telemetry
    /// arrives. No notifications are sent.
    pub fn restore(&self, snapshot: CoordinatorSnapshot, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        for (vin, saved) in snapshot.vehicles {
            let vehicle = inner.vehicles.entry(vin).or_default();
            for (name, state) in saved.descriptors {
                vehicle.descriptors.entry(name).or_insert(state);
            }

            if let Some(state) = vehicle.descriptors.get(names::BATTERY_SIZE_MAX)
                && let Some(capacity) = state.value.as_f64()
            {
                let kwh = energy_to_kwh(capacity, state.unit.as_deref());
                vehicle.soc.update_capacity(Some(kwh), now);
            }
            if let Some(target) = vehicle
                .descriptors
                .get(names::TARGET_SOC)
                .and_then(|s| s.value.as_f64())
            {
                vehicle.soc.update_target(Some(target), now);
            }

            if let Some(cache) = saved.soc {
                vehicle
                    .soc
                    .restore(Some(cache.estimate), cache.rate, cache.timestamp);
            }
            if let Some(cache) = saved.soc_testing {
                vehicle
                    .soc
                    .restore_testing(Some(cache.estimate), cache.rate, cache.timestamp);
            }

            if vehicle.soc.estimated_percent().is_none()
                && let Some((percent, sampled_at)) = baseline_reading(&vehicle.descriptors)
            {
                vehicle.soc.update_soc(percent, sampled_at, now);
            }
            vehicle.emitted = EmittedSoc::of(&vehicle.soc);
        }
    }

    /// Save a snapshot to `store`. Failures are logged.
    pub async fn persist(&self, store: &dyn BlobStore) {
        let snapshot = self.snapshot();
        let data = match serde_json::to_value(&snapshot) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize coordinator state");
                return;
            }
        };
        match store.save(data).await {
            Ok(()) => tracing::debug!(vehicles = snapshot.vehicles.len(), "Coordinator state saved"),
            Err(e) => tracing::error!(error = %e, "Failed to persist coordinator state"),
        }
    }

    /// Load and restore a snapshot from `store`. Returns the number of
    /// vehicles restored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store fails or holds an unreadable
    /// snapshot.
    pub async fn load(&self, store: &dyn BlobStore) -> Result<usize, StoreError> {
        let Some(data) = store.load().await? else {
            return Ok(0);
        };
        let snapshot: CoordinatorSnapshot = serde_json::from_value(Value::Object(data))
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        let count = snapshot.vehicles.len();
        self.restore(snapshot, Utc::now());
        Ok(count)
    }
}

// =============================================================================
// Estimator Routing
// =============================================================================

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw?)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn route_to_estimator(soc: &mut SocTracking, name: &str, reading: &DescriptorReading, now: DateTime<Utc>) {
    let unit = reading.unit.as_deref();
    match name {
        _ if names::SOC_READINGS.contains(&name) => {
            if let Some(percent) = reading.number() {
                soc.update_soc(percent, parse_timestamp(reading.timestamp.as_deref()), now);
            }
        }
        names::BATTERY_SIZE_MAX => {
            if let Some(capacity) = reading.number() {
                soc.update_capacity(Some(energy_to_kwh(capacity, unit)), now);
            }
        }
        names::CHARGING_POWER => {
            let watts = reading.number().map(|p| power_to_watts(p, unit, "W"));
            soc.update_input(ChargingInput::DirectPower, watts, now);
        }
        names::AC_VOLTAGE => soc.update_input(ChargingInput::AcVoltage, reading.number(), now),
        names::AC_CURRENT => soc.update_input(ChargingInput::AcCurrent, reading.number(), now),
        names::AC_PHASES => soc.update_input(ChargingInput::AcPhases, reading.number(), now),
        names::CHARGING_STATUS | names::HV_STATUS => {
            if let Some(status) = reading.value.as_ref().and_then(DescriptorValue::as_text) {
                soc.update_charging_status(Some(status), now);
            }
        }
        names::TARGET_SOC => soc.update_target(reading.number(), now),
        names::AUX_POWER => {
            let watts = reading.number().map(|p| power_to_watts(p, unit, "kW"));
            soc.update_input(ChargingInput::AuxPower, watts, now);
        }
        _ => {}
    }
}

fn baseline_reading(
    descriptors: &BTreeMap<String, DescriptorState>,
) -> Option<(f64, Option<DateTime<Utc>>)> {
    names::SOC_READINGS.iter().find_map(|name| {
        let state = descriptors.get(*name)?;
        Some((
            state.value.as_f64()?,
            parse_timestamp(state.timestamp.as_deref()),
        ))
    })
}

fn cache_of(extrapolation: &Extrapolation) -> Option<SocCache> {
    Some(SocCache {
        estimate: extrapolation.estimated_percent?,
        rate: extrapolation.rate_per_hour,
        timestamp: extrapolation.last_estimate_time,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;
    use crate::infrastructure::events::EventHub;
    use crate::infrastructure::persistence::InMemoryBlobStore;

    const VIN: &str = "WBA00000000000001";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 29, 12, 0, 0).unwrap()
    }

    fn coordinator() -> StateCoordinator {
        StateCoordinator::new(Arc::new(EventHub::with_defaults()), CoordinatorConfig::default())
    }

    fn entry(value: Value, unit: Option<&str>) -> Value {
        json!({"value": value, "unit": unit, "timestamp": "2025-09-29T12:00:00Z"})
    }

    #[test]
    fn ignores_empty_vin_and_non_object_data() {
        let coordinator = coordinator();
        coordinator.handle_message_at("", &json!({"a": entry(json!(1), None)}), t0());
        coordinator.handle_message_at(VIN, &json!([1, 2]), t0());
        assert!(coordinator.vins().is_empty());
        assert_eq!(coordinator.diagnostics().messages_processed, 0);
    }

    #[test]
    fn stores_values_with_normalized_units() {
        let coordinator = coordinator();
        coordinator.handle_message_at(
            VIN,
            &json!({"vehicle.cabin.hvac.temp": entry(json!(21.5), Some(" celsius "))}),
            t0(),
        );

        let state = coordinator.get_state(VIN, "vehicle.cabin.hvac.temp").unwrap();
        assert_eq!(state.value, DescriptorValue::Number(21.5));
        assert_eq!(state.unit.as_deref(), Some("celsius"));
        assert_eq!(state.timestamp.as_deref(), Some("2025-09-29T12:00:00Z"));
    }

    #[test]
    fn null_never_erases_stored_value() {
        let coordinator = coordinator();
        let name = "vehicle.body.trunk.isOpen";
        coordinator.handle_message_at(VIN, &json!({name: entry(json!(true), None)}), t0());
        coordinator.handle_message_at(VIN, &json!({name: entry(Value::Null, None)}), t0());

        assert_eq!(
            coordinator.get_state(VIN, name).unwrap().value,
            DescriptorValue::Bool(true)
        );
    }

    #[test]
    fn non_object_descriptor_payload_is_skipped() {
        let coordinator = coordinator();
        coordinator.handle_message_at(VIN, &json!({"a.b": 5, "c.d": entry(json!(1), None)}), t0());
        assert!(coordinator.get_state(VIN, "a.b").is_none());
        assert!(coordinator.get_state(VIN, "c.d").is_some());
    }

    #[tokio::test]
    async fn new_descriptor_notified_once() {
        let coordinator = coordinator();
        let mut new_rx = coordinator.events().new_descriptors_rx();
        let mut updates_rx = coordinator.events().updates_rx();
        let message = json!({
            "vehicle.isMoving": entry(json!(true), None),
            "vehicle.travelledDistance": entry(json!(1200), Some("km")),
        });

        coordinator.handle_message_at(VIN, &message, t0());
        coordinator.handle_message_at(VIN, &message, t0());

        let first = new_rx.recv().await.unwrap();
        let second = new_rx.recv().await.unwrap();
        assert_eq!(first.kind, DescriptorKind::Sensor);
        assert_eq!(first.descriptor, "vehicle.travelledDistance");
        assert_eq!(second.kind, DescriptorKind::Binary);
        assert!(matches!(new_rx.try_recv(), Err(TryRecvError::Empty)));

        let mut updates = 0;
        while updates_rx.try_recv().is_ok() {
            updates += 1;
        }
        assert_eq!(updates, 4);
    }

    #[test]
    fn iter_descriptors_partitions_by_kind() {
        let coordinator = coordinator();
        coordinator.handle_message_at(
            VIN,
            &json!({
                "vehicle.isMoving": entry(json!(false), None),
                "vehicle.travelledDistance": entry(json!(1200), Some("km")),
                "vehicle.name": entry(json!("i4"), None),
            }),
            t0(),
        );

        let binary: Vec<_> = coordinator.iter_descriptors(true).collect();
        let sensors: Vec<_> = coordinator.iter_descriptors(false).collect();
        assert_eq!(binary, vec![(VIN.to_string(), "vehicle.isMoving".to_string())]);
        assert_eq!(sensors.len(), 2);
    }

    fn charging_message() -> Value {
        json!({
            (names::BATTERY_SIZE_MAX): entry(json!(50), Some("kWh")),
            (names::BATTERY_SOC): entry(json!(50), Some("%")),
            (names::CHARGING_POWER): entry(json!(25000), Some("W")),
            (names::CHARGING_STATUS): entry(json!("CHARGINGACTIVE"), None),
        })
    }

    #[test]
    fn watchdog_tick_extrapolates_to_full() {
        let coordinator = coordinator();
        coordinator.handle_message_at(VIN, &charging_message(), t0());
        assert_eq!(coordinator.get_soc_rate(VIN), Some(50.0));

        coordinator.refresh_estimates(t0() + chrono::Duration::seconds(3600));
        let estimate = coordinator.get_soc_estimate(VIN).unwrap();
        assert!((estimate - 100.0).abs() < 1e-9);
    }

    #[test]
    fn primary_soc_descriptor_mirrors_estimate() {
        let coordinator = coordinator();
        coordinator.handle_message_at(VIN, &charging_message(), t0());

        coordinator.refresh_estimates(t0() + chrono::Duration::minutes(6));
        let state = coordinator.get_state(VIN, names::BATTERY_SOC).unwrap();
        assert_eq!(state.value, DescriptorValue::Number(55.0));
        assert_eq!(state.unit.as_deref(), Some("%"));
    }

    #[test]
    fn small_drift_is_not_mirrored() {
        let coordinator = coordinator();
        coordinator.handle_message_at(VIN, &charging_message(), t0());

        // 50 %/h for 6 s is below the mirror threshold.
        coordinator.refresh_estimates(t0() + chrono::Duration::seconds(6));
        let state = coordinator.get_state(VIN, names::BATTERY_SOC).unwrap();
        assert_eq!(state.value, DescriptorValue::Number(50.0));
    }

    #[tokio::test]
    async fn watchdog_only_notifies_on_change() {
        let coordinator = coordinator();
        coordinator.handle_message_at(
            VIN,
            &json!({(names::BATTERY_SOC): entry(json!(60), Some("%"))}),
            t0(),
        );
        let mut soc_rx = coordinator.events().soc_rx();
        let mut diagnostics_rx = coordinator.events().diagnostics_rx();

        coordinator.refresh_estimates(t0() + chrono::Duration::minutes(1));
        coordinator.refresh_estimates(t0() + chrono::Duration::minutes(2));

        assert!(matches!(soc_rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(diagnostics_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn charging_tick_notifies_soc_change() {
        let coordinator = coordinator();
        coordinator.handle_message_at(VIN, &charging_message(), t0());
        let mut soc_rx = coordinator.events().soc_rx();

        coordinator.refresh_estimates(t0() + chrono::Duration::minutes(1));
        assert_eq!(soc_rx.recv().await.unwrap().vin, VIN);
    }

    #[test]
    fn null_power_stops_extrapolation() {
        let coordinator = coordinator();
        coordinator.handle_message_at(VIN, &charging_message(), t0());
        coordinator.handle_message_at(
            VIN,
            &json!({(names::CHARGING_POWER): entry(Value::Null, None)}),
            t0(),
        );
        assert_eq!(coordinator.get_soc_rate(VIN), None);

        coordinator.refresh_estimates(t0() + chrono::Duration::hours(1));
        assert_eq!(coordinator.get_soc_estimate(VIN), Some(50.0));
        // The stored power descriptor is untouched by the null.
        assert!(coordinator.get_state(VIN, names::CHARGING_POWER).is_some());
    }

    #[test]
    fn kilowatt_power_and_watt_hour_capacity_are_scaled() {
        let coordinator = coordinator();
        coordinator.handle_message_at(
            VIN,
            &json!({
                (names::BATTERY_SIZE_MAX): entry(json!(50000), Some("Wh")),
                (names::BATTERY_SOC): entry(json!(50), Some("%")),
                (names::CHARGING_POWER): entry(json!(11), Some("kW")),
                (names::HV_STATUS): entry(json!("CHARGING"), None),
            }),
            t0(),
        );
        assert_eq!(coordinator.get_soc_rate(VIN), Some(22.0));
    }

    #[test]
    fn unparsable_numbers_are_absent() {
        let coordinator = coordinator();
        coordinator.handle_message_at(
            VIN,
            &json!({
                (names::BATTERY_SIZE_MAX): entry(json!("unknown"), Some("kWh")),
                (names::BATTERY_SOC): entry(json!("n/a"), Some("%")),
            }),
            t0(),
        );
        assert_eq!(coordinator.get_soc_estimate(VIN), None);
        assert!(coordinator.get_state(VIN, names::BATTERY_SOC).is_some());
    }

    #[test]
    fn testing_estimate_subtracts_aux_power() {
        let coordinator = coordinator();
        let mut message = charging_message();
        message[names::AUX_POWER] = entry(json!(5), Some("kW"));
        coordinator.handle_message_at(VIN, &message, t0());

        coordinator.refresh_estimates(t0() + chrono::Duration::minutes(30));
        assert!((coordinator.get_soc_estimate(VIN).unwrap() - 75.0).abs() < 1e-9);
        assert!((coordinator.get_testing_soc_estimate(VIN).unwrap() - 70.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn connection_event_updates_diagnostics() {
        let coordinator = coordinator();
        let mut connection_rx = coordinator.events().connection_rx();

        coordinator.handle_connection_event(ConnectionState::Unauthorized, Some("rejected".into()));

        let event = connection_rx.recv().await.unwrap();
        assert_eq!(event.state, ConnectionState::Unauthorized);
        let diagnostics = coordinator.diagnostics();
        assert_eq!(diagnostics.connection_status, Some(ConnectionState::Unauthorized));
        assert_eq!(diagnostics.connection_reason.as_deref(), Some("rejected"));
    }

    #[test]
    fn restore_cache_only_when_empty() {
        let coordinator = coordinator();
        coordinator.restore_soc_cache(VIN, Some(42.0), Some(7.0), Some(t0()));
        assert_eq!(coordinator.get_soc_estimate(VIN), Some(42.0));

        coordinator.restore_soc_cache(VIN, Some(10.0), None, Some(t0()));
        assert_eq!(coordinator.get_soc_estimate(VIN), Some(42.0));

        coordinator.restore_testing_soc_cache(VIN, Some(41.0), None, Some(t0()));
        assert_eq!(coordinator.get_testing_soc_estimate(VIN), Some(41.0));
    }

    #[tokio::test]
    async fn persist_and_load_round_trip() {
        let store = InMemoryBlobStore::new();
        let source = coordinator();
        source.handle_message_at(VIN, &charging_message(), t0());
        source.refresh_estimates(t0() + chrono::Duration::minutes(30));
        source.persist(&store).await;

        let restored = coordinator();
        assert_eq!(restored.load(&store).await.unwrap(), 1);

        assert_eq!(
            restored.get_state(VIN, names::CHARGING_STATUS).unwrap().value,
            DescriptorValue::Text("CHARGINGACTIVE".to_string())
        );
        assert!((restored.get_soc_estimate(VIN).unwrap() - 75.0).abs() < 1e-9);
        // Charging inputs are not replayed: no rate, no extrapolation.
        assert_eq!(restored.get_soc_rate(VIN), None);
        restored.refresh_estimates(Utc::now());
        assert!((restored.get_soc_estimate(VIN).unwrap() - 75.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn load_from_empty_store_restores_nothing() {
        let store = InMemoryBlobStore::new();
        assert_eq!(coordinator().load(&store).await.unwrap(), 0);
    }

    #[test]
    fn restore_seeds_baseline_from_descriptor() {
        let mut snapshot = CoordinatorSnapshot::default();
        let mut vehicle = VehicleSnapshot::default();
        vehicle.descriptors.insert(
            names::BATTERY_SOC.to_string(),
            DescriptorState::new(
                DescriptorValue::Number(64.0),
                Some("%"),
                Some("2025-09-29T11:00:00Z".to_string()),
            ),
        );
        snapshot.vehicles.insert(VIN.to_string(), vehicle);

        let coordinator = coordinator();
        coordinator.restore(snapshot, t0());
        assert_eq!(coordinator.get_soc_estimate(VIN), Some(64.0));
    }

    #[tokio::test]
    async fn watchdog_stops_on_cancel() {
        let coordinator = Arc::new(coordinator());
        let cancel = CancellationToken::new();
        let handle = coordinator.spawn_watchdog(Duration::from_secs(3600), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
