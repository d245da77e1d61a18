//! Coordinator Scenario Integration Tests
//!
//! End-to-end telemetry flows through the public coordinator API:
//! ingestion, SOC extrapolation, notifications and restart recovery.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::TryRecvError;

use cardata_stream::domain::descriptor::names;
use cardata_stream::infrastructure::events::DescriptorKind;
use cardata_stream::{
    ConnectionState, CoordinatorConfig, DescriptorValue, EventHub, JsonFileStore, StateCoordinator,
};

const VIN: &str = "WBA00000000000042";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 1, 8, 0, 0).unwrap()
}

fn coordinator() -> StateCoordinator {
    StateCoordinator::new(Arc::new(EventHub::default()), CoordinatorConfig::default())
}

fn reading(value: Value, unit: Option<&str>, at: DateTime<Utc>) -> Value {
    json!({"value": value, "unit": unit, "timestamp": at.to_rfc3339()})
}

fn close(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() < 1e-6
}

#[test]
fn charging_for_an_hour_clamps_at_full() {
    let coordinator = coordinator();
    coordinator.handle_message_at(
        VIN,
        &json!({
            (names::BATTERY_SIZE_MAX): reading(json!(50), Some("kWh"), t0()),
            (names::BATTERY_SOC): reading(json!(50), Some("%"), t0()),
            (names::CHARGING_POWER): reading(json!(25_000), Some("W"), t0()),
            (names::CHARGING_STATUS): reading(json!("CHARGINGACTIVE"), None, t0()),
        }),
        t0(),
    );

    assert_eq!(coordinator.get_soc_rate(VIN), Some(50.0));

    coordinator.refresh_estimates(t0() + Duration::minutes(30));
    assert!(close(coordinator.get_soc_estimate(VIN).unwrap(), 75.0));

    coordinator.refresh_estimates(t0() + Duration::seconds(3_600));
    let estimate = coordinator.get_soc_estimate(VIN).unwrap();
    assert!(close(estimate, 100.0), "estimate {estimate}");

    coordinator.refresh_estimates(t0() + Duration::hours(3));
    assert!(coordinator.get_soc_estimate(VIN).unwrap() <= 100.0);

    let mirrored = coordinator.get_state(VIN, names::BATTERY_SOC).unwrap();
    assert_eq!(mirrored.value, DescriptorValue::Number(100.0));
}

#[test]
fn ac_inputs_derive_power_when_direct_power_is_missing() {
    let coordinator = coordinator();
    coordinator.handle_message_at(
        VIN,
        &json!({
            (names::BATTERY_SIZE_MAX): reading(json!(50), Some("kWh"), t0()),
            (names::BATTERY_SOC): reading(json!(40), Some("%"), t0()),
            (names::AC_VOLTAGE): reading(json!(230), Some("V"), t0()),
            (names::AC_CURRENT): reading(json!(16), Some("A"), t0()),
            (names::AC_PHASES): reading(json!(3), None, t0()),
            (names::HV_STATUS): reading(json!("Charging"), None, t0()),
        }),
        t0(),
    );

    // 230 V * 16 A * 3 = 11.04 kW into 50 kWh.
    assert!(close(coordinator.get_soc_rate(VIN).unwrap(), 22.08));

    // Losing one AC input makes the rate unknown again.
    coordinator.handle_message_at(
        VIN,
        &json!({(names::AC_PHASES): reading(Value::Null, None, t0())}),
        t0(),
    );
    assert_eq!(coordinator.get_soc_rate(VIN), None);
}

#[test]
fn estimate_snaps_to_charge_target() {
    let coordinator = coordinator();
    coordinator.handle_message_at(
        VIN,
        &json!({
            (names::BATTERY_SIZE_MAX): reading(json!(50), Some("kWh"), t0()),
            (names::BATTERY_SOC): reading(json!(70), Some("%"), t0()),
            (names::TARGET_SOC): reading(json!(80), Some("%"), t0()),
            (names::CHARGING_POWER): reading(json!(25), Some("kW"), t0()),
            (names::CHARGING_STATUS): reading(json!("CHARGING_ACTIVE"), None, t0()),
        }),
        t0(),
    );

    coordinator.refresh_estimates(t0() + Duration::hours(1));
    assert!(close(coordinator.get_soc_estimate(VIN).unwrap(), 80.0));

    coordinator.refresh_estimates(t0() + Duration::hours(2));
    assert!(close(coordinator.get_soc_estimate(VIN).unwrap(), 80.0));
}

#[test]
fn baseline_above_lowered_target_is_not_pulled_down() {
    let coordinator = coordinator();
    coordinator.handle_message_at(
        VIN,
        &json!({
            (names::BATTERY_SIZE_MAX): reading(json!(50), Some("kWh"), t0()),
            (names::BATTERY_SOC): reading(json!(90), Some("%"), t0()),
            (names::TARGET_SOC): reading(json!(80), Some("%"), t0()),
            (names::CHARGING_POWER): reading(json!(5_000), Some("W"), t0()),
            (names::CHARGING_STATUS): reading(json!("CHARGINGACTIVE"), None, t0()),
        }),
        t0(),
    );
    assert!(close(coordinator.get_soc_estimate(VIN).unwrap(), 90.0));

    coordinator.refresh_estimates(t0() + Duration::minutes(30));
    assert!(close(coordinator.get_soc_estimate(VIN).unwrap(), 95.0));
}

#[test]
fn new_descriptors_are_announced_once() {
    let coordinator = coordinator();
    let mut new_rx = coordinator.events().new_descriptors_rx();
    let mut updates_rx = coordinator.events().updates_rx();
    let message = json!({
        "vehicle.body.chargingPort.isOpen": reading(json!(true), None, t0()),
        "vehicle.vehicle.travelledDistance": reading(json!(12_345), Some("km"), t0()),
    });

    coordinator.handle_message_at(VIN, &message, t0());
    coordinator.handle_message_at(VIN, &message, t0() + Duration::seconds(5));

    let mut kinds = vec![
        new_rx.try_recv().unwrap().kind,
        new_rx.try_recv().unwrap().kind,
    ];
    kinds.sort_by_key(|kind| matches!(kind, DescriptorKind::Binary));
    assert_eq!(kinds, vec![DescriptorKind::Sensor, DescriptorKind::Binary]);
    assert!(matches!(new_rx.try_recv(), Err(TryRecvError::Empty)));

    let mut updates = 0;
    while updates_rx.try_recv().is_ok() {
        updates += 1;
    }
    assert_eq!(updates, 4);

    let binary: Vec<_> = coordinator.iter_descriptors(true).collect();
    assert_eq!(
        binary,
        vec![(VIN.to_string(), "vehicle.body.chargingPort.isOpen".to_string())]
    );
}

#[test]
fn null_values_keep_display_state() {
    let coordinator = coordinator();
    let name = "vehicle.cabin.door.row1.driver.isOpen";
    coordinator.handle_message_at(VIN, &json!({name: reading(json!(false), None, t0())}), t0());
    coordinator.handle_message_at(
        VIN,
        &json!({name: reading(Value::Null, None, t0())}),
        t0() + Duration::seconds(1),
    );

    assert_eq!(
        coordinator.get_state(VIN, name).unwrap().value,
        DescriptorValue::Bool(false)
    );
}

#[test]
fn connection_events_show_up_in_diagnostics() {
    let coordinator = coordinator();
    let mut rx = coordinator.events().diagnostics_rx();

    coordinator.handle_connection_event(
        ConnectionState::Unauthorized,
        Some("not authorized".to_string()),
    );

    let snapshot = rx.try_recv().unwrap();
    assert_eq!(snapshot.connection_status, Some(ConnectionState::Unauthorized));
    assert_eq!(snapshot.connection_reason.as_deref(), Some("not authorized"));
}

#[tokio::test]
async fn restart_recovers_state_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("descriptor_state.json"));

    let before = coordinator();
    before.handle_message_at(
        VIN,
        &json!({
            (names::BATTERY_SIZE_MAX): reading(json!(80), Some("kWh"), t0()),
            (names::BATTERY_SOC): reading(json!(30), Some("%"), t0()),
            (names::TARGET_SOC): reading(json!(90), Some("%"), t0()),
            (names::CHARGING_POWER): reading(json!(40), Some("kW"), t0()),
            (names::CHARGING_STATUS): reading(json!("CHARGINGACTIVE"), None, t0()),
            "vehicle.cabin.infotainment.navigation.currentLocation.latitude":
                reading(json!(48.177), Some("degrees"), t0()),
        }),
        t0(),
    );
    before.refresh_estimates(t0() + Duration::minutes(30));
    let estimate = before.get_soc_estimate(VIN).unwrap();
    assert!(close(estimate, 55.0));
    before.persist(&store).await;

    let after = coordinator();
    assert_eq!(after.load(&store).await.unwrap(), 1);

    assert!(close(after.get_soc_estimate(VIN).unwrap(), estimate));
    assert_eq!(
        after
            .get_state(
                VIN,
                "vehicle.cabin.infotainment.navigation.currentLocation.latitude"
            )
            .unwrap()
            .value,
        DescriptorValue::Number(48.177)
    );

    // Charging state is not carried across the restart: no extrapolation
    // until fresh telemetry arrives.
    after.refresh_estimates(Utc::now());
    assert!(close(after.get_soc_estimate(VIN).unwrap(), estimate));

    // A fresh authoritative reading replaces the restored estimate.
    let now = Utc::now();
    after.handle_message_at(
        VIN,
        &json!({(names::BATTERY_SOC): reading(json!(61), Some("%"), now)}),
        now,
    );
    assert!(close(after.get_soc_estimate(VIN).unwrap(), 61.0));
}
