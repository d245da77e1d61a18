//! Telemetry Descriptor Types
//!
//! A descriptor is a dotted path naming one telemetry signal
//! (`vehicle.drivetrain.batteryManagement.header`, ...). Upstream values are
//! dynamically typed, so every stored value is a [`DescriptorValue`] with
//! soft numeric coercion: a value that cannot be read as a number is simply
//! unknown, never an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Well-known Descriptors
// =============================================================================

/// Descriptor names the coordinator routes into the SOC estimator.
pub mod names {
    /// Primary battery state of charge (%), mirrored with the smoothed estimate.
    pub const BATTERY_SOC: &str = "vehicle.drivetrain.batteryManagement.header";
    /// Charging level reported by the charging subsystem (%).
    pub const CHARGING_LEVEL: &str = "vehicle.drivetrain.electricEngine.charging.level";
    /// Displayed state of charge (%).
    pub const DISPLAYED_SOC: &str = "vehicle.powertrain.electric.battery.stateOfCharge.displayed";
    /// Usable battery capacity (kWh).
    pub const BATTERY_SIZE_MAX: &str = "vehicle.drivetrain.batteryManagement.batterySizeMax";
    /// Directly reported charging power (W or kW).
    pub const CHARGING_POWER: &str = "vehicle.powertrain.electric.battery.charging.power";
    /// AC charging voltage (V).
    pub const AC_VOLTAGE: &str = "vehicle.drivetrain.electricEngine.charging.acVoltage";
    /// AC charging current (A).
    pub const AC_CURRENT: &str = "vehicle.drivetrain.electricEngine.charging.acAmpere";
    /// Number of AC phases in use.
    pub const AC_PHASES: &str = "vehicle.drivetrain.electricEngine.charging.phaseNumber";
    /// Charging status string (`CHARGINGACTIVE`, `NOCHARGING`, ...).
    pub const CHARGING_STATUS: &str = "vehicle.drivetrain.electricEngine.charging.status";
    /// High-voltage charging status string (`CHARGING`, `NOT_CHARGING`, ...).
    pub const HV_STATUS: &str = "vehicle.drivetrain.electricEngine.charging.hvStatus";
    /// Charge limit (%).
    pub const TARGET_SOC: &str = "vehicle.powertrain.electric.battery.stateOfCharge.target";
    /// Average auxiliary (house-load) power (kW).
    pub const AUX_POWER: &str = "vehicle.vehicle.avgAuxPower";

    /// Descriptors carrying an authoritative SOC reading.
    pub const SOC_READINGS: &[&str] = &[BATTERY_SOC, CHARGING_LEVEL, DISPLAYED_SOC];
}

// =============================================================================
// Descriptor Value
// =============================================================================

/// A single telemetry value as delivered upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DescriptorValue {
    /// Boolean flag (door open, plugged in, ...).
    Bool(bool),
    /// Numeric reading.
    Number(f64),
    /// Textual reading, frequently a number encoded as a string.
    Text(String),
    /// Nested structured record or list.
    Record(Value),
}

impl DescriptorValue {
    /// Convert a raw JSON value. `null` yields `None`: a null is a clearing
    /// signal, never a stored value.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => Some(Self::Record(value.clone())),
        }
    }

    /// Whether the value is a boolean.
    #[must_use]
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    /// Numeric reading of the value, if it has one.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n).filter(|n| n.is_finite()),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            Self::Bool(_) | Self::Record(_) => None,
        }
    }

    /// Textual reading of the value, if it has one.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

// =============================================================================
// Descriptor State
// =============================================================================

/// Latest known value of one descriptor for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorState {
    /// The value.
    pub value: DescriptorValue,
    /// Normalized unit, if any.
    pub unit: Option<String>,
    /// Upstream ISO-8601 timestamp, if any.
    pub timestamp: Option<String>,
}

impl DescriptorState {
    /// Create a new state, normalizing the unit.
    #[must_use]
    pub fn new(value: DescriptorValue, unit: Option<&str>, timestamp: Option<String>) -> Self {
        Self {
            value,
            unit: normalize_unit(unit),
            timestamp,
        }
    }
}

/// One descriptor entry from the wire, before the null check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptorReading {
    /// Value, `None` when upstream sent null or omitted it.
    pub value: Option<DescriptorValue>,
    /// Normalized unit.
    pub unit: Option<String>,
    /// Upstream timestamp.
    pub timestamp: Option<String>,
}

impl DescriptorReading {
    /// Parse a `{value, unit, timestamp}` object. Non-object payloads yield `None`.
    #[must_use]
    pub fn from_json(payload: &Value) -> Option<Self> {
        let object = payload.as_object()?;
        Some(Self {
            value: object.get("value").and_then(DescriptorValue::from_json),
            unit: normalize_unit(object.get("unit").and_then(Value::as_str)),
            timestamp: object
                .get("timestamp")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Numeric reading, treating unparsable values as absent.
    #[must_use]
    pub fn number(&self) -> Option<f64> {
        self.value.as_ref().and_then(DescriptorValue::as_f64)
    }
}

// =============================================================================
// Units
// =============================================================================

/// Raw unit strings mapped to canonical symbols (matched case-insensitively).
const UNIT_OVERRIDES: &[(&str, &str)] = &[("percent", "%")];

/// Return the canonical form of a unit string.
#[must_use]
pub fn normalize_unit(unit: Option<&str>) -> Option<String> {
    let stripped = unit?.trim();
    if stripped.is_empty() {
        return None;
    }

    let lowered = stripped.to_lowercase();
    UNIT_OVERRIDES
        .iter()
        .find(|(raw, _)| *raw == lowered)
        .map_or_else(|| Some(stripped.to_string()), |(_, canonical)| Some((*canonical).to_string()))
}

/// Convert a power reading to watts. Unknown units are taken as `default_unit`.
#[must_use]
pub fn power_to_watts(value: f64, unit: Option<&str>, default_unit: &str) -> f64 {
    match unit.unwrap_or(default_unit).to_lowercase().as_str() {
        "kw" => value * 1000.0,
        "mw" => value * 1_000_000.0,
        _ => value,
    }
}

/// Convert an energy reading to kilowatt-hours.
#[must_use]
pub fn energy_to_kwh(value: f64, unit: Option<&str>) -> f64 {
    match unit.map(str::to_lowercase).as_deref() {
        Some("wh") => value / 1000.0,
        Some("mwh") => value * 1000.0,
        _ => value,
    }
}

// =============================================================================
// Tests
// =============================================================================
