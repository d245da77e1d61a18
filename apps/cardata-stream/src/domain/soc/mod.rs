//! State-of-Charge Estimation
//!
//! Upstream SOC readings arrive sparsely, often minutes apart while a
//! vehicle charges. [`SocTracking`] holds the latest authoritative reading
//! and extrapolates it forward from the reported charging power and battery
//! capacity, so consumers see a smooth percentage between pushes.
//!
//! # Design
//!
//! The estimator is pure and clock-injected: every mutating call takes the
//! current time, which keeps it deterministic under test. Two extrapolations
//! are kept per vehicle:
//! - the primary estimate, driven by the gross charging power
//! - a testing estimate, driven by charging power net of the reported
//!   auxiliary (house-load) draw
//!
//! The estimate clock only moves forward. An out-of-order `now` is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds per hour, for %/h rate arithmetic.
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Charging status values (normalized) that mean energy is flowing in.
const ACTIVE_CHARGING_STATUSES: &[&str] = &["CHARGINGACTIVE", "CHARGING"];

// =============================================================================
// Charging Status
// =============================================================================

/// Whether an upstream charging status string means the battery is charging.
///
/// Matching is case-insensitive and ignores `_` and spaces, so
/// `CHARGINGACTIVE`, `charging_active` and `Charging Active` all match.
#[must_use]
pub fn is_charging_status(status: &str) -> bool {
    let normalized: String = status
        .chars()
        .filter(|c| *c != '_' && !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    ACTIVE_CHARGING_STATUSES.contains(&normalized.as_str())
}

/// Charging rate in %/h for a power draw into a battery of the given size.
///
/// Returns `None` unless both inputs are known and the capacity is positive.
#[must_use]
pub fn charge_rate_per_hour(power_w: Option<f64>, capacity_kwh: Option<f64>) -> Option<f64> {
    let power_w = power_w?;
    let capacity_kwh = capacity_kwh.filter(|c| *c > 0.0)?;
    Some((power_w / 1000.0) / capacity_kwh * 100.0)
}

#[allow(clippy::cast_precision_loss)]
fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

// =============================================================================
// Extrapolation
// =============================================================================

/// A running extrapolated SOC value with its clock and rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Extrapolation {
    /// Current estimate (%).
    pub estimated_percent: Option<f64>,
    /// Time the estimate was last advanced to.
    pub last_estimate_time: Option<DateTime<Utc>>,
    /// Charging rate (%/h), `None` while not charging or unknown.
    pub rate_per_hour: Option<f64>,
}

impl Extrapolation {
    /// Restart the extrapolation from an authoritative value.
    pub fn reset(&mut self, percent: f64, at: DateTime<Utc>) {
        self.estimated_percent = Some(percent);
        self.last_estimate_time = Some(at);
    }

    /// Advance the estimate to `now`. Returns `true` if the value changed.
    ///
    /// The clock moves even when the value cannot (not charging, no rate).
    /// When a target is given and the previous estimate was at or below it,
    /// the result never crosses it.
    pub fn advance(&mut self, now: DateTime<Utc>, charging: bool, target: Option<f64>) -> bool {
        let Some(last) = self.last_estimate_time else {
            if self.estimated_percent.is_some() {
                self.last_estimate_time = Some(now);
            }
            return false;
        };
        if now < last {
            return false;
        }
        self.last_estimate_time = Some(now);

        let Some(previous) = self.estimated_percent else {
            return false;
        };
        let Some(rate) = self.rate_per_hour.filter(|r| *r != 0.0) else {
            return false;
        };
        if !charging {
            return false;
        }

        let increment = rate * elapsed_seconds(last, now) / SECONDS_PER_HOUR;
        let mut next = (previous + increment).clamp(0.0, 100.0);
        if let Some(target) = target
            && previous <= target
            && next > target
        {
            next = target;
        }

        self.estimated_percent = Some(next);
        (next - previous).abs() > f64::EPSILON
    }
}

// =============================================================================
// Inputs
// =============================================================================

/// A charging input that feeds the rate calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChargingInput {
    /// Directly reported charging power (W).
    DirectPower,
    /// AC charging voltage (V).
    AcVoltage,
    /// AC charging current (A).
    AcCurrent,
    /// AC phase count.
    AcPhases,
    /// Auxiliary house-load draw (W), subtracted for the testing estimate.
    AuxPower,
}

// =============================================================================
// SOC Tracking
// =============================================================================

/// Per-vehicle estimator state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SocTracking {
    /// Stored energy (kWh), derived from the estimate and the capacity.
    pub energy_kwh: Option<f64>,
    /// Usable battery capacity (kWh).
    pub max_energy_kwh: Option<f64>,
    /// Last authoritative SOC reading (%).
    pub last_soc_percent: Option<f64>,
    /// Time of the last authoritative SOC reading.
    pub last_update: Option<DateTime<Utc>>,
    /// Charging power used for the current rate (W).
    pub last_power_w: Option<f64>,
    /// When `last_power_w` was last recomputed.
    pub last_power_time: Option<DateTime<Utc>>,
    /// Derived from the charging status descriptors.
    pub charging_active: bool,
    /// Charge limit (%).
    pub target_soc_percent: Option<f64>,
    /// Gross-power extrapolation.
    pub primary: Extrapolation,
    /// Net-of-house-load extrapolation.
    pub testing: Extrapolation,
    direct_power_w: Option<f64>,
    ac_voltage_v: Option<f64>,
    ac_current_a: Option<f64>,
    ac_phases: Option<f64>,
    aux_power_w: Option<f64>,
}

impl SocTracking {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current primary estimate (%).
    #[must_use]
    pub const fn estimated_percent(&self) -> Option<f64> {
        self.primary.estimated_percent
    }

    /// Current primary rate (%/h).
    #[must_use]
    pub const fn rate_per_hour(&self) -> Option<f64> {
        self.primary.rate_per_hour
    }

    /// Current testing estimate (%).
    #[must_use]
    pub const fn testing_percent(&self) -> Option<f64> {
        self.testing.estimated_percent
    }

    /// Charging power in watts: the direct reading if present, otherwise
    /// voltage x current x phases when all three are known.
    #[must_use]
    pub fn charging_power_w(&self) -> Option<f64> {
        self.direct_power_w.or_else(|| {
            Some(self.ac_voltage_v? * self.ac_current_a? * self.ac_phases?)
        })
    }

    /// Record an authoritative SOC reading.
    ///
    /// Both extrapolations restart from `percent` at the sample time. A
    /// missing or future sample time is replaced by `now`.
    pub fn update_soc(&mut self, percent: f64, sampled_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        let at = sampled_at.filter(|ts| *ts <= now).unwrap_or(now);
        let percent = percent.clamp(0.0, 100.0);

        self.last_soc_percent = Some(percent);
        self.last_update = Some(at);
        self.primary.reset(percent, at);
        self.testing.reset(percent, at);
        self.refresh_energy();
    }

    /// Record the battery capacity (kWh). Non-positive values mean unknown.
    pub fn update_capacity(&mut self, kwh: Option<f64>, now: DateTime<Utc>) {
        self.advance(now);
        self.max_energy_kwh = kwh.filter(|c| *c > 0.0);
        self.recompute_rate(now);
        self.refresh_energy();
    }

    /// Record (or clear, with `None`) one charging input.
    pub fn update_input(&mut self, input: ChargingInput, value: Option<f64>, now: DateTime<Utc>) {
        self.advance(now);
        let slot = match input {
            ChargingInput::DirectPower => &mut self.direct_power_w,
            ChargingInput::AcVoltage => &mut self.ac_voltage_v,
            ChargingInput::AcCurrent => &mut self.ac_current_a,
            ChargingInput::AcPhases => &mut self.ac_phases,
            ChargingInput::AuxPower => &mut self.aux_power_w,
        };
        *slot = value;
        self.recompute_rate(now);
    }

    /// Record a charging status string. `None` means not charging.
    pub fn update_charging_status(&mut self, status: Option<&str>, now: DateTime<Utc>) {
        self.advance(now);
        self.charging_active = status.is_some_and(is_charging_status);
        self.recompute_rate(now);
    }

    /// Record (or clear) the charge limit.
    pub fn update_target(&mut self, percent: Option<f64>, now: DateTime<Utc>) {
        self.advance(now);
        self.target_soc_percent = percent;
    }

    /// Advance both extrapolations to `now`. Returns `true` if either changed.
    pub fn advance(&mut self, now: DateTime<Utc>) -> bool {
        let target = self.target_soc_percent;
        let primary = self.primary.advance(now, self.charging_active, target);
        let testing = self.testing.advance(now, self.charging_active, target);
        if primary {
            self.refresh_energy();
        }
        primary || testing
    }

    /// Seed the primary extrapolation from a cached value. No-op when a
    /// live estimate already exists. The cached rate is only adopted while
    /// charging is active; otherwise the rate stays unknown.
    pub fn restore(&mut self, estimate: Option<f64>, rate: Option<f64>, at: Option<DateTime<Utc>>) {
        let rate = rate.filter(|_| self.charging_active);
        Self::restore_into(&mut self.primary, estimate, rate, at);
        self.refresh_energy();
    }

    /// Seed the testing extrapolation from a cached value.
    pub fn restore_testing(
        &mut self,
        estimate: Option<f64>,
        rate: Option<f64>,
        at: Option<DateTime<Utc>>,
    ) {
        let rate = rate.filter(|_| self.charging_active);
        Self::restore_into(&mut self.testing, estimate, rate, at);
    }

    fn restore_into(
        slot: &mut Extrapolation,
        estimate: Option<f64>,
        rate: Option<f64>,
        at: Option<DateTime<Utc>>,
    ) {
        if slot.estimated_percent.is_some() {
            return;
        }
        let Some(estimate) = estimate else {
            return;
        };
        slot.estimated_percent = Some(estimate.clamp(0.0, 100.0));
        slot.last_estimate_time = at;
        if slot.rate_per_hour.is_none() {
            slot.rate_per_hour = rate;
        }
    }

    fn recompute_rate(&mut self, now: DateTime<Utc>) {
        let power = if self.charging_active {
            self.charging_power_w()
        } else {
            None
        };
        self.last_power_w = power;
        self.last_power_time = power.map(|_| now);

        self.primary.rate_per_hour = charge_rate_per_hour(power, self.max_energy_kwh);
        let net = power.map(|p| (p - self.aux_power_w.unwrap_or(0.0)).max(0.0));
        self.testing.rate_per_hour = charge_rate_per_hour(net, self.max_energy_kwh);
    }

    fn refresh_energy(&mut self) {
        self.energy_kwh = match (self.primary.estimated_percent, self.max_energy_kwh) {
            (Some(percent), Some(capacity)) => Some(capacity * percent / 100.0),
            _ => None,
        };
    }
}

// =============================================================================
// Tests
// =============================================================================
