//! Rolling-Window Call Quota
//!
//! [`QuotaRecord`] is the pure half of the quota manager: an ordered list of
//! call timestamps (seconds since the Unix epoch) with the limit and window
//! it is checked against. Persistence and locking live in the application
//! layer.
//!
//! Timestamps persisted by older releases may be numbers, numeric strings,
//! or ISO-8601 strings; [`QuotaRecord::from_persisted`] accepts all three.

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

/// Key of the timestamp list in the persisted blob.
pub const TIMESTAMPS_KEY: &str = "timestamps";

/// Default number of calls allowed per window.
pub const DEFAULT_REQUEST_LIMIT: usize = 50;

/// Default window length in seconds (24 hours).
pub const DEFAULT_REQUEST_WINDOW_SECS: f64 = 86_400.0;

/// Quota limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaConfig {
    /// Maximum calls inside one window.
    pub limit: usize,
    /// Window length in seconds.
    pub window_secs: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_REQUEST_LIMIT,
            window_secs: DEFAULT_REQUEST_WINDOW_SECS,
        }
    }
}

/// Outcome of a rejected claim.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exhausted {
    /// When the oldest counted call leaves the window.
    pub next_reset_epoch: f64,
}

/// Ordered call timestamps inside the rolling window.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaRecord {
    config: QuotaConfig,
    timestamps: VecDeque<f64>,
}

impl QuotaRecord {
    /// Create an empty record.
    #[must_use]
    pub const fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            timestamps: VecDeque::new(),
        }
    }

    /// Build a record from a persisted blob, dropping entries that cannot be
    /// read as a timestamp and sorting the rest.
    #[must_use]
    pub fn from_persisted(config: QuotaConfig, data: Option<&Map<String, Value>>) -> Self {
        let mut values: Vec<f64> = data
            .and_then(|d| d.get(TIMESTAMPS_KEY))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_timestamp).collect())
            .unwrap_or_default();
        values.sort_by(f64::total_cmp);

        Self {
            config,
            timestamps: values.into(),
        }
    }

    /// Serialize into the persisted blob shape.
    #[must_use]
    pub fn to_persisted(&self) -> Map<String, Value> {
        let timestamps = self
            .timestamps
            .iter()
            .filter_map(|ts| serde_json::Number::from_f64(*ts).map(Value::Number))
            .collect();
        let mut map = Map::new();
        map.insert(TIMESTAMPS_KEY.to_string(), Value::Array(timestamps));
        map
    }

    /// The limits this record enforces.
    #[must_use]
    pub const fn config(&self) -> QuotaConfig {
        self.config
    }

    /// Drop every timestamp at or before `now - window`.
    pub fn prune(&mut self, now: f64) {
        let cutoff = now - self.config.window_secs;
        while self.timestamps.front().is_some_and(|ts| *ts <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Prune, then record a call at `now` if the limit allows it.
    ///
    /// # Errors
    ///
    /// Returns [`Exhausted`] when the window is already full. Nothing is
    /// recorded in that case.
    pub fn try_claim(&mut self, now: f64) -> Result<(), Exhausted> {
        self.prune(now);
        if self.timestamps.len() >= self.config.limit {
            return Err(Exhausted {
                next_reset_epoch: self.oldest().unwrap_or(now) + self.config.window_secs,
            });
        }
        self.timestamps.push_back(now);
        Ok(())
    }

    /// Calls counted in the window ending at `now`.
    pub fn used(&mut self, now: f64) -> usize {
        self.prune(now);
        self.timestamps.len()
    }

    /// Calls still available in the window ending at `now`.
    pub fn remaining(&mut self, now: f64) -> usize {
        self.config.limit.saturating_sub(self.used(now))
    }

    /// When the oldest counted call leaves the window. `None` while below
    /// the limit.
    pub fn next_reset_epoch(&mut self, now: f64) -> Option<f64> {
        if self.used(now) < self.config.limit {
            return None;
        }
        self.oldest().map(|ts| ts + self.config.window_secs)
    }

    /// Counted timestamps, oldest first.
    #[must_use]
    pub fn timestamps(&self) -> Vec<f64> {
        self.timestamps.iter().copied().collect()
    }

    fn oldest(&self) -> Option<f64> {
        self.timestamps.front().copied()
    }
}

/// Read one persisted entry as epoch seconds.
fn parse_timestamp(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed.parse::<f64>().ok().or_else(|| parse_iso_epoch(trimmed))
        }
        _ => None,
    };
    parsed.filter(|ts| ts.is_finite())
}

#[allow(clippy::cast_precision_loss)]
fn parse_iso_epoch(raw: &str) -> Option<f64> {
    let millis = match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => parsed.timestamp_millis(),
        // Offset-less entries were written as UTC.
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()?
            .and_utc()
            .timestamp_millis(),
    };
    Some(millis as f64 / 1000.0)
}

/// Render an epoch as an RFC 3339 UTC string.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn epoch_to_iso(epoch: f64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis((epoch * 1000.0).round() as i64).map(|dt| dt.to_rfc3339())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    const DAY: f64 = 86_400.0;

    fn small(limit: usize) -> QuotaConfig {
        QuotaConfig {
            limit,
            window_secs: DAY,
        }
    }

    fn blob(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn defaults_match_upstream_limits() {
        let config = QuotaConfig::default();
        assert_eq!(config.limit, 50);
        assert!((config.window_secs - DAY).abs() < f64::EPSILON);
    }

    #[test]
    fn migrates_mixed_formats_sorted() {
        let data = blob(json!({
            "timestamps": [
                "2025-01-01T00:00:10Z",
                1_735_689_605.5,
                "1735689601",
                "garbage",
                null,
                "2025-01-01T00:00:20+00:00",
                "2025-01-01T00:00:30",
                "2025-01-01T00:00:40.123456"
            ]
        }));

        let record = QuotaRecord::from_persisted(small(50), Some(&data));
        assert_eq!(
            record.timestamps(),
            vec![
                1_735_689_601.0,
                1_735_689_605.5,
                1_735_689_610.0,
                1_735_689_620.0,
                1_735_689_630.0,
                1_735_689_640.123
            ]
        );
    }

    #[test]
    fn missing_blob_is_empty() {
        let record = QuotaRecord::from_persisted(small(50), None);
        assert!(record.timestamps().is_empty());

        let data = blob(json!({"other": 1}));
        let record = QuotaRecord::from_persisted(small(50), Some(&data));
        assert!(record.timestamps().is_empty());
    }

    #[test]
    fn prune_drops_entries_at_cutoff() {
        let data = blob(json!({"timestamps": [100.0, 200.0, 300.0]}));
        let mut record = QuotaRecord::from_persisted(small(50), Some(&data));

        record.prune(200.0 + DAY);
        assert_eq!(record.timestamps(), vec![300.0]);
    }

    #[test]
    fn claim_rejected_at_limit() {
        let mut record = QuotaRecord::new(small(3));
        let now = 1_000_000.0;
        for i in 0..3 {
            record.try_claim(now + f64::from(i)).unwrap();
        }

        let err = record.try_claim(now + 10.0).unwrap_err();
        assert!((err.next_reset_epoch - (now + DAY)).abs() < f64::EPSILON);
        assert_eq!(record.used(now + 10.0), 3);
        assert_eq!(record.remaining(now + 10.0), 0);
    }

    #[test]
    fn claim_allowed_after_window_rolls() {
        let mut record = QuotaRecord::new(small(1));
        record.try_claim(1000.0).unwrap();
        assert!(record.try_claim(1000.0 + DAY - 1.0).is_err());
        assert!(record.try_claim(1000.0 + DAY).is_ok());
    }

    #[test]
    fn next_reset_only_when_full() {
        let mut record = QuotaRecord::new(small(2));
        record.try_claim(500.0).unwrap();
        assert_eq!(record.next_reset_epoch(600.0), None);

        record.try_claim(700.0).unwrap();
        assert_eq!(record.next_reset_epoch(800.0), Some(500.0 + DAY));
    }

    #[test]
    fn persisted_shape_round_trips() {
        let mut record = QuotaRecord::new(small(5));
        record.try_claim(10.5).unwrap();
        record.try_claim(20.0).unwrap();

        let restored = QuotaRecord::from_persisted(small(5), Some(&record.to_persisted()));
        assert_eq!(restored, record);
    }

    #[test]
    fn iso_rendering_is_utc() {
        assert_eq!(
            epoch_to_iso(1_735_689_600.0).as_deref(),
            Some("2025-01-01T00:00:00+00:00")
        );
    }

    proptest! {
        #[test]
        fn window_never_exceeds_limit(
            limit in 1usize..20,
            gaps in proptest::collection::vec(0.0f64..20_000.0, 1..200),
        ) {
            let mut record = QuotaRecord::new(small(limit));
            let mut now = 1_700_000_000.0;
            for gap in gaps {
                now += gap;
                let before = record.used(now);
                let outcome = record.try_claim(now);
                prop_assert_eq!(outcome.is_err(), before >= limit);
                prop_assert!(record.used(now) <= limit);
            }
        }
    }
}
