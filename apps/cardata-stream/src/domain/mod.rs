//! Domain Layer - Telemetry values, SOC estimation and quota bookkeeping.
//!
//! Everything here is synchronous and clock-injected. No I/O, no locks,
//! no async runtime.

/// Stream connection states and one-shot notices.
pub mod connection;

/// Descriptor values, units and well-known descriptor names.
pub mod descriptor;

/// Rolling-window call quota record.
pub mod quota;

/// State-of-charge extrapolation.
pub mod soc;
