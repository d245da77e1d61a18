#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )
)]

//! CarData Stream - Vehicle Telemetry Consumer
//!
//! Keeps one MQTT subscription to the CarData streaming broker, stores the
//! latest value of every telemetry descriptor per vehicle, extrapolates
//! battery state of charge between sparse updates, and enforces the rolling
//! daily quota of the companion REST API.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: descriptor values, SOC estimator, quota record, connection states
//!
//! - **Application**: use cases and port definitions
//!   - `ports`: blob storage interface
//!   - `services`: state coordinator, quota manager
//!
//! - **Infrastructure**: adapters and external integrations
//!   - `cardata`: MQTT stream manager
//!   - `events`: notification channels
//!   - `persistence`: JSON file and in-memory blob stores
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! CarData MQTT ──► StreamManager ──► dispatcher ──► StateCoordinator ──► EventHub
//!                       │                               │
//!                       └── status/notices ─────────────┘
//!                                                       │
//!                                          watchdog ────┘ (SOC extrapolation)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Pure telemetry, estimation and quota logic.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, StreamNotice};
pub use domain::descriptor::{DescriptorState, DescriptorValue};
pub use domain::quota::{QuotaConfig, QuotaRecord};
pub use domain::soc::SocTracking;

// Application
pub use application::ports::{Blob, BlobStore, StoreError};
pub use application::services::{
    CoordinatorConfig, CoordinatorSnapshot, QuotaError, QuotaManager, SocCache, StateCoordinator,
};

// Stream
pub use infrastructure::cardata::{
    CredentialUpdate, Credentials, StreamError, StreamManager, StreamManagerConfig,
};

// Infrastructure config
pub use infrastructure::config::{AppConfig, ConfigError};

// Notifications
pub use infrastructure::events::{EventHub, EventHubConfig, SharedEventHub};

// Persistence
pub use infrastructure::persistence::{InMemoryBlobStore, JsonFileStore};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
