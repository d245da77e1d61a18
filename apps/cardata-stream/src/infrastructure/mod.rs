//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the operational surface.

/// CarData MQTT streaming adapter.
pub mod cardata;

/// Configuration loading.
pub mod config;

/// Broadcast channels for coordinator notifications.
pub mod events;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Blob store adapters (JSON file, in-memory).
pub mod persistence;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
