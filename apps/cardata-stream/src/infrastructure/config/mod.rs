//! Configuration Module
//!
//! Environment-driven configuration for the stream consumer.

mod settings;

pub use settings::{AppConfig, ConfigError, ServerSettings, StateSettings, StreamSettings};
