//! Application Layer - Services and port definitions.
//!
//! The coordinator and the quota manager live here. They depend on the
//! domain layer and on the ports, never on a concrete storage adapter.

/// Port interfaces for external systems (blob storage).
pub mod ports;

/// State coordinator and quota manager.
pub mod services;
