//! Port Interfaces
//!
//! Contracts the application services depend on, implemented by
//! infrastructure adapters.
//!
//! ## Driven Ports (Outbound)
//!
//! - `BlobStore`: durable key-value blob used by the quota manager and the
//!   coordinator's state restoration

use async_trait::async_trait;
use serde_json::{Map, Value};

/// A persisted JSON object.
pub type Blob = Map<String, Value>;

/// Errors from a blob store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying I/O failed.
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Stored content is not a JSON object.
    #[error("stored data is malformed: {0}")]
    Malformed(String),

    /// Store backend rejected the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for a single JSON object.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Load the stored object, `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<Blob>, StoreError>;

    /// Replace the stored object.
    async fn save(&self, data: Blob) -> Result<(), StoreError>;
}
