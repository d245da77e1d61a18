//! Blob Store Adapters
//!
//! Implementations of the [`BlobStore`] port:
//! - [`JsonFileStore`]: one pretty-printed JSON file per blob, replaced
//!   atomically through a temporary sibling file
//! - [`InMemoryBlobStore`]: process-local, for tests and ephemeral runs

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::application::ports::{Blob, BlobStore, StoreError};

// =============================================================================
// JSON File Store
// =============================================================================

/// Stores one JSON object in a file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Create a store backed by `path`. Parent directories are created on
    /// first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl BlobStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Blob>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(Value::Null) => Ok(None),
            Ok(other) => Err(StoreError::Malformed(format!(
                "expected a JSON object in {}, found {}",
                self.path.display(),
                json_kind(&other)
            ))),
            Err(e) => Err(StoreError::Malformed(format!(
                "{}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, data: Blob) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(&Value::Object(data))
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Process-local blob store.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    data: RwLock<Option<Blob>>,
}

impl InMemoryBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `data`.
    #[must_use]
    pub fn with_data(data: Blob) -> Self {
        Self {
            data: RwLock::new(Some(data)),
        }
    }

    /// Copy of the stored blob.
    #[must_use]
    pub fn snapshot(&self) -> Option<Blob> {
        self.data.read().clone()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn load(&self) -> Result<Option<Blob>, StoreError> {
        Ok(self.snapshot())
    }

    async fn save(&self, data: Blob) -> Result<(), StoreError> {
        *self.data.write() = Some(data);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
