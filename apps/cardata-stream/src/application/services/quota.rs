//! API Quota Manager
//!
//! Enforces the rolling call budget of the companion REST API across every
//! call site, durably across restarts. Call sites `claim()` before issuing a
//! request and treat [`QuotaError::Exceeded`] as "skip this cycle".

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::application::ports::{BlobStore, StoreError};
use crate::domain::quota::{QuotaConfig, QuotaRecord, epoch_to_iso};
use crate::infrastructure::metrics::{self, ClaimOutcome};

/// Errors from the quota manager.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The window is full.
    #[error("API quota exhausted; next slot frees at epoch {next_reset_epoch}")]
    Exceeded {
        /// When the oldest counted call leaves the window.
        next_reset_epoch: f64,
    },

    /// Persisted quota could not be loaded.
    #[error("quota store failed: {0}")]
    Store(#[from] StoreError),
}

/// Current epoch seconds with millisecond resolution.
#[allow(clippy::cast_precision_loss)]
fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Rolling-window quota with a persisted backing copy.
pub struct QuotaManager {
    store: Arc<dyn BlobStore>,
    record: Mutex<QuotaRecord>,
    // Serializes prune-check-append-persist across concurrent claims.
    claim_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for QuotaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaManager")
            .field("record", &*self.record.lock())
            .finish_non_exhaustive()
    }
}

impl QuotaManager {
    /// Load, migrate, prune and persist the quota record.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Store`] if the persisted record cannot be
    /// loaded. A failed initial save is only logged.
    pub async fn create(store: Arc<dyn BlobStore>, config: QuotaConfig) -> Result<Self, QuotaError> {
        let data = store.load().await?;
        let mut record = QuotaRecord::from_persisted(config, data.as_ref());
        record.prune(now_epoch());

        tracing::info!(
            used = record.timestamps().len(),
            limit = config.limit,
            window_secs = config.window_secs,
            "Quota manager loaded"
        );

        let manager = Self {
            store,
            record: Mutex::new(record),
            claim_lock: tokio::sync::Mutex::new(()),
        };
        {
            let _guard = manager.claim_lock.lock().await;
            manager.persist().await;
        }
        Ok(manager)
    }

    /// Claim one call slot now.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Exceeded`] if the window is full.
    pub async fn claim(&self) -> Result<(), QuotaError> {
        self.claim_at(now_epoch()).await
    }

    /// Claim one call slot at the given epoch.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Exceeded`] if the window is full. A failed save
    /// after a successful claim is logged and the claim stands.
    pub async fn claim_at(&self, now: f64) -> Result<(), QuotaError> {
        let _guard = self.claim_lock.lock().await;

        let outcome = self.record.lock().try_claim(now);
        match outcome {
            Ok(()) => {
                metrics::record_quota_claim(ClaimOutcome::Granted);
                self.persist().await;
                Ok(())
            }
            Err(exhausted) => {
                metrics::record_quota_claim(ClaimOutcome::Rejected);
                tracing::warn!(
                    next_reset_epoch = exhausted.next_reset_epoch,
                    "API quota exhausted"
                );
                Err(QuotaError::Exceeded {
                    next_reset_epoch: exhausted.next_reset_epoch,
                })
            }
        }
    }

    /// Calls counted in the current window.
    #[must_use]
    pub fn used(&self) -> usize {
        self.record.lock().used(now_epoch())
    }

    /// Calls still available in the current window.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.record.lock().remaining(now_epoch())
    }

    /// When the oldest counted call leaves the window, once the limit is
    /// reached.
    #[must_use]
    pub fn next_reset_epoch(&self) -> Option<f64> {
        self.record.lock().next_reset_epoch(now_epoch())
    }

    /// [`Self::next_reset_epoch`] as an RFC 3339 UTC string.
    #[must_use]
    pub fn next_reset_iso(&self) -> Option<String> {
        self.next_reset_epoch().and_then(epoch_to_iso)
    }

    /// Configured limits.
    #[must_use]
    pub fn config(&self) -> QuotaConfig {
        self.record.lock().config()
    }

    /// Final prune and persist, for graceful shutdown.
    pub async fn close(&self) {
        let _guard = self.claim_lock.lock().await;
        self.record.lock().prune(now_epoch());
        self.persist().await;
        tracing::debug!("Quota manager closed");
    }

    async fn persist(&self) {
        let data = self.record.lock().to_persisted();
        if let Err(e) = self.store.save(data).await {
            tracing::error!(error = %e, "Failed to persist quota record");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
