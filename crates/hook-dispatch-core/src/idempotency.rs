//! At-most-once admission of delivery ids.
//!
//! GitHub redelivers on timeouts and operators can redeliver by hand, so the
//! same delivery id may arrive several times. The guard admits an id exactly
//! once per TTL window, even when duplicates race each other.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::DeliveryId;

/// Default time an admitted delivery id is remembered.
pub const DEFAULT_IDEMPOTENCY_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting inside the TTL window; the caller owns the delivery.
    Admitted,
    /// Already admitted and not yet expired.
    Duplicate,
}

/// Remembered admission of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub first_seen_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl IdempotencyRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.first_seen_at + self.ttl
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Idempotency store failures.
///
/// The guard never admits a delivery it could not record, so callers must
/// turn these into an error response instead of continuing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyError {
    #[error("Idempotency store unavailable: {message}")]
    StoreUnavailable { message: String },
}

/// Backing storage for admitted keys.
///
/// `try_admit` must be an atomic check-and-set: among concurrent calls for the
/// same unexpired key exactly one returns `true`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Record `key` unless an unexpired record exists. Returns `true` when
    /// this call created the record.
    async fn try_admit(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyError>;

    /// Forget `key` so that a later delivery with the same id is admitted.
    async fn release(&self, key: &str) -> Result<(), IdempotencyError>;
}

/// Admits each delivery id at most once per TTL window.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn try_admit(&self, delivery_id: &DeliveryId) -> Result<Admission, IdempotencyError> {
        self.try_admit_at(delivery_id, Utc::now()).await
    }

    pub async fn try_admit_at(
        &self,
        delivery_id: &DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Admission, IdempotencyError> {
        let admitted = self
            .store
            .try_admit(delivery_id.as_str(), self.ttl, now)
            .await?;

        if admitted {
            Ok(Admission::Admitted)
        } else {
            debug!(delivery_id = %delivery_id, "Delivery already admitted");
            Ok(Admission::Duplicate)
        }
    }

    /// Undo an admission. Used when the delivery could be neither dispatched
    /// nor queued, so that GitHub's redelivery gets a fresh chance.
    pub async fn release(&self, delivery_id: &DeliveryId) -> Result<(), IdempotencyError> {
        self.store.release(delivery_id.as_str()).await
    }
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
