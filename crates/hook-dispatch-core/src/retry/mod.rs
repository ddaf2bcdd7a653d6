//! # Retry Pipeline
//!
//! Deliveries whose dispatch failed are parked in a [`RetryStore`] and
//! re-dispatched with exponential backoff by a background [`RetryWorker`].
//!
//! ```text
//! Pending(attempt=n) --dispatch ok-----------------> Succeeded (removed)
//! Pending(attempt=n) --dispatch failed, n+1 < max--> Pending(attempt=n+1, next=now+backoff(n+1))
//! Pending(attempt=n) --dispatch failed, n+1 = max--> DeadLettered(attempts=max)
//! DeadLettered       --replay----------------------> Pending(attempt=0)
//! ```
//!
//! `attempt` counts pipeline dispatches only; the inline dispatch performed
//! while the webhook request was open is not included. Dead-lettered entries
//! are never retried automatically. A dispatch error that cannot clear on its
//! own dead-letters the entry at once, see
//! [`DispatchError::is_transient`](crate::dispatch::DispatchError::is_transient).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::delivery::Delivery;
use crate::dispatch::DeliveryDispatcher;
use crate::DeliveryId;

mod worker;

pub use worker::RetryWorker;

// ============================================================================
// Backoff Policy
// ============================================================================

/// Exponential backoff without jitter: `base_delay * multiplier^n`, capped at
/// `max_delay`.
///
/// # Examples
///
/// ```rust
/// use hook_dispatch_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(10), 2.0);
///
/// assert_eq!(policy.backoff(0), Duration::from_secs(1));
/// assert_eq!(policy.backoff(3), Duration::from_secs(8));
/// assert_eq!(policy.backoff(4), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Pipeline dispatches before a delivery is dead-lettered.
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound on any delay
    pub max_delay: Duration,

    /// Growth factor per attempt (>= 1.0)
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier,
        }
    }

    /// Delay to wait after `attempt` pipeline dispatches have failed.
    ///
    /// Monotonically non-decreasing in `attempt` and deterministic.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Whether a delivery that has failed `attempts` pipeline dispatches gets another one.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

// ============================================================================
// Entries
// ============================================================================

/// One failed dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Pipeline attempt that failed; 0 is the inline dispatch.
    pub attempt: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// A delivery waiting for its next dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub delivery: Delivery,
    /// Pipeline dispatches performed so far.
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: String,
    pub failure_history: Vec<FailureRecord>,
}

impl RetryEntry {
    pub fn delivery_id(&self) -> &DeliveryId {
        &self.delivery.id
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }

    /// Fresh entry for a dead letter being replayed: attempt 0, due at `now`.
    /// The failure history is kept.
    pub fn replayed(dead_letter: DeadLetterEntry, now: DateTime<Utc>) -> Self {
        let last_error = dead_letter.last_error().unwrap_or_default().to_string();
        Self {
            delivery: dead_letter.delivery,
            attempt: 0,
            next_attempt_at: now,
            last_error,
            failure_history: dead_letter.failure_history,
        }
    }
}

/// A delivery that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub delivery: Delivery,
    pub attempts: u32,
    pub failure_history: Vec<FailureRecord>,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn delivery_id(&self) -> &DeliveryId {
        &self.delivery.id
    }

    pub fn last_error(&self) -> Option<&str> {
        self.failure_history.last().map(|f| f.error.as_str())
    }
}

// ============================================================================
// Store Port
// ============================================================================

/// Retry and dead-letter store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryStoreError {
    #[error("Retry store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Failed to (de)serialize retry entry: {message}")]
    Serialization { message: String },

    #[error("No dead-letter entry for delivery {delivery_id}")]
    NotFound { delivery_id: DeliveryId },
}

impl RetryStoreError {
    /// Whether the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Durable queue of [`RetryEntry`] and [`DeadLetterEntry`] records.
///
/// `dequeue_due` leases the entries it returns: they stay invisible to other
/// `dequeue_due` calls until the caller resolves them with `mark_succeeded`,
/// `enqueue` (reschedule) or `promote_to_dead_letter`, or hands them back
/// unchanged with `release`.
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Insert or replace the pending entry for the entry's delivery id.
    async fn enqueue(&self, entry: RetryEntry) -> Result<(), RetryStoreError>;

    /// Lease up to `limit` entries with `next_attempt_at <= now`, earliest first.
    async fn dequeue_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryEntry>, RetryStoreError>;

    /// Return the leased entry for `delivery_id` to the pending queue as it
    /// was leased. A no-op when the entry is not leased.
    async fn release(&self, delivery_id: &DeliveryId) -> Result<(), RetryStoreError>;

    /// Drop the leased entry for `delivery_id`.
    async fn mark_succeeded(&self, delivery_id: &DeliveryId) -> Result<(), RetryStoreError>;

    /// Drop the leased entry and store `entry` as a dead letter.
    async fn promote_to_dead_letter(&self, entry: DeadLetterEntry) -> Result<(), RetryStoreError>;

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, RetryStoreError>;

    async fn get_dead_letter(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<DeadLetterEntry>, RetryStoreError>;

    /// Move a dead letter back to the pending queue as a fresh entry with
    /// `attempt == 0`, due at `now`.
    ///
    /// # Errors
    ///
    /// `NotFound` when no dead letter exists for `delivery_id`.
    async fn replay(
        &self,
        delivery_id: &DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<RetryEntry, RetryStoreError>;

    /// Pending entries, leased ones included.
    async fn pending_count(&self) -> Result<usize, RetryStoreError>;
}

// ============================================================================
// Pipeline
// ============================================================================

/// What happened to one due entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryTransition {
    Succeeded,
    Rescheduled {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
    },
}

/// Counts from one sweep over due entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweepReport {
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Entries whose outcome could not be recorded; their leases were
    /// handed back to the store.
    pub errored: usize,
}

impl RetrySweepReport {
    pub fn processed(&self) -> usize {
        self.succeeded + self.rescheduled + self.dead_lettered
    }
}

/// Schedules, re-dispatches and escalates failed deliveries.
pub struct RetryPipeline {
    store: Arc<dyn RetryStore>,
    dispatcher: Arc<DeliveryDispatcher>,
    policy: RetryPolicy,
    /// Leases that could not be released yet.
    stranded: Mutex<Vec<DeliveryId>>,
}

impl RetryPipeline {
    pub fn new(
        store: Arc<dyn RetryStore>,
        dispatcher: Arc<DeliveryDispatcher>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            dispatcher,
            policy,
            stranded: Mutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a delivery whose inline dispatch failed.
    pub async fn enqueue_failed(
        &self,
        delivery: Delivery,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryEntry, RetryStoreError> {
        let entry = RetryEntry {
            next_attempt_at: now + to_chrono(self.policy.backoff(0)),
            attempt: 0,
            last_error: error.to_string(),
            failure_history: vec![FailureRecord {
                attempt: 0,
                error: error.to_string(),
                failed_at: now,
            }],
            delivery,
        };

        self.store.enqueue(entry.clone()).await?;
        info!(
            delivery_id = %entry.delivery.id,
            event = %entry.delivery.event_name,
            next_attempt_at = %entry.next_attempt_at,
            error = %error,
            "Delivery queued for retry"
        );
        Ok(entry)
    }

    /// Dispatch every entry due at `now`, up to `limit`, and record the result.
    ///
    /// A failure to record one entry's outcome does not stop the sweep: the
    /// entry's lease is released so a later sweep dispatches it again. A
    /// release that fails with a transient error is retried at the start of
    /// the next sweep.
    pub async fn process_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        shutdown: &CancellationToken,
    ) -> Result<RetrySweepReport, RetryStoreError> {
        self.release_stranded().await;

        let due = self.store.dequeue_due(now, limit).await?;
        let mut report = RetrySweepReport::default();

        for entry in due {
            let delivery_id = entry.delivery.id.clone();
            match self.process_entry(entry, now, shutdown).await {
                Ok(RetryTransition::Succeeded) => report.succeeded += 1,
                Ok(RetryTransition::Rescheduled { .. }) => report.rescheduled += 1,
                Ok(RetryTransition::DeadLettered { .. }) => report.dead_lettered += 1,
                Err(e) => {
                    error!(
                        delivery_id = %delivery_id,
                        error = %e,
                        "Failed to record retry outcome, releasing lease"
                    );
                    report.errored += 1;
                    self.release_lease(delivery_id).await;
                }
            }
        }

        Ok(report)
    }

    async fn release_lease(&self, delivery_id: DeliveryId) {
        match self.store.release(&delivery_id).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!(
                    delivery_id = %delivery_id,
                    error = %e,
                    "Failed to release retry lease, will try again next sweep"
                );
                self.stranded.lock().await.push(delivery_id);
            }
            Err(e) => error!(
                delivery_id = %delivery_id,
                error = %e,
                "Failed to release retry lease"
            ),
        }
    }

    async fn release_stranded(&self) {
        let stranded = std::mem::take(&mut *self.stranded.lock().await);
        for delivery_id in stranded {
            self.release_lease(delivery_id).await;
        }
    }

    /// Re-dispatch one leased entry and move it to its next state.
    ///
    /// The entry is dead-lettered without waiting for `max_attempts` when the
    /// dispatch error is not transient, e.g. the installation no longer exists.
    pub async fn process_entry(
        &self,
        mut entry: RetryEntry,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<RetryTransition, RetryStoreError> {
        let attempt = entry.attempt + 1;
        let delivery = Arc::new(entry.delivery.clone());

        let (error, retryable) = match self
            .dispatcher
            .dispatch(Arc::clone(&delivery), attempt, shutdown)
            .await
        {
            Ok(_) => {
                self.store.mark_succeeded(&entry.delivery.id).await?;
                info!(
                    delivery_id = %entry.delivery.id,
                    attempt,
                    "Retried delivery succeeded"
                );
                return Ok(RetryTransition::Succeeded);
            }
            Err(e) => (e.to_string(), e.is_transient()),
        };

        entry.attempt = attempt;
        entry.last_error = error.clone();
        entry.failure_history.push(FailureRecord {
            attempt,
            error: error.clone(),
            failed_at: now,
        });

        if retryable && self.policy.should_retry(attempt) {
            entry.next_attempt_at = now + to_chrono(self.policy.backoff(attempt));
            let next_attempt_at = entry.next_attempt_at;
            self.store.enqueue(entry).await?;
            warn!(
                delivery_id = %delivery.id,
                attempt,
                next_attempt_at = %next_attempt_at,
                error = %error,
                "Retry failed, rescheduled"
            );
            return Ok(RetryTransition::Rescheduled {
                attempt,
                next_attempt_at,
            });
        }

        let dead_letter = DeadLetterEntry {
            delivery: entry.delivery,
            attempts: attempt,
            failure_history: entry.failure_history,
            moved_at: now,
        };
        self.store.promote_to_dead_letter(dead_letter).await?;
        error!(
            delivery_id = %delivery.id,
            event = %delivery.event_name,
            attempts = attempt,
            retryable,
            error = %error,
            "Delivery moved to dead-letter store"
        );
        Ok(RetryTransition::DeadLettered { attempts: attempt })
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, RetryStoreError> {
        self.store.list_dead_letters().await
    }

    pub async fn get_dead_letter(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<DeadLetterEntry>, RetryStoreError> {
        self.store.get_dead_letter(delivery_id).await
    }

    /// Put a dead-lettered delivery back in the queue with `attempt == 0`.
    pub async fn replay(
        &self,
        delivery_id: &DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<RetryEntry, RetryStoreError> {
        let entry = self.store.replay(delivery_id, now).await?;
        info!(delivery_id = %delivery_id, "Dead-lettered delivery replayed");
        Ok(entry)
    }

    pub async fn pending_count(&self) -> Result<usize, RetryStoreError> {
        self.store.pending_count().await
    }
}

impl std::fmt::Debug for RetryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPipeline")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
