//! # In-Memory Retry Store
//!
//! Process-local [`RetryStore`] used by tests and by deployments that accept
//! losing queued retries on restart.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::retry::{DeadLetterEntry, RetryEntry, RetryStore, RetryStoreError};
use crate::DeliveryId;

#[derive(Debug, Default)]
struct State {
    pending: HashMap<DeliveryId, RetryEntry>,
    leased: HashMap<DeliveryId, RetryEntry>,
    dead_letters: HashMap<DeliveryId, DeadLetterEntry>,
}

/// Pending, leased and dead-lettered entries behind one mutex.
#[derive(Debug, Default)]
pub struct InMemoryRetryStore {
    state: Mutex<State>,
}

impl InMemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return every leased entry to the pending queue.
    pub fn release_leases(&self) -> Result<usize, RetryStoreError> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        let leased: Vec<_> = state.leased.drain().collect();
        let count = leased.len();
        for (id, entry) in leased {
            state.pending.entry(id).or_insert(entry);
        }
        Ok(count)
    }
}

fn lock_poisoned() -> RetryStoreError {
    RetryStoreError::Unavailable {
        message: "retry store lock poisoned".to_string(),
    }
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    async fn enqueue(&self, entry: RetryEntry) -> Result<(), RetryStoreError> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        let id = entry.delivery.id.clone();
        state.leased.remove(&id);
        state.pending.insert(id, entry);
        Ok(())
    }

    async fn dequeue_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryEntry>, RetryStoreError> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;

        let mut due: Vec<(DateTime<Utc>, DeliveryId)> = state
            .pending
            .values()
            .filter(|entry| entry.is_due(now))
            .map(|entry| (entry.next_attempt_at, entry.delivery.id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(entry) = state.pending.remove(&id) {
                state.leased.insert(id, entry.clone());
                leased.push(entry);
            }
        }
        Ok(leased)
    }

    async fn release(&self, delivery_id: &DeliveryId) -> Result<(), RetryStoreError> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        if let Some(entry) = state.leased.remove(delivery_id) {
            state.pending.entry(delivery_id.clone()).or_insert(entry);
        }
        Ok(())
    }

    async fn mark_succeeded(&self, delivery_id: &DeliveryId) -> Result<(), RetryStoreError> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        state.leased.remove(delivery_id);
        state.pending.remove(delivery_id);
        Ok(())
    }

    async fn promote_to_dead_letter(&self, entry: DeadLetterEntry) -> Result<(), RetryStoreError> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        let id = entry.delivery.id.clone();
        state.leased.remove(&id);
        state.pending.remove(&id);
        state.dead_letters.insert(id, entry);
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, RetryStoreError> {
        let state = self.state.lock().map_err(|_| lock_poisoned())?;
        let mut entries: Vec<_> = state.dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| a.moved_at.cmp(&b.moved_at));
        Ok(entries)
    }

    async fn get_dead_letter(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<DeadLetterEntry>, RetryStoreError> {
        let state = self.state.lock().map_err(|_| lock_poisoned())?;
        Ok(state.dead_letters.get(delivery_id).cloned())
    }

    async fn replay(
        &self,
        delivery_id: &DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<RetryEntry, RetryStoreError> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        let dead_letter =
            state
                .dead_letters
                .remove(delivery_id)
                .ok_or_else(|| RetryStoreError::NotFound {
                    delivery_id: delivery_id.clone(),
                })?;

        let entry = RetryEntry::replayed(dead_letter, now);
        state.pending.insert(delivery_id.clone(), entry.clone());
        Ok(entry)
    }

    async fn pending_count(&self) -> Result<usize, RetryStoreError> {
        let state = self.state.lock().map_err(|_| lock_poisoned())?;
        Ok(state.pending.len() + state.leased.len())
    }
}

#[cfg(test)]
#[path = "memory_retry_store_tests.rs"]
mod tests;
