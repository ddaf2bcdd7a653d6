//! # In-Memory Idempotency Store
//!
//! Process-local [`IdempotencyStore`]. Admission state is lost on restart, so
//! a redelivery that arrives after a restart is dispatched again.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::idempotency::{IdempotencyError, IdempotencyRecord, IdempotencyStore};

/// Map of admitted keys guarded by a single mutex.
///
/// Check and insert happen under one lock acquisition, which makes
/// [`try_admit`](IdempotencyStore::try_admit) atomic. Records are also indexed
/// by expiry so that each admission only visits the records that have expired.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, IdempotencyRecord>,
    expiries: BTreeSet<(DateTime<Utc>, String)>,
}

impl State {
    fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some((expires_at, _)) = self.expiries.first() {
            if *expires_at > now {
                break;
            }
            if let Some((_, key)) = self.expiries.pop_first() {
                self.records.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn remove(&mut self, key: &str) {
        if let Some(record) = self.records.remove(key) {
            self.expiries.remove(&(record.expires_at(), record.key));
        }
    }
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every record that has expired at `now`. Returns how many were removed.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, IdempotencyError> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        Ok(state.prune(now))
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_poisoned() -> IdempotencyError {
    IdempotencyError::StoreUnavailable {
        message: "idempotency store lock poisoned".to_string(),
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_admit(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyError> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        state.prune(now);

        // Pruning already dropped every record that is expired at `now`
        if state.records.contains_key(key) {
            return Ok(false);
        }

        let record = IdempotencyRecord {
            key: key.to_string(),
            first_seen_at: now,
            ttl,
        };
        state.expiries.insert((record.expires_at(), key.to_string()));
        state.records.insert(key.to_string(), record);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<(), IdempotencyError> {
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        state.remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_idempotency_tests.rs"]
mod tests;
