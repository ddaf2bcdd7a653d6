//! # Filesystem Retry Store
//!
//! Durable [`RetryStore`] that keeps one JSON file per delivery:
//!
//! ```text
//! <base>/pending/<delivery_id>.json      waiting for next_attempt_at
//! <base>/leased/<delivery_id>.json       being dispatched by a worker
//! <base>/dead_letter/<delivery_id>.json  retries exhausted
//! ```
//!
//! Files are written to a temporary path and renamed into place, and leasing
//! is a rename from `pending/` to `leased/`, so a crash never leaves a
//! half-written entry behind. Entries left in `leased/` by a crash are moved
//! back with [`FilesystemRetryStore::recover_leases`] at startup.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::retry::{DeadLetterEntry, RetryEntry, RetryStore, RetryStoreError};
use crate::DeliveryId;

const PENDING_DIR: &str = "pending";
const LEASED_DIR: &str = "leased";
const DEAD_LETTER_DIR: &str = "dead_letter";

/// Filesystem-backed retry queue and dead-letter store.
///
/// # Examples
///
/// ```no_run
/// use hook_dispatch_core::adapters::FilesystemRetryStore;
/// use std::path::PathBuf;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = FilesystemRetryStore::new(PathBuf::from("./data/retries")).await?;
/// store.recover_leases().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct FilesystemRetryStore {
    base_path: PathBuf,
    // Serializes directory scans with the renames that follow them.
    lock: Mutex<()>,
}

impl FilesystemRetryStore {
    /// Open the store, creating its directories if needed.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if a directory cannot be created.
    pub async fn new(base_path: PathBuf) -> Result<Self, RetryStoreError> {
        for dir in [PENDING_DIR, LEASED_DIR, DEAD_LETTER_DIR] {
            fs::create_dir_all(base_path.join(dir))
                .await
                .map_err(|e| unavailable("create directory", &base_path.join(dir), e))?;
        }

        Ok(Self {
            base_path,
            lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Move every leased entry back to `pending/`.
    ///
    /// Call once at startup, before any worker runs. An entry already present
    /// in `pending/` wins over the stale lease.
    pub async fn recover_leases(&self) -> Result<usize, RetryStoreError> {
        let _guard = self.lock.lock().await;
        let mut recovered = 0;

        for leased_path in self.list_json(LEASED_DIR).await? {
            let Some(file_name) = leased_path.file_name() else {
                continue;
            };
            let pending_path = self.base_path.join(PENDING_DIR).join(file_name);

            if fs::try_exists(&pending_path).await.unwrap_or(false) {
                remove_if_exists(&leased_path).await?;
                continue;
            }

            fs::rename(&leased_path, &pending_path)
                .await
                .map_err(|e| unavailable("recover lease", &leased_path, e))?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "Recovered interrupted retry leases");
        }
        Ok(recovered)
    }

    fn entry_path(&self, dir: &str, delivery_id: &DeliveryId) -> PathBuf {
        self.base_path
            .join(dir)
            .join(format!("{}.json", delivery_id.as_str()))
    }

    async fn list_json(&self, dir: &str) -> Result<Vec<PathBuf>, RetryStoreError> {
        let dir_path = self.base_path.join(dir);
        let mut entries = fs::read_dir(&dir_path)
            .await
            .map_err(|e| unavailable("read directory", &dir_path, e))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable("read directory", &dir_path, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Read every parseable entry in `dir`, skipping corrupt files with a warning.
    async fn read_all<T: DeserializeOwned>(&self, dir: &str) -> Result<Vec<(PathBuf, T)>, RetryStoreError> {
        let mut items = Vec::new();
        for path in self.list_json(dir).await? {
            match read_json::<T>(&path).await {
                Ok(Some(item)) => items.push((path, item)),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable retry file"),
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl RetryStore for FilesystemRetryStore {
    async fn enqueue(&self, entry: RetryEntry) -> Result<(), RetryStoreError> {
        let _guard = self.lock.lock().await;
        let id = entry.delivery.id.clone();
        write_json(&self.entry_path(PENDING_DIR, &id), &entry).await?;
        remove_if_exists(&self.entry_path(LEASED_DIR, &id)).await
    }

    async fn dequeue_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryEntry>, RetryStoreError> {
        let _guard = self.lock.lock().await;

        let mut due: Vec<(PathBuf, RetryEntry)> = self
            .read_all::<RetryEntry>(PENDING_DIR)
            .await?
            .into_iter()
            .filter(|(_, entry)| entry.is_due(now))
            .collect();
        due.sort_by(|(_, a), (_, b)| {
            a.next_attempt_at
                .cmp(&b.next_attempt_at)
                .then_with(|| a.delivery.id.cmp(&b.delivery.id))
        });
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for (pending_path, entry) in due {
            let leased_path = self.entry_path(LEASED_DIR, &entry.delivery.id);
            match fs::rename(&pending_path, &leased_path).await {
                Ok(()) => leased.push(entry),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(unavailable("lease entry", &pending_path, e)),
            }
        }
        Ok(leased)
    }

    async fn release(&self, delivery_id: &DeliveryId) -> Result<(), RetryStoreError> {
        let _guard = self.lock.lock().await;
        let leased_path = self.entry_path(LEASED_DIR, delivery_id);
        let pending_path = self.entry_path(PENDING_DIR, delivery_id);

        if fs::try_exists(&pending_path)
            .await
            .map_err(|e| unavailable("check entry", &pending_path, e))?
        {
            return remove_if_exists(&leased_path).await;
        }
        match fs::rename(&leased_path, &pending_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable("release entry", &leased_path, e)),
        }
    }

    async fn mark_succeeded(&self, delivery_id: &DeliveryId) -> Result<(), RetryStoreError> {
        let _guard = self.lock.lock().await;
        remove_if_exists(&self.entry_path(LEASED_DIR, delivery_id)).await?;
        remove_if_exists(&self.entry_path(PENDING_DIR, delivery_id)).await
    }

    async fn promote_to_dead_letter(&self, entry: DeadLetterEntry) -> Result<(), RetryStoreError> {
        let _guard = self.lock.lock().await;
        let id = entry.delivery.id.clone();
        write_json(&self.entry_path(DEAD_LETTER_DIR, &id), &entry).await?;
        remove_if_exists(&self.entry_path(LEASED_DIR, &id)).await?;
        remove_if_exists(&self.entry_path(PENDING_DIR, &id)).await
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>, RetryStoreError> {
        let _guard = self.lock.lock().await;
        let mut entries: Vec<DeadLetterEntry> = self
            .read_all::<DeadLetterEntry>(DEAD_LETTER_DIR)
            .await?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect();
        entries.sort_by(|a, b| a.moved_at.cmp(&b.moved_at));
        Ok(entries)
    }

    async fn get_dead_letter(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<DeadLetterEntry>, RetryStoreError> {
        let _guard = self.lock.lock().await;
        read_json(&self.entry_path(DEAD_LETTER_DIR, delivery_id)).await
    }

    async fn replay(
        &self,
        delivery_id: &DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<RetryEntry, RetryStoreError> {
        let _guard = self.lock.lock().await;
        let dead_letter_path = self.entry_path(DEAD_LETTER_DIR, delivery_id);
        let dead_letter: DeadLetterEntry =
            read_json(&dead_letter_path)
                .await?
                .ok_or_else(|| RetryStoreError::NotFound {
                    delivery_id: delivery_id.clone(),
                })?;

        let entry = RetryEntry::replayed(dead_letter, now);
        write_json(&self.entry_path(PENDING_DIR, delivery_id), &entry).await?;
        remove_if_exists(&dead_letter_path).await?;
        Ok(entry)
    }

    async fn pending_count(&self) -> Result<usize, RetryStoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.list_json(PENDING_DIR).await?.len() + self.list_json(LEASED_DIR).await?.len())
    }
}

fn unavailable(operation: &str, path: &Path, error: std::io::Error) -> RetryStoreError {
    RetryStoreError::Unavailable {
        message: format!("Failed to {} {}: {}", operation, path.display(), error),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RetryStoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| RetryStoreError::Serialization {
        message: e.to_string(),
    })?;

    // Write to a sibling temp file, then rename over the target
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| unavailable("create", &temp_path, e))?;
    file.write_all(&json)
        .await
        .map_err(|e| unavailable("write", &temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| unavailable("sync", &temp_path, e))?;

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| unavailable("rename", &temp_path, e))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RetryStoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(unavailable("read", path, e)),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| RetryStoreError::Serialization {
            message: format!("{}: {}", path.display(), e),
        })
}

async fn remove_if_exists(path: &Path) -> Result<(), RetryStoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(unavailable("remove", path, e)),
    }
}

#[cfg(test)]
#[path = "filesystem_retry_store_tests.rs"]
mod tests;
