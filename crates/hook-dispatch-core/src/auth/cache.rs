//! In-memory installation token storage.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use super::{CacheError, InstallationAccessToken, InstallationId, TokenStore};

/// [`TokenStore`] backed by a process-local map.
///
/// Tokens are dropped when the process exits; the cache simply re-exchanges.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<InstallationId, InstallationAccessToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every token that has expired at `now`.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let mut tokens = self.tokens.write().map_err(|_| lock_poisoned())?;
        let before = tokens.len();
        tokens.retain(|_, token| !token.is_expired_at(now));
        Ok(before - tokens.len())
    }

    pub fn len(&self) -> usize {
        self.tokens.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_poisoned() -> CacheError {
    CacheError::Unavailable {
        message: "token store lock poisoned".to_string(),
    }
}

#[async_trait::async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(
        &self,
        installation_id: InstallationId,
    ) -> Result<Option<InstallationAccessToken>, CacheError> {
        let tokens = self.tokens.read().map_err(|_| lock_poisoned())?;
        Ok(tokens.get(&installation_id).cloned())
    }

    async fn put(&self, token: InstallationAccessToken) -> Result<(), CacheError> {
        let mut tokens = self.tokens.write().map_err(|_| lock_poisoned())?;
        tokens.insert(token.installation_id(), token);
        Ok(())
    }

    async fn remove(&self, installation_id: InstallationId) -> Result<(), CacheError> {
        let mut tokens = self.tokens.write().map_err(|_| lock_poisoned())?;
        tokens.remove(&installation_id);
        Ok(())
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
