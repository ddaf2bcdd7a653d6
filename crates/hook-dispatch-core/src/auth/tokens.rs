//! Per-installation access token cache with single-flight refresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::{
    AuthError, CacheError, InstallationAccessToken, InstallationId, JwtSigner, TokenExchanger,
    TokenStore,
};

/// Default time before expiry at which a cached token is refreshed.
pub const DEFAULT_REFRESH_MARGIN_SECONDS: i64 = 60;

/// Tuning for [`InstallationTokenCache`].
#[derive(Debug, Clone)]
pub struct TokenCacheConfig {
    /// A cached token is only served while it stays valid this much longer.
    pub refresh_margin: Duration,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECONDS),
        }
    }
}

type SharedExchange = Shared<BoxFuture<'static, Result<InstallationAccessToken, AuthError>>>;

struct Inner {
    signer: Arc<dyn JwtSigner>,
    exchanger: Arc<dyn TokenExchanger>,
    store: Arc<dyn TokenStore>,
    config: TokenCacheConfig,
    in_flight: Mutex<HashMap<InstallationId, SharedExchange>>,
}

impl Inner {
    async fn cached(&self, installation_id: InstallationId) -> Option<InstallationAccessToken> {
        match self.store.get(installation_id).await {
            Ok(Some(token)) if token.is_usable_at(Utc::now(), self.config.refresh_margin) => {
                Some(token)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(
                    installation_id = %installation_id,
                    error = %e,
                    "Token store lookup failed, exchanging a fresh token"
                );
                None
            }
        }
    }

    async fn refresh(&self, installation_id: InstallationId) -> Result<InstallationAccessToken, AuthError> {
        // A previous flight may have stored a token between our cache miss and
        // this flight starting.
        if let Some(token) = self.cached(installation_id).await {
            return Ok(token);
        }

        let jwt = self.signer.sign(Utc::now())?;
        let token = self.exchanger.exchange(installation_id, &jwt).await?;

        if let Err(e) = self.store.put(token.clone()).await {
            warn!(
                installation_id = %installation_id,
                error = %e,
                "Failed to cache installation token"
            );
        }

        info!(
            installation_id = %installation_id,
            expires_at = %token.expires_at(),
            "Installation token refreshed"
        );
        Ok(token)
    }
}

/// Hands out installation access tokens, exchanging a new one only when the
/// cached token is missing or inside the refresh margin.
///
/// Concurrent requests for the same installation share one exchange: the
/// first caller starts it and everybody else awaits the same result.
/// Requests for different installations never wait on each other.
#[derive(Clone)]
pub struct InstallationTokenCache {
    inner: Arc<Inner>,
}

impl InstallationTokenCache {
    pub fn new(
        signer: Arc<dyn JwtSigner>,
        exchanger: Arc<dyn TokenExchanger>,
        store: Arc<dyn TokenStore>,
        config: TokenCacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                signer,
                exchanger,
                store,
                config,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Get a token for `installation_id` whose expiry lies strictly in the future.
    ///
    /// # Errors
    ///
    /// Returns the exchange failure. Every caller that joined the failed
    /// exchange receives the same error; the next call starts a new exchange.
    pub async fn get_token(
        &self,
        installation_id: InstallationId,
    ) -> Result<InstallationAccessToken, AuthError> {
        if let Some(token) = self.inner.cached(installation_id).await {
            debug!(installation_id = %installation_id, "Installation token cache hit");
            return Ok(token);
        }

        let token = self.join_or_start(installation_id).await?;

        if token.is_expired_at(Utc::now()) {
            warn!(
                installation_id = %installation_id,
                expires_at = %token.expires_at(),
                "Exchange produced an already expired token"
            );
            return Err(AuthError::TokenExpired);
        }

        Ok(token)
    }

    /// Drop the cached token so that the next [`get_token`](Self::get_token)
    /// performs an exchange. Used after GitHub rejects a token early.
    pub async fn invalidate(&self, installation_id: InstallationId) -> Result<(), CacheError> {
        self.inner.store.remove(installation_id).await
    }

    fn join_or_start(&self, installation_id: InstallationId) -> SharedExchange {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = in_flight.get(&installation_id) {
            debug!(installation_id = %installation_id, "Joining in-flight token exchange");
            return existing.clone();
        }

        let inner = Arc::clone(&self.inner);
        let flight = async move {
            let result = inner.refresh(installation_id).await;
            inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&installation_id);
            result
        }
        .boxed()
        .shared();

        in_flight.insert(installation_id, flight.clone());
        flight
    }
}

impl std::fmt::Debug for InstallationTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationTokenCache")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "tokens_tests.rs"]
mod tests;
