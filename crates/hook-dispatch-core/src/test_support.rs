//! Fakes shared by the unit tests of this crate.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};

use crate::auth::{
    AuthError, GitHubAppId, InMemoryTokenStore, InstallationAccessToken, InstallationId,
    InstallationTokenCache, JsonWebToken, JwtSigner, TokenCacheConfig, TokenExchanger,
};
use crate::delivery::Delivery;
use crate::routing::{HandlerContext, HandlerError, WebhookHandler};
use crate::DeliveryId;

pub fn delivery(id: &str, event: &str, action: Option<&str>, installation: Option<u64>) -> Delivery {
    let mut body = serde_json::json!({ "sender": { "login": "octocat" } });
    if let Some(action) = action {
        body["action"] = serde_json::json!(action);
    }
    if let Some(installation) = installation {
        body["installation"] = serde_json::json!({ "id": installation });
    }

    Delivery {
        id: DeliveryId::new(id).unwrap(),
        event_name: event.to_string(),
        action: action.map(str::to_string),
        installation_id: installation.map(InstallationId::new),
        received_at: Utc::now(),
        signature: "sha256=00".to_string(),
        raw_payload: Bytes::from(body.to_string()),
    }
}

/// Handler that fails its first `failures` invocations and records what it saw.
pub struct ScriptedHandler {
    name: String,
    failures_remaining: AtomicUsize,
    always_fail: AtomicBool,
    hang: bool,
    calls: AtomicUsize,
    attempts: Mutex<Vec<u32>>,
    tokens: Mutex<Vec<Option<String>>>,
}

impl ScriptedHandler {
    pub fn succeeding(name: &str) -> Arc<Self> {
        Self::build(name, 0, false, false)
    }

    pub fn failing_first(name: &str, failures: usize) -> Arc<Self> {
        Self::build(name, failures, false, false)
    }

    pub fn always_failing(name: &str) -> Arc<Self> {
        Self::build(name, 0, true, false)
    }

    pub fn hanging(name: &str) -> Arc<Self> {
        Self::build(name, 0, false, true)
    }

    fn build(name: &str, failures: usize, always_fail: bool, hang: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failures_remaining: AtomicUsize::new(failures),
            always_fail: AtomicBool::new(always_fail),
            hang,
            calls: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn start_succeeding(&self) {
        self.always_fail.store(false, Ordering::SeqCst);
        self.failures_remaining.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl WebhookHandler for ScriptedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, context: &HandlerContext) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts.lock().unwrap().push(context.attempt);
        self.tokens
            .lock()
            .unwrap()
            .push(context.token.as_ref().map(|t| t.value().to_string()));

        if self.hang {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(HandlerError::failed(format!("{} failed", self.name)));
        }

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(HandlerError::failed(format!("{} failed", self.name)));
        }

        Ok(())
    }
}

pub struct StaticSigner;

impl JwtSigner for StaticSigner {
    fn sign(&self, now: DateTime<Utc>) -> Result<JsonWebToken, AuthError> {
        Ok(JsonWebToken::new(
            "jwt".to_string(),
            GitHubAppId::new(1),
            now,
            now + Duration::minutes(10),
        ))
    }
}

/// Exchanger returning `ghs_<installation>` tokens, or failing when told to.
///
/// `fail` answers 503, `missing` reports the installation as gone and
/// `delay_ms` stalls every exchange.
#[derive(Default)]
pub struct FakeExchanger {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub missing: AtomicBool,
    pub delay_ms: AtomicU64,
}

#[async_trait]
impl TokenExchanger for FakeExchanger {
    async fn exchange(
        &self,
        installation_id: InstallationId,
        _jwt: &JsonWebToken,
    ) -> Result<InstallationAccessToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        if self.missing.load(Ordering::SeqCst) {
            return Err(AuthError::InstallationNotFound { installation_id });
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuthError::GitHubApiError {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(InstallationAccessToken::new(
            format!("ghs_{}", installation_id),
            installation_id,
            Utc::now() + Duration::hours(1),
        ))
    }
}

pub fn token_cache(exchanger: Arc<FakeExchanger>) -> InstallationTokenCache {
    InstallationTokenCache::new(
        Arc::new(StaticSigner),
        exchanger,
        Arc::new(InMemoryTokenStore::new()),
        TokenCacheConfig::default(),
    )
}
