//! Shared fixtures for the end-to-end tests
//!
//! Builds a fully wired [`WebhookIngestOrchestrator`] from the public API of
//! `hook-dispatch-core`, with recording handlers and signed requests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hook_dispatch_core::adapters::{InMemoryIdempotencyStore, InMemoryRetryStore};
use hook_dispatch_core::auth::exchange::ExchangeConfig;
use hook_dispatch_core::auth::{
    GitHubAppId, GitHubTokenExchanger, InMemoryTokenStore, PrivateKey, RS256JwtSigner,
    TokenCacheConfig,
};
use hook_dispatch_core::signature;
use hook_dispatch_core::{
    DeliveryDispatcher, DispatchFailurePolicy, EventRouter, HandlerContext, HandlerError,
    IdempotencyGuard, InstallationTokenCache, RetryPipeline, RetryPolicy, RetryStore,
    SignatureVerifier, WebhookHandler, WebhookIngestOrchestrator,
};

pub const SECRET: &[u8] = b"integration-secret";

pub const TEST_PRIVATE_KEY: &str =
    include_str!("../../../hook-dispatch-core/test_data/test_app_key.pem");

// ============================================================================
// Handlers
// ============================================================================

/// Handler that records every invocation and fails while `failing` is set.
pub struct RecordingHandler {
    name: String,
    failing: AtomicBool,
    panics: bool,
    calls: AtomicUsize,
    seen: Mutex<Vec<Seen>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub delivery_id: String,
    pub attempt: u32,
    pub token: Option<String>,
}

impl RecordingHandler {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, false, false)
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Self::build(name, true, false)
    }

    pub fn panicking(name: &str) -> Arc<Self> {
        Self::build(name, false, true)
    }

    fn build(name: &str, failing: bool, panics: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failing: AtomicBool::new(failing),
            panics,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, context: &HandlerContext) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(Seen {
            delivery_id: context.delivery.id.to_string(),
            attempt: context.attempt,
            token: context.token.as_ref().map(|t| t.value().to_string()),
        });

        if self.panics {
            panic!("{} blew up", self.name);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(HandlerError::failed(format!("{} is failing", self.name)));
        }
        Ok(())
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub struct Pipeline {
    pub orchestrator: Arc<WebhookIngestOrchestrator>,
    pub retry: Arc<RetryPipeline>,
}

pub fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO, 2.0)
}

pub fn wire(
    router: EventRouter,
    tokens: Option<InstallationTokenCache>,
    retry_store: Arc<dyn RetryStore>,
    retry_policy: RetryPolicy,
) -> Pipeline {
    let mut dispatcher = DeliveryDispatcher::new(
        Arc::new(router),
        DispatchFailurePolicy::AnyHandlerFailed,
        Duration::from_secs(5),
    );
    if let Some(tokens) = tokens {
        dispatcher = dispatcher.with_token_cache(tokens);
    }
    let dispatcher = Arc::new(dispatcher);

    let retry = Arc::new(RetryPipeline::new(
        retry_store,
        dispatcher.clone(),
        retry_policy,
    ));
    let orchestrator = WebhookIngestOrchestrator::new(
        SignatureVerifier::new(SECRET),
        IdempotencyGuard::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            chrono::Duration::hours(24),
        ),
        dispatcher,
        retry.clone(),
    );

    Pipeline {
        orchestrator: Arc::new(orchestrator),
        retry,
    }
}

pub fn wire_in_memory(router: EventRouter, max_attempts: u32) -> Pipeline {
    wire(
        router,
        None,
        Arc::new(InMemoryRetryStore::new()),
        policy(max_attempts),
    )
}

/// Token cache talking to a (mock) GitHub API at `api_url` with the test key.
pub fn github_token_cache(api_url: &str) -> InstallationTokenCache {
    let key = PrivateKey::from_pem(TEST_PRIVATE_KEY).expect("test key parses");
    let signer = RS256JwtSigner::new(GitHubAppId::new(4242), &key).expect("signer builds");
    let exchanger = GitHubTokenExchanger::new(ExchangeConfig::default().with_api_url(api_url))
        .expect("exchanger builds");

    InstallationTokenCache::new(
        Arc::new(signer),
        Arc::new(exchanger),
        Arc::new(InMemoryTokenStore::new()),
        TokenCacheConfig::default(),
    )
}

// ============================================================================
// Requests
// ============================================================================

pub fn payload(action: Option<&str>, installation: Option<u64>) -> Bytes {
    let mut body = serde_json::json!({
        "repository": { "full_name": "octo-org/octo-repo" },
        "sender": { "login": "octocat" },
    });
    if let Some(action) = action {
        body["action"] = serde_json::json!(action);
    }
    if let Some(installation) = installation {
        body["installation"] = serde_json::json!({ "id": installation });
    }
    Bytes::from(body.to_string())
}

pub fn headers(delivery_id: &str, event: &str, body: &[u8]) -> HashMap<String, String> {
    HashMap::from([
        ("X-GitHub-Delivery".to_string(), delivery_id.to_string()),
        ("X-GitHub-Event".to_string(), event.to_string()),
        (
            "X-Hub-Signature-256".to_string(),
            signature::sign(body, SECRET).expect("signing works"),
        ),
    ])
}
