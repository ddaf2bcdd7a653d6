//! # Hook Dispatch HTTP Service
//!
//! HTTP transport around [`hook_dispatch_core`]:
//!
//! - `POST /webhook` runs a delivery through the ingest orchestrator
//! - `GET /health` reports liveness and retry queue depth
//! - `GET /admin/dead-letters` lists deliveries that exhausted their retries
//! - `POST /admin/dead-letters/{delivery_id}/replay` queues one of them again
//!
//! The background [`RetryWorker`] shares the shutdown token with the HTTP
//! server, so SIGINT/SIGTERM drains both.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod logging;

pub use config::ServiceConfig;
pub use errors::{ApiError, ConfigError, ServiceError};

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hook_dispatch_core::{
    adapters::{FilesystemRetryStore, InMemoryIdempotencyStore, InMemoryRetryStore},
    auth::{
        exchange::ExchangeConfig, GitHubAppId, GitHubTokenExchanger, InMemoryTokenStore,
        PrivateKey, RS256JwtSigner, TokenCacheConfig,
    },
    AcceptDisposition, DeadLetterEntry, DeliveryDispatcher, DeliveryId, EventRouter,
    IdempotencyGuard, InstallationTokenCache, Outcome, RetryPipeline, RetryStore, RetryWorker,
    SignatureVerifier, WebhookIngestOrchestrator,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

use config::{GitHubConfig, RetryStoreKind, TokenConfig};

// ============================================================================
// Application State
// ============================================================================

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub orchestrator: Arc<WebhookIngestOrchestrator>,
    pub retry: Arc<RetryPipeline>,
}

/// Wire the core components described by `config` around `router`.
///
/// Returns the request state and the retry worker that must be run alongside
/// the server. Inline dispatches are cancelled when `shutdown` fires.
///
/// # Errors
///
/// Fails if the App private key cannot be read or parsed, or if the
/// filesystem retry store cannot be opened.
pub async fn build_state(
    config: ServiceConfig,
    router: EventRouter,
    shutdown: CancellationToken,
) -> Result<(AppState, RetryWorker), ServiceError> {
    let mut dispatcher = DeliveryDispatcher::new(
        Arc::new(router),
        config.dispatch.failure_policy,
        config.dispatch.timeout(),
    );
    if let Some(tokens) =
        build_token_cache(&config.github, &config.tokens, config.dispatch.timeout()).await?
    {
        dispatcher = dispatcher.with_token_cache(tokens);
    }
    let dispatcher = Arc::new(dispatcher);

    let retry_store = build_retry_store(&config).await?;
    let retry = Arc::new(RetryPipeline::new(
        retry_store,
        dispatcher.clone(),
        config.retry.policy(),
    ));

    let guard = IdempotencyGuard::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        config.idempotency.ttl(),
    );
    let orchestrator = WebhookIngestOrchestrator::new(
        SignatureVerifier::new(config.github.webhook_secret.as_bytes()),
        guard,
        dispatcher,
        retry.clone(),
    )
    .with_shutdown(shutdown);

    let worker = RetryWorker::new(
        retry.clone(),
        config.retry.poll_interval(),
        config.retry.batch_size,
    );

    let state = AppState {
        config: Arc::new(config),
        orchestrator: Arc::new(orchestrator),
        retry,
    };
    Ok((state, worker))
}

/// The exchange's HTTP timeout is the dispatch timeout: an exchange may not
/// outlive the dispatch waiting on it.
async fn build_token_cache(
    github: &GitHubConfig,
    tokens: &TokenConfig,
    exchange_timeout: Duration,
) -> Result<Option<InstallationTokenCache>, ServiceError> {
    let (Some(app_id), Some(key_path)) = (github.app_id, &github.private_key_path) else {
        info!("GitHub App credentials not configured; handlers receive no installation token");
        return Ok(None);
    };

    let pem = tokio::fs::read_to_string(key_path)
        .await
        .map_err(|e| ServiceError::Startup {
            message: format!(
                "Failed to read private key {}: {}",
                key_path.display(),
                e
            ),
        })?;
    let private_key = PrivateKey::from_pem(&pem).map_err(|e| ServiceError::Startup {
        message: e.to_string(),
    })?;

    let signer = RS256JwtSigner::new(GitHubAppId::new(app_id), &private_key).map_err(|e| {
        ServiceError::Startup {
            message: e.to_string(),
        }
    })?;
    let exchanger = GitHubTokenExchanger::new(
        ExchangeConfig::default()
            .with_api_url(github.api_url.clone())
            .with_user_agent(github.user_agent.clone())
            .with_timeout(exchange_timeout),
    )
    .map_err(|e| ServiceError::Startup {
        message: e.to_string(),
    })?;

    let refresh_margin_seconds =
        i64::try_from(tokens.refresh_margin_seconds).unwrap_or(i64::MAX / 1000);
    info!(app_id, api_url = %github.api_url, "Installation token cache enabled");

    Ok(Some(InstallationTokenCache::new(
        Arc::new(signer),
        Arc::new(exchanger),
        Arc::new(InMemoryTokenStore::new()),
        TokenCacheConfig {
            refresh_margin: chrono::Duration::seconds(refresh_margin_seconds),
        },
    )))
}

async fn build_retry_store(config: &ServiceConfig) -> Result<Arc<dyn RetryStore>, ServiceError> {
    match (config.retry.store, &config.retry.store_path) {
        (RetryStoreKind::Filesystem, Some(path)) => {
            let store = FilesystemRetryStore::new(path.clone())
                .await
                .map_err(|e| ServiceError::Startup {
                    message: e.to_string(),
                })?;
            store
                .recover_leases()
                .await
                .map_err(|e| ServiceError::Startup {
                    message: e.to_string(),
                })?;
            info!(path = %path.display(), "Using filesystem retry store");
            Ok(Arc::new(store))
        }
        (RetryStoreKind::Filesystem, None) => Err(ServiceError::Configuration(ConfigError::Missing {
            key: "retry.store_path".to_string(),
        })),
        (RetryStoreKind::Memory, _) => {
            warn!("Using in-memory retry store; queued retries are lost on restart");
            Ok(Arc::new(InMemoryRetryStore::new()))
        }
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn create_router(state: AppState) -> Router {
    let max_body_size = state.config.server.max_body_size;

    let webhook_routes = Router::new().route("/webhook", post(handle_webhook));

    let health_routes = Router::new().route("/health", get(handle_health_check));

    let admin_routes = Router::new()
        .route("/admin/dead-letters", get(list_dead_letters))
        .route(
            "/admin/dead-letters/{delivery_id}/replay",
            post(replay_dead_letter),
        );

    Router::new()
        .merge(webhook_routes)
        .merge(health_routes)
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled or a termination signal arrives,
/// running `worker` alongside.
pub async fn start_server(
    state: AppState,
    worker: RetryWorker,
    shutdown: CancellationToken,
) -> Result<(), ServiceError> {
    let host = state.config.server.host.clone();
    let port = state.config.server.port;
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .map_err(|e| ServiceError::BindFailed {
            address: format!("{}:{}", host, port),
            message: e.to_string(),
        })?;

    info!(host = %host, port, "Starting HTTP server");

    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));
    let signal_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = wait_for_shutdown_signal() => shutdown.cancel(),
                _ = shutdown.cancelled() => {}
            }
        })
    };

    let served = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    signal_handle.abort();
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Retry worker terminated abnormally");
    }

    served.map_err(|e| ServiceError::ServerFailed {
        message: e.to_string(),
    })?;

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

// ============================================================================
// Webhook Handler
// ============================================================================

/// Body of every `/webhook` response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
}

impl WebhookResponse {
    fn from_outcome(outcome: Outcome) -> (StatusCode, Self) {
        let status =
            StatusCode::from_u16(outcome.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match outcome {
            Outcome::Accepted {
                delivery_id,
                disposition,
            } => {
                let (code, message) = match disposition {
                    AcceptDisposition::Dispatched => ("dispatched", "Delivery dispatched"),
                    AcceptDisposition::Duplicate => ("duplicate", "Delivery already received"),
                    AcceptDisposition::QueuedForRetry => {
                        ("queued_for_retry", "Delivery accepted and queued for retry")
                    }
                };
                Self {
                    status: "accepted",
                    code,
                    message: message.to_string(),
                    delivery_id: Some(delivery_id.to_string()),
                }
            }
            Outcome::BadRequest { code, message } | Outcome::Unauthorized { code, message } => {
                Self {
                    status: "rejected",
                    code,
                    message,
                    delivery_id: None,
                }
            }
            Outcome::InternalError { code, message } => Self {
                status: "error",
                code,
                message,
                delivery_id: None,
            },
        };
        (status, body)
    }
}

#[instrument(skip(state, headers, body), fields(body_bytes = body.len()))]
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_lowercase(), v.to_string()))
        })
        .collect();

    // Processing continues in its own task if the request deadline passes
    let orchestrator = state.orchestrator.clone();
    let processing = tokio::spawn(async move { orchestrator.process(body, &header_map).await });
    let deadline = Duration::from_secs(state.config.server.request_timeout_seconds);

    let outcome = match tokio::time::timeout(deadline, processing).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!(error = %e, "Webhook processing task failed");
            Outcome::InternalError {
                code: "processing_failed",
                message: "webhook processing failed".to_string(),
            }
        }
        Err(_) => {
            warn!(
                timeout_seconds = deadline.as_secs(),
                "Webhook processing exceeded request timeout"
            );
            Outcome::InternalError {
                code: "timeout",
                message: format!("processing exceeded {}s", deadline.as_secs()),
            }
        }
    };

    let (status, body) = WebhookResponse::from_outcome(outcome);
    (status, Json(body)).into_response()
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_retries: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letters: Option<usize>,
}

async fn handle_health_check(State(state): State<AppState>) -> Response {
    let pending = state.retry.pending_count().await;
    let dead_letters = state.retry.list_dead_letters().await.map(|d| d.len());

    let healthy = pending.is_ok() && dead_letters.is_ok();
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
        pending_retries: pending.ok(),
        dead_letters: dead_letters.ok(),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// ============================================================================
// Admin
// ============================================================================

/// Dead-letter listing entry. The payload itself is not returned.
#[derive(Debug, Serialize)]
pub struct DeadLetterSummary {
    pub delivery_id: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<u64>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub moved_at: DateTime<Utc>,
}

impl From<&DeadLetterEntry> for DeadLetterSummary {
    fn from(entry: &DeadLetterEntry) -> Self {
        Self {
            delivery_id: entry.delivery.id.to_string(),
            event: entry.delivery.event_name.clone(),
            action: entry.delivery.action.clone(),
            installation_id: entry.delivery.installation_id.map(|id| id.as_u64()),
            attempts: entry.attempts,
            last_error: entry.last_error().map(str::to_string),
            received_at: entry.delivery.received_at,
            moved_at: entry.moved_at,
        }
    }
}

async fn list_dead_letters(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeadLetterSummary>>, ApiError> {
    let entries = state.retry.list_dead_letters().await?;
    Ok(Json(entries.iter().map(DeadLetterSummary::from).collect()))
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub status: &'static str,
    pub delivery_id: String,
    pub next_attempt_at: DateTime<Utc>,
}

#[instrument(skip(state))]
async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(delivery_id): Path<String>,
) -> Result<(StatusCode, Json<ReplayResponse>), ApiError> {
    let delivery_id = DeliveryId::new(delivery_id).map_err(|e| ApiError::BadRequest {
        message: e.to_string(),
    })?;

    let entry = state.retry.replay(&delivery_id, Utc::now()).await?;
    info!(delivery_id = %delivery_id, "Replay requested through admin API");

    Ok((
        StatusCode::ACCEPTED,
        Json(ReplayResponse {
            status: "replayed",
            delivery_id: delivery_id.to_string(),
            next_attempt_at: entry.next_attempt_at,
        }),
    ))
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
