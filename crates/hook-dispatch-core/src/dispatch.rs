//! One dispatch of a delivery: token resolution, routing and the deadline.
//!
//! Both the inline path in the orchestrator and retries from the pipeline go
//! through [`DeliveryDispatcher`], so a retried delivery sees exactly the same
//! handlers, token handling and failure policy as the original attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{AuthError, InstallationTokenCache};
use crate::delivery::Delivery;
use crate::routing::{DispatchFailurePolicy, DispatchReport, EventRouter, HandlerContext};

/// Default upper bound on one dispatch.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(8);

/// Why a dispatch needs a retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to obtain installation token: {0}")]
    TokenUnavailable(AuthError),

    /// The deadline passed or shutdown began before any handler ran.
    #[error("Dispatch cancelled while obtaining installation token")]
    Cancelled,

    #[error("{failed} of {matched} handlers failed: {summary}")]
    HandlersFailed {
        failed: usize,
        matched: usize,
        summary: String,
    },
}

impl DispatchError {
    /// Whether a later attempt may succeed. The retry pipeline dead-letters
    /// deliveries whose dispatch fails with a non-transient error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TokenUnavailable(e) => e.is_transient(),
            Self::Cancelled => true,
            // Handler failures are always eligible for retry
            Self::HandlersFailed { .. } => true,
        }
    }
}

/// Runs matched handlers for a delivery under a deadline.
pub struct DeliveryDispatcher {
    router: Arc<EventRouter>,
    tokens: Option<InstallationTokenCache>,
    policy: DispatchFailurePolicy,
    timeout: Duration,
}

impl DeliveryDispatcher {
    pub fn new(router: Arc<EventRouter>, policy: DispatchFailurePolicy, timeout: Duration) -> Self {
        Self {
            router,
            tokens: None,
            policy,
            timeout,
        }
    }

    /// Resolve installation tokens for deliveries that name an installation.
    /// Without a cache handlers always receive `token: None`.
    pub fn with_token_cache(mut self, tokens: InstallationTokenCache) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn policy(&self) -> DispatchFailurePolicy {
        self.policy
    }

    /// Dispatch `delivery` to every matching handler.
    ///
    /// The timeout covers the token exchange as well as the handlers.
    /// Handlers still running when the timeout passes or `shutdown` fires are
    /// cancelled and count as failed.
    ///
    /// # Errors
    ///
    /// - `TokenUnavailable` when the installation token could not be obtained;
    ///   no handler has run.
    /// - `Cancelled` when the timeout passed or `shutdown` fired while the
    ///   token was still being obtained; no handler has run.
    /// - `HandlersFailed` when the report fails the configured policy.
    pub async fn dispatch(
        &self,
        delivery: Arc<Delivery>,
        attempt: u32,
        shutdown: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let has_match = self
            .router
            .matching(&delivery.event_name, delivery.action.as_deref())
            .next()
            .is_some();
        if !has_match {
            return Ok(DispatchReport::default());
        }

        let cancellation = shutdown.child_token();
        let deadline = {
            let cancellation = cancellation.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancellation.cancel();
            })
        };

        let token = match (delivery.installation_id, &self.tokens) {
            (Some(installation_id), Some(tokens)) => {
                let result = tokio::select! {
                    result = tokens.get_token(installation_id) => {
                        result.map_err(DispatchError::TokenUnavailable)
                    }
                    _ = cancellation.cancelled() => Err(DispatchError::Cancelled),
                };
                match result {
                    Ok(token) => Some(token),
                    Err(e) => {
                        deadline.abort();
                        warn!(
                            delivery_id = %delivery.id,
                            installation_id = %installation_id,
                            attempt,
                            error = %e,
                            "Installation token unavailable"
                        );
                        return Err(e);
                    }
                }
            }
            _ => None,
        };

        let context = HandlerContext {
            delivery: Arc::clone(&delivery),
            token,
            attempt,
            cancellation,
        };
        let report = self.router.dispatch(&context).await;
        deadline.abort();

        info!(
            delivery_id = %delivery.id,
            event = %delivery.event_name,
            action = delivery.action.as_deref().unwrap_or(""),
            attempt,
            matched = report.matched(),
            failed = report.failed_count(),
            "Dispatch finished"
        );

        if report.is_success(self.policy) {
            Ok(report)
        } else {
            Err(DispatchError::HandlersFailed {
                failed: report.failed_count(),
                matched: report.matched(),
                summary: report.failure_summary(),
            })
        }
    }
}

impl std::fmt::Debug for DeliveryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryDispatcher")
            .field("handlers", &self.router.len())
            .field("token_cache", &self.tokens.is_some())
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
