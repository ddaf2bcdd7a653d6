//! # Webhook Ingest
//!
//! [`WebhookIngestOrchestrator`] runs one inbound delivery through the whole
//! pipeline and reduces every result to an [`Outcome`] the HTTP layer can
//! turn into a response.
//!
//! | Step                  | Failure                         | Outcome                      |
//! |-----------------------|---------------------------------|------------------------------|
//! | header extraction     | missing or invalid header       | `BadRequest`                 |
//! | signature check       | mismatch or malformed signature | `Unauthorized`               |
//! | payload parse         | body is not a JSON object       | `BadRequest`                 |
//! | admission             | store unavailable               | `InternalError`              |
//! | admission             | duplicate                       | `Accepted(Duplicate)`        |
//! | token + dispatch      | token exchange failed           | `InternalError`, queued      |
//! | token + dispatch      | token fetch hit the deadline    | `Accepted(QueuedForRetry)`   |
//! | dispatch              | handlers failed per policy      | `Accepted(QueuedForRetry)`   |
//! | dispatch              | success or no matching handler  | `Accepted(Dispatched)`       |

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::delivery::{Delivery, DeliveryHeaders};
use crate::dispatch::{DeliveryDispatcher, DispatchError};
use crate::idempotency::{Admission, IdempotencyGuard};
use crate::retry::RetryPipeline;
use crate::signature::SignatureVerifier;
use crate::{DeliveryId, ValidationError};

/// Machine-readable reason codes carried by rejected outcomes.
pub mod codes {
    pub const MISSING_HEADER: &str = "missing_header";
    pub const INVALID_HEADER: &str = "invalid_header";
    pub const INVALID_SIGNATURE: &str = "invalid_signature";
    pub const INVALID_PAYLOAD: &str = "invalid_payload";
    pub const IDEMPOTENCY_UNAVAILABLE: &str = "idempotency_unavailable";
    pub const TOKEN_EXCHANGE_FAILED: &str = "token_exchange_failed";
    pub const RETRY_ENQUEUE_FAILED: &str = "retry_enqueue_failed";
}

/// What happened to an accepted delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptDisposition {
    /// Dispatched inline; every matched handler satisfied the policy.
    Dispatched,
    /// Already admitted earlier; nothing was done.
    Duplicate,
    /// Inline dispatch failed; the retry pipeline owns the delivery now.
    QueuedForRetry,
}

/// Result of processing one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted {
        delivery_id: DeliveryId,
        disposition: AcceptDisposition,
    },
    BadRequest {
        code: &'static str,
        message: String,
    },
    Unauthorized {
        code: &'static str,
        message: String,
    },
    InternalError {
        code: &'static str,
        message: String,
    },
}

impl Outcome {
    /// HTTP status the outcome maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Accepted { .. } => 202,
            Self::BadRequest { .. } => 400,
            Self::Unauthorized { .. } => 401,
            Self::InternalError { .. } => 500,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// Reason code for rejections, `None` for accepted deliveries.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Accepted { .. } => None,
            Self::BadRequest { code, .. }
            | Self::Unauthorized { code, .. }
            | Self::InternalError { code, .. } => Some(*code),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::InternalError {
            code,
            message: message.into(),
        }
    }
}

/// Sequences verification, admission, dispatch and retry hand-off for each
/// inbound delivery.
///
/// Cheap to share behind an `Arc`; every request is processed independently.
pub struct WebhookIngestOrchestrator {
    verifier: SignatureVerifier,
    guard: IdempotencyGuard,
    dispatcher: Arc<DeliveryDispatcher>,
    retry: Arc<RetryPipeline>,
    shutdown: CancellationToken,
}

impl WebhookIngestOrchestrator {
    /// `dispatcher` should be the same instance the retry pipeline uses so that
    /// retries see identical routing and failure policy.
    pub fn new(
        verifier: SignatureVerifier,
        guard: IdempotencyGuard,
        dispatcher: Arc<DeliveryDispatcher>,
        retry: Arc<RetryPipeline>,
    ) -> Self {
        Self {
            verifier,
            guard,
            dispatcher,
            retry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel inline dispatches when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Process one delivery. Never panics and never returns an error; every
    /// failure is folded into the returned [`Outcome`].
    pub async fn process(&self, raw_body: Bytes, headers: &HashMap<String, String>) -> Outcome {
        // 1. Required headers
        let headers = match DeliveryHeaders::from_http_headers(headers) {
            Ok(headers) => headers,
            Err(e) => {
                let code = match e {
                    ValidationError::Required { .. } => codes::MISSING_HEADER,
                    _ => codes::INVALID_HEADER,
                };
                warn!(error = %e, "Rejected delivery with bad headers");
                return Outcome::bad_request(code, e.to_string());
            }
        };
        let delivery_id = headers.delivery_id.clone();

        // 2. Signature over the exact body bytes
        if let Err(e) = self.verifier.check(&raw_body, &headers.signature) {
            warn!(
                delivery_id = %delivery_id,
                event = %headers.event_name,
                security_event = true,
                error = %e,
                "Webhook signature verification failed"
            );
            return Outcome::Unauthorized {
                code: codes::INVALID_SIGNATURE,
                message: "signature verification failed".to_string(),
            };
        }

        // 3. Narrow payload parse
        let delivery = match Delivery::from_parts(headers, raw_body, Utc::now()) {
            Ok(delivery) => Arc::new(delivery),
            Err(e) => {
                warn!(delivery_id = %delivery_id, error = %e, "Rejected malformed payload");
                return Outcome::bad_request(codes::INVALID_PAYLOAD, e.to_string());
            }
        };

        // 4. At-most-once admission
        match self.guard.try_admit(&delivery_id).await {
            Ok(Admission::Admitted) => {}
            Ok(Admission::Duplicate) => {
                info!(
                    delivery_id = %delivery_id,
                    event = %delivery.event_name,
                    "Duplicate delivery ignored"
                );
                return Outcome::Accepted {
                    delivery_id,
                    disposition: AcceptDisposition::Duplicate,
                };
            }
            Err(e) => {
                error!(delivery_id = %delivery_id, error = %e, "Idempotency check failed");
                return Outcome::internal(codes::IDEMPOTENCY_UNAVAILABLE, e.to_string());
            }
        }

        // 5. Token resolution and handler dispatch
        let failure = match self
            .dispatcher
            .dispatch(Arc::clone(&delivery), 0, &self.shutdown)
            .await
        {
            Ok(report) => {
                info!(
                    delivery_id = %delivery_id,
                    event = %delivery.event_label(),
                    matched = report.matched(),
                    "Delivery dispatched"
                );
                return Outcome::Accepted {
                    delivery_id,
                    disposition: AcceptDisposition::Dispatched,
                };
            }
            Err(e) => e,
        };

        // 6. Hand failures to the retry pipeline
        let error_text = failure.to_string();
        if let Err(e) = self
            .retry
            .enqueue_failed((*delivery).clone(), &error_text, Utc::now())
            .await
        {
            error!(
                delivery_id = %delivery_id,
                error = %e,
                dispatch_error = %error_text,
                "Failed to queue delivery for retry"
            );
            self.release(&delivery_id).await;
            return Outcome::internal(codes::RETRY_ENQUEUE_FAILED, e.to_string());
        }

        match failure {
            DispatchError::TokenUnavailable(e) => {
                Outcome::internal(codes::TOKEN_EXCHANGE_FAILED, e.to_string())
            }
            DispatchError::Cancelled | DispatchError::HandlersFailed { .. } => Outcome::Accepted {
                delivery_id,
                disposition: AcceptDisposition::QueuedForRetry,
            },
        }
    }

    async fn release(&self, delivery_id: &DeliveryId) {
        if let Err(e) = self.guard.release(delivery_id).await {
            error!(
                delivery_id = %delivery_id,
                error = %e,
                "Failed to release idempotency key; redeliveries will be ignored until it expires"
            );
        }
    }
}

impl std::fmt::Debug for WebhookIngestOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookIngestOrchestrator")
            .field("guard", &self.guard)
            .field("dispatcher", &self.dispatcher)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
