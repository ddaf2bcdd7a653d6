//! # Hook Dispatch Core
//!
//! Domain logic for accepting GitHub webhook deliveries and fanning them out to
//! in-process handlers.
//!
//! A delivery passes through a fixed pipeline:
//!
//! 1. its `X-Hub-Signature-256` header is verified against the shared secret
//!    ([`signature`]);
//! 2. its delivery id is admitted at most once ([`idempotency`]);
//! 3. an installation access token is resolved when the payload names an
//!    installation ([`auth`]);
//! 4. every handler whose pattern matches is invoked in isolation ([`routing`]);
//! 5. failed dispatches are retried with exponential backoff and finally parked
//!    in a dead-letter store for manual replay ([`retry`]).
//!
//! [`orchestrator::WebhookIngestOrchestrator`] sequences these steps. Storage
//! and the GitHub API sit behind traits so that infrastructure is injected at
//! runtime; in-memory and filesystem implementations live in [`adapters`].
//!
//! ## Usage
//!
//! ```rust
//! use hook_dispatch_core::DeliveryId;
//!
//! let id = DeliveryId::new("72d3162e-cc78-11e3-81ab-4c9367dc0958").unwrap();
//! assert_eq!(id.as_str(), "72d3162e-cc78-11e3-81ab-4c9367dc0958");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod adapters;
pub mod auth;
pub mod delivery;
pub mod dispatch;
pub mod idempotency;
pub mod orchestrator;
pub mod retry;
pub mod routing;
pub mod signature;

pub use auth::{GitHubAppId, InstallationAccessToken, InstallationId, InstallationTokenCache};
pub use delivery::{Delivery, DeliveryHeaders};
pub use dispatch::{DeliveryDispatcher, DispatchError};
pub use idempotency::{Admission, IdempotencyError, IdempotencyGuard, IdempotencyStore};
pub use orchestrator::{AcceptDisposition, Outcome, WebhookIngestOrchestrator};
pub use retry::{
    DeadLetterEntry, RetryEntry, RetryPipeline, RetryPolicy, RetryStore, RetryStoreError,
    RetrySweepReport, RetryWorker,
};
pub use routing::{
    DispatchFailurePolicy, DispatchReport, EventRouter, HandlerContext, HandlerError,
    HandlerOutcome, WebhookHandler,
};
pub use signature::SignatureVerifier;

/// Maximum accepted length of a delivery id.
pub const MAX_DELIVERY_ID_LENGTH: usize = 128;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Unique identifier GitHub assigns to each webhook delivery.
///
/// Taken verbatim from the `X-GitHub-Delivery` header. Redeliveries of the same
/// event reuse the id, which makes it the idempotency key. The id also names
/// files in the filesystem retry store, so only ASCII alphanumerics, `-` and
/// `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeliveryId(String);

impl DeliveryId {
    /// Create a delivery id, validating length and character set.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "delivery_id".to_string(),
            });
        }

        if value.len() > MAX_DELIVERY_ID_LENGTH {
            return Err(ValidationError::TooLong {
                field: "delivery_id".to_string(),
                max_length: MAX_DELIVERY_ID_LENGTH,
            });
        }

        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidCharacters {
                field: "delivery_id".to_string(),
                invalid_chars: "only ASCII alphanumerics, '-' and '_' are allowed".to_string(),
            });
        }

        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeliveryId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DeliveryId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeliveryId> for String {
    fn from(id: DeliveryId) -> Self {
        id.0
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Input validation failures for inbound deliveries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' has invalid format: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },

    #[error("Field '{field}' contains invalid characters: {invalid_chars}")]
    InvalidCharacters {
        field: String,
        invalid_chars: String,
    },
}

#[cfg(test)]
mod test_support;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
