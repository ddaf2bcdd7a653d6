//! Error types for the HTTP service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use hook_dispatch_core::RetryStoreError;
use tracing::error;

/// Failures of the admin endpoints.
///
/// Webhook requests never produce this type; the orchestrator folds every
/// failure into an `Outcome`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Dead-letter entry not found: {delivery_id}")]
    NotFound { delivery_id: String },

    #[error("Invalid delivery id: {message}")]
    BadRequest { message: String },

    #[error("Retry store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Internal server error: {message}")]
    InternalError { message: String },
}

impl From<RetryStoreError> for ApiError {
    fn from(e: RetryStoreError) -> Self {
        match e {
            RetryStoreError::NotFound { delivery_id } => Self::NotFound {
                delivery_id: delivery_id.to_string(),
            },
            RetryStoreError::Unavailable { message } => Self::StoreUnavailable { message },
            RetryStoreError::Serialization { message } => Self::InternalError { message },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            Self::BadRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_delivery_id"),
            Self::StoreUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            Self::InternalError { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let message = match &self {
            Self::InternalError { message } => {
                // Details stay in the log
                error!(error = %message, "Internal server error occurred");
                "Internal server error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "status": "error",
            "code": code,
            "message": message,
        });
        (status, Json(body)).into_response()
    }
}

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Startup failed: {message}")]
    Startup { message: String },
}

impl ServiceError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BindFailed { .. } => 1,
            Self::ServerFailed { .. } => 2,
            Self::Configuration(_) => 3,
            Self::Startup { .. } => 4,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}
