//! Error types for GitHub App authentication.

use super::InstallationId;

/// Failures while obtaining an installation access token.
///
/// Every variant carries plain strings so that one failed exchange can be
/// handed to all callers waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Invalid GitHub App credentials (non-retryable).
    #[error("Invalid GitHub App credentials")]
    InvalidCredentials,

    /// Installation not found or the App lost access (non-retryable).
    #[error("Installation {installation_id} not found or access denied")]
    InstallationNotFound { installation_id: InstallationId },

    /// The exchange returned a token that had already expired.
    #[error("Installation token expired")]
    TokenExpired,

    /// Invalid private key format or data (non-retryable).
    #[error("Invalid private key: {message}")]
    InvalidPrivateKey { message: String },

    /// JWT generation failed (non-retryable).
    #[error("JWT generation failed: {message}")]
    JwtGenerationFailed { message: String },

    /// GitHub API returned an error response.
    #[error("GitHub API error: {status} - {message}")]
    GitHubApiError { status: u16, message: String },

    /// The response body could not be understood.
    #[error("Invalid response from GitHub: {message}")]
    InvalidResponse { message: String },

    /// Network connectivity or transport error.
    #[error("Network error: {0}")]
    NetworkError(String),
}

impl AuthError {
    /// Check if this error represents a transient condition that may succeed if retried.
    ///
    /// Network failures, server errors (5xx), rate limiting (429) and expired
    /// tokens are transient. Credential, key and missing installation errors
    /// are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError(_) | Self::TokenExpired => true,
            Self::GitHubApiError { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidCredentials
            | Self::InstallationNotFound { .. }
            | Self::InvalidPrivateKey { .. }
            | Self::JwtGenerationFailed { .. }
            | Self::InvalidResponse { .. } => false,
        }
    }
}

/// Token store failures. The cache falls back to a fresh exchange on these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("Token store unavailable: {message}")]
    Unavailable { message: String },
}
