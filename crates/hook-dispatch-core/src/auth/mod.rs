//! GitHub App authentication.
//!
//! Handlers that call back into GitHub need an installation access token. The
//! token is obtained by signing a short-lived RS256 JWT as the App and
//! exchanging it at `POST /app/installations/{id}/access_tokens`. Tokens live
//! for about an hour, so [`InstallationTokenCache`] keeps them per installation
//! and collapses concurrent refreshes into a single exchange.
//!
//! - [`jwt`] signs App JWTs.
//! - [`exchange`] talks to the GitHub REST API.
//! - [`cache`] holds an in-memory [`TokenStore`].
//! - [`tokens`] ties the pieces together.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::ValidationError;

pub mod cache;
pub mod error;
pub mod exchange;
pub mod jwt;
pub mod tokens;

pub use cache::InMemoryTokenStore;
pub use error::{AuthError, CacheError};
pub use exchange::GitHubTokenExchanger;
pub use jwt::{PrivateKey, RS256JwtSigner};
pub use tokens::{InstallationTokenCache, TokenCacheConfig};

// ============================================================================
// Core ID Types
// ============================================================================

/// GitHub App identifier assigned during app registration.
///
/// # Examples
///
/// ```
/// use hook_dispatch_core::auth::GitHubAppId;
///
/// let app_id = GitHubAppId::new(123456);
/// assert_eq!(app_id.to_string(), "123456");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GitHubAppId(u64);

impl GitHubAppId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for GitHubAppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GitHubAppId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .parse::<u64>()
            .map_err(|_| ValidationError::InvalidFormat {
                field: "github_app_id".to_string(),
                message: "must be a positive integer".to_string(),
            })?;
        Ok(Self::new(id))
    }
}

/// Installation identifier carried in `installation.id` of a delivery payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallationId(u64);

impl InstallationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstallationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstallationId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .parse::<u64>()
            .map_err(|_| ValidationError::InvalidFormat {
                field: "installation_id".to_string(),
                message: "must be a positive integer".to_string(),
            })?;
        Ok(Self::new(id))
    }
}

// ============================================================================
// Token Types
// ============================================================================

/// RS256-signed JWT identifying the GitHub App itself.
///
/// Only used to obtain installation tokens. The encoded token is never shown
/// in `Debug` output.
#[derive(Clone)]
pub struct JsonWebToken {
    token: String,
    app_id: GitHubAppId,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl JsonWebToken {
    pub fn new(
        token: String,
        app_id: GitHubAppId,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token,
            app_id,
            issued_at,
            expires_at,
        }
    }

    /// Encoded token for `Authorization: Bearer <token>`.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn app_id(&self) -> GitHubAppId {
        self.app_id
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl std::fmt::Debug for JsonWebToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonWebToken")
            .field("app_id", &self.app_id)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("token", &"<REDACTED>")
            .finish()
    }
}

/// Short-lived credential scoped to one installation.
///
/// # Examples
///
/// ```
/// use hook_dispatch_core::auth::{InstallationAccessToken, InstallationId};
/// use chrono::{Duration, Utc};
///
/// let now = Utc::now();
/// let token = InstallationAccessToken::new(
///     "ghs_example".to_string(),
///     InstallationId::new(7),
///     now + Duration::hours(1),
/// );
///
/// assert!(token.is_usable_at(now, Duration::seconds(60)));
/// assert!(!token.is_usable_at(now + Duration::minutes(59) + Duration::seconds(30), Duration::seconds(60)));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct InstallationAccessToken {
    value: String,
    installation_id: InstallationId,
    expires_at: DateTime<Utc>,
}

impl InstallationAccessToken {
    pub fn new(value: String, installation_id: InstallationId, expires_at: DateTime<Utc>) -> Self {
        Self {
            value,
            installation_id,
            expires_at,
        }
    }

    /// Token string for `Authorization: Bearer <token>`.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn installation_id(&self) -> InstallationId {
        self.installation_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// True once `now` has reached the expiry instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True while the token stays valid for at least `margin` past `now`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

impl std::fmt::Debug for InstallationAccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationAccessToken")
            .field("installation_id", &self.installation_id)
            .field("expires_at", &self.expires_at)
            .field("value", &"<REDACTED>")
            .finish()
    }
}

/// JWT claims GitHub expects from an App.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Issuer (GitHub App ID)
    pub iss: GitHubAppId,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

// ============================================================================
// Trait Definitions
// ============================================================================

/// Signs App JWTs.
pub trait JwtSigner: Send + Sync {
    /// Produce a JWT valid from `now`.
    fn sign(&self, now: DateTime<Utc>) -> Result<JsonWebToken, AuthError>;
}

/// Exchanges an App JWT for an installation access token.
#[async_trait::async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(
        &self,
        installation_id: InstallationId,
        jwt: &JsonWebToken,
    ) -> Result<InstallationAccessToken, AuthError>;
}

/// Storage for cached installation tokens.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(
        &self,
        installation_id: InstallationId,
    ) -> Result<Option<InstallationAccessToken>, CacheError>;

    async fn put(&self, token: InstallationAccessToken) -> Result<(), CacheError>;

    async fn remove(&self, installation_id: InstallationId) -> Result<(), CacheError>;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
