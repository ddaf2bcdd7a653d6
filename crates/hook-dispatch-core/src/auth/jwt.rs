//! JWT generation for GitHub App authentication.
//!
//! # GitHub Requirements
//!
//! - JWTs must use RS256 (RSA signature with SHA-256)
//! - `exp` may be at most 10 minutes in the future
//! - Claims must include `iss` (app ID), `iat` (issued at) and `exp`
//!
//! `iat` is backdated by [`CLOCK_SKEW_ALLOWANCE_SECONDS`] so that a GitHub clock running
//! slightly behind ours still accepts the token.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use zeroize::Zeroizing;

use super::{AuthError, GitHubAppId, JsonWebToken, JwtClaims, JwtSigner};
use crate::ValidationError;

/// How far `iat` is moved into the past.
pub const CLOCK_SKEW_ALLOWANCE_SECONDS: i64 = 60;

/// Lifetime of a signed App JWT, measured from signing time.
pub const JWT_LIFETIME_SECONDS: i64 = 600;

/// PEM-encoded RSA private key of the GitHub App.
///
/// The key material is zeroed on drop and never shown in `Debug` output.
#[derive(Clone)]
pub struct PrivateKey {
    pem: Zeroizing<String>,
}

impl PrivateKey {
    /// Parse and validate a PKCS#1 (`BEGIN RSA PRIVATE KEY`) or PKCS#8
    /// (`BEGIN PRIVATE KEY`) PEM document.
    pub fn from_pem(pem: &str) -> Result<Self, ValidationError> {
        let pem = pem.trim();

        if pem.is_empty() {
            return Err(ValidationError::InvalidFormat {
                field: "private_key".to_string(),
                message: "PEM string cannot be empty".to_string(),
            });
        }

        if !pem.contains("-----BEGIN") || !pem.contains("-----END") {
            return Err(ValidationError::InvalidFormat {
                field: "private_key".to_string(),
                message: "Invalid PEM format: missing BEGIN/END markers".to_string(),
            });
        }

        let parsed = RsaPrivateKey::from_pkcs1_pem(pem)
            .map(|_| ())
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem).map(|_| ()));
        if let Err(e) = parsed {
            return Err(ValidationError::InvalidFormat {
                field: "private_key".to_string(),
                message: format!("Failed to parse RSA private key: {}", e),
            });
        }

        Ok(Self {
            pem: Zeroizing::new(pem.to_string()),
        })
    }

    fn as_bytes(&self) -> &[u8] {
        self.pem.as_bytes()
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("pem", &"<REDACTED>")
            .finish()
    }
}

/// Signs App JWTs with RS256.
pub struct RS256JwtSigner {
    app_id: GitHubAppId,
    encoding_key: EncodingKey,
}

impl RS256JwtSigner {
    pub fn new(app_id: GitHubAppId, private_key: &PrivateKey) -> Result<Self, AuthError> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key.as_bytes()).map_err(|e| {
            AuthError::InvalidPrivateKey {
                message: format!("Failed to create encoding key: {}", e),
            }
        })?;

        Ok(Self {
            app_id,
            encoding_key,
        })
    }

    fn build_claims(&self, now: DateTime<Utc>) -> JwtClaims {
        JwtClaims {
            iss: self.app_id,
            iat: (now - Duration::seconds(CLOCK_SKEW_ALLOWANCE_SECONDS)).timestamp(),
            exp: (now + Duration::seconds(JWT_LIFETIME_SECONDS)).timestamp(),
        }
    }
}

impl JwtSigner for RS256JwtSigner {
    fn sign(&self, now: DateTime<Utc>) -> Result<JsonWebToken, AuthError> {
        let claims = self.build_claims(now);
        let header = Header::new(Algorithm::RS256);

        let token = encode(&header, &claims, &self.encoding_key).map_err(|e| {
            AuthError::JwtGenerationFailed {
                message: format!("Failed to encode JWT: {}", e),
            }
        })?;

        Ok(JsonWebToken::new(
            token,
            self.app_id,
            now - Duration::seconds(CLOCK_SKEW_ALLOWANCE_SECONDS),
            now + Duration::seconds(JWT_LIFETIME_SECONDS),
        ))
    }
}

impl std::fmt::Debug for RS256JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RS256JwtSigner")
            .field("app_id", &self.app_id)
            .field("encoding_key", &"<REDACTED>")
            .finish()
    }
}

#[cfg(test)]
#[path = "jwt_tests.rs"]
mod tests;
