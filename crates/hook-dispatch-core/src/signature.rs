//! Webhook signature verification.
//!
//! GitHub signs each delivery with HMAC-SHA256 keyed by the webhook secret and
//! sends the result as `X-Hub-Signature-256: sha256=<hex>`. Verification
//! recomputes the digest over the exact bytes received and compares it in
//! constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Prefix GitHub puts in front of the hex digest.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Length in bytes of an HMAC-SHA256 digest.
const DIGEST_LENGTH: usize = 32;

/// Reasons a signature was rejected.
///
/// None of the variants carry the offending signature or the secret, so the
/// error is safe to log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Signature must start with '{SIGNATURE_PREFIX}'")]
    MissingPrefix,

    #[error("Signature is not valid hex")]
    InvalidHex,

    #[error("Signature digest has {actual} bytes, expected {DIGEST_LENGTH}")]
    InvalidLength { actual: usize },

    #[error("HMAC could not be initialised with the webhook secret")]
    InvalidKey,

    #[error("Signature does not match payload")]
    Mismatch,
}

/// Verify `provided_signature` against the HMAC-SHA256 of `raw_body`.
///
/// Returns `false` for any malformed signature (wrong prefix, non-hex digits,
/// wrong digest length) as well as for a digest mismatch. Never panics.
pub fn verify(raw_body: &[u8], secret: &[u8], provided_signature: &str) -> bool {
    check(raw_body, secret, provided_signature).is_ok()
}

/// Like [`verify`] but reports why the signature was rejected.
pub fn check(raw_body: &[u8], secret: &[u8], provided_signature: &str) -> Result<(), SignatureError> {
    let provided = parse_signature(provided_signature)?;
    let expected = compute_digest(raw_body, secret)?;

    if bool::from(provided.as_slice().ct_eq(expected.as_slice())) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Compute the `sha256=<lowercase-hex>` header value for a body.
pub fn sign(raw_body: &[u8], secret: &[u8]) -> Result<String, SignatureError> {
    let digest = compute_digest(raw_body, secret)?;
    Ok(format!("{}{}", SIGNATURE_PREFIX, hex::encode(digest)))
}

fn parse_signature(signature: &str) -> Result<Vec<u8>, SignatureError> {
    let hex_digest = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::MissingPrefix)?;

    let bytes = hex::decode(hex_digest).map_err(|_| SignatureError::InvalidHex)?;
    if bytes.len() != DIGEST_LENGTH {
        return Err(SignatureError::InvalidLength {
            actual: bytes.len(),
        });
    }

    Ok(bytes)
}

fn compute_digest(raw_body: &[u8], secret: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(raw_body);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verifies deliveries against a fixed webhook secret.
///
/// The secret is zeroed on drop and never appears in `Debug` output.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Zeroizing<Vec<u8>>,
}

impl SignatureVerifier {
    /// Create a verifier for the given shared secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
        }
    }

    /// See [`verify`].
    pub fn verify(&self, raw_body: &[u8], provided_signature: &str) -> bool {
        verify(raw_body, &self.secret, provided_signature)
    }

    /// See [`check`].
    pub fn check(&self, raw_body: &[u8], provided_signature: &str) -> Result<(), SignatureError> {
        check(raw_body, &self.secret, provided_signature)
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<REDACTED>")
            .finish()
    }
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;
