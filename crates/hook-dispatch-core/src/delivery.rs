//! Inbound webhook deliveries.
//!
//! A [`Delivery`] is built once the request headers have been extracted and the
//! signature checked. Only `action` and `installation.id` are read from the
//! payload; handlers decode the rest themselves from [`Delivery::raw_payload`].

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::auth::InstallationId;
use crate::{DeliveryId, ValidationError};

pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";
pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

// Raw payloads are stored base64 encoded so that the persisted JSON stays compact.
mod payload_serde {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// The three GitHub headers every delivery must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHeaders {
    pub delivery_id: DeliveryId,
    pub event_name: String,
    pub signature: String,
}

impl DeliveryHeaders {
    /// Extract the GitHub headers. Header names are matched case-insensitively.
    pub fn from_http_headers(headers: &HashMap<String, String>) -> Result<Self, ValidationError> {
        let delivery_id = DeliveryId::new(required_header(headers, DELIVERY_HEADER)?)?;
        let event_name = required_header(headers, EVENT_HEADER)?.to_string();
        let signature = required_header(headers, SIGNATURE_HEADER)?.to_string();

        Ok(Self {
            delivery_id,
            event_name,
            signature,
        })
    }
}

fn required_header<'a>(
    headers: &'a HashMap<String, String>,
    name: &str,
) -> Result<&'a str, ValidationError> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ValidationError::Required {
            field: name.to_string(),
        })
}

#[derive(Debug, Deserialize)]
struct InstallationRef {
    id: u64,
}

/// The only payload fields the pipeline itself looks at.
#[derive(Debug, Deserialize)]
struct PayloadProbe {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    installation: Option<InstallationRef>,
}

/// A verified webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub event_name: String,
    pub action: Option<String>,
    pub installation_id: Option<InstallationId>,
    pub received_at: DateTime<Utc>,
    pub signature: String,
    #[serde(with = "payload_serde")]
    pub raw_payload: Bytes,
}

impl Delivery {
    /// Build a delivery from verified headers and the exact request body.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidFormat` when the body is not a JSON
    /// object, or when `action` or `installation.id` have the wrong type.
    pub fn from_parts(
        headers: DeliveryHeaders,
        raw_payload: Bytes,
        received_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let fields = parse_payload(&raw_payload)?;

        Ok(Self {
            id: headers.delivery_id,
            event_name: headers.event_name,
            action: fields.action,
            installation_id: fields.installation.map(|i| InstallationId::new(i.id)),
            received_at,
            signature: headers.signature,
            raw_payload,
        })
    }

    /// Decode the full payload into a handler-specific type.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.raw_payload)
    }

    /// `event.action` or just `event` for action-less events.
    pub fn event_label(&self) -> String {
        match &self.action {
            Some(action) => format!("{}.{}", self.event_name, action),
            None => self.event_name.clone(),
        }
    }
}

fn parse_payload(raw_payload: &[u8]) -> Result<PayloadProbe, ValidationError> {
    // serde would happily read a struct out of a JSON array
    let first = raw_payload
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .copied();
    if first != Some(b'{') {
        return Err(ValidationError::InvalidFormat {
            field: "payload".to_string(),
            message: "must be a JSON object".to_string(),
        });
    }

    serde_json::from_slice(raw_payload).map_err(|e| ValidationError::InvalidFormat {
        field: "payload".to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
#[path = "delivery_tests.rs"]
mod tests;
