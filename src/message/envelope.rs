//! Versioned wire envelope for queue message bodies.
//!
//! Every body on every queue is a JSON object:
//!
//! ```text
//! { "version": 1, "type": "data", "id": "<uuid>", "sent_at": "<rfc3339>", "payload": { ... } }
//! ```
//!
//! Decoding validates the version and the `type` discriminator before the
//! payload is looked at; anything unexpected is a `DataError`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DataError;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// The only message type carried on the queues.
pub const DATA_TYPE: &str = "data";

/// A validated message with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub payload: T,
}

/// Header fields, parsed before the payload so a bad discriminator is
/// reported as such rather than as a payload shape mismatch.
#[derive(Deserialize)]
struct Header {
    version: u32,
    #[serde(rename = "type")]
    kind: String,
}

impl<T> Envelope<T> {
    /// Wraps a payload as a fresh data message.
    pub fn data(payload: T) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: DATA_TYPE.to_string(),
            id: Uuid::new_v4(),
            sent_at: Utc::now(),
            payload,
        }
    }
}

/// Encodes a payload into a data envelope body.
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, DataError> {
    Ok(serde_json::to_vec(&Envelope::data(payload))?)
}

/// Decodes and validates an envelope body.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<Envelope<T>, DataError> {
    let header: Header =
        serde_json::from_slice(body).map_err(|e| DataError::Malformed(e.to_string()))?;

    if header.version != ENVELOPE_VERSION {
        return Err(DataError::UnsupportedVersion {
            found: header.version,
            expected: ENVELOPE_VERSION,
        });
    }
    if header.kind != DATA_TYPE {
        return Err(DataError::UnknownType(header.kind));
    }

    serde_json::from_slice(body).map_err(|e| DataError::Malformed(e.to_string()))
}
