//! Message envelope
//!
//! Every message on the wire is a UTF-8 JSON object: the domain payload's
//! fields at the top level plus two metadata fields stamped at publish time.
//!
//! - `timestamp`: creation time, ISO 8601 in UTC with millisecond precision
//! - `messageId`: `msg_<epoch-ms>_<9 base-36 chars>`
//!
//! Metadata wins over payload fields of the same name.

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

const ID_SUFFIX_LEN: usize = 9;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    pub timestamp: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
}

impl Envelope {
    /// Wrap `payload`, stamping a fresh timestamp and message id.
    pub fn wrap(mut payload: Map<String, Value>) -> Self {
        payload.remove("timestamp");
        payload.remove("messageId");
        Self {
            payload,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message_id: generate_message_id(),
        }
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse a delivered body. Fails when either metadata field is missing.
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    /// The `type` discriminator set by the domain event helpers.
    pub fn event_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }

    /// Deserialize the payload (without metadata) into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }
}

/// Broker-side metadata of a delivery, handed to handlers next to the
/// decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

pub fn generate_message_id() -> String {
    let mut n = Uuid::new_v4().as_u128();
    let mut suffix = String::with_capacity(ID_SUFFIX_LEN);
    for _ in 0..ID_SUFFIX_LEN {
        suffix.push(BASE36[(n % 36) as usize] as char);
        n /= 36;
    }
    format!("msg_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// Checks the `msg_<epoch-ms>_<suffix>` shape produced by
/// [`generate_message_id`].
pub fn is_valid_message_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("msg_") else {
        return false;
    };
    let Some((millis, suffix)) = rest.split_once('_') else {
        return false;
    };
    !millis.is_empty()
        && millis.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == ID_SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
}
