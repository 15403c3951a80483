//! Wire envelope for bus messages
//!
//! Every message is JSON: `{type, to, data, metadata}`. Consumers tolerate
//! redelivery and reordering; `metadata.event_id` keys idempotence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event types carried on the bus, one routing key each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Verification,
    PasswordReset,
    PasswordChanged,
    AccountApproval,
    ReservationCreated,
    ReservationConfirmed,
    ReservationCancelled,
    ReservationExpired,
}

impl EventType {
    pub fn routing_key(&self) -> &'static str {
        match self {
            EventType::Verification => "email.verification",
            EventType::PasswordReset => "email.password_reset",
            EventType::PasswordChanged => "email.password_changed",
            EventType::AccountApproval => "email.account_approval",
            EventType::ReservationCreated => "reservation.created",
            EventType::ReservationConfirmed => "reservation.confirmed",
            EventType::ReservationCancelled => "reservation.cancelled",
            EventType::ReservationExpired => "reservation.expired",
        }
    }

    pub fn is_email(&self) -> bool {
        self.routing_key().starts_with("email.")
    }
}

/// Delivery metadata riding along with every event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub retry_count: u32,

    /// Idempotence key; consumers drop repeats of the same id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
}

/// A bus message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Recipient: an email address for email events, the owning user id for
    /// reservation lifecycle events
    pub to: String,

    pub data: Value,

    pub metadata: EventMetadata,
}

impl Envelope {
    pub fn new(event_type: EventType, to: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            to: to.into(),
            data,
            metadata: EventMetadata {
                user_id: None,
                timestamp: Utc::now(),
                retry_count: 0,
                event_id: Some(Uuid::new_v4()),
            },
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.metadata.user_id = Some(user_id);
        self
    }

    /// Copy for redelivery with the attempt counter bumped
    pub fn next_attempt(mut self) -> Self {
        self.metadata.retry_count += 1;
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Final resting form of a message that exhausted its retries or could
/// never be handled: the original payload plus the error and when it died
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub original: Value,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl DlqEnvelope {
    pub fn new(envelope: Envelope, error: impl Into<String>) -> Self {
        Self {
            original: serde_json::to_value(&envelope).unwrap_or(Value::Null),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// For payloads that never parsed as an envelope
    pub fn from_raw(raw: &[u8], error: impl Into<String>) -> Self {
        Self {
            original: Value::String(String::from_utf8_lossy(raw).into_owned()),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}
