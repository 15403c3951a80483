//! Typed email payloads parsed from bus envelopes
//!
//! A payload missing a required field can never be delivered; it is dropped
//! to the DLQ immediately, with no retries.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::bus::{Envelope, EventType};

/// A payload that cannot be parsed into a deliverable email
#[derive(Debug, thiserror::Error)]
#[error("malformed {event}: {reason}")]
pub struct PayloadError {
    pub event: &'static str,
    pub reason: String,
}

impl PayloadError {
    fn missing(event: &'static str, field: &str) -> Self {
        Self { event, reason: format!("missing required field `{}`", field) }
    }

    fn invalid(event: &'static str, field: &str) -> Self {
        Self { event, reason: format!("invalid value for `{}`", field) }
    }
}

/// The email events this service renders, with their required fields
#[derive(Debug, Clone, PartialEq)]
pub enum EmailPayload {
    Verification {
        user_name: String,
        verification_token: String,
        expires_at: DateTime<Utc>,
        verification_url: Option<String>,
    },
    PasswordReset {
        user_name: String,
        reset_token: String,
        expires_at: DateTime<Utc>,
        reset_url: Option<String>,
    },
    PasswordChanged {
        user_name: String,
        changed_at: DateTime<Utc>,
    },
    AccountApproval {
        user_name: String,
        login_url: Option<String>,
        approved_at: DateTime<Utc>,
    },
}

impl EmailPayload {
    /// Parse the typed payload out of an envelope's `data` object.
    /// Non-email event types return `None`.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, PayloadError> {
        let data = &envelope.data;
        let payload = match envelope.event_type {
            EventType::Verification => EmailPayload::Verification {
                user_name: required_str(data, "verification", "user_name")?,
                verification_token: required_str(data, "verification", "verification_token")?,
                expires_at: required_timestamp(data, "verification", "expires_at")?,
                verification_url: optional_str(data, "verification_url"),
            },
            EventType::PasswordReset => EmailPayload::PasswordReset {
                user_name: required_str(data, "password_reset", "user_name")?,
                reset_token: required_str(data, "password_reset", "reset_token")?,
                expires_at: required_timestamp(data, "password_reset", "expires_at")?,
                reset_url: optional_str(data, "reset_url"),
            },
            EventType::PasswordChanged => EmailPayload::PasswordChanged {
                user_name: required_str(data, "password_changed", "user_name")?,
                changed_at: required_timestamp(data, "password_changed", "changed_at")?,
            },
            EventType::AccountApproval => EmailPayload::AccountApproval {
                user_name: required_str(data, "account_approval", "user_name")?,
                login_url: optional_str(data, "login_url"),
                approved_at: required_timestamp(data, "account_approval", "approved_at")?,
            },
            _ => return Ok(None),
        };
        Ok(Some(payload))
    }

    /// Template name in the registry
    pub fn template(&self) -> &'static str {
        match self {
            EmailPayload::Verification { .. } => "verification",
            EmailPayload::PasswordReset { .. } => "password_reset",
            EmailPayload::PasswordChanged { .. } => "password_changed",
            EmailPayload::AccountApproval { .. } => "account_approval",
        }
    }

    pub fn subject(&self) -> &'static str {
        match self {
            EmailPayload::Verification { .. } => "Verify your email address",
            EmailPayload::PasswordReset { .. } => "Reset your password",
            EmailPayload::PasswordChanged { .. } => "Your password was changed",
            EmailPayload::AccountApproval { .. } => "Your account has been approved",
        }
    }

    /// Substitution context handed to the template engine
    pub fn context(&self) -> Value {
        match self {
            EmailPayload::Verification {
                user_name,
                verification_token,
                expires_at,
                verification_url,
            } => serde_json::json!({
                "user_name": user_name,
                "verification_token": verification_token,
                "expires_at": expires_at.to_rfc3339(),
                "verification_url": verification_url,
            }),
            EmailPayload::PasswordReset { user_name, reset_token, expires_at, reset_url } => {
                serde_json::json!({
                    "user_name": user_name,
                    "reset_token": reset_token,
                    "expires_at": expires_at.to_rfc3339(),
                    "reset_url": reset_url,
                })
            }
            EmailPayload::PasswordChanged { user_name, changed_at } => serde_json::json!({
                "user_name": user_name,
                "changed_at": changed_at.to_rfc3339(),
            }),
            EmailPayload::AccountApproval { user_name, login_url, approved_at } => {
                serde_json::json!({
                    "user_name": user_name,
                    "login_url": login_url,
                    "approved_at": approved_at.to_rfc3339(),
                })
            }
        }
    }
}

fn required_str(data: &Value, event: &'static str, field: &str) -> Result<String, PayloadError> {
    match data.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            Err(PayloadError::missing(event, field))
        }
        Some(_) => Err(PayloadError::invalid(event, field)),
    }
}

fn optional_str(data: &Value, field: &str) -> Option<String> {
    data.get(field).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string)
}

fn required_timestamp(
    data: &Value,
    event: &'static str,
    field: &str,
) -> Result<DateTime<Utc>, PayloadError> {
    let raw = match data.get(field) {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::String(_)) | None | Some(Value::Null) => {
            return Err(PayloadError::missing(event, field))
        }
        Some(_) => return Err(PayloadError::invalid(event, field)),
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PayloadError::invalid(event, field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: EventType, data: Value) -> Envelope {
        Envelope::new(event_type, "user@example.com", data)
    }

    #[test]
    fn test_verification_parses() {
        let env = envelope(
            EventType::Verification,
            json!({
                "user_name": "Ada",
                "verification_token": "tok-123",
                "expires_at": "2026-08-01T12:00:00Z",
                "verification_url": "https://example.com/verify",
            }),
        );
        let payload = EmailPayload::from_envelope(&env).unwrap().unwrap();
        match payload {
            EmailPayload::Verification { user_name, verification_url, .. } => {
                assert_eq!(user_name, "Ada");
                assert_eq!(verification_url.as_deref(), Some("https://example.com/verify"));
            }
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn test_missing_required_field_is_an_error() {
        // Scenario from the wire: verification event with empty data
        let env = envelope(EventType::Verification, json!({}));
        let err = EmailPayload::from_envelope(&env).unwrap_err();
        assert!(err.to_string().contains("user_name"));
    }

    #[test]
    fn test_missing_token_is_an_error() {
        let env = envelope(
            EventType::Verification,
            json!({"user_name": "Ada", "expires_at": "2026-08-01T12:00:00Z"}),
        );
        let err = EmailPayload::from_envelope(&env).unwrap_err();
        assert!(err.to_string().contains("verification_token"));
    }

    #[test]
    fn test_invalid_timestamp_is_an_error() {
        let env = envelope(
            EventType::PasswordChanged,
            json!({"user_name": "Ada", "changed_at": "yesterday-ish"}),
        );
        let err = EmailPayload::from_envelope(&env).unwrap_err();
        assert!(err.to_string().contains("changed_at"));
    }

    #[test]
    fn test_optional_fields_may_be_absent() {
        let env = envelope(
            EventType::AccountApproval,
            json!({"user_name": "Ada", "approved_at": "2026-08-01T09:00:00Z"}),
        );
        let payload = EmailPayload::from_envelope(&env).unwrap().unwrap();
        match payload {
            EmailPayload::AccountApproval { login_url, .. } => assert!(login_url.is_none()),
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn test_reservation_events_are_not_email_payloads() {
        let env = envelope(EventType::ReservationCreated, json!({"quantity": 2}));
        assert!(EmailPayload::from_envelope(&env).unwrap().is_none());
    }
}
