//! Wire codec for events carried through the durable log.
//!
//! Payloads are self-describing JSON objects. Decoding ignores keys it does
//! not know about so producers can add fields without breaking consumers that
//! are still draining older messages.

use chrono::SecondsFormat;
use thiserror::Error;

use super::{Event, EventCandidate, ValidationError};

/// Errors that can occur while decoding a queued payload.
///
/// A decode error is permanent for that payload: reading the same bytes again
/// yields the same error.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not a JSON event object: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("required field {field} is missing")]
    MissingField { field: &'static str },

    #[error("timestamp {value:?} is not a valid RFC 3339 time")]
    InvalidTimestamp { value: String },
}

impl DecodeError {
    /// Short label used as a metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingField { .. } => "missing_field",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
        }
    }
}

impl From<ValidationError> for DecodeError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::MissingField { field } | ValidationError::EmptyField { field } => {
                Self::MissingField { field }
            }
            ValidationError::InvalidTimestamp { value } => Self::InvalidTimestamp { value },
            ValidationError::MalformedBody { reason } => Self::Malformed(
                <serde_json::Error as serde::de::Error>::custom(reason),
            ),
        }
    }
}

/// Encodes an event into its queued payload.
pub fn encode(event: &Event) -> Vec<u8> {
    let value = serde_json::json!({
        "site_id": event.site_id(),
        "event_type": event.event_type(),
        "path": event.path(),
        "user_id": event.user_id(),
        "timestamp": event
            .timestamp()
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
    });

    value.to_string().into_bytes()
}

/// Decodes a queued payload back into an event.
pub fn decode(payload: &[u8]) -> Result<Event, DecodeError> {
    let candidate: EventCandidate = serde_json::from_slice(payload)?;
    Ok(candidate.into_event()?)
}
