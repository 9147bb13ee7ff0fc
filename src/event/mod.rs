//! Analytics event model.
//!
//! An [`Event`] is the unit of work that flows from ingress, through the
//! durable log, into the store. Construction validates the required fields,
//! so every `Event` value in the process is known to be well-formed.

pub mod codec;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Errors raised when an inbound request cannot become an [`Event`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("request body is not a JSON object: {reason}")]
    MalformedBody { reason: String },

    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("timestamp {value:?} is not a valid RFC 3339 time")]
    InvalidTimestamp { value: String },
}

/// A single analytics event.
///
/// Fields are private: an event is immutable once created and carries no
/// identity beyond its values, so two events with equal fields are
/// indistinguishable (a redelivery looks exactly like a duplicate submit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    site_id: String,
    event_type: String,
    path: String,
    user_id: String,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Builds a validated event. `path` and `user_id` may be empty.
    pub fn new(
        site_id: impl Into<String>,
        event_type: impl Into<String>,
        path: impl Into<String>,
        user_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let site_id = site_id.into();
        let event_type = event_type.into();

        if site_id.is_empty() {
            return Err(ValidationError::EmptyField { field: "site_id" });
        }
        if event_type.is_empty() {
            return Err(ValidationError::EmptyField {
                field: "event_type",
            });
        }

        Ok(Self {
            site_id,
            event_type,
            path: path.into(),
            user_id: user_id.into(),
            timestamp,
        })
    }

    /// Parses an inbound JSON request body into a validated event.
    pub fn from_request_body(body: &[u8]) -> Result<Self, ValidationError> {
        let candidate: EventCandidate =
            serde_json::from_slice(body).map_err(|e| ValidationError::MalformedBody {
                reason: e.to_string(),
            })?;

        candidate.into_event()
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Caller-supplied time of the event (not the time it was received).
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Loosely-typed event fields as they arrive over the wire.
///
/// Every field is optional here so that absence can be reported per field
/// instead of as a generic deserialization failure. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct EventCandidate {
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl EventCandidate {
    pub(crate) fn into_event(self) -> Result<Event, ValidationError> {
        let site_id = self
            .site_id
            .ok_or(ValidationError::MissingField { field: "site_id" })?;
        let event_type = self.event_type.ok_or(ValidationError::MissingField {
            field: "event_type",
        })?;
        let raw_timestamp = self.timestamp.ok_or(ValidationError::MissingField {
            field: "timestamp",
        })?;

        if raw_timestamp.is_empty() {
            return Err(ValidationError::EmptyField { field: "timestamp" });
        }

        let timestamp = DateTime::parse_from_rfc3339(&raw_timestamp)
            .map_err(|_| ValidationError::InvalidTimestamp {
                value: raw_timestamp.clone(),
            })?
            .with_timezone(&Utc);

        Event::new(
            site_id,
            event_type,
            self.path.unwrap_or_default(),
            self.user_id.unwrap_or_default(),
            timestamp,
        )
    }
}
