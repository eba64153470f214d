//! Write-intent envelope shared by the gateway and the worker.
//!
//! The gateway never mutates the catalog directly. It wraps each write
//! request in an [`Envelope`], publishes it to the broker and returns. The
//! worker decodes the envelope in two stages:
//!
//! 1. [`Envelope::decode`] validates only the shell (`action`, `data`,
//!    `timestamp`). Any failure here is a [`EnvelopeError::Malformed`].
//! 2. [`Envelope::command`] interprets `data` according to `action` and
//!    yields a typed [`MovieCommand`]. Unknown actions produce `None` so a
//!    newer publisher never wedges an older worker.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "action": "create",
//!   "data": { "title": "Interestelar", "year": 2014 },
//!   "timestamp": "2025-12-11T10:00:00Z"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The bytes are not a structurally valid envelope
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The shell is valid but `data` does not fit the shape implied by `action`
    #[error("payload does not match action '{action}': {reason}")]
    PayloadMismatch { action: String, reason: String },

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Write actions understood by this version of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Delete => "delete",
        }
    }

    /// Map a wire tag to a known action. Unknown tags are not an error.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "create" => Some(Action::Create),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CreatePayload {
    title: String,
    year: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeletePayload {
    id: String,
}

/// A typed write intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovieCommand {
    Create { title: String, year: i32 },
    Delete { id: String },
}

impl MovieCommand {
    pub fn create(title: impl Into<String>, year: i32) -> Self {
        MovieCommand::Create {
            title: title.into(),
            year,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        MovieCommand::Delete { id: id.into() }
    }

    pub fn action(&self) -> Action {
        match self {
            MovieCommand::Create { .. } => Action::Create,
            MovieCommand::Delete { .. } => Action::Delete,
        }
    }

    fn data(&self) -> Result<Value, EnvelopeError> {
        let value = match self {
            MovieCommand::Create { title, year } => serde_json::to_value(CreatePayload {
                title: title.clone(),
                year: *year,
            }),
            MovieCommand::Delete { id } => serde_json::to_value(DeletePayload { id: id.clone() }),
        };
        value.map_err(EnvelopeError::Encode)
    }

    /// Wrap the command in an envelope stamped with the current UTC time and
    /// serialize it.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Envelope::from_command(self)?.to_bytes()
    }
}

/// The envelope shell as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Action tag, kept as a raw string until dispatch
    pub action: String,

    /// Action-specific payload
    pub data: Value,

    /// When the envelope was produced. Informational only.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope for a command, stamped now.
    pub fn from_command(command: &MovieCommand) -> Result<Self, EnvelopeError> {
        Ok(Self {
            action: command.action().as_str().to_string(),
            data: command.data()?,
            timestamp: Utc::now(),
        })
    }

    /// Build an envelope with an arbitrary action tag.
    pub fn raw(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    /// Decode the envelope shell. Does not look at `data`.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)
    }

    /// The known action for this envelope, if any.
    pub fn known_action(&self) -> Option<Action> {
        Action::parse(&self.action)
    }

    /// Interpret `data` against the shape implied by `action`.
    ///
    /// Returns `Ok(None)` for an action this worker does not know.
    pub fn command(&self) -> Result<Option<MovieCommand>, EnvelopeError> {
        let Some(action) = self.known_action() else {
            return Ok(None);
        };

        let command = match action {
            Action::Create => {
                let payload: CreatePayload = self.payload()?;
                if payload.title.trim().is_empty() {
                    return Err(self.mismatch("title must not be empty"));
                }
                MovieCommand::Create {
                    title: payload.title,
                    year: payload.year,
                }
            }
            Action::Delete => {
                let payload: DeletePayload = self.payload()?;
                MovieCommand::Delete { id: payload.id }
            }
        };

        Ok(Some(command))
    }

    fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        T::deserialize(&self.data).map_err(|e| self.mismatch(e.to_string()))
    }

    fn mismatch(&self, reason: impl Into<String>) -> EnvelopeError {
        EnvelopeError::PayloadMismatch {
            action: self.action.clone(),
            reason: reason.into(),
        }
    }
}
