//! Failure values and their wire representation.
//!
//! Handler failures cross the channel as a closed tagged union; an
//! unrecognized tag degrades to [`Reason::Unknown`] so the boundary never
//! fails to deliver *some* typed failure. Plain values (a cancel reason like
//! `"quit"`) cross unwrapped and come back unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wire::CallId;

/// A failure value as seen by handlers and callers on either side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Reason {
    /// Task was aborted.
    #[error("aborted: {0}")]
    Abort(String),

    /// A required resource is missing.
    #[error("missing resource: {0}")]
    MissingResource(String),

    /// The remote side answered with something unexpected.
    #[error("unexpected response: {message} (status {status})")]
    UnexpectedResponse { message: String, status: u16 },

    /// Failure of no more specific kind. `details` preserves whatever extra
    /// context accompanied the original.
    #[error("{message}")]
    Unknown { message: String, details: String },

    /// Password / credential failure.
    #[error("password error: {message} (code {code})")]
    Password { message: String, code: i32 },

    /// Input that is structurally not the expected format.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Error raised while parsing otherwise well-formed data.
    #[error("format error: {0}")]
    Format(String),

    /// A plain failure value that was never an error to begin with. It is
    /// passed through the boundary untouched.
    #[error("{0}")]
    Value(String),
}

mod tag {
    pub const ABORT: &str = "AbortError";
    pub const MISSING_RESOURCE: &str = "MissingResourceError";
    pub const UNEXPECTED_RESPONSE: &str = "UnexpectedResponseError";
    pub const UNKNOWN: &str = "UnknownError";
    pub const PASSWORD: &str = "PasswordError";
    pub const INVALID_FORMAT: &str = "InvalidFormatError";
    pub const FORMAT: &str = "FormatError";
}

/// Serializable form of a [`Reason`] crossing the channel boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireReason {
    /// A typed error, tagged by kind name.
    Wrapped {
        tag: String,
        message: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        details: Option<String>,
        #[serde(default)]
        code: Option<i32>,
    },
    /// A plain value, crossing unwrapped.
    Plain(String),
}

impl WireReason {
    fn wrapped(tag: &str, message: &str) -> Self {
        Self::Wrapped {
            tag: tag.to_owned(),
            message: message.to_owned(),
            status: None,
            details: None,
            code: None,
        }
    }

    /// Reconstruct the local failure value. An unrecognized tag degrades to
    /// [`Reason::Unknown`], preserving the message and a rendering of the
    /// original as details.
    pub fn into_reason(self) -> Reason {
        match self {
            WireReason::Plain(value) => Reason::Value(value),
            WireReason::Wrapped {
                tag,
                message,
                status,
                details,
                code,
            } => match tag.as_str() {
                tag::ABORT => Reason::Abort(message),
                tag::MISSING_RESOURCE => Reason::MissingResource(message),
                tag::UNEXPECTED_RESPONSE => Reason::UnexpectedResponse {
                    message,
                    status: status.unwrap_or(0),
                },
                tag::UNKNOWN => Reason::Unknown {
                    message,
                    details: details.unwrap_or_default(),
                },
                tag::PASSWORD => Reason::Password {
                    message,
                    code: code.unwrap_or(0),
                },
                tag::INVALID_FORMAT => Reason::InvalidFormat(message),
                tag::FORMAT => Reason::Format(message),
                other => Reason::Unknown {
                    details: format!("{other}: {message}"),
                    message,
                },
            },
        }
    }
}

impl Reason {
    /// Wrap for cross-boundary transit.
    pub fn to_wire(&self) -> WireReason {
        match self {
            Reason::Abort(message) => WireReason::wrapped(tag::ABORT, message),
            Reason::MissingResource(message) => WireReason::wrapped(tag::MISSING_RESOURCE, message),
            Reason::UnexpectedResponse { message, status } => WireReason::Wrapped {
                tag: tag::UNEXPECTED_RESPONSE.to_owned(),
                message: message.clone(),
                status: Some(*status),
                details: None,
                code: None,
            },
            Reason::Unknown { message, details } => WireReason::Wrapped {
                tag: tag::UNKNOWN.to_owned(),
                message: message.clone(),
                status: None,
                details: Some(details.clone()),
                code: None,
            },
            Reason::Password { message, code } => WireReason::Wrapped {
                tag: tag::PASSWORD.to_owned(),
                message: message.clone(),
                status: None,
                details: None,
                code: Some(*code),
            },
            Reason::InvalidFormat(message) => WireReason::wrapped(tag::INVALID_FORMAT, message),
            Reason::Format(message) => WireReason::wrapped(tag::FORMAT, message),
            Reason::Value(value) => WireReason::Plain(value.clone()),
        }
    }
}

impl From<Reason> for WireReason {
    fn from(reason: Reason) -> Self {
        reason.to_wire()
    }
}

impl From<WireReason> for Reason {
    fn from(wire: WireReason) -> Self {
        wire.into_reason()
    }
}

/// Fatal local protocol violations.
///
/// These indicate a transport or programming defect, not a remote-side
/// business failure, and are never converted into replies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A reply arrived for a call id with no pending entry. A stray reply
    /// means the table or transport is corrupt; this ends the endpoint.
    #[error("cannot resolve reply for unknown {0}")]
    UnknownCallId(CallId),

    /// An inbound action names no registered handler and carries no call id,
    /// so there is nowhere to report the failure.
    #[error("no handler registered for action {0:?}")]
    UnknownAction(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_every_kind() {
        let reasons = [
            Reason::Abort("stop".into()),
            Reason::MissingResource("doc.bin".into()),
            Reason::UnexpectedResponse {
                message: "bad gateway".into(),
                status: 502,
            },
            Reason::Unknown {
                message: "boom".into(),
                details: "stack".into(),
            },
            Reason::Password {
                message: "need password".into(),
                code: 1,
            },
            Reason::InvalidFormat("not a document".into()),
            Reason::Format("bad xref".into()),
        ];
        for reason in reasons {
            assert_eq!(reason.to_wire().into_reason(), reason);
        }
    }

    #[test]
    fn plain_value_passes_through_unwrapped() {
        let reason = Reason::Value("quit".into());
        let wire = reason.to_wire();
        assert_eq!(wire, WireReason::Plain("quit".into()));
        assert_eq!(wire.into_reason(), reason);
    }

    #[test]
    fn unrecognized_tag_degrades_to_unknown() {
        let wire = WireReason::Wrapped {
            tag: "SomethingNewError".into(),
            message: "later protocol version".into(),
            status: None,
            details: None,
            code: None,
        };
        match wire.into_reason() {
            Reason::Unknown { message, details } => {
                assert_eq!(message, "later protocol version");
                assert_eq!(details, "SomethingNewError: later protocol version");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn wire_reason_survives_serialization() {
        let wire = Reason::UnexpectedResponse {
            message: "teapot".into(),
            status: 418,
        }
        .to_wire();
        let bytes = serde_json::to_vec(&wire).unwrap();
        let back: WireReason = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, wire);
    }
}
