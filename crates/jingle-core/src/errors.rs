//! Error types for the Jingle negotiation engine
//!
//! Two families of errors live here:
//!
//! - [`JingleError`] is returned to local callers for misuse of the API
//!   (starting a session twice, unknown session ids, a second outstanding
//!   request, a malformed JID).
//! - [`ErrorCondition`] is the fixed set of stanza error conditions the engine
//!   puts on the wire when the remote party misbehaves. These never surface as
//!   `Err` from a dispatch call; they become error stanzas and status changes.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

use crate::types::{SessionId, StanzaId};

/// Errors surfaced to local callers of the engine
#[derive(Debug, Error)]
pub enum JingleError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Invalid JID: {0}")]
    InvalidJid(String),

    #[error("Request {outstanding} is still awaiting acknowledgment, cannot track {attempted}")]
    AckOutstanding {
        outstanding: StanzaId,
        attempted: StanzaId,
    },

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(String),

    #[error("Media session error: {0}")]
    MediaSession(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

pub type JingleResult<T> = std::result::Result<T, JingleError>;

/// Stanza error conditions the engine sends to the peer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCondition {
    /// Action not valid for the current state, or structurally broken
    MalformedStanza,
    /// Payload or candidate selections do not match
    NegotiationError,
    /// Action valid in the protocol but not at this point of the session
    OutOfOrder,
    /// No usable transport could be established
    FailedTransport,
    /// The session id is not known on this connection
    UnknownSession,
    /// No offered content can be handled locally
    UnsupportedContent,
    /// The offered transport method is not supported
    UnsupportedTransports,
}

impl ErrorCondition {
    /// Whether receiving or producing this condition ends the session.
    ///
    /// Sequencing errors are reported to the peer without tearing down
    /// negotiation state; everything else is unrecoverable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorCondition::OutOfOrder | ErrorCondition::UnknownSession)
    }
}

/// Reason attached to a `session-terminate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateReason {
    Success,
    Decline,
    Busy,
    Cancel,
    /// The party went offline
    Gone,
    /// The peer moved elsewhere; carries the new address
    Redirect(String),
    FailedTransport,
    FailedApplication,
    IncompatibleParameters,
    GeneralError,
    Text(String),
}

impl TerminateReason {
    /// Map an error condition to the reason announced on teardown.
    pub fn for_condition(condition: ErrorCondition) -> Self {
        match condition {
            ErrorCondition::FailedTransport | ErrorCondition::UnsupportedTransports => {
                TerminateReason::FailedTransport
            }
            ErrorCondition::NegotiationError | ErrorCondition::UnsupportedContent => {
                TerminateReason::IncompatibleParameters
            }
            _ => TerminateReason::GeneralError,
        }
    }
}

impl std::fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminateReason::Success => write!(f, "success"),
            TerminateReason::Decline => write!(f, "decline"),
            TerminateReason::Busy => write!(f, "busy"),
            TerminateReason::Cancel => write!(f, "cancel"),
            TerminateReason::Gone => write!(f, "gone"),
            TerminateReason::Redirect(target) => write!(f, "redirect ({})", target),
            TerminateReason::FailedTransport => write!(f, "failed-transport"),
            TerminateReason::FailedApplication => write!(f, "failed-application"),
            TerminateReason::IncompatibleParameters => write!(f, "incompatible-parameters"),
            TerminateReason::GeneralError => write!(f, "general-error"),
            TerminateReason::Text(text) => write!(f, "{}", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn condition_wire_names() {
        assert_eq!(ErrorCondition::MalformedStanza.to_string(), "malformed-stanza");
        assert_eq!(ErrorCondition::OutOfOrder.to_string(), "out-of-order");
        assert_eq!(
            ErrorCondition::from_str("negotiation-error").unwrap(),
            ErrorCondition::NegotiationError
        );
    }

    #[test]
    fn teardown_reason_follows_condition() {
        assert_eq!(
            TerminateReason::for_condition(ErrorCondition::UnsupportedTransports),
            TerminateReason::FailedTransport
        );
        assert_eq!(
            TerminateReason::for_condition(ErrorCondition::NegotiationError),
            TerminateReason::IncompatibleParameters
        );
        assert_eq!(
            TerminateReason::for_condition(ErrorCondition::MalformedStanza),
            TerminateReason::GeneralError
        );
    }

    #[test]
    fn sequencing_errors_are_not_fatal() {
        assert!(!ErrorCondition::OutOfOrder.is_fatal());
        assert!(ErrorCondition::NegotiationError.is_fatal());
        assert!(ErrorCondition::FailedTransport.is_fatal());
    }
}
