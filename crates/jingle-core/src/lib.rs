//! Jingle (XEP-0166) session negotiation for XMPP peers.
//!
//! The engine negotiates a media session between two parties: which codec to
//! use for each content, and which network candidate pair carries it. It
//! speaks in terms of [`Stanza`] values and leaves XML and the XMPP connection
//! to the collaborator behind [`JingleConnection`].
//!
//! A [`JingleManager`] owns the sessions of one connection. Each
//! [`JingleSession`] drives one [`ContentNegotiator`] per content, which in
//! turn pairs a [`MediaNegotiator`] with a [`TransportNegotiator`].

// Error handling
pub mod errors;

// Protocol data model
pub mod types;

pub mod config;
pub mod logging;
pub mod events;

// Negotiators
pub mod negotiator;
pub mod media;
pub mod transport;
pub mod content;
pub mod session;

pub mod manager;

#[cfg(test)]
mod test_support;

pub use config::{JingleConfig, MediaManagerSelection};
pub use content::ContentNegotiator;
pub use errors::{ErrorCondition, JingleError, JingleResult, TerminateReason};
pub use events::{
    EventBus, JingleSessionRequest, ListenerId, ManagerEvent, NegotiatorEvent, SessionEvent,
};
pub use logging::{setup_logging, LoggingConfig};
pub use manager::{JingleConnection, JingleManager, ManagerStats, ServiceDiscovery};
pub use media::{MediaManager, MediaNegotiator, MediaSession, PayloadType};
pub use negotiator::{Negotiator, NegotiatorStatus};
pub use session::{JingleSession, SessionHandle, SessionState};
pub use transport::{
    SocketAddressChecker, CandidateChecker, CandidateChoice, CandidateProtocol, CandidateType,
    EstablishedTransport, TransportCandidate, TransportKind, TransportManager,
    TransportNegotiator, TransportResolver, TransportState,
};
pub use types::{
    ContentBlock, ContentCreator, Description, Jid, Jingle, JingleAction, Role, SessionId,
    SessionInfo, Stanza, StanzaId, StanzaPayload, TransportPayload,
};

pub mod prelude {
    pub use crate::{
        ErrorCondition, JingleConfig, JingleConnection, JingleError, JingleManager, JingleResult,
        JingleSession, JingleSessionRequest, ManagerEvent, MediaManager, MediaSession,
        PayloadType, ServiceDiscovery, SessionEvent, SessionHandle, SessionState, Stanza,
        TerminateReason, TransportCandidate, TransportManager, TransportResolver,
    };
}

/// Jingle protocol constants
pub mod constants {
    /// Service discovery feature and payload namespace
    pub const NAMESPACE: &str = "http://jabber.org/protocol/jingle";

    /// Window for checking remote candidates, in milliseconds
    pub const DEFAULT_CANDIDATES_ACCEPT_PERIOD_MS: u64 = 4000;

    /// Ceiling for a single candidate check, in milliseconds
    pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 3000;

    pub const DEFAULT_MIN_CHECK_TIMEOUT_MS: u64 = 200;
}
