//! Event types and the listener registry
//!
//! Listeners subscribe to an [`EventBus`] and receive events over an
//! unbounded tokio channel. Publishing works on a snapshot of the subscriber
//! table, so a listener may be added or removed from any thread while an
//! event is being delivered.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::errors::{ErrorCondition, TerminateReason};
use crate::media::PayloadType;
use crate::session::SessionState;
use crate::transport::TransportCandidate;
use crate::types::{Jid, SessionId, StanzaId};

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Thread-safe table of event subscribers
pub struct EventBus<E> {
    subscribers: Mutex<Vec<(ListenerId, mpsc::UnboundedSender<E>)>>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> (ListenerId, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ListenerId::next();
        self.subscribers.lock().push((id, tx));
        (id, rx)
    }

    /// Returns `false` if the listener was not registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(listener, _)| *listener != id);
        subscribers.len() != before
    }

    /// Deliver `event` to every subscriber in subscription order.
    pub fn publish(&self, event: &E) {
        let snapshot: Vec<(ListenerId, mpsc::UnboundedSender<E>)> =
            self.subscribers.lock().clone();

        let mut closed = Vec::new();
        for (id, tx) in &snapshot {
            if tx.send(event.clone()).is_err() {
                closed.push(*id);
            }
        }

        if !closed.is_empty() {
            trace!("Pruning {} closed listener(s)", closed.len());
            self.subscribers
                .lock()
                .retain(|(id, _)| !closed.contains(id));
        }
    }

    pub fn listener_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

/// Events raised by media, transport and content negotiators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NegotiatorEvent {
    MediaEstablished {
        content: String,
        payload: PayloadType,
    },
    MediaClosed {
        content: String,
        payload: Option<PayloadType>,
    },
    TransportEstablished {
        content: String,
        local: TransportCandidate,
        remote: TransportCandidate,
    },
    TransportClosed {
        content: String,
        local: Option<TransportCandidate>,
    },
    TransportFailed {
        content: String,
        condition: ErrorCondition,
    },
    ContentEstablished {
        content: String,
        payload: PayloadType,
        local: TransportCandidate,
        remote: TransportCandidate,
    },
}

impl NegotiatorEvent {
    pub fn content(&self) -> &str {
        match self {
            NegotiatorEvent::MediaEstablished { content, .. }
            | NegotiatorEvent::MediaClosed { content, .. }
            | NegotiatorEvent::TransportEstablished { content, .. }
            | NegotiatorEvent::TransportClosed { content, .. }
            | NegotiatorEvent::TransportFailed { content, .. }
            | NegotiatorEvent::ContentEstablished { content, .. } => content,
        }
    }
}

/// Events delivered to session listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    StateChanged {
        sid: SessionId,
        from: SessionState,
        to: SessionState,
    },
    /// A content reached full establishment and its media session started
    Established {
        sid: SessionId,
        content: String,
        payload: PayloadType,
        local: TransportCandidate,
        remote: TransportCandidate,
    },
    Declined {
        sid: SessionId,
    },
    Redirected {
        sid: SessionId,
        target: String,
    },
    Closed {
        sid: SessionId,
        reason: TerminateReason,
    },
    ClosedOnError {
        sid: SessionId,
        condition: ErrorCondition,
        message: String,
    },
    MediaReceived {
        sid: SessionId,
        participant: Jid,
    },
    Negotiation {
        sid: SessionId,
        event: NegotiatorEvent,
    },
}

/// An incoming `session-initiate` waiting to be accepted or rejected
#[derive(Debug, Clone, PartialEq)]
pub struct JingleSessionRequest {
    pub sid: SessionId,
    pub from: Jid,
    pub stanza_id: StanzaId,
    /// The `session-initiate` stanza as received
    pub stanza: crate::types::Stanza,
}

/// Events delivered to manager listeners
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    SessionRequested(JingleSessionRequest),
    SessionCreated(SessionId),
    SessionRemoved(SessionId),
}
