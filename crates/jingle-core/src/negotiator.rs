//! Behaviour shared by every negotiator
//!
//! A negotiator owns one slice of the negotiation state: media, transport,
//! content or the whole session. [`NegotiatorCore`] carries the pieces all of
//! them have in common: a monotonic status, the single expected-ack slot,
//! the start/close guards and the listener registry. The [`Negotiator`]
//! trait builds the uniform lifecycle on top of it.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::errors::{JingleError, JingleResult};
use crate::events::{EventBus, ListenerId};
use crate::types::{Stanza, StanzaId};

/// Negotiation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiatorStatus {
    Pending,
    Succeeded,
    Failed,
}

impl NegotiatorStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NegotiatorStatus::Pending)
    }
}

impl std::fmt::Display for NegotiatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiatorStatus::Pending => write!(f, "PENDING"),
            NegotiatorStatus::Succeeded => write!(f, "SUCCEEDED"),
            NegotiatorStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// State common to all negotiators
#[derive(Debug)]
pub struct NegotiatorCore<E> {
    label: String,
    status: NegotiatorStatus,
    started: bool,
    closed: bool,
    expected_ack: Option<StanzaId>,
    listeners: EventBus<E>,
    outbox: Vec<E>,
}

impl<E: Clone> NegotiatorCore<E> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            status: NegotiatorStatus::Pending,
            started: false,
            closed: false,
            expected_ack: None,
            listeners: EventBus::new(),
            outbox: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> NegotiatorStatus {
        self.status
    }

    /// Change the status. Terminal statuses are absorbing: once `Succeeded`
    /// or `Failed`, later calls are ignored. Returns whether it changed.
    pub fn set_status(&mut self, status: NegotiatorStatus) -> bool {
        if self.status == status {
            return false;
        }
        if self.status.is_terminal() {
            trace!(
                "{}: ignoring status change {} -> {}",
                self.label, self.status, status
            );
            return false;
        }
        debug!("{}: status changed: {} -> {}", self.label, self.status, status);
        self.status = status;
        true
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Returns `true` only for the first call
    pub fn mark_started(&mut self) -> bool {
        !std::mem::replace(&mut self.started, true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns `true` only for the first call
    pub fn mark_closed(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    pub fn expected_ack(&self) -> Option<&StanzaId> {
        self.expected_ack.as_ref()
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.expected_ack.is_some()
    }

    /// Start waiting for the acknowledgment of `id`.
    ///
    /// Only one request may be outstanding at a time.
    pub fn expect_ack(&mut self, id: StanzaId) -> JingleResult<()> {
        if let Some(outstanding) = &self.expected_ack {
            return Err(JingleError::AckOutstanding {
                outstanding: outstanding.clone(),
                attempted: id,
            });
        }
        trace!("{}: awaiting ack for {}", self.label, id);
        self.expected_ack = Some(id);
        Ok(())
    }

    pub fn is_expected(&self, id: &StanzaId) -> bool {
        self.expected_ack.as_ref() == Some(id)
    }

    /// Clear the slot if it holds `id`; any other id leaves it untouched.
    pub fn clear_expected(&mut self, id: &StanzaId) -> bool {
        if self.is_expected(id) {
            self.expected_ack = None;
            true
        } else {
            false
        }
    }

    pub fn listeners(&self) -> &EventBus<E> {
        &self.listeners
    }

    /// Publish an event to listeners and queue it for the parent negotiator.
    pub fn emit(&mut self, event: E) {
        self.listeners.publish(&event);
        self.outbox.push(event);
    }

    /// Drain events raised since the last call
    pub fn take_events(&mut self) -> Vec<E> {
        std::mem::take(&mut self.outbox)
    }
}

/// Uniform negotiator lifecycle
pub trait Negotiator {
    type Event: Clone;

    fn core(&self) -> &NegotiatorCore<Self::Event>;

    fn core_mut(&mut self) -> &mut NegotiatorCore<Self::Event>;

    /// Negotiator-specific start work; runs at most once.
    fn do_start(&mut self) -> Vec<Stanza>;

    /// Inspect an inbound stanza and produce the responses it calls for.
    fn dispatch_incoming(&mut self, stanza: &Stanza) -> Vec<Stanza>;

    /// Negotiator-specific teardown; runs at most once.
    fn do_close(&mut self) {}

    fn start(&mut self) -> Vec<Stanza> {
        if !self.core_mut().mark_started() {
            return Vec::new();
        }
        debug!("{}: starting", self.core().label());
        self.do_start()
    }

    fn close(&mut self) {
        if self.core_mut().mark_closed() {
            debug!("{}: closing", self.core().label());
            self.do_close();
        }
    }

    fn status(&self) -> NegotiatorStatus {
        self.core().status()
    }

    fn add_listener(&self) -> (ListenerId, tokio::sync::mpsc::UnboundedReceiver<Self::Event>) {
        self.core().listeners().subscribe()
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.core().listeners().unsubscribe(id)
    }

    fn take_events(&mut self) -> Vec<Self::Event> {
        self.core_mut().take_events()
    }
}
