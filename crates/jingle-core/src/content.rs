//! Content negotiation
//!
//! A [`ContentNegotiator`] pairs one media and one transport negotiator
//! for a named `<content>` and rolls their status up.

use std::sync::Arc;

use tracing::{info, trace};

use crate::errors::{JingleError, JingleResult};
use crate::events::NegotiatorEvent;
use crate::media::{MediaManager, MediaNegotiator, MediaSession};
use crate::negotiator::{Negotiator, NegotiatorCore, NegotiatorStatus};
use crate::transport::TransportNegotiator;
use crate::types::{ContentBlock, ContentCreator, SessionInfo, Stanza, StanzaId, StanzaPayload};

pub struct ContentNegotiator {
    core: NegotiatorCore<NegotiatorEvent>,
    creator: ContentCreator,
    name: String,
    media: Option<MediaNegotiator>,
    transport: Option<TransportNegotiator>,
    established: bool,
}

impl ContentNegotiator {
    pub fn new(creator: ContentCreator, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            core: NegotiatorCore::new(format!("content[{}]", name)),
            creator,
            name,
            media: None,
            transport: None,
            established: false,
        }
    }

    pub fn creator(&self) -> ContentCreator {
        self.creator
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn media(&self) -> Option<&MediaNegotiator> {
        self.media.as_ref()
    }

    pub fn transport(&self) -> Option<&TransportNegotiator> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut TransportNegotiator> {
        self.transport.as_mut()
    }

    /// Replace the media negotiator, closing the previous one
    pub fn set_media(&mut self, media: MediaNegotiator) {
        if let Some(mut old) = self.media.replace(media) {
            old.close();
        }
    }

    /// Replace the transport negotiator, closing the previous one
    pub fn set_transport(&mut self, transport: TransportNegotiator) {
        if let Some(mut old) = self.transport.replace(transport) {
            old.close();
        }
    }

    pub fn media_manager(&self) -> Option<&Arc<dyn MediaManager>> {
        self.media.as_ref().map(|m| m.manager())
    }

    /// Roll-up status: failed if either child failed, succeeded if either
    /// child succeeded, pending otherwise.
    pub fn rolled_up_status(&self) -> NegotiatorStatus {
        let statuses = [
            self.media.as_ref().map(|m| m.status()),
            self.transport.as_ref().map(|t| t.status()),
        ];
        if statuses.contains(&Some(NegotiatorStatus::Failed)) {
            NegotiatorStatus::Failed
        } else if statuses.contains(&Some(NegotiatorStatus::Succeeded)) {
            NegotiatorStatus::Succeeded
        } else {
            NegotiatorStatus::Pending
        }
    }

    /// Both children succeeded; stricter than [`Self::rolled_up_status`].
    pub fn is_fully_established(&self) -> bool {
        let media = self.media.as_ref().map(|m| m.status());
        let transport = self.transport.as_ref().map(|t| t.status());
        media == Some(NegotiatorStatus::Succeeded) && transport == Some(NegotiatorStatus::Succeeded)
    }

    /// Whether media has been started for this content
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// The block describing this content in outbound messages
    pub fn content_block(&self) -> ContentBlock {
        let mut block = ContentBlock::new(self.creator, self.name.clone());
        if let Some(media) = &self.media {
            block = block.with_description(media.description());
        }
        if let Some(transport) = &self.transport {
            block = block.with_transport(transport.transport_payload());
        }
        block
    }

    /// Create the media session for the negotiated payload and candidate pair.
    ///
    /// The caller owns the returned session and registers it under the media
    /// manager's name. Media is started for transmit and receive.
    pub fn trigger_content_established(
        &mut self,
        session: &SessionInfo,
    ) -> JingleResult<Box<dyn MediaSession>> {
        if self.established {
            return Err(JingleError::InvalidState(format!(
                "content {} already established",
                self.name
            )));
        }
        let (Some(media), Some(transport)) = (&self.media, &mut self.transport) else {
            return Err(JingleError::MissingCollaborator(format!(
                "content {} has no media or transport negotiator",
                self.name
            )));
        };
        let (Some(payload), Some(established)) =
            (media.best_common_payload().cloned(), transport.established().cloned())
        else {
            return Err(JingleError::InvalidState(format!(
                "content {} is not fully established",
                self.name
            )));
        };

        // Sockets behind the other candidates are no longer needed
        transport.release_unused();

        let mut media_session = media
            .manager()
            .create_media_session(&payload, &established.remote, &established.local, session)
            .map_err(|e| JingleError::MediaSession(e.to_string()))?;
        media_session
            .start_transmit()
            .map_err(|e| JingleError::MediaSession(e.to_string()))?;
        media_session
            .start_receive()
            .map_err(|e| JingleError::MediaSession(e.to_string()))?;

        self.established = true;
        info!(
            "{}: media started with {} over {} <-> {}",
            self.core.label(),
            payload,
            established.local.address(),
            established.remote.address()
        );
        self.core.emit(NegotiatorEvent::ContentEstablished {
            content: self.name.clone(),
            payload,
            local: established.local,
            remote: established.remote,
        });
        Ok(media_session)
    }

    /// Whether `id` is the outstanding request of this content or one of its children
    pub fn awaits_ack(&self, id: &StanzaId) -> bool {
        self.core.is_expected(id)
            || self.media.as_ref().is_some_and(|m| m.core().is_expected(id))
            || self.transport.as_ref().is_some_and(|t| t.core().is_expected(id))
    }

    /// Drain events from both children, followed by our own
    pub fn take_all_events(&mut self) -> Vec<NegotiatorEvent> {
        let mut events = Vec::new();
        if let Some(media) = &mut self.media {
            events.extend(media.take_events());
        }
        if let Some(transport) = &mut self.transport {
            events.extend(transport.take_events());
        }
        events.extend(self.core.take_events());
        events
    }

    fn concerns_us(&self, stanza: &Stanza) -> bool {
        match &stanza.payload {
            StanzaPayload::Jingle(jingle) => jingle.contents.iter().any(|c| c.name == self.name),
            StanzaPayload::Result | StanzaPayload::Error { .. } => true,
        }
    }
}

impl Negotiator for ContentNegotiator {
    type Event = NegotiatorEvent;

    fn core(&self) -> &NegotiatorCore<NegotiatorEvent> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NegotiatorCore<NegotiatorEvent> {
        &mut self.core
    }

    fn do_start(&mut self) -> Vec<Stanza> {
        let mut out = Vec::new();
        if let Some(media) = &mut self.media {
            out.extend(media.start());
        }
        if let Some(transport) = &mut self.transport {
            out.extend(transport.start());
        }
        out
    }

    fn dispatch_incoming(&mut self, stanza: &Stanza) -> Vec<Stanza> {
        if !self.concerns_us(stanza) {
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some(media) = &mut self.media {
            out.extend(media.dispatch_incoming(stanza));
        }
        if let Some(transport) = &mut self.transport {
            out.extend(transport.dispatch_incoming(stanza));
        }
        // One error reply per request, whichever child raised it first
        let mut answered = false;
        out.retain(|reply| {
            if reply.id != stanza.id || reply.error_condition().is_none() {
                return true;
            }
            !std::mem::replace(&mut answered, true)
        });
        trace!("{}: roll-up status {}", self.core.label(), self.rolled_up_status());
        out
    }

    fn status(&self) -> NegotiatorStatus {
        self.rolled_up_status()
    }

    fn do_close(&mut self) {
        if let Some(media) = &mut self.media {
            media.close();
        }
        if let Some(transport) = &mut self.transport {
            // The media session owns the accepted pair once it exists
            if self.established {
                transport.release_unused();
            } else {
                transport.release_all();
            }
            transport.close();
        }
    }
}

impl std::fmt::Debug for ContentNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentNegotiator")
            .field("name", &self.name)
            .field("creator", &self.creator)
            .field("media", &self.media)
            .field("transport", &self.transport)
            .field("established", &self.established)
            .finish()
    }
}
