//! Media negotiation
//!
//! The [`MediaNegotiator`] converges on one payload type for a content: the
//! first entry of the local preference list that the peer also offered.
//! Media managers are the external collaborators that know which payloads
//! can be handled and how to run a live media session once both the payload
//! and the transport pair are agreed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ErrorCondition;
use crate::events::NegotiatorEvent;
use crate::negotiator::{Negotiator, NegotiatorCore, NegotiatorStatus};
use crate::transport::{TransportCandidate, TransportManager};
use crate::types::{
    ContentBlock, ContentCreator, Description, Jingle, JingleAction, Role, SessionInfo, Stanza,
    StanzaPayload,
};

/// Highest static RTP payload type; ids above it are dynamically assigned
pub const MAX_FIXED_PT: u8 = 95;

/// An RTP payload type offered in a content description
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadType {
    pub id: u8,
    pub name: String,
    pub channels: u16,
    pub clock_rate: u32,
}

impl PayloadType {
    pub fn new(id: u8, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            channels: 1,
            clock_rate: 8000,
        }
    }

    pub fn with_clock_rate(mut self, clock_rate: u32) -> Self {
        self.clock_rate = clock_rate;
        self
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn is_dynamic(&self) -> bool {
        self.id > MAX_FIXED_PT
    }

    /// Whether two payload types denote the same codec.
    ///
    /// Static types compare by id alone. Dynamic ids are only meaningful
    /// together with the codec name.
    pub fn matches(&self, other: &PayloadType) -> bool {
        if self.id != other.id {
            return false;
        }
        !self.is_dynamic() || self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl std::fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} (PT:{})", self.name, self.clock_rate, self.id)
    }
}

/// Best common payload type between a local preference list and a peer offer.
///
/// Iterates `local` in order and returns the first entry also present in
/// `remote`. A `preferred` payload overrides that order when it is common.
pub fn best_common_payload(
    local: &[PayloadType],
    remote: &[PayloadType],
    preferred: Option<&PayloadType>,
) -> Option<PayloadType> {
    let in_remote = |pt: &PayloadType| remote.iter().any(|r| r.matches(pt));

    if let Some(preferred) = preferred {
        if local.iter().any(|l| l.matches(preferred)) && in_remote(preferred) {
            return Some(preferred.clone());
        }
    }

    local.iter().find(|pt| in_remote(pt)).cloned()
}

/// A live media session created once a content is fully established
pub trait MediaSession: Send {
    fn start_transmit(&mut self) -> anyhow::Result<()>;

    fn start_receive(&mut self) -> anyhow::Result<()>;

    fn stop_transmit(&mut self);

    fn stop_receive(&mut self);
}

/// Supplier of payload types and media sessions for one kind of media
pub trait MediaManager: Send + Sync {
    /// Unique name; also used as the content name
    fn name(&self) -> &str;

    /// Supported payload types in preference order
    fn payloads(&self) -> Vec<PayloadType>;

    /// Payload to favour when we are the initiator
    fn preferred_payload(&self) -> Option<PayloadType> {
        None
    }

    fn transport_manager(&self) -> Arc<dyn TransportManager>;

    fn create_media_session(
        &self,
        payload: &PayloadType,
        remote: &TransportCandidate,
        local: &TransportCandidate,
        session: &SessionInfo,
    ) -> anyhow::Result<Box<dyn MediaSession>>;

    /// Whether every payload in `offered` is supported
    fn supports_all(&self, offered: &[PayloadType]) -> bool {
        let ours = self.payloads();
        offered.iter().all(|pt| ours.iter().any(|o| o.matches(pt)))
    }
}

/// Negotiates the payload type of one content
pub struct MediaNegotiator {
    core: NegotiatorCore<NegotiatorEvent>,
    content: String,
    creator: ContentCreator,
    role: Role,
    manager: Arc<dyn MediaManager>,
    local_payloads: Vec<PayloadType>,
    remote_payloads: Vec<PayloadType>,
    best: Option<PayloadType>,
}

impl MediaNegotiator {
    pub fn new(
        content: impl Into<String>,
        creator: ContentCreator,
        role: Role,
        manager: Arc<dyn MediaManager>,
    ) -> Self {
        let content = content.into();
        let local_payloads = manager.payloads();
        Self {
            core: NegotiatorCore::new(format!("media[{}]", content)),
            content,
            creator,
            role,
            manager,
            local_payloads,
            remote_payloads: Vec::new(),
            best: None,
        }
    }

    pub fn manager(&self) -> &Arc<dyn MediaManager> {
        &self.manager
    }

    pub fn local_payloads(&self) -> &[PayloadType] {
        &self.local_payloads
    }

    pub fn remote_payloads(&self) -> &[PayloadType] {
        &self.remote_payloads
    }

    /// The converged payload, or `None` while negotiation is open
    pub fn best_common_payload(&self) -> Option<&PayloadType> {
        self.best.as_ref()
    }

    /// Description to put in outbound content blocks
    pub fn description(&self) -> Description {
        match &self.best {
            Some(best) => Description::new(vec![best.clone()]),
            None => Description::new(self.local_payloads.clone()),
        }
    }

    /// Converge on the peer's offer. `Err` carries the condition to report.
    fn converge(&mut self, offered: &[PayloadType]) -> Result<PayloadType, ErrorCondition> {
        self.remote_payloads = offered.to_vec();
        let preferred = match self.role {
            Role::Initiator => self.manager.preferred_payload(),
            Role::Responder => None,
        };

        match best_common_payload(&self.local_payloads, offered, preferred.as_ref()) {
            Some(best) => {
                info!("{}: negotiated payload {}", self.core.label(), best);
                self.best = Some(best.clone());
                self.core.set_status(NegotiatorStatus::Succeeded);
                self.core.emit(NegotiatorEvent::MediaEstablished {
                    content: self.content.clone(),
                    payload: best.clone(),
                });
                Ok(best)
            }
            None => {
                warn!(
                    "{}: no common payload between {:?} and {:?}",
                    self.core.label(),
                    self.local_payloads.iter().map(|p| p.id).collect::<Vec<_>>(),
                    offered.iter().map(|p| p.id).collect::<Vec<_>>()
                );
                self.core.set_status(NegotiatorStatus::Failed);
                Err(ErrorCondition::NegotiationError)
            }
        }
    }

    /// Check a payload list the peer sent back against our selection.
    fn verify(&mut self, accepted: &[PayloadType]) -> Result<(), ErrorCondition> {
        if accepted.len() > 1 {
            return Err(ErrorCondition::MalformedStanza);
        }
        let Some(accepted) = accepted.first() else {
            return Ok(());
        };
        match &self.best {
            Some(best) if best.matches(accepted) => Ok(()),
            Some(best) => {
                warn!(
                    "{}: peer accepted {} but {} was negotiated",
                    self.core.label(),
                    accepted,
                    best
                );
                Err(ErrorCondition::NegotiationError)
            }
            None => self.converge(std::slice::from_ref(accepted)).map(|_| ()),
        }
    }

    fn content_accept(&self) -> Stanza {
        let block = ContentBlock::new(self.creator, self.content.clone())
            .with_description(self.description());
        Stanza::jingle(Jingle::new(JingleAction::ContentAccept).with_content(block))
    }

    fn handle_description(
        &mut self,
        stanza: &Stanza,
        action: JingleAction,
        description: &Description,
    ) -> Vec<Stanza> {
        let outcome = match action {
            JingleAction::SessionInitiate => match self.converge(&description.payloads) {
                Ok(_) => {
                    let accept = self.content_accept();
                    match self.core.expect_ack(accept.id.clone()) {
                        Ok(()) => return vec![accept],
                        Err(e) => {
                            warn!("{}: not sending content-accept: {}", self.core.label(), e);
                            Ok(())
                        }
                    }
                }
                Err(condition) => Err(condition),
            },
            JingleAction::ContentAccept => {
                if self.best.is_some() {
                    self.verify(&description.payloads)
                } else {
                    self.converge(&description.payloads).map(|_| ())
                }
            }
            JingleAction::SessionAccept => self.verify(&description.payloads),
            JingleAction::SessionInfo if self.core.status() == NegotiatorStatus::Pending => {
                self.converge(&description.payloads).map(|_| ())
            }
            _ => Ok(()),
        };

        match outcome {
            Ok(()) => Vec::new(),
            Err(condition) => {
                self.core.set_status(NegotiatorStatus::Failed);
                vec![Stanza::error_for(
                    stanza,
                    condition,
                    Some(format!("{} payload negotiation failed", self.content)),
                )]
            }
        }
    }
}

impl Negotiator for MediaNegotiator {
    type Event = NegotiatorEvent;

    fn core(&self) -> &NegotiatorCore<NegotiatorEvent> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NegotiatorCore<NegotiatorEvent> {
        &mut self.core
    }

    fn do_start(&mut self) -> Vec<Stanza> {
        // Media waits for the peer's list; nothing to send up front.
        Vec::new()
    }

    fn dispatch_incoming(&mut self, stanza: &Stanza) -> Vec<Stanza> {
        match &stanza.payload {
            StanzaPayload::Result => {
                if self.core.clear_expected(&stanza.id) {
                    debug!("{}: content-accept acknowledged", self.core.label());
                }
                Vec::new()
            }
            StanzaPayload::Error { .. } => Vec::new(),
            StanzaPayload::Jingle(jingle) => {
                let name = self.content.clone();
                let description = jingle
                    .contents_named(&name)
                    .find_map(|c| c.description.as_ref());
                match description {
                    Some(description) => self.handle_description(stanza, jingle.action, description),
                    None => Vec::new(),
                }
            }
        }
    }

    fn do_close(&mut self) {
        self.core.emit(NegotiatorEvent::MediaClosed {
            content: self.content.clone(),
            payload: self.best.clone(),
        });
    }
}

impl std::fmt::Debug for MediaNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaNegotiator")
            .field("content", &self.content)
            .field("manager", &self.manager.name())
            .field("status", &self.core.status())
            .field("best", &self.best)
            .finish()
    }
}
