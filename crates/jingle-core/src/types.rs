//! Common types shared by the negotiators
//!
//! These are the structured forms of inbound Jingle actions and outbound
//! response intents. Serialization to XML is left to the XMPP layer; the
//! engine only deals with already-parsed actions.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::errors::{ErrorCondition, JingleError, JingleResult, TerminateReason};
use crate::media::PayloadType;
use crate::transport::{TransportCandidate, TransportKind};

/// Jingle session id (`sid`)
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stanza (IQ) id used to correlate requests with their acknowledgments
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StanzaId(pub String);

impl StanzaId {
    /// Generate a fresh random stanza id
    pub fn generate() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        Self(format!("jingle-{}", suffix))
    }
}

impl std::fmt::Display for StanzaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StanzaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// XMPP address
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Jid(pub String);

impl Jid {
    pub fn new(jid: impl Into<String>) -> Self {
        Self(jid.into())
    }

    /// Parse a full JID (`node@domain/resource`), rejecting bare JIDs.
    pub fn parse_full(jid: &str) -> JingleResult<Self> {
        let jid = Self::new(jid);
        if jid.is_full() {
            Ok(jid)
        } else {
            Err(JingleError::InvalidJid(jid.0))
        }
    }

    pub fn node(&self) -> Option<&str> {
        let bare = self.bare();
        bare.split_once('@').map(|(node, _)| node)
    }

    pub fn domain(&self) -> &str {
        let bare = self.bare();
        match bare.split_once('@') {
            Some((_, domain)) => domain,
            None => bare,
        }
    }

    pub fn resource(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, resource)| resource)
    }

    /// The JID without its resource part
    pub fn bare(&self) -> &str {
        match self.0.split_once('/') {
            Some((bare, _)) => bare,
            None => &self.0,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self.node(), Some(node) if !node.is_empty())
            && !self.domain().is_empty()
            && matches!(self.resource(), Some(resource) if !resource.is_empty())
    }
}

impl std::fmt::Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which side of the session we are
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Responder,
}

/// Who proposed a content
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ContentCreator {
    Initiator,
    Responder,
}

/// Jingle actions
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JingleAction {
    ContentAccept,
    ContentAdd,
    ContentModify,
    ContentRemove,
    SessionAccept,
    SessionInfo,
    SessionInitiate,
    SessionTerminate,
    TransportInfo,
}

/// Application description of a content: the offered payload types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Description {
    pub payloads: Vec<PayloadType>,
}

impl Description {
    pub fn new(payloads: Vec<PayloadType>) -> Self {
        Self { payloads }
    }
}

/// Transport element of a content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportPayload {
    pub kind: TransportKind,
    #[serde(default)]
    pub candidates: Vec<TransportCandidate>,
    /// Id of the remote candidate the sender connected to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_used: Option<String>,
    /// The sender could not connect to any offered candidate
    #[serde(default)]
    pub candidate_error: bool,
    /// Id of the proxy candidate the sender activated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated: Option<String>,
    /// The sender failed to activate its proxy
    #[serde(default)]
    pub proxy_error: bool,
}

impl TransportPayload {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            candidates: Vec::new(),
            candidate_used: None,
            candidate_error: false,
            activated: None,
            proxy_error: false,
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<TransportCandidate>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_candidate_used(mut self, id: impl Into<String>) -> Self {
        self.candidate_used = Some(id.into());
        self
    }

    pub fn with_candidate_error(mut self) -> Self {
        self.candidate_error = true;
        self
    }

    pub fn with_activated(mut self, id: impl Into<String>) -> Self {
        self.activated = Some(id.into());
        self
    }

    pub fn with_proxy_error(mut self) -> Self {
        self.proxy_error = true;
        self
    }
}

/// One `<content>` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub creator: ContentCreator,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Description>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportPayload>,
}

impl ContentBlock {
    pub fn new(creator: ContentCreator, name: impl Into<String>) -> Self {
        Self {
            creator,
            name: name.into(),
            description: None,
            transport: None,
        }
    }

    pub fn with_description(mut self, description: Description) -> Self {
        self.description = Some(description);
        self
    }

    pub fn with_transport(mut self, transport: TransportPayload) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// A parsed `<jingle>` element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jingle {
    pub action: JingleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<Jid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<Jid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TerminateReason>,
    #[serde(default)]
    pub contents: Vec<ContentBlock>,
}

impl Jingle {
    pub fn new(action: JingleAction) -> Self {
        Self {
            action,
            sid: None,
            initiator: None,
            responder: None,
            reason: None,
            contents: Vec::new(),
        }
    }

    pub fn with_sid(mut self, sid: SessionId) -> Self {
        self.sid = Some(sid);
        self
    }

    pub fn with_initiator(mut self, initiator: Jid) -> Self {
        self.initiator = Some(initiator);
        self
    }

    pub fn with_responder(mut self, responder: Jid) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn with_reason(mut self, reason: TerminateReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_content(mut self, content: ContentBlock) -> Self {
        self.contents.push(content);
        self
    }

    /// Content blocks carrying the given name
    pub fn contents_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ContentBlock> + 'a {
        self.contents.iter().filter(move |c| c.name == name)
    }
}

/// Body of a stanza
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StanzaPayload {
    /// An IQ `set` carrying a Jingle action
    Jingle(Jingle),
    /// An IQ `result`: the acknowledgment of the request with the same id
    Result,
    /// An IQ `error`
    Error {
        condition: ErrorCondition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

/// Inbound action or outbound response intent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stanza {
    pub id: StanzaId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Jid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Jid>,
    pub payload: StanzaPayload,
}

impl Stanza {
    /// A new request with a freshly generated id
    pub fn jingle(jingle: Jingle) -> Self {
        Self {
            id: StanzaId::generate(),
            from: None,
            to: None,
            payload: StanzaPayload::Jingle(jingle),
        }
    }

    /// Acknowledgment of `request`
    pub fn result_for(request: &Stanza) -> Self {
        Self {
            id: request.id.clone(),
            from: request.to.clone(),
            to: request.from.clone(),
            payload: StanzaPayload::Result,
        }
    }

    /// Error response to `request`
    pub fn error_for(request: &Stanza, condition: ErrorCondition, text: Option<String>) -> Self {
        Self {
            id: request.id.clone(),
            from: request.to.clone(),
            to: request.from.clone(),
            payload: StanzaPayload::Error { condition, text },
        }
    }

    pub fn with_from(mut self, from: Jid) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    pub fn as_jingle(&self) -> Option<&Jingle> {
        match &self.payload {
            StanzaPayload::Jingle(jingle) => Some(jingle),
            _ => None,
        }
    }

    pub fn as_jingle_mut(&mut self) -> Option<&mut Jingle> {
        match &mut self.payload {
            StanzaPayload::Jingle(jingle) => Some(jingle),
            _ => None,
        }
    }

    pub fn action(&self) -> Option<JingleAction> {
        self.as_jingle().map(|j| j.action)
    }

    pub fn is_result(&self) -> bool {
        matches!(self.payload, StanzaPayload::Result)
    }

    pub fn error_condition(&self) -> Option<ErrorCondition> {
        match &self.payload {
            StanzaPayload::Error { condition, .. } => Some(*condition),
            _ => None,
        }
    }
}

/// Session context handed to collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub sid: SessionId,
    pub initiator: Jid,
    pub responder: Jid,
    /// Our own address
    pub local: Jid,
    pub role: Role,
}

impl SessionInfo {
    /// The other party's address
    pub fn peer(&self) -> &Jid {
        match self.role {
            Role::Initiator => &self.responder,
            Role::Responder => &self.initiator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn full_jid_validation() {
        assert!(Jid::parse_full("romeo@montague.lit/orchard").is_ok());
        assert!(Jid::parse_full("romeo@montague.lit").is_err());
        assert!(Jid::parse_full("montague.lit/orchard").is_err());
        assert!(Jid::parse_full("@montague.lit/orchard").is_err());
        assert!(Jid::parse_full("romeo@montague.lit/").is_err());
    }

    #[test]
    fn jid_parts() {
        let jid = Jid::from("juliet@capulet.lit/balcony");
        assert_eq!(jid.node(), Some("juliet"));
        assert_eq!(jid.domain(), "capulet.lit");
        assert_eq!(jid.resource(), Some("balcony"));
        assert_eq!(jid.bare(), "juliet@capulet.lit");
    }

    #[test]
    fn action_names() {
        assert_eq!(JingleAction::SessionInitiate.to_string(), "session-initiate");
        assert_eq!(
            JingleAction::from_str("transport-info").unwrap(),
            JingleAction::TransportInfo
        );
    }

    #[test]
    fn result_swaps_addresses() {
        let request = Stanza::jingle(Jingle::new(JingleAction::SessionInfo))
            .with_from(Jid::from("a@x.lit/1"))
            .with_to(Jid::from("b@y.lit/2"));
        let ack = Stanza::result_for(&request);
        assert_eq!(ack.id, request.id);
        assert_eq!(ack.to, Some(Jid::from("a@x.lit/1")));
        assert!(ack.is_result());
    }

    #[test]
    fn stanza_serde_shape() {
        let stanza = Stanza::jingle(
            Jingle::new(JingleAction::SessionTerminate)
                .with_sid(SessionId::from("s1"))
                .with_reason(TerminateReason::Decline),
        );
        let value = serde_json::to_value(&stanza).unwrap();
        assert_eq!(value["payload"]["type"], "jingle");
        assert_eq!(value["payload"]["action"], "session-terminate");
        assert_eq!(value["payload"]["sid"], "s1");
        assert_eq!(value["payload"]["reason"], "decline");
        assert!(value.get("from").is_none());

        let back: Stanza = serde_json::from_value(value).unwrap();
        assert_eq!(back, stanza);
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(StanzaId::generate(), StanzaId::generate());
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
