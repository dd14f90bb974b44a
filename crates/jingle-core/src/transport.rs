//! Transport negotiation
//!
//! Each side offers its candidates in a `transport-info`, checks the peer's
//! candidates and reports the one it could reach (`candidate-used`) or that
//! none worked (`candidate-error`). Once both reports are known the pair is
//! fixed:
//!
//! - both sides connected: the higher priority candidate carries the stream,
//!   the initiator's pick winning a tie
//! - only one side connected: its candidate is used
//! - neither connected: the transport fails
//!
//! Proxy candidates need one more round-trip: the side that offered the proxy
//! activates it and announces `activated` before the stream is usable.
//!
//! Candidate gathering and connectivity checks are external collaborators
//! ([`TransportResolver`], [`CandidateChecker`]); the kinds of transport only
//! differ in which candidates they accept and how they pick among them.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, error, info, trace, warn};

use crate::config::JingleConfig;
use crate::errors::ErrorCondition;
use crate::events::NegotiatorEvent;
use crate::negotiator::{Negotiator, NegotiatorCore, NegotiatorStatus};
use crate::types::{
    ContentBlock, ContentCreator, Jingle, JingleAction, Role, SessionInfo, Stanza, StanzaPayload,
    TransportPayload,
};

/// Supported transport methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TransportKind {
    RawUdp,
    Ice,
    Socks5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Server reflexive (STUN mapped) address
    Srflx,
    /// Peer reflexive address
    Prflx,
    /// TURN relay
    Relay,
    /// Direct bytestream host
    Direct,
    Assisted,
    Tunnel,
    /// Bytestream proxy; must be activated before use
    Proxy,
}

impl CandidateType {
    pub fn requires_activation(&self) -> bool {
        matches!(self, CandidateType::Proxy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CandidateProtocol {
    Udp,
    Tcp,
}

/// A transport endpoint offered for use
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportCandidate {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub protocol: CandidateProtocol,
    pub priority: u32,
    #[serde(default)]
    pub generation: u32,
    pub candidate_type: CandidateType,
    /// Local address the candidate was gathered on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
}

impl TransportCandidate {
    pub fn new(id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            port,
            protocol: CandidateProtocol::Udp,
            priority: 0,
            generation: 0,
            candidate_type: CandidateType::Host,
            local_ip: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_type(mut self, candidate_type: CandidateType) -> Self {
        self.candidate_type = candidate_type;
        self
    }

    pub fn with_protocol(mut self, protocol: CandidateProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn requires_activation(&self) -> bool {
        self.candidate_type.requires_activation()
    }

    pub fn has_address(&self) -> bool {
        !self.ip.is_empty() && self.port != 0
    }
}

impl std::fmt::Display for TransportCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} prio {} ({})",
            self.id,
            self.protocol,
            self.address(),
            self.priority,
            self.candidate_type
        )
    }
}

/// Highest priority candidate; the earliest one wins among equals.
fn highest_priority<'a>(
    candidates: impl IntoIterator<Item = &'a TransportCandidate>,
) -> Option<&'a TransportCandidate> {
    candidates
        .into_iter()
        .fold(None, |best: Option<&TransportCandidate>, c| match best {
            Some(b) if b.priority >= c.priority => Some(b),
            _ => Some(c),
        })
}

impl TransportKind {
    /// Whether this transport can use a candidate of the given type
    pub fn accepts(&self, candidate: &TransportCandidate) -> bool {
        use CandidateType::*;
        match self {
            TransportKind::RawUdp => candidate.candidate_type == Host,
            TransportKind::Ice => matches!(candidate.candidate_type, Host | Srflx | Prflx | Relay),
            TransportKind::Socks5 => {
                matches!(candidate.candidate_type, Direct | Assisted | Tunnel | Proxy)
            }
        }
    }

    /// Pick the remote candidate to use.
    ///
    /// `valid` are the candidates that passed the connectivity check, `remote`
    /// everything the peer offered and `offered` our own candidates. Raw UDP
    /// takes the first valid candidate; ICE and SOCKS5 take the highest
    /// priority one. When nothing passed, ICE still tries a relay, then a
    /// server reflexive address if we offered a relay ourselves, then any
    /// remote candidate.
    pub fn select_best(
        &self,
        valid: &[TransportCandidate],
        remote: &[TransportCandidate],
        offered: &[TransportCandidate],
    ) -> Option<TransportCandidate> {
        match self {
            TransportKind::RawUdp => valid.first().cloned(),
            TransportKind::Socks5 => highest_priority(valid).cloned(),
            TransportKind::Ice => {
                if let Some(best) = highest_priority(valid) {
                    return Some(best.clone());
                }
                let of_type = |t: CandidateType| {
                    highest_priority(remote.iter().filter(move |c| c.candidate_type == t))
                };
                if let Some(relay) = of_type(CandidateType::Relay) {
                    debug!("ICE fallback to remote relay {}", relay);
                    return Some(relay.clone());
                }
                let offered_relay = offered
                    .iter()
                    .any(|c| c.candidate_type == CandidateType::Relay);
                if offered_relay {
                    if let Some(srflx) = of_type(CandidateType::Srflx) {
                        debug!("ICE fallback to remote srflx {}", srflx);
                        return Some(srflx.clone());
                    }
                }
                highest_priority(remote.iter().filter(|c| self.accepts(c))).cloned()
            }
        }
    }
}

/// Candidate gathering for one session
pub trait TransportResolver: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Gather local candidates
    fn resolve(&self, session: &SessionInfo) -> anyhow::Result<Vec<TransportCandidate>>;

    /// Free the resources behind an offered candidate
    fn release(&self, _candidate: &TransportCandidate) {}

    /// Activate a proxy candidate we offered
    fn activate(&self, _candidate: &TransportCandidate) -> anyhow::Result<()> {
        Ok(())
    }

    /// Abort any gathering in progress
    fn cancel(&self) {}
}

/// Supplies resolvers; owned by a media manager
pub trait TransportManager: Send + Sync {
    fn resolver(&self, session: &SessionInfo) -> Arc<dyn TransportResolver>;
}

/// Connectivity check against a remote candidate
pub trait CandidateChecker: Send + Sync {
    /// Must return within `timeout`
    fn check(&self, candidate: &TransportCandidate, timeout: Duration) -> bool;
}

/// Checks that a candidate carries a literal IP address that can be connected to.
///
/// Host names are refused rather than looked up, so a check never blocks on
/// DNS. TCP candidates get a real connect bounded by the timeout. UDP
/// candidates only get a socket associated with the address, since UDP has
/// no handshake to wait for.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketAddressChecker;

impl CandidateChecker for SocketAddressChecker {
    fn check(&self, candidate: &TransportCandidate, timeout: Duration) -> bool {
        if !candidate.has_address() {
            return false;
        }
        let Ok(ip) = IpAddr::from_str(&candidate.ip) else {
            trace!("Candidate {} is not an IP literal", candidate);
            return false;
        };
        let addr = SocketAddr::new(ip, candidate.port);
        match candidate.protocol {
            CandidateProtocol::Tcp => TcpStream::connect_timeout(&addr, timeout).is_ok(),
            CandidateProtocol::Udp => {
                let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                UdpSocket::bind(bind)
                    .and_then(|socket| socket.connect(addr))
                    .is_ok()
            }
        }
    }
}

/// Internal state of a transport negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportState {
    /// Not started
    Idle,
    /// Candidates offered, waiting for both choices
    Pending,
    /// Pair fixed, waiting for proxy activation
    CandidatesAccepted,
    Active,
    Failed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Idle => write!(f, "Idle"),
            TransportState::Pending => write!(f, "Pending"),
            TransportState::CandidatesAccepted => write!(f, "CandidatesAccepted"),
            TransportState::Active => write!(f, "Active"),
            TransportState::Failed => write!(f, "Failed"),
        }
    }
}

/// Outcome of one side's connectivity checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateChoice {
    Used(TransportCandidate),
    Error,
}

impl CandidateChoice {
    pub fn candidate(&self) -> Option<&TransportCandidate> {
        match self {
            CandidateChoice::Used(c) => Some(c),
            CandidateChoice::Error => None,
        }
    }
}

/// The agreed candidate pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstablishedTransport {
    /// Our candidate the peer sends to
    pub local: TransportCandidate,
    /// The peer's candidate we send to
    pub remote: TransportCandidate,
    /// The candidate carrying the stream
    pub nominated: TransportCandidate,
}

/// A transport element offering candidates, possibly none at all.
fn is_candidate_offer(action: JingleAction, payload: &TransportPayload) -> bool {
    if !payload.candidates.is_empty() {
        return true;
    }
    action == JingleAction::TransportInfo
        && payload.candidate_used.is_none()
        && !payload.candidate_error
        && payload.activated.is_none()
        && !payload.proxy_error
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outbound {
    Offer,
    Choice,
    Activation,
}

/// Negotiates the candidate pair of one content
pub struct TransportNegotiator {
    core: NegotiatorCore<NegotiatorEvent>,
    content: String,
    creator: ContentCreator,
    session: SessionInfo,
    kind: TransportKind,
    resolver: Arc<dyn TransportResolver>,
    checker: Arc<dyn CandidateChecker>,
    config: JingleConfig,
    state: TransportState,
    offered: Vec<TransportCandidate>,
    remote: Vec<TransportCandidate>,
    valid_remote: Vec<TransportCandidate>,
    /// Remote candidate we picked
    our_choice: Option<CandidateChoice>,
    our_choice_sent: bool,
    /// Our candidate the peer picked
    their_choice: Option<CandidateChoice>,
    peer_activated: Option<String>,
    established: Option<EstablishedTransport>,
    queued: VecDeque<(Outbound, Stanza)>,
    released: HashSet<String>,
}

impl TransportNegotiator {
    pub fn new(
        content: impl Into<String>,
        creator: ContentCreator,
        session: SessionInfo,
        resolver: Arc<dyn TransportResolver>,
        checker: Arc<dyn CandidateChecker>,
        config: JingleConfig,
    ) -> Self {
        let content = content.into();
        let kind = resolver.kind();
        Self {
            core: NegotiatorCore::new(format!("transport[{}/{}]", content, kind)),
            content,
            creator,
            session,
            kind,
            resolver,
            checker,
            config,
            state: TransportState::Idle,
            offered: Vec::new(),
            remote: Vec::new(),
            valid_remote: Vec::new(),
            our_choice: None,
            our_choice_sent: false,
            their_choice: None,
            peer_activated: None,
            established: None,
            queued: VecDeque::new(),
            released: HashSet::new(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn offered_candidates(&self) -> &[TransportCandidate] {
        &self.offered
    }

    pub fn remote_candidates(&self) -> &[TransportCandidate] {
        &self.remote
    }

    pub fn valid_remote_candidates(&self) -> &[TransportCandidate] {
        &self.valid_remote
    }

    /// The peer's pick among our offered candidates
    pub fn their_selected_candidate(&self) -> Option<&CandidateChoice> {
        self.their_choice.as_ref()
    }

    /// Our pick among the peer's candidates
    pub fn our_selected_candidate(&self) -> Option<&CandidateChoice> {
        self.our_choice.as_ref()
    }

    pub fn established(&self) -> Option<&EstablishedTransport> {
        self.established.as_ref()
    }

    pub fn accepted_local_candidate(&self) -> Option<&TransportCandidate> {
        self.established.as_ref().map(|e| &e.local)
    }

    pub fn best_remote_candidate(&self) -> Option<&TransportCandidate> {
        self.established.as_ref().map(|e| &e.remote)
    }

    /// Transport element for outbound content blocks
    pub fn transport_payload(&self) -> TransportPayload {
        match &self.established {
            Some(established) => {
                TransportPayload::new(self.kind).with_candidate_used(established.remote.id.clone())
            }
            None => TransportPayload::new(self.kind),
        }
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            debug!("{}: state changed: {} -> {}", self.core.label(), self.state, state);
            self.state = state;
        }
    }

    fn transport_info(&self, payload: TransportPayload) -> Stanza {
        let block = ContentBlock::new(self.creator, self.content.clone()).with_transport(payload);
        Stanza::jingle(Jingle::new(JingleAction::TransportInfo).with_content(block))
    }

    /// Send now if no request is outstanding, otherwise queue behind it.
    fn send_or_queue(&mut self, kind: Outbound, stanza: Stanza) -> Vec<Stanza> {
        if self.core.is_awaiting_ack() {
            trace!("{}: queueing {:?} behind outstanding request", self.core.label(), kind);
            self.queued.push_back((kind, stanza));
            return Vec::new();
        }
        self.sent(kind, stanza)
    }

    fn sent(&mut self, kind: Outbound, stanza: Stanza) -> Vec<Stanza> {
        if let Err(e) = self.core.expect_ack(stanza.id.clone()) {
            error!("{}: {}", self.core.label(), e);
            return Vec::new();
        }
        if kind == Outbound::Choice {
            self.our_choice_sent = true;
        }
        vec![stanza]
    }

    fn flush_queue(&mut self) -> Vec<Stanza> {
        match self.queued.pop_front() {
            Some((kind, stanza)) => self.sent(kind, stanza),
            None => Vec::new(),
        }
    }

    fn fail(&mut self, reason: &str) {
        if self.state == TransportState::Failed {
            return;
        }
        warn!("{}: transport failed: {}", self.core.label(), reason);
        self.set_state(TransportState::Failed);
        self.core.set_status(NegotiatorStatus::Failed);
        self.core.emit(NegotiatorEvent::TransportFailed {
            content: self.content.clone(),
            condition: ErrorCondition::FailedTransport,
        });
    }

    /// Check a batch of remote candidates and decide our pick on the first one.
    fn accept_remote_candidates(&mut self, batch: &[TransportCandidate]) -> Vec<Stanza> {
        let fresh: Vec<TransportCandidate> = batch
            .iter()
            .filter(|c| !self.remote.iter().any(|r| r.id == c.id))
            .cloned()
            .collect();
        self.remote.extend(fresh.iter().cloned());

        let acceptable: Vec<&TransportCandidate> =
            fresh.iter().filter(|c| self.kind.accepts(c)).collect();
        let timeout = self.config.candidate_check_timeout(acceptable.len());
        for candidate in acceptable {
            if self.checker.check(candidate, timeout) {
                trace!("{}: candidate {} is reachable", self.core.label(), candidate);
                self.valid_remote.push(candidate.clone());
            } else {
                trace!("{}: candidate {} failed its check", self.core.label(), candidate);
            }
        }

        if self.our_choice.is_some() {
            return Vec::new();
        }

        let choice = match self.kind.select_best(&self.valid_remote, &self.remote, &self.offered) {
            Some(best) => {
                info!("{}: using remote candidate {}", self.core.label(), best);
                CandidateChoice::Used(best)
            }
            None => {
                warn!("{}: no usable remote candidate", self.core.label());
                CandidateChoice::Error
            }
        };
        let payload = match &choice {
            CandidateChoice::Used(c) => {
                TransportPayload::new(self.kind).with_candidate_used(c.id.clone())
            }
            CandidateChoice::Error => TransportPayload::new(self.kind).with_candidate_error(),
        };
        self.our_choice = Some(choice);
        let stanza = self.transport_info(payload);
        self.send_or_queue(Outbound::Choice, stanza)
    }

    fn record_their_choice(&mut self, choice: CandidateChoice) {
        if let Some(existing) = &self.their_choice {
            if *existing != choice {
                warn!("{}: peer changed its candidate choice, keeping the first", self.core.label());
            }
            return;
        }
        self.their_choice = Some(choice);
    }

    /// Fix the pair once both choices are known.
    fn try_converge(&mut self) -> Vec<Stanza> {
        if self.state != TransportState::Pending || !self.our_choice_sent {
            return Vec::new();
        }
        let (Some(ours), Some(theirs)) = (self.our_choice.clone(), self.their_choice.clone()) else {
            return Vec::new();
        };

        let established = match (ours, theirs) {
            (CandidateChoice::Used(remote), CandidateChoice::Used(local)) => {
                let nominated = if remote.priority != local.priority {
                    if remote.priority > local.priority {
                        remote.clone()
                    } else {
                        local.clone()
                    }
                } else {
                    match self.session.role {
                        Role::Initiator => remote.clone(),
                        Role::Responder => local.clone(),
                    }
                };
                EstablishedTransport { local, remote, nominated }
            }
            (CandidateChoice::Used(remote), CandidateChoice::Error) => {
                let Some(local) = highest_priority(&self.offered).cloned() else {
                    self.fail("peer reached none of our candidates and we offered none");
                    return Vec::new();
                };
                EstablishedTransport {
                    local,
                    nominated: remote.clone(),
                    remote,
                }
            }
            (CandidateChoice::Error, CandidateChoice::Used(local)) => {
                let Some(remote) = highest_priority(&self.remote).cloned() else {
                    self.fail("no remote candidate to pair with");
                    return Vec::new();
                };
                EstablishedTransport {
                    remote,
                    nominated: local.clone(),
                    local,
                }
            }
            (CandidateChoice::Error, CandidateChoice::Error) => {
                self.fail("neither side reached a candidate");
                return Vec::new();
            }
        };

        debug!(
            "{}: candidates accepted, local {} remote {} nominated {}",
            self.core.label(),
            established.local,
            established.remote,
            established.nominated
        );
        let nominated = established.nominated.clone();
        self.established = Some(established);
        self.set_state(TransportState::CandidatesAccepted);

        if !nominated.requires_activation() {
            self.activate_transport();
            return Vec::new();
        }

        let ours = self.offered.iter().any(|c| c.id == nominated.id);
        if !ours {
            if self.peer_activated.as_deref() == Some(nominated.id.as_str()) {
                self.activate_transport();
            } else {
                debug!("{}: waiting for peer to activate {}", self.core.label(), nominated);
            }
            return Vec::new();
        }

        match self.resolver.activate(&nominated) {
            Ok(()) => {
                let activated = TransportPayload::new(self.kind).with_activated(nominated.id.clone());
                let stanza = self.transport_info(activated);
                let out = self.send_or_queue(Outbound::Activation, stanza);
                self.activate_transport();
                out
            }
            Err(e) => {
                let stanza = self.transport_info(TransportPayload::new(self.kind).with_proxy_error());
                let out = self.send_or_queue(Outbound::Activation, stanza);
                self.fail(&format!("proxy activation failed: {}", e));
                out
            }
        }
    }

    fn activate_transport(&mut self) {
        let Some(established) = self.established.clone() else {
            return;
        };
        info!(
            "{}: transport established {} <-> {}",
            self.core.label(),
            established.local.address(),
            established.remote.address()
        );
        self.set_state(TransportState::Active);
        self.core.set_status(NegotiatorStatus::Succeeded);
        self.core.emit(NegotiatorEvent::TransportEstablished {
            content: self.content.clone(),
            local: established.local,
            remote: established.remote,
        });
        self.release_unused();
    }

    /// Release every offered candidate except the accepted one.
    pub fn release_unused(&mut self) {
        let keep = self.established.as_ref().map(|e| e.local.id.clone());
        for candidate in &self.offered {
            if Some(&candidate.id) == keep.as_ref() || self.released.contains(&candidate.id) {
                continue;
            }
            trace!("{}: releasing {}", self.core.label(), candidate);
            self.resolver.release(candidate);
            self.released.insert(candidate.id.clone());
        }
    }

    /// Release every offered candidate, the accepted one included.
    ///
    /// Used on teardown when no media session took over the accepted pair.
    pub fn release_all(&mut self) {
        for candidate in &self.offered {
            if self.released.insert(candidate.id.clone()) {
                trace!("{}: releasing {}", self.core.label(), candidate);
                self.resolver.release(candidate);
            }
        }
    }

    pub fn released_candidates(&self) -> &HashSet<String> {
        &self.released
    }

    fn handle_transport(
        &mut self,
        stanza: &Stanza,
        action: JingleAction,
        payload: &TransportPayload,
    ) -> Vec<Stanza> {
        if payload.kind != self.kind {
            warn!("{}: peer used transport {}", self.core.label(), payload.kind);
            return vec![Stanza::error_for(
                stanza,
                ErrorCondition::UnsupportedTransports,
                Some(format!("expected {}", self.kind)),
            )];
        }

        if action == JingleAction::SessionAccept {
            return self.verify_accept(stanza, payload);
        }

        let mut out = Vec::new();

        if let Some(id) = &payload.candidate_used {
            match self.offered.iter().find(|c| &c.id == id).cloned() {
                Some(candidate) => {
                    debug!("{}: peer uses our candidate {}", self.core.label(), candidate);
                    self.record_their_choice(CandidateChoice::Used(candidate));
                }
                None => {
                    warn!("{}: peer used unknown candidate {}", self.core.label(), id);
                    return vec![Stanza::error_for(
                        stanza,
                        ErrorCondition::NegotiationError,
                        Some(format!("unknown candidate {}", id)),
                    )];
                }
            }
        }
        if payload.candidate_error {
            debug!("{}: peer reached none of our candidates", self.core.label());
            self.record_their_choice(CandidateChoice::Error);
        }

        if is_candidate_offer(action, payload) {
            out.extend(self.accept_remote_candidates(&payload.candidates));
        }

        if let Some(id) = &payload.activated {
            self.peer_activated = Some(id.clone());
            let waiting = self.state == TransportState::CandidatesAccepted
                && self.established.as_ref().map(|e| &e.nominated.id) == Some(id);
            if waiting {
                self.activate_transport();
            }
        }
        if payload.proxy_error {
            self.fail("peer failed to activate its proxy");
        }

        out.extend(self.try_converge());
        out
    }

    fn verify_accept(&mut self, stanza: &Stanza, payload: &TransportPayload) -> Vec<Stanza> {
        let (Some(id), Some(local)) = (&payload.candidate_used, self.accepted_local_candidate()) else {
            return Vec::new();
        };
        if &local.id == id {
            return Vec::new();
        }
        warn!(
            "{}: session-accept names candidate {} but {} was agreed",
            self.core.label(),
            id,
            local.id
        );
        vec![Stanza::error_for(
            stanza,
            ErrorCondition::NegotiationError,
            Some(format!("candidate {} was not agreed", id)),
        )]
    }
}

impl Negotiator for TransportNegotiator {
    type Event = NegotiatorEvent;

    fn core(&self) -> &NegotiatorCore<NegotiatorEvent> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NegotiatorCore<NegotiatorEvent> {
        &mut self.core
    }

    fn do_start(&mut self) -> Vec<Stanza> {
        match self.resolver.resolve(&self.session) {
            Ok(candidates) => {
                debug!("{}: offering {} candidate(s)", self.core.label(), candidates.len());
                self.offered = candidates;
            }
            Err(e) => {
                self.fail(&format!("candidate resolution failed: {}", e));
                return Vec::new();
            }
        }
        self.set_state(TransportState::Pending);
        let offer = self.transport_info(
            TransportPayload::new(self.kind).with_candidates(self.offered.clone()),
        );
        self.send_or_queue(Outbound::Offer, offer)
    }

    fn dispatch_incoming(&mut self, stanza: &Stanza) -> Vec<Stanza> {
        match &stanza.payload {
            StanzaPayload::Result => {
                if !self.core.clear_expected(&stanza.id) {
                    return Vec::new();
                }
                let mut out = self.flush_queue();
                out.extend(self.try_converge());
                out
            }
            StanzaPayload::Error { .. } => Vec::new(),
            StanzaPayload::Jingle(jingle) => {
                if matches!(self.state, TransportState::Failed) {
                    return Vec::new();
                }
                let name = self.content.clone();
                let payload = jingle
                    .contents_named(&name)
                    .find_map(|c| c.transport.as_ref());
                match payload {
                    Some(payload) if self.state != TransportState::Idle => {
                        self.handle_transport(stanza, jingle.action, payload)
                    }
                    Some(_) => {
                        trace!("{}: not started, ignoring {}", self.core.label(), jingle.action);
                        Vec::new()
                    }
                    None => Vec::new(),
                }
            }
        }
    }

    fn do_close(&mut self) {
        self.resolver.cancel();
        self.queued.clear();
        self.core.emit(NegotiatorEvent::TransportClosed {
            content: self.content.clone(),
            local: self.accepted_local_candidate().cloned(),
        });
    }
}

impl std::fmt::Debug for TransportNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportNegotiator")
            .field("content", &self.content)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("status", &self.core.status())
            .field("established", &self.established)
            .finish()
    }
}
