//! Jingle session state machine
//!
//! A [`JingleSession`] receives every packet for one `sid`, applies the
//! [state table](state::transition) and routes the packet to its content
//! negotiators. Their answers are merged into the packets the session
//! actually sends: the acknowledgment of the inbound request, the
//! negotiators' own messages, and the single `session-accept` once every
//! content is established.
//!
//! Sessions are driven synchronously. Callers serialize access through a
//! [`SessionHandle`], which is what the manager keeps in its registry.

pub mod state;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, debug_span, error, info, trace, warn};

use crate::config::{JingleConfig, MediaManagerSelection};
use crate::content::ContentNegotiator;
use crate::errors::{ErrorCondition, JingleError, JingleResult, TerminateReason};
use crate::events::{ListenerId, NegotiatorEvent, SessionEvent};
use crate::manager::JingleConnection;
use crate::media::{MediaManager, MediaNegotiator, MediaSession, PayloadType};
use crate::negotiator::{Negotiator, NegotiatorCore, NegotiatorStatus};
use crate::transport::{CandidateChecker, TransportNegotiator};
use crate::types::{
    ContentBlock, ContentCreator, Jid, Jingle, JingleAction, Role, SessionId, SessionInfo, Stanza,
    StanzaId, StanzaPayload,
};

pub use state::{transition, Directive, SessionState, Transition};

/// Collaborators shared by all sessions of one connection
#[derive(Clone)]
pub struct SessionContext {
    pub connection: Arc<dyn JingleConnection>,
    pub media_managers: Vec<Arc<dyn MediaManager>>,
    pub checker: Arc<dyn CandidateChecker>,
    pub config: JingleConfig,
}

pub struct JingleSession {
    info: SessionInfo,
    state: SessionState,
    contents: Vec<ContentNegotiator>,
    core: NegotiatorCore<SessionEvent>,
    context: SessionContext,
    accept_sent: bool,
    media_sessions: HashMap<String, Box<dyn MediaSession>>,
    close_notified: bool,
}

impl JingleSession {
    /// A session we initiate towards `responder`
    pub fn outgoing(responder: Jid, context: SessionContext) -> Self {
        let local = context.connection.local_jid();
        let info = SessionInfo {
            sid: SessionId::new(),
            initiator: local.clone(),
            responder,
            local,
            role: Role::Initiator,
        };
        Self::with_state(info, SessionState::Unknown, context)
    }

    /// A session for an accepted incoming request
    pub fn incoming(sid: SessionId, initiator: Jid, context: SessionContext) -> Self {
        let local = context.connection.local_jid();
        let info = SessionInfo {
            sid,
            initiator,
            responder: local.clone(),
            local,
            role: Role::Responder,
        };
        Self::with_state(info, SessionState::Accepting, context)
    }

    fn with_state(info: SessionInfo, state: SessionState, context: SessionContext) -> Self {
        info!(
            "Created {:?} session {} ({} -> {})",
            info.role, info.sid, info.initiator, info.responder
        );
        Self {
            core: NegotiatorCore::new(format!("session[{}]", info.sid)),
            info,
            state,
            contents: Vec::new(),
            context,
            accept_sent: false,
            media_sessions: HashMap::new(),
            close_notified: false,
        }
    }

    pub fn sid(&self) -> &SessionId {
        &self.info.sid
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn role(&self) -> Role {
        self.info.role
    }

    pub fn initiator(&self) -> &Jid {
        &self.info.initiator
    }

    pub fn responder(&self) -> &Jid {
        &self.info.responder
    }

    pub fn peer(&self) -> &Jid {
        self.info.peer()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state.is_ended()
    }

    pub fn contents(&self) -> &[ContentNegotiator] {
        &self.contents
    }

    pub fn content(&self, name: &str) -> Option<&ContentNegotiator> {
        self.contents.iter().find(|c| c.name() == name)
    }

    /// Every content has both its payload and transport agreed
    pub fn is_fully_established(&self) -> bool {
        !self.contents.is_empty() && self.contents.iter().all(|c| c.is_fully_established())
    }

    /// Live media session registered under a media manager's name
    pub fn media_session(&self, manager: &str) -> Option<&dyn MediaSession> {
        self.media_sessions.get(manager).map(|s| s.as_ref())
    }

    pub fn media_session_names(&self) -> Vec<String> {
        self.media_sessions.keys().cloned().collect()
    }

    pub fn add_session_listener(
        &self,
    ) -> (ListenerId, tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
        self.core.listeners().subscribe()
    }

    pub fn remove_session_listener(&self, id: ListenerId) -> bool {
        self.core.listeners().unsubscribe(id)
    }

    /// Send our `session-initiate`.
    pub fn start_outgoing(&mut self) -> JingleResult<()> {
        if self.info.role != Role::Initiator {
            return Err(JingleError::InvalidState(
                "only the initiator can start a session".into(),
            ));
        }
        if self.state != SessionState::Unknown || self.core.is_started() {
            return Err(JingleError::AlreadyStarted);
        }
        if self.context.media_managers.is_empty() {
            return Err(JingleError::MissingCollaborator("no media managers registered".into()));
        }
        let out = self.start();
        self.send_all(out);
        Ok(())
    }

    /// Process one inbound packet and send whatever it calls for.
    pub fn receive_packet_and_respond(&mut self, stanza: &Stanza) -> JingleResult<()> {
        if let Some(sid) = stanza.as_jingle().and_then(|j| j.sid.as_ref()) {
            if sid != &self.info.sid {
                return Err(JingleError::SessionNotFound(sid.clone()));
            }
        }
        let span = debug_span!("jingle_session", sid = %self.info.sid);
        let _enter = span.enter();

        let out = self.dispatch_incoming(stanza);
        self.send_all(out);
        Ok(())
    }

    /// End the session locally. Calling it on an ended session does nothing.
    pub fn terminate(&mut self, reason: TerminateReason) -> JingleResult<()> {
        if self.is_ended() {
            debug!("Session {} already ended", self.info.sid);
            return Ok(());
        }
        info!("Terminating session {}: {}", self.info.sid, reason);
        let terminate = self.session_terminate(reason.clone());
        self.send_all(vec![terminate]);
        self.end(SessionEvent::Closed {
            sid: self.info.sid.clone(),
            reason,
        });
        Ok(())
    }

    /// Media layer reports traffic from `participant`
    pub fn media_received(&mut self, participant: Jid) {
        self.core.emit(SessionEvent::MediaReceived {
            sid: self.info.sid.clone(),
            participant,
        });
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("Session {} state changed: {} -> {}", self.info.sid, self.state, state);
        let from = std::mem::replace(&mut self.state, state);
        match state {
            SessionState::Active => {
                self.core.set_status(NegotiatorStatus::Succeeded);
            }
            SessionState::Ended if !self.core.status().is_terminal() => {
                self.core.set_status(NegotiatorStatus::Failed);
            }
            _ => {}
        }
        self.core.emit(SessionEvent::StateChanged {
            sid: self.info.sid.clone(),
            from,
            to: state,
        });
    }

    fn session_terminate(&self, reason: TerminateReason) -> Stanza {
        Stanza::jingle(Jingle::new(JingleAction::SessionTerminate).with_reason(reason))
    }

    /// Complete an outbound stanza from session state and hand it to the
    /// connection. Nothing is sent once the connection is down.
    fn send(&self, mut stanza: Stanza) {
        if let Some(jingle) = stanza.as_jingle_mut() {
            jingle.sid.get_or_insert_with(|| self.info.sid.clone());
            jingle.initiator.get_or_insert_with(|| self.info.initiator.clone());
            jingle.responder.get_or_insert_with(|| self.info.responder.clone());
        }
        stanza.to.get_or_insert_with(|| self.info.peer().clone());
        stanza.from.get_or_insert_with(|| self.info.local.clone());

        if !self.context.connection.is_connected() {
            debug!("Not connected, dropping {:?} for {}", stanza.payload, self.info.sid);
            return;
        }
        trace!("Session {} sending {}", self.info.sid, stanza.id);
        if let Err(e) = self.context.connection.send_stanza(stanza) {
            warn!("Failed to send packet for session {}: {}", self.info.sid, e);
        }
    }

    fn send_all(&self, stanzas: Vec<Stanza>) {
        for stanza in stanzas {
            self.send(stanza);
        }
    }

    fn new_content(
        &self,
        creator: ContentCreator,
        name: &str,
        manager: Arc<dyn MediaManager>,
        resolver: Arc<dyn crate::transport::TransportResolver>,
    ) -> ContentNegotiator {
        let mut content = ContentNegotiator::new(creator, name);
        content.set_media(MediaNegotiator::new(name, creator, self.info.role, manager));
        content.set_transport(TransportNegotiator::new(
            name,
            creator,
            self.info.clone(),
            resolver,
            self.context.checker.clone(),
            self.context.config.clone(),
        ));
        content
    }

    /// The media manager handling an offer: the first one supporting every
    /// offered payload, otherwise whatever the selection policy says.
    fn select_media_manager(&self, offered: &[PayloadType]) -> Option<Arc<dyn MediaManager>> {
        let managers = &self.context.media_managers;
        if let Some(manager) = managers.iter().find(|m| m.supports_all(offered)) {
            return Some(manager.clone());
        }
        match self.context.config.media_manager_selection {
            MediaManagerSelection::FirstRegistered => {
                let fallback = managers.first().cloned();
                if let Some(manager) = &fallback {
                    debug!("No exact codec match, falling back to {}", manager.name());
                }
                fallback
            }
            MediaManagerSelection::Reject => None,
        }
    }

    /// Build one content per offered block.
    fn build_contents(&mut self, jingle: &Jingle) -> Result<(), (ErrorCondition, String)> {
        if jingle.contents.is_empty() {
            return Err((ErrorCondition::MalformedStanza, "no content offered".into()));
        }

        let mut contents = Vec::with_capacity(jingle.contents.len());
        for block in &jingle.contents {
            let Some(description) = &block.description else {
                return Err((
                    ErrorCondition::UnsupportedContent,
                    format!("content {} has no description", block.name),
                ));
            };
            let Some(manager) = self.select_media_manager(&description.payloads) else {
                return Err((
                    ErrorCondition::UnsupportedContent,
                    format!("no media manager for content {}", block.name),
                ));
            };
            let resolver = manager.transport_manager().resolver(&self.info);
            if let Some(transport) = &block.transport {
                if transport.kind != resolver.kind() {
                    return Err((
                        ErrorCondition::UnsupportedTransports,
                        format!("transport {} is not supported", transport.kind),
                    ));
                }
            }
            debug!("Content {} handled by {}", block.name, manager.name());
            contents.push(self.new_content(block.creator, &block.name, manager, resolver));
        }
        self.contents = contents;
        Ok(())
    }

    fn start_contents(&mut self) -> Vec<Stanza> {
        self.contents.iter_mut().flat_map(|c| c.start()).collect()
    }

    fn dispatch_to_contents(&mut self, stanza: &Stanza) -> Vec<Stanza> {
        self.contents
            .iter_mut()
            .flat_map(|c| c.dispatch_incoming(stanza))
            .collect()
    }

    /// Forward child events to session listeners
    fn forward_content_events(&mut self) {
        let events: Vec<NegotiatorEvent> = self
            .contents
            .iter_mut()
            .flat_map(|c| c.take_all_events())
            .collect();
        for event in events {
            let event = match event {
                NegotiatorEvent::ContentEstablished {
                    content,
                    payload,
                    local,
                    remote,
                } => SessionEvent::Established {
                    sid: self.info.sid.clone(),
                    content,
                    payload,
                    local,
                    remote,
                },
                other => SessionEvent::Negotiation {
                    sid: self.info.sid.clone(),
                    event: other,
                },
            };
            self.core.emit(event);
        }
    }

    /// Start media for every content that just became fully established.
    fn start_media(&mut self) -> Result<(), String> {
        for index in 0..self.contents.len() {
            let content = &mut self.contents[index];
            if content.is_established() || !content.is_fully_established() {
                continue;
            }
            let Some(name) = content.media_manager().map(|m| m.name().to_string()) else {
                continue;
            };
            let media_session = content
                .trigger_content_established(&self.info)
                .map_err(|e| e.to_string())?;
            if self.media_sessions.insert(name.clone(), media_session).is_some() {
                warn!("Replaced media session for {} in {}", name, self.info.sid);
            }
        }
        Ok(())
    }

    fn stop_media(&mut self) {
        for (name, mut media) in self.media_sessions.drain() {
            debug!("Stopping media session {}", name);
            media.stop_transmit();
            media.stop_receive();
        }
    }

    /// Tear everything down, notify once, and enter `Ended`.
    fn end(&mut self, notification: SessionEvent) {
        if self.is_ended() {
            return;
        }
        self.close();
        self.forward_content_events();
        if !self.close_notified {
            self.close_notified = true;
            self.core.emit(notification);
        }
        self.set_state(SessionState::Ended);
    }

    fn close_on_error(&mut self, condition: ErrorCondition, message: impl Into<String>) {
        let message = message.into();
        warn!("Session {} closed on error ({}): {}", self.info.sid, condition, message);
        self.core.set_status(NegotiatorStatus::Failed);
        self.end(SessionEvent::ClosedOnError {
            sid: self.info.sid.clone(),
            condition,
            message,
        });
    }

    /// Whether `id` is a request this session, or one of its negotiators, sent
    fn awaits_ack(&self, id: &StanzaId) -> bool {
        self.core.is_expected(id) || self.contents.iter().any(|c| c.awaits_ack(id))
    }

    fn handle_ack(&mut self, stanza: &Stanza) -> Vec<Stanza> {
        let mut out = Vec::new();
        if self.core.clear_expected(&stanza.id) {
            match self.state {
                SessionState::Inviting => {
                    debug!("session-initiate acknowledged, starting negotiators");
                    self.set_state(SessionState::Pending);
                    out.extend(self.start_contents());
                }
                SessionState::Pending if self.accept_sent => {
                    self.set_state(SessionState::Active);
                }
                _ => {}
            }
        }
        out.extend(self.dispatch_to_contents(stanza));
        self.settle(None, out)
    }

    fn handle_remote_terminate(&mut self, stanza: &Stanza, jingle: &Jingle) -> Vec<Stanza> {
        let sid = self.info.sid.clone();
        let notification = match &jingle.reason {
            Some(TerminateReason::Decline) => SessionEvent::Declined { sid },
            Some(TerminateReason::Redirect(target)) => SessionEvent::Redirected {
                sid,
                target: target.clone(),
            },
            reason => SessionEvent::Closed {
                sid,
                reason: reason.clone().unwrap_or(TerminateReason::Success),
            },
        };
        info!("Session {} terminated by peer", self.info.sid);
        self.end(notification);
        vec![Stanza::result_for(stanza)]
    }

    fn handle_initiate(
        &mut self,
        stanza: &Stanza,
        jingle: &Jingle,
        next: Option<SessionState>,
    ) -> Vec<Stanza> {
        if let Err((condition, message)) = self.build_contents(jingle) {
            warn!("Rejecting session-initiate: {}", message);
            self.close_on_error(condition, message.clone());
            return vec![Stanza::error_for(stanza, condition, Some(message))];
        }
        if let Some(next) = next {
            self.set_state(next);
        }

        let mut out = self.dispatch_to_contents(stanza);
        let failed = out.iter().any(|s| s.error_condition().is_some())
            || self.contents.iter().any(|c| c.status() == NegotiatorStatus::Failed);
        if !failed {
            out.extend(self.start_contents());
        }
        self.settle(Some(stanza), out)
    }

    fn handle_accept(&mut self, stanza: &Stanza, next: Option<SessionState>) -> Vec<Stanza> {
        let out = self.dispatch_to_contents(stanza);
        if out.iter().any(|s| s.error_condition().is_some()) {
            return self.settle(Some(stanza), out);
        }
        if !self.is_fully_established() {
            warn!("session-accept before every content was agreed");
            let error = Stanza::error_for(
                stanza,
                ErrorCondition::NegotiationError,
                Some("negotiation is not complete".into()),
            );
            return self.settle(Some(stanza), vec![error]);
        }
        if let Some(next) = next {
            self.set_state(next);
        }
        self.settle(Some(stanza), out)
    }

    fn handle_delegate(&mut self, stanza: &Stanza) -> Vec<Stanza> {
        let mut out = self.start_contents();
        out.extend(self.dispatch_to_contents(stanza));
        self.settle(Some(stanza), out)
    }

    /// Merge negotiator responses into what the session sends.
    ///
    /// Acknowledges `inbound` unless a negotiator answered it with an error,
    /// tears the session down on unrecoverable errors or failed contents, and
    /// sends the `session-accept` once everything is agreed.
    fn settle(&mut self, inbound: Option<&Stanza>, mut responses: Vec<Stanza>) -> Vec<Stanza> {
        self.forward_content_events();

        if let Some(req) = inbound {
            let mut answered = false;
            responses.retain(|r| {
                if r.id != req.id || r.error_condition().is_none() {
                    return true;
                }
                !std::mem::replace(&mut answered, true)
            });
        }

        let answered = inbound
            .map(|req| {
                responses
                    .iter()
                    .any(|r| r.id == req.id && r.error_condition().is_some())
            })
            .unwrap_or(false);

        let mut out = Vec::with_capacity(responses.len() + 1);
        if let Some(req) = inbound {
            if !answered {
                out.push(Stanza::result_for(req));
            }
        }

        let fatal = responses.iter().find_map(|r| match &r.payload {
            StanzaPayload::Error { condition, text } if condition.is_fatal() => {
                Some((*condition, text.clone().unwrap_or_default()))
            }
            _ => None,
        });
        out.extend(responses);

        if let Some((condition, message)) = fatal {
            out.push(self.session_terminate(TerminateReason::for_condition(condition)));
            self.close_on_error(condition, message);
            return out;
        }

        if let Some(failed) = self
            .contents
            .iter()
            .find(|c| c.status() == NegotiatorStatus::Failed)
        {
            let message = format!("content {} failed", failed.name());
            let condition = ErrorCondition::FailedTransport;
            out.push(self.session_terminate(TerminateReason::for_condition(condition)));
            self.close_on_error(condition, message);
            return out;
        }

        out.extend(self.maybe_accept());
        out
    }

    /// Responder: send the one `session-accept` once every content is agreed
    /// and start media. Initiator: start media once the peer's accept checked out.
    fn maybe_accept(&mut self) -> Vec<Stanza> {
        if !self.is_fully_established() {
            return Vec::new();
        }
        let mut out = Vec::new();
        match self.info.role {
            Role::Responder if self.state == SessionState::Pending && !self.accept_sent => {
                let mut accept = Jingle::new(JingleAction::SessionAccept);
                accept.contents = self
                    .contents
                    .iter()
                    .filter(|c| c.status() == NegotiatorStatus::Succeeded)
                    .map(ContentNegotiator::content_block)
                    .collect::<Vec<ContentBlock>>();
                let accept = Stanza::jingle(accept);
                if let Err(e) = self.core.expect_ack(accept.id.clone()) {
                    error!("Cannot send session-accept: {}", e);
                    return out;
                }
                info!("Session {} fully negotiated, accepting", self.info.sid);
                self.accept_sent = true;
                out.push(accept);
            }
            Role::Initiator if self.state == SessionState::Active => {}
            _ => return out,
        }

        if let Err(message) = self.start_media() {
            error!("Session {} could not start media: {}", self.info.sid, message);
            out.push(self.session_terminate(TerminateReason::FailedApplication));
            self.close_on_error(ErrorCondition::NegotiationError, message);
            return out;
        }
        self.forward_content_events();
        out
    }
}

impl Negotiator for JingleSession {
    type Event = SessionEvent;

    fn core(&self) -> &NegotiatorCore<SessionEvent> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NegotiatorCore<SessionEvent> {
        &mut self.core
    }

    /// Build one content per media manager and offer them.
    fn do_start(&mut self) -> Vec<Stanza> {
        let managers = self.context.media_managers.clone();
        self.contents = managers
            .into_iter()
            .map(|manager| {
                let resolver = manager.transport_manager().resolver(&self.info);
                let name = manager.name().to_string();
                self.new_content(ContentCreator::Initiator, &name, manager, resolver)
            })
            .collect();

        let mut initiate = Jingle::new(JingleAction::SessionInitiate);
        initiate.contents = self.contents.iter().map(|c| c.content_block()).collect();
        let initiate = Stanza::jingle(initiate);
        if let Err(e) = self.core.expect_ack(initiate.id.clone()) {
            error!("Cannot send session-initiate: {}", e);
            return Vec::new();
        }
        self.set_state(SessionState::Inviting);
        vec![initiate]
    }

    fn dispatch_incoming(&mut self, stanza: &Stanza) -> Vec<Stanza> {
        match &stanza.payload {
            StanzaPayload::Result => {
                if self.is_ended() {
                    trace!("Ignoring ack {} on ended session", stanza.id);
                    return Vec::new();
                }
                self.handle_ack(stanza)
            }
            StanzaPayload::Error { condition, text } => {
                if self.is_ended() || !self.awaits_ack(&stanza.id) {
                    trace!("Ignoring error {} not answering a request of {}", stanza.id, self.info.sid);
                    return Vec::new();
                }
                if !condition.is_fatal() {
                    debug!("Peer reported {} for {}, negotiation continues", condition, stanza.id);
                    return Vec::new();
                }
                self.core.clear_expected(&stanza.id);
                let message = text.clone().unwrap_or_else(|| "peer reported an error".into());
                self.close_on_error(*condition, message);
                Vec::new()
            }
            StanzaPayload::Jingle(jingle) => {
                let Transition { next, directive } = transition(self.state, jingle.action);
                trace!("{} in {} -> {:?}", jingle.action, self.state, directive);
                match directive {
                    Directive::Reject(condition) => {
                        warn!("Rejecting {} in state {}", jingle.action, self.state);
                        let error = Stanza::error_for(
                            stanza,
                            condition,
                            Some(format!("{} not allowed in {}", jingle.action, self.state)),
                        );
                        if condition.is_fatal() && !self.is_ended() {
                            self.close_on_error(condition, format!("unexpected {}", jingle.action));
                        }
                        vec![error]
                    }
                    Directive::AckAndTerminate => self.handle_remote_terminate(stanza, jingle),
                    Directive::BuildContents => self.handle_initiate(stanza, jingle, next),
                    Directive::VerifyAccept => self.handle_accept(stanza, next),
                    Directive::Delegate => self.handle_delegate(stanza),
                }
            }
        }
    }

    fn do_close(&mut self) {
        for content in &mut self.contents {
            content.close();
        }
        self.stop_media();
    }
}

impl std::fmt::Debug for JingleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JingleSession")
            .field("sid", &self.info.sid)
            .field("role", &self.info.role)
            .field("state", &self.state)
            .field("contents", &self.contents)
            .finish()
    }
}

/// Shared, lock-guarded session
///
/// Packets for one session are processed one at a time under this lock;
/// different sessions proceed independently.
#[derive(Clone)]
pub struct SessionHandle {
    sid: SessionId,
    peer: Jid,
    inner: Arc<Mutex<JingleSession>>,
}

impl SessionHandle {
    pub fn new(session: JingleSession) -> Self {
        Self {
            sid: session.sid().clone(),
            peer: session.peer().clone(),
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub fn sid(&self) -> &SessionId {
        &self.sid
    }

    pub fn peer(&self) -> &Jid {
        &self.peer
    }

    pub fn lock(&self) -> MutexGuard<'_, JingleSession> {
        self.inner.lock()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.lock().is_ended()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("sid", &self.sid)
            .field("peer", &self.peer)
            .finish()
    }
}
