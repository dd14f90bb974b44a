//! Per-connection Jingle manager
//!
//! The manager owns the session registry of one XMPP connection. It routes
//! inbound packets to the session they belong to, turns unknown
//! `session-initiate` requests into [`JingleSessionRequest`]s for the
//! application, and removes sessions once they end.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::config::JingleConfig;
use crate::constants::NAMESPACE;
use crate::errors::{ErrorCondition, JingleError, JingleResult, TerminateReason};
use crate::events::{EventBus, JingleSessionRequest, ListenerId, ManagerEvent};
use crate::media::MediaManager;
use crate::negotiator::Negotiator;
use crate::session::{JingleSession, SessionContext, SessionHandle, SessionState};
use crate::transport::{SocketAddressChecker, CandidateChecker};
use crate::types::{Jid, Jingle, JingleAction, SessionId, Stanza, StanzaPayload};

/// The XMPP connection sessions send through
pub trait JingleConnection: Send + Sync {
    /// Our own full address on this connection
    fn local_jid(&self) -> Jid;

    fn is_connected(&self) -> bool;

    fn send_stanza(&self, stanza: Stanza) -> anyhow::Result<()>;
}

/// Service discovery registry of the connection
pub trait ServiceDiscovery: Send + Sync {
    fn add_feature(&self, feature: &str);

    fn remove_feature(&self, feature: &str);

    fn includes_feature(&self, feature: &str) -> bool;

    /// Whether `jid` advertises `feature`
    fn remote_supports(&self, jid: &Jid, feature: &str) -> anyhow::Result<bool>;
}

/// Registry counts by session state
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManagerStats {
    pub total: usize,
    pub pending_requests: usize,
    pub negotiating: usize,
    pub active: usize,
}

pub struct JingleManager {
    context: SessionContext,
    disco: Arc<dyn ServiceDiscovery>,
    sessions: DashMap<SessionId, SessionHandle>,
    requests: DashMap<SessionId, JingleSessionRequest>,
    listeners: EventBus<ManagerEvent>,
}

impl JingleManager {
    pub fn new(
        connection: Arc<dyn JingleConnection>,
        disco: Arc<dyn ServiceDiscovery>,
        media_managers: Vec<Arc<dyn MediaManager>>,
        config: JingleConfig,
    ) -> JingleResult<Self> {
        config.validate()?;
        if config.advertise_feature {
            Self::set_service_enabled(disco.as_ref(), true);
        }
        info!(
            "Jingle manager ready for {} with {} media manager(s)",
            connection.local_jid(),
            media_managers.len()
        );
        Ok(Self {
            context: SessionContext {
                connection,
                media_managers,
                checker: Arc::new(SocketAddressChecker),
                config,
            },
            disco,
            sessions: DashMap::new(),
            requests: DashMap::new(),
            listeners: EventBus::new(),
        })
    }

    /// Replace the reachability probe used by new sessions.
    pub fn with_candidate_checker(mut self, checker: Arc<dyn CandidateChecker>) -> Self {
        self.context.checker = checker;
        self
    }

    /// Register or withdraw the Jingle feature. Repeated calls are no-ops.
    pub fn set_service_enabled(disco: &dyn ServiceDiscovery, enabled: bool) {
        let present = disco.includes_feature(NAMESPACE);
        if enabled && !present {
            debug!("Advertising {}", NAMESPACE);
            disco.add_feature(NAMESPACE);
        } else if !enabled && present {
            debug!("Withdrawing {}", NAMESPACE);
            disco.remove_feature(NAMESPACE);
        }
    }

    pub fn is_service_enabled(disco: &dyn ServiceDiscovery) -> bool {
        disco.includes_feature(NAMESPACE)
    }

    pub fn remote_supports_jingle(&self, jid: &Jid) -> JingleResult<bool> {
        Ok(self.disco.remote_supports(jid, NAMESPACE)?)
    }

    pub fn config(&self) -> &JingleConfig {
        &self.context.config
    }

    pub fn add_listener(
        &self,
    ) -> (ListenerId, tokio::sync::mpsc::UnboundedReceiver<ManagerEvent>) {
        self.listeners.subscribe()
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Route one inbound packet.
    pub fn handle_stanza(&self, stanza: &Stanza) -> JingleResult<()> {
        match &stanza.payload {
            StanzaPayload::Jingle(jingle) => self.handle_jingle(stanza, jingle),
            StanzaPayload::Result | StanzaPayload::Error { .. } => {
                let targets: Vec<SessionHandle> = self
                    .sessions
                    .iter()
                    .filter(|entry| stanza.from.as_ref().map_or(true, |from| entry.peer() == from))
                    .map(|entry| entry.value().clone())
                    .collect();
                if targets.is_empty() {
                    trace!("No session for response {}", stanza.id);
                }
                for handle in targets {
                    handle.lock().receive_packet_and_respond(stanza)?;
                    self.sweep(&handle);
                }
                Ok(())
            }
        }
    }

    fn handle_jingle(&self, stanza: &Stanza, jingle: &Jingle) -> JingleResult<()> {
        let Some(sid) = jingle.sid.clone() else {
            warn!("Jingle {} without a session id", jingle.action);
            self.send(Stanza::error_for(
                stanza,
                ErrorCondition::MalformedStanza,
                Some("missing sid".into()),
            ));
            return Ok(());
        };

        // Release the registry entry before taking the session lock.
        let handle = self.sessions.get(&sid).map(|entry| entry.value().clone());
        if let Some(handle) = handle {
            handle.lock().receive_packet_and_respond(stanza)?;
            self.sweep(&handle);
            return Ok(());
        }

        if jingle.action != JingleAction::SessionInitiate {
            debug!("{} for unknown session {}", jingle.action, sid);
            self.send(Stanza::error_for(stanza, ErrorCondition::UnknownSession, None));
            return Ok(());
        }

        let Some(from) = stanza.from.clone().or_else(|| jingle.initiator.clone()) else {
            self.send(Stanza::error_for(
                stanza,
                ErrorCondition::MalformedStanza,
                Some("session-initiate without initiator".into()),
            ));
            return Ok(());
        };
        if self.requests.contains_key(&sid) {
            debug!("Duplicate session-initiate for pending request {}", sid);
            return Ok(());
        }

        let request = JingleSessionRequest {
            sid: sid.clone(),
            from,
            stanza_id: stanza.id.clone(),
            stanza: stanza.clone(),
        };
        info!("Session request {} from {}", sid, request.from);
        self.requests.insert(sid, request.clone());
        self.listeners.publish(&ManagerEvent::SessionRequested(request));
        Ok(())
    }

    /// Start a session towards `responder`.
    pub fn create_outgoing_session(&self, responder: Jid) -> JingleResult<SessionHandle> {
        if self.context.config.validate_full_jid && !responder.is_full() {
            return Err(JingleError::InvalidJid(format!(
                "{} is not a full JID (node@domain/resource)",
                responder
            )));
        }
        let mut session = JingleSession::outgoing(responder, self.context.clone());
        session.start_outgoing()?;
        let handle = self.register(session);
        self.sweep(&handle);
        Ok(handle)
    }

    /// Accept a pending request: create the responder session and feed it
    /// the `session-initiate` it carries.
    pub fn accept_request(&self, request: &JingleSessionRequest) -> JingleResult<SessionHandle> {
        if self.requests.remove(&request.sid).is_none() {
            return Err(JingleError::SessionNotFound(request.sid.clone()));
        }
        let session =
            JingleSession::incoming(request.sid.clone(), request.from.clone(), self.context.clone());
        let handle = self.register(session);
        handle.lock().receive_packet_and_respond(&request.stanza)?;
        self.sweep(&handle);
        Ok(handle)
    }

    /// Decline a pending request without creating a session.
    pub fn reject_request(&self, request: &JingleSessionRequest) -> JingleResult<()> {
        if self.requests.remove(&request.sid).is_none() {
            return Err(JingleError::SessionNotFound(request.sid.clone()));
        }
        info!("Declining session request {} from {}", request.sid, request.from);
        let local = self.context.connection.local_jid();
        self.send(Stanza::result_for(&request.stanza));
        let decline = Jingle::new(JingleAction::SessionTerminate)
            .with_sid(request.sid.clone())
            .with_initiator(request.from.clone())
            .with_responder(local.clone())
            .with_reason(TerminateReason::Decline);
        self.send(Stanza::jingle(decline).with_to(request.from.clone()).with_from(local));
        Ok(())
    }

    pub fn pending_requests(&self) -> Vec<JingleSessionRequest> {
        self.requests.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn session(&self, sid: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(sid).map(|entry| entry.value().clone())
    }

    /// First live session with `jid`
    pub fn session_for_peer(&self, jid: &Jid) -> Option<SessionHandle> {
        self.sessions
            .iter()
            .find(|entry| entry.peer() == jid)
            .map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn terminate_session(&self, sid: &SessionId, reason: TerminateReason) -> JingleResult<()> {
        let handle = self
            .session(sid)
            .ok_or_else(|| JingleError::SessionNotFound(sid.clone()))?;
        handle.lock().terminate(reason)?;
        self.sweep(&handle);
        Ok(())
    }

    /// The peer went offline: end every session with it.
    pub fn handle_presence_unavailable(&self, jid: &Jid) {
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .filter(|entry| entry.peer() == jid)
            .map(|entry| entry.value().clone())
            .collect();
        self.requests.retain(|_, request| &request.from != jid);
        for handle in handles {
            info!("{} became unavailable, ending session {}", jid, handle.sid());
            if let Err(e) = handle.lock().terminate(TerminateReason::Gone) {
                warn!("Failed to end session {}: {}", handle.sid(), e);
            }
            self.sweep(&handle);
        }
    }

    pub fn disconnect_all_sessions(&self) {
        let handles: Vec<SessionHandle> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        for handle in handles {
            if let Err(e) = handle.lock().terminate(TerminateReason::Success) {
                warn!("Failed to end session {}: {}", handle.sid(), e);
            }
            self.sweep(&handle);
        }
        self.requests.clear();
    }

    /// Connection teardown: end all sessions and withdraw the feature.
    pub fn shutdown(&self) {
        info!("Shutting down Jingle manager ({} sessions)", self.sessions.len());
        self.disconnect_all_sessions();
        Self::set_service_enabled(self.disco.as_ref(), false);
    }

    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            pending_requests: self.requests.len(),
            ..Default::default()
        };
        for entry in self.sessions.iter() {
            stats.total += 1;
            match entry.state() {
                SessionState::Active => stats.active += 1,
                SessionState::Ended => {}
                _ => stats.negotiating += 1,
            }
        }
        stats
    }

    fn register(&self, session: JingleSession) -> SessionHandle {
        let handle = SessionHandle::new(session);
        self.sessions.insert(handle.sid().clone(), handle.clone());
        info!("Registered session {} with {}", handle.sid(), handle.peer());
        self.listeners
            .publish(&ManagerEvent::SessionCreated(handle.sid().clone()));
        handle
    }

    /// Drain the session's event outbox and drop it once ended.
    fn sweep(&self, handle: &SessionHandle) {
        let ended = {
            let mut session = handle.lock();
            let events = session.take_events();
            trace!("Session {} produced {} event(s)", handle.sid(), events.len());
            session.is_ended()
        };
        if ended && self.sessions.remove(handle.sid()).is_some() {
            info!("Removed session {}", handle.sid());
            self.listeners
                .publish(&ManagerEvent::SessionRemoved(handle.sid().clone()));
        }
    }

    fn send(&self, mut stanza: Stanza) {
        stanza
            .from
            .get_or_insert_with(|| self.context.connection.local_jid());
        if !self.context.connection.is_connected() {
            debug!("Not connected, dropping {}", stanza.id);
            return;
        }
        if let Err(e) = self.context.connection.send_stanza(stanza) {
            warn!("Failed to send packet: {}", e);
        }
    }
}

impl std::fmt::Debug for JingleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JingleManager")
            .field("sessions", &self.sessions.len())
            .field("requests", &self.requests.len())
            .field("listeners", &self.listeners)
            .finish()
    }
}
