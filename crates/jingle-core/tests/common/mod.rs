//! Shared harness for the integration tests: in-memory collaborators and a
//! pump that carries stanzas between two managers.

#![allow(dead_code)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use rvoip_jingle_core::prelude::*;
use rvoip_jingle_core::{
    CandidateChecker, JingleAction, Jid, ManagerEvent, SessionInfo, StanzaId, StanzaPayload,
    TransportKind,
};

pub const ROMEO: &str = "romeo@montague.lit/orchard";
pub const JULIET: &str = "juliet@capulet.lit/balcony";

pub struct MockConnection {
    jid: Jid,
    connected: AtomicBool,
    outbox: Mutex<VecDeque<Stanza>>,
    history: Mutex<Vec<Stanza>>,
}

impl MockConnection {
    pub fn new(jid: &str) -> Self {
        Self {
            jid: Jid::from(jid),
            connected: AtomicBool::new(true),
            outbox: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn drain(&self) -> Vec<Stanza> {
        self.outbox.lock().drain(..).collect()
    }

    /// Everything ever sent, in order
    pub fn history(&self) -> Vec<Stanza> {
        self.history.lock().clone()
    }

    pub fn sent_actions(&self, action: JingleAction) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|s| s.action() == Some(action))
            .count()
    }
}

impl JingleConnection for MockConnection {
    fn local_jid(&self) -> Jid {
        self.jid.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_stanza(&self, stanza: Stanza) -> anyhow::Result<()> {
        self.history.lock().push(stanza.clone());
        self.outbox.lock().push_back(stanza);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDisco {
    features: Mutex<BTreeSet<String>>,
}

impl ServiceDiscovery for MockDisco {
    fn add_feature(&self, feature: &str) {
        self.features.lock().insert(feature.to_string());
    }

    fn remove_feature(&self, feature: &str) {
        self.features.lock().remove(feature);
    }

    fn includes_feature(&self, feature: &str) -> bool {
        self.features.lock().contains(feature)
    }

    fn remote_supports(&self, _jid: &Jid, _feature: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}

pub struct StaticResolver {
    kind: TransportKind,
    candidates: Vec<TransportCandidate>,
    released: Arc<Mutex<Vec<String>>>,
}

impl TransportResolver for StaticResolver {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn resolve(&self, _session: &SessionInfo) -> anyhow::Result<Vec<TransportCandidate>> {
        Ok(self.candidates.clone())
    }

    fn release(&self, candidate: &TransportCandidate) {
        self.released.lock().push(candidate.id.clone());
    }
}

pub struct StaticTransport {
    pub kind: TransportKind,
    pub candidates: Vec<TransportCandidate>,
    pub released: Arc<Mutex<Vec<String>>>,
}

impl TransportManager for StaticTransport {
    fn resolver(&self, _session: &SessionInfo) -> Arc<dyn TransportResolver> {
        Arc::new(StaticResolver {
            kind: self.kind,
            candidates: self.candidates.clone(),
            released: self.released.clone(),
        })
    }
}

pub struct Reachable;

impl CandidateChecker for Reachable {
    fn check(&self, _candidate: &TransportCandidate, _timeout: Duration) -> bool {
        true
    }
}

pub struct Unreachable;

impl CandidateChecker for Unreachable {
    fn check(&self, _candidate: &TransportCandidate, _timeout: Duration) -> bool {
        false
    }
}

pub struct RecordingMedia {
    log: Arc<Mutex<Vec<String>>>,
}

impl MediaSession for RecordingMedia {
    fn start_transmit(&mut self) -> anyhow::Result<()> {
        self.log.lock().push("start_transmit".into());
        Ok(())
    }

    fn start_receive(&mut self) -> anyhow::Result<()> {
        self.log.lock().push("start_receive".into());
        Ok(())
    }

    fn stop_transmit(&mut self) {
        self.log.lock().push("stop_transmit".into());
    }

    fn stop_receive(&mut self) {
        self.log.lock().push("stop_receive".into());
    }
}

pub struct AudioManager {
    payloads: Vec<PayloadType>,
    transport: Arc<StaticTransport>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl AudioManager {
    pub fn new(payload_ids: &[u8], candidates: Vec<TransportCandidate>) -> Self {
        Self {
            payloads: payload_ids
                .iter()
                .map(|id| PayloadType::new(*id, format!("pt{}", id)))
                .collect(),
            transport: Arc::new(StaticTransport {
                kind: TransportKind::RawUdp,
                candidates,
                released: Arc::new(Mutex::new(Vec::new())),
            }),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn released(&self) -> Vec<String> {
        self.transport.released.lock().clone()
    }
}

impl MediaManager for AudioManager {
    fn name(&self) -> &str {
        "audio"
    }

    fn payloads(&self) -> Vec<PayloadType> {
        self.payloads.clone()
    }

    fn transport_manager(&self) -> Arc<dyn TransportManager> {
        self.transport.clone()
    }

    fn create_media_session(
        &self,
        payload: &PayloadType,
        remote: &TransportCandidate,
        local: &TransportCandidate,
        _session: &SessionInfo,
    ) -> anyhow::Result<Box<dyn MediaSession>> {
        self.log
            .lock()
            .push(format!("create {} {} -> {}", payload.id, local.id, remote.id));
        Ok(Box::new(RecordingMedia {
            log: self.log.clone(),
        }))
    }
}

pub fn candidate(id: &str, port: u16, priority: u32) -> TransportCandidate {
    TransportCandidate::new(id, "127.0.0.1", port).with_priority(priority)
}

/// One side of a conversation
pub struct Peer {
    pub jid: Jid,
    pub manager: JingleManager,
    pub connection: Arc<MockConnection>,
    pub media: Arc<AudioManager>,
    pub auto_accept: bool,
    pub accepted: Vec<SessionHandle>,
    pub requests: Vec<JingleSessionRequest>,
    pub events: Vec<ManagerEvent>,
    rx: UnboundedReceiver<ManagerEvent>,
}

impl Peer {
    pub fn new(jid: &str, payload_ids: &[u8], candidates: Vec<TransportCandidate>) -> Self {
        Self::with_config(jid, payload_ids, candidates, JingleConfig::default())
    }

    pub fn with_config(
        jid: &str,
        payload_ids: &[u8],
        candidates: Vec<TransportCandidate>,
        config: JingleConfig,
    ) -> Self {
        let connection = Arc::new(MockConnection::new(jid));
        let media = Arc::new(AudioManager::new(payload_ids, candidates));
        let manager = JingleManager::new(
            connection.clone(),
            Arc::new(MockDisco::default()),
            vec![media.clone() as Arc<dyn MediaManager>],
            config,
        )
        .expect("manager")
        .with_candidate_checker(Arc::new(Reachable));
        let (_id, rx) = manager.add_listener();
        Self {
            jid: Jid::from(jid),
            manager,
            connection,
            media,
            auto_accept: true,
            accepted: Vec::new(),
            requests: Vec::new(),
            events: Vec::new(),
            rx,
        }
    }

    pub fn with_checker(mut self, checker: Arc<dyn CandidateChecker>) -> Self {
        self.manager = self.manager.with_candidate_checker(checker);
        self
    }

    pub fn deliver(&mut self, stanza: Stanza) {
        self.manager.handle_stanza(&stanza).expect("handle_stanza");
        self.drain_events();
    }

    pub fn drain_events(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            if let ManagerEvent::SessionRequested(request) = &event {
                if self.auto_accept {
                    let handle = self.manager.accept_request(request).expect("accept");
                    self.accepted.push(handle);
                } else {
                    self.requests.push(request.clone());
                }
            }
            self.events.push(event);
        }
    }
}

/// Carry stanzas both ways, in send order, until neither side has anything
/// left to say. Returns the number of stanzas delivered.
pub fn pump(a: &mut Peer, b: &mut Peer) -> usize {
    pump_with(a, b, |_| {})
}

/// Like [`pump`], but lets `tamper` edit what `b` sends before `a` sees it
pub fn pump_with(a: &mut Peer, b: &mut Peer, mut tamper: impl FnMut(&mut Stanza)) -> usize {
    let mut delivered = 0;
    for _ in 0..100 {
        let from_a = a.connection.drain();
        let from_b = b.connection.drain();
        if from_a.is_empty() && from_b.is_empty() {
            return delivered;
        }
        delivered += from_a.len() + from_b.len();
        for stanza in from_a {
            b.deliver(stanza);
        }
        for mut stanza in from_b {
            tamper(&mut stanza);
            a.deliver(stanza);
        }
    }
    panic!("conversation did not settle");
}

/// Romeo offers [8, 0], Juliet supports [0, 3]
pub fn romeo_and_juliet() -> (Peer, Peer) {
    let romeo = Peer::new(ROMEO, &[8, 0], vec![candidate("r1", 10000, 100)]);
    let juliet = Peer::new(JULIET, &[0, 3], vec![candidate("j1", 20000, 50)]);
    (romeo, juliet)
}

/// An error stanza from `from` answering a request nobody sent
pub fn stray_error(from: &Peer, to: &Peer, condition: ErrorCondition) -> Stanza {
    Stanza {
        id: StanzaId::generate(),
        from: Some(from.jid.clone()),
        to: Some(to.jid.clone()),
        payload: StanzaPayload::Error {
            condition,
            text: None,
        },
    }
}

pub fn drain<E>(rx: &mut UnboundedReceiver<E>) -> Vec<E> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
