//! In-memory collaborators for unit tests

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::manager::{JingleConnection, ServiceDiscovery};
use crate::media::{MediaManager, MediaSession, PayloadType};
use crate::transport::{
    CandidateChecker, TransportCandidate, TransportKind, TransportManager, TransportResolver,
};
use crate::types::{Jid, Role, SessionId, SessionInfo, Stanza};

pub fn pt(id: u8) -> PayloadType {
    PayloadType::new(id, format!("pt{}", id))
}

pub fn host(id: &str, priority: u32) -> TransportCandidate {
    TransportCandidate::new(id, "127.0.0.1", 7000).with_priority(priority)
}

pub fn session_info(role: Role) -> SessionInfo {
    let initiator = Jid::from("romeo@montague.lit/orchard");
    let responder = Jid::from("juliet@capulet.lit/balcony");
    let local = match role {
        Role::Initiator => initiator.clone(),
        Role::Responder => responder.clone(),
    };
    SessionInfo {
        sid: SessionId::from("unit-sid"),
        initiator,
        responder,
        local,
        role,
    }
}

pub struct MockResolver {
    pub kind: TransportKind,
    pub candidates: Vec<TransportCandidate>,
    pub released: Arc<Mutex<Vec<String>>>,
}

impl TransportResolver for MockResolver {
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

impl TransportManager for MockResolver {
    fn resolver(&self, _session: &SessionInfo) -> Arc<dyn TransportResolver> {
        Arc::new(MockResolver {
            kind: self.kind,
            candidates: self.candidates.clone(),
            released: self.released.clone(),
        })
    }
}

pub struct AlwaysReachable;

impl CandidateChecker for AlwaysReachable {
    fn check(&self, _candidate: &TransportCandidate, _timeout: Duration) -> bool {
        true
    }
}

/// Records calls made on the media session
#[derive(Default)]
pub struct MediaLog(pub Mutex<Vec<String>>);

pub struct MockMediaSession {
    log: Arc<MediaLog>,
}

impl MediaSession for MockMediaSession {
    fn start_transmit(&mut self) -> anyhow::Result<()> {
        self.log.0.lock().push("start_transmit".into());
        Ok(())
    }

    fn start_receive(&mut self) -> anyhow::Result<()> {
        self.log.0.lock().push("start_receive".into());
        Ok(())
    }

    fn stop_transmit(&mut self) {
        self.log.0.lock().push("stop_transmit".into());
    }

    fn stop_receive(&mut self) {
        self.log.0.lock().push("stop_receive".into());
    }
}

pub struct MockMediaManager {
    pub name: String,
    pub payloads: Vec<PayloadType>,
    pub transport: Arc<MockResolver>,
    pub log: Arc<MediaLog>,
}

impl MockMediaManager {
    pub fn new(name: &str, payload_ids: &[u8], candidates: Vec<TransportCandidate>) -> Self {
        Self {
            name: name.to_string(),
            payloads: payload_ids.iter().map(|id| pt(*id)).collect(),
            transport: Arc::new(MockResolver {
                kind: TransportKind::RawUdp,
                candidates,
                released: Arc::new(Mutex::new(Vec::new())),
            }),
            log: Arc::new(MediaLog::default()),
        }
    }
}

impl MediaManager for MockMediaManager {
    fn name(&self) -> &str {
        &self.name
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
        _remote: &TransportCandidate,
        _local: &TransportCandidate,
        _session: &SessionInfo,
    ) -> anyhow::Result<Box<dyn MediaSession>> {
        self.log.0.lock().push(format!("create {}", payload.id));
        Ok(Box::new(MockMediaSession {
            log: self.log.clone(),
        }))
    }
}

/// Connection that records everything sent through it
pub struct RecordingConnection {
    jid: Jid,
    connected: AtomicBool,
    sent: Mutex<Vec<Stanza>>,
}

impl RecordingConnection {
    pub fn new(jid: &str) -> Self {
        Self {
            jid: Jid::from(jid),
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn take(&self) -> Vec<Stanza> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl JingleConnection for RecordingConnection {
    fn local_jid(&self) -> Jid {
        self.jid.clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_stanza(&self, stanza: Stanza) -> anyhow::Result<()> {
        self.sent.lock().push(stanza);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDisco {
    pub features: Mutex<BTreeSet<String>>,
    pub remote: Mutex<Vec<Jid>>,
}

impl ServiceDiscovery for MemoryDisco {
    fn add_feature(&self, feature: &str) {
        self.features.lock().insert(feature.to_string());
    }

    fn remove_feature(&self, feature: &str) {
        self.features.lock().remove(feature);
    }

    fn includes_feature(&self, feature: &str) -> bool {
        self.features.lock().contains(feature)
    }

    fn remote_supports(&self, jid: &Jid, _feature: &str) -> anyhow::Result<bool> {
        Ok(self.remote.lock().contains(jid))
    }
}
