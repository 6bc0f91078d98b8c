use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    ControlMessage, MediaEngine, NegotiationSession, RemoteStream, SessionEvent, SessionParams,
    SessionSink,
};
use crate::errors::MeshError;

#[derive(Serialize, Deserialize)]
struct LoopbackSdp {
    session: u64,
    wire_id: String,
    stream: RemoteStream,
}

struct SessionEntry {
    sink: SessionSink,
}

#[derive(Default)]
struct NetworkState {
    next_session: u64,
    sessions: HashMap<u64, SessionEntry>,
    unreachable: HashSet<String>,
    rejecting: HashSet<String>,
    latency: Duration,
    close_delay: Duration,
    created: usize,
}

/// Shared in-process "network" connecting loopback sessions.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// An engine for one endpoint attached to this network.
    pub fn engine(&self) -> LoopbackEngine {
        LoopbackEngine {
            network: self.clone(),
            propagates_track_enabled: false,
        }
    }

    /// Delay between both descriptions being applied and media arriving.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Time every `close()` takes before the session is released.
    pub fn set_close_delay(&self, delay: Duration) {
        self.lock().close_delay = delay;
    }

    /// Connectivity checks involving `wire_id` never complete.
    pub fn set_unreachable(&self, wire_id: &str, unreachable: bool) {
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(wire_id.to_string());
        } else {
            state.unreachable.remove(wire_id);
        }
    }

    /// Sessions owned by `wire_id` refuse inbound offers.
    pub fn set_rejecting(&self, wire_id: &str, rejecting: bool) {
        let mut state = self.lock();
        if rejecting {
            state.rejecting.insert(wire_id.to_string());
        } else {
            state.rejecting.remove(wire_id);
        }
    }

    /// Total sessions ever created on this network.
    pub fn sessions_created(&self) -> usize {
        self.lock().created
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    fn register(&self, sink: SessionSink) -> u64 {
        let mut state = self.lock();
        state.next_session += 1;
        state.created += 1;
        let id = state.next_session;
        state.sessions.insert(id, SessionEntry { sink });
        id
    }

    fn unregister(&self, id: u64) {
        self.lock().sessions.remove(&id);
    }

    fn sink_of(&self, id: u64) -> Option<SessionSink> {
        self.lock().sessions.get(&id).map(|e| e.sink.clone())
    }
}

/// [`MediaEngine`] that connects sessions inside one process.
#[derive(Clone)]
pub struct LoopbackEngine {
    network: LoopbackNetwork,
    propagates_track_enabled: bool,
}

impl LoopbackEngine {
    /// Pretend the transport carries track enablement itself.
    pub fn with_track_state_propagation(mut self, propagates: bool) -> Self {
        self.propagates_track_enabled = propagates;
        self
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_session(
        &self,
        params: SessionParams,
        sink: SessionSink,
    ) -> Result<Arc<dyn NegotiationSession>, MeshError> {
        let id = self.network.register(sink.clone());
        tracing::debug!(
            "loopback: session {id} {} -> {}",
            params.local_wire_id,
            params.remote_wire_id
        );
        Ok(Arc::new(LoopbackSession {
            id,
            network: self.network.clone(),
            params,
            sink,
            remote: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn propagates_track_enabled(&self) -> bool {
        self.propagates_track_enabled
    }
}

struct LoopbackSession {
    id: u64,
    network: LoopbackNetwork,
    params: SessionParams,
    sink: SessionSink,
    remote: Mutex<Option<u64>>,
    closed: Arc<AtomicBool>,
}

impl LoopbackSession {
    fn description(&self) -> String {
        let sdp = LoopbackSdp {
            session: self.id,
            wire_id: self.params.local_wire_id.clone(),
            stream: RemoteStream {
                id: self.params.local_stream.id().to_string(),
                tracks: self.params.local_stream.tracks(),
            },
        };
        serde_json::to_string(&sdp).unwrap_or_default()
    }

    fn parse(&self, sdp: &str) -> Result<LoopbackSdp, MeshError> {
        serde_json::from_str(sdp).map_err(|e| MeshError::NegotiationFailed {
            peer_id: self.sink.peer_id().clone(),
            reason: format!("malformed description: {e}"),
        })
    }

    fn ensure_open(&self) -> Result<(), MeshError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::NegotiationFailed {
                peer_id: self.sink.peer_id().clone(),
                reason: "session closed".into(),
            });
        }
        Ok(())
    }

    fn remote_session(&self) -> Option<u64> {
        *self.remote.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_remote(&self, remote: &LoopbackSdp) {
        *self.remote.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(remote.session);
    }

    /// Complete connectivity once both descriptions are known.
    fn connect(&self, stream: RemoteStream) {
        let (latency, blocked) = {
            let state = self.network.lock();
            let blocked = state.unreachable.contains(&self.params.local_wire_id)
                || state.unreachable.contains(&self.params.remote_wire_id);
            (state.latency, blocked)
        };
        if blocked {
            tracing::debug!("loopback: session {} unreachable", self.id);
            return;
        }
        let sink = self.sink.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if closed.load(Ordering::SeqCst) {
                return;
            }
            sink.emit(SessionEvent::RemoteStream(stream));
            sink.emit(SessionEvent::ControlOpen);
        });
    }
}

#[async_trait]
impl NegotiationSession for LoopbackSession {
    async fn create_offer(&self) -> Result<String, MeshError> {
        self.ensure_open()?;
        self.sink
            .emit(SessionEvent::LocalCandidate(format!("candidate:loopback {}", self.id)));
        Ok(self.description())
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, MeshError> {
        self.ensure_open()?;
        if self
            .network
            .lock()
            .rejecting
            .contains(&self.params.local_wire_id)
        {
            return Err(MeshError::NegotiationFailed {
                peer_id: self.sink.peer_id().clone(),
                reason: "offer rejected".into(),
            });
        }
        let offer = self.parse(sdp)?;
        self.set_remote(&offer);
        self.connect(offer.stream);
        Ok(self.description())
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), MeshError> {
        self.ensure_open()?;
        let answer = self.parse(sdp)?;
        self.set_remote(&answer);
        self.connect(answer.stream);
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: &str) -> Result<(), MeshError> {
        self.ensure_open()
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<(), MeshError> {
        self.ensure_open()?;
        let remote = self
            .remote_session()
            .and_then(|id| self.network.sink_of(id))
            .ok_or_else(|| MeshError::Session("control channel not open".into()))?;
        remote.emit(SessionEvent::Control(message.clone()));
        Ok(())
    }

    async fn close(&self) {
        let delay = self.network.lock().close_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.network.unregister(self.id);
        if let Some(remote) = self.remote_session().and_then(|id| self.network.sink_of(id)) {
            remote.emit(SessionEvent::Closed);
        }
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.network.unregister(self.id);
    }
}
