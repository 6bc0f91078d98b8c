//! Seam to the real-time media transport.
//!
//! The engine performs offer/answer, connectivity establishment and media
//! transport for one remote peer per [`NegotiationSession`]. Everything it
//! reports back goes through a [`SessionSink`] tagged with the peer and the
//! generation of the connection that created it, so late callbacks from a
//! torn-down connection can be told apart and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::errors::MeshError;
use crate::ids::PeerId;
use crate::media::{LocalStream, TrackDescriptor, TrackKind};

pub mod loopback;

pub use loopback::{LoopbackEngine, LoopbackNetwork};

/// Media received from one remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<TrackDescriptor>,
}

impl RemoteStream {
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Out-of-band messages on the per-peer control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Hello { display_name: Option<String> },
    TrackState { kind: TrackKind, enabled: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A local connectivity candidate to trickle to the peer.
    LocalCandidate(String),
    RemoteStream(RemoteStream),
    ControlOpen,
    Control(ControlMessage),
    /// Connectivity failed; the session is unusable.
    Failed(String),
    /// The remote side closed the connection.
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionNotice {
    pub peer_id: PeerId,
    pub generation: u64,
    pub event: SessionEvent,
}

/// Where a session reports its events.
#[derive(Debug, Clone)]
pub struct SessionSink {
    peer_id: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionNotice>,
}

impl SessionSink {
    pub fn new(peer_id: PeerId, generation: u64, tx: mpsc::UnboundedSender<SessionNotice>) -> Self {
        Self {
            peer_id,
            generation,
            tx,
        }
    }

    /// A sink with its own receiver, for driving a session directly.
    pub fn channel(
        peer_id: PeerId,
        generation: u64,
    ) -> (Self, mpsc::UnboundedReceiver<SessionNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(peer_id, generation, tx), rx)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the receiving side is gone.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx
            .send(SessionNotice {
                peer_id: self.peer_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Parameters for one negotiation.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub local_wire_id: String,
    pub remote_wire_id: String,
    pub local_stream: LocalStream,
    pub ice_servers: Vec<IceServer>,
}

/// One media + control link with a single remote peer.
///
/// Implementations release their resources when dropped, even if
/// [`close`](NegotiationSession::close) was never called.
#[async_trait]
pub trait NegotiationSession: Send + Sync {
    /// Initiator side: produce an offer carrying the local stream.
    async fn create_offer(&self) -> Result<String, MeshError>;

    /// Responder side: apply the remote offer and produce an answer.
    async fn accept_offer(&self, sdp: &str) -> Result<String, MeshError>;

    /// Initiator side: apply the remote answer.
    async fn accept_answer(&self, sdp: &str) -> Result<(), MeshError>;

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), MeshError>;

    async fn send_control(&self, message: &ControlMessage) -> Result<(), MeshError>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_session(
        &self,
        params: SessionParams,
        sink: SessionSink,
    ) -> Result<Arc<dyn NegotiationSession>, MeshError>;

    /// Whether remote peers see local track enablement without an explicit
    /// [`ControlMessage::TrackState`].
    fn propagates_track_enabled(&self) -> bool;
}
