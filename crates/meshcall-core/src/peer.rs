use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::engine::{NegotiationSession, RemoteStream};
use crate::ids::PeerId;
use crate::media::TrackKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationRole {
    /// We saw the peer join and sent the offer.
    Initiator,
    /// The peer reached us first; we answer.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Idle,
    Negotiating,
    MediaActive,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Idle => "idle",
            PeerState::Negotiating => "negotiating",
            PeerState::MediaActive => "media-active",
            PeerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{peer_id}: cannot {action} while {state}")]
pub struct InvalidTransition {
    pub peer_id: PeerId,
    pub state: PeerState,
    pub action: &'static str,
}

/// Read-only view of one peer connection, published to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub state: PeerState,
    pub role: Option<NegotiationRole>,
    pub display_name: Option<String>,
    pub control_open: bool,
    pub remote_audio_enabled: Option<bool>,
    pub remote_video_enabled: Option<bool>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Connection state for exactly one remote peer.
///
/// Transitions: `Idle -> Negotiating -> MediaActive -> Closed`, plus
/// `Negotiating -> Idle` when an attempt is abandoned in favour of another
/// and `* -> Closed` on teardown. A closed connection is never reused.
pub struct PeerConnection {
    peer_id: PeerId,
    generation: u64,
    state: PeerState,
    role: Option<NegotiationRole>,
    connection_id: Option<String>,
    session: Option<Arc<dyn NegotiationSession>>,
    remote_stream: Option<RemoteStream>,
    control_open: bool,
    pending_candidates: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
    /// Set once the peer appeared in a roster snapshot.
    seen_in_roster: bool,
    display_name: Option<String>,
    remote_tracks: HashMap<TrackKind, bool>,
    connected_at: Option<DateTime<Utc>>,
}

impl PeerConnection {
    pub fn new(peer_id: PeerId, generation: u64) -> Self {
        Self {
            peer_id,
            generation,
            state: PeerState::Idle,
            role: None,
            connection_id: None,
            session: None,
            remote_stream: None,
            control_open: false,
            pending_candidates: Vec::new(),
            tasks: Vec::new(),
            seen_in_roster: false,
            display_name: None,
            remote_tracks: HashMap::new(),
            connected_at: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn role(&self) -> Option<NegotiationRole> {
        self.role
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn session(&self) -> Option<Arc<dyn NegotiationSession>> {
        self.session.clone()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn is_control_open(&self) -> bool {
        self.control_open
    }

    pub fn seen_in_roster(&self) -> bool {
        self.seen_in_roster
    }

    pub fn mark_seen_in_roster(&mut self) {
        self.seen_in_roster = true;
    }

    pub fn set_display_name(&mut self, name: Option<String>) {
        if name.is_some() {
            self.display_name = name;
        }
    }

    /// Whether a message tagged with `connection_id` belongs to the current attempt.
    pub fn matches(&self, connection_id: &str) -> bool {
        self.connection_id.as_deref() == Some(connection_id)
    }

    fn invalid(&self, action: &'static str) -> InvalidTransition {
        InvalidTransition {
            peer_id: self.peer_id.clone(),
            state: self.state,
            action,
        }
    }

    fn begin(
        &mut self,
        role: NegotiationRole,
        connection_id: String,
        action: &'static str,
    ) -> Result<(), InvalidTransition> {
        if self.state != PeerState::Idle {
            return Err(self.invalid(action));
        }
        self.state = PeerState::Negotiating;
        self.role = Some(role);
        self.connection_id = Some(connection_id);
        Ok(())
    }

    /// `Idle -> Negotiating` as the offering side.
    pub fn initiate(&mut self, connection_id: String) -> Result<(), InvalidTransition> {
        self.begin(NegotiationRole::Initiator, connection_id, "initiate")
    }

    /// `Idle -> Negotiating` as the answering side.
    pub fn respond(&mut self, connection_id: String) -> Result<(), InvalidTransition> {
        self.begin(NegotiationRole::Responder, connection_id, "respond")
    }

    /// Attach the engine session produced for the current attempt.
    ///
    /// Returns the candidates that arrived before the session existed.
    pub fn attach_session(
        &mut self,
        session: Arc<dyn NegotiationSession>,
    ) -> Result<Vec<String>, InvalidTransition> {
        if self.state != PeerState::Negotiating || self.session.is_some() {
            return Err(self.invalid("attach a session"));
        }
        self.session = Some(session);
        Ok(std::mem::take(&mut self.pending_candidates))
    }

    /// Hold a remote candidate until the session is attached.
    pub fn buffer_candidate(&mut self, candidate: String) {
        self.pending_candidates.push(candidate);
    }

    pub fn track_task(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// `Negotiating -> MediaActive` once remote media arrived.
    pub fn activate(&mut self, stream: RemoteStream) -> Result<(), InvalidTransition> {
        if self.state != PeerState::Negotiating {
            return Err(self.invalid("activate media"));
        }
        self.state = PeerState::MediaActive;
        self.remote_stream = Some(stream);
        self.connected_at = Some(Utc::now());
        // Timeout and negotiation helpers are done; keep nothing running.
        self.abort_tasks();
        Ok(())
    }

    pub fn open_control(&mut self) {
        self.control_open = true;
    }

    pub fn set_remote_track(&mut self, kind: TrackKind, enabled: bool) {
        self.remote_tracks.insert(kind, enabled);
    }

    /// `Negotiating -> Idle`: abandon the current attempt under a new generation.
    ///
    /// Returns the abandoned session so the caller can close it.
    pub fn reset(
        &mut self,
        generation: u64,
    ) -> Result<Option<Arc<dyn NegotiationSession>>, InvalidTransition> {
        if self.state != PeerState::Negotiating {
            return Err(self.invalid("reset"));
        }
        self.abort_tasks();
        self.state = PeerState::Idle;
        self.generation = generation;
        self.role = None;
        self.connection_id = None;
        self.pending_candidates.clear();
        self.control_open = false;
        Ok(self.session.take())
    }

    /// Any state `-> Closed`. Returns the session to close, if any.
    pub fn close(&mut self) -> Option<Arc<dyn NegotiationSession>> {
        self.abort_tasks();
        self.state = PeerState::Closed;
        self.remote_stream = None;
        self.control_open = false;
        self.pending_candidates.clear();
        self.session.take()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            state: self.state,
            role: self.role,
            display_name: self.display_name.clone(),
            control_open: self.control_open,
            remote_audio_enabled: self.remote_tracks.get(&TrackKind::Audio).copied(),
            remote_video_enabled: self.remote_tracks.get(&TrackKind::Video).copied(),
            connected_at: self.connected_at,
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}
