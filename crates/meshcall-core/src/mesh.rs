//! Full-mesh coordinator.
//!
//! One actor task per room session owns every [`PeerConnection`]. Roster
//! updates, relay messages, engine callbacks and timers all reach it as
//! messages on ordered queues, so peer state and the published view have a
//! single writer. Readers get immutable [`MeshView`] snapshots.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::engine::{
    ControlMessage, MediaEngine, NegotiationSession, RemoteStream, SessionEvent, SessionNotice,
    SessionParams, SessionSink,
};
use crate::errors::MeshError;
use crate::events::{ConnectionState, EventEmitter, MeshEvent};
use crate::ids::{parse_wire_id, PeerId, SessionContext};
use crate::media::{LocalMediaHandle, TrackKind};
use crate::peer::{NegotiationRole, PeerConnection, PeerState, PeerSummary};
use crate::roster::Roster;
use crate::signaling::{Rendezvous, RendezvousEvent, RendezvousEvents, Signal};

/// Upper bound for closing every engine session during shutdown.
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_RECONNECT_BACKOFF_MS: u64 = 30_000;

/// External collaborators of a mesh session.
#[derive(Clone)]
pub struct MeshDeps {
    pub rendezvous: Arc<dyn Rendezvous>,
    pub engine: Arc<dyn MediaEngine>,
}

/// Consistent snapshot of the mesh.
///
/// `streams` holds an entry for a peer exactly when that peer's connection
/// is [`PeerState::MediaActive`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshView {
    pub peers: BTreeMap<PeerId, PeerSummary>,
    pub streams: BTreeMap<PeerId, RemoteStream>,
}

impl MeshView {
    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerSummary> {
        self.peers.get(peer_id)
    }

    pub fn stream(&self, peer_id: &PeerId) -> Option<&RemoteStream> {
        self.streams.get(peer_id)
    }

    /// Peers with a connection that is not closed.
    pub fn live_peers(&self) -> BTreeSet<PeerId> {
        self.peers
            .values()
            .filter(|p| p.state != PeerState::Closed)
            .map(|p| p.peer_id.clone())
            .collect()
    }

    pub fn state_of(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.peers.get(peer_id).map(|p| p.state)
    }
}

enum Command {
    Reconcile {
        roster: Roster,
        done: oneshot::Sender<()>,
    },
    Inbound {
        peer_id: PeerId,
        signal: Signal,
    },
    Broadcast(ControlMessage),
    Stop(oneshot::Sender<()>),
}

type Described = Result<(Arc<dyn NegotiationSession>, String), MeshError>;

enum Internal {
    OfferReady {
        peer_id: PeerId,
        generation: u64,
        result: Described,
    },
    AnswerReady {
        peer_id: PeerId,
        generation: u64,
        result: Described,
    },
    RemoteAnswerApplied {
        peer_id: PeerId,
        generation: u64,
        result: Result<(), MeshError>,
    },
    NegotiationTimeout {
        peer_id: PeerId,
        generation: u64,
    },
    Retry(PeerId),
    TransportReconnecting(u32),
    TransportRestored,
    TransportLost(String),
}

/// Handle to a running mesh session.
#[derive(Clone)]
pub struct MeshCoordinator {
    ctx: SessionContext,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<Arc<MeshView>>,
    connection_state: watch::Receiver<ConnectionState>,
    local: LocalMediaHandle,
    propagates_track_enabled: bool,
}

impl MeshCoordinator {
    /// Register with the rendezvous relay and start accepting connections.
    ///
    /// Takes ownership of the local media: it is released by [`stop`], or
    /// right away if start-up fails.
    ///
    /// [`stop`]: MeshCoordinator::stop
    pub async fn start(
        local: LocalMediaHandle,
        ctx: SessionContext,
        config: MeshConfig,
        deps: MeshDeps,
        emitter: EventEmitter,
    ) -> Result<Self, MeshError> {
        if let Err(e) = config.validate() {
            local.release();
            return Err(e);
        }

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        emitter.emit(MeshEvent::ConnectionStateChanged(ConnectionState::Connecting));

        let wire_id = ctx.self_wire_id();
        tracing::info!("registering {wire_id} with rendezvous relay");
        let events = match deps.rendezvous.open(&wire_id).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!("rendezvous registration failed: {e}");
                local.release();
                emitter.emit(MeshEvent::ConnectionStateChanged(ConnectionState::Disconnected));
                return Err(e);
            }
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(Arc::new(MeshView::default()));
        let propagates_track_enabled = deps.engine.propagates_track_enabled();

        let actor = MeshActor {
            ctx: ctx.clone(),
            config,
            local: local.clone(),
            rendezvous: deps.rendezvous,
            engine: deps.engine,
            emitter,
            view: view_tx,
            connection_state: state_tx,
            internal_tx,
            notices_tx,
            peers: HashMap::new(),
            roster: Roster::default(),
            attempts: HashMap::new(),
            parked: HashSet::new(),
            retry_tasks: HashMap::new(),
            reconnect_task: None,
            next_generation: 0,
            pending_events: Vec::new(),
        };
        tokio::spawn(actor.run(commands_rx, internal_rx, notices_rx, events));

        Ok(Self {
            ctx,
            commands: commands_tx,
            view: view_rx,
            connection_state: state_rx,
            local,
            propagates_track_enabled,
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Apply a roster snapshot and wait until the mesh reflects it.
    ///
    /// Connections to newly listed peers are initiated; connections to
    /// peers no longer listed are torn down. Repeating a snapshot is a no-op.
    pub async fn reconcile(&self, roster: Roster) -> Result<(), MeshError> {
        let (done, applied) = oneshot::channel();
        self.send(Command::Reconcile { roster, done })?;
        applied.await.map_err(|_| stopped())
    }

    /// Feed a negotiation message received outside the relay event stream.
    pub fn on_inbound_connection(&self, peer_id: PeerId, signal: Signal) -> Result<(), MeshError> {
        self.send(Command::Inbound { peer_id, signal })
    }

    /// Send a control message to every peer with an open control channel.
    pub fn broadcast_control(&self, message: ControlMessage) -> Result<(), MeshError> {
        self.send(Command::Broadcast(message))
    }

    /// Tear down every connection, release local media and leave the relay.
    ///
    /// Returns once everything is released. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<(), MeshError> {
        let (ack, stopped) = oneshot::channel();
        if self.commands.send(Command::Stop(ack)).is_err() {
            return Ok(());
        }
        let _ = stopped.await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    pub fn view(&self) -> Arc<MeshView> {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MeshView>> {
        self.view.clone()
    }

    pub fn remote_streams(&self) -> BTreeMap<PeerId, RemoteStream> {
        self.view().streams.clone()
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.view().peers.values().cloned().collect()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state.borrow().clone()
    }

    pub fn local_media(&self) -> LocalMediaHandle {
        self.local.clone()
    }

    pub fn propagates_track_enabled(&self) -> bool {
        self.propagates_track_enabled
    }

    fn send(&self, command: Command) -> Result<(), MeshError> {
        self.commands.send(command).map_err(|_| stopped())
    }
}

fn stopped() -> MeshError {
    MeshError::Session("mesh is stopped".into())
}

fn new_connection_id() -> String {
    format!("mc_{}", uuid::Uuid::new_v4().simple())
}

fn failure_reason(error: MeshError) -> String {
    match error {
        MeshError::NegotiationFailed { reason, .. } => reason,
        other => other.to_string(),
    }
}

fn spawn_close(session: Arc<dyn NegotiationSession>) {
    tokio::spawn(async move {
        session.close().await;
    });
}

async fn next_transport_event(events: &mut Option<RendezvousEvents>) -> Option<RendezvousEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct MeshActor {
    ctx: SessionContext,
    config: MeshConfig,
    local: LocalMediaHandle,
    rendezvous: Arc<dyn Rendezvous>,
    engine: Arc<dyn MediaEngine>,
    emitter: EventEmitter,
    view: watch::Sender<Arc<MeshView>>,
    connection_state: watch::Sender<ConnectionState>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    notices_tx: mpsc::UnboundedSender<SessionNotice>,
    peers: HashMap<PeerId, PeerConnection>,
    /// Latest roster snapshot.
    roster: Roster,
    /// Failed attempts per peer since its last successful connection.
    attempts: HashMap<PeerId, u32>,
    /// Roster peers we do not connect to until they leave the roster or call us.
    parked: HashSet<PeerId>,
    retry_tasks: HashMap<PeerId, JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    next_generation: u64,
    pending_events: Vec<MeshEvent>,
}

impl MeshActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut notices: mpsc::UnboundedReceiver<SessionNotice>,
        events: RendezvousEvents,
    ) {
        let mut events = Some(events);
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(ack) = self.handle_command(command).await {
                            self.shutdown().await;
                            commands.close();
                            let _ = ack.send(());
                            break;
                        }
                    }
                    None => {
                        tracing::info!("all mesh handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                event = next_transport_event(&mut events) => match event {
                    Some(event) => self.handle_transport(event).await,
                    None => {
                        tracing::warn!("rendezvous event stream ended");
                        events = None;
                    }
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
                Some(notice) = notices.recv() => self.handle_notice(notice).await,
            }
            self.publish();
        }
        tracing::info!("mesh actor for room {} ended", self.ctx.room_id);
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn emit(&mut self, event: MeshEvent) {
        self.pending_events.push(event);
    }

    fn emit_state(&mut self, peer_id: &PeerId, state: PeerState) {
        tracing::debug!("{peer_id} -> {state}");
        self.emit(MeshEvent::PeerStateChanged {
            peer_id: peer_id.clone(),
            state,
        });
    }

    fn snapshot(&self) -> MeshView {
        let mut view = MeshView::default();
        for (peer_id, pc) in &self.peers {
            view.peers.insert(peer_id.clone(), pc.summary());
            if pc.state() == PeerState::MediaActive {
                if let Some(stream) = pc.remote_stream() {
                    view.streams.insert(peer_id.clone(), stream.clone());
                }
            }
        }
        view
    }

    /// Publish the view, then deliver the events produced while building it.
    fn publish(&mut self) {
        let next = self.snapshot();
        self.view.send_if_modified(|current| {
            if **current == next {
                return false;
            }
            *current = Arc::new(next);
            true
        });
        for event in std::mem::take(&mut self.pending_events) {
            self.emitter.emit(event);
        }
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        let changed = self.connection_state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        if changed {
            self.emit(MeshEvent::ConnectionStateChanged(state));
        }
    }

    fn current_mut(&mut self, peer_id: &PeerId, generation: u64) -> Option<&mut PeerConnection> {
        self.peers
            .get_mut(peer_id)
            .filter(|pc| pc.generation() == generation && pc.state() != PeerState::Closed)
    }

    fn is_current(&self, peer_id: &PeerId, generation: u64) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|pc| pc.generation() == generation && pc.state() != PeerState::Closed)
    }

    fn in_roster(&self, peer_id: &PeerId) -> bool {
        peer_id != &self.ctx.self_peer_id && self.roster.contains(peer_id)
    }

    fn roster_name(&self, peer_id: &PeerId) -> Option<String> {
        self.roster
            .participant(peer_id)
            .map(|p| p.display_name.clone())
    }

    fn session_params(&self, peer_id: &PeerId) -> SessionParams {
        SessionParams {
            local_wire_id: self.ctx.self_wire_id(),
            remote_wire_id: self.ctx.wire_id_of(peer_id),
            local_stream: self.local.stream(),
            ice_servers: self.config.ice_servers.clone(),
        }
    }

    async fn send_signal(&self, peer_id: &PeerId, signal: Signal) {
        let to = self.ctx.wire_id_of(peer_id);
        let kind = signal.name();
        if let Err(e) = self.rendezvous.send(&to, signal).await {
            tracing::warn!("failed to send {kind} to {peer_id}: {e}");
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Reconcile { roster, done } => {
                self.reconcile(roster).await;
                // Publish before acknowledging so the caller sees the result.
                self.publish();
                let _ = done.send(());
            }
            Command::Inbound { peer_id, signal } => self.handle_signal(peer_id, signal).await,
            Command::Broadcast(message) => self.broadcast(message),
            Command::Stop(ack) => return ControlFlow::Break(ack),
        }
        ControlFlow::Continue(())
    }

    async fn reconcile(&mut self, roster: Roster) {
        let desired = roster.desired_peers(&self.ctx.self_peer_id);
        self.roster = roster;

        self.parked.retain(|p| desired.contains(p));
        self.attempts.retain(|p, _| desired.contains(p));
        self.retry_tasks.retain(|p, task| {
            let keep = desired.contains(p);
            if !keep {
                task.abort();
            }
            keep
        });

        // Connections accepted from peers we never saw listed stay up: an
        // inbound connection may legitimately precede the roster update.
        let departed: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(peer_id, pc)| !desired.contains(*peer_id) && pc.seen_in_roster())
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in departed {
            tracing::info!("{peer_id} left the roster");
            self.send_signal(&peer_id, Signal::Leave).await;
            self.teardown(&peer_id, "left the roster");
        }

        let mut created = 0usize;
        for peer_id in desired {
            let name = self.roster_name(&peer_id);
            if let Some(pc) = self.peers.get_mut(&peer_id) {
                pc.mark_seen_in_roster();
                pc.set_display_name(name);
                continue;
            }
            if self.parked.contains(&peer_id) || self.retry_tasks.contains_key(&peer_id) {
                continue;
            }
            self.initiate(peer_id);
            created += 1;
        }
        tracing::debug!(
            "reconciled roster: {} peers, {created} new connections",
            self.peers.len()
        );
    }

    /// Create a connection and start the initiator path.
    fn initiate(&mut self, peer_id: PeerId) {
        let generation = self.bump_generation();
        let mut pc = PeerConnection::new(peer_id.clone(), generation);
        pc.mark_seen_in_roster();
        pc.set_display_name(self.roster_name(&peer_id));
        if let Err(e) = pc.initiate(new_connection_id()) {
            tracing::warn!("{e}");
            return;
        }
        tracing::info!("connecting to {peer_id} as initiator");

        let engine = self.engine.clone();
        let params = self.session_params(&peer_id);
        let sink = SessionSink::new(peer_id.clone(), generation, self.notices_tx.clone());
        let internal = self.internal_tx.clone();
        let task_peer = peer_id.clone();
        pc.track_task(tokio::spawn(async move {
            let result: Described = async {
                let session = engine.create_session(params, sink).await?;
                let offer = session.create_offer().await?;
                Ok((session, offer))
            }
            .await;
            let _ = internal.send(Internal::OfferReady {
                peer_id: task_peer,
                generation,
                result,
            });
        }));
        pc.track_task(self.spawn_timeout(&peer_id, generation));

        self.peers.insert(peer_id.clone(), pc);
        self.emit_state(&peer_id, PeerState::Negotiating);
    }

    /// Start the responder path for an inbound offer, creating or reusing the connection.
    fn respond(&mut self, peer_id: PeerId, connection_id: String, sdp: String) {
        self.parked.remove(&peer_id);
        if let Some(task) = self.retry_tasks.remove(&peer_id) {
            task.abort();
        }

        let existing = self
            .peers
            .get(&peer_id)
            .map(|pc| (pc.state(), pc.role(), pc.matches(&connection_id)));
        let generation = self.bump_generation();

        match existing {
            Some((_, _, true)) => {
                tracing::debug!("duplicate offer {connection_id} from {peer_id}");
                return;
            }
            Some((PeerState::Negotiating, role, false)) => {
                if role == Some(NegotiationRole::Initiator)
                    && self.ctx.self_wire_id() < self.ctx.wire_id_of(&peer_id)
                {
                    tracing::info!("offer collision with {peer_id}: keeping ours");
                    return;
                }
                tracing::info!("abandoning pending negotiation with {peer_id} for its offer");
                let Some(pc) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                match pc.reset(generation) {
                    Ok(Some(session)) => spawn_close(session),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("{e}"),
                }
                self.emit_state(&peer_id, PeerState::Idle);
            }
            Some((PeerState::MediaActive, _, false)) => {
                tracing::info!("{peer_id} renegotiates an active connection");
                self.teardown(&peer_id, "replaced by a new offer");
            }
            Some((PeerState::Idle, _, false)) | Some((PeerState::Closed, _, false)) | None => {}
        }

        let mut pc = match self.peers.remove(&peer_id) {
            Some(pc) if pc.state() == PeerState::Idle => pc,
            _ => {
                let mut pc = PeerConnection::new(peer_id.clone(), generation);
                if self.in_roster(&peer_id) {
                    pc.mark_seen_in_roster();
                }
                pc.set_display_name(self.roster_name(&peer_id));
                pc
            }
        };
        let generation = pc.generation();
        if let Err(e) = pc.respond(connection_id) {
            tracing::warn!("{e}");
            return;
        }
        tracing::info!("answering inbound connection from {peer_id}");

        let engine = self.engine.clone();
        let params = self.session_params(&peer_id);
        let sink = SessionSink::new(peer_id.clone(), generation, self.notices_tx.clone());
        let internal = self.internal_tx.clone();
        let task_peer = peer_id.clone();
        pc.track_task(tokio::spawn(async move {
            let result: Described = async {
                let session = engine.create_session(params, sink).await?;
                let answer = session.accept_offer(&sdp).await?;
                Ok((session, answer))
            }
            .await;
            let _ = internal.send(Internal::AnswerReady {
                peer_id: task_peer,
                generation,
                result,
            });
        }));
        pc.track_task(self.spawn_timeout(&peer_id, generation));

        self.peers.insert(peer_id.clone(), pc);
        self.emit_state(&peer_id, PeerState::Negotiating);
    }

    fn spawn_timeout(&self, peer_id: &PeerId, generation: u64) -> JoinHandle<()> {
        let internal = self.internal_tx.clone();
        let timeout = self.config.negotiation_timeout();
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal.send(Internal::NegotiationTimeout {
                peer_id,
                generation,
            });
        })
    }

    /// Remove the connection and release its session. No retry decision here.
    fn teardown(&mut self, peer_id: &PeerId, reason: &str) {
        let Some(mut pc) = self.peers.remove(peer_id) else {
            return;
        };
        let was_active = pc.state() == PeerState::MediaActive;
        tracing::info!("closing connection to {peer_id}: {reason}");
        if let Some(session) = pc.close() {
            spawn_close(session);
        }
        self.emit_state(peer_id, PeerState::Closed);
        if was_active {
            self.emit(MeshEvent::PeerLeft(peer_id.clone()));
        }
    }

    /// Tear down after a failure and decide whether to try again.
    fn lose(&mut self, peer_id: &PeerId, reason: String, negotiation_failed: bool) {
        self.teardown(peer_id, &reason);
        if negotiation_failed {
            tracing::warn!("negotiation with {peer_id} failed: {reason}");
            self.emit(MeshEvent::NegotiationFailed {
                peer_id: peer_id.clone(),
                reason,
            });
        }

        if !self.in_roster(peer_id) {
            return;
        }
        let attempts = self.attempts.entry(peer_id.clone()).or_insert(0);
        *attempts += 1;
        if *attempts > self.config.negotiation_retries {
            tracing::warn!("giving up on {peer_id} after {} attempts", *attempts);
            self.parked.insert(peer_id.clone());
            return;
        }

        let delay = self.config.retry_delay();
        tracing::info!("retrying {peer_id} in {delay:?}");
        let internal = self.internal_tx.clone();
        let task_peer = peer_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::Retry(task_peer));
        });
        if let Some(old) = self.retry_tasks.insert(peer_id.clone(), task) {
            old.abort();
        }
    }

    async fn handle_signal(&mut self, peer_id: PeerId, signal: Signal) {
        if peer_id == self.ctx.self_peer_id {
            return;
        }
        match signal {
            Signal::Offer { connection_id, sdp } => self.respond(peer_id, connection_id, sdp),
            Signal::Answer { connection_id, sdp } => {
                let internal = self.internal_tx.clone();
                let Some(pc) = self.peers.get_mut(&peer_id) else {
                    tracing::debug!("answer from {peer_id} without a connection");
                    return;
                };
                if !pc.matches(&connection_id)
                    || pc.role() != Some(NegotiationRole::Initiator)
                    || pc.state() != PeerState::Negotiating
                {
                    tracing::debug!("dropping stale answer {connection_id} from {peer_id}");
                    return;
                }
                let Some(session) = pc.session() else {
                    tracing::warn!("answer from {peer_id} before our offer was sent");
                    return;
                };
                let generation = pc.generation();
                let task_peer = peer_id.clone();
                pc.track_task(tokio::spawn(async move {
                    let result = session.accept_answer(&sdp).await;
                    let _ = internal.send(Internal::RemoteAnswerApplied {
                        peer_id: task_peer,
                        generation,
                        result,
                    });
                }));
            }
            Signal::Candidate {
                connection_id,
                candidate,
            } => {
                let Some(pc) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                if !pc.matches(&connection_id) {
                    tracing::debug!("dropping candidate for stale connection {connection_id}");
                    return;
                }
                match pc.session() {
                    Some(session) => {
                        pc.track_task(spawn_add_candidate(session, peer_id, candidate));
                    }
                    None => pc.buffer_candidate(candidate),
                }
            }
            Signal::Leave => {
                // The remote close may have been handled first and scheduled a retry.
                if let Some(task) = self.retry_tasks.remove(&peer_id) {
                    task.abort();
                }
                if self.in_roster(&peer_id) {
                    self.parked.insert(peer_id.clone());
                }
                self.teardown(&peer_id, "peer left the call");
            }
        }
    }

    async fn handle_transport(&mut self, event: RendezvousEvent) {
        match event {
            RendezvousEvent::Open => {
                tracing::info!("rendezvous registration open");
                self.set_connection_state(ConnectionState::Connected);
            }
            RendezvousEvent::Signal { from, signal } => {
                let Some(peer_id) = parse_wire_id(&from, &self.ctx.room_id) else {
                    tracing::warn!("ignoring {} from {from}: not in this room", signal.name());
                    return;
                };
                self.handle_signal(peer_id, signal).await;
            }
            RendezvousEvent::Disconnected(reason) => {
                tracing::warn!("rendezvous link lost: {reason}");
                self.start_reconnect(reason);
            }
            RendezvousEvent::Error(reason) => {
                tracing::warn!("rendezvous error: {reason}");
            }
        }
    }

    fn start_reconnect(&mut self, reason: String) {
        if self.reconnect_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let attempts = self.config.transport_reconnect_attempts;
        let base_ms = self.config.transport_reconnect_base_ms.max(1);
        let rendezvous = self.rendezvous.clone();
        let internal = self.internal_tx.clone();
        self.reconnect_task = Some(tokio::spawn(async move {
            for attempt in 1..=attempts {
                let _ = internal.send(Internal::TransportReconnecting(attempt));
                let exp = base_ms.saturating_mul(1 << (attempt - 1).min(16));
                let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
                let backoff = exp.min(MAX_RECONNECT_BACKOFF_MS) + jitter;
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                match rendezvous.reconnect().await {
                    Ok(()) => {
                        let _ = internal.send(Internal::TransportRestored);
                        return;
                    }
                    Err(e) if !e.is_recoverable() => {
                        tracing::error!("rendezvous refused re-registration: {e}");
                        let _ = internal.send(Internal::TransportLost(e.to_string()));
                        return;
                    }
                    Err(e) => tracing::warn!("rendezvous reconnect attempt {attempt} failed: {e}"),
                }
            }
            let _ = internal.send(Internal::TransportLost(reason));
        }));
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::OfferReady {
                peer_id,
                generation,
                result,
            } => self.on_local_description(peer_id, generation, result, false).await,
            Internal::AnswerReady {
                peer_id,
                generation,
                result,
            } => self.on_local_description(peer_id, generation, result, true).await,
            Internal::RemoteAnswerApplied {
                peer_id,
                generation,
                result,
            } => {
                if let Err(e) = result {
                    if self.is_current(&peer_id, generation) {
                        self.lose(&peer_id, failure_reason(e), true);
                    }
                }
            }
            Internal::NegotiationTimeout {
                peer_id,
                generation,
            } => {
                let negotiating = self
                    .peers
                    .get(&peer_id)
                    .is_some_and(|pc| {
                        pc.generation() == generation && pc.state() == PeerState::Negotiating
                    });
                if negotiating {
                    let reason = format!(
                        "timed out after {}ms",
                        self.config.negotiation_timeout_ms
                    );
                    self.lose(&peer_id, reason, true);
                }
            }
            Internal::Retry(peer_id) => {
                self.retry_tasks.remove(&peer_id);
                if self.peers.contains_key(&peer_id)
                    || self.parked.contains(&peer_id)
                    || !self.in_roster(&peer_id)
                {
                    return;
                }
                self.initiate(peer_id);
            }
            Internal::TransportReconnecting(attempt) => {
                self.set_connection_state(ConnectionState::Reconnecting { attempt });
            }
            Internal::TransportRestored => {
                tracing::info!("rendezvous link restored");
                self.set_connection_state(ConnectionState::Connected);
            }
            Internal::TransportLost(reason) => {
                tracing::error!("rendezvous link could not be restored: {reason}");
                self.set_connection_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn on_local_description(
        &mut self,
        peer_id: PeerId,
        generation: u64,
        result: Described,
        answering: bool,
    ) {
        let (session, sdp) = match result {
            Ok(described) => described,
            Err(e) => {
                if self.is_current(&peer_id, generation) {
                    self.lose(&peer_id, failure_reason(e), true);
                }
                return;
            }
        };
        let Some(pc) = self.current_mut(&peer_id, generation) else {
            tracing::debug!("discarding session for superseded connection to {peer_id}");
            spawn_close(session);
            return;
        };
        let pending = match pc.attach_session(session.clone()) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!("{e}");
                spawn_close(session);
                return;
            }
        };
        for candidate in pending {
            pc.track_task(spawn_add_candidate(session.clone(), peer_id.clone(), candidate));
        }
        let connection_id = pc.connection_id().unwrap_or_default().to_string();
        let signal = if answering {
            Signal::Answer { connection_id, sdp }
        } else {
            Signal::Offer { connection_id, sdp }
        };
        self.send_signal(&peer_id, signal).await;
    }

    async fn handle_notice(&mut self, notice: SessionNotice) {
        let SessionNotice {
            peer_id,
            generation,
            event,
        } = notice;
        if !self.is_current(&peer_id, generation) {
            tracing::debug!("dropping late {event:?} from {peer_id} (generation {generation})");
            return;
        }

        match event {
            SessionEvent::LocalCandidate(candidate) => {
                let connection_id = self
                    .peers
                    .get(&peer_id)
                    .and_then(|pc| pc.connection_id().map(str::to_string));
                if let Some(connection_id) = connection_id {
                    self.send_signal(
                        &peer_id,
                        Signal::Candidate {
                            connection_id,
                            candidate,
                        },
                    )
                    .await;
                }
            }
            SessionEvent::RemoteStream(stream) => {
                let Some(pc) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                if let Err(e) = pc.activate(stream) {
                    tracing::debug!("{e}");
                    return;
                }
                tracing::info!("media active with {peer_id}");
                self.attempts.remove(&peer_id);
                self.emit_state(&peer_id, PeerState::MediaActive);
                self.emit(MeshEvent::PeerJoined(peer_id));
            }
            SessionEvent::ControlOpen => {
                let Some(pc) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                pc.open_control();
                let Some(session) = pc.session() else {
                    return;
                };
                let mut greeting = vec![ControlMessage::Hello {
                    display_name: self.ctx.display_name.clone(),
                }];
                if !self.engine.propagates_track_enabled() {
                    for kind in [TrackKind::Audio, TrackKind::Video] {
                        if self.local.has(kind) {
                            greeting.push(ControlMessage::TrackState {
                                kind,
                                enabled: self.local.is_enabled(kind),
                            });
                        }
                    }
                }
                let task = spawn_send_control(session, peer_id.clone(), greeting);
                if let Some(pc) = self.peers.get_mut(&peer_id) {
                    pc.track_task(task);
                }
            }
            SessionEvent::Control(message) => {
                let Some(pc) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                match message {
                    // Roster names take precedence.
                    ControlMessage::Hello { display_name } if !pc.seen_in_roster() => {
                        pc.set_display_name(display_name)
                    }
                    ControlMessage::Hello { .. } => {}
                    ControlMessage::TrackState { kind, enabled } => {
                        pc.set_remote_track(kind, enabled);
                        self.emit(MeshEvent::RemoteTrackChanged {
                            peer_id,
                            kind,
                            enabled,
                        });
                    }
                }
            }
            SessionEvent::Failed(reason) => {
                let negotiating = self
                    .peers
                    .get(&peer_id)
                    .is_some_and(|pc| pc.state() == PeerState::Negotiating);
                self.lose(&peer_id, reason, negotiating);
            }
            SessionEvent::Closed => {
                let negotiating = self
                    .peers
                    .get(&peer_id)
                    .is_some_and(|pc| pc.state() == PeerState::Negotiating);
                self.lose(&peer_id, "closed by peer".to_string(), negotiating);
            }
        }
    }

    fn broadcast(&mut self, message: ControlMessage) {
        let mut sent = 0usize;
        for (peer_id, pc) in self.peers.iter_mut() {
            if pc.state() != PeerState::MediaActive || !pc.is_control_open() {
                continue;
            }
            if let Some(session) = pc.session() {
                pc.track_task(spawn_send_control(
                    session,
                    peer_id.clone(),
                    vec![message.clone()],
                ));
                sent += 1;
            }
        }
        tracing::debug!("broadcast {message:?} to {sent} peers");
    }

    /// Release everything. Each step runs even if an earlier one failed.
    async fn shutdown(&mut self) {
        tracing::info!("stopping mesh for room {}", self.ctx.room_id);
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        for (_, task) in self.retry_tasks.drain() {
            task.abort();
        }

        let peers: Vec<(PeerId, PeerConnection)> = self.peers.drain().collect();
        let mut sessions = Vec::new();
        for (peer_id, mut pc) in peers {
            let was_active = pc.state() == PeerState::MediaActive;
            if let Some(session) = pc.close() {
                sessions.push(session);
            }
            self.send_signal(&peer_id, Signal::Leave).await;
            self.emit_state(&peer_id, PeerState::Closed);
            if was_active {
                self.emit(MeshEvent::PeerLeft(peer_id));
            }
        }
        let pending = sessions.len();
        let closing = futures_util::future::join_all(sessions.iter().map(|s| s.close()));
        if tokio::time::timeout(SESSION_CLOSE_TIMEOUT, closing)
            .await
            .is_err()
        {
            tracing::warn!("closing {pending} engine sessions timed out");
        }

        self.local.release();
        self.rendezvous.close().await;
        self.set_connection_state(ConnectionState::Disconnected);
        self.publish();
    }
}

fn spawn_add_candidate(
    session: Arc<dyn NegotiationSession>,
    peer_id: PeerId,
    candidate: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = session.add_remote_candidate(&candidate).await {
            tracing::debug!("candidate from {peer_id} rejected: {e}");
        }
    })
}

fn spawn_send_control(
    session: Arc<dyn NegotiationSession>,
    peer_id: PeerId,
    messages: Vec<ControlMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for message in messages {
            if let Err(e) = session.send_control(&message).await {
                tracing::debug!("control message to {peer_id} failed: {e}");
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(peer: &str, state: PeerState) -> PeerSummary {
        PeerSummary {
            peer_id: PeerId::new(peer),
            state,
            role: Some(NegotiationRole::Initiator),
            display_name: None,
            control_open: false,
            remote_audio_enabled: None,
            remote_video_enabled: None,
            connected_at: None,
        }
    }

    #[test]
    fn live_peers_skip_closed_entries() {
        let mut view = MeshView::default();
        for (peer, state) in [
            ("b", PeerState::Negotiating),
            ("c", PeerState::Closed),
            ("d", PeerState::MediaActive),
        ] {
            view.peers.insert(PeerId::new(peer), summary(peer, state));
        }
        assert_eq!(
            view.live_peers(),
            BTreeSet::from([PeerId::new("b"), PeerId::new("d")])
        );
        assert_eq!(view.state_of(&PeerId::new("c")), Some(PeerState::Closed));
        assert_eq!(view.state_of(&PeerId::new("z")), None);
    }

    #[test]
    fn connection_ids_are_unique() {
        let first = new_connection_id();
        let second = new_connection_id();
        assert!(first.starts_with("mc_"));
        assert_ne!(first, second);
    }

    #[test]
    fn failure_reason_strips_peer_prefix() {
        let err = MeshError::NegotiationFailed {
            peer_id: PeerId::new("b"),
            reason: "offer rejected".into(),
        };
        assert_eq!(failure_reason(err), "offer rejected");
        assert_eq!(
            failure_reason(MeshError::Session("gone".into())),
            "session error: gone"
        );
    }
}
