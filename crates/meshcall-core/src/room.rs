use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{MeshConfig, Preferences};
use crate::controls::MediaControls;
use crate::engine::RemoteStream;
use crate::errors::MeshError;
use crate::events::{ConnectionState, EventEmitter, MeshEvent, MeshEventListener};
use crate::ids::{PeerId, RoomId, SessionContext};
use crate::media::{LocalMediaHandle, MediaDevices, TrackKind};
use crate::mesh::{MeshCoordinator, MeshDeps};
use crate::peer::PeerSummary;
use crate::roster::Roster;

/// Write side of the directory service: the room's active flag.
#[async_trait]
pub trait RoomStatusSink: Send + Sync {
    async fn set_room_active(&self, room_id: &RoomId, active: bool) -> Result<(), MeshError>;
}

/// Clears the joining flag however `join` ends.
struct JoinGuard<'a>(&'a AtomicBool);

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Manages the lifecycle of one mesh call.
pub struct CallRoom {
    config: MeshConfig,
    emitter: EventEmitter,
    preferences: Arc<Mutex<Preferences>>,
    mesh: Arc<Mutex<Option<MeshCoordinator>>>,
    /// Set while a join is acquiring media or registering; the slot lock is not held meanwhile.
    joining: AtomicBool,
    roster: Arc<Mutex<Roster>>,
    follower: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Bumped by `leave()` to cancel a join still acquiring media.
    leave_epoch: watch::Sender<u64>,
}

impl CallRoom {
    pub fn new(config: MeshConfig) -> Self {
        let (leave_epoch, _) = watch::channel(0);
        Self {
            config,
            emitter: EventEmitter::new(),
            preferences: Arc::new(Mutex::new(Preferences::default())),
            mesh: Arc::new(Mutex::new(None)),
            joining: AtomicBool::new(false),
            roster: Arc::new(Mutex::new(Roster::default())),
            follower: Arc::new(Mutex::new(None)),
            leave_epoch,
        }
    }

    /// Register a listener for call events.
    pub fn add_listener(&self, listener: Arc<dyn MeshEventListener>) {
        self.emitter.add_listener(listener);
    }

    /// Preferences applied on the next join.
    pub async fn set_preferences(&self, preferences: Preferences) {
        *self.preferences.lock().await = preferences;
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Acquire local media and start the mesh for `ctx.room_id`.
    ///
    /// On any failure the media is released and no peer connection exists.
    pub async fn join(
        &self,
        ctx: SessionContext,
        devices: &dyn MediaDevices,
        deps: MeshDeps,
    ) -> Result<(), MeshError> {
        let mut cancelled = self.leave_epoch.subscribe();
        if self.joining.swap(true, Ordering::SeqCst) {
            return Err(MeshError::Session("join already in progress".into()));
        }
        let _joining = JoinGuard(&self.joining);
        if self.mesh.lock().await.is_some() {
            return Err(MeshError::Session("already joined".into()));
        }

        let acquire = LocalMediaHandle::acquire(
            devices,
            &self.config.media,
            self.config.media_acquire_timeout(),
        );
        let local = tokio::select! {
            result = acquire => result,
            _ = cancelled.changed() => {
                tracing::info!("join of room {} cancelled", ctx.room_id);
                Err(MeshError::Session("join cancelled".into()))
            }
        };
        let local = match local {
            Ok(local) => local,
            Err(e) => {
                tracing::error!("cannot join room {}: {e}", ctx.room_id);
                return Err(e);
            }
        };

        let preferences = self.preferences.lock().await.clone();
        if !preferences.mic_enabled_on_join {
            local.set_enabled(TrackKind::Audio, false);
        }
        if !preferences.camera_enabled_on_join {
            local.set_enabled(TrackKind::Video, false);
        }
        let ctx = match (&ctx.display_name, preferences.display_name) {
            (None, Some(name)) => ctx.with_display_name(name),
            _ => ctx,
        };

        let room_id = ctx.room_id.clone();
        let mesh = MeshCoordinator::start(
            local,
            ctx,
            self.config.clone(),
            deps,
            self.emitter.clone(),
        )
        .await?;

        let mut slot = self.mesh.lock().await;
        // `leave()` bumps the epoch before it takes the slot.
        if cancelled.has_changed().unwrap_or(true) {
            drop(slot);
            tracing::info!("join of room {room_id} cancelled");
            if let Err(e) = mesh.stop().await {
                tracing::warn!("stopping cancelled mesh: {e}");
            }
            return Err(MeshError::Session("join cancelled".into()));
        }
        *slot = Some(mesh);
        tracing::info!("joined room {room_id}");
        Ok(())
    }

    async fn coordinator(&self) -> Result<MeshCoordinator, MeshError> {
        self.mesh
            .lock()
            .await
            .clone()
            .ok_or_else(|| MeshError::Session("not joined".into()))
    }

    /// Reconcile the mesh against one roster snapshot.
    pub async fn apply_roster(&self, roster: Roster) -> Result<(), MeshError> {
        let mesh = self.coordinator().await?;
        *self.roster.lock().await = roster.clone();
        mesh.reconcile(roster).await
    }

    /// Reconcile on every snapshot published on `updates`, starting with the current one.
    pub async fn follow_roster(&self, mut updates: watch::Receiver<Roster>) -> Result<(), MeshError> {
        let mesh = self.coordinator().await?;
        let latest = self.roster.clone();
        let task = tokio::spawn(async move {
            loop {
                let roster = updates.borrow_and_update().clone();
                *latest.lock().await = roster.clone();
                if let Err(e) = mesh.reconcile(roster).await {
                    tracing::debug!("roster follower stopped: {e}");
                    break;
                }
                if updates.changed().await.is_err() {
                    tracing::debug!("roster feed closed");
                    break;
                }
            }
        });
        if let Some(previous) = self.follower.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Leave the call. Idempotent; also cancels a join in progress.
    pub async fn leave(&self) -> Result<(), MeshError> {
        self.leave_epoch.send_modify(|epoch| *epoch += 1);
        if let Some(task) = self.follower.lock().await.take() {
            task.abort();
        }
        let mesh = self.mesh.lock().await.take();
        if let Some(mesh) = mesh {
            let room_id = mesh.context().room_id.clone();
            mesh.stop().await?;
            tracing::info!("left room {room_id}");
        }
        *self.roster.lock().await = Roster::default();
        Ok(())
    }

    /// Mark the room inactive for everyone, then leave. Host only.
    pub async fn end_room(&self, status: &dyn RoomStatusSink) -> Result<(), MeshError> {
        let mesh = self.coordinator().await?;
        let ctx = mesh.context().clone();
        if !self.roster.lock().await.is_host(&ctx.self_peer_id) {
            return Err(MeshError::Session("only the host can end the room".into()));
        }
        status.set_room_active(&ctx.room_id, false).await?;
        tracing::info!("room {} ended by host", ctx.room_id);
        self.emitter.emit(MeshEvent::RoomEnded(ctx.room_id));
        self.leave().await
    }

    pub async fn controls(&self) -> Result<MediaControls, MeshError> {
        let mesh = self.coordinator().await?;
        Ok(MediaControls::new(mesh, self.emitter.clone()))
    }

    pub async fn is_joined(&self) -> bool {
        self.mesh.lock().await.is_some()
    }

    pub async fn remote_streams(&self) -> BTreeMap<PeerId, RemoteStream> {
        match self.mesh.lock().await.as_ref() {
            Some(mesh) => mesh.remote_streams(),
            None => BTreeMap::new(),
        }
    }

    pub async fn peers(&self) -> Vec<PeerSummary> {
        match self.mesh.lock().await.as_ref() {
            Some(mesh) => mesh.peers(),
            None => Vec::new(),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match self.mesh.lock().await.as_ref() {
            Some(mesh) => mesh.connection_state(),
            None => ConnectionState::Disconnected,
        }
    }

    pub async fn roster(&self) -> Roster {
        self.roster.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackNetwork;
    use crate::events::ChannelListener;
    use crate::media::{DeviceTrack, SyntheticDevices};
    use crate::roster::{Participant, Role};
    use crate::signaling::MemoryRelay;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn deps(relay: &MemoryRelay, network: &LoopbackNetwork) -> MeshDeps {
        MeshDeps {
            rendezvous: Arc::new(relay.client()),
            engine: Arc::new(network.engine()),
        }
    }

    fn ctx(peer: &str) -> SessionContext {
        SessionContext::new(RoomId::new("r1"), PeerId::new(peer))
    }

    fn participant(id: &str, role: Role) -> Participant {
        Participant {
            peer_id: PeerId::new(id),
            display_name: id.to_uppercase(),
            role,
        }
    }

    #[derive(Default)]
    struct RecordingStatus {
        writes: StdMutex<Vec<(RoomId, bool)>>,
    }

    #[async_trait]
    impl RoomStatusSink for RecordingStatus {
        async fn set_room_active(&self, room_id: &RoomId, active: bool) -> Result<(), MeshError> {
            self.writes.lock().unwrap().push((room_id.clone(), active));
            Ok(())
        }
    }

    #[tokio::test]
    async fn join_and_leave_release_media() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let devices = SyntheticDevices::new();
        let room = CallRoom::new(MeshConfig::default());

        room.join(ctx("a"), &devices, deps(&relay, &network))
            .await
            .unwrap();
        assert!(room.is_joined().await);
        assert!(relay.is_registered("a_r1"));
        assert!(devices.issued_tracks().iter().all(|t| t.is_live()));

        room.leave().await.unwrap();
        assert!(!room.is_joined().await);
        assert!(!relay.is_registered("a_r1"));
        assert!(devices.issued_tracks().iter().all(|t| !t.is_live()));
        assert_eq!(room.connection_state().await, ConnectionState::Disconnected);

        // Second leave is a no-op.
        room.leave().await.unwrap();
    }

    #[tokio::test]
    async fn denied_media_fails_join_without_connections() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let room = CallRoom::new(MeshConfig::default());

        let err = room
            .join(ctx("a"), &SyntheticDevices::denied(), deps(&relay, &network))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::MediaUnavailable(_)));
        assert!(!room.is_joined().await);
        assert!(!relay.is_registered("a_r1"));
        assert_eq!(network.sessions_created(), 0);
        assert!(room.peers().await.is_empty());
        assert!(matches!(
            room.apply_roster(Roster::from_ids(["a", "b"])).await,
            Err(MeshError::Session(_))
        ));
    }

    #[tokio::test]
    async fn second_join_is_rejected() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let devices = SyntheticDevices::new();
        let room = CallRoom::new(MeshConfig::default());
        room.join(ctx("a"), &devices, deps(&relay, &network))
            .await
            .unwrap();
        let err = room
            .join(ctx("a"), &devices, deps(&relay, &network))
            .await
            .unwrap_err();
        assert_eq!(err, MeshError::Session("already joined".into()));
        room.leave().await.unwrap();
    }

    #[tokio::test]
    async fn leave_cancels_pending_media_acquisition() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let room = Arc::new(CallRoom::new(MeshConfig::default()));

        let joining = {
            let room = room.clone();
            let deps = deps(&relay, &network);
            tokio::spawn(async move {
                room.join(ctx("a"), &SyntheticDevices::unresponsive(), deps)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        room.leave().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), joining)
            .await
            .expect("join should end promptly")
            .unwrap();
        assert_eq!(result, Err(MeshError::Session("join cancelled".into())));
        assert!(!room.is_joined().await);
        assert!(!relay.is_registered("a_r1"));
    }

    #[tokio::test]
    async fn readers_do_not_wait_for_a_pending_join() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let room = Arc::new(CallRoom::new(MeshConfig::default()));

        let joining = {
            let room = room.clone();
            let deps = deps(&relay, &network);
            tokio::spawn(async move {
                room.join(ctx("a"), &SyntheticDevices::unresponsive(), deps)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reads = tokio::time::timeout(Duration::from_millis(500), async {
            (
                room.peers().await,
                room.is_joined().await,
                room.connection_state().await,
                room.remote_streams().await,
            )
        })
        .await
        .expect("readers blocked by join");
        assert!(reads.0.is_empty());
        assert!(!reads.1);
        assert_eq!(reads.2, ConnectionState::Disconnected);
        assert!(reads.3.is_empty());
        assert!(matches!(room.controls().await, Err(MeshError::Session(_))));

        let second = room
            .join(ctx("a"), &SyntheticDevices::new(), deps(&relay, &network))
            .await;
        assert_eq!(
            second,
            Err(MeshError::Session("join already in progress".into()))
        );

        room.leave().await.unwrap();
        let first = joining.await.unwrap();
        assert_eq!(first, Err(MeshError::Session("join cancelled".into())));

        // The flag is cleared once the cancelled join returns.
        room.join(ctx("a"), &SyntheticDevices::new(), deps(&relay, &network))
            .await
            .unwrap();
        assert!(room.is_joined().await);
        room.leave().await.unwrap();
    }

    #[tokio::test]
    async fn preferences_apply_on_join() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let room = CallRoom::new(MeshConfig::default());
        room.set_preferences(Preferences {
            display_name: Some("Alice".into()),
            mic_enabled_on_join: false,
            camera_enabled_on_join: true,
        })
        .await;

        room.join(ctx("a"), &SyntheticDevices::new(), deps(&relay, &network))
            .await
            .unwrap();
        let controls = room.controls().await.unwrap();
        assert!(!controls.is_microphone_enabled());
        assert!(controls.is_camera_enabled());
        room.leave().await.unwrap();
    }

    #[tokio::test]
    async fn end_room_requires_host() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let room = CallRoom::new(MeshConfig::default());
        let status = RecordingStatus::default();
        room.join(ctx("a"), &SyntheticDevices::new(), deps(&relay, &network))
            .await
            .unwrap();
        room.apply_roster(Roster::new(vec![
            participant("a", Role::Participant),
            participant("b", Role::Host),
        ]))
        .await
        .unwrap();

        let err = room.end_room(&status).await.unwrap_err();
        assert!(matches!(err, MeshError::Session(_)));
        assert!(status.writes.lock().unwrap().is_empty());
        assert!(room.is_joined().await);
        room.leave().await.unwrap();
    }

    #[tokio::test]
    async fn host_ends_room() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let room = CallRoom::new(MeshConfig::default());
        let (listener, mut events) = ChannelListener::new();
        room.add_listener(listener);
        let status = RecordingStatus::default();

        room.join(ctx("a"), &SyntheticDevices::new(), deps(&relay, &network))
            .await
            .unwrap();
        room.apply_roster(Roster::new(vec![participant("a", Role::Host)]))
            .await
            .unwrap();
        room.end_room(&status).await.unwrap();

        assert_eq!(
            *status.writes.lock().unwrap(),
            vec![(RoomId::new("r1"), false)]
        );
        assert!(!room.is_joined().await);

        let mut ended = false;
        while let Ok(event) = events.try_recv() {
            if event == MeshEvent::RoomEnded(RoomId::new("r1")) {
                ended = true;
            }
        }
        assert!(ended);
    }

    #[tokio::test]
    async fn follows_roster_updates() {
        let relay = MemoryRelay::new();
        let network = LoopbackNetwork::new();
        let room = CallRoom::new(MeshConfig::default());
        room.join(ctx("a"), &SyntheticDevices::new(), deps(&relay, &network))
            .await
            .unwrap();

        let (roster_tx, roster_rx) = watch::channel(Roster::from_ids(["a"]));
        room.follow_roster(roster_rx).await.unwrap();
        roster_tx.send(Roster::from_ids(["a", "b"])).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while relay.count("a_r1", "b_r1", "offer") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("offer to b");
        assert_eq!(room.roster().await.len(), 2);
        assert_eq!(room.peers().await.len(), 1);
        room.leave().await.unwrap();
    }
}
