#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use meshcall_core::engine::LoopbackNetwork;
use meshcall_core::events::ChannelListener;
use meshcall_core::media::SyntheticDevices;
use meshcall_core::signaling::MemoryRelay;
use meshcall_core::{
    EventEmitter, LocalMediaHandle, MeshConfig, MeshCoordinator, MeshDeps, MeshEvent, PeerId,
    PeerState, RoomId, SessionContext,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const ROOM: &str = "r1";

pub fn wire(peer: &str) -> String {
    format!("{peer}_{ROOM}")
}

pub fn pid(peer: &str) -> PeerId {
    PeerId::new(peer)
}

/// Shared relay + loopback media network.
#[derive(Clone, Default)]
pub struct Net {
    pub relay: MemoryRelay,
    pub network: LoopbackNetwork,
}

impl Net {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deps(&self) -> MeshDeps {
        MeshDeps {
            rendezvous: Arc::new(self.relay.client()),
            engine: Arc::new(self.network.engine()),
        }
    }
}

pub struct Node {
    pub peer: PeerId,
    pub mesh: MeshCoordinator,
    pub events: UnboundedReceiver<MeshEvent>,
    pub devices: SyntheticDevices,
}

impl Node {
    pub async fn start(net: &Net, peer: &str) -> Self {
        Self::start_with(net, peer, MeshConfig::default()).await
    }

    pub async fn start_with(net: &Net, peer: &str, config: MeshConfig) -> Self {
        let devices = SyntheticDevices::new();
        let local = LocalMediaHandle::acquire(
            &devices,
            &config.media,
            config.media_acquire_timeout(),
        )
        .await
        .expect("synthetic media");
        let emitter = EventEmitter::new();
        let (listener, events) = ChannelListener::new();
        emitter.add_listener(listener);
        let ctx = SessionContext::new(RoomId::new(ROOM), pid(peer));
        let mesh = MeshCoordinator::start(local, ctx, config, net.deps(), emitter)
            .await
            .expect("mesh start");
        Self {
            peer: pid(peer),
            mesh,
            events,
            devices,
        }
    }

    pub fn state_of(&self, peer: &str) -> Option<PeerState> {
        self.mesh.view().state_of(&pid(peer))
    }

    pub fn is_active_with(&self, peer: &str) -> bool {
        self.state_of(peer) == Some(PeerState::MediaActive)
    }

    /// Events received so far.
    pub fn drain(&mut self) -> Vec<MeshEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Poll `check` until it holds, failing the test after a generous deadline.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(60), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Let queued work run without advancing much time.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
