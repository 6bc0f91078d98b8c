use std::sync::{Arc, RwLock};

use crate::ids::{PeerId, RoomId};
use crate::media::TrackKind;
use crate::peer::PeerState;

/// Events emitted by the orchestrator to UI listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// State of the link to the rendezvous relay.
    ConnectionStateChanged(ConnectionState),
    PeerStateChanged { peer_id: PeerId, state: PeerState },
    /// Remote media from this peer became available.
    PeerJoined(PeerId),
    /// Remote media from this peer went away.
    PeerLeft(PeerId),
    NegotiationFailed { peer_id: PeerId, reason: String },
    LocalTrackChanged { kind: TrackKind, enabled: bool },
    RemoteTrackChanged { peer_id: PeerId, kind: TrackKind, enabled: bool },
    RoomEnded(RoomId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Trait for receiving events from the orchestrator.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait MeshEventListener: Send + Sync {
    fn on_event(&self, event: MeshEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn MeshEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn MeshEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn emit(&self, event: MeshEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

/// Listener that forwards events into a channel. Handy for async consumers.
pub struct ChannelListener {
    tx: tokio::sync::mpsc::UnboundedSender<MeshEvent>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl MeshEventListener for ChannelListener {
    fn on_event(&self, event: MeshEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl MeshEventListener for CountingListener {
        fn on_event(&self, _event: MeshEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitter_dispatches_to_multiple_listeners() {
        let emitter = EventEmitter::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        emitter.add_listener(Arc::new(CountingListener { count: count1.clone() }));
        emitter.add_listener(Arc::new(CountingListener { count: count2.clone() }));

        emitter.emit(MeshEvent::ConnectionStateChanged(ConnectionState::Connected));

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    struct Reentrant {
        emitter: EventEmitter,
        count: Arc<AtomicUsize>,
    }

    impl MeshEventListener for Reentrant {
        fn on_event(&self, _event: MeshEvent) {
            // Registering from inside a callback must not deadlock.
            if self.count.fetch_add(1, Ordering::SeqCst) == 0 {
                self.emitter.add_listener(Arc::new(CountingListener {
                    count: Arc::new(AtomicUsize::new(0)),
                }));
            }
        }
    }

    #[test]
    fn listener_may_register_during_dispatch() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        emitter.add_listener(Arc::new(Reentrant {
            emitter: emitter.clone(),
            count: count.clone(),
        }));
        emitter.emit(MeshEvent::PeerLeft(PeerId::new("p1")));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_listener_delivers_events() {
        let emitter = EventEmitter::new();
        let (listener, mut rx) = ChannelListener::new();
        emitter.add_listener(listener);
        emitter.emit(MeshEvent::PeerJoined(PeerId::new("p1")));

        match rx.recv().await {
            Some(MeshEvent::PeerJoined(peer)) => assert_eq!(peer.as_str(), "p1"),
            other => panic!("expected PeerJoined, got {other:?}"),
        }
    }
}
