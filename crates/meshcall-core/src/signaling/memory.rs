use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Rendezvous, RendezvousEvent, RendezvousEvents, Signal};
use crate::errors::MeshError;

/// Messages kept per offline recipient; older ones are dropped first.
pub const MAX_PENDING_PER_ENDPOINT: usize = 256;

/// One message routed by a [`MemoryRelay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedSignal {
    pub from: String,
    pub to: String,
    pub signal: Signal,
}

#[derive(Default)]
struct RelayState {
    endpoints: HashMap<String, mpsc::UnboundedSender<RendezvousEvent>>,
    /// Messages for ids that are not registered yet, delivered on registration.
    pending: HashMap<String, VecDeque<(String, Signal)>>,
    log: Vec<RelayedSignal>,
    refused_reconnects: HashMap<String, u32>,
}

/// In-process rendezvous relay, used by tests and the simulator.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A client for this relay. Each call gives an independent endpoint.
    pub fn client(&self) -> MemoryRendezvous {
        MemoryRendezvous {
            relay: self.clone(),
            registration: Mutex::new(None),
        }
    }

    pub fn is_registered(&self, wire_id: &str) -> bool {
        self.lock().endpoints.contains_key(wire_id)
    }

    /// Every message routed so far, in order.
    pub fn relayed(&self) -> Vec<RelayedSignal> {
        self.lock().log.clone()
    }

    /// Count of relayed messages of a given kind sent from `from` to `to`.
    pub fn count(&self, from: &str, to: &str, kind: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|m| m.from == from && m.to == to && m.signal.name() == kind)
            .count()
    }

    /// Cut the link of one endpoint, as if its socket dropped.
    pub fn drop_link(&self, wire_id: &str) -> bool {
        let sender = self.lock().endpoints.remove(wire_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(RendezvousEvent::Disconnected("link dropped".into()));
                true
            }
            None => false,
        }
    }

    /// Make the next `attempts` reconnects of `wire_id` fail.
    pub fn refuse_reconnects(&self, wire_id: &str, attempts: u32) {
        self.lock()
            .refused_reconnects
            .insert(wire_id.to_string(), attempts);
    }

    fn register(
        &self,
        wire_id: &str,
        tx: mpsc::UnboundedSender<RendezvousEvent>,
    ) -> Result<(), MeshError> {
        let mut state = self.lock();
        if state.endpoints.contains_key(wire_id) {
            return Err(MeshError::Signaling(format!("id {wire_id} is taken")));
        }
        let _ = tx.send(RendezvousEvent::Open);
        for (from, signal) in state.pending.remove(wire_id).unwrap_or_default() {
            let _ = tx.send(RendezvousEvent::Signal { from, signal });
        }
        state.endpoints.insert(wire_id.to_string(), tx);
        Ok(())
    }

    fn route(&self, from: &str, to: &str, signal: Signal) -> Result<(), MeshError> {
        let mut state = self.lock();
        if !state.endpoints.contains_key(from) {
            return Err(MeshError::TransportDisconnected(format!(
                "{from} is not registered"
            )));
        }
        state.log.push(RelayedSignal {
            from: from.to_string(),
            to: to.to_string(),
            signal: signal.clone(),
        });
        match state.endpoints.get(to).cloned() {
            Some(tx) => {
                let _ = tx.send(RendezvousEvent::Signal {
                    from: from.to_string(),
                    signal,
                });
            }
            None => {
                tracing::debug!("relay: queueing {} for offline {to}", signal.name());
                let queue = state.pending.entry(to.to_string()).or_default();
                if queue.len() == MAX_PENDING_PER_ENDPOINT {
                    if let Some((dropped_from, dropped)) = queue.pop_front() {
                        tracing::debug!(
                            "relay: dropping queued {} from {dropped_from} for {to}",
                            dropped.name()
                        );
                    }
                }
                queue.push_back((from.to_string(), signal));
            }
        }
        Ok(())
    }

    /// Remove `wire_id` and whatever it queued for endpoints that never came online.
    fn unregister(&self, wire_id: &str) {
        let mut state = self.lock();
        state.endpoints.remove(wire_id);
        state.pending.retain(|_, queue| {
            queue.retain(|(from, _)| from != wire_id);
            !queue.is_empty()
        });
    }

    /// Messages waiting for `wire_id` to register.
    pub fn pending_for(&self, wire_id: &str) -> usize {
        self.lock().pending.get(wire_id).map_or(0, VecDeque::len)
    }

    fn owns(&self, wire_id: &str, tx: &mpsc::UnboundedSender<RendezvousEvent>) -> bool {
        self.lock()
            .endpoints
            .get(wire_id)
            .is_some_and(|registered| registered.same_channel(tx))
    }

    fn take_refusal(&self, wire_id: &str) -> bool {
        let mut state = self.lock();
        match state.refused_reconnects.get_mut(wire_id) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

struct Registration {
    wire_id: String,
    events: mpsc::UnboundedSender<RendezvousEvent>,
}

/// Client side of a [`MemoryRelay`].
pub struct MemoryRendezvous {
    relay: MemoryRelay,
    registration: Mutex<Option<Registration>>,
}

impl MemoryRendezvous {
    fn registration(&self) -> MutexGuard<'_, Option<Registration>> {
        self.registration
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Rendezvous for MemoryRendezvous {
    async fn open(&self, wire_id: &str) -> Result<RendezvousEvents, MeshError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.relay.register(wire_id, tx.clone())?;
        *self.registration() = Some(Registration {
            wire_id: wire_id.to_string(),
            events: tx,
        });
        Ok(rx)
    }

    async fn send(&self, to: &str, signal: Signal) -> Result<(), MeshError> {
        let from = self
            .registration()
            .as_ref()
            .map(|r| r.wire_id.clone())
            .ok_or_else(|| MeshError::Signaling("not registered".into()))?;
        self.relay.route(&from, to, signal)
    }

    async fn reconnect(&self) -> Result<(), MeshError> {
        let (wire_id, events) = {
            let registration = self.registration();
            let r = registration
                .as_ref()
                .ok_or_else(|| MeshError::Signaling("not registered".into()))?;
            (r.wire_id.clone(), r.events.clone())
        };
        if self.relay.take_refusal(&wire_id) {
            return Err(MeshError::TransportDisconnected("relay unreachable".into()));
        }
        if self.relay.owns(&wire_id, &events) {
            return Ok(());
        }
        self.relay.register(&wire_id, events)
    }

    async fn close(&self) {
        if let Some(r) = self.registration().take() {
            self.relay.unregister(&r.wire_id);
        }
    }
}
