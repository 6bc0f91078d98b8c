//! Contract with the rendezvous relay.
//!
//! The relay only carries connection-establishment messages between peers
//! addressed by their wire id (`{peer}_{room}`). Media and control traffic
//! never go through it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::MeshError;

pub mod memory;
pub mod peerjs;

pub use memory::{MemoryRelay, MemoryRendezvous};
pub use peerjs::PeerJsRendezvous;

/// Negotiation message exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    Offer { connection_id: String, sdp: String },
    Answer { connection_id: String, sdp: String },
    Candidate { connection_id: String, candidate: String },
    /// The sender is tearing down its connection with the receiver.
    Leave,
}

impl Signal {
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Signal::Offer { connection_id, .. }
            | Signal::Answer { connection_id, .. }
            | Signal::Candidate { connection_id, .. } => Some(connection_id),
            Signal::Leave => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
            Signal::Leave => "leave",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousEvent {
    /// Registration accepted by the relay.
    Open,
    Signal { from: String, signal: Signal },
    /// The link to the relay dropped. Established peer links are unaffected.
    Disconnected(String),
    Error(String),
}

pub type RendezvousEvents = mpsc::UnboundedReceiver<RendezvousEvent>;

#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Register `wire_id` with the relay and return the inbound event stream.
    ///
    /// Resolves once the relay accepted the id; a refused id is an error.
    async fn open(&self, wire_id: &str) -> Result<RendezvousEvents, MeshError>;

    /// Send a message to the endpoint registered as `to`.
    async fn send(&self, to: &str, signal: Signal) -> Result<(), MeshError>;

    /// Re-register after a [`RendezvousEvent::Disconnected`], reusing the
    /// event stream returned by [`Rendezvous::open`].
    async fn reconnect(&self) -> Result<(), MeshError>;

    /// Drop the registration. Idempotent.
    async fn close(&self);
}
