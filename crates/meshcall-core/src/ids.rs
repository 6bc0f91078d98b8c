use std::fmt;

use serde::{Deserialize, Serialize};

/// Participant identifier, only meaningful together with a [`RoomId`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier registered with the rendezvous relay: `{peer}_{room}`.
pub fn wire_id(peer: &PeerId, room: &RoomId) -> String {
    format!("{}_{}", peer.0, room.0)
}

/// Recover the peer id from a wire id, rejecting ids registered for another room.
///
/// Peer ids may themselves contain `_`, so only the room suffix is stripped.
pub fn parse_wire_id(wire: &str, room: &RoomId) -> Option<PeerId> {
    let peer = wire.strip_suffix(room.as_str())?.strip_suffix('_')?;
    if peer.is_empty() {
        return None;
    }
    Some(PeerId::new(peer))
}

/// Explicit identity of the local endpoint for one room session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub room_id: RoomId,
    pub self_peer_id: PeerId,
    pub display_name: Option<String>,
}

impl SessionContext {
    pub fn new(room_id: RoomId, self_peer_id: PeerId) -> Self {
        Self {
            room_id,
            self_peer_id,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn self_wire_id(&self) -> String {
        wire_id(&self.self_peer_id, &self.room_id)
    }

    pub fn wire_id_of(&self, peer: &PeerId) -> String {
        wire_id(peer, &self.room_id)
    }
}
