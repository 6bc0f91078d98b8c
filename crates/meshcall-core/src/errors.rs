use thiserror::Error;

use crate::ids::PeerId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("negotiation with {peer_id} failed: {reason}")]
    NegotiationFailed { peer_id: PeerId, reason: String },
    #[error("rendezvous transport disconnected: {0}")]
    TransportDisconnected(String),
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("session error: {0}")]
    Session(String),
}

impl MeshError {
    /// Failures that may clear up when the same operation is tried again.
    ///
    /// A refused registration or a bad configuration will not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MeshError::NegotiationFailed { .. } | MeshError::TransportDisconnected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_are_not_recoverable() {
        assert!(MeshError::TransportDisconnected("reset".into()).is_recoverable());
        assert!(MeshError::NegotiationFailed {
            peer_id: PeerId::new("b"),
            reason: "timeout".into(),
        }
        .is_recoverable());
        assert!(!MeshError::Signaling("id is taken".into()).is_recoverable());
        assert!(!MeshError::Config("no endpoint".into()).is_recoverable());
    }
}
