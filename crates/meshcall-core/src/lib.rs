//! Meshcall core: full-mesh group calls.
//!
//! Every participant keeps one direct media + control link to every other
//! participant of the room. The rendezvous relay is only used to set those
//! links up. Platform pieces (capture devices, the media transport, the
//! relay, the room directory) sit behind traits so shells can plug in their
//! own.

pub mod config;
pub mod controls;
pub mod engine;
pub mod errors;
pub mod events;
pub mod ids;
pub mod media;
pub mod mesh;
pub mod peer;
pub mod room;
pub mod roster;
pub mod signaling;

pub use config::{ConfigStore, MeshConfig, Preferences};
pub use controls::MediaControls;
pub use engine::{ControlMessage, MediaEngine, NegotiationSession, RemoteStream};
pub use errors::MeshError;
pub use events::{ConnectionState, EventEmitter, MeshEvent, MeshEventListener};
pub use ids::{PeerId, RoomId, SessionContext};
pub use media::{LocalMediaHandle, MediaDevices, TrackKind};
pub use mesh::{MeshCoordinator, MeshDeps, MeshView};
pub use peer::{NegotiationRole, PeerState, PeerSummary};
pub use room::{CallRoom, RoomStatusSink};
pub use roster::{Participant, Role, Roster};
pub use signaling::{Rendezvous, Signal};
