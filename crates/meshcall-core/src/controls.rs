use crate::engine::ControlMessage;
use crate::events::{EventEmitter, MeshEvent};
use crate::media::{LocalMediaHandle, TrackKind};
use crate::mesh::MeshCoordinator;

/// Controls for local media (microphone, camera).
///
/// Flips track enablement on the shared local stream. When the media engine
/// does not carry enablement to remote peers by itself, the new state is
/// also announced over every open control channel.
#[derive(Clone)]
pub struct MediaControls {
    local: LocalMediaHandle,
    mesh: MeshCoordinator,
    emitter: EventEmitter,
}

impl MediaControls {
    pub(crate) fn new(mesh: MeshCoordinator, emitter: EventEmitter) -> Self {
        Self {
            local: mesh.local_media(),
            mesh,
            emitter,
        }
    }

    /// Toggle the microphone. Returns the new state, `false` without an audio track.
    pub fn toggle_audio(&self) -> bool {
        self.toggle(TrackKind::Audio)
    }

    /// Toggle the camera. Returns the new state, `false` without a video track.
    pub fn toggle_video(&self) -> bool {
        self.toggle(TrackKind::Video)
    }

    pub fn set_microphone_enabled(&self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Audio, enabled)
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Video, enabled)
    }

    pub fn is_microphone_enabled(&self) -> bool {
        self.local.is_enabled(TrackKind::Audio)
    }

    pub fn is_camera_enabled(&self) -> bool {
        self.local.is_enabled(TrackKind::Video)
    }

    pub fn has_camera(&self) -> bool {
        self.local.has(TrackKind::Video)
    }

    fn toggle(&self, kind: TrackKind) -> bool {
        if !self.local.has(kind) {
            return self.local.toggle(kind);
        }
        let enabled = self.local.toggle(kind);
        self.announce(kind, enabled);
        enabled
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        if !self.local.has(kind) {
            tracing::warn!("no {kind} track to set");
            return false;
        }
        if self.local.is_enabled(kind) == enabled {
            return enabled;
        }
        let enabled = self.local.set_enabled(kind, enabled);
        tracing::info!("{kind} track enabled: {enabled}");
        self.announce(kind, enabled);
        enabled
    }

    fn announce(&self, kind: TrackKind, enabled: bool) {
        self.emitter.emit(MeshEvent::LocalTrackChanged { kind, enabled });
        if self.mesh.propagates_track_enabled() {
            return;
        }
        if let Err(e) = self
            .mesh
            .broadcast_control(ControlMessage::TrackState { kind, enabled })
        {
            tracing::debug!("track state not broadcast: {e}");
        }
    }
}
