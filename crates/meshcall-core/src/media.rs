use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::MediaConstraints;
use crate::errors::MeshError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A captured track owned by the platform capture layer.
pub trait DeviceTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn label(&self) -> &str;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// Stop capture. Must be idempotent.
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// Platform access to camera and microphone.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request capture matching `constraints`. May never resolve if the
    /// platform leaves a permission prompt unanswered.
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn DeviceTrack>>, MeshError>;
}

/// Read-only description of one track, as offered to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
}

/// Read-only view of the local stream shared with every peer connection.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Arc<[Arc<dyn DeviceTrack>]>,
}

impl LocalStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<TrackDescriptor> {
        self.tracks
            .iter()
            .map(|t| TrackDescriptor {
                id: t.id().to_string(),
                kind: t.kind(),
                enabled: t.is_enabled(),
            })
            .collect()
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.tracks
            .iter()
            .find(|t| t.kind() == kind)
            .is_some_and(|t| t.is_enabled())
    }
}

struct HandleInner {
    stream: LocalStream,
    released: AtomicBool,
}

impl HandleInner {
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for track in self.stream.tracks.iter() {
            tracing::debug!("stopping {} track {}", track.kind(), track.label());
            track.stop();
        }
        tracing::info!("local media released: {}", self.stream.id);
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// The single local capture of an active call.
///
/// Clones share the same tracks. Tracks are stopped on [`release`] or when
/// the last clone is dropped, whichever comes first.
///
/// [`release`]: LocalMediaHandle::release
#[derive(Clone)]
pub struct LocalMediaHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for LocalMediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMediaHandle")
            .field("stream", &self.inner.stream.id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl LocalMediaHandle {
    /// Acquire one audio and (if requested) one video source.
    ///
    /// Fails with [`MeshError::MediaUnavailable`] when the platform denies
    /// access, does not answer within `timeout`, or yields no audio track.
    pub async fn acquire(
        devices: &dyn MediaDevices,
        constraints: &MediaConstraints,
        timeout: Duration,
    ) -> Result<Self, MeshError> {
        tracing::info!("requesting local media");
        let tracks = match tokio::time::timeout(timeout, devices.get_user_media(constraints)).await
        {
            Ok(Ok(tracks)) => tracks,
            Ok(Err(MeshError::MediaUnavailable(reason))) => {
                return Err(MeshError::MediaUnavailable(reason));
            }
            Ok(Err(e)) => return Err(MeshError::MediaUnavailable(e.to_string())),
            Err(_) => {
                tracing::error!("media acquisition timed out after {timeout:?}");
                return Err(MeshError::MediaUnavailable(format!(
                    "no response from capture devices after {}ms",
                    timeout.as_millis()
                )));
            }
        };

        // Wrap first so every track is stopped if we bail out below.
        let handle = Self::from_tracks(tracks);
        let Some(audio) = handle.track(TrackKind::Audio) else {
            tracing::error!("no audio track in captured media");
            handle.release();
            return Err(MeshError::MediaUnavailable("no audio track".into()));
        };
        audio.set_enabled(true);
        tracing::info!(
            "local media acquired: stream={} audio={} video={}",
            handle.inner.stream.id,
            audio.label(),
            handle.has(TrackKind::Video)
        );
        Ok(handle)
    }

    /// Wrap already captured tracks.
    pub fn from_tracks(tracks: Vec<Arc<dyn DeviceTrack>>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                stream: LocalStream {
                    id: uuid::Uuid::new_v4().to_string(),
                    tracks: tracks.into(),
                },
                released: AtomicBool::new(false),
            }),
        }
    }

    fn track(&self, kind: TrackKind) -> Option<&Arc<dyn DeviceTrack>> {
        self.inner.stream.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn stream(&self) -> LocalStream {
        self.inner.stream.clone()
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some()
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some_and(|t| t.is_enabled())
    }

    /// Flip the track's enabled flag and return the new state.
    ///
    /// Returns `false` and changes nothing when the track is absent.
    pub fn toggle(&self, kind: TrackKind) -> bool {
        match self.track(kind) {
            Some(track) => {
                let enabled = !track.is_enabled();
                track.set_enabled(enabled);
                tracing::info!("{kind} track enabled: {enabled}");
                enabled
            }
            None => {
                tracing::warn!("no {kind} track to toggle");
                false
            }
        }
    }

    pub fn toggle_audio(&self) -> bool {
        self.toggle(TrackKind::Audio)
    }

    pub fn toggle_video(&self) -> bool {
        self.toggle(TrackKind::Video)
    }

    /// Force a track state. Returns the resulting state (`false` if absent).
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        match self.track(kind) {
            Some(track) => {
                track.set_enabled(enabled);
                enabled
            }
            None => false,
        }
    }

    /// Stop all tracks. Idempotent.
    pub fn release(&self) {
        self.inner.release();
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}

/// In-memory capture track used by [`SyntheticDevices`].
#[derive(Debug)]
pub struct SyntheticTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl SyntheticTrack {
    pub fn new(kind: TrackKind, label: &str) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.to_string(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }
}

impl DeviceTrack for SyntheticTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceBehavior {
    Grant,
    Deny,
    Hang,
}

/// Capture devices that produce synthetic tracks, with fault injection.
#[derive(Debug)]
pub struct SyntheticDevices {
    behavior: DeviceBehavior,
    audio: bool,
    video: bool,
    issued: Mutex<Vec<Arc<SyntheticTrack>>>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            behavior: DeviceBehavior::Grant,
            audio: true,
            video: true,
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Refuse every capture request, as if permission was denied.
    pub fn denied() -> Self {
        Self {
            behavior: DeviceBehavior::Deny,
            ..Self::new()
        }
    }

    /// Never answer a capture request.
    pub fn unresponsive() -> Self {
        Self {
            behavior: DeviceBehavior::Hang,
            ..Self::new()
        }
    }

    pub fn without_audio(mut self) -> Self {
        self.audio = false;
        self
    }

    pub fn without_video(mut self) -> Self {
        self.video = false;
        self
    }

    /// Every track handed out so far.
    pub fn issued_tracks(&self) -> Vec<Arc<SyntheticTrack>> {
        self.issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn DeviceTrack>>, MeshError> {
        match self.behavior {
            DeviceBehavior::Deny => {
                return Err(MeshError::MediaUnavailable("permission denied".into()));
            }
            DeviceBehavior::Hang => std::future::pending::<()>().await,
            DeviceBehavior::Grant => {}
        }

        let mut created = Vec::new();
        if self.audio {
            created.push(SyntheticTrack::new(TrackKind::Audio, "synthetic microphone"));
        }
        if self.video && constraints.video.enabled {
            let label = format!(
                "synthetic camera {}x{}@{}",
                constraints.video.width, constraints.video.height, constraints.video.frame_rate
            );
            created.push(SyntheticTrack::new(TrackKind::Video, &label));
        }
        self.issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(created.iter().cloned());
        Ok(created
            .into_iter()
            .map(|t| t as Arc<dyn DeviceTrack>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn acquire(devices: &SyntheticDevices) -> Result<LocalMediaHandle, MeshError> {
        LocalMediaHandle::acquire(devices, &MediaConstraints::default(), TIMEOUT).await
    }

    #[tokio::test]
    async fn acquire_yields_audio_and_video() {
        let devices = SyntheticDevices::new();
        let handle = acquire(&devices).await.unwrap();
        assert!(handle.has(TrackKind::Audio));
        assert!(handle.has(TrackKind::Video));
        assert!(handle.is_enabled(TrackKind::Audio));
        assert_eq!(handle.stream().tracks().len(), 2);
    }

    #[tokio::test]
    async fn video_disabled_by_constraints() {
        let devices = SyntheticDevices::new();
        let mut constraints = MediaConstraints::default();
        constraints.video.enabled = false;
        let handle = LocalMediaHandle::acquire(&devices, &constraints, TIMEOUT)
            .await
            .unwrap();
        assert!(!handle.has(TrackKind::Video));
    }

    #[tokio::test]
    async fn denied_access_is_media_unavailable() {
        let devices = SyntheticDevices::denied();
        let err = acquire(&devices).await.unwrap_err();
        assert!(matches!(err, MeshError::MediaUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_audio_is_fatal_and_stops_video() {
        let devices = SyntheticDevices::new().without_audio();
        let err = acquire(&devices).await.unwrap_err();
        assert_eq!(err, MeshError::MediaUnavailable("no audio track".into()));
        let issued = devices.issued_tracks();
        assert_eq!(issued.len(), 1);
        assert!(!issued[0].is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_platform_times_out() {
        let devices = SyntheticDevices::unresponsive();
        let err = acquire(&devices).await.unwrap_err();
        assert!(matches!(err, MeshError::MediaUnavailable(_)));
    }

    #[tokio::test]
    async fn toggling_twice_restores_state() {
        let devices = SyntheticDevices::new();
        let handle = acquire(&devices).await.unwrap();
        assert!(!handle.toggle_audio());
        assert!(handle.toggle_audio());
        assert!(!handle.toggle_video());
        assert!(handle.toggle_video());
        assert!(handle.is_enabled(TrackKind::Video));
    }

    #[test]
    fn toggling_missing_track_returns_false() {
        let video = SyntheticTrack::new(TrackKind::Video, "cam");
        let handle = LocalMediaHandle::from_tracks(vec![video.clone()]);
        assert!(!handle.toggle_audio());
        assert!(!handle.toggle_audio());
        assert!(!handle.is_enabled(TrackKind::Audio));
        assert!(video.is_enabled());
    }

    #[tokio::test]
    async fn release_is_idempotent_and_stops_tracks() {
        let devices = SyntheticDevices::new();
        let handle = acquire(&devices).await.unwrap();
        let clone = handle.clone();
        handle.release();
        clone.release();
        assert!(handle.is_released());
        assert!(devices.issued_tracks().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn dropping_last_clone_stops_tracks() {
        let devices = SyntheticDevices::new();
        {
            let _handle = acquire(&devices).await.unwrap();
        }
        assert!(devices.issued_tracks().iter().all(|t| !t.is_live()));
    }
}
