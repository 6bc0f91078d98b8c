use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::MeshError;

/// A STUN/TURN server handed to the media engine for connectivity checks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: &str) -> Self {
        Self {
            urls: urls.to_string(),
            username: None,
            credential: None,
        }
    }
}

/// One rendezvous relay endpoint. Endpoints are tried in order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RendezvousEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default)]
    pub secure: bool,
}

fn default_path() -> String {
    "/peerjs".to_string()
}

fn default_key() -> String {
    "peerjs".to_string()
}

impl Default for RendezvousEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
            path: default_path(),
            key: default_key(),
            secure: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct VideoConstraints {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub facing: FacingMode,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            enabled: true,
            width: 1280,
            height: 720,
            frame_rate: 30,
            facing: FacingMode::User,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: VideoConstraints,
}

/// Runtime configuration of the mesh orchestrator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    pub ice_servers: Vec<IceServer>,
    pub rendezvous: Vec<RendezvousEndpoint>,
    pub media: MediaConstraints,
    pub negotiation_timeout_ms: u64,
    pub media_acquire_timeout_ms: u64,
    pub negotiation_retries: u32,
    pub retry_delay_ms: u64,
    pub transport_reconnect_attempts: u32,
    pub transport_reconnect_base_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
                IceServer::stun("stun:stun2.l.google.com:19302"),
                IceServer::stun("stun:stun3.l.google.com:19302"),
                IceServer::stun("stun:stun4.l.google.com:19302"),
                IceServer::stun("stun:stun.twilio.com:3478"),
            ],
            rendezvous: vec![RendezvousEndpoint::default()],
            media: MediaConstraints::default(),
            negotiation_timeout_ms: 30_000,
            media_acquire_timeout_ms: 10_000,
            negotiation_retries: 1,
            retry_delay_ms: 2_000,
            transport_reconnect_attempts: 5,
            transport_reconnect_base_ms: 500,
            heartbeat_interval_ms: 5_000,
        }
    }
}

impl MeshConfig {
    /// Load from a JSON file. A missing or corrupt file yields the defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring invalid config {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, MeshError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| MeshError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        if self.rendezvous.is_empty() {
            return Err(MeshError::Config("no rendezvous endpoint configured".into()));
        }
        if self.negotiation_timeout_ms == 0 {
            return Err(MeshError::Config("negotiation timeout must be positive".into()));
        }
        if self.media_acquire_timeout_ms == 0 {
            return Err(MeshError::Config("media acquire timeout must be positive".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(MeshError::Config("heartbeat interval must be positive".into()));
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn media_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.media_acquire_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// User media preferences persisted between calls.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Preferences {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default = "default_true")]
    pub camera_enabled_on_join: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            display_name: None,
            mic_enabled_on_join: true,
            camera_enabled_on_join: true,
        }
    }
}

pub struct ConfigStore {
    preferences: Mutex<Preferences>,
    file_path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: &Path) -> Self {
        let file_path = data_dir.join("settings.json");
        let preferences = Self::load(&file_path);
        Self {
            preferences: Mutex::new(preferences),
            file_path,
        }
    }

    pub fn get(&self) -> Preferences {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.lock().display_name = name;
        self.save();
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.lock().mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.lock().camera_enabled_on_join = enabled;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Preferences> {
        self.preferences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self) {
        let preferences = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&preferences) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("failed to persist preferences: {e}");
                }
            }
            Err(e) => tracing::warn!("failed to encode preferences: {e}"),
        }
    }

    fn load(path: &Path) -> Preferences {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Preferences::default(),
        }
    }
}
