//! Persisted client settings
//!
//! Stored as JSON in `<config_dir>/voxsync/settings.json`. Missing fields
//! take their defaults, unreadable files fall back to defaults with a
//! warning, and a few fields can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureConfig;
use crate::platform::ConstrainedPolicy;
use crate::streaming::{AudioFormat, RealtimeConfig, ReconnectPolicy};

const APP_DIR_NAME: &str = "voxsync";
const SETTINGS_FILE_NAME: &str = "settings.json";

pub const ENV_BACKEND_URL: &str = "VOXSYNC_BACKEND_URL";
pub const ENV_LANGUAGE: &str = "VOXSYNC_LANGUAGE";
pub const ENV_USER_AGENT: &str = "VOXSYNC_USER_AGENT";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to create config directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Write settings {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the voice backend; the realtime endpoint hangs below it.
    pub backend_url: String,

    /// Transcription language sent in the config message.
    pub language: String,

    /// Sample rate announced to the realtime backend.
    pub sample_rate: u32,

    /// Announced frame encoding. Talk turns always stream PCM16.
    pub audio_format: AudioFormat,

    /// Reconnect after unexpected socket closes.
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_ms: u64,

    /// Whether gesture/graph playback restrictions apply.
    pub constrained_platform: ConstrainedPolicy,

    /// User agent used by the `auto` policy.
    pub user_agent: Option<String>,

    /// Delay after closing an analysis context before the next playback.
    pub teardown_grace_ms: u64,

    /// Captures smaller than this are discarded.
    pub min_capture_bytes: usize,

    /// Captures shorter than this are discarded.
    pub min_capture_ms: u64,

    /// Audio after this point of a capture is ignored.
    pub max_capture_secs: u64,

    pub karaoke_enabled: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:54321".to_string(),
            language: "pt".to_string(),
            sample_rate: 16000,
            audio_format: AudioFormat::Pcm,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 10_000,
            connect_timeout_ms: 10_000,
            constrained_platform: ConstrainedPolicy::Auto,
            user_agent: None,
            teardown_grace_ms: 50,
            min_capture_bytes: 1024,
            min_capture_ms: 500,
            max_capture_secs: 120,
            karaoke_enabled: true,
        }
    }
}

impl ClientSettings {
    /// Apply `VOXSYNC_*` overrides; empty values are ignored
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = value(ENV_BACKEND_URL) {
            self.backend_url = url;
        }
        if let Some(language) = value(ENV_LANGUAGE) {
            self.language = language;
        }
        if let Some(user_agent) = value(ENV_USER_AGENT) {
            self.user_agent = Some(user_agent);
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: self.auto_reconnect,
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            language: self.language.clone(),
            sample_rate: self.sample_rate,
            format: self.audio_format,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect: self.reconnect_policy(),
            ..RealtimeConfig::for_backend(&self.backend_url)
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            min_bytes: self.min_capture_bytes,
            min_duration: Duration::from_millis(self.min_capture_ms),
            max_duration: Duration::from_secs(self.max_capture_secs),
        }
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

/// `<config_dir>/voxsync/settings.json`
pub fn settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load from the default location, then apply environment overrides
pub fn load_settings() -> ClientSettings {
    let mut settings = match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            ClientSettings::default()
        }
    };
    settings.apply_env_overrides();
    settings
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ClientSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ClientSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ClientSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ClientSettings::default()
        }
    }
}

pub fn save_settings(settings: &ClientSettings) -> Result<PathBuf, SettingsError> {
    let path = settings_path()?;
    save_settings_to(&path, settings)?;
    Ok(path)
}

pub fn save_settings_to(path: &Path, settings: &ClientSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(|source| SettingsError::Write {
        path: tmp_path.clone(),
        source,
    })?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(source) = std::fs::remove_file(path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(SettingsError::Write {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    })
}
