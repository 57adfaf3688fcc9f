//! Single-flight audio playback
//!
//! - [`PlaybackManager`] owns at most one active playback at a time.
//! - [`WarmupUnlocker`] unlocks gesture-gated platforms ahead of the real audio.
//! - [`state`] holds the pure reducer both are driven through.

pub mod manager;
pub mod state;
pub mod warmup;

pub use manager::{PlayOutcome, PlaybackManager};
pub use warmup::{UnlockState, WarmupUnlocker};

use serde::{Deserialize, Serialize};

use crate::platform::PlayError;

/// One request to play an audio source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackRequest {
    pub id: String,
    pub source_url: String,
    /// Feature that asked for playback, for diagnostics
    pub origin_tag: String,
}

impl PlaybackRequest {
    pub fn new(
        id: impl Into<String>,
        source_url: impl Into<String>,
        origin_tag: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_url: source_url.into(),
            origin_tag: origin_tag.into(),
        }
    }

    /// Request with a generated id
    pub fn for_source(source_url: impl Into<String>, origin_tag: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), source_url, origin_tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
}

impl PlaybackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackStatus::Idle => "idle",
            PlaybackStatus::Loading => "loading",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackProgress {
    pub current_seconds: f64,
    pub duration_seconds: Option<f64>,
}

impl PlaybackProgress {
    /// Fraction in `[0, 1]`, zero while the duration is unknown
    pub fn fraction(&self) -> f64 {
        match self.duration_seconds {
            Some(d) if d > 0.0 => (self.current_seconds / d).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

/// Broadcast to every [`PlaybackManager::subscribe`] receiver
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackNotice {
    StatusChanged(PlaybackStatus),
    /// Source loaded; duration in seconds when known
    Ready {
        request_id: String,
        duration: Option<f64>,
    },
    Progress {
        request_id: String,
        progress: PlaybackProgress,
    },
    /// Refused without a gesture and saved for `retry_pending`
    Deferred(PlaybackRequest),
    Failed {
        request: PlaybackRequest,
        error: PlayError,
    },
    Ended {
        request_id: String,
    },
}
