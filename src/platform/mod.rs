//! Platform audio capability interface
//!
//! Everything the playback core needs from the host audio stack goes through
//! the traits in this module. A backend is chosen once at startup and handed
//! to [`PlaybackManager`](crate::playback::PlaybackManager) and
//! [`WarmupUnlocker`](crate::playback::WarmupUnlocker); no business logic
//! branches on the platform after that.
//!
//! | Implementor | Where used |
//! |---|---|
//! | [`LocalSinkFactory`](crate::audio::LocalSinkFactory) | Desktop / CLI: cpal output, WAV sources |
//! | [`ScriptedPlatform`](scripted::ScriptedPlatform) | Tests and headless runs: scripted play outcomes |

pub mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Identifier of a sink instance, unique per factory
pub type SinkId = u64;

/// Outcome of a play request, resolved once the platform starts or refuses playback
pub type PlayFuture = BoxFuture<'static, Result<(), PlayError>>;

/// Events a sink emits over its lifetime
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// Source loaded and playable; duration in seconds when known
    Ready { duration: Option<f64> },
    Playing,
    Paused,
    Ended,
    TimeUpdate { current: f64, duration: f64 },
    /// Load or decode failure for the current source
    Error(String),
}

/// Why a play request did not start
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlayError {
    /// The platform refused playback that was not started from a user gesture
    #[error("playback requires a user gesture")]
    GestureRequired,
    #[error("failed to load audio: {0}")]
    Load(String),
    #[error("playback failed: {0}")]
    Failed(String),
}

/// Failures of sink and analysis-graph management
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    #[error("an analysis graph is already attached to sink {0}")]
    GraphAlreadyAttached(SinkId),
    #[error("audio analysis unavailable: {0}")]
    GraphUnavailable(String),
    #[error("failed to disconnect audio node: {0}")]
    DisconnectFailed(String),
    #[error("failed to close audio context: {0}")]
    CloseFailed(String),
    #[error("audio device error: {0}")]
    Device(String),
}

/// A playable audio element.
///
/// All methods take `&self`; implementations use interior mutability so a
/// sink can be shared between the manager, the warm-up unlocker and clocks.
pub trait AudioSink: Send + Sync {
    fn id(&self) -> SinkId;

    /// Point the sink at a new source and start loading it.
    /// `SinkEvent::Ready` is emitted once the source is playable.
    fn set_source(&self, url: &str);

    /// Request playback.
    ///
    /// The platform evaluates gesture provenance when this method is called,
    /// not when the returned future is polled, so calling it synchronously in
    /// an input handler counts as gesture-initiated. Detaching the sink must
    /// settle any outstanding play future.
    fn play(&self) -> PlayFuture;

    fn pause(&self);

    /// Seek back to the start of the current source
    fn rewind(&self);

    /// Drop the current source and release buffered audio
    fn detach(&self);

    /// Playback position in seconds
    fn current_time(&self) -> f64;

    /// Duration of the loaded source in seconds
    fn duration(&self) -> Option<f64>;

    fn is_paused(&self) -> bool;

    fn is_ended(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent>;
}

/// Frequency-analysis tap attached to exactly one sink
#[async_trait]
pub trait AnalysisGraph: Send + Sync {
    /// Latest frequency frame as byte intensities
    fn frequency_snapshot(&self) -> Vec<u8>;

    /// Detach the tap from its sink. The sink may be tapped again afterwards.
    fn disconnect(&self) -> Result<(), SinkError>;

    /// Close the processing context backing this graph
    async fn close(&self) -> Result<(), SinkError>;
}

/// Backend constructor selected once at startup
pub trait AudioSinkFactory: Send + Sync {
    fn profile(&self) -> PlatformProfile;

    fn create_sink(&self) -> Result<Arc<dyn AudioSink>, SinkError>;

    /// Build an analysis graph over `sink`.
    /// Fails with `GraphAlreadyAttached` if the sink is still tapped.
    fn attach_analyser(
        &self,
        sink: &Arc<dyn AudioSink>,
    ) -> Result<Arc<dyn AnalysisGraph>, SinkError>;

    /// Inaudible source used to unlock playback inside a gesture
    fn silent_source(&self) -> String;
}

/// How to decide whether the platform is constrained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstrainedPolicy {
    /// Classify from the reported user agent
    #[default]
    Auto,
    Always,
    Never,
}

/// Browser/OS facts relevant to audio policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlatformInfo {
    pub is_ios: bool,
    pub is_android: bool,
    pub is_safari: bool,
}

impl PlatformInfo {
    /// Classify a user agent string.
    ///
    /// Chromium and Firefox builds on iOS still run WebKit, so iOS wins over
    /// the browser brand. "Safari" appears in Chrome's user agent too; only
    /// agents without a Chromium/Android token count as Safari.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        let is_ios = ua.contains("iphone") || ua.contains("ipad") || ua.contains("ipod");
        let is_android = ua.contains("android");
        let chromium = ua.contains("chrome") || ua.contains("chromium") || ua.contains("crios");
        let is_safari = ua.contains("safari") && !chromium && !is_android;

        Self {
            is_ios,
            is_android,
            is_safari,
        }
    }

    /// WebKit gesture/graph restrictions apply
    pub fn is_webkit_constrained(&self) -> bool {
        self.is_ios || self.is_safari
    }
}

/// Capabilities resolved for the running platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProfile {
    /// Strict autoplay-gesture and audio-graph-reuse restrictions apply
    pub constrained: bool,
}

impl PlatformProfile {
    pub fn unconstrained() -> Self {
        Self { constrained: false }
    }

    pub fn constrained() -> Self {
        Self { constrained: true }
    }

    /// Resolve the profile from policy and an optional user agent.
    ///
    /// Under `Auto`, only WebKit engines are constrained; Android Chrome is not.
    pub fn resolve(policy: ConstrainedPolicy, user_agent: Option<&str>) -> Self {
        let constrained = match policy {
            ConstrainedPolicy::Always => true,
            ConstrainedPolicy::Never => false,
            ConstrainedPolicy::Auto => user_agent
                .map(|ua| PlatformInfo::from_user_agent(ua).is_webkit_constrained())
                .unwrap_or(false),
        };
        Self { constrained }
    }
}
