//! voxsync: interruption-safe voice playback, karaoke word sync and
//! realtime transcription for voice-assistant clients.
//!
//! [`VoiceClient`] composes one instance of every service from
//! [`ClientSettings`]; nothing lives in process-global state.

pub mod audio;
pub mod capture;
pub mod karaoke;
pub mod platform;
pub mod playback;
pub mod settings;
pub mod streaming;
mod util;

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use audio::{LocalMicrophone, LocalSinkFactory};
use capture::{CaptureError, CapturedAudio, MicrophoneSource, PushToTalkCapture};
use karaoke::{KaraokeSession, KaraokeSync, SimulatedClock, WordTrack};
use platform::{AudioSinkFactory, PlatformProfile, SinkError};
use playback::{PlayOutcome, PlaybackManager, WarmupUnlocker};
use settings::ClientSettings;
use streaming::{
    AudioFormat, AudioStreamer, ClientEvent, RealtimeConfig, RealtimeTranscriptionClient,
    StreamerConfig, StreamerStats, TranscriptAggregator,
};

/// Frames buffered between capture and the streaming bridge
const TALK_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("Streaming task failed: {0}")]
    Task(String),
}

/// Realtime config for talk turns: the streamer sends PCM16 at `sample_rate`
fn talk_config(settings: &ClientSettings) -> RealtimeConfig {
    let config = settings.realtime_config();
    if config.format != AudioFormat::Pcm {
        log::warn!(
            "VoiceClient: audio_format {} ignored, talk turns stream pcm",
            config.format.as_str()
        );
    }
    RealtimeConfig {
        format: AudioFormat::Pcm,
        ..config
    }
}

/// A running push-to-talk turn
pub struct LiveTalk {
    streamed: bool,
    streamer: JoinHandle<StreamerStats>,
}

impl LiveTalk {
    /// Whether the realtime connection was up when the turn started
    pub fn is_streaming(&self) -> bool {
        self.streamed
    }
}

/// Result of a finished turn
#[derive(Debug)]
pub struct TalkOutcome {
    pub audio: Option<CapturedAudio>,
    pub stream: StreamerStats,
}

/// All voice services for one client session
pub struct VoiceClient {
    settings: ClientSettings,
    unlocker: WarmupUnlocker,
    playback: PlaybackManager,
    transcription: RealtimeTranscriptionClient,
    capture: Arc<PushToTalkCapture>,
}

impl VoiceClient {
    pub fn new(
        settings: ClientSettings,
        factory: Arc<dyn AudioSinkFactory>,
        microphone: Arc<dyn MicrophoneSource>,
    ) -> Self {
        let unlocker = WarmupUnlocker::new(Arc::clone(&factory));
        let playback = PlaybackManager::new(factory, unlocker.clone(), settings.teardown_grace());
        let transcription = RealtimeTranscriptionClient::new(talk_config(&settings));
        let capture = Arc::new(PushToTalkCapture::new(microphone, settings.capture_config()));

        log::info!(
            "VoiceClient: ready (backend {}, language {})",
            settings.backend_url,
            settings.language
        );
        Self {
            settings,
            unlocker,
            playback,
            transcription,
            capture,
        }
    }

    /// Local cpal backend with the platform profile resolved from settings
    pub fn local(settings: ClientSettings) -> Result<Self, VoiceError> {
        let profile = PlatformProfile::resolve(
            settings.constrained_platform,
            settings.user_agent.as_deref(),
        );
        let factory = Arc::new(LocalSinkFactory::new(profile)?);
        Ok(Self::new(settings, factory, Arc::new(LocalMicrophone::new())))
    }

    /// Call synchronously from a user input handler.
    ///
    /// Unlocks audio before returning, then the future retries any playback
    /// that was deferred for want of a gesture.
    pub fn on_user_gesture(&self) -> BoxFuture<'static, Option<PlayOutcome>> {
        self.unlocker.unlock();
        let playback = self.playback.clone();
        async move { playback.retry_pending().await }.boxed()
    }

    /// Follow the active playback's clock. `None` when nothing is playing.
    pub fn karaoke_for_playback(&self, words: impl Into<WordTrack>) -> Option<KaraokeSession> {
        let clock = self.playback.clock()?;
        Some(KaraokeSync::observe(words, clock, self.settings.karaoke_enabled))
    }

    /// Follow live transcription words against elapsed time
    pub fn karaoke_live(&self, words: impl Into<WordTrack>) -> KaraokeSession {
        KaraokeSync::observe(words, SimulatedClock::start(), self.settings.karaoke_enabled)
    }

    /// Karaoke over the words of the realtime transcription. Every partial
    /// or final event that changes the words restarts the session on them.
    pub fn karaoke_for_transcription(&self) -> KaraokeSession {
        self.karaoke_for_events(self.transcription.subscribe())
    }

    fn karaoke_for_events(&self, mut events: broadcast::Receiver<ClientEvent>) -> KaraokeSession {
        let session = self.karaoke_live(WordTrack::empty());
        let feed = session.word_feed();
        tokio::spawn(async move {
            let mut aggregator = TranscriptAggregator::new();
            loop {
                let event = tokio::select! {
                    _ = feed.closed() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ClientEvent::Transcription(event)) => {
                        if aggregator.apply(&event) && !aggregator.words().is_empty() {
                            feed.replace_words(aggregator.word_track());
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("VoiceClient: karaoke missed {} transcription events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        session
    }

    /// Start recording and stream the microphone to the realtime backend.
    ///
    /// A failed connection does not stop the recording; the turn still
    /// produces a WAV payload.
    pub async fn start_talk(&self) -> Result<LiveTalk, VoiceError> {
        let streamed = self.transcription.connect().await;
        if !streamed {
            log::warn!("VoiceClient: realtime connection unavailable, recording only");
        }

        let (tx, rx) = mpsc::channel(TALK_CHANNEL_CAPACITY);
        let source_sample_rate = match self.capture.start_capture(Some(tx)).await {
            Ok(rate) => rate,
            Err(e) => {
                self.transcription.disconnect();
                return Err(e.into());
            }
        };

        let config = StreamerConfig {
            source_sample_rate,
            target_sample_rate: self.settings.sample_rate,
            ..StreamerConfig::default()
        };
        let streamer = AudioStreamer::new(self.transcription.clone(), rx, config);
        Ok(LiveTalk {
            streamed,
            streamer: tokio::spawn(streamer.run()),
        })
    }

    /// Stop recording, flush the stream and close the connection
    pub async fn finish_talk(&self, talk: LiveTalk) -> Result<TalkOutcome, VoiceError> {
        let captured = self.capture.stop_capture().await;
        // The forward channel closes with the capture; the streamer flushes and exits
        let stream = talk.streamer.await;
        self.transcription.disconnect();

        let stream = stream.map_err(|e| VoiceError::Task(e.to_string()))?;
        Ok(TalkOutcome {
            audio: captured?,
            stream,
        })
    }

    /// Abandon the turn without producing audio
    pub async fn cancel_talk(&self, talk: LiveTalk) {
        self.capture.cancel_capture().await;
        if let Err(e) = talk.streamer.await {
            log::warn!("VoiceClient: streaming task failed: {}", e);
        }
        self.transcription.disconnect();
    }

    /// Stop playback and capture, close the connection
    pub async fn shutdown(&self) {
        self.playback.teardown().await;
        self.capture.cancel_capture().await;
        self.transcription.disconnect();
        log::info!("VoiceClient: shut down");
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn unlocker(&self) -> &WarmupUnlocker {
        &self.unlocker
    }

    pub fn playback(&self) -> &PlaybackManager {
        &self.playback
    }

    pub fn transcription(&self) -> &RealtimeTranscriptionClient {
        &self.transcription
    }

    pub fn capture(&self) -> &PushToTalkCapture {
        &self.capture
    }
}
