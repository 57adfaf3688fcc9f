//! Push-to-talk microphone capture
//!
//! A [`MicrophoneSource`] yields mono PCM16 frames; [`PushToTalkCapture`]
//! records them between `start_capture` and `stop_capture`, drives a live
//! spectrum for level meters, optionally forwards frames to the streaming
//! bridge, and hands back one WAV payload per capture.
//!
//! ```text
//! MicrophoneSource ──frames──▶ collector task ──▶ buffer ──▶ WAV (stop)
//!                                   │  │
//!                                   │  └──▶ forward (AudioStreamer)
//!                                   └─────▶ spectrum emitter ──▶ watch
//! ```

pub mod push_to_talk;
pub mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

pub use push_to_talk::PushToTalkCapture;
pub use scripted::ScriptedMicrophone;

/// Errors surfaced by capture
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("Microphone unavailable: {0}")]
    Microphone(String),
    #[error("A capture is already in progress")]
    AlreadyCapturing,
    #[error("Failed to encode capture: {0}")]
    Encode(String),
    #[error("Capture task failed: {0}")]
    TaskFailed(String),
}

/// An open microphone. Dropping it (or calling [`MicrophoneStream::close`])
/// releases the device.
pub struct MicrophoneStream {
    pub sample_rate: u32,
    pub frames: mpsc::Receiver<Vec<i16>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MicrophoneStream {
    pub fn new(
        sample_rate: u32,
        frames: mpsc::Receiver<Vec<i16>>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            sample_rate,
            frames,
            release: Some(Box::new(release)),
        }
    }

    pub fn close(mut self) {
        self.release_device();
    }

    fn release_device(&mut self) {
        self.frames.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.release_device();
    }
}

/// Microphone boundary
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Open the device and start delivering mono PCM16 frames
    async fn open(&self) -> Result<MicrophoneStream, CaptureError>;
}

/// Capture limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Payloads smaller than this are discarded
    pub min_bytes: usize,
    /// Captures shorter than this are discarded
    pub min_duration: Duration,
    /// Audio after this point is ignored
    pub max_duration: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_bytes: 1024,
            min_duration: Duration::from_millis(500),
            max_duration: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Recording,
    Processing,
}

/// One finished capture
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAudio {
    /// Complete WAV file
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub duration: Duration,
    pub sample_rate: u32,
    pub captured_at: DateTime<Utc>,
}

impl CapturedAudio {
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }
}

/// Broadcast to capture subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Started { sample_rate: u32 },
    MaxDurationReached,
    Completed(CapturedAudio),
    /// Too short or too small to be worth sending
    Discarded { bytes: usize, duration: Duration },
    Cancelled,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_limits() {
        let config = CaptureConfig::default();
        assert_eq!(config.min_bytes, 1024);
        assert_eq!(config.min_duration, Duration::from_millis(500));
        assert_eq!(config.max_duration, Duration::from_secs(120));
    }

    #[test]
    fn test_stream_releases_once() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let (_tx, rx) = mpsc::channel(1);
        let stream = MicrophoneStream::new(16000, rx, move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        stream.close();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_data_uri() {
        let audio = CapturedAudio {
            bytes: vec![1, 2, 3],
            mime_type: "audio/wav".to_string(),
            duration: Duration::from_secs(1),
            sample_rate: 16000,
            captured_at: Utc::now(),
        };
        assert_eq!(audio.to_base64(), "AQID");
        assert_eq!(audio.data_uri(), "data:audio/wav;base64,AQID");
    }
}
