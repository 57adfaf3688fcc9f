//! Realtime transcription wire protocol
//!
//! # Protocol Overview
//!
//! 1. Connect to `<backend>/functions/v1/realtime-stt` over `ws://` or `wss://`
//! 2. Send a `config` message (language, sample rate, audio format)
//! 3. Stream audio as binary frames
//! 4. Receive status events (`listening`, `speech_start`, `partial`, `final`, ...)
//! 5. Send `end`; the server answers with an `end` event carrying session stats

use serde::{Deserialize, Serialize};

use crate::karaoke::WordTiming;

/// Path of the realtime endpoint below the backend base URL
pub const REALTIME_PATH: &str = "functions/v1/realtime-stt";

/// Encoding of the binary audio frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Webm,
    Opus,
    /// Raw PCM16 little-endian, as produced by `AudioStreamer`
    #[default]
    Pcm,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Webm => "webm",
            AudioFormat::Opus => "opus",
            AudioFormat::Pcm => "pcm",
        }
    }
}

// ============================================================================
// Client Messages (sent TO the server)
// ============================================================================

/// Text messages sent from client to server. Audio goes as binary frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Session configuration, sent once the socket opens
    Config {
        language: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        format: AudioFormat,
    },
    /// End of input; the server finalizes and closes
    End,
}

impl ClientMessage {
    pub fn config(language: &str, sample_rate: u32, format: AudioFormat) -> Self {
        Self::Config {
            language: language.to_string(),
            sample_rate,
            format,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Server Messages (received FROM the server)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Listening,
    SpeechStart,
    Partial,
    Final,
    Configured,
    End,
    Error,
    /// Catch-all for statuses we don't handle
    #[serde(other)]
    Unknown,
}

/// Totals reported with the `end` event
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub total_audio_bytes: u64,
    #[serde(default)]
    pub total_transcriptions: u64,
}

/// One server event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionEvent {
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordTiming>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<SessionStats>,
}

impl TranscriptionEvent {
    /// Bare event with only a status, for building test fixtures
    pub fn with_status(status: EventStatus) -> Self {
        Self {
            status,
            text: None,
            words: None,
            confidence: None,
            timestamp: None,
            session_id: None,
            error: None,
            stats: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_error(&self) -> bool {
        self.status == EventStatus::Error
    }

    /// Error text, defaulting when the server sent none
    pub fn error_message(&self) -> Option<&str> {
        if self.is_error() {
            Some(self.error.as_deref().unwrap_or("Unknown error"))
        } else {
            None
        }
    }

    /// Partial or final transcript
    pub fn is_transcript(&self) -> bool {
        matches!(self.status, EventStatus::Partial | EventStatus::Final)
    }
}

/// Derive the websocket endpoint from the backend base URL.
/// `http` becomes `ws` and `https` becomes `wss`.
pub fn websocket_url(backend_url: &str) -> String {
    let mut url = if let Some(rest) = backend_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = backend_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        backend_url.to_string()
    };
    if !url.ends_with('/') {
        url.push('/');
    }
    url.push_str(REALTIME_PATH);
    url
}
