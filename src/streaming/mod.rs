//! Streaming transcription module for real-time speech-to-text
//!
//! WebSocket client for the realtime transcription backend, with the audio
//! bridge that feeds it and an aggregator for the events it returns.
//!
//! # Architecture
//!
//! ```text
//! Capture frames (48kHz) ──▶ AudioStreamer ──▶ downsample (16kHz) ──▶ PCM16 chunks
//!                                                                        │
//!                                                                        ▼
//!                                                        RealtimeTranscriptionClient
//!                                                               (WebSocket)
//!                                                                        │
//!                                                                        ▼
//!                                                  ClientEvent ──▶ TranscriptAggregator
//! ```
//!
//! # Reconnection
//!
//! - Unexpected closes reconnect with bounded exponential backoff (5 attempts)
//! - The counter resets once the server answers on a new connection
//! - `disconnect()` suppresses reconnection until the next `connect()`

pub mod audio_streamer;
pub mod protocol;
pub mod realtime_client;
pub mod reconnect;
pub mod transcript_aggregator;

pub use audio_streamer::{
    downsample, encode_pcm16, AudioStreamer, ChunkSink, Resampler, StreamerConfig, StreamerStats,
};
pub use protocol::{websocket_url, AudioFormat, ClientMessage, EventStatus, SessionStats, TranscriptionEvent};
pub use realtime_client::{
    ClientEvent, ConnectionState, RealtimeConfig, RealtimeTranscriptionClient, TranscriptionSession,
};
pub use reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
pub use transcript_aggregator::TranscriptAggregator;

/// Errors that can occur during streaming transcription
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamingError {
    #[error("Not connected to the transcription service")]
    NotConnected,
    #[error("Failed to connect to transcription service: {0}")]
    ConnectionFailed(String),
    #[error("WebSocket protocol error: {0}")]
    ProtocolError(String),
    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),
    #[error("Failed to send audio: {0}")]
    SendFailed(String),
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}
