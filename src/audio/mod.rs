//! Local audio backend
//!
//! CPAL output sinks and microphone input, hound WAV encoding, source
//! fetching, and the spectrum analyser shared by playback and capture.

pub mod player;
pub mod recorder;
pub mod source;
pub mod spectrum;
pub mod wav;

pub use player::{LocalAnalysisGraph, LocalSink, LocalSinkFactory};
pub use recorder::LocalMicrophone;
pub use source::{SourceError, SourceLoader, SourceLocation};
pub use spectrum::{run_spectrum_emitter, SpectrumAnalyser, BIN_COUNT};
pub use wav::{decode_wav, encode_wav, silent_wav_data_uri, DecodedAudio};
