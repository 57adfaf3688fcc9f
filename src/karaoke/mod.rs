//! Word-level karaoke synchronization
//!
//! Maps a clock (a playing sink, or simulated time for live transcription)
//! onto word timings and reports the word being spoken.

pub mod clock;
pub mod sync;
pub mod words;

pub use clock::{ClockSample, ClockSource, PlaybackClock, SimulatedClock};
pub use sync::{KaraokeSession, KaraokeSync, KaraokeTracker, KaraokeUpdate, WordFeed};
pub use words::{find_word_index, validate_timings, TimingError, WordTiming, WordTrack};
