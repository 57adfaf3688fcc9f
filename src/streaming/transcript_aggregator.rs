//! Transcript aggregation for real-time streaming
//!
//! Folds server events into the state a caller displays while the user
//! speaks.
//!
//! # Aggregation Strategy
//!
//! - **Partial**: replaces the current text and words (the server resends
//!   the whole utterance each time)
//! - **Final**: replaces text and words and marks the utterance complete
//! - Events without text or words leave the previous values in place

use super::protocol::{EventStatus, SessionStats, TranscriptionEvent};
use crate::karaoke::{WordTiming, WordTrack};

/// Latest transcript, word timings and speech activity for one session
#[derive(Debug, Clone, Default)]
pub struct TranscriptAggregator {
    text: String,
    words: Vec<WordTiming>,
    is_transcribing: bool,
    is_final: bool,
    error: Option<String>,
    session_id: Option<String>,
    stats: Option<SessionStats>,
    partial_count: u64,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event. Returns `true` when text or words changed.
    pub fn apply(&mut self, event: &TranscriptionEvent) -> bool {
        if self.session_id.is_none() {
            self.session_id = event.session_id.clone();
        }

        match event.status {
            EventStatus::Listening => {
                self.is_transcribing = false;
                false
            }
            EventStatus::SpeechStart => {
                self.is_transcribing = true;
                self.is_final = false;
                false
            }
            EventStatus::Partial => {
                self.partial_count += 1;
                if self.partial_count % 10 == 0 {
                    log::debug!(
                        "TranscriptAggregator: {} partials, {} chars",
                        self.partial_count,
                        self.text.len()
                    );
                }
                self.is_final = false;
                self.take_content(event)
            }
            EventStatus::Final => {
                let changed = self.take_content(event);
                self.is_transcribing = false;
                self.is_final = true;
                log::info!(
                    "TranscriptAggregator: final with {} chars, {} words (after {} partials)",
                    self.text.len(),
                    self.words.len(),
                    self.partial_count
                );
                changed
            }
            EventStatus::End => {
                self.stats = event.stats;
                self.is_transcribing = false;
                false
            }
            EventStatus::Error => {
                self.error = event.error_message().map(str::to_string);
                false
            }
            EventStatus::Configured | EventStatus::Unknown => false,
        }
    }

    fn take_content(&mut self, event: &TranscriptionEvent) -> bool {
        let mut changed = false;
        if let Some(text) = event.text.as_deref() {
            if text != self.text {
                self.text = text.to_string();
                changed = true;
            }
        }
        if let Some(words) = event.words.as_ref() {
            if *words != self.words {
                self.words = words.clone();
                changed = true;
            }
        }
        changed
    }

    /// Best available text (final if received, otherwise latest partial)
    pub fn current_text(&self) -> &str {
        &self.text
    }

    pub fn words(&self) -> &[WordTiming] {
        &self.words
    }

    /// Current words as a karaoke track
    pub fn word_track(&self) -> WordTrack {
        WordTrack::new(self.words.clone())
    }

    pub fn has_text(&self) -> bool {
        !self.text.is_empty()
    }

    pub fn is_transcribing(&self) -> bool {
        self.is_transcribing
    }

    pub fn is_complete(&self) -> bool {
        self.is_final
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn stats(&self) -> Option<&SessionStats> {
        self.stats.as_ref()
    }

    /// Clear the error after a successful reconnect
    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Reset for a new session
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(json: &str) -> TranscriptionEvent {
        TranscriptionEvent::parse(json).unwrap()
    }

    #[test]
    fn test_new_aggregator_is_empty() {
        let agg = TranscriptAggregator::new();
        assert_eq!(agg.current_text(), "");
        assert!(!agg.has_text());
        assert!(!agg.is_transcribing());
        assert!(!agg.is_complete());
    }

    #[test]
    fn test_speech_activity_flags() {
        let mut agg = TranscriptAggregator::new();
        agg.apply(&event(r#"{"status":"speech_start"}"#));
        assert!(agg.is_transcribing());
        agg.apply(&event(r#"{"status":"listening"}"#));
        assert!(!agg.is_transcribing());
    }

    #[test]
    fn test_partial_then_final() {
        let mut agg = TranscriptAggregator::new();
        agg.apply(&event(r#"{"status":"speech_start","sessionId":"s1"}"#));

        let changed = agg.apply(&event(
            r#"{"status":"partial","text":"Hi","words":[{"word":"Hi","start":0.0,"end":0.3}]}"#,
        ));
        assert!(changed);
        assert_eq!(agg.current_text(), "Hi");
        assert_eq!(agg.words().len(), 1);
        assert!(agg.is_transcribing());

        agg.apply(&event(
            r#"{"status":"final","text":"Hi there","words":[{"word":"Hi","start":0.0,"end":0.3},{"word":"there","start":0.3,"end":0.6}]}"#,
        ));
        assert_eq!(agg.current_text(), "Hi there");
        assert_eq!(agg.word_track().len(), 2);
        assert!(agg.is_complete());
        assert!(!agg.is_transcribing());
        assert_eq!(agg.session_id(), Some("s1"));
    }

    #[test]
    fn test_partial_without_text_keeps_previous() {
        let mut agg = TranscriptAggregator::new();
        agg.apply(&event(r#"{"status":"partial","text":"hello"}"#));
        let changed = agg.apply(&event(r#"{"status":"partial"}"#));
        assert!(!changed);
        assert_eq!(agg.current_text(), "hello");
    }

    #[test]
    fn test_error_and_stats() {
        let mut agg = TranscriptAggregator::new();
        agg.apply(&event(r#"{"status":"error"}"#));
        assert_eq!(agg.error(), Some("Unknown error"));
        agg.clear_error();
        assert_eq!(agg.error(), None);

        agg.apply(&event(
            r#"{"status":"end","stats":{"duration":2.0,"totalAudioBytes":64000,"totalTranscriptions":1}}"#,
        ));
        assert_eq!(agg.stats().map(|s| s.total_transcriptions), Some(1));
    }

    #[test]
    fn test_reset() {
        let mut agg = TranscriptAggregator::new();
        agg.apply(&event(r#"{"status":"final","text":"done","sessionId":"a"}"#));
        agg.reset();
        assert!(!agg.has_text());
        assert_eq!(agg.session_id(), None);
        assert!(!agg.is_complete());
    }
}
