//! Word timings and the time -> word lookup

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Sequences up to this length are scanned linearly
pub const LINEAR_SEARCH_LIMIT: usize = 64;

/// One spoken word with its position in the audio, in seconds.
/// Wire form: `{"word": "...", "start": 0.0, "end": 0.3}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    #[serde(rename = "word", alias = "text")]
    pub text: String,
    #[serde(rename = "start")]
    pub start_seconds: f64,
    #[serde(rename = "end")]
    pub end_seconds: f64,
}

impl WordTiming {
    pub fn new(text: impl Into<String>, start_seconds: f64, end_seconds: f64) -> Self {
        Self {
            text: text.into(),
            start_seconds,
            end_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TimingError {
    #[error("word {index} ({text:?}) ends before it starts")]
    Inverted { index: usize, text: String },
    #[error("word {index} ({text:?}) starts before the previous word ends")]
    Overlapping { index: usize, text: String },
    #[error("word {index} has a non-finite timestamp")]
    NotFinite { index: usize },
}

/// Check that timings are finite, ascending and non-overlapping
pub fn validate_timings(words: &[WordTiming]) -> Result<(), TimingError> {
    let mut previous_end = f64::NEG_INFINITY;
    for (index, word) in words.iter().enumerate() {
        if !word.start_seconds.is_finite() || !word.end_seconds.is_finite() {
            return Err(TimingError::NotFinite { index });
        }
        if word.start_seconds > word.end_seconds {
            return Err(TimingError::Inverted {
                index,
                text: word.text.clone(),
            });
        }
        if word.start_seconds < previous_end {
            return Err(TimingError::Overlapping {
                index,
                text: word.text.clone(),
            });
        }
        previous_end = word.end_seconds;
    }
    Ok(())
}

/// Content hash of a word sequence. Two sequences with equal text and
/// timings hash equally regardless of where they live in memory.
pub fn fingerprint(words: &[WordTiming]) -> u64 {
    let mut hasher = DefaultHasher::new();
    words.len().hash(&mut hasher);
    for word in words {
        word.text.hash(&mut hasher);
        word.start_seconds.to_bits().hash(&mut hasher);
        word.end_seconds.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// Index of the word being spoken at `seconds`.
///
/// Inside a word: that word. In a gap: the word before the gap. Before the
/// first word: `None`. After the last word: the last index.
pub fn find_word_index(words: &[WordTiming], seconds: f64) -> Option<usize> {
    if words.is_empty() || seconds.is_nan() {
        return None;
    }
    if words.len() <= LINEAR_SEARCH_LIMIT {
        find_linear(words, seconds)
    } else {
        find_binary(words, seconds)
    }
}

fn find_linear(words: &[WordTiming], seconds: f64) -> Option<usize> {
    let mut result = None;
    for (index, word) in words.iter().enumerate() {
        if seconds < word.start_seconds {
            break;
        }
        result = Some(index);
        if seconds <= word.end_seconds {
            break;
        }
    }
    result
}

fn find_binary(words: &[WordTiming], seconds: f64) -> Option<usize> {
    // First word that has not ended yet
    let index = words.partition_point(|w| w.end_seconds < seconds);
    if index < words.len() && words[index].start_seconds <= seconds {
        return Some(index);
    }
    index.checked_sub(1)
}

/// Immutable word sequence for one utterance, with its cached fingerprint
#[derive(Debug, Clone)]
pub struct WordTrack {
    words: Arc<[WordTiming]>,
    fingerprint: u64,
}

impl WordTrack {
    pub fn new(words: Vec<WordTiming>) -> Self {
        let fingerprint = fingerprint(&words);
        Self {
            words: words.into(),
            fingerprint,
        }
    }

    pub fn validated(words: Vec<WordTiming>) -> Result<Self, TimingError> {
        validate_timings(&words)?;
        Ok(Self::new(words))
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn words(&self) -> &[WordTiming] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// End of the last word, zero when empty
    pub fn span(&self) -> f64 {
        self.words.last().map(|w| w.end_seconds).unwrap_or(0.0)
    }

    pub fn last_index(&self) -> Option<usize> {
        self.words.len().checked_sub(1)
    }

    pub fn index_at(&self, seconds: f64) -> Option<usize> {
        find_word_index(&self.words, seconds)
    }

    pub fn same_content(&self, other: &WordTrack) -> bool {
        self.fingerprint == other.fingerprint && self.words.len() == other.words.len()
    }
}

impl From<Vec<WordTiming>> for WordTrack {
    fn from(words: Vec<WordTiming>) -> Self {
        Self::new(words)
    }
}
