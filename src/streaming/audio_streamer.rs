//! Audio streaming pipeline for real-time transcription
//!
//! Bridges microphone capture frames to the realtime client.
//! Receives PCM16 frames, downsamples, chunks, and queues them on the socket.
//!
//! # Architecture
//!
//! ```text
//! Capture task                     Tokio Runtime (async)
//! ┌─────────────────┐              ┌──────────────────────┐
//! │ PushToTalk      │──channel──▶  │ AudioStreamer::run() │
//! │ forward(frame)  │              │   ├─ downsample      │
//! └─────────────────┘              │   ├─ chunk (100ms)   │
//!                                  │   └─ send to WS      │
//!                                  └──────────────────────┘
//! ```

use tokio::sync::mpsc;

use super::realtime_client::RealtimeTranscriptionClient;
use super::StreamingError;

/// Anything that accepts encoded audio chunks
pub trait ChunkSink: Send + Sync {
    fn send_chunk(&self, bytes: Vec<u8>) -> Result<(), StreamingError>;
}

impl ChunkSink for RealtimeTranscriptionClient {
    fn send_chunk(&self, bytes: Vec<u8>) -> Result<(), StreamingError> {
        self.send_audio_chunk(bytes)
    }
}

/// Configuration for the audio streamer
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    /// Capture sample rate (typically 48000)
    pub source_sample_rate: u32,
    /// Rate announced in the config message
    pub target_sample_rate: u32,
    /// Chunk duration in milliseconds (100ms recommended)
    pub chunk_duration_ms: u32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            source_sample_rate: 48000,
            target_sample_rate: 16000,
            chunk_duration_ms: 100,
        }
    }
}

impl StreamerConfig {
    /// Calculate samples per chunk at target sample rate
    pub fn samples_per_chunk(&self) -> usize {
        (self.target_sample_rate * self.chunk_duration_ms / 1000).max(1) as usize
    }
}

/// Totals reported when the streaming loop ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamerStats {
    pub chunks_sent: u64,
    /// Chunks the socket refused (disconnected or reconnecting)
    pub chunks_dropped: u64,
    pub bytes_sent: u64,
}

/// Streams capture frames from a channel to a [`ChunkSink`]
pub struct AudioStreamer<S: ChunkSink> {
    config: StreamerConfig,
    rx: mpsc::Receiver<Vec<i16>>,
    sink: S,
    resampler: Resampler,
    /// Accumulator buffer for building 100ms chunks
    buffer: Vec<i16>,
    samples_per_chunk: usize,
    stats: StreamerStats,
}

impl<S: ChunkSink> AudioStreamer<S> {
    pub fn new(sink: S, rx: mpsc::Receiver<Vec<i16>>, config: StreamerConfig) -> Self {
        let samples_per_chunk = config.samples_per_chunk();
        log::info!(
            "AudioStreamer: initialized ({}Hz → {}Hz, {}ms chunks = {} samples)",
            config.source_sample_rate,
            config.target_sample_rate,
            config.chunk_duration_ms,
            samples_per_chunk
        );

        Self {
            resampler: Resampler::new(config.source_sample_rate, config.target_sample_rate),
            config,
            rx,
            sink,
            buffer: Vec::with_capacity(samples_per_chunk * 2),
            samples_per_chunk,
            stats: StreamerStats::default(),
        }
    }

    /// Run until the frame channel closes, then flush the final partial chunk.
    ///
    /// Send failures drop the chunk and keep going; the socket may be
    /// reconnecting.
    pub async fn run(mut self) -> StreamerStats {
        log::info!("AudioStreamer: starting streaming loop");

        while let Some(samples) = self.rx.recv().await {
            self.process_samples(&samples);
        }

        let tail = self.resampler.flush();
        self.buffer.extend(tail);
        while self.buffer.len() > self.samples_per_chunk {
            self.send_chunk();
        }
        if !self.buffer.is_empty() {
            log::debug!(
                "AudioStreamer: sending final partial chunk ({} samples)",
                self.buffer.len()
            );
            self.send_chunk();
        }

        log::info!(
            "AudioStreamer: streaming complete, {} chunks sent, {} dropped",
            self.stats.chunks_sent,
            self.stats.chunks_dropped
        );
        self.stats
    }

    fn process_samples(&mut self, samples: &[i16]) {
        let resampled = self.resampler.process(samples);
        self.buffer.extend(resampled);

        while self.buffer.len() >= self.samples_per_chunk {
            self.send_chunk();
        }
    }

    fn send_chunk(&mut self) {
        let chunk_size = self.buffer.len().min(self.samples_per_chunk);
        let bytes = encode_pcm16(&self.buffer[..chunk_size]);
        self.buffer.drain(..chunk_size);

        let len = bytes.len() as u64;
        match self.sink.send_chunk(bytes) {
            Ok(()) => {
                self.stats.chunks_sent += 1;
                self.stats.bytes_sent += len;
                // Periodic logging (every 50 chunks = ~5 seconds)
                if self.stats.chunks_sent % 50 == 0 {
                    log::debug!("AudioStreamer: sent {} chunks", self.stats.chunks_sent);
                }
            }
            Err(e) => {
                self.stats.chunks_dropped += 1;
                if self.stats.chunks_dropped == 1 {
                    log::warn!("AudioStreamer: dropping audio: {}", e);
                }
            }
        }
    }
}

/// PCM16 little-endian bytes
pub fn encode_pcm16(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Streaming sample-rate converter.
///
/// Integer down-ratios (48000 → 16000) average each group of input samples.
/// Any other ratio interpolates linearly. Phase carries across calls, so
/// feeding a signal in pieces yields the same output as feeding it whole.
#[derive(Debug, Clone)]
pub struct Resampler {
    mode: Mode,
    /// Integer mode: input not yet forming a full group
    pending: Vec<i16>,
    /// Interpolating mode: last input sample of the previous call
    previous: Option<i16>,
    /// Interpolating mode: next output position, in input samples from `previous`
    position: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Passthrough,
    Average(usize),
    Interpolate(f64),
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        let mode = if source_rate == 0 || target_rate == 0 {
            log::warn!(
                "Invalid sample rate (source: {}, target: {}), passing audio through",
                source_rate,
                target_rate
            );
            Mode::Passthrough
        } else if source_rate == target_rate {
            Mode::Passthrough
        } else if source_rate % target_rate == 0 {
            Mode::Average((source_rate / target_rate) as usize)
        } else {
            Mode::Interpolate(source_rate as f64 / target_rate as f64)
        };
        Self {
            mode,
            pending: Vec::new(),
            previous: None,
            position: 0.0,
        }
    }

    pub fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        match self.mode {
            Mode::Passthrough => samples.to_vec(),
            Mode::Average(ratio) => self.average(samples, ratio),
            Mode::Interpolate(step) => self.interpolate(samples, step),
        }
    }

    /// Output still owed for buffered input
    pub fn flush(&mut self) -> Vec<i16> {
        match self.mode {
            Mode::Average(_) if !self.pending.is_empty() => {
                let rest = std::mem::take(&mut self.pending);
                vec![mean(&rest)]
            }
            _ => Vec::new(),
        }
    }

    fn average(&mut self, samples: &[i16], ratio: usize) -> Vec<i16> {
        self.pending.extend_from_slice(samples);
        let whole = self.pending.len() / ratio * ratio;
        let out = self.pending[..whole].chunks(ratio).map(mean).collect();
        self.pending.drain(..whole);
        out
    }

    fn interpolate(&mut self, samples: &[i16], step: f64) -> Vec<i16> {
        let mut input = Vec::with_capacity(samples.len() + 1);
        input.extend(self.previous);
        input.extend_from_slice(samples);
        if input.len() < 2 {
            self.previous = input.last().copied();
            return Vec::new();
        }

        let mut out = Vec::with_capacity((samples.len() as f64 / step) as usize + 1);
        while self.position + 1.0 < input.len() as f64 {
            let index = self.position as usize;
            let frac = self.position - index as f64;
            let a = input[index] as f64;
            let b = input[index + 1] as f64;
            out.push((a + (b - a) * frac).round() as i16);
            self.position += step;
        }

        // The last sample becomes index 0 of the next call
        self.position -= (input.len() - 1) as f64;
        self.previous = input.last().copied();
        out
    }
}

fn mean(group: &[i16]) -> i16 {
    // i64 sum cannot overflow for any group length we see
    let sum: i64 = group.iter().map(|&s| s as i64).sum();
    (sum / group.len() as i64) as i16
}

/// One-shot conversion of a complete buffer.
///
/// Zero rates return the input unchanged.
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    let mut resampler = Resampler::new(source_rate, target_rate);
    let mut out = resampler.process(samples);
    out.extend(resampler.flush());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Collector {
        chunks: Arc<Mutex<Vec<Vec<u8>>>>,
        refuse: Arc<Mutex<bool>>,
    }

    impl ChunkSink for Collector {
        fn send_chunk(&self, bytes: Vec<u8>) -> Result<(), StreamingError> {
            if *self.refuse.lock().unwrap() {
                return Err(StreamingError::NotConnected);
            }
            self.chunks.lock().unwrap().push(bytes);
            Ok(())
        }
    }

    #[test]
    fn test_streamer_config_default() {
        let config = StreamerConfig::default();
        assert_eq!(config.source_sample_rate, 48000);
        assert_eq!(config.target_sample_rate, 16000);
        assert_eq!(config.chunk_duration_ms, 100);
    }

    #[test]
    fn test_samples_per_chunk() {
        let config = StreamerConfig::default();
        // 16000 Hz * 100ms / 1000 = 1600 samples
        assert_eq!(config.samples_per_chunk(), 1600);

        let config = StreamerConfig {
            target_sample_rate: 24000,
            chunk_duration_ms: 50,
            ..Default::default()
        };
        assert_eq!(config.samples_per_chunk(), 1200);
    }

    #[test]
    fn test_downsample_2x() {
        // 48kHz → 24kHz (2:1)
        let input = vec![100i16, 200, 300, 400, 500, 600];
        let output = downsample(&input, 48000, 24000);

        assert_eq!(output, vec![150, 350, 550]);
    }

    #[test]
    fn test_downsample_3x() {
        let input = vec![-300i16, 0, 300, 30, 60, 90];
        assert_eq!(downsample(&input, 48000, 16000), vec![0, 60]);
    }

    #[test]
    fn test_downsample_same_rate() {
        let input = vec![100i16, 200, 300];
        assert_eq!(downsample(&input, 24000, 24000), input);
    }

    #[test]
    fn test_downsample_non_integer_ratio_interpolates() {
        // 30kHz → 20kHz steps 1.5 input samples per output
        let input = vec![0i16, 1000, 2000, 3000];
        assert_eq!(downsample(&input, 30000, 20000), vec![0, 1500]);
    }

    #[test]
    fn test_downsample_44100_to_16000_length() {
        // 100ms at 44.1kHz becomes 100ms at 16kHz
        let input = vec![500i16; 4410];
        let output = downsample(&input, 44100, 16000);
        assert_eq!(output.len(), 1600);
        assert!(output.iter().all(|&s| s == 500));
    }

    #[test]
    fn test_resampler_is_continuous_across_calls() {
        let input: Vec<i16> = (0..4410).map(|i| ((i * 7) % 2000) as i16 - 1000).collect();
        let whole = downsample(&input, 44100, 16000);

        let mut resampler = Resampler::new(44100, 16000);
        let mut pieces = Vec::new();
        for chunk in input.chunks(441) {
            pieces.extend(resampler.process(chunk));
        }
        pieces.extend(resampler.flush());

        assert_eq!(pieces.len(), whole.len());
        let max_diff = pieces
            .iter()
            .zip(&whole)
            .map(|(a, b)| (*a as i32 - *b as i32).abs())
            .max()
            .unwrap();
        assert!(max_diff <= 1, "chunked output drifted by {}", max_diff);
    }

    #[test]
    fn test_resampler_holds_partial_groups() {
        let mut resampler = Resampler::new(48000, 16000);
        assert_eq!(resampler.process(&[3, 3]), Vec::<i16>::new());
        assert_eq!(resampler.process(&[3, 9, 9, 9, 6]), vec![3, 9]);
        assert_eq!(resampler.flush(), vec![6]);
    }

    #[tokio::test]
    async fn test_streams_44100_capture_at_target_rate() {
        let collector = Collector::default();
        let (tx, rx) = mpsc::channel::<Vec<i16>>(16);
        let config = StreamerConfig {
            source_sample_rate: 44100,
            target_sample_rate: 16000,
            chunk_duration_ms: 100,
        };
        let task = tokio::spawn(AudioStreamer::new(collector.clone(), rx, config).run());

        // One second of audio in 10ms frames
        for _ in 0..100 {
            tx.send(vec![0; 441]).await.unwrap();
        }
        drop(tx);

        let stats = task.await.unwrap();
        let samples: usize = collector.chunks.lock().unwrap().iter().map(|c| c.len() / 2).sum();
        assert!((15_999..=16_000).contains(&samples), "streamed {} samples", samples);
        assert_eq!(stats.chunks_sent, 10);
    }

    #[test]
    fn test_downsample_zero_rate() {
        let input = vec![100i16, 200, 300];
        assert_eq!(downsample(&input, 48000, 0), input);
        assert_eq!(downsample(&input, 0, 24000), input);
        assert_eq!(downsample(&input, 0, 0), input);
    }

    #[test]
    fn test_encode_pcm16_little_endian() {
        assert_eq!(encode_pcm16(&[1, -2]), vec![0x01, 0x00, 0xFE, 0xFF]);
    }

    #[tokio::test]
    async fn test_chunks_and_final_partial() {
        let collector = Collector::default();
        let (tx, rx) = mpsc::channel::<Vec<i16>>(10);
        let config = StreamerConfig {
            source_sample_rate: 16000,
            target_sample_rate: 16000,
            chunk_duration_ms: 100,
        };
        let streamer = AudioStreamer::new(collector.clone(), rx, config);
        let task = tokio::spawn(streamer.run());

        tx.send(vec![1; 1000]).await.unwrap();
        tx.send(vec![2; 1000]).await.unwrap();
        drop(tx);

        let stats = task.await.unwrap();
        assert_eq!(stats.chunks_sent, 2);
        assert_eq!(stats.bytes_sent, 4000);

        let chunks = collector.chunks.lock().unwrap();
        assert_eq!(chunks[0].len(), 3200);
        assert_eq!(chunks[1].len(), 800);
    }

    #[tokio::test]
    async fn test_refused_chunks_are_counted() {
        let collector = Collector::default();
        *collector.refuse.lock().unwrap() = true;
        let (tx, rx) = mpsc::channel::<Vec<i16>>(10);
        let streamer = AudioStreamer::new(collector.clone(), rx, StreamerConfig::default());
        let task = tokio::spawn(streamer.run());

        tx.send(vec![0; 4800]).await.unwrap();
        drop(tx);

        let stats = task.await.unwrap();
        assert_eq!(stats.chunks_sent, 0);
        assert_eq!(stats.chunks_dropped, 1);
        assert!(collector.chunks.lock().unwrap().is_empty());
    }
}
