//! Time sources for karaoke sync

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::platform::{AudioSink, SinkEvent};

/// One reading of a clock
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClockSample {
    pub elapsed: f64,
    pub duration: Option<f64>,
    /// Time is advancing
    pub running: bool,
    /// Reached the end of its material
    pub ended: bool,
    /// No further frames are needed until something changes
    pub finished: bool,
}

/// Monotonic elapsed time since a start instant, for words that have no
/// playable audio yet (live transcription).
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    started_at: Instant,
}

impl SimulatedClock {
    pub fn start() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Finished once elapsed reaches `span`, the end of the last word
    pub fn sample(&self, span: f64) -> ClockSample {
        let elapsed = self.elapsed();
        let ended = elapsed >= span;
        ClockSample {
            elapsed,
            duration: Some(span),
            running: !ended,
            ended,
            finished: ended,
        }
    }

    pub fn restart(&mut self) {
        self.started_at = Instant::now();
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::start()
    }
}

/// Reads position and state from a playing sink
pub struct PlaybackClock {
    sink: Arc<dyn AudioSink>,
    has_started: bool,
}

impl PlaybackClock {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            has_started: false,
        }
    }

    /// Finished when the sink ended, or paused after having played
    pub fn sample(&mut self) -> ClockSample {
        let paused = self.sink.is_paused();
        let ended = self.sink.is_ended();
        let running = !paused && !ended;
        if running {
            self.has_started = true;
        }
        ClockSample {
            elapsed: self.sink.current_time(),
            duration: self.sink.duration(),
            running,
            ended,
            finished: ended || (paused && self.has_started),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<SinkEvent> {
        self.sink.subscribe()
    }
}

impl std::fmt::Debug for PlaybackClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackClock")
            .field("sink", &self.sink.id())
            .field("has_started", &self.has_started)
            .finish()
    }
}

/// Exactly one clock drives a karaoke session
#[derive(Debug)]
pub enum ClockSource {
    RealAudio(PlaybackClock),
    Simulated(SimulatedClock),
}

impl ClockSource {
    pub fn simulated() -> Self {
        ClockSource::Simulated(SimulatedClock::start())
    }

    pub fn sample(&mut self, span: f64) -> ClockSample {
        match self {
            ClockSource::RealAudio(clock) => clock.sample(),
            ClockSource::Simulated(clock) => clock.sample(span),
        }
    }

    /// Start over for a new word sequence. Real audio cannot be rewound from
    /// here; it only forgets that it had started.
    pub fn restart(&mut self) {
        match self {
            ClockSource::RealAudio(clock) => clock.has_started = false,
            ClockSource::Simulated(clock) => clock.restart(),
        }
    }

    /// Sink events that can bring a finished real clock back to life
    pub fn wake_events(&self) -> Option<broadcast::Receiver<SinkEvent>> {
        match self {
            ClockSource::RealAudio(clock) => Some(clock.events()),
            ClockSource::Simulated(_) => None,
        }
    }
}

impl From<PlaybackClock> for ClockSource {
    fn from(clock: PlaybackClock) -> Self {
        ClockSource::RealAudio(clock)
    }
}

impl From<SimulatedClock> for ClockSource {
    fn from(clock: SimulatedClock) -> Self {
        ClockSource::Simulated(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::scripted::ScriptedPlatform;
    use crate::platform::{AudioSinkFactory, PlatformProfile};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn simulated_clock_finishes_at_span() {
        let clock = SimulatedClock::start();
        tokio::time::advance(Duration::from_millis(450)).await;
        let sample = clock.sample(0.6);
        assert!((sample.elapsed - 0.45).abs() < 1e-6);
        assert!(sample.running);
        assert!(!sample.finished);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(clock.sample(0.6).finished);
    }

    #[tokio::test]
    async fn playback_clock_only_finishes_after_starting() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        let sink = platform.create_sink().unwrap();
        sink.set_source("file:///a.wav");
        let mut clock = PlaybackClock::new(Arc::clone(&sink));

        // Loaded but not yet playing
        assert!(!clock.sample().finished);

        sink.play().await.unwrap();
        let sample = clock.sample();
        assert!(sample.running);

        sink.pause();
        assert!(clock.sample().finished);
    }

    #[tokio::test]
    async fn playback_clock_reports_end() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        let sink = platform.create_sink().unwrap();
        sink.set_source("file:///a.wav");
        sink.play().await.unwrap();

        let mut clock = PlaybackClock::new(Arc::clone(&sink));
        platform.sinks()[0].finish();
        let sample = clock.sample();
        assert!(sample.ended);
        assert!(sample.finished);
        assert_eq!(sample.elapsed, 1.0);
    }
}
