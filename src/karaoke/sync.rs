//! Per-frame karaoke update loop
//!
//! [`KaraokeTracker`] is the pure part: it turns clock samples into updates
//! and throttles them. [`KaraokeSync::observe`] runs it on a ~60 Hz ticker
//! and exposes the updates as a [`Stream`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::clock::{ClockSample, ClockSource};
use super::words::WordTrack;
use crate::platform::SinkEvent;

/// One display refresh at 60 Hz
pub const FRAME_INTERVAL: Duration = Duration::from_micros(16_667);

/// Elapsed-time movement that forces an update even without a word change
pub const ELAPSED_EPSILON_SECONDS: f64 = 0.03;

const UPDATE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KaraokeUpdate {
    pub word_index: Option<usize>,
    pub elapsed_seconds: f64,
    pub is_active: bool,
    pub progress_fraction: f64,
}

/// Maps clock samples onto a word track and decides when to emit
#[derive(Debug)]
pub struct KaraokeTracker {
    track: WordTrack,
    last: Option<KaraokeUpdate>,
}

impl KaraokeTracker {
    pub fn new(track: WordTrack) -> Self {
        Self { track, last: None }
    }

    pub fn track(&self) -> &WordTrack {
        &self.track
    }

    pub fn last(&self) -> Option<KaraokeUpdate> {
        self.last
    }

    /// Update for `sample`, or `None` when nothing moved enough to matter
    pub fn observe(&mut self, sample: &ClockSample) -> Option<KaraokeUpdate> {
        let update = self.compute(sample);
        let emit = match self.last {
            None => true,
            Some(last) => {
                last.word_index != update.word_index
                    || last.is_active != update.is_active
                    || (update.elapsed_seconds - last.elapsed_seconds).abs()
                        > ELAPSED_EPSILON_SECONDS
            }
        };
        if emit {
            self.last = Some(update);
            Some(update)
        } else {
            None
        }
    }

    /// Final update once the clock has finished; always emitted
    pub fn finish(&mut self, sample: &ClockSample) -> KaraokeUpdate {
        let mut update = self.compute(sample);
        update.is_active = false;
        if sample.ended {
            update.word_index = self.track.last_index();
            update.progress_fraction = 1.0;
        }
        self.last = Some(update);
        update
    }

    /// Swap in a new utterance. Returns the reset update when the content
    /// differs, `None` when it is the same words.
    pub fn replace_words(&mut self, track: WordTrack) -> Option<KaraokeUpdate> {
        if track.same_content(&self.track) {
            return None;
        }
        self.track = track;
        let reset = KaraokeUpdate::default();
        self.last = Some(reset);
        Some(reset)
    }

    /// Inactive update that keeps the current position
    pub fn deactivate(&mut self) -> KaraokeUpdate {
        let update = KaraokeUpdate {
            is_active: false,
            ..self.last.unwrap_or_default()
        };
        self.last = Some(update);
        update
    }

    fn compute(&self, sample: &ClockSample) -> KaraokeUpdate {
        let total = sample
            .duration
            .filter(|d| *d > 0.0)
            .unwrap_or_else(|| self.track.span());
        let progress_fraction = if total > 0.0 {
            (sample.elapsed / total).clamp(0.0, 1.0)
        } else {
            0.0
        };
        KaraokeUpdate {
            word_index: self.track.index_at(sample.elapsed),
            elapsed_seconds: sample.elapsed,
            is_active: sample.running,
            progress_fraction,
        }
    }
}

/// Entry point for karaoke sessions
pub struct KaraokeSync;

impl KaraokeSync {
    /// Start following `clock` over `words`. Must be called inside a tokio runtime.
    pub fn observe(
        words: impl Into<WordTrack>,
        clock: impl Into<ClockSource>,
        enabled: bool,
    ) -> KaraokeSession {
        let (words_tx, words_rx) = watch::channel(words.into());
        let (enabled_tx, enabled_rx) = watch::channel(enabled);
        let (updates_tx, updates) = mpsc::channel(UPDATE_CAPACITY);

        let task = tokio::spawn(run_frames(clock.into(), words_rx, enabled_rx, updates_tx));

        KaraokeSession {
            updates,
            words: Arc::new(words_tx),
            enabled: enabled_tx,
            task,
        }
    }
}

/// Stream of karaoke updates. Dropping it stops the frame loop.
pub struct KaraokeSession {
    updates: mpsc::Receiver<KaraokeUpdate>,
    words: Arc<watch::Sender<WordTrack>>,
    enabled: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl KaraokeSession {
    /// Switch to a new word sequence. Identical content is ignored.
    pub fn replace_words(&self, words: impl Into<WordTrack>) {
        replace_track(&self.words, words.into());
    }

    /// Handle for replacing words from another task
    pub fn word_feed(&self) -> WordFeed {
        WordFeed {
            words: Arc::clone(&self.words),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.send_if_modified(|current| {
            let changed = *current != enabled;
            *current = enabled;
            changed
        });
    }

    pub async fn next_update(&mut self) -> Option<KaraokeUpdate> {
        self.updates.recv().await
    }
}

/// Replaces the words of a running session
#[derive(Clone)]
pub struct WordFeed {
    words: Arc<watch::Sender<WordTrack>>,
}

impl WordFeed {
    pub fn replace_words(&self, words: impl Into<WordTrack>) {
        replace_track(&self.words, words.into());
    }

    /// Resolves once the session's frame loop has stopped
    pub async fn closed(&self) {
        self.words.closed().await
    }
}

fn replace_track(words: &watch::Sender<WordTrack>, track: WordTrack) {
    words.send_if_modified(|current| {
        if current.same_content(&track) {
            false
        } else {
            *current = track;
            true
        }
    });
}

impl Stream for KaraokeSession {
    type Item = KaraokeUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_recv(cx)
    }
}

impl Drop for KaraokeSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_frames(
    mut clock: ClockSource,
    mut words: watch::Receiver<WordTrack>,
    mut enabled: watch::Receiver<bool>,
    updates: mpsc::Sender<KaraokeUpdate>,
) {
    let mut tracker = KaraokeTracker::new(words.borrow_and_update().clone());
    let mut wake = clock.wake_events();
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut finished = false;

    loop {
        let running = *enabled.borrow() && !finished && !tracker.track().is_empty();

        let update = if running {
            tokio::select! {
                _ = ticker.tick() => {
                    let sample = clock.sample(tracker.track().span());
                    if sample.finished {
                        finished = true;
                        forget_stale_wakes(&mut wake);
                        log::debug!("KaraokeSync: clock finished at {:.3}s", sample.elapsed);
                        Some(tracker.finish(&sample))
                    } else {
                        tracker.observe(&sample)
                    }
                }
                changed = words.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    on_words_changed(&mut words, &mut tracker, &mut clock, &mut finished)
                }
                changed = enabled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    on_enabled_changed(&mut enabled, &mut tracker, &mut finished)
                }
            }
        } else {
            tokio::select! {
                _ = updates.closed() => break,
                changed = words.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    on_words_changed(&mut words, &mut tracker, &mut clock, &mut finished)
                }
                changed = enabled.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    on_enabled_changed(&mut enabled, &mut tracker, &mut finished)
                }
                _ = next_play(&mut wake) => {
                    log::debug!("KaraokeSync: playback resumed");
                    finished = false;
                    None
                }
            }
        };

        if let Some(update) = update {
            if updates.send(update).await.is_err() {
                break;
            }
        }
    }
    log::debug!("KaraokeSync: frame loop stopped");
}

fn on_words_changed(
    words: &mut watch::Receiver<WordTrack>,
    tracker: &mut KaraokeTracker,
    clock: &mut ClockSource,
    finished: &mut bool,
) -> Option<KaraokeUpdate> {
    let track = words.borrow_and_update().clone();
    let reset = tracker.replace_words(track)?;
    log::debug!(
        "KaraokeSync: new utterance with {} words",
        tracker.track().len()
    );
    clock.restart();
    *finished = false;
    Some(reset)
}

fn on_enabled_changed(
    enabled: &mut watch::Receiver<bool>,
    tracker: &mut KaraokeTracker,
    finished: &mut bool,
) -> Option<KaraokeUpdate> {
    if *enabled.borrow_and_update() {
        *finished = false;
        None
    } else {
        Some(tracker.deactivate())
    }
}

/// Events already queued describe the run that just finished
fn forget_stale_wakes(wake: &mut Option<broadcast::Receiver<SinkEvent>>) {
    if let Some(rx) = wake.as_mut() {
        *rx = rx.resubscribe();
    }
}

/// Resolves when the sink starts playing again; never for simulated clocks
async fn next_play(wake: &mut Option<broadcast::Receiver<SinkEvent>>) {
    let Some(rx) = wake.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(SinkEvent::Playing) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    *wake = None;
    std::future::pending().await
}
