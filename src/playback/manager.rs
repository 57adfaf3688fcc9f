//! Playback manager
//!
//! Owns the single active playback. Every transition is driven through the
//! reducer in [`super::state`] while holding the slot lock, so the release of
//! a previous playback is complete before the next one begins. Play futures
//! are awaited outside the lock and re-validated against the playback id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::state::{reduce, Effect, Event, PlaybackId, State};
use super::warmup::WarmupUnlocker;
use super::{PlaybackNotice, PlaybackProgress, PlaybackRequest, PlaybackStatus};
use crate::karaoke::PlaybackClock;
use crate::platform::{
    AnalysisGraph, AudioSink, AudioSinkFactory, PlayError, PlayFuture, SinkError, SinkEvent,
};
use crate::util::lock;

/// Delay after closing an analysis context before new audio is set up
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_millis(50);

const NOTICE_CAPACITY: usize = 64;

/// How a `play()` call ended. Failures are reported here and as notices;
/// they are never returned as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayOutcome {
    Started,
    /// Refused for lack of a gesture; kept as the pending request
    Deferred,
    Failed(PlayError),
    /// Superseded by a newer `play()` or stopped before it started
    Cancelled,
}

/// Sink held by the active playback
enum SinkLease {
    /// Fresh sink for this request only
    Dedicated {
        sink: Arc<dyn AudioSink>,
        graph: Option<Arc<dyn AnalysisGraph>>,
    },
    /// Shared sink from the warm-up unlocker; never analysed
    Warmed(Arc<dyn AudioSink>),
}

impl SinkLease {
    fn sink(&self) -> &Arc<dyn AudioSink> {
        match self {
            SinkLease::Dedicated { sink, .. } | SinkLease::Warmed(sink) => sink,
        }
    }

    fn graph(&self) -> Option<&Arc<dyn AnalysisGraph>> {
        match self {
            SinkLease::Dedicated { graph, .. } => graph.as_ref(),
            SinkLease::Warmed(_) => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SinkLease::Dedicated { .. } => "dedicated",
            SinkLease::Warmed(_) => "warmed",
        }
    }
}

struct ActivePlayback {
    playback_id: PlaybackId,
    request: PlaybackRequest,
    lease: SinkLease,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slot {
    state: State,
    active: Option<ActivePlayback>,
    pending: Option<PlaybackRequest>,
}

impl Slot {
    fn active_for(&self, playback_id: PlaybackId) -> Option<&ActivePlayback> {
        self.active
            .as_ref()
            .filter(|a| a.playback_id == playback_id)
    }
}

/// Read-only view of the active sink for synchronous accessors
#[derive(Clone)]
struct Tap {
    sink: Arc<dyn AudioSink>,
    graph: Option<Arc<dyn AnalysisGraph>>,
}

struct Shared {
    factory: Arc<dyn AudioSinkFactory>,
    unlocker: WarmupUnlocker,
    slot: tokio::sync::Mutex<Slot>,
    tap: Mutex<Option<Tap>>,
    status: watch::Sender<PlaybackStatus>,
    notices: broadcast::Sender<PlaybackNotice>,
    next_id: AtomicU64,
    /// Id of the most recent `play()` call
    latest: AtomicU64,
    grace: Duration,
}

/// Single source of truth for what is playing now
#[derive(Clone)]
pub struct PlaybackManager {
    shared: Arc<Shared>,
}

impl PlaybackManager {
    pub fn new(
        factory: Arc<dyn AudioSinkFactory>,
        unlocker: WarmupUnlocker,
        teardown_grace: Duration,
    ) -> Self {
        let (status, _) = watch::channel(PlaybackStatus::Idle);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                factory,
                unlocker,
                slot: tokio::sync::Mutex::new(Slot::default()),
                tap: Mutex::new(None),
                status,
                notices,
                next_id: AtomicU64::new(1),
                latest: AtomicU64::new(0),
                grace: teardown_grace,
            }),
        }
    }

    /// Stop whatever is playing and play `request`.
    pub async fn play(&self, request: PlaybackRequest) -> PlayOutcome {
        let shared = &self.shared;
        let playback_id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        shared.latest.store(playback_id, Ordering::SeqCst);

        let (play, cancel) = {
            let mut slot = shared.slot.lock().await;
            if shared.is_superseded(playback_id) {
                log::debug!(
                    "PlaybackManager: request {} superseded before start",
                    request.id
                );
                return PlayOutcome::Cancelled;
            }

            shared.apply(&mut slot, Event::Stop).await;
            if shared.is_superseded(playback_id) {
                return PlayOutcome::Cancelled;
            }
            // A newer request supersedes whatever was waiting for a gesture
            if let Some(pending) = slot.pending.take() {
                log::debug!(
                    "PlaybackManager: pending request {} superseded by {}",
                    pending.id,
                    request.id
                );
            }

            let lease = match shared.lease_sink() {
                Ok(lease) => lease,
                Err(e) => {
                    let error = PlayError::Load(e.to_string());
                    log::warn!(
                        "PlaybackManager: no sink for request {}: {}",
                        request.id,
                        e
                    );
                    shared.notify(PlaybackNotice::Failed {
                        request,
                        error: error.clone(),
                    });
                    return PlayOutcome::Failed(error);
                }
            };

            log::info!(
                "PlaybackManager: playing request {} ({}) on {} sink {}",
                request.id,
                request.origin_tag,
                lease.kind(),
                lease.sink().id()
            );

            // Subscribe before loading so Ready is not missed
            let events = lease.sink().subscribe();
            lease.sink().set_source(&request.source_url);
            let play = lease.sink().play();

            let cancel = CancellationToken::new();
            *lock(&shared.tap) = Some(Tap {
                sink: Arc::clone(lease.sink()),
                graph: lease.graph().cloned(),
            });
            tokio::spawn(watch_sink(
                Arc::downgrade(shared),
                events,
                playback_id,
                request.id.clone(),
                cancel.clone(),
            ));
            slot.active = Some(ActivePlayback {
                playback_id,
                request,
                lease,
                cancel: cancel.clone(),
            });
            shared.apply(&mut slot, Event::Begin { playback_id }).await;
            (play, cancel)
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return PlayOutcome::Cancelled,
            result = play => result,
        };
        shared.settle(playback_id, result, false).await
    }

    /// Replay the request deferred by a gesture rejection, if any.
    /// Call from a confirmed user gesture.
    pub async fn retry_pending(&self) -> Option<PlayOutcome> {
        let pending = self.shared.slot.lock().await.pending.take();
        let request = pending?;
        log::info!("PlaybackManager: retrying pending request {}", request.id);
        Some(self.play(request).await)
    }

    /// Stop and release the active playback. The pending request is kept.
    pub async fn stop(&self) {
        let mut slot = self.shared.slot.lock().await;
        self.shared.apply(&mut slot, Event::Stop).await;
    }

    pub async fn pause(&self) {
        let mut slot = self.shared.slot.lock().await;
        self.shared.apply(&mut slot, Event::PauseRequested).await;
    }

    /// Re-initiate a paused playback. A refusal reverts to paused and is
    /// reported as a `Failed` notice.
    pub async fn resume(&self) {
        let shared = &self.shared;
        let (playback_id, play, cancel) = {
            let mut slot = shared.slot.lock().await;
            let Some(active) = slot.active.as_ref() else {
                return;
            };
            let playback_id = active.playback_id;
            let cancel = active.cancel.clone();
            match shared.apply(&mut slot, Event::ResumeRequested).await {
                Some(play) => (playback_id, play, cancel),
                None => return,
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = play => result,
        };
        shared.settle(playback_id, result, true).await;
    }

    /// Release everything without starting anything new; also drops the
    /// pending request.
    pub async fn teardown(&self) {
        let mut slot = self.shared.slot.lock().await;
        self.shared.apply(&mut slot, Event::Stop).await;
        if let Some(pending) = slot.pending.take() {
            log::debug!("PlaybackManager: dropped pending request {}", pending.id);
        }
        log::info!("PlaybackManager: torn down");
    }

    /// Latest analysis frame, empty when no graph is attached
    pub fn frequency_snapshot(&self) -> Vec<u8> {
        lock(&self.shared.tap)
            .as_ref()
            .and_then(|tap| tap.graph.as_ref())
            .map(|graph| graph.frequency_snapshot())
            .unwrap_or_default()
    }

    pub fn progress(&self) -> PlaybackProgress {
        match lock(&self.shared.tap).as_ref() {
            Some(tap) => PlaybackProgress {
                current_seconds: tap.sink.current_time(),
                duration_seconds: tap.sink.duration(),
            },
            None => PlaybackProgress::default(),
        }
    }

    /// Clock reading the active playback's sink
    pub fn clock(&self) -> Option<PlaybackClock> {
        lock(&self.shared.tap)
            .as_ref()
            .map(|tap| PlaybackClock::new(Arc::clone(&tap.sink)))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackNotice> {
        self.shared.notices.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<PlaybackStatus> {
        self.shared.status.subscribe()
    }

    pub fn status(&self) -> PlaybackStatus {
        *self.shared.status.borrow()
    }

    pub async fn pending_request(&self) -> Option<PlaybackRequest> {
        self.shared.slot.lock().await.pending.clone()
    }

    pub async fn active_request(&self) -> Option<PlaybackRequest> {
        self.shared
            .slot
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.request.clone())
    }

    pub fn unlocker(&self) -> &WarmupUnlocker {
        &self.shared.unlocker
    }
}

impl Shared {
    fn is_superseded(&self, playback_id: PlaybackId) -> bool {
        self.latest.load(Ordering::SeqCst) != playback_id
    }

    fn lease_sink(&self) -> Result<SinkLease, SinkError> {
        let profile = self.factory.profile();
        if profile.constrained {
            if let Some(sink) = self.unlocker.warmed_sink() {
                return Ok(SinkLease::Warmed(sink));
            }
        }

        let sink = self.factory.create_sink()?;
        let graph = if profile.constrained {
            None
        } else {
            match self.factory.attach_analyser(&sink) {
                Ok(graph) => Some(graph),
                Err(e) => {
                    log::warn!("PlaybackManager: frequency analysis unavailable: {}", e);
                    None
                }
            }
        };
        Ok(SinkLease::Dedicated { sink, graph })
    }

    /// Feed an event through the reducer and run its effects.
    /// Returns the play future when an effect re-initiated playback.
    async fn apply(&self, slot: &mut Slot, event: Event) -> Option<PlayFuture> {
        let (next, effects) = reduce(&slot.state, event);
        slot.state = next;
        self.run_effects(slot, effects).await
    }

    async fn run_effects(&self, slot: &mut Slot, effects: Vec<Effect>) -> Option<PlayFuture> {
        // Release drops the active playback, so capture its request first
        let context = slot
            .active
            .as_ref()
            .map(|a| (a.playback_id, a.request.clone()));
        let request_for = |playback_id: PlaybackId| {
            context
                .as_ref()
                .filter(|(id, _)| *id == playback_id)
                .map(|(_, request)| request.clone())
        };

        let mut play = None;
        for effect in effects {
            match effect {
                Effect::EmitStatus => self.publish_status(slot.state.status()),
                Effect::PauseSink { playback_id } => {
                    if let Some(active) = slot.active_for(playback_id) {
                        active.lease.sink().pause();
                    }
                }
                Effect::StartSink { playback_id } => {
                    if let Some(active) = slot.active_for(playback_id) {
                        play = Some(active.lease.sink().play());
                    }
                }
                Effect::Release { playback_id } => self.release(slot, playback_id).await,
                Effect::Defer { playback_id } => {
                    if let Some(request) = request_for(playback_id) {
                        log::warn!(
                            "PlaybackManager: request {} needs a user gesture, deferring",
                            request.id
                        );
                        if let Some(replaced) = slot.pending.replace(request.clone()) {
                            log::debug!(
                                "PlaybackManager: pending request {} replaced",
                                replaced.id
                            );
                        }
                        self.notify(PlaybackNotice::Deferred(request));
                    }
                }
                Effect::ReportFailure { playback_id, error } => {
                    if let Some(request) = request_for(playback_id) {
                        log::warn!(
                            "PlaybackManager: request {} failed: {}",
                            request.id,
                            error
                        );
                        self.notify(PlaybackNotice::Failed { request, error });
                    }
                }
                Effect::AnnounceEnded { playback_id } => {
                    if let Some(request) = request_for(playback_id) {
                        log::info!("PlaybackManager: request {} ended", request.id);
                        self.notify(PlaybackNotice::Ended {
                            request_id: request.id,
                        });
                    }
                }
            }
        }
        play
    }

    /// Pause, rewind, detach, then disconnect and close the analysis graph.
    /// Failures are logged and the release always completes.
    async fn release(&self, slot: &mut Slot, playback_id: PlaybackId) {
        if slot.active_for(playback_id).is_none() {
            return;
        }
        let Some(active) = slot.active.take() else {
            return;
        };
        active.cancel.cancel();
        *lock(&self.tap) = None;

        let sink = active.lease.sink();
        sink.pause();
        sink.rewind();
        sink.detach();

        if let Some(graph) = active.lease.graph() {
            if let Err(e) = graph.disconnect() {
                log::warn!("PlaybackManager: {}", e);
            }
            if let Err(e) = graph.close().await {
                log::warn!("PlaybackManager: {}", e);
            }
            tokio::time::sleep(self.grace).await;
        }
        log::debug!(
            "PlaybackManager: released request {} (sink {})",
            active.request.id,
            sink.id()
        );
    }

    /// Apply the result of a play future, unless the playback is gone
    async fn settle(
        &self,
        playback_id: PlaybackId,
        result: Result<(), PlayError>,
        resuming: bool,
    ) -> PlayOutcome {
        let mut slot = self.slot.lock().await;
        if slot.active_for(playback_id).is_none() {
            return PlayOutcome::Cancelled;
        }

        let (event, outcome) = match result {
            Ok(()) => (Event::PlayStarted { playback_id }, PlayOutcome::Started),
            Err(err) if resuming => (
                Event::ResumeFailed {
                    playback_id,
                    err: err.clone(),
                },
                PlayOutcome::Failed(err),
            ),
            Err(PlayError::GestureRequired) => {
                (Event::GestureBlocked { playback_id }, PlayOutcome::Deferred)
            }
            Err(err) => (
                Event::LoadFailed {
                    playback_id,
                    err: err.clone(),
                },
                PlayOutcome::Failed(err),
            ),
        };
        self.apply(&mut slot, event).await;
        outcome
    }

    /// Sink events for the active playback
    async fn on_sink_event(&self, playback_id: PlaybackId, event: SinkEvent) {
        let mut slot = self.slot.lock().await;
        if slot.active_for(playback_id).is_none() {
            return;
        }
        let event = match event {
            SinkEvent::Paused => Event::SinkPaused { playback_id },
            SinkEvent::Ended => Event::SinkEnded { playback_id },
            // Load errors before playback starts arrive through the play future
            SinkEvent::Error(message) if matches!(slot.state, State::Playing { .. }) => {
                Event::LoadFailed {
                    playback_id,
                    err: PlayError::Failed(message),
                }
            }
            _ => return,
        };
        self.apply(&mut slot, event).await;
    }

    fn publish_status(&self, status: PlaybackStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            log::debug!("PlaybackManager: status -> {}", status.as_str());
            self.notify(PlaybackNotice::StatusChanged(status));
        }
    }

    fn notify(&self, notice: PlaybackNotice) {
        // No receivers is fine
        let _ = self.notices.send(notice);
    }
}

/// Forward one sink's events until its playback is released
async fn watch_sink(
    shared: Weak<Shared>,
    mut events: broadcast::Receiver<SinkEvent>,
    playback_id: PlaybackId,
    request_id: String,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("PlaybackManager: sink watcher lagged by {}", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match event {
            SinkEvent::Ready { duration } => shared.notify(PlaybackNotice::Ready {
                request_id: request_id.clone(),
                duration,
            }),
            SinkEvent::TimeUpdate { current, duration } => {
                shared.notify(PlaybackNotice::Progress {
                    request_id: request_id.clone(),
                    progress: PlaybackProgress {
                        current_seconds: current,
                        duration_seconds: Some(duration).filter(|d| *d > 0.0),
                    },
                })
            }
            SinkEvent::Playing => {}
            event => shared.on_sink_event(playback_id, event).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::scripted::{PlayScript, ScriptedPlatform, SinkCall};
    use crate::platform::PlatformProfile;

    fn manager_for(platform: &ScriptedPlatform) -> PlaybackManager {
        let factory = platform.factory();
        let unlocker = WarmupUnlocker::new(Arc::clone(&factory));
        PlaybackManager::new(factory, unlocker, DEFAULT_TEARDOWN_GRACE)
    }

    fn request(id: &str) -> PlaybackRequest {
        PlaybackRequest::new(id, format!("file:///{}.wav", id), "test")
    }

    #[tokio::test(start_paused = true)]
    async fn play_reaches_playing_with_analysis_on_unconstrained() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        let manager = manager_for(&platform);

        assert_eq!(manager.play(request("a")).await, PlayOutcome::Started);
        assert_eq!(manager.status(), PlaybackStatus::Playing);
        assert_eq!(platform.graphs().len(), 1);
        assert_eq!(manager.frequency_snapshot().len(), 32);
        assert_eq!(manager.active_request().await.map(|r| r.id), Some("a".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_playback_releases_previous_sink_and_graph() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        let manager = manager_for(&platform);

        manager.play(request("a")).await;
        manager.play(request("b")).await;

        let sinks = platform.sinks();
        assert_eq!(sinks.len(), 2);
        let first = sinks[0].calls();
        assert!(first.contains(&SinkCall::Pause));
        assert!(first.contains(&SinkCall::Rewind));
        assert!(first.contains(&SinkCall::Detach));

        let graphs = platform.graphs();
        assert!(!graphs[0].is_connected());
        assert!(graphs[0].is_closed());
        assert!(graphs[1].is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn constrained_platform_reuses_warmed_sink_without_graph() {
        let platform = ScriptedPlatform::new(PlatformProfile::constrained());
        let manager = manager_for(&platform);
        manager.unlocker().unlock();
        manager.unlocker().wait_settled().await;

        manager.play(request("a")).await;
        manager.play(request("b")).await;

        assert_eq!(platform.sinks().len(), 1);
        assert!(platform.graphs().is_empty());
        assert!(manager.frequency_snapshot().is_empty());
        assert_eq!(platform.sinks()[0].source(), Some("file:///b.wav".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn constrained_platform_without_unlock_uses_fresh_sink() {
        let platform = ScriptedPlatform::new(PlatformProfile::constrained());
        let manager = manager_for(&platform);

        assert_eq!(manager.play(request("a")).await, PlayOutcome::Started);
        assert_eq!(platform.sinks().len(), 1);
        assert!(platform.graphs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gesture_rejection_defers_and_retry_replays() {
        let platform = ScriptedPlatform::new(PlatformProfile::constrained());
        platform.push_script(PlayScript::RejectGesture);
        let manager = manager_for(&platform);
        let mut notices = manager.subscribe();

        assert_eq!(manager.play(request("x")).await, PlayOutcome::Deferred);
        assert_eq!(manager.status(), PlaybackStatus::Idle);
        assert_eq!(manager.pending_request().await.map(|r| r.id), Some("x".to_string()));

        let mut deferred = false;
        while let Ok(notice) = notices.try_recv() {
            if let PlaybackNotice::Deferred(ref req) = notice {
                deferred = req.id == "x";
            }
            assert!(!matches!(notice, PlaybackNotice::Failed { .. }));
        }
        assert!(deferred);

        assert_eq!(manager.retry_pending().await, Some(PlayOutcome::Started));
        assert!(manager.pending_request().await.is_none());
        assert_eq!(manager.active_request().await.map(|r| r.id), Some("x".to_string()));
        assert_eq!(manager.retry_pending().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn gesture_rejection_while_paused_mid_load_defers() {
        let platform = ScriptedPlatform::new(PlatformProfile::constrained());
        platform.push_script(PlayScript::Hold);
        let manager = manager_for(&platform);

        let loading = manager.clone();
        let first = tokio::spawn(async move { loading.play(request("x")).await });
        while platform.sinks().iter().map(|s| s.held_count()).sum::<usize>() == 0 {
            tokio::task::yield_now().await;
        }

        manager.pause().await;
        assert_eq!(manager.status(), PlaybackStatus::Paused);
        platform.sinks()[0].release_held(Err(PlayError::GestureRequired));

        assert_eq!(first.await.unwrap(), PlayOutcome::Deferred);
        assert_eq!(manager.status(), PlaybackStatus::Idle);
        assert!(manager.active_request().await.is_none());
        assert_eq!(manager.pending_request().await.map(|r| r.id), Some("x".to_string()));

        assert_eq!(manager.retry_pending().await, Some(PlayOutcome::Started));
        assert_eq!(manager.status(), PlaybackStatus::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn load_failure_reports_and_goes_idle() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        platform.push_script(PlayScript::FailLoad("404".to_string()));
        let manager = manager_for(&platform);
        let mut notices = manager.subscribe();

        let outcome = manager.play(request("a")).await;
        assert_eq!(outcome, PlayOutcome::Failed(PlayError::Load("404".to_string())));
        assert_eq!(manager.status(), PlaybackStatus::Idle);
        assert!(manager.active_request().await.is_none());
        assert!(manager.pending_request().await.is_none());

        let mut failed = false;
        while let Ok(notice) = notices.try_recv() {
            if let PlaybackNotice::Failed { request, .. } = notice {
                failed = request.id == "a";
            }
        }
        assert!(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_failure_is_swallowed() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        platform.set_fail_close(true);
        let manager = manager_for(&platform);

        manager.play(request("a")).await;
        assert_eq!(manager.play(request("b")).await, PlayOutcome::Started);
        assert_eq!(manager.active_request().await.map(|r| r.id), Some("b".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_pending_but_teardown_clears_it() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        platform.push_script(PlayScript::RejectGesture);
        let manager = manager_for(&platform);

        manager.play(request("x")).await;
        manager.stop().await;
        assert_eq!(manager.status(), PlaybackStatus::Idle);
        assert!(manager.pending_request().await.is_some());

        manager.teardown().await;
        assert!(manager.pending_request().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn new_play_supersedes_pending() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        platform.push_script(PlayScript::RejectGesture);
        let manager = manager_for(&platform);

        manager.play(request("x")).await;
        assert!(manager.pending_request().await.is_some());
        assert_eq!(manager.play(request("y")).await, PlayOutcome::Started);
        assert!(manager.pending_request().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        let manager = manager_for(&platform);

        manager.play(request("a")).await;
        manager.pause().await;
        assert_eq!(manager.status(), PlaybackStatus::Paused);
        assert!(platform.sinks()[0].calls().contains(&SinkCall::Pause));

        manager.resume().await;
        assert_eq!(manager.status(), PlaybackStatus::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_resume_reverts_to_paused() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        let manager = manager_for(&platform);

        manager.play(request("a")).await;
        manager.pause().await;
        platform.push_script(PlayScript::RejectGesture);
        let mut notices = manager.subscribe();
        manager.resume().await;

        assert_eq!(manager.status(), PlaybackStatus::Paused);
        let mut failed = false;
        while let Ok(notice) = notices.try_recv() {
            failed |= matches!(notice, PlaybackNotice::Failed { .. });
        }
        assert!(failed);
    }

    #[tokio::test(start_paused = true)]
    async fn controls_are_no_ops_when_idle() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        let manager = manager_for(&platform);

        manager.pause().await;
        manager.resume().await;
        manager.stop().await;
        assert_eq!(manager.status(), PlaybackStatus::Idle);
        assert!(manager.frequency_snapshot().is_empty());
        assert!(manager.clock().is_none());
        assert_eq!(manager.progress(), PlaybackProgress::default());
    }

    #[tokio::test(start_paused = true)]
    async fn natural_end_returns_to_idle() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        let manager = manager_for(&platform);
        let mut status = manager.watch_status();

        manager.play(request("a")).await;
        platform.sinks()[0].finish();
        status
            .wait_for(|s| *s == PlaybackStatus::Idle)
            .await
            .unwrap();
        assert!(manager.active_request().await.is_none());
        assert!(platform.graphs()[0].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn analysis_failure_still_plays() {
        let platform = ScriptedPlatform::new(PlatformProfile::unconstrained());
        platform.set_analysis_available(false);
        let manager = manager_for(&platform);

        assert_eq!(manager.play(request("a")).await, PlayOutcome::Started);
        assert!(manager.frequency_snapshot().is_empty());
    }
}
