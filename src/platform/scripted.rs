//! Deterministic in-memory audio platform
//!
//! Play outcomes are scripted per call, every sink operation is recorded, and
//! time only moves when the test moves it. Used by the test suites and by
//! headless runs of the CLI.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{broadcast, oneshot};

use super::{
    AnalysisGraph, AudioSink, AudioSinkFactory, PlatformProfile, PlayError, PlayFuture, SinkError,
    SinkEvent, SinkId,
};
use crate::util::lock;

const SILENT_SOURCE: &str = "scripted:silence";

/// How the next `play()` call resolves
#[derive(Debug, Clone, PartialEq)]
pub enum PlayScript {
    Succeed,
    RejectGesture,
    FailLoad(String),
    /// Stay pending until [`ScriptedSink::release_held`] or detach
    Hold,
}

/// One recorded sink operation
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    SetSource(String),
    Play,
    Pause,
    Rewind,
    Detach,
}

/// Scripted backend. Cloning shares the script queue and the records.
#[derive(Clone)]
pub struct ScriptedPlatform {
    inner: Arc<PlatformInner>,
}

struct PlatformInner {
    profile: PlatformProfile,
    next_id: AtomicU64,
    scripts: Mutex<VecDeque<PlayScript>>,
    default_script: Mutex<PlayScript>,
    source_duration: Mutex<Option<f64>>,
    analysis_available: AtomicBool,
    fail_close: AtomicBool,
    sinks: Mutex<Vec<Arc<ScriptedSink>>>,
    graphs: Mutex<Vec<Arc<ScriptedGraph>>>,
}

impl ScriptedPlatform {
    pub fn new(profile: PlatformProfile) -> Self {
        Self {
            inner: Arc::new(PlatformInner {
                profile,
                next_id: AtomicU64::new(1),
                scripts: Mutex::new(VecDeque::new()),
                default_script: Mutex::new(PlayScript::Succeed),
                source_duration: Mutex::new(Some(1.0)),
                analysis_available: AtomicBool::new(true),
                fail_close: AtomicBool::new(false),
                sinks: Mutex::new(Vec::new()),
                graphs: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn factory(&self) -> Arc<dyn AudioSinkFactory> {
        Arc::new(self.clone())
    }

    /// Queue the outcome of the next unscripted `play()` on any sink
    pub fn push_script(&self, script: PlayScript) {
        lock(&self.inner.scripts).push_back(script);
    }

    /// Outcome used once the queue is empty
    pub fn set_default_script(&self, script: PlayScript) {
        *lock(&self.inner.default_script) = script;
    }

    /// Duration reported by `Ready` for every new source
    pub fn set_source_duration(&self, duration: Option<f64>) {
        *lock(&self.inner.source_duration) = duration;
    }

    pub fn set_analysis_available(&self, available: bool) {
        self.inner
            .analysis_available
            .store(available, Ordering::SeqCst);
    }

    /// Make every graph `close()` fail
    pub fn set_fail_close(&self, fail: bool) {
        self.inner.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Every sink created so far, oldest first
    pub fn sinks(&self) -> Vec<Arc<ScriptedSink>> {
        lock(&self.inner.sinks).clone()
    }

    pub fn sink(&self, id: SinkId) -> Option<Arc<ScriptedSink>> {
        lock(&self.inner.sinks).iter().find(|s| s.id == id).cloned()
    }

    pub fn graphs(&self) -> Vec<Arc<ScriptedGraph>> {
        lock(&self.inner.graphs).clone()
    }

    fn next_script(&self) -> PlayScript {
        lock(&self.inner.scripts)
            .pop_front()
            .unwrap_or_else(|| lock(&self.inner.default_script).clone())
    }
}

impl AudioSinkFactory for ScriptedPlatform {
    fn profile(&self) -> PlatformProfile {
        self.inner.profile
    }

    fn create_sink(&self) -> Result<Arc<dyn AudioSink>, SinkError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(64);
        let sink = Arc::new(ScriptedSink {
            id,
            platform: self.clone(),
            events,
            state: Mutex::new(SinkState::default()),
            graph_attached: AtomicBool::new(false),
        });
        lock(&self.inner.sinks).push(Arc::clone(&sink));
        Ok(sink)
    }

    fn attach_analyser(
        &self,
        sink: &Arc<dyn AudioSink>,
    ) -> Result<Arc<dyn AnalysisGraph>, SinkError> {
        if !self.inner.analysis_available.load(Ordering::SeqCst) {
            return Err(SinkError::GraphUnavailable(
                "analysis disabled by script".to_string(),
            ));
        }
        let target = self
            .sink(sink.id())
            .ok_or_else(|| SinkError::GraphUnavailable(format!("unknown sink {}", sink.id())))?;
        if target.graph_attached.swap(true, Ordering::SeqCst) {
            return Err(SinkError::GraphAlreadyAttached(target.id));
        }

        let graph = Arc::new(ScriptedGraph {
            sink: target,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_close: self.inner.fail_close.load(Ordering::SeqCst),
        });
        lock(&self.inner.graphs).push(Arc::clone(&graph));
        Ok(graph)
    }

    fn silent_source(&self) -> String {
        SILENT_SOURCE.to_string()
    }
}

#[derive(Default)]
struct SinkState {
    source: Option<String>,
    current_time: f64,
    duration: Option<f64>,
    paused: bool,
    ended: bool,
    calls: Vec<SinkCall>,
    held: Vec<oneshot::Sender<Result<(), PlayError>>>,
}

/// Recording sink handed out by [`ScriptedPlatform`]
pub struct ScriptedSink {
    id: SinkId,
    platform: ScriptedPlatform,
    events: broadcast::Sender<SinkEvent>,
    state: Mutex<SinkState>,
    graph_attached: AtomicBool,
}

impl ScriptedSink {
    pub fn calls(&self) -> Vec<SinkCall> {
        lock(&self.state).calls.clone()
    }

    pub fn source(&self) -> Option<String> {
        lock(&self.state).source.clone()
    }

    pub fn has_graph(&self) -> bool {
        self.graph_attached.load(Ordering::SeqCst)
    }

    /// Play requests still waiting on a `Hold` script
    pub fn held_count(&self) -> usize {
        lock(&self.state).held.len()
    }

    /// Resolve every held play request with `result`
    pub fn release_held(&self, result: Result<(), PlayError>) {
        let held = std::mem::take(&mut lock(&self.state).held);
        if held.is_empty() {
            return;
        }
        if result.is_ok() {
            self.mark_playing();
        }
        for tx in held {
            let _ = tx.send(result.clone());
        }
    }

    /// Move the playback position and emit a time update
    pub fn set_time(&self, seconds: f64) {
        let duration = {
            let mut state = lock(&self.state);
            state.current_time = seconds;
            state.duration.unwrap_or(0.0)
        };
        let _ = self.events.send(SinkEvent::TimeUpdate {
            current: seconds,
            duration,
        });
    }

    /// Reach the end of the current source
    pub fn finish(&self) {
        {
            let mut state = lock(&self.state);
            state.ended = true;
            state.paused = true;
            if let Some(d) = state.duration {
                state.current_time = d;
            }
        }
        let _ = self.events.send(SinkEvent::Ended);
    }

    /// Inject an arbitrary event
    pub fn emit(&self, event: SinkEvent) {
        let _ = self.events.send(event);
    }

    fn mark_playing(&self) {
        {
            let mut state = lock(&self.state);
            state.paused = false;
            state.ended = false;
        }
        let _ = self.events.send(SinkEvent::Playing);
    }
}

impl AudioSink for ScriptedSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn set_source(&self, url: &str) {
        let duration = *lock(&self.platform.inner.source_duration);
        {
            let mut state = lock(&self.state);
            state.calls.push(SinkCall::SetSource(url.to_string()));
            state.source = Some(url.to_string());
            state.current_time = 0.0;
            state.duration = duration;
            state.paused = true;
            state.ended = false;
        }
        let _ = self.events.send(SinkEvent::Ready { duration });
    }

    fn play(&self) -> PlayFuture {
        lock(&self.state).calls.push(SinkCall::Play);

        match self.platform.next_script() {
            PlayScript::Succeed => {
                self.mark_playing();
                futures_util::future::ready(Ok(())).boxed()
            }
            PlayScript::RejectGesture => {
                futures_util::future::ready(Err(PlayError::GestureRequired)).boxed()
            }
            PlayScript::FailLoad(message) => {
                let _ = self.events.send(SinkEvent::Error(message.clone()));
                futures_util::future::ready(Err(PlayError::Load(message))).boxed()
            }
            PlayScript::Hold => {
                let (tx, rx) = oneshot::channel();
                lock(&self.state).held.push(tx);
                async move {
                    rx.await.unwrap_or_else(|_| {
                        Err(PlayError::Failed("source detached before playback".to_string()))
                    })
                }
                .boxed()
            }
        }
    }

    fn pause(&self) {
        let was_playing = {
            let mut state = lock(&self.state);
            state.calls.push(SinkCall::Pause);
            let was_playing = !state.paused;
            state.paused = true;
            was_playing
        };
        if was_playing {
            let _ = self.events.send(SinkEvent::Paused);
        }
    }

    fn rewind(&self) {
        let mut state = lock(&self.state);
        state.calls.push(SinkCall::Rewind);
        state.current_time = 0.0;
    }

    fn detach(&self) {
        let mut state = lock(&self.state);
        state.calls.push(SinkCall::Detach);
        state.source = None;
        state.duration = None;
        state.paused = true;
        // Dropping the senders settles outstanding play futures
        state.held.clear();
    }

    fn current_time(&self) -> f64 {
        lock(&self.state).current_time
    }

    fn duration(&self) -> Option<f64> {
        lock(&self.state).duration
    }

    fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    fn is_ended(&self) -> bool {
        lock(&self.state).ended
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.events.subscribe()
    }
}

/// Analysis tap produced by [`ScriptedPlatform::attach_analyser`]
pub struct ScriptedGraph {
    sink: Arc<ScriptedSink>,
    connected: AtomicBool,
    closed: AtomicBool,
    fail_close: bool,
}

impl ScriptedGraph {
    pub fn sink_id(&self) -> SinkId {
        self.sink.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisGraph for ScriptedGraph {
    fn frequency_snapshot(&self) -> Vec<u8> {
        if !self.is_connected() {
            return Vec::new();
        }
        // Level follows the position so callers can see frames change
        let level = ((self.sink.current_time() * 100.0) as u32).min(255) as u8;
        vec![level; crate::audio::spectrum::BIN_COUNT]
    }

    fn disconnect(&self) -> Result<(), SinkError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.sink.graph_attached.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        if self.fail_close {
            return Err(SinkError::CloseFailed("scripted close failure".to_string()));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
