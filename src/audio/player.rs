//! Desktop playback backend using CPAL for output and hound for decoding
//!
//! Each [`LocalSink`] owns one output stream. CPAL streams are not `Send`,
//! so the stream lives on a dedicated OS thread that holds it open until the
//! sink is dropped; the stream callback renders from state shared with the
//! sink. Sources load on the tokio runtime and report `Ready` when decoded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, Weak};
use std::thread;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use futures_util::future::{self, FutureExt};
use tokio::sync::{broadcast, oneshot};

use super::source::SourceLoader;
use super::spectrum::SpectrumAnalyser;
use super::wav::{decode_wav, silent_wav_data_uri, DecodedAudio};
use crate::platform::{
    AnalysisGraph, AudioSink, AudioSinkFactory, PlatformProfile, PlayError, PlayFuture, SinkError,
    SinkEvent, SinkId,
};
use crate::util::lock;

/// Seconds between `TimeUpdate` events while playing
const TIME_UPDATE_INTERVAL: f64 = 0.25;

const EVENT_CAPACITY: usize = 64;

type Tap = Arc<Mutex<SpectrumAnalyser>>;

/// Builds cpal-backed sinks and their analysers
pub struct LocalSinkFactory {
    profile: PlatformProfile,
    loader: SourceLoader,
    next_id: AtomicU64,
    sinks: Mutex<HashMap<SinkId, Weak<SinkShared>>>,
}

impl LocalSinkFactory {
    pub fn new(profile: PlatformProfile) -> Result<Self, SinkError> {
        let loader = SourceLoader::new().map_err(|e| SinkError::Device(e.to_string()))?;
        Ok(Self {
            profile,
            loader,
            next_id: AtomicU64::new(1),
            sinks: Mutex::new(HashMap::new()),
        })
    }
}

impl AudioSinkFactory for LocalSinkFactory {
    fn profile(&self) -> PlatformProfile {
        self.profile
    }

    fn create_sink(&self) -> Result<Arc<dyn AudioSink>, SinkError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(SinkShared {
            id,
            state: Mutex::new(SinkState::default()),
            events,
        });

        let mut sinks = lock(&self.sinks);
        sinks.retain(|_, sink| sink.strong_count() > 0);
        sinks.insert(id, Arc::downgrade(&shared));

        log::debug!("LocalSink {}: created", id);
        Ok(Arc::new(LocalSink {
            shared,
            loader: self.loader.clone(),
        }))
    }

    fn attach_analyser(
        &self,
        sink: &Arc<dyn AudioSink>,
    ) -> Result<Arc<dyn AnalysisGraph>, SinkError> {
        let shared = lock(&self.sinks)
            .get(&sink.id())
            .and_then(Weak::upgrade)
            .ok_or_else(|| SinkError::GraphUnavailable(format!("unknown sink {}", sink.id())))?;

        let tap: Tap = Arc::new(Mutex::new(SpectrumAnalyser::new()));
        {
            let mut state = lock(&shared.state);
            if state.tap.is_some() {
                return Err(SinkError::GraphAlreadyAttached(shared.id));
            }
            state.tap = Some(Arc::clone(&tap));
        }

        Ok(Arc::new(LocalAnalysisGraph {
            sink: Arc::downgrade(&shared),
            tap,
            connected: Mutex::new(true),
        }))
    }

    fn silent_source(&self) -> String {
        silent_wav_data_uri()
    }
}

// ----------------------------------------------------------------------------
// Sink
// ----------------------------------------------------------------------------

struct SinkShared {
    id: SinkId,
    state: Mutex<SinkState>,
    events: broadcast::Sender<SinkEvent>,
}

impl SinkShared {
    fn emit(&self, event: SinkEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct SinkState {
    source: Option<String>,
    audio: Option<Arc<DecodedAudio>>,
    /// Bumped on every source change; stale loads compare against it
    generation: u64,
    /// Position in source frames
    cursor: f64,
    playing: bool,
    ended: bool,
    last_time_update: f64,
    /// Play requests made before the source finished loading
    waiting: Vec<oneshot::Sender<Result<(), PlayError>>>,
    tap: Option<Tap>,
    output: Option<OutputThread>,
}

impl SinkState {
    fn current_time(&self) -> f64 {
        match &self.audio {
            Some(audio) if audio.sample_rate > 0 => self.cursor / audio.sample_rate as f64,
            _ => 0.0,
        }
    }

    fn duration(&self) -> Option<f64> {
        self.audio.as_ref().map(|a| a.duration_seconds())
    }
}

/// Keeps the output stream alive; dropping it stops the thread
struct OutputThread {
    shutdown: std_mpsc::Sender<()>,
}

impl Drop for OutputThread {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// One cpal output stream playing a decoded source
pub struct LocalSink {
    shared: Arc<SinkShared>,
    loader: SourceLoader,
}

impl AudioSink for LocalSink {
    fn id(&self) -> SinkId {
        self.shared.id
    }

    fn set_source(&self, url: &str) {
        let generation = {
            let mut state = lock(&self.shared.state);
            state.generation += 1;
            state.source = Some(url.to_string());
            state.audio = None;
            state.cursor = 0.0;
            state.playing = false;
            state.ended = false;
            state.last_time_update = 0.0;
            state.generation
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                fail_load(&self.shared, generation, "no async runtime to load audio".to_string());
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        let loader = self.loader.clone();
        let url = url.to_string();
        runtime.spawn(async move {
            let decoded = match loader.fetch(&url).await {
                Ok(bytes) => decode_wav(&bytes),
                Err(e) => Err(e),
            };
            match decoded {
                Ok(audio) => finish_load(&shared, generation, audio),
                Err(e) => fail_load(&shared, generation, e.to_string()),
            }
        });
    }

    fn play(&self) -> PlayFuture {
        let mut state = lock(&self.shared.state);
        if state.source.is_none() {
            return future::ready(Err(PlayError::Load("no source set".to_string()))).boxed();
        }

        let started = if state.output.is_none() {
            let (output, started) = spawn_output(Arc::clone(&self.shared));
            state.output = Some(output);
            Some(started)
        } else {
            None
        };

        let waiting = if state.audio.is_some() {
            if state.ended {
                state.cursor = 0.0;
                state.ended = false;
            }
            if !state.playing {
                state.playing = true;
                self.shared.emit(SinkEvent::Playing);
            }
            None
        } else {
            let (tx, rx) = oneshot::channel();
            state.waiting.push(tx);
            Some(rx)
        };
        drop(state);

        let shared = Arc::clone(&self.shared);
        async move {
            if let Some(started) = started {
                let outcome = started
                    .await
                    .unwrap_or_else(|_| Err(SinkError::Device("output thread exited".to_string())));
                if let Err(e) = outcome {
                    let mut state = lock(&shared.state);
                    state.playing = false;
                    state.output = None;
                    return Err(PlayError::Failed(e.to_string()));
                }
            }
            match waiting {
                Some(rx) => rx
                    .await
                    .unwrap_or_else(|_| Err(PlayError::Failed("source detached".to_string()))),
                None => Ok(()),
            }
        }
        .boxed()
    }

    fn pause(&self) {
        let mut state = lock(&self.shared.state);
        if state.playing {
            state.playing = false;
            self.shared.emit(SinkEvent::Paused);
        }
    }

    fn rewind(&self) {
        let mut state = lock(&self.shared.state);
        state.cursor = 0.0;
        state.ended = false;
        state.last_time_update = 0.0;
    }

    fn detach(&self) {
        let mut state = lock(&self.shared.state);
        state.generation += 1;
        state.source = None;
        state.audio = None;
        state.cursor = 0.0;
        state.playing = false;
        state.ended = false;
        // Dropping the senders settles outstanding play futures
        state.waiting.clear();
    }

    fn current_time(&self) -> f64 {
        lock(&self.shared.state).current_time()
    }

    fn duration(&self) -> Option<f64> {
        lock(&self.shared.state).duration()
    }

    fn is_paused(&self) -> bool {
        !lock(&self.shared.state).playing
    }

    fn is_ended(&self) -> bool {
        lock(&self.shared.state).ended
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for LocalSink {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        state.waiting.clear();
        state.output = None;
        log::debug!("LocalSink {}: dropped", self.shared.id);
    }
}

fn finish_load(shared: &SinkShared, generation: u64, audio: DecodedAudio) {
    let mut state = lock(&shared.state);
    if state.generation != generation {
        return;
    }
    let duration = audio.duration_seconds();
    log::debug!(
        "LocalSink {}: loaded {:.2}s ({} Hz, {} ch)",
        shared.id,
        duration,
        audio.sample_rate,
        audio.channels
    );
    state.audio = Some(Arc::new(audio));
    shared.emit(SinkEvent::Ready {
        duration: Some(duration),
    });

    if !state.waiting.is_empty() {
        state.playing = true;
        shared.emit(SinkEvent::Playing);
        for tx in state.waiting.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }
}

fn fail_load(shared: &SinkShared, generation: u64, message: String) {
    let mut state = lock(&shared.state);
    if state.generation != generation {
        return;
    }
    log::warn!("LocalSink {}: failed to load source: {}", shared.id, message);
    shared.emit(SinkEvent::Error(message.clone()));
    for tx in state.waiting.drain(..) {
        let _ = tx.send(Err(PlayError::Load(message.clone())));
    }
}

// ----------------------------------------------------------------------------
// Output thread
// ----------------------------------------------------------------------------

/// Start the output stream on its own thread. The receiver resolves once
/// the stream is playing or failed to build.
fn spawn_output(shared: Arc<SinkShared>) -> (OutputThread, oneshot::Receiver<Result<(), SinkError>>) {
    let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
    let (started_tx, started_rx) = oneshot::channel();
    let id = shared.id;

    let spawned = thread::Builder::new()
        .name(format!("voxsync-output-{}", id))
        .spawn(move || {
            let stream = match build_output_stream(Arc::clone(&shared)) {
                Ok(stream) => stream,
                Err(e) => {
                    log::error!("LocalSink {}: {}", id, e);
                    let _ = started_tx.send(Err(e));
                    return;
                }
            };
            let _ = started_tx.send(Ok(()));
            // Blocks until the sink is dropped
            let _ = shutdown_rx.recv();
            drop(stream);
            log::debug!("LocalSink {}: output thread stopped", id);
        });

    if let Err(e) = spawned {
        log::error!("LocalSink {}: failed to spawn output thread: {}", id, e);
    }

    (OutputThread { shutdown: shutdown_tx }, started_rx)
}

fn build_output_stream(shared: Arc<SinkShared>) -> Result<cpal::Stream, SinkError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SinkError::Device("no audio output device found".to_string()))?;
    log::info!("Using audio output device: {:?}", device.name());

    let supported = device
        .default_output_config()
        .map_err(|e| SinkError::Device(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    let stream = match sample_format {
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, shared),
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, shared),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, shared),
        other => Err(SinkError::Device(format!("unsupported sample format {:?}", other))),
    }?;

    stream
        .play()
        .map_err(|e| SinkError::Device(format!("failed to start stream: {}", e)))?;
    Ok(stream)
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<SinkShared>,
) -> Result<cpal::Stream, SinkError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0;
    let mut scratch: Vec<f32> = Vec::new();
    let err_fn = |err| log::error!("Audio output stream error: {}", err);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                let outcome = {
                    let mut state = lock(&shared.state);
                    render(&mut state, &mut scratch, channels, device_rate)
                };
                for (out, value) in data.iter_mut().zip(scratch.iter()) {
                    *out = <T as cpal::FromSample<f32>>::from_sample_(*value);
                }
                if let Some(time) = outcome.time_update {
                    shared.emit(time);
                }
                if outcome.ended {
                    shared.emit(SinkEvent::Ended);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| SinkError::Device(e.to_string()))
}

#[derive(Debug, Default, PartialEq)]
struct RenderOutcome {
    ended: bool,
    time_update: Option<SinkEvent>,
}

/// Fill one interleaved output buffer from the current source.
///
/// Silence when nothing plays. Channels map by index (mono sources go to
/// every output channel); the rate is converted by nearest-frame stepping.
fn render(state: &mut SinkState, out: &mut [f32], channels: usize, device_rate: u32) -> RenderOutcome {
    out.iter_mut().for_each(|s| *s = 0.0);
    let mut outcome = RenderOutcome::default();

    let audio = match (&state.audio, state.playing) {
        (Some(audio), true) if channels > 0 && device_rate > 0 => Arc::clone(audio),
        _ => return outcome,
    };
    let src_channels = audio.channels.max(1) as usize;
    let frames = audio.frames();
    let step = audio.sample_rate as f64 / device_rate as f64;
    let mut mono = Vec::with_capacity(out.len() / channels);

    for frame in out.chunks_mut(channels) {
        let index = state.cursor as usize;
        if index >= frames {
            state.playing = false;
            state.ended = true;
            outcome.ended = true;
            break;
        }
        let base = index * src_channels;
        for (c, sample) in frame.iter_mut().enumerate() {
            *sample = audio.samples[base + c.min(src_channels - 1)];
        }
        mono.push(audio.samples[base]);
        state.cursor += step;
    }

    if let Some(tap) = &state.tap {
        if let Ok(mut analyser) = tap.try_lock() {
            analyser.push_float_samples(&mono);
        }
    }

    let now = state.current_time();
    if !outcome.ended && now - state.last_time_update >= TIME_UPDATE_INTERVAL {
        state.last_time_update = now;
        outcome.time_update = Some(SinkEvent::TimeUpdate {
            current: now,
            duration: audio.duration_seconds(),
        });
    }
    outcome
}

// ----------------------------------------------------------------------------
// Analysis graph
// ----------------------------------------------------------------------------

/// Spectrum tap fed from a sink's render callback
pub struct LocalAnalysisGraph {
    sink: Weak<SinkShared>,
    tap: Tap,
    connected: Mutex<bool>,
}

#[async_trait]
impl AnalysisGraph for LocalAnalysisGraph {
    fn frequency_snapshot(&self) -> Vec<u8> {
        if !*lock(&self.connected) {
            return Vec::new();
        }
        lock(&self.tap).snapshot()
    }

    fn disconnect(&self) -> Result<(), SinkError> {
        let mut connected = lock(&self.connected);
        if !*connected {
            return Ok(());
        }
        *connected = false;
        if let Some(sink) = self.sink.upgrade() {
            let mut state = lock(&sink.state);
            if state.tap.as_ref().is_some_and(|t| Arc::ptr_eq(t, &self.tap)) {
                state.tap = None;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.disconnect()?;
        lock(&self.tap).reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::encode_wav;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn audio(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Arc<DecodedAudio> {
        Arc::new(DecodedAudio {
            samples,
            channels,
            sample_rate,
        })
    }

    fn wav_uri(frames: usize, rate: u32) -> String {
        let bytes = encode_wav(&vec![1000; frames], rate, 1).unwrap();
        format!("data:audio/wav;base64,{}", STANDARD.encode(bytes))
    }

    #[test]
    fn test_render_silence_when_paused() {
        let mut state = SinkState {
            audio: Some(audio(vec![0.5; 10], 1, 10)),
            ..Default::default()
        };
        let mut out = vec![1.0; 8];
        assert_eq!(render(&mut state, &mut out, 2, 10), RenderOutcome::default());
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_render_maps_mono_to_stereo_and_ends() {
        let mut state = SinkState {
            audio: Some(audio(vec![0.1, 0.2, 0.3], 1, 10)),
            playing: true,
            ..Default::default()
        };
        let mut out = vec![0.0; 8];
        let outcome = render(&mut state, &mut out, 2, 10);

        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3, 0.0, 0.0]);
        assert!(outcome.ended);
        assert!(state.ended);
        assert!(!state.playing);
    }

    #[test]
    fn test_render_steps_through_rate_change() {
        let mut state = SinkState {
            audio: Some(audio((0..8).map(|i| i as f32).collect(), 1, 20)),
            playing: true,
            ..Default::default()
        };
        let mut out = vec![0.0; 3];
        render(&mut state, &mut out, 1, 10);
        assert_eq!(out, vec![0.0, 2.0, 4.0]);
        assert!((state.current_time() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_render_emits_time_updates() {
        let mut state = SinkState {
            audio: Some(audio(vec![0.0; 100], 1, 10)),
            playing: true,
            ..Default::default()
        };
        let mut out = vec![0.0; 3];
        let outcome = render(&mut state, &mut out, 1, 10);
        assert_eq!(
            outcome.time_update,
            Some(SinkEvent::TimeUpdate {
                current: 0.3,
                duration: 10.0
            })
        );
        let outcome = render(&mut state, &mut out[..1], 1, 10);
        assert_eq!(outcome.time_update, None);
    }

    #[test]
    fn test_render_feeds_tap() {
        let tap: Tap = Arc::new(Mutex::new(SpectrumAnalyser::new()));
        let samples: Vec<f32> = (0..64).map(|n| (n as f32 * 0.785).sin() * 0.5).collect();
        let mut state = SinkState {
            audio: Some(audio(samples, 1, 64)),
            playing: true,
            tap: Some(Arc::clone(&tap)),
            ..Default::default()
        };
        let mut out = vec![0.0; 64];
        render(&mut state, &mut out, 1, 64);
        assert!(tap.lock().unwrap().snapshot().iter().any(|&b| b > 0));
    }

    #[tokio::test]
    async fn test_source_loads_and_reports_ready() {
        let factory = LocalSinkFactory::new(PlatformProfile::unconstrained()).unwrap();
        let sink = factory.create_sink().unwrap();
        let mut events = sink.subscribe();

        sink.set_source(&wav_uri(800, 8000));
        assert_eq!(
            events.recv().await.unwrap(),
            SinkEvent::Ready {
                duration: Some(0.1)
            }
        );
        assert_eq!(sink.duration(), Some(0.1));
        assert!(sink.is_paused());
    }

    #[tokio::test]
    async fn test_bad_source_reports_error() {
        let factory = LocalSinkFactory::new(PlatformProfile::unconstrained()).unwrap();
        let sink = factory.create_sink().unwrap();
        let mut events = sink.subscribe();

        sink.set_source("data:audio/wav;base64,AAAA");
        assert!(matches!(events.recv().await.unwrap(), SinkEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_play_without_source_fails() {
        let factory = LocalSinkFactory::new(PlatformProfile::unconstrained()).unwrap();
        let sink = factory.create_sink().unwrap();
        assert!(matches!(sink.play().await, Err(PlayError::Load(_))));
    }

    #[test]
    fn test_second_analyser_rejected_until_disconnect() {
        let factory = LocalSinkFactory::new(PlatformProfile::unconstrained()).unwrap();
        let sink = factory.create_sink().unwrap();

        let graph = factory.attach_analyser(&sink).unwrap();
        assert!(matches!(
            factory.attach_analyser(&sink),
            Err(SinkError::GraphAlreadyAttached(id)) if id == sink.id()
        ));

        graph.disconnect().unwrap();
        assert!(graph.frequency_snapshot().is_empty());
        assert!(factory.attach_analyser(&sink).is_ok());
    }

    #[test]
    fn test_silent_source_decodes() {
        let factory = LocalSinkFactory::new(PlatformProfile::constrained()).unwrap();
        assert!(factory.silent_source().starts_with("data:audio/wav;base64,"));
        assert!(factory.profile().constrained);
    }
}
