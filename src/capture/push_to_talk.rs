//! Push-to-talk capture controller
//!
//! States: Idle -> Recording -> Processing -> Idle. The microphone and the
//! spectrum emitter are released on every exit path, and nothing is emitted
//! for a capture that failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    CaptureConfig, CaptureError, CaptureEvent, CaptureState, CapturedAudio, MicrophoneSource,
    MicrophoneStream,
};
use crate::audio::spectrum::{create_sample_channel, run_spectrum_emitter, SampleSender};
use crate::audio::wav::encode_wav;

const EVENT_CAPACITY: usize = 32;

/// Samples collected by one capture
struct Recording {
    samples: Vec<i16>,
    sample_rate: u32,
}

struct ActiveCapture {
    stop: CancellationToken,
    collector: JoinHandle<Recording>,
    spectrum: JoinHandle<()>,
}

/// Records the microphone between start and stop
pub struct PushToTalkCapture {
    microphone: Arc<dyn MicrophoneSource>,
    config: CaptureConfig,
    state: watch::Sender<CaptureState>,
    events: broadcast::Sender<CaptureEvent>,
    spectrum: Arc<watch::Sender<Vec<u8>>>,
    active: Mutex<Option<ActiveCapture>>,
}

impl PushToTalkCapture {
    pub fn new(microphone: Arc<dyn MicrophoneSource>, config: CaptureConfig) -> Self {
        let (state, _) = watch::channel(CaptureState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (spectrum, _) = watch::channel(Vec::new());
        Self {
            microphone,
            config,
            state,
            events,
            spectrum: Arc::new(spectrum),
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Open the microphone and start recording. Returns the capture sample rate.
    ///
    /// Each frame is also offered to `forward` when given; a full or closed
    /// forward channel never interrupts the recording.
    pub async fn start_capture(
        &self,
        forward: Option<mpsc::Sender<Vec<i16>>>,
    ) -> Result<u32, CaptureError> {
        let mut active = self.active.lock().await;
        if active.is_some() || *self.state.borrow() != CaptureState::Idle {
            return Err(CaptureError::AlreadyCapturing);
        }

        let stream = match self.microphone.open().await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("PushToTalk: failed to open microphone: {}", e);
                self.emit(CaptureEvent::Failed(e.to_string()));
                return Err(e);
            }
        };
        let sample_rate = stream.sample_rate;

        let (analyser_tx, analyser_rx) = create_sample_channel();
        let stop = CancellationToken::new();
        let spectrum = tokio::spawn(run_spectrum_emitter(
            analyser_rx,
            Arc::clone(&self.spectrum),
            stop.child_token(),
        ));
        let collector = tokio::spawn(collect(
            stream,
            analyser_tx,
            forward,
            self.config.max_duration,
            self.events.clone(),
            stop.clone(),
        ));

        *active = Some(ActiveCapture {
            stop,
            collector,
            spectrum,
        });
        self.state.send_replace(CaptureState::Recording);
        log::info!("PushToTalk: recording started ({} Hz)", sample_rate);
        self.emit(CaptureEvent::Started { sample_rate });
        Ok(sample_rate)
    }

    /// Stop recording and assemble the payload.
    ///
    /// Returns `None` when nothing was recording or the capture fell below
    /// the size or duration floor.
    pub async fn stop_capture(&self) -> Result<Option<CapturedAudio>, CaptureError> {
        let Some(capture) = self.active.lock().await.take() else {
            return Ok(None);
        };
        self.state.send_replace(CaptureState::Processing);

        let result = self.finish(capture).await;
        self.state.send_replace(CaptureState::Idle);

        match result {
            Ok(Some(audio)) => {
                log::info!(
                    "PushToTalk: capture complete ({} bytes, {:?})",
                    audio.bytes.len(),
                    audio.duration
                );
                self.emit(CaptureEvent::Completed(audio.clone()));
                Ok(Some(audio))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                log::error!("PushToTalk: {}", e);
                self.emit(CaptureEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn finish(&self, capture: ActiveCapture) -> Result<Option<CapturedAudio>, CaptureError> {
        let recording = release(capture)
            .await
            .map_err(|e| CaptureError::TaskFailed(e.to_string()))?;

        let duration = if recording.sample_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(
                recording.samples.len() as u64 * 1_000_000 / recording.sample_rate as u64,
            )
        };
        let bytes = encode_wav(&recording.samples, recording.sample_rate, 1)
            .map_err(|e| CaptureError::Encode(e.to_string()))?;

        if bytes.len() < self.config.min_bytes || duration < self.config.min_duration {
            log::info!(
                "PushToTalk: discarding capture ({} bytes, {:?})",
                bytes.len(),
                duration
            );
            self.emit(CaptureEvent::Discarded {
                bytes: bytes.len(),
                duration,
            });
            return Ok(None);
        }

        Ok(Some(CapturedAudio {
            bytes,
            mime_type: "audio/wav".to_string(),
            duration,
            sample_rate: recording.sample_rate,
            captured_at: Utc::now(),
        }))
    }

    /// Stop recording and drop the audio
    pub async fn cancel_capture(&self) {
        let Some(capture) = self.active.lock().await.take() else {
            return;
        };
        if let Err(e) = release(capture).await {
            log::warn!("PushToTalk: capture task failed during cancel: {}", e);
        }
        self.state.send_replace(CaptureState::Idle);
        log::info!("PushToTalk: capture cancelled");
        self.emit(CaptureEvent::Cancelled);
    }

    pub fn state(&self) -> CaptureState {
        *self.state.borrow()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == CaptureState::Recording
    }

    pub fn watch_state(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }

    /// Live frequency bins; empty while idle
    pub fn spectrum(&self) -> watch::Receiver<Vec<u8>> {
        self.spectrum.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CaptureEvent) {
        let _ = self.events.send(event);
    }
}

/// Stop both tasks. The collector owns the microphone stream, so joining it
/// releases the device.
async fn release(capture: ActiveCapture) -> Result<Recording, tokio::task::JoinError> {
    capture.stop.cancel();
    let recording = capture.collector.await;
    if let Err(e) = capture.spectrum.await {
        log::warn!("PushToTalk: spectrum task failed: {}", e);
    }
    recording
}

/// Frame sink for one capture
struct Collector {
    samples: Vec<i16>,
    max_samples: usize,
    limit_reached: bool,
    analyser: SampleSender,
    forward: Option<mpsc::Sender<Vec<i16>>>,
    events: broadcast::Sender<CaptureEvent>,
}

impl Collector {
    fn push(&mut self, frame: &[i16]) {
        if self.limit_reached {
            return;
        }

        let room = self.max_samples.saturating_sub(self.samples.len());
        let kept = &frame[..frame.len().min(room)];
        self.samples.extend_from_slice(kept);
        let _ = self.analyser.try_send(kept.to_vec());
        if let Some(forward) = &self.forward {
            let _ = forward.try_send(kept.to_vec());
        }

        if self.samples.len() >= self.max_samples {
            self.limit_reached = true;
            log::info!("PushToTalk: maximum duration reached");
            let _ = self.events.send(CaptureEvent::MaxDurationReached);
        }
    }
}

/// Pull frames until stopped or the microphone ends. Frames already
/// delivered when the stop arrives are kept.
async fn collect(
    mut stream: MicrophoneStream,
    analyser: SampleSender,
    forward: Option<mpsc::Sender<Vec<i16>>>,
    max_duration: Duration,
    events: broadcast::Sender<CaptureEvent>,
    stop: CancellationToken,
) -> Recording {
    let sample_rate = stream.sample_rate;
    let mut collector = Collector {
        samples: Vec::new(),
        max_samples: (max_duration.as_millis() as u64 * sample_rate as u64 / 1000) as usize,
        limit_reached: false,
        analyser,
        forward,
        events,
    };

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                while let Ok(frame) = stream.frames.try_recv() {
                    collector.push(&frame);
                }
                break;
            }
            frame = stream.frames.recv() => match frame {
                Some(frame) => collector.push(&frame),
                None => {
                    log::warn!("PushToTalk: microphone stream ended");
                    break;
                }
            },
        }
    }

    stream.close();
    Recording {
        samples: collector.samples,
        sample_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ScriptedMicrophone;

    fn capture_with(mic: &ScriptedMicrophone, config: CaptureConfig) -> PushToTalkCapture {
        PushToTalkCapture::new(Arc::new(mic.clone()), config)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_capture_produces_wav() {
        let mic = ScriptedMicrophone::new(16000);
        let capture = capture_with(&mic, CaptureConfig::default());
        let mut events = capture.subscribe();

        assert_eq!(capture.start_capture(None).await.unwrap(), 16000);
        assert!(capture.is_recording());
        assert!(mic.is_open());
        assert_eq!(events.recv().await.unwrap(), CaptureEvent::Started { sample_rate: 16000 });

        // 0.6s of audio
        for _ in 0..6 {
            assert!(mic.push(vec![100; 1600]).await);
        }
        settle().await;

        let audio = capture.stop_capture().await.unwrap().unwrap();
        assert_eq!(audio.mime_type, "audio/wav");
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.duration, Duration::from_millis(600));
        assert_eq!(&audio.bytes[0..4], b"RIFF");
        assert_eq!(audio.bytes.len(), 44 + 9600 * 2);

        assert!(!mic.is_open());
        assert_eq!(capture.state(), CaptureState::Idle);
        assert!(matches!(events.recv().await.unwrap(), CaptureEvent::Completed(_)));
    }

    #[tokio::test]
    async fn test_short_capture_is_discarded() {
        let mic = ScriptedMicrophone::new(16000);
        let capture = capture_with(&mic, CaptureConfig::default());
        let mut events = capture.subscribe();

        capture.start_capture(None).await.unwrap();
        mic.push(vec![100; 1600]).await;
        settle().await;

        assert_eq!(capture.stop_capture().await.unwrap(), None);
        events.recv().await.unwrap(); // Started
        assert_eq!(
            events.recv().await.unwrap(),
            CaptureEvent::Discarded {
                bytes: 44 + 3200,
                duration: Duration::from_millis(100)
            }
        );
        assert!(!mic.is_open());
    }

    #[tokio::test]
    async fn test_size_floor_applies_independently() {
        let mic = ScriptedMicrophone::new(1000);
        let config = CaptureConfig {
            min_bytes: 4096,
            ..CaptureConfig::default()
        };
        let capture = capture_with(&mic, config);

        capture.start_capture(None).await.unwrap();
        // 1s at 1kHz = 2000 bytes of PCM, below the floor
        mic.push(vec![1; 1000]).await;
        settle().await;
        assert_eq!(capture.stop_capture().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_failure_is_surfaced() {
        let mic = ScriptedMicrophone::new(16000);
        mic.fail_next_open(CaptureError::Microphone("denied".to_string()));
        let capture = capture_with(&mic, CaptureConfig::default());
        let mut events = capture.subscribe();

        let err = capture.start_capture(None).await.unwrap_err();
        assert_eq!(err, CaptureError::Microphone("denied".to_string()));
        assert_eq!(capture.state(), CaptureState::Idle);
        assert!(matches!(events.recv().await.unwrap(), CaptureEvent::Failed(_)));
        assert_eq!(capture.stop_capture().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let mic = ScriptedMicrophone::new(16000);
        let capture = capture_with(&mic, CaptureConfig::default());
        capture.start_capture(None).await.unwrap();
        assert_eq!(
            capture.start_capture(None).await.unwrap_err(),
            CaptureError::AlreadyCapturing
        );
        capture.cancel_capture().await;
    }

    #[tokio::test]
    async fn test_max_duration_ignores_later_audio() {
        let mic = ScriptedMicrophone::new(1000);
        let config = CaptureConfig {
            min_bytes: 0,
            min_duration: Duration::ZERO,
            max_duration: Duration::from_secs(2),
        };
        let capture = capture_with(&mic, config);
        let mut events = capture.subscribe();

        capture.start_capture(None).await.unwrap();
        mic.push(vec![1; 1500]).await;
        mic.push(vec![1; 1500]).await;
        mic.push(vec![1; 1500]).await;
        settle().await;

        let audio = capture.stop_capture().await.unwrap().unwrap();
        assert_eq!(audio.duration, Duration::from_secs(2));

        events.recv().await.unwrap(); // Started
        assert_eq!(events.recv().await.unwrap(), CaptureEvent::MaxDurationReached);
    }

    #[tokio::test]
    async fn test_frames_are_forwarded() {
        let mic = ScriptedMicrophone::new(16000);
        let capture = capture_with(&mic, CaptureConfig::default());
        let (tx, mut rx) = mpsc::channel(8);

        capture.start_capture(Some(tx)).await.unwrap();
        mic.push(vec![7; 160]).await;
        assert_eq!(rx.recv().await.unwrap(), vec![7; 160]);

        capture.cancel_capture().await;
        // Forward sender is dropped with the collector
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_releases_and_emits_nothing_else() {
        let mic = ScriptedMicrophone::new(16000);
        let capture = capture_with(&mic, CaptureConfig::default());
        let mut events = capture.subscribe();

        capture.start_capture(None).await.unwrap();
        mic.push(vec![1; 16000]).await;
        capture.cancel_capture().await;

        assert!(!mic.is_open());
        assert_eq!(capture.state(), CaptureState::Idle);
        events.recv().await.unwrap(); // Started
        assert_eq!(events.recv().await.unwrap(), CaptureEvent::Cancelled);
        assert_eq!(capture.stop_capture().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unplugged_microphone_ends_recording_cleanly() {
        let mic = ScriptedMicrophone::new(16000);
        let capture = capture_with(&mic, CaptureConfig::default());

        capture.start_capture(None).await.unwrap();
        for _ in 0..10 {
            mic.push(vec![5; 1600]).await;
        }
        mic.unplug();
        settle().await;

        let audio = capture.stop_capture().await.unwrap().unwrap();
        assert_eq!(audio.duration, Duration::from_secs(1));
        assert!(!mic.is_open());
    }
}
