//! Frequency analyser for live level displays
//!
//! Collects the most recent PCM samples, runs a 64-point Hann-windowed
//! FFT and maps each of the 32 bins onto a byte (decibel range -100..-30),
//! with per-bin smoothing between frames. Snapshots are published on a watch
//! channel at ~30fps.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Analysis window length
pub const FFT_SIZE: usize = 64;

/// Number of frequency bins per snapshot
pub const BIN_COUNT: usize = FFT_SIZE / 2;

/// Weight of the previous frame in each bin
pub const SMOOTHING: f32 = 0.8;

pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;

/// Frame interval for ~30fps emission
pub const FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Sender type for analyser input samples
pub type SampleSender = mpsc::Sender<Vec<i16>>;

/// Receiver type for analyser input samples
pub type SampleReceiver = mpsc::Receiver<Vec<i16>>;

/// Create the channel that feeds [`run_spectrum_emitter`]
pub fn create_sample_channel() -> (SampleSender, SampleReceiver) {
    mpsc::channel(100)
}

/// Sliding-window spectrum analyser
pub struct SpectrumAnalyser {
    samples: VecDeque<f32>,
    smoothed: [f32; BIN_COUNT],
    window: [f32; FFT_SIZE],
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyser {
    pub fn new() -> Self {
        let mut window = [0.0f32; FFT_SIZE];
        for (n, w) in window.iter_mut().enumerate() {
            *w = 0.5 * (1.0 - (2.0 * PI * n as f32 / FFT_SIZE as f32).cos());
        }
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];
        Self {
            samples: VecDeque::from(vec![0.0; FFT_SIZE]),
            smoothed: [0.0; BIN_COUNT],
            window,
            fft,
            buffer: vec![Complex::default(); FFT_SIZE],
            scratch,
        }
    }

    /// Keep only the newest `FFT_SIZE` samples
    pub fn push_samples(&mut self, samples: &[i16]) {
        let len = samples.len();
        let tail = if len > FFT_SIZE { &samples[len - FFT_SIZE..] } else { samples };

        let overflow = (self.samples.len() + tail.len()).saturating_sub(FFT_SIZE);
        self.samples.drain(0..overflow);
        self.samples
            .extend(tail.iter().map(|&s| s as f32 / i16::MAX as f32));
    }

    /// Push float samples in the -1.0..1.0 range
    pub fn push_float_samples(&mut self, samples: &[f32]) {
        let len = samples.len();
        let tail = if len > FFT_SIZE { &samples[len - FFT_SIZE..] } else { samples };

        let overflow = (self.samples.len() + tail.len()).saturating_sub(FFT_SIZE);
        self.samples.drain(0..overflow);
        self.samples.extend(tail.iter().map(|s| s.clamp(-1.0, 1.0)));
    }

    /// Advance one frame and return the byte bins
    pub fn snapshot(&mut self) -> Vec<u8> {
        for ((slot, s), w) in self
            .buffer
            .iter_mut()
            .zip(self.samples.iter())
            .zip(self.window.iter())
        {
            *slot = Complex::new(s * w, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let mut bins = Vec::with_capacity(BIN_COUNT);
        for k in 0..BIN_COUNT {
            let magnitude = self.buffer[k].norm() / FFT_SIZE as f32;

            let smoothed = SMOOTHING * self.smoothed[k] + (1.0 - SMOOTHING) * magnitude;
            self.smoothed[k] = smoothed;
            bins.push(to_byte(smoothed));
        }
        bins
    }

    pub fn reset(&mut self) {
        self.samples.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed = [0.0; BIN_COUNT];
    }
}

impl Default for SpectrumAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 * (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS);
    scaled.clamp(0.0, 255.0) as u8
}

/// Run the spectrum emitter task at ~30fps
///
/// Drains the sample channel each frame, analyses the newest window and
/// publishes the bins. Exits on `stop` or when the sample channel closes.
/// Publishes an empty snapshot on exit.
pub async fn run_spectrum_emitter(
    mut rx: SampleReceiver,
    out: Arc<watch::Sender<Vec<u8>>>,
    stop: CancellationToken,
) {
    let mut analyser = SpectrumAnalyser::new();
    let mut tick = interval(FRAME_INTERVAL);

    log::debug!("Spectrum emitter started");

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                log::debug!("Spectrum emitter received stop signal");
                break;
            }
            _ = tick.tick() => {
                let mut closed = false;
                loop {
                    match rx.try_recv() {
                        Ok(samples) => analyser.push_samples(&samples),
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            closed = true;
                            break;
                        }
                    }
                }
                if closed {
                    break;
                }
                out.send_replace(analyser.snapshot());
            }
        }
    }

    analyser.reset();
    out.send_replace(Vec::new());
    log::debug!("Spectrum emitter stopped");
}
