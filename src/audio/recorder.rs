//! Microphone input using CPAL
//!
//! The input stream lives on a dedicated thread (CPAL streams are not
//! `Send`). The callback downmixes to mono PCM16 and hands frames to the
//! capture task over a bounded channel; frames are dropped rather than
//! blocking the audio thread when the channel is full.

use std::sync::mpsc as std_mpsc;
use std::thread;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use crate::capture::{CaptureError, MicrophoneSource, MicrophoneStream};

/// Frames buffered between the audio thread and the capture task
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Default input device
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMicrophone;

impl LocalMicrophone {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MicrophoneSource for LocalMicrophone {
    async fn open(&self) -> Result<MicrophoneStream, CaptureError> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel();

        thread::Builder::new()
            .name("voxsync-microphone".to_string())
            .spawn(move || {
                let (stream, sample_rate) = match build_input_stream(frames_tx) {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = started_tx.send(Err(e));
                        return;
                    }
                };
                let _ = started_tx.send(Ok(sample_rate));
                // Blocks until the capture releases the device
                let _ = shutdown_rx.recv();
                drop(stream);
                log::info!("Microphone released");
            })
            .map_err(|e| CaptureError::Microphone(e.to_string()))?;

        let sample_rate = started_rx
            .await
            .map_err(|_| CaptureError::Microphone("input thread exited".to_string()))??;

        Ok(MicrophoneStream::new(sample_rate, frames_rx, move || {
            let _ = shutdown_tx.send(());
        }))
    }
}

fn build_input_stream(
    frames: mpsc::Sender<Vec<i16>>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|e| CaptureError::Microphone(e.to_string()))?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, frames),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, frames),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, frames),
        other => Err(CaptureError::Microphone(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| CaptureError::Microphone(format!("Failed to start stream: {}", e)))?;

    Ok((stream, sample_rate))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    frames: mpsc::Sender<Vec<i16>>,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix_to_i16(data, channels);
                // Full channel: drop the frame rather than block the audio thread
                let _ = frames.try_send(mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::Microphone(e.to_string()))
}

/// Average interleaved channels into mono PCM16
fn downmix_to_i16<T>(data: &[T], channels: usize) -> Vec<i16>
where
    T: Copy,
    f32: cpal::FromSample<T>,
{
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame
                .iter()
                .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                .sum();
            sample_to_i16(sum / frame.len() as f32)
        })
        .collect()
}

/// Convert a float sample to i16, clamping out-of-range input.
fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0), 0);
        assert_eq!(sample_to_i16(1.0), i16::MAX);
        assert_eq!(sample_to_i16(-1.0), -i16::MAX);

        // Test clamping
        assert_eq!(sample_to_i16(2.0), i16::MAX);
        assert_eq!(sample_to_i16(-2.0), -i16::MAX);
    }

    #[test]
    fn test_downmix_stereo() {
        let data = [1.0f32, 0.0, -0.5, -0.5];
        let mono = downmix_to_i16(&data, 2);
        assert_eq!(mono, vec![sample_to_i16(0.5), sample_to_i16(-0.5)]);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let data = [i16::MAX, 0, i16::MIN + 1];
        let mono = downmix_to_i16(&data, 1);
        assert_eq!(mono.len(), 3);
        assert_eq!(mono[1], 0);
    }
}
