//! WAV encoding and decoding with hound

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use super::source::SourceError;

/// Decoded PCM, interleaved `f32` in -1.0..1.0
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Encode mono or interleaved PCM16 into a WAV file in memory
pub fn encode_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Result<Vec<u8>, hound::Error> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decode 8/16/24/32-bit integer or 32-bit float WAV
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio, SourceError> {
    let reader = WavReader::new(Cursor::new(bytes)).map_err(|e| SourceError::Decode(e.to_string()))?;
    let spec = reader.spec();

    let samples: Result<Vec<f32>, hound::Error> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect(),
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect()
        }
    };
    let samples = samples.map_err(|e| SourceError::Decode(e.to_string()))?;

    Ok(DecodedAudio {
        samples,
        channels: spec.channels,
        sample_rate: spec.sample_rate,
    })
}

/// `data:` URI of a short silent WAV, used to unlock output
pub fn silent_wav_data_uri() -> String {
    // 100ms of 8kHz mono silence
    match encode_wav(&[0; 800], 8000, 1) {
        Ok(bytes) => format!("data:audio/wav;base64,{}", STANDARD.encode(bytes)),
        Err(e) => {
            log::warn!("Failed to encode silent WAV: {}", e);
            "data:audio/wav;base64,".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_then_decode_pcm16() {
        let bytes = encode_wav(&[0, i16::MAX, i16::MIN, 0], 16000, 1).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");

        let audio = decode_wav(&bytes).unwrap();
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.frames(), 4);
        assert!((audio.samples[1] - 1.0).abs() < 0.001);
        assert_eq!(audio.samples[2], -1.0);
    }

    #[test]
    fn test_duration_counts_frames_not_samples() {
        let bytes = encode_wav(&[0; 16000], 8000, 2).unwrap();
        let audio = decode_wav(&bytes).unwrap();
        assert_eq!(audio.frames(), 8000);
        assert!((audio.duration_seconds() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_wav(b"not a wav"), Err(SourceError::Decode(_))));
    }

    #[test]
    fn test_silent_data_uri() {
        let uri = silent_wav_data_uri();
        assert!(uri.starts_with("data:audio/wav;base64,UklGR"));
    }
}
