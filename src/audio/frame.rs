//! # Audio Frames
//!
//! An `AudioFrame` is an immutable buffer of 16-bit little-endian PCM samples,
//! mono, at a fixed sample rate. Outbound frames (16 kHz, 20 ms) come from the
//! resampling encoder; inbound frames (24 kHz, service-chosen size) come from
//! base64 payloads inside server envelopes.
//!
//! ## Format:
//! - **Bit Depth**: 16-bit PCM, little-endian signed integers
//! - **Channels**: Mono (1 channel)
//! - **Normalization**: `sample / 32768` when converting to floating point

use crate::error::{AppError, AppResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// One chunk of mono PCM16 audio.
///
/// ## Ownership:
/// Frames are moved (never cloned) from producer to consumer, so each frame
/// is consumed exactly once: sent upstream, or handed to the output device.
#[derive(Debug, PartialEq, Eq)]
pub struct AudioFrame {
    /// Raw little-endian sample bytes; length is always even
    bytes: Vec<u8>,

    /// Samples per second
    sample_rate: u32,
}

impl AudioFrame {
    /// Build a frame from already-quantized samples.
    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            // Writing into a Vec cannot fail
            let _ = bytes.write_i16::<LittleEndian>(sample);
        }

        Self { bytes, sample_rate }
    }

    /// Wrap raw PCM16 bytes received from the network.
    ///
    /// ## Validation:
    /// - Data must not be empty
    /// - Length must be even (whole 16-bit samples)
    pub fn from_bytes(bytes: Vec<u8>, sample_rate: u32) -> AppResult<Self> {
        if bytes.is_empty() {
            return Err(AppError::Protocol("No audio data provided".to_string()));
        }
        if bytes.len() % 2 != 0 {
            return Err(AppError::Protocol(format!(
                "Audio data length must be even for 16-bit samples, got {} bytes",
                bytes.len()
            )));
        }

        Ok(Self { bytes, sample_rate })
    }

    /// Decode a base64 payload from an inbound envelope.
    pub fn from_base64(payload: &str, sample_rate: u32) -> AppResult<Self> {
        let bytes = BASE64.decode(payload)?;
        Self::from_bytes(bytes, sample_rate)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / 2
    }

    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sample_count() as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Read back the signed 16-bit samples.
    pub fn samples(&self) -> Vec<i16> {
        let mut cursor = Cursor::new(&self.bytes);
        let mut samples = Vec::with_capacity(self.sample_count());

        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }

        samples
    }

    /// Normalized floating-point samples ready for an output device.
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples().into_iter().map(dequantize).collect()
    }
}

/// Convert a float sample to PCM16.
///
/// Clamps to [-1, 1], then scales asymmetrically: negative values by 32768,
/// non-negative values by 32767, so both full-scale ends map exactly onto
/// `i16::MIN` and `i16::MAX`.
pub fn quantize(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Convert a PCM16 sample back to a float in [-1, 1).
pub fn dequantize(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_full_scale() {
        assert_eq!(quantize(-1.0), i16::MIN);
        assert_eq!(quantize(1.0), i16::MAX);
        assert_eq!(quantize(0.0), 0);
        // Out-of-range input is clamped, never wraps
        assert_eq!(quantize(3.5), i16::MAX);
        assert_eq!(quantize(-7.0), i16::MIN);
    }

    #[test]
    fn test_quantize_round_trip_half() {
        let back = dequantize(quantize(0.5));
        assert!((back - 0.5).abs() <= 1.0 / 32768.0, "got {}", back);

        let back = dequantize(quantize(-0.5));
        assert!((back + 0.5).abs() <= 1.0 / 32768.0, "got {}", back);
    }

    #[test]
    fn test_frame_bytes_are_little_endian() {
        let frame = AudioFrame::from_samples(&[1, -2, 0x1234], 16000);
        assert_eq!(frame.as_bytes(), &[0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
        assert_eq!(frame.samples(), vec![1, -2, 0x1234]);
        assert_eq!(frame.sample_count(), 3);
    }

    #[test]
    fn test_from_bytes_validation() {
        assert!(AudioFrame::from_bytes(vec![], 24000).is_err());
        assert!(AudioFrame::from_bytes(vec![0u8; 15], 24000).is_err());
        assert!(AudioFrame::from_bytes(vec![0u8; 16], 24000).is_ok());
    }

    #[test]
    fn test_base64_decode_and_normalize() {
        let source = AudioFrame::from_samples(&[16384, -32768, 0], 24000);
        let decoded = AudioFrame::from_base64(&source.to_base64(), 24000).unwrap();

        assert_eq!(decoded.to_f32(), vec![0.5, -1.0, 0.0]);
        assert!(AudioFrame::from_base64("%%%", 24000).is_err());
    }

    #[test]
    fn test_duration() {
        let frame = AudioFrame::from_samples(&[0; 320], 16000);
        assert!((frame.duration_ms() - 20.0).abs() < f64::EPSILON);
    }
}
