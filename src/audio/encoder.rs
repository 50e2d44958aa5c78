//! # Resampling Encoder
//!
//! Turns the microphone's native-rate float stream into fixed-size PCM16
//! frames at the outbound rate. Runs on the real-time capture thread, so it
//! never blocks, never does I/O, and hands every finished frame to a callback
//! immediately.
//!
//! ## Stages:
//! 1. **Decimation**: nearest-sample downsampling with an accumulating ratio counter
//! 2. **Quantization**: clamp + asymmetric scaling to signed 16-bit
//! 3. **Chunking**: release exact multiples of the frame size, carry the remainder

use crate::audio::frame::{quantize, AudioFrame};
use crate::error::{AppError, AppResult};

/// Nearest-sample decimator.
///
/// ## Algorithm:
/// `ratio = source_rate / target_rate`. Every input sample adds 1 to the
/// counter; when the counter reaches `ratio` the current sample is emitted and
/// `ratio` is subtracted. The counter survives across calls, so chunk
/// boundaries never change the output. No anti-aliasing filter is applied.
#[derive(Debug, Clone)]
pub struct Downsampler {
    ratio: f64,
    counter: f64,
}

impl Downsampler {
    /// Create a decimator; only downsampling (or pass-through) is supported.
    pub fn new(source_rate: u32, target_rate: u32) -> AppResult<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(AppError::ValidationError(
                "Sample rates must be greater than 0".to_string(),
            ));
        }
        if source_rate < target_rate {
            return Err(AppError::ValidationError(format!(
                "Cannot downsample from {} Hz to a higher rate of {} Hz",
                source_rate, target_rate
            )));
        }

        Ok(Self {
            ratio: source_rate as f64 / target_rate as f64,
            counter: 0.0,
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Append the decimated samples of `input` to `output`.
    pub fn process(&mut self, input: &[f32], output: &mut Vec<f32>) {
        for &sample in input {
            self.counter += 1.0;
            if self.counter >= self.ratio {
                output.push(sample);
                self.counter -= self.ratio;
            }
        }
    }

    pub fn reset(&mut self) {
        self.counter = 0.0;
    }
}

/// Accumulates quantized samples and releases them in whole frames.
#[derive(Debug, Clone)]
pub struct FrameChunker {
    frame_samples: usize,
    sample_rate: u32,
    pending: Vec<i16>,
}

impl FrameChunker {
    pub fn new(frame_samples: usize, sample_rate: u32) -> Self {
        Self {
            frame_samples,
            sample_rate,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Add samples and emit every complete frame; the remainder stays buffered.
    pub fn push(&mut self, samples: &[i16], mut emit: impl FnMut(AudioFrame)) {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_samples * self.frame_samples;
        if complete == 0 {
            return;
        }

        for chunk in self.pending[..complete].chunks_exact(self.frame_samples) {
            emit(AudioFrame::from_samples(chunk, self.sample_rate));
        }
        self.pending.drain(..complete);
    }

    /// Samples waiting for the next frame boundary.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Full capture-side pipeline: decimate → quantize → chunk.
///
/// ## Usage:
/// ```rust
/// use live_voice_relay::audio::encoder::ResamplingEncoder;
///
/// let mut encoder = ResamplingEncoder::new(48000, 16000, 20).unwrap();
/// let mut frames = Vec::new();
/// encoder.process(&vec![0.25f32; 48000 / 50], |frame| frames.push(frame));
/// assert_eq!(frames.len(), 1);
/// assert_eq!(frames[0].sample_count(), 320);
/// ```
#[derive(Debug, Clone)]
pub struct ResamplingEncoder {
    downsampler: Downsampler,
    chunker: FrameChunker,
    /// Reused between callbacks to avoid allocating on the audio thread
    scratch: Vec<f32>,
    quantized: Vec<i16>,
}

impl ResamplingEncoder {
    /// ## Parameters:
    /// - **source_rate**: native capture rate (e.g. 48000)
    /// - **target_rate**: outbound rate (16000)
    /// - **frame_duration_ms**: frame length (20 ms → 320 samples at 16 kHz)
    pub fn new(source_rate: u32, target_rate: u32, frame_duration_ms: u32) -> AppResult<Self> {
        let frame_samples = (target_rate as u64 * frame_duration_ms as u64 / 1000) as usize;
        if frame_samples == 0 {
            return Err(AppError::ValidationError(format!(
                "Frame of {} ms at {} Hz contains no samples",
                frame_duration_ms, target_rate
            )));
        }

        Ok(Self {
            downsampler: Downsampler::new(source_rate, target_rate)?,
            chunker: FrameChunker::new(frame_samples, target_rate),
            scratch: Vec::new(),
            quantized: Vec::new(),
        })
    }

    /// Process one capture callback worth of mono samples.
    ///
    /// An empty slice (no channel data this cycle) is a no-op.
    pub fn process(&mut self, input: &[f32], emit: impl FnMut(AudioFrame)) {
        if input.is_empty() {
            return;
        }

        self.scratch.clear();
        self.downsampler.process(input, &mut self.scratch);

        self.quantized.clear();
        self.quantized.extend(self.scratch.iter().map(|&s| quantize(s)));

        self.chunker.push(&self.quantized, emit);
    }

    /// Convenience wrapper collecting emitted frames.
    pub fn process_to_vec(&mut self, input: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        self.process(input, |frame| frames.push(frame));
        frames
    }

    pub fn frame_samples(&self) -> usize {
        self.chunker.frame_samples()
    }

    pub fn pending_samples(&self) -> usize {
        self.chunker.pending()
    }

    /// Drop buffered state, e.g. when capture restarts.
    pub fn reset(&mut self) {
        self.downsampler.reset();
        self.chunker.clear();
    }
}
