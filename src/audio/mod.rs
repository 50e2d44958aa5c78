//! # Audio Pipeline
//!
//! Client-side halves of the streaming pipeline: capture-side encoding and
//! playback-side scheduling. The relay itself never decodes audio.
//!
//! ## Key Components:
//! - **Frame**: immutable PCM16 buffer plus (de)quantization helpers
//! - **Encoder**: decimation, quantization and fixed-size chunking on the capture thread
//! - **Playback**: per-session queue and single drain loop with barge-in flush
//! - **Capture / Output**: cpal-backed microphone and speaker (feature `audio-device`)
//!
//! ## Audio Format Requirements:
//! - **Outbound**: 16 kHz, 16-bit PCM, mono, 20 ms frames (320 samples)
//! - **Inbound**: 24 kHz, 16-bit PCM, mono, frame size chosen by the service

pub mod encoder;
pub mod frame;
pub mod playback;

#[cfg(feature = "audio-device")]
pub mod capture;
#[cfg(feature = "audio-device")]
pub mod output;

pub use encoder::ResamplingEncoder;
pub use frame::AudioFrame;
pub use playback::{AudioSink, PlaybackScheduler, SessionEvent};

/// Outbound sample rate expected by the remote service
pub const CAPTURE_RATE: u32 = 16_000;

/// Outbound frame length
pub const FRAME_DURATION_MS: u32 = 20;

/// Rate of the PCM the remote service sends back
pub const PLAYBACK_RATE: u32 = 24_000;
