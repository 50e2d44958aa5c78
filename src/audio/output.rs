//! Speaker output using CPAL.
//!
//! `SpeakerSink` is the device-backed [`AudioSink`]. Each `play()` call hands
//! one buffer to the output callback and resolves once the callback has
//! consumed the last sample, so the drain loop never overlaps buffers.
//!
//! ## Device format:
//! 24 kHz mono is requested first. Devices that refuse it are opened at their
//! default config instead, and buffers are fitted with nearest-sample rate
//! conversion plus channel duplication.

use crate::audio::frame::quantize;
use crate::audio::playback::AudioSink;
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// State shared with the real-time output callback.
#[derive(Default)]
struct OutputBuffer {
    /// Interleaved samples at the device rate and channel count
    samples: VecDeque<f32>,
    /// Fired when `samples` runs dry
    done: Option<oneshot::Sender<()>>,
}

impl OutputBuffer {
    /// Fill `out` from the pending samples, padding with silence.
    fn render(&mut self, out: &mut [f32]) {
        for slot in out.iter_mut() {
            *slot = self.samples.pop_front().unwrap_or(0.0);
        }
        if self.samples.is_empty() {
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
        }
    }
}

fn lock(buffer: &Mutex<OutputBuffer>) -> MutexGuard<'_, OutputBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Device-backed playback sink.
pub struct SpeakerSink {
    buffer: Arc<Mutex<OutputBuffer>>,
    device_rate: u32,
    device_channels: usize,
    shutdown: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl SpeakerSink {
    /// Open the default output device.
    ///
    /// # Errors
    /// Returns `AppError::AudioDevice` if no output device exists or no stream
    /// can be built.
    pub fn open(playback_rate: u32) -> AppResult<Self> {
        let buffer = Arc::new(Mutex::new(OutputBuffer::default()));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<AppResult<(u32, usize)>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let callback_buffer = buffer.clone();

        thread::Builder::new()
            .name("speaker-output".to_string())
            .spawn(move || {
                let stream = match open_output_stream(playback_rate, callback_buffer) {
                    Ok((stream, rate, channels)) => {
                        let _ = ready_tx.send(Ok((rate, channels)));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                // Block until release() to keep the output stream alive
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| AppError::AudioDevice(format!("Failed to spawn output thread: {}", e)))?;

        let (device_rate, device_channels) = ready_rx.recv().map_err(|_| {
            AppError::AudioDevice("Output thread exited before the stream started".to_string())
        })??;

        info!(device_rate, device_channels, "Speaker output opened");

        Ok(Self {
            buffer,
            device_rate,
            device_channels,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    pub fn device_channels(&self) -> usize {
        self.device_channels
    }

    fn is_released(&self) -> bool {
        self.shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl AudioSink for SpeakerSink {
    async fn play(&self, samples: Vec<f32>, sample_rate: u32) -> AppResult<()> {
        if self.is_released() {
            return Err(AppError::AudioDevice("Output device already released".to_string()));
        }

        let rendered = fit_to_device(&samples, sample_rate, self.device_rate, self.device_channels);
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut buffer = lock(&self.buffer);
            buffer.samples.extend(rendered);
            buffer.done = Some(done_tx);
        }

        done_rx.await.map_err(|_| {
            AppError::AudioDevice("Output stopped before the buffer finished".to_string())
        })
    }

    fn release(&self) {
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
            let mut buffer = lock(&self.buffer);
            buffer.samples.clear();
            buffer.done.take();
            info!("Speaker output released");
        }
    }
}

impl Drop for SpeakerSink {
    fn drop(&mut self) {
        self.release();
    }
}

/// Convert a mono buffer to the device's rate and channel layout.
///
/// Rate conversion picks the nearest earlier source sample for each output
/// sample; every mono sample is copied to all channels.
pub fn fit_to_device(samples: &[f32], source_rate: u32, device_rate: u32, channels: usize) -> Vec<f32> {
    let channels = channels.max(1);
    if samples.is_empty() || source_rate == 0 || device_rate == 0 {
        return Vec::new();
    }

    let out_len = (samples.len() as u64 * device_rate as u64 / source_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len * channels);

    for i in 0..out_len {
        let src = ((i as u64 * source_rate as u64) / device_rate as u64) as usize;
        let sample = samples[src.min(samples.len() - 1)];
        for _ in 0..channels {
            out.push(sample);
        }
    }

    out
}

/// Build and play an output stream, preferring the playback rate in mono.
fn open_output_stream(
    playback_rate: u32,
    buffer: Arc<Mutex<OutputBuffer>>,
) -> AppResult<(cpal::Stream, u32, usize)> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AppError::AudioDevice("No audio output device available".to_string()))?;

    let err_callback = |err| warn!("Audio output stream error: {}", err);

    let preferred = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(playback_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let preferred_buffer = buffer.clone();
    if let Ok(stream) = device.build_output_stream(
        &preferred,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            lock(&preferred_buffer).render(data);
        },
        err_callback,
        None,
    ) {
        stream
            .play()
            .map_err(|e| AppError::AudioDevice(format!("Failed to start output stream: {}", e)))?;
        return Ok((stream, playback_rate, 1));
    }

    // Fallback: device default config, conversion happens in fit_to_device
    let supported = device
        .default_output_config()
        .map_err(|e| AppError::AudioDevice(format!("Failed to query default output config: {}", e)))?;
    let device_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.into();

    warn!(
        device_rate,
        channels,
        ?sample_format,
        "Output device refused {} Hz mono, converting in software",
        playback_rate
    );

    let stream = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                lock(&buffer).render(data);
            },
            err_callback,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    lock(&buffer).render(&mut scratch);
                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = quantize(sample);
                    }
                },
                err_callback,
                None,
            )
        }
        other => {
            return Err(AppError::AudioDevice(format!(
                "Unsupported output sample format: {:?}",
                other
            )))
        }
    }
    .map_err(|e| AppError::AudioDevice(format!("Failed to build output stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| AppError::AudioDevice(format!("Failed to start output stream: {}", e)))?;

    Ok((stream, device_rate, channels))
}
