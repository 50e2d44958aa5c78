//! Microphone capture using CPAL (Cross-Platform Audio Library).
//!
//! The input stream lives on a dedicated thread for its whole life; CPAL
//! streams are not `Send` on every platform, so the stream is created,
//! played and dropped on that one thread. The data callback runs the
//! [`ResamplingEncoder`] and pushes every finished frame into an unbounded
//! channel, so the real-time thread never waits on the network.

use crate::audio::encoder::ResamplingEncoder;
use crate::audio::frame::{dequantize, AudioFrame};
use crate::config::AudioConfig;
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A running microphone stream producing outbound frames.
///
/// ## Lifecycle:
/// `start()` either returns a fully running capture or an error with nothing
/// left behind. `stop()` (or dropping the value) ends the stream; calling it
/// more than once is fine.
pub struct MicrophoneCapture {
    device_name: String,
    native_rate: u32,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicrophoneCapture {
    /// Open the default input device and start streaming frames into `frames`.
    ///
    /// # Errors
    /// Returns `AppError::AudioDevice` if there is no input device, permission
    /// is denied, or the device format is unsupported.
    pub fn start(audio: &AudioConfig, frames: mpsc::UnboundedSender<AudioFrame>) -> AppResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<AppResult<(String, u32)>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();
        let target_rate = audio.capture_rate;
        let frame_duration_ms = audio.frame_duration_ms;

        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(target_rate, frame_duration_ms, frames) {
                    Ok((stream, device_name, native_rate)) => {
                        let _ = ready_tx.send(Ok((device_name, native_rate)));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                // Keep the thread alive and holding onto the stream until stop()
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| AppError::AudioDevice(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok((device_name, native_rate))) => {
                info!(device = %device_name, native_rate, target_rate, "Microphone capture started");
                Ok(Self {
                    device_name,
                    native_rate,
                    shutdown: Some(shutdown_tx),
                    thread: Some(handle),
                })
            }
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AppError::AudioDevice(
                    "Capture thread exited before the stream started".to_string(),
                ))
            }
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Stop capturing and release the device. Idempotent.
    pub fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(());
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        info!(device = %self.device_name, "Microphone capture stopped");
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build and play an input stream at the device's native format.
///
/// Only the first channel is used. Resampling happens in the encoder, so the
/// device is never asked for a rate it does not natively support.
fn open_input_stream(
    target_rate: u32,
    frame_duration_ms: u32,
    frames: mpsc::UnboundedSender<AudioFrame>,
) -> AppResult<(cpal::Stream, String, u32)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AppError::AudioDevice("No audio input device available".to_string()))?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = device
        .default_input_config()
        .map_err(|e| AppError::AudioDevice(format!("Failed to query default input config: {}", e)))?;

    let native_rate = supported.sample_rate().0;
    let channels = (supported.channels() as usize).max(1);
    let sample_format = supported.sample_format();
    let stream_config: cpal::StreamConfig = supported.into();

    let mut encoder = ResamplingEncoder::new(native_rate, target_rate, frame_duration_ms)?;
    let mut mono: Vec<f32> = Vec::new();

    let err_callback = |err| warn!("Audio input stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.iter().step_by(channels).copied());
                encoder.process(&mono, |frame| {
                    // Receiver gone means the session is ending
                    let _ = frames.send(frame);
                });
            },
            err_callback,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.iter().step_by(channels).map(|&s| dequantize(s)));
                encoder.process(&mono, |frame| {
                    let _ = frames.send(frame);
                });
            },
            err_callback,
            None,
        ),
        other => {
            return Err(AppError::AudioDevice(format!(
                "Unsupported input sample format: {:?}",
                other
            )))
        }
    }
    .map_err(|e| AppError::AudioDevice(format!("Failed to build input stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| AppError::AudioDevice(format!("Failed to start input stream: {}", e)))?;

    Ok((stream, device_name, native_rate))
}
