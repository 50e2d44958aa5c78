//! # Voice Client Session
//!
//! The client end of one relay session: a WebSocket to the relay, a writer
//! task that drains outbound envelopes, and a reader task that feeds every
//! inbound envelope to the [`PlaybackScheduler`].
//!
//! ## Data Flow:
//! - **Outbound**: `send_frame` / `send_text` / `forward_frames` → writer task → relay
//! - **Inbound**: relay → reader task → `ServerEnvelope::parse` → scheduler
//!
//! ## Cancellation:
//! `stop()` closes the WebSocket, halts the drain loop, clears the queue and
//! releases the output device. It is idempotent, and a relay-side close runs
//! the same teardown.

use crate::audio::frame::AudioFrame;
use crate::audio::playback::{AudioSink, PlaybackScheduler, PlaybackStatsSnapshot, SessionEvent};
use crate::config::AudioConfig;
use crate::error::{AppError, AppResult};
use crate::protocol::{ClientEnvelope, ServerEnvelope};

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Capacity of the observer event channel; slow observers lose old events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One live client session against the relay.
pub struct VoiceClient<S: AudioSink> {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    scheduler: Arc<PlaybackScheduler<S>>,
    events: broadcast::Sender<SessionEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl<S: AudioSink> VoiceClient<S> {
    /// Connect to the relay at `url` and start the reader and writer tasks.
    ///
    /// ## Returns:
    /// The client plus an event receiver subscribed before any traffic, so
    /// the `Ready` event for the session is never missed.
    pub async fn connect(
        url: &str,
        sink: S,
        audio: &AudioConfig,
    ) -> AppResult<(Self, broadcast::Receiver<SessionEvent>)> {
        let (stream, _response) = connect_async(url).await?;
        let (mut write, mut read) = stream.split();
        info!(url, "Connected to relay");

        let (events, first_receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let scheduler = Arc::new(PlaybackScheduler::new(
            sink,
            audio.playback_rate,
            audio.drain_idle(),
            events.clone(),
        ));
        let stopped = Arc::new(AtomicBool::new(false));

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(err) = write.send(message).await {
                    warn!(error = %err, "Failed to send to relay");
                    break;
                }
            }
            // Best effort; the relay may already be gone
            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
        });

        let reader_scheduler = scheduler.clone();
        let reader_events = events.clone();
        let reader_stopped = stopped.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => dispatch(&reader_scheduler, text.as_bytes()),
                    Ok(Message::Binary(data)) => dispatch(&reader_scheduler, &data),
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Relay closed the session");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "Relay connection error");
                        let _ = reader_events.send(SessionEvent::Error {
                            error: "transport_error".to_string(),
                            detail: err.to_string(),
                        });
                        break;
                    }
                }
            }

            if !reader_stopped.swap(true, Ordering::AcqRel) {
                reader_scheduler.stop();
                let _ = reader_events.send(SessionEvent::Closed);
            }
        });

        let client = Self {
            outbound: Mutex::new(Some(outbound)),
            scheduler,
            events,
            reader: Mutex::new(Some(reader)),
            forwarders: Mutex::new(Vec::new()),
            stopped,
        };

        Ok((client, first_receiver))
    }

    fn outbound(&self) -> AppResult<mpsc::UnboundedSender<Message>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| AppError::Upstream("Voice session is stopped".to_string()))
    }

    fn send(&self, message: Message) -> AppResult<()> {
        self.outbound()?
            .send(message)
            .map_err(|_| AppError::Upstream("Relay connection is closed".to_string()))
    }

    /// Send one capture frame as a realtime-audio envelope.
    pub fn send_frame(&self, frame: &AudioFrame) -> AppResult<()> {
        self.send(Message::Text(ClientEnvelope::realtime_audio(frame).to_json()?))
    }

    /// Send one capture frame as raw PCM16; the relay wraps it.
    pub fn send_raw_frame(&self, frame: AudioFrame) -> AppResult<()> {
        self.send(Message::Binary(frame.into_bytes()))
    }

    /// Send a complete user text turn.
    pub fn send_text(&self, text: &str) -> AppResult<()> {
        self.send(Message::Text(ClientEnvelope::user_text(text).to_json()?))
    }

    /// Tell the service the microphone stream paused.
    pub fn send_audio_stream_end(&self) -> AppResult<()> {
        self.send(Message::Text(ClientEnvelope::audio_stream_end().to_json()?))
    }

    /// Forward frames from a capture channel until it closes or the session stops.
    ///
    /// Frames are sent in the order they were captured.
    pub fn forward_frames(&self, mut frames: mpsc::UnboundedReceiver<AudioFrame>) -> AppResult<()> {
        let outbound = self.outbound()?;

        let task = tokio::spawn(async move {
            let mut sent = 0u64;
            while let Some(frame) = frames.recv().await {
                let json = match ClientEnvelope::realtime_audio(&frame).to_json() {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(error = %err, "Failed to encode capture frame");
                        continue;
                    }
                };
                if outbound.send(Message::Text(json)).is_err() {
                    break;
                }
                sent += 1;
            }
            debug!(sent, "Capture forwarding finished");
        });

        self.forwarders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
        Ok(())
    }

    /// Subscribe an additional observer. Events before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn scheduler(&self) -> &PlaybackScheduler<S> {
        &self.scheduler
    }

    pub fn playback_stats(&self) -> PlaybackStatsSnapshot {
        self.scheduler.stats()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// End the session. Safe to call any number of times.
    pub fn stop(&self) {
        // Dropping the last sender lets the writer send Close and exit
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        for task in self
            .forwarders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }

        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            reader.abort();
        }

        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.scheduler.stop();
            let _ = self.events.send(SessionEvent::Closed);
            info!("Voice session stopped");
        }
    }
}

impl<S: AudioSink> Drop for VoiceClient<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Parse one inbound payload and hand it to the scheduler.
///
/// Malformed envelopes are logged and dropped; the session stays open.
fn dispatch<S: AudioSink>(scheduler: &PlaybackScheduler<S>, payload: &[u8]) {
    match ServerEnvelope::parse(payload) {
        Ok(envelope) => scheduler.handle_envelope(envelope),
        Err(err) => warn!(bytes = payload.len(), error = %err, "Dropping malformed server envelope"),
    }
}
