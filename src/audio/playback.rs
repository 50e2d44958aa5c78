//! # Playback Scheduler
//!
//! Consumes inbound server envelopes, queues decoded audio frames and drives
//! strictly sequential playback through an [`AudioSink`]. Implements barge-in:
//! an `interrupted` flag from the service hard-flushes every queued frame.
//!
//! ## Session Lifecycle:
//! 1. **Created**: queue empty, no drain loop
//! 2. **Draining**: first audio frame arrived, a single drain task plays frames in order
//! 3. **Stopped**: queue cleared, drain task halted, output device released
//!
//! ## Interruption policy:
//! Only frames still in the queue are discarded. A frame already handed to
//! the sink keeps playing until the sink reports it finished; there is no way
//! to cut a device buffer mid-way.

use crate::audio::frame::AudioFrame;
use crate::error::AppResult;
use crate::protocol::{ServerContent, ServerEnvelope};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Something that can play a mono float buffer to completion.
///
/// ## Contract:
/// `play` resolves only once the whole buffer has been rendered, which is
/// what keeps consecutive frames from overlapping.
pub trait AudioSink: Send + Sync + 'static {
    fn play(&self, samples: Vec<f32>, sample_rate: u32) -> impl Future<Output = AppResult<()>> + Send;

    /// Release the underlying output device. Must be idempotent.
    fn release(&self) {}
}

/// Events surfaced to observers (UI, logs, tests).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The service acknowledged setup
    Ready,
    /// Transcription of the model's spoken output
    Transcription(String),
    /// Transcription of the user's speech
    InputTranscription(String),
    /// Barge-in; `dropped` frames were discarded from the queue
    Interrupted { dropped: usize },
    /// The model finished its turn
    TurnComplete,
    /// Structured error from the relay or service
    Error { error: String, detail: String },
    /// The session ended
    Closed,
}

/// Ordered queue of frames waiting to be played.
///
/// ## Thread Safety:
/// The envelope handler pushes while the drain task pops, so the deque sits
/// behind a mutex; `Notify` wakes the drain task when a frame arrives.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    notify: Notify,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AudioFrame>> {
        self.frames.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, frame: AudioFrame) {
        self.lock().push_back(frame);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        self.lock().pop_front()
    }

    /// Atomically discard everything queued; returns how many frames were dropped.
    pub fn clear(&self) -> usize {
        let mut frames = self.lock();
        let dropped = frames.len();
        frames.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    async fn wait_for_frame(&self) {
        self.notify.notified().await;
    }
}

/// Counters describing what happened to inbound audio.
#[derive(Debug, Default)]
pub struct PlaybackStats {
    pub frames_queued: AtomicU64,
    pub frames_played: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub interruptions: AtomicU64,
}

/// Point-in-time copy of [`PlaybackStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStatsSnapshot {
    pub frames_queued: u64,
    pub frames_played: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub interruptions: u64,
}

impl PlaybackStats {
    pub fn snapshot(&self) -> PlaybackStatsSnapshot {
        PlaybackStatsSnapshot {
            frames_queued: self.frames_queued.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
        }
    }
}

/// Per-session playback state and its single drain loop.
pub struct PlaybackScheduler<S: AudioSink> {
    queue: Arc<PlaybackQueue>,
    sink: Arc<S>,
    playback_rate: u32,
    idle_wait: Duration,
    /// Guards against starting a second drain loop
    draining: Arc<AtomicBool>,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SessionEvent>,
    stats: Arc<PlaybackStats>,
}

impl<S: AudioSink> PlaybackScheduler<S> {
    /// ## Parameters:
    /// - **sink**: output device (or a test double)
    /// - **playback_rate**: rate of inbound PCM (24000)
    /// - **idle_wait**: how long the drain loop sleeps on an empty queue before re-checking
    /// - **events**: channel observers subscribe to
    pub fn new(
        sink: S,
        playback_rate: u32,
        idle_wait: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            queue: Arc::new(PlaybackQueue::new()),
            sink: Arc::new(sink),
            playback_rate,
            idle_wait,
            draining: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            shutdown,
            drain_task: Mutex::new(None),
            events,
            stats: Arc::new(PlaybackStats::default()),
        }
    }

    pub fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn stats(&self) -> PlaybackStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// React to one inbound envelope.
    pub fn handle_envelope(&self, envelope: ServerEnvelope) {
        if self.is_stopped() {
            debug!("Ignoring envelope for stopped playback session");
            return;
        }

        match envelope {
            ServerEnvelope::SetupComplete { .. } => {
                info!("Upstream session ready");
                self.emit(SessionEvent::Ready);
            }
            ServerEnvelope::ServerContent { server_content } => {
                self.handle_server_content(&server_content);
            }
            ServerEnvelope::Error { error, detail } => {
                warn!(error = %error, detail = %detail, "Relay reported an error");
                self.emit(SessionEvent::Error { error, detail });
            }
        }
    }

    fn handle_server_content(&self, content: &ServerContent) {
        // Interruption applies to audio queued before this message
        if content.is_interrupted() {
            self.interrupt();
        }

        for payload in content.audio_payloads() {
            match AudioFrame::from_base64(payload, self.playback_rate) {
                Ok(frame) => self.enqueue(frame),
                Err(err) => {
                    self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                    warn!("Skipping undecodable audio part: {}", err);
                }
            }
        }

        if let Some(text) = content.input_transcription_text() {
            self.emit(SessionEvent::InputTranscription(text.to_string()));
        }
        if let Some(text) = content.transcription() {
            self.emit(SessionEvent::Transcription(text.to_string()));
        }
        if content.is_turn_complete() {
            self.emit(SessionEvent::TurnComplete);
        }
    }

    /// Append a frame and make sure a drain loop is running.
    pub fn enqueue(&self, frame: AudioFrame) {
        if self.is_stopped() {
            return;
        }

        self.queue.push(frame);
        self.stats.frames_queued.fetch_add(1, Ordering::Relaxed);
        self.ensure_draining();
    }

    /// Hard-flush the queue (barge-in). Returns the number of dropped frames.
    pub fn interrupt(&self) -> usize {
        let dropped = self.queue.clear();
        self.stats.interruptions.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);

        info!(dropped, "Playback interrupted, pending audio discarded");
        self.emit(SessionEvent::Interrupted { dropped });
        dropped
    }

    fn ensure_draining(&self) {
        // compare_exchange makes concurrent pushes race safely: exactly one wins
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let task = tokio::spawn(drain_loop(
            self.queue.clone(),
            self.sink.clone(),
            self.playback_rate,
            self.idle_wait,
            self.shutdown.subscribe(),
            self.draining.clone(),
            self.stats.clone(),
        ));

        let mut slot = self.drain_task.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(task);
    }

    /// Stop the session: halt the drain loop, clear the queue, release the device.
    ///
    /// Safe to call any number of times.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shutdown.send_replace(true);
        let dropped = self.queue.clear();

        if let Some(task) = self
            .drain_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
        self.draining.store(false, Ordering::Release);
        self.sink.release();

        debug!(dropped, "Playback scheduler stopped");
    }
}

impl<S: AudioSink> Drop for PlaybackScheduler<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The single cooperative drain loop of a session.
///
/// Suspends on two things only: waiting for a frame, and waiting for the sink
/// to finish the current buffer. Both waits also watch the shutdown signal.
async fn drain_loop<S: AudioSink>(
    queue: Arc<PlaybackQueue>,
    sink: Arc<S>,
    playback_rate: u32,
    idle_wait: Duration,
    mut shutdown: watch::Receiver<bool>,
    draining: Arc<AtomicBool>,
    stats: Arc<PlaybackStats>,
) {
    debug!("Drain loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let Some(frame) = queue.pop() else {
            tokio::select! {
                _ = queue.wait_for_frame() => {}
                _ = tokio::time::sleep(idle_wait) => {}
                _ = shutdown.changed() => break,
            }
            continue;
        };

        let samples = frame.to_f32();
        tokio::select! {
            result = sink.play(samples, playback_rate) => match result {
                Ok(()) => {
                    stats.frames_played.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                    warn!("Output device rejected frame, skipping: {}", err);
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    draining.store(false, Ordering::Release);
    debug!("Drain loop exited");
}
