//! # Upstream Link
//!
//! The relay's connection to the remote conversational audio service. One
//! link is opened per client session and lives exactly as long as it.
//!
//! ## Message Flow:
//! - **Outbound**: the relay actor pushes frames into an unbounded channel. The
//!   channel exists before the connection does, so client frames that arrive
//!   during the handshake are queued behind the setup message, never lost.
//! - **Inbound**: every upstream frame is handed back to the actor untouched
//!   as an [`UpstreamEvent`].
//!
//! ## Shutdown:
//! Dropping the outbound sender makes the task send a Close frame and exit.
//! `close()` does exactly that and is safe to call any number of times. A
//! link closed while still handshaking abandons the connect attempt; no
//! setup message is sent and no event is reported.

use crate::config::UpstreamConfig;
use crate::error::AppError;
use crate::protocol::SetupMessage;

use actix::prelude::*;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the upstream side can report back to the relay actor.
#[derive(Debug, Message)]
#[rtype(result = "()")]
pub enum UpstreamEvent {
    /// Handshake done and setup message sent
    Connected,
    /// Text frame, forwarded as-is
    Text(String),
    /// Binary frame, forwarded as-is
    Binary(Vec<u8>),
    /// Service closed the connection normally
    Closed(Option<String>),
    /// Connect, send or receive failure
    Failed(AppError),
}

/// Handle to the background task that owns the upstream WebSocket.
pub struct UpstreamLink {
    session_id: Uuid,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    /// Dropped on close; resolves the handshake race in `run_link`
    abandon: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl UpstreamLink {
    /// Start connecting and return immediately.
    ///
    /// ## Parameters:
    /// - **session_id**: used only for log fields
    /// - **config**: endpoint, credential, model and system instruction
    /// - **events**: where inbound frames and lifecycle events are delivered
    pub fn open(session_id: Uuid, config: UpstreamConfig, events: Recipient<UpstreamEvent>) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (abandon, abandoned) = oneshot::channel();
        let task = tokio::spawn(run_link(session_id, config, outbound_rx, abandoned, events));

        Self {
            session_id,
            outbound: Some(outbound),
            abandon: Some(abandon),
            task: Some(task),
        }
    }

    /// Queue a text frame for the service.
    pub fn send_text(&self, text: String) -> Result<(), AppError> {
        match &self.outbound {
            Some(outbound) => outbound
                .send(Message::Text(text))
                .map_err(|_| AppError::Upstream("Upstream connection is closed".to_string())),
            None => Err(AppError::Upstream("Upstream connection is closed".to_string())),
        }
    }

    /// Close the upstream side. Idempotent.
    ///
    /// The task is given the chance to send a Close frame; it is detached
    /// rather than aborted so that frame actually goes out.
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            debug!(session_id = %self.session_id, "Closing upstream link");
        }
        self.abandon.take();
        self.task.take();
    }
}

impl Drop for UpstreamLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_link(
    session_id: Uuid,
    config: UpstreamConfig,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    abandoned: oneshot::Receiver<()>,
    events: Recipient<UpstreamEvent>,
) {
    let endpoint = config.endpoint_url();
    let timeout = config.connect_timeout();

    let connect = tokio::time::timeout(timeout, connect_async(endpoint.as_str()));
    let connected = tokio::select! {
        result = connect => result,
        _ = abandoned => {
            debug!(session_id = %session_id, "Session ended during upstream handshake");
            return;
        }
    };

    let stream = match connected {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(err)) => {
            warn!(session_id = %session_id, error = %err, "Upstream connection failed");
            events.do_send(UpstreamEvent::Failed(AppError::from(err)));
            return;
        }
        Err(_) => {
            warn!(session_id = %session_id, timeout_secs = timeout.as_secs(), "Upstream connection timed out");
            events.do_send(UpstreamEvent::Failed(AppError::Upstream(format!(
                "Timed out connecting to upstream after {}s",
                timeout.as_secs()
            ))));
            return;
        }
    };

    let (mut write, mut read) = stream.split();

    let setup = match SetupMessage::new(&config.model, &config.system_instruction).to_json() {
        Ok(setup) => setup,
        Err(err) => {
            events.do_send(UpstreamEvent::Failed(err));
            return;
        }
    };

    if let Err(err) = write.send(Message::Text(setup)).await {
        events.do_send(UpstreamEvent::Failed(AppError::from(err)));
        return;
    }

    info!(session_id = %session_id, model = %config.model, "Upstream connected, setup sent");
    events.do_send(UpstreamEvent::Connected);

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(message) => {
                    if let Err(err) = write.send(message).await {
                        warn!(session_id = %session_id, error = %err, "Failed to send to upstream");
                        events.do_send(UpstreamEvent::Failed(AppError::from(err)));
                        break;
                    }
                }
                None => {
                    // Relay side is gone; close errors are irrelevant at this point
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => events.do_send(UpstreamEvent::Text(text)),
                Some(Ok(Message::Binary(data))) => events.do_send(UpstreamEvent::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    debug!(session_id = %session_id, ?reason, "Upstream closed");
                    events.do_send(UpstreamEvent::Closed(reason));
                    break;
                }
                // Ping/Pong are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(session_id = %session_id, error = %err, "Upstream receive error");
                    events.do_send(UpstreamEvent::Failed(AppError::from(err)));
                    break;
                }
                None => {
                    events.do_send(UpstreamEvent::Closed(None));
                    break;
                }
            },
        }
    }
}
