//! # Relay WebSocket Handler
//!
//! Each client connection to `ws_path` becomes one `RelaySocket` actor that
//! owns exactly one upstream link. The actor is the whole session: when it
//! stops, the upstream link closes and the session slot is released.
//!
//! ## Relay Protocol:
//! 1. **Connection**: the upgrade is refused with 503 when the session limit is reached
//! 2. **Setup**: the upstream link sends the setup message before anything else
//! 3. **Client → upstream**: text frames are checked to be a known envelope and
//!    forwarded verbatim; binary frames are raw PCM16 and get wrapped into a
//!    realtime-audio envelope
//! 4. **Upstream → client**: forwarded byte-for-byte, text stays text, binary stays binary
//! 5. **Teardown**: either side closing closes the other; upstream failures reach
//!    the client as an `{error, detail}` envelope first
//!
//! ## Message Format:
//! - **Client → Server**: JSON envelopes, or binary PCM audio (16-bit, 16kHz, mono)
//! - **Server → Client**: whatever the remote service sent

use crate::audio::frame::AudioFrame;
use crate::config::{AppConfig, UpstreamConfig};
use crate::error::{AppError, AppResult};
use crate::protocol::ClientEnvelope;
use crate::session::RelaySession;
use crate::state::AppState;
use crate::upstream::{UpstreamEvent, UpstreamLink};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One reserved slot under `max_concurrent_sessions`.
///
/// The slot is released when this value is dropped, which covers every way a
/// session can end, including an upgrade that never reaches `started()`.
pub struct SessionSlot {
    state: web::Data<AppState>,
}

impl SessionSlot {
    pub fn acquire(state: &web::Data<AppState>, max_sessions: usize) -> Option<Self> {
        if state.try_acquire_session(max_sessions) {
            Some(Self {
                state: state.clone(),
            })
        } else {
            None
        }
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.state.release_session();
    }
}

/// WebSocket actor bridging one client to one upstream connection.
///
/// ## Actor Model:
/// Client frames arrive through `StreamHandler`, upstream frames arrive as
/// `UpstreamEvent` messages. Both are handled on the actor's own context, so
/// the session needs no locks.
pub struct RelaySocket {
    session: RelaySession,

    upstream: Option<UpstreamLink>,

    upstream_config: UpstreamConfig,

    /// Rate tag for raw binary frames from the client
    capture_rate: u32,

    heartbeat_interval: Duration,

    client_timeout: Duration,

    /// Last time the client sent anything (data or pong)
    last_heartbeat: Instant,

    app_state: web::Data<AppState>,

    _slot: SessionSlot,
}

impl RelaySocket {
    pub fn new(config: &AppConfig, app_state: web::Data<AppState>, slot: SessionSlot) -> Self {
        Self {
            session: RelaySession::new(),
            upstream: None,
            upstream_config: config.upstream.clone(),
            capture_rate: config.audio.capture_rate,
            heartbeat_interval: config.performance.heartbeat_interval(),
            client_timeout: config.performance.client_timeout(),
            last_heartbeat: Instant::now(),
            app_state,
            _slot: slot,
        }
    }

    /// Queue a text frame for the upstream link and count it.
    fn forward_to_upstream(&mut self, text: String) {
        let len = text.len();
        let result = match &self.upstream {
            Some(upstream) => upstream.send_text(text),
            None => Err(AppError::Upstream("Upstream link not opened".to_string())),
        };

        match result {
            Ok(()) => {
                self.session.record_client_message(len);
                self.app_state.record_client_frame();
            }
            Err(err) => {
                debug!(session_id = %self.session.id, error = %err, "Dropping client frame");
                self.session.record_dropped_message();
            }
        }
    }

    fn handle_client_text(&mut self, text: &str) {
        match check_client_envelope(text) {
            Ok(()) => self.forward_to_upstream(text.to_string()),
            Err(err) => {
                warn!(session_id = %self.session.id, error = %err, "Dropping malformed client envelope");
                self.session.record_dropped_message();
            }
        }
    }

    fn handle_client_audio(&mut self, data: &[u8]) {
        match wrap_client_audio(data, self.capture_rate) {
            Ok(envelope) => self.forward_to_upstream(envelope),
            Err(err) => {
                warn!(
                    session_id = %self.session.id,
                    bytes = data.len(),
                    error = %err,
                    "Dropping invalid client audio"
                );
                self.session.record_dropped_message();
            }
        }
    }

    /// Surface an upstream failure to the client, then end the session.
    fn fail_session(&mut self, err: AppError, ctx: &mut ws::WebsocketContext<Self>) {
        error!(session_id = %self.session.id, error = %err, "Upstream failed, closing session");
        self.app_state.record_upstream_error();
        self.session.mark_failed();

        match err.to_envelope().to_json() {
            Ok(json) => ctx.text(json),
            Err(encode_err) => error!("Failed to encode error envelope: {}", encode_err),
        }

        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Error,
            description: Some(err.kind().to_string()),
        }));
        ctx.stop();
    }
}

/// Accept a client text frame only if it is a known outbound envelope.
pub fn check_client_envelope(text: &str) -> AppResult<()> {
    serde_json::from_str::<ClientEnvelope>(text)
        .map(|_| ())
        .map_err(|e| AppError::Protocol(format!("unrecognised client envelope: {}", e)))
}

/// Wrap raw client PCM16 into a serialized realtime-audio envelope.
pub fn wrap_client_audio(data: &[u8], capture_rate: u32) -> AppResult<String> {
    let frame = AudioFrame::from_bytes(data.to_vec(), capture_rate)?;
    ClientEnvelope::realtime_audio(&frame).to_json()
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session.id, "Relay session started");

        self.upstream = Some(UpstreamLink::open(
            self.session.id,
            self.upstream_config.clone(),
            ctx.address().recipient(),
        ));

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session.id, "Client heartbeat timeout, closing session");
                act.session.mark_closing();
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(mut upstream) = self.upstream.take() {
            upstream.close();
        }
        self.session.mark_closed();

        let summary = self.session.summary();
        info!(
            session_id = %summary.session_id,
            status = summary.status.as_str(),
            duration_seconds = summary.duration_seconds,
            open_seconds = self.session.open_duration_seconds(),
            client_messages = summary.traffic.client_messages,
            upstream_messages = summary.traffic.upstream_messages,
            dropped_messages = summary.traffic.dropped_messages,
            "Relay session stopped"
        );
    }
}

/// Handle frames coming from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_client_text(&text);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_client_audio(&data);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session.id, ?reason, "Client closed");
                self.session.mark_closing();
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session.id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session.id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Handle frames and lifecycle events from the upstream link.
impl Handler<UpstreamEvent> for RelaySocket {
    type Result = ();

    fn handle(&mut self, event: UpstreamEvent, ctx: &mut Self::Context) {
        match event {
            UpstreamEvent::Connected => {
                self.session.mark_open();
            }
            UpstreamEvent::Text(text) => {
                self.session.record_upstream_message(text.len());
                self.app_state.record_upstream_frame();
                ctx.text(text);
            }
            UpstreamEvent::Binary(data) => {
                self.session.record_upstream_message(data.len());
                self.app_state.record_upstream_frame();
                ctx.binary(data);
            }
            UpstreamEvent::Closed(reason) => {
                info!(session_id = %self.session.id, ?reason, "Upstream closed, closing client");
                self.session.mark_closing();
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Normal,
                    description: reason,
                }));
                ctx.stop();
            }
            UpstreamEvent::Failed(err) => self.fail_session(err, ctx),
        }
    }
}

/// Relay endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Reserves a session slot first; when none is free the request is answered
/// with 503 and no upgrade happens. Otherwise the connection is handed to a
/// fresh `RelaySocket` actor.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let config = app_state.get_config();
    let max_sessions = config.performance.max_concurrent_sessions;

    let slot = match SessionSlot::acquire(&app_state, max_sessions) {
        Some(slot) => slot,
        None => {
            warn!(
                peer = ?req.connection_info().peer_addr(),
                max_sessions,
                "Refusing relay session, limit reached"
            );
            return Err(AppError::SessionLimit(format!(
                "Maximum concurrent sessions ({}) reached",
                max_sessions
            ))
            .into());
        }
    };

    debug!(peer = ?req.connection_info().peer_addr(), "Upgrading relay connection");
    ws::start(RelaySocket::new(&config, app_state.clone(), slot), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RealtimeInput;

    #[test]
    fn test_binary_audio_is_wrapped_with_rate_tag() {
        let json = wrap_client_audio(&[0x01, 0x00, 0xFF, 0x7F], 16000).unwrap();
        let envelope: ClientEnvelope = serde_json::from_str(&json).unwrap();

        match envelope {
            ClientEnvelope::RealtimeInput(RealtimeInput { audio: Some(blob), .. }) => {
                assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
                assert_eq!(blob.data, "AQD/fw==");
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_odd_length_audio_is_rejected() {
        assert!(wrap_client_audio(&[0x01, 0x02, 0x03], 16000).is_err());
        assert!(wrap_client_audio(&[], 16000).is_err());
    }

    #[test]
    fn test_client_envelope_check() {
        assert!(check_client_envelope(
            r#"{"clientContent":{"turns":{"role":"user","parts":[{"text":"hi"}]},"turnComplete":true}}"#
        )
        .is_ok());
        assert!(check_client_envelope(
            r#"{"realtimeInput":{"audio":{"data":"AAA=","mimeType":"audio/pcm;rate=16000"}}}"#
        )
        .is_ok());
        assert!(check_client_envelope("not json").is_err());
        assert!(check_client_envelope(r#"{"somethingElse":{}}"#).is_err());
    }

    #[actix_web::test]
    async fn test_upgrade_refused_when_session_limit_reached() {
        use actix_web::{http::StatusCode, test, App};

        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = web::Data::new(AppState::new(config));
        let _held = SessionSlot::acquire(&state, 1).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws", web::get().to(relay_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.active_sessions(), 1);
    }

    #[test]
    fn test_slot_released_on_drop() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        {
            let _slot = SessionSlot::acquire(&state, 1).unwrap();
            assert_eq!(state.active_sessions(), 1);
            assert!(SessionSlot::acquire(&state, 1).is_none());
        }
        assert_eq!(state.active_sessions(), 0);
    }
}
