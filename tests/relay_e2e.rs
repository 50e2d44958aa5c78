//! End-to-end relay tests: a real relay server on an ephemeral port, a
//! scripted mock upstream service, and `VoiceClient` sessions playing into
//! a recording sink.

use actix_web::{web, App, HttpServer};
use futures_util::{SinkExt, StreamExt};
use live_voice_relay::audio::frame::{dequantize, AudioFrame};
use live_voice_relay::audio::playback::{AudioSink, SessionEvent};
use live_voice_relay::client::VoiceClient;
use live_voice_relay::error::AppResult;
use live_voice_relay::protocol::{ClientEnvelope, RealtimeInput, ServerEnvelope};
use live_voice_relay::{handlers, AppConfig, AppState};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio_tungstenite::{accept_async, tungstenite::Message};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Sink that records every buffer; optionally blocks until a permit is added.
#[derive(Clone, Default)]
struct RecordingSink {
    played: Arc<Mutex<Vec<Vec<f32>>>>,
    started: Arc<AtomicUsize>,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingSink {
    fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let sink = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (sink, gate)
    }

    fn played(&self) -> Vec<Vec<f32>> {
        self.played.lock().unwrap().clone()
    }
}

impl AudioSink for RecordingSink {
    async fn play(&self, samples: Vec<f32>, sample_rate: u32) -> AppResult<()> {
        assert_eq!(sample_rate, 24000);
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.played.lock().unwrap().push(samples);
        Ok(())
    }
}

/// One upstream connection accepted by the mock service.
struct MockConnection {
    setup: serde_json::Value,
    from_relay: mpsc::UnboundedReceiver<Message>,
    to_relay: mpsc::UnboundedSender<Message>,
}

impl MockConnection {
    /// Next text frame from the relay, skipping control frames.
    async fn next_text(&mut self) -> String {
        loop {
            let message = tokio::time::timeout(TIMEOUT, self.from_relay.recv())
                .await
                .expect("timed out waiting for relay frame")
                .expect("relay connection closed");
            if let Message::Text(text) = message {
                return text;
            }
        }
    }

    /// Next realtime-audio payload (base64) and its MIME type.
    async fn next_audio(&mut self) -> (String, String) {
        let text = self.next_text().await;
        match serde_json::from_str::<ClientEnvelope>(&text).unwrap() {
            ClientEnvelope::RealtimeInput(RealtimeInput {
                audio: Some(blob), ..
            }) => (blob.data, blob.mime_type),
            other => panic!("expected realtime audio, got {:?}", other),
        }
    }

    fn send(&self, envelope: ServerEnvelope) {
        self.to_relay
            .send(Message::Text(envelope.to_json().unwrap()))
            .unwrap();
    }
}

async fn spawn_mock_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<MockConnection>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let conn_tx = conn_tx.clone();
            tokio::spawn(async move {
                let ws = accept_async(stream).await.unwrap();
                let (mut write, mut read) = ws.split();

                let setup = match read.next().await {
                    Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
                    other => panic!("expected setup message first, got {:?}", other),
                };

                let (from_tx, from_rx) = mpsc::unbounded_channel();
                let (to_tx, mut to_rx) = mpsc::unbounded_channel();
                let _ = conn_tx.send(MockConnection {
                    setup,
                    from_relay: from_rx,
                    to_relay: to_tx,
                });

                loop {
                    tokio::select! {
                        incoming = read.next() => match incoming {
                            Some(Ok(message)) => {
                                if from_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            _ => break,
                        },
                        outgoing = to_rx.recv() => match outgoing {
                            Some(message) => {
                                if write.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                        },
                    }
                }
            });
        }
    });

    (addr, conn_rx)
}

async fn start_relay(upstream_url: String) -> (SocketAddr, web::Data<AppState>) {
    let mut config = AppConfig::default();
    config.upstream.url = upstream_url;
    config.upstream.api_key = String::new();
    config.upstream.connect_timeout_secs = 5;

    let state = web::Data::new(AppState::new(config));
    let app_state = state.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(|cfg| handlers::configure(cfg, "/ws"))
    })
    .workers(1)
    .disable_signals()
    .bind(("127.0.0.1", 0))
    .unwrap();

    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    (addr, state)
}

async fn connect_client(
    relay: SocketAddr,
    sink: RecordingSink,
) -> (VoiceClient<RecordingSink>, broadcast::Receiver<SessionEvent>) {
    VoiceClient::connect(
        &format!("ws://{}/ws", relay),
        sink,
        &AppConfig::default().audio,
    )
    .await
    .unwrap()
}

async fn next_connection(connections: &mut mpsc::UnboundedReceiver<MockConnection>) -> MockConnection {
    tokio::time::timeout(TIMEOUT, connections.recv())
        .await
        .expect("timed out waiting for upstream connection")
        .unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_for_event<F>(events: &mut broadcast::Receiver<SessionEvent>, mut matches: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received in time")
}

fn frame_of(value: i16) -> AudioFrame {
    AudioFrame::from_samples(&[value; 320], 16000)
}

fn expected_playback(value: i16) -> Vec<f32> {
    vec![dequantize(value); 320]
}

async fn with_timeout<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, future).await.expect("timed out")
}

#[actix_web::test]
async fn test_setup_is_sent_first_with_audio_modality() {
    let (upstream, mut connections) = spawn_mock_upstream().await;
    let (relay, _state) = start_relay(format!("ws://{}", upstream)).await;
    let (client, _events) = connect_client(relay, RecordingSink::default()).await;

    let connection = next_connection(&mut connections).await;
    let setup = &connection.setup["setup"];
    let defaults = AppConfig::default();

    assert_eq!(setup["model"], defaults.upstream.model.as_str());
    assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
    assert_eq!(
        setup["systemInstruction"]["parts"][0]["text"],
        defaults.upstream.system_instruction.as_str()
    );
    assert_eq!(
        setup["realtimeInputConfig"]["automaticActivityDetection"]["disabled"],
        false
    );
    assert!(setup["outputAudioTranscription"].is_object());

    client.stop();
}

#[actix_web::test]
async fn test_three_frames_echo_play_in_order() {
    let (upstream, mut connections) = spawn_mock_upstream().await;
    let (relay, state) = start_relay(format!("ws://{}", upstream)).await;
    let sink = RecordingSink::default();
    let (client, mut events) = connect_client(relay, sink.clone()).await;
    let mut connection = next_connection(&mut connections).await;

    connection.send(ServerEnvelope::setup_complete());
    wait_for_event(&mut events, |e| *e == SessionEvent::Ready).await;

    for value in [1000, 2000, 3000] {
        client.send_frame(&frame_of(value)).unwrap();
    }

    for _ in 0..3 {
        let (data, mime_type) = connection.next_audio().await;
        assert_eq!(mime_type, "audio/pcm;rate=16000");
        connection.send(ServerEnvelope::model_audio([data]));
    }

    wait_until(|| sink.played().len() == 3).await;
    assert_eq!(
        sink.played(),
        vec![expected_playback(1000), expected_playback(2000), expected_playback(3000)]
    );

    let metrics = state.get_metrics_snapshot();
    assert_eq!(metrics.frames_from_clients, 3);
    assert!(metrics.frames_to_clients >= 4);

    client.stop();
}

#[actix_web::test]
async fn test_interruption_flushes_queue_but_finishes_current_frame() {
    let (upstream, mut connections) = spawn_mock_upstream().await;
    let (relay, _state) = start_relay(format!("ws://{}", upstream)).await;
    let (sink, gate) = RecordingSink::gated();
    let (client, mut events) = connect_client(relay, sink.clone()).await;
    let mut connection = next_connection(&mut connections).await;

    for value in [100, 200, 300] {
        client.send_frame(&frame_of(value)).unwrap();
    }

    // First frame reaches the output device and blocks there
    let (first, _) = connection.next_audio().await;
    connection.send(ServerEnvelope::model_audio([first]));
    wait_until(|| sink.started.load(Ordering::SeqCst) == 1).await;

    // The next two wait in the queue
    for _ in 0..2 {
        let (queued, _) = connection.next_audio().await;
        connection.send(ServerEnvelope::model_audio([queued]));
    }
    wait_until(|| client.scheduler().queue_len() == 2).await;

    connection.send(ServerEnvelope::interrupted());
    let event = wait_for_event(&mut events, |e| matches!(e, SessionEvent::Interrupted { .. })).await;
    assert_eq!(event, SessionEvent::Interrupted { dropped: 2 });
    assert_eq!(client.scheduler().queue_len(), 0);

    // Audio after the interruption plays normally
    client.send_frame(&frame_of(400)).unwrap();
    let (fourth, _) = connection.next_audio().await;
    connection.send(ServerEnvelope::model_audio([fourth]));

    gate.add_permits(2);
    wait_until(|| sink.played().len() == 2).await;
    assert_eq!(sink.played(), vec![expected_playback(100), expected_playback(400)]);

    wait_until(|| client.playback_stats().frames_played == 2).await;
    assert_eq!(client.playback_stats().frames_dropped, 2);

    client.stop();
}

#[actix_web::test]
async fn test_binary_upstream_frames_reach_the_sink() {
    let (upstream, mut connections) = spawn_mock_upstream().await;
    let (relay, _state) = start_relay(format!("ws://{}", upstream)).await;
    let sink = RecordingSink::default();
    let (client, mut events) = connect_client(relay, sink.clone()).await;
    let connection = next_connection(&mut connections).await;

    let binary = |envelope: ServerEnvelope| Message::Binary(envelope.to_json().unwrap().into_bytes());

    connection.to_relay.send(binary(ServerEnvelope::setup_complete())).unwrap();
    wait_for_event(&mut events, |e| *e == SessionEvent::Ready).await;

    let payloads = [frame_of(7).to_base64(), frame_of(-7).to_base64()];
    connection
        .to_relay
        .send(binary(ServerEnvelope::model_audio(payloads)))
        .unwrap();

    wait_until(|| sink.played().len() == 2).await;
    assert_eq!(sink.played(), vec![expected_playback(7), expected_playback(-7)]);

    client.stop();
}

#[actix_web::test]
async fn test_malformed_upstream_envelope_is_dropped_and_session_stays_open() {
    let (upstream, mut connections) = spawn_mock_upstream().await;
    let (relay, _state) = start_relay(format!("ws://{}", upstream)).await;
    let sink = RecordingSink::default();
    let (client, _events) = connect_client(relay, sink.clone()).await;
    let mut connection = next_connection(&mut connections).await;

    connection.to_relay.send(Message::Text("{not json".to_string())).unwrap();
    connection.to_relay.send(Message::Binary(b"\x00\x01garbage".to_vec())).unwrap();
    connection.send(ServerEnvelope::model_audio([frame_of(55).to_base64()]));

    wait_until(|| sink.played().len() == 1).await;
    assert_eq!(sink.played(), vec![expected_playback(55)]);
    assert!(!client.is_stopped());

    // Still usable in the other direction
    client.send_text("still there?").unwrap();
    let expected = ClientEnvelope::user_text("still there?").to_json().unwrap();
    assert_eq!(connection.next_text().await, expected);
    assert!(!client.is_stopped());

    client.stop();
}

#[actix_web::test]
async fn test_malformed_client_frames_are_dropped_and_session_stays_open() {
    let (upstream, mut connections) = spawn_mock_upstream().await;
    let (relay, _state) = start_relay(format!("ws://{}", upstream)).await;

    // A bare socket, so the relay sees exactly what we send
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", relay))
        .await
        .unwrap();
    let (mut write, mut read) = socket.split();
    let mut connection = next_connection(&mut connections).await;

    let valid = ClientEnvelope::user_text("hello").to_json().unwrap();
    write.send(Message::Text("{not json".to_string())).await.unwrap();
    write.send(Message::Text(r#"{"unknownKind": {}}"#.to_string())).await.unwrap();
    write.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    write.send(Message::Text(valid.clone())).await.unwrap();

    // Only the valid turn is forwarded
    assert_eq!(connection.next_text().await, valid);

    // And the relay still delivers upstream traffic to this client
    let ready = ServerEnvelope::setup_complete().to_json().unwrap();
    connection.send(ServerEnvelope::setup_complete());
    let received = with_timeout(async {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("relay closed the session: {:?}", other),
            }
        }
    })
    .await;
    assert_eq!(received, ready);

    let _ = write.send(Message::Close(None)).await;
}

#[actix_web::test]
async fn test_concurrent_sessions_are_isolated() {
    let (upstream, mut connections) = spawn_mock_upstream().await;
    let (relay, state) = start_relay(format!("ws://{}", upstream)).await;

    let sink_a = RecordingSink::default();
    let sink_b = RecordingSink::default();
    let (client_a, _events_a) = connect_client(relay, sink_a.clone()).await;
    let (client_b, _events_b) = connect_client(relay, sink_b.clone()).await;

    // Every upstream connection echoes whatever its own session sends
    for _ in 0..2 {
        let mut connection = next_connection(&mut connections).await;
        tokio::spawn(async move {
            while let Some(message) = connection.from_relay.recv().await {
                let Message::Text(text) = message else { continue };
                if let Ok(ClientEnvelope::RealtimeInput(RealtimeInput {
                    audio: Some(blob), ..
                })) = serde_json::from_str::<ClientEnvelope>(&text)
                {
                    connection.send(ServerEnvelope::model_audio([blob.data]));
                }
            }
        });
    }

    for _ in 0..3 {
        client_a.send_frame(&frame_of(111)).unwrap();
        client_b.send_frame(&frame_of(-222)).unwrap();
    }

    wait_until(|| sink_a.played().len() == 3 && sink_b.played().len() == 3).await;
    assert!(sink_a.played().iter().all(|b| *b == expected_playback(111)));
    assert!(sink_b.played().iter().all(|b| *b == expected_playback(-222)));
    assert_eq!(state.active_sessions(), 2);

    client_a.stop();
    client_b.stop();
    wait_until(|| state.active_sessions() == 0).await;
}

#[actix_web::test]
async fn test_text_is_forwarded_verbatim_and_binary_is_wrapped() {
    let (upstream, mut connections) = spawn_mock_upstream().await;
    let (relay, _state) = start_relay(format!("ws://{}", upstream)).await;
    let (client, _events) = connect_client(relay, RecordingSink::default()).await;
    let mut connection = next_connection(&mut connections).await;

    client.send_text("what time is it?").unwrap();
    let expected = ClientEnvelope::user_text("what time is it?").to_json().unwrap();
    assert_eq!(connection.next_text().await, expected);

    let frame = frame_of(42);
    let expected_data = frame.to_base64();
    client.send_raw_frame(frame).unwrap();
    let (data, mime_type) = connection.next_audio().await;
    assert_eq!(data, expected_data);
    assert_eq!(mime_type, "audio/pcm;rate=16000");

    client.send_audio_stream_end().unwrap();
    let stream_end: ClientEnvelope = serde_json::from_str(&connection.next_text().await).unwrap();
    assert_eq!(stream_end, ClientEnvelope::audio_stream_end());

    client.stop();
}

#[actix_web::test]
async fn test_upstream_failure_reaches_client_as_error_envelope() {
    // Reserve a port, then free it so nothing is listening there
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let (relay, state) = start_relay(format!("ws://{}", dead_addr)).await;
    let (client, mut events) = connect_client(relay, RecordingSink::default()).await;

    let event = wait_for_event(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;
    match event {
        SessionEvent::Error { error, .. } => assert_eq!(error, "upstream_error"),
        other => panic!("unexpected event {:?}", other),
    }

    wait_for_event(&mut events, |e| *e == SessionEvent::Closed).await;
    wait_until(|| client.is_stopped()).await;
    assert_eq!(state.get_metrics_snapshot().upstream_errors, 1);
}

#[actix_web::test]
async fn test_upstream_close_ends_client_session() {
    let (upstream, mut connections) = spawn_mock_upstream().await;
    let (relay, state) = start_relay(format!("ws://{}", upstream)).await;
    let (client, mut events) = connect_client(relay, RecordingSink::default()).await;

    let connection = next_connection(&mut connections).await;
    drop(connection);

    wait_for_event(&mut events, |e| *e == SessionEvent::Closed).await;
    assert!(client.is_stopped());
    with_timeout(async {
        while state.active_sessions() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

#[actix_web::test]
async fn test_client_stop_closes_upstream() {
    let (upstream, mut connections) = spawn_mock_upstream().await;
    let (relay, _state) = start_relay(format!("ws://{}", upstream)).await;
    let (client, _events) = connect_client(relay, RecordingSink::default()).await;
    let mut connection = next_connection(&mut connections).await;

    client.stop();
    client.stop();

    // The relay closes its upstream side once the client is gone
    let closed = with_timeout(async {
        loop {
            match connection.from_relay.recv().await {
                Some(Message::Close(_)) | None => return true,
                Some(_) => continue,
            }
        }
    })
    .await;
    assert!(closed);
}
