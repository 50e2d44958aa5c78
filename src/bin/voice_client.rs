//! # Voice Client
//!
//! Talks to a running relay with the local microphone and speakers.
//!
//! ## Usage:
//! ```text
//! voice-client [URL]
//! voice-client ws://127.0.0.1:8080/ws
//! ```
//! Speak to talk; type a line and press Enter to send it as a text turn;
//! Ctrl+C to quit. Without an argument the relay URL is built from the same
//! configuration the server reads (config.toml, APP_* variables).

use anyhow::Result;
use clap::Parser;
use live_voice_relay::audio::capture::MicrophoneCapture;
use live_voice_relay::audio::output::SpeakerSink;
use live_voice_relay::audio::SessionEvent;
use live_voice_relay::client::VoiceClient;
use live_voice_relay::AppConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Talk to a live voice relay with the local microphone and speakers
#[derive(Parser, Debug)]
#[command(name = "voice-client", version)]
struct Cli {
    /// Relay WebSocket URL (default: built from config.toml / APP_* variables)
    #[arg(value_name = "URL")]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice_relay=info,voice_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    let config = AppConfig::load()?;
    config.validate()?;

    let url = cli.url.unwrap_or_else(|| {
        format!(
            "ws://{}:{}{}",
            config.server.host, config.server.port, config.server.ws_path
        )
    });

    let speaker = SpeakerSink::open(config.audio.playback_rate)?;
    let (client, events) = VoiceClient::connect(&url, speaker, &config.audio).await?;
    let mut closed = client.subscribe();

    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let mut microphone = match MicrophoneCapture::start(&config.audio, frames_tx) {
        Ok(capture) => capture,
        Err(err) => {
            client.stop();
            return Err(err.into());
        }
    };
    client.forward_frames(frames_rx)?;

    info!(
        relay = %url,
        microphone = microphone.device_name(),
        native_rate = microphone.native_rate(),
        "Listening. Type a line to send text, Ctrl+C to quit."
    );

    let observer = tokio::spawn(print_events(events));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping");
                break;
            }
            _ = wait_for_close(&mut closed) => {
                warn!("Relay ended the session");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if let Err(err) = client.send_text(line.trim()) {
                        error!("Failed to send text: {}", err);
                        break;
                    }
                }
                Ok(Some(_)) => {}
                // stdin closed; keep the voice session running until Ctrl+C
                Ok(None) => {
                    tokio::select! {
                        result = tokio::signal::ctrl_c() => result?,
                        _ = wait_for_close(&mut closed) => {}
                    }
                    break;
                }
                Err(err) => {
                    warn!("Failed to read stdin: {}", err);
                    break;
                }
            },
        }
    }

    microphone.stop();
    if !client.is_stopped() {
        // Lets the service flush any audio it is still buffering for this turn
        let _ = client.send_audio_stream_end();
    }
    client.stop();
    observer.abort();

    let stats = client.playback_stats();
    info!(
        frames_played = stats.frames_played,
        frames_dropped = stats.frames_dropped,
        frames_skipped = stats.frames_skipped,
        interruptions = stats.interruptions,
        "Session finished"
    );

    Ok(())
}

async fn wait_for_close(events: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return,
            _ => {}
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Ready) => info!("Session ready"),
            Ok(SessionEvent::Transcription(text)) => println!("assistant: {}", text),
            Ok(SessionEvent::InputTranscription(text)) => println!("you: {}", text),
            Ok(SessionEvent::Interrupted { dropped }) => info!(dropped, "Interrupted"),
            Ok(SessionEvent::TurnComplete) => {}
            Ok(SessionEvent::Error { error, detail }) => error!("{}: {}", error, detail),
            Ok(SessionEvent::Closed) => {
                info!("Session closed");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event observer fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
