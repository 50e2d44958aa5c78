//! # Live Voice Relay
//!
//! Bidirectional real-time audio streaming between a microphone, a stateless
//! WebSocket relay and a remote conversational audio service, with barge-in
//! interruption on playback.
//!
//! ## Application Architecture:
//! - **audio**: capture-side encoder, PCM frames, playback scheduler (+ cpal devices)
//! - **protocol**: the JSON envelope shapes shared by all three parties
//! - **upstream / websocket / session**: the relay, one actor per client session
//! - **client**: the client end of a relay session, feeding the playback scheduler
//! - **config / state / health / middleware / handlers**: the HTTP server around the relay
//! - **error**: custom error types, HTTP error responses and error envelopes

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod protocol;
pub mod session;
pub mod state;
pub mod upstream;
pub mod websocket;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use state::AppState;
