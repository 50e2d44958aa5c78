//! # Envelope Protocol
//!
//! The JSON message shapes exchanged between the client, the relay and the
//! remote conversational service. Every shape is a closed set of variants so
//! both the relay and the playback scheduler can match exhaustively.
//!
//! ## Outbound (client → relay → upstream):
//! - `{ "clientContent": { "turns": { "role", "parts": [{ "text" }] }, "turnComplete": bool } }`
//! - `{ "realtimeInput": { "audio": { "data": <base64 PCM16>, "mimeType": "audio/pcm;rate=16000" } } }`
//!
//! ## Inbound (upstream → relay → client):
//! - `{ "setupComplete": ... }`
//! - `{ "serverContent": { "interrupted"?, "modelTurn"?, "outputTranscription"?, ... } }`
//! - `{ "error": string, "detail": string }`
//!
//! ## Setup (relay → upstream, once per session):
//! - `{ "setup": { "model", "generationConfig", "systemInstruction", "realtimeInputConfig", "outputAudioTranscription" } }`

use crate::audio::frame::AudioFrame;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// MIME type tag for raw little-endian PCM16 at the given rate.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Messages a client sends towards the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientEnvelope {
    /// A text turn
    #[serde(rename = "clientContent")]
    ClientContent(ClientContent),

    /// A chunk of live microphone audio
    #[serde(rename = "realtimeInput")]
    RealtimeInput(RealtimeInput),
}

impl ClientEnvelope {
    /// Build a complete user text turn.
    pub fn user_text(text: impl Into<String>) -> Self {
        ClientEnvelope::ClientContent(ClientContent {
            turns: Turns::One(Turn {
                role: "user".to_string(),
                parts: vec![TextPart { text: text.into() }],
            }),
            turn_complete: true,
        })
    }

    /// Wrap an outbound PCM16 frame into a realtime-audio envelope.
    pub fn realtime_audio(frame: &AudioFrame) -> Self {
        ClientEnvelope::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                data: frame.to_base64(),
                mime_type: pcm_mime_type(frame.sample_rate()),
            }),
            audio_stream_end: None,
        })
    }

    /// Signal that the microphone stream paused or ended.
    pub fn audio_stream_end() -> Self {
        ClientEnvelope::RealtimeInput(RealtimeInput {
            audio: None,
            audio_stream_end: Some(true),
        })
    }

    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Turns,
    #[serde(default)]
    pub turn_complete: bool,
}

/// Clients send either a single turn object or a list of turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Turns {
    One(Turn),
    Many(Vec<Turn>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    #[serde(default)]
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

/// Base64 payload plus its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// Messages arriving from the remote service (or generated by the relay on failure).
///
/// The three shapes share no tag field, so variants are told apart by their
/// required top-level key. Unknown extra keys (usage metadata and the like)
/// are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEnvelope {
    SetupComplete {
        /// The service sends `{}`; older relays sent `true`. Only presence matters.
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: ServerContent,
    },
    Error {
        error: String,
        #[serde(default)]
        detail: String,
    },
}

impl ServerEnvelope {
    pub fn setup_complete() -> Self {
        ServerEnvelope::SetupComplete {
            setup_complete: serde_json::Value::Bool(true),
        }
    }

    pub fn error(error: impl Into<String>, detail: impl Into<String>) -> Self {
        ServerEnvelope::Error {
            error: error.into(),
            detail: detail.into(),
        }
    }

    pub fn interrupted() -> Self {
        ServerEnvelope::ServerContent {
            server_content: ServerContent {
                interrupted: Some(true),
                ..ServerContent::default()
            },
        }
    }

    /// Model audio carrying the given base64 PCM16 payloads, one part each.
    pub fn model_audio<I, T>(payloads: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let parts = payloads
            .into_iter()
            .map(|data| Part {
                inline_data: Some(InlineData {
                    data: data.into(),
                    mime_type: None,
                }),
                text: None,
            })
            .collect();

        ServerEnvelope::ServerContent {
            server_content: ServerContent {
                model_turn: Some(ModelTurn { parts }),
                ..ServerContent::default()
            },
        }
    }

    /// Parse a text or binary WebSocket payload.
    pub fn parse(payload: &[u8]) -> AppResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| AppError::Protocol(format!("unrecognised server envelope: {}", e)))
    }

    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<ModelTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_transcription: Option<Transcription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_transcription: Option<Transcription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_complete: Option<bool>,
}

impl ServerContent {
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.unwrap_or(false)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.turn_complete.unwrap_or(false)
    }

    /// Base64 audio payloads in the order they appear in the model turn.
    pub fn audio_payloads(&self) -> impl Iterator<Item = &str> {
        self.model_turn
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .map(|inline| inline.data.as_str())
    }

    /// Output transcription text, if the service sent a non-empty one.
    pub fn transcription(&self) -> Option<&str> {
        self.output_transcription
            .as_ref()
            .map(|t| t.text.as_str())
            .filter(|text| !text.is_empty())
    }

    pub fn input_transcription_text(&self) -> Option<&str> {
        self.input_transcription
            .as_ref()
            .map(|t| t.text.as_str())
            .filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

/// First message on every upstream connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: SystemInstruction,
    pub realtime_input_config: RealtimeInputConfig,
    pub output_audio_transcription: OutputAudioTranscription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputConfig {
    pub automatic_activity_detection: AutomaticActivityDetection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomaticActivityDetection {
    pub disabled: bool,
}

/// Presence of this (empty) object turns output transcription on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputAudioTranscription {}

impl SetupMessage {
    /// Audio responses, server-side voice activity detection, output transcription.
    pub fn new(model: impl Into<String>, system_instruction: impl Into<String>) -> Self {
        Self {
            setup: Setup {
                model: model.into(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                },
                system_instruction: SystemInstruction {
                    parts: vec![TextPart {
                        text: system_instruction.into(),
                    }],
                },
                realtime_input_config: RealtimeInputConfig {
                    automatic_activity_detection: AutomaticActivityDetection { disabled: false },
                },
                output_audio_transcription: OutputAudioTranscription::default(),
            },
        }
    }

    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
