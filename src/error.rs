//! # Error Handling
//!
//! Custom error type shared by the relay server, the playback scheduler and
//! the client transport, plus its conversions to HTTP responses and to the
//! structured `{ error, detail }` envelope that is sent to WebSocket clients.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: Each variant is one failure category (upstream, device, protocol...)
//! - **Data**: Each variant carries a human-readable message
//! - **Pattern matching**: `match` maps each category to a status code and a machine-readable tag
//!
//! ### Traits for Error Conversion
//! - **From trait**: lets `?` turn library errors (serde, tungstenite, base64, config) into `AppError`
//! - **ResponseError trait**: turns an `AppError` returned from a handler into an HTTP response
//! - **Display + Error**: lets `AppError` flow through `anyhow` in the binaries

use crate::protocol::ServerEnvelope;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500)
/// - **BadRequest**: Client sent invalid data (400)
/// - **ConfigError**: Configuration problems (500)
/// - **ValidationError**: Data validation failed (400)
/// - **Upstream**: The remote conversational service failed or refused us (502)
/// - **AudioDevice**: Microphone/speaker missing or permission denied (500)
/// - **Protocol**: A frame or envelope could not be decoded (400)
/// - **SessionLimit**: Too many concurrent relay sessions (503)
///
/// ## Usage Example:
/// ```rust
/// use live_voice_relay::error::AppError;
/// let err = AppError::Upstream("connection refused".to_string());
/// assert_eq!(err.kind(), "upstream_error");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Upstream connection could not be opened, failed mid-session, or sent garbage
    Upstream(String),

    /// Audio capture/output device unavailable
    AudioDevice(String),

    /// Undecodable envelope, base64 payload or PCM buffer
    Protocol(String),

    /// Concurrent session limit reached
    SessionLimit(String),
}

impl AppError {
    /// Machine-readable error tag, used in HTTP bodies and error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Upstream(_) => "upstream_error",
            AppError::AudioDevice(_) => "audio_device_error",
            AppError::Protocol(_) => "protocol_error",
            AppError::SessionLimit(_) => "session_limit",
        }
    }

    /// The message carried by the variant, without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Upstream(msg)
            | AppError::AudioDevice(msg)
            | AppError::Protocol(msg)
            | AppError::SessionLimit(msg) => msg,
        }
    }

    /// Convert to the structured error envelope delivered to relay clients.
    ///
    /// ## JSON Shape:
    /// ```json
    /// { "error": "upstream_error", "detail": "connection reset by peer" }
    /// ```
    pub fn to_envelope(&self) -> ServerEnvelope {
        ServerEnvelope::error(self.kind(), self.message())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            AppError::AudioDevice(msg) => write!(f, "Audio device error: {}", msg),
            AppError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            AppError::SessionLimit(msg) => write!(f, "Session limit: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError/AudioDevice → 500
/// - BadRequest/ValidationError/Protocol → 400
/// - Upstream → 502
/// - SessionLimit → 503
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "session_limit",
///     "message": "Maximum concurrent sessions (10) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(_) | AppError::ConfigError(_) | AppError::AudioDevice(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::BadRequest(_) | AppError::ValidationError(_) | AppError::Protocol(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::SessionLimit(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// When you use `?` with an anyhow::Error inside a function returning
/// `AppResult`, it becomes an `AppError::Internal`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always caused by the peer sending malformed
/// data, so they map to `BadRequest` rather than `Internal`.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Any WebSocket failure on the upstream or client transport.
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::Protocol(format!("invalid base64 audio payload: {}", err))
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```rust
/// use live_voice_relay::error::AppResult;
/// fn frame_count() -> AppResult<usize> {
///     Ok(3)
/// }
/// assert_eq!(frame_count().unwrap(), 3);
/// ```
pub type AppResult<T> = Result<T, AppError>;
