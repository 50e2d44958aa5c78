//! # Configuration Management
//!
//! Loads the relay configuration from layered sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: derive macros convert between these structs and TOML/JSON/env values
//! - **struct grouping**: server, upstream, audio and performance settings live in separate structs
//! - **Result<T, E>**: loading and validation failures are returned, never panicked on
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__PORT, APP_UPSTREAM__MODEL, ...), plus HOST, PORT and API_KEY
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration.
///
/// ## Why separate config structs:
/// The relay only needs `server`, `upstream` and `performance`; the client
/// binary only needs `audio`. Keeping them apart lets each side borrow just
/// the part it uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// Where the relay listens.
///
/// ## Fields:
/// - `host`: bind address (`127.0.0.1` for development, `0.0.0.0` in containers)
/// - `port`: TCP port
/// - `ws_path`: path of the client WebSocket endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
}

/// The remote conversational audio service.
///
/// ## Secrets:
/// `api_key` is appended as the `key` query parameter when connecting. It is
/// never echoed back by the HTTP API; use `api_key_configured()` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub system_instruction: String,
    pub connect_timeout_secs: u64,
}

/// Audio pipeline settings shared by the encoder and the playback scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Outbound PCM rate (16000)
    pub capture_rate: u32,
    /// Outbound frame length in milliseconds (20)
    pub frame_duration_ms: u32,
    /// Inbound PCM rate (24000)
    pub playback_rate: u32,
    /// How long the drain loop idles on an empty queue before re-checking
    pub drain_idle_ms: u64,
}

/// Load and liveness limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                ws_path: "/ws".to_string(),
            },
            upstream: UpstreamConfig {
                url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "models/gemini-2.0-flash-live-001".to_string(),
                system_instruction: "You are a friendly voice assistant. Keep answers short and conversational.".to_string(),
                connect_timeout_secs: 10,
            },
            audio: AudioConfig {
                capture_rate: crate::audio::CAPTURE_RATE,
                frame_duration_ms: crate::audio::FRAME_DURATION_MS,
                playback_rate: crate::audio::PLAYBACK_RATE,
                drain_idle_ms: 10,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_secs: 15,
                client_timeout_secs: 60,
            },
        }
    }
}

impl UpstreamConfig {
    /// Full endpoint URL including the API credential parameter.
    pub fn endpoint_url(&self) -> String {
        if self.api_key.is_empty() {
            return self.url.clone();
        }
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.url, separator, self.api_key)
    }

    pub fn api_key_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl AudioConfig {
    /// Samples in one outbound frame (320 at 16 kHz / 20 ms).
    pub fn frame_samples(&self) -> usize {
        (self.capture_rate as u64 * self.frame_duration_ms as u64 / 1000) as usize
    }

    pub fn drain_idle(&self) -> Duration {
        Duration::from_millis(self.drain_idle_ms)
    }
}

impl PerformanceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_ (nested keys use `__`)
    /// 4. Handle the plain HOST, PORT and API_KEY variables used by deployment platforms
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_UPSTREAM__MODEL=models/some-live-model`
    /// - `API_KEY=...`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("API_KEY") {
            settings = settings.set_override("upstream.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 and the WebSocket path starts with `/`
    /// - Upstream URL is a `ws://` or `wss://` URL
    /// - At least one session is allowed
    /// - Audio rates are non-zero and a frame holds a whole number of samples
    /// - Timers are non-zero and the client timeout outlasts the heartbeat
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(anyhow::anyhow!("WebSocket path must start with '/'"));
        }

        if !(self.upstream.url.starts_with("ws://") || self.upstream.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Upstream URL must use ws:// or wss://, got {}",
                self.upstream.url
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.upstream.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Upstream connect timeout must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.performance.client_timeout_secs <= self.performance.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.performance.client_timeout_secs,
                self.performance.heartbeat_interval_secs
            ));
        }

        if self.audio.drain_idle_ms == 0 {
            return Err(anyhow::anyhow!("Drain idle wait must be greater than 0"));
        }

        if self.audio.capture_rate == 0 || self.audio.playback_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.frame_samples() == 0
            || (self.audio.capture_rate as u64 * self.audio.frame_duration_ms as u64) % 1000 != 0
        {
            return Err(anyhow::anyhow!(
                "A {} ms frame at {} Hz must contain a whole, non-zero number of samples",
                self.audio.frame_duration_ms,
                self.audio.capture_rate
            ));
        }

        Ok(())
    }

    /// Apply a partial JSON update (used by `PUT /api/v1/config`).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. The upstream URL and
    /// API key cannot be changed at runtime, and neither can the `server`
    /// section: the listener is already bound.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if partial_config.get("server").is_some() {
            return Err(anyhow::anyhow!(
                "Server settings cannot be changed at runtime; edit config.toml and restart"
            ));
        }

        if let Some(upstream) = partial_config.get("upstream") {
            if let Some(model) = upstream.get("model").and_then(|v| v.as_str()) {
                self.upstream.model = model.to_string();
            }
            if let Some(instruction) = upstream.get("system_instruction").and_then(|v| v.as_str()) {
                self.upstream.system_instruction = instruction.to_string();
            }
            if let Some(timeout) = upstream.get("connect_timeout_secs").and_then(|v| v.as_u64()) {
                self.upstream.connect_timeout_secs = timeout;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(idle) = audio.get("drain_idle_ms").and_then(|v| v.as_u64()) {
                self.audio.drain_idle_ms = idle;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
            if let Some(interval) = performance.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.performance.heartbeat_interval_secs = interval;
            }
            if let Some(timeout) = performance.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                self.performance.client_timeout_secs = timeout;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.ws_path, "/ws");
        assert_eq!(config.audio.frame_samples(), 320);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstream.url = "https://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_duration_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.capture_rate = 11025;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.client_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.client_timeout_secs = config.performance.heartbeat_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstream.connect_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.drain_idle_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_url_appends_key() {
        let mut upstream = AppConfig::default().upstream;
        upstream.url = "wss://example.com/live".to_string();
        assert_eq!(upstream.endpoint_url(), "wss://example.com/live");
        assert!(!upstream.api_key_configured());

        upstream.api_key = "secret".to_string();
        assert_eq!(upstream.endpoint_url(), "wss://example.com/live?key=secret");

        upstream.url = "wss://example.com/live?alt=json".to_string();
        assert_eq!(upstream.endpoint_url(), "wss://example.com/live?alt=json&key=secret");
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"upstream": {"model": "models/other"}, "performance": {"heartbeat_interval_secs": 5}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.upstream.model, "models/other");
        assert_eq!(config.performance.heartbeat_interval_secs, 5);
        assert_eq!(config.performance.client_timeout_secs, 60);
    }

    #[test]
    fn test_config_update_rejects_server_section() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 9090}}"#).is_err());
        assert!(config.update_from_json(r#"{"server": {"host": "0.0.0.0"}}"#).is_err());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        for json in [
            r#"{"performance": {"max_concurrent_sessions": 0}}"#,
            r#"{"performance": {"heartbeat_interval_secs": 0}}"#,
            r#"{"performance": {"client_timeout_secs": 0}}"#,
            r#"{"performance": {"heartbeat_interval_secs": 60, "client_timeout_secs": 60}}"#,
            r#"{"upstream": {"connect_timeout_secs": 0}}"#,
            r#"{"audio": {"drain_idle_ms": 0}}"#,
        ] {
            let mut config = AppConfig::default();
            assert!(config.update_from_json(json).is_err(), "accepted {}", json);
        }
    }
}
