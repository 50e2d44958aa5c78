//! # Application State Management
//!
//! Shared state accessed by every HTTP handler and every relay actor.
//!
//! ## What is (and is not) shared:
//! Only configuration and counters live here. Relayed audio and envelopes are
//! owned by their session's actor and never touch this struct, so sessions
//! cannot observe each other's traffic.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers and actors hold a reference to the same data
//! - **RwLock**: many concurrent readers or one writer
//! - **T**: the config or the metrics being protected
//!
//! ### Lock poisoning
//! A panic while holding a lock poisons it. Counters and config stay usable
//! after such a panic, so poisoned guards are recovered with `into_inner()`.

use crate::config::AppConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across handlers and relay actors.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and relay counters
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since server start.
///
/// ## Why these metrics matter:
/// - **active_sessions**: current load, compared against `max_concurrent_sessions`
/// - **frames_from_clients / frames_to_clients**: relay throughput per direction
/// - **upstream_errors**: health of the remote service
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed
    pub request_count: u64,

    /// Total number of HTTP responses with a 4xx/5xx status
    pub error_count: u64,

    /// Relay sessions currently open
    pub active_sessions: u32,

    /// Relay sessions accepted since start
    pub total_sessions: u64,

    /// Upgrades refused because the session limit was reached
    pub rejected_sessions: u64,

    /// Client → upstream messages relayed
    pub frames_from_clients: u64,

    /// Upstream → client messages relayed
    pub frames_to_clients: u64,

    /// Upstream connect/send/receive failures
    pub upstream_errors: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a relay session slot.
    ///
    /// ## Atomicity:
    /// The limit check and the increment happen under one write lock, so two
    /// simultaneous upgrades cannot both take the last slot.
    ///
    /// ## Returns:
    /// - `true`: slot reserved; the caller must later call `release_session()`
    /// - `false`: limit reached; nothing changed except the rejection counter
    pub fn try_acquire_session(&self, max_sessions: usize) -> bool {
        let mut metrics = self.write_metrics();
        if metrics.active_sessions as usize >= max_sessions {
            metrics.rejected_sessions += 1;
            return false;
        }
        metrics.active_sessions += 1;
        metrics.total_sessions += 1;
        true
    }

    /// Give back a slot taken with `try_acquire_session()`.
    pub fn release_session(&self) {
        let mut metrics = self.write_metrics();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn active_sessions(&self) -> u32 {
        self.read_metrics().active_sessions
    }

    pub fn record_client_frame(&self) {
        self.write_metrics().frames_from_clients += 1;
    }

    pub fn record_upstream_frame(&self) {
        self.write_metrics().frames_to_clients += 1;
    }

    pub fn record_upstream_error(&self) {
        self.write_metrics().upstream_errors += 1;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_limit_is_enforced() {
        let state = AppState::new(AppConfig::default());

        assert!(state.try_acquire_session(2));
        assert!(state.try_acquire_session(2));
        assert!(!state.try_acquire_session(2));
        assert_eq!(state.active_sessions(), 2);

        state.release_session();
        assert!(state.try_acquire_session(2));

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.total_sessions, 3);
        assert_eq!(metrics.rejected_sessions, 1);
    }

    #[test]
    fn test_release_never_underflows() {
        let state = AppState::new(AppConfig::default());
        state.release_session();
        assert_eq!(state.active_sessions(), 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_update_config_validates() {
        let state = AppState::new(AppConfig::default());
        let mut bad = state.get_config();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().server.port, 8080);
    }
}
