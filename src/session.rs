//! # Relay Session Bookkeeping
//!
//! A relay session pairs one client WebSocket with one upstream WebSocket.
//! This module only tracks the lifecycle and traffic counters of that pairing;
//! the relayed data itself is never stored.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: client accepted, upstream handshake in progress
//! 2. **Open**: upstream accepted the setup message, traffic flows both ways
//! 3. **Closing**: one side closed, the other is being closed
//! 4. **Closed**: both sides gone, normal termination
//! 5. **Failed**: upstream error surfaced to the client

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Current status of a relay session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Open => "open",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
            SessionStatus::Failed => "failed",
        }
    }

    /// Closing, Closed and Failed are terminal for traffic purposes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Closing | SessionStatus::Closed | SessionStatus::Failed
        )
    }
}

/// Lifecycle and counters for one client/upstream pairing.
///
/// ## Ownership:
/// Each relay actor owns exactly one `RelaySession`; nothing else holds a
/// reference, so plain fields are enough (no locks).
#[derive(Debug)]
pub struct RelaySession {
    /// Unique identifier, used as the `session_id` field in every log line
    pub id: Uuid,

    status: SessionStatus,

    pub created_at: DateTime<Utc>,

    opened_at: Option<DateTime<Utc>>,

    ended_at: Option<DateTime<Utc>>,

    traffic: SessionTraffic,
}

/// Per-direction message and byte counts.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionTraffic {
    pub client_messages: u64,
    pub client_bytes: u64,
    pub upstream_messages: u64,
    pub upstream_bytes: u64,
    /// Client messages that failed to parse and were dropped
    pub dropped_messages: u64,
}

/// Snapshot logged when the session ends.
#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub duration_seconds: f64,
    pub traffic: SessionTraffic,
}

impl RelaySession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Connecting,
            created_at: Utc::now(),
            opened_at: None,
            ended_at: None,
            traffic: SessionTraffic::default(),
        }
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Upstream handshake finished.
    ///
    /// ## State Transition:
    /// Connecting → Open (ignored in any other state)
    pub fn mark_open(&mut self) {
        if self.status == SessionStatus::Connecting {
            self.status = SessionStatus::Open;
            self.opened_at = Some(Utc::now());
        }
    }

    /// One side initiated close.
    pub fn mark_closing(&mut self) {
        if !self.status.is_terminal() {
            self.status = SessionStatus::Closing;
        }
    }

    /// Upstream failed. Failure wins over a close already in progress.
    pub fn mark_failed(&mut self) {
        if self.status != SessionStatus::Closed {
            self.status = SessionStatus::Failed;
            self.ended_at.get_or_insert_with(Utc::now);
        }
    }

    /// Both sides are gone. A failed session keeps its Failed status.
    pub fn mark_closed(&mut self) {
        if self.status != SessionStatus::Failed {
            self.status = SessionStatus::Closed;
        }
        self.ended_at.get_or_insert_with(Utc::now);
    }

    pub fn record_client_message(&mut self, bytes: usize) {
        self.traffic.client_messages += 1;
        self.traffic.client_bytes += bytes as u64;
    }

    pub fn record_upstream_message(&mut self, bytes: usize) {
        self.traffic.upstream_messages += 1;
        self.traffic.upstream_bytes += bytes as u64;
    }

    pub fn record_dropped_message(&mut self) {
        self.traffic.dropped_messages += 1;
    }

    pub fn traffic(&self) -> &SessionTraffic {
        &self.traffic
    }

    /// Seconds from creation to end (or to now while still running).
    pub fn duration_seconds(&self) -> f64 {
        let end_time = self.ended_at.unwrap_or_else(Utc::now);
        end_time.signed_duration_since(self.created_at).num_milliseconds() as f64 / 1000.0
    }

    /// Seconds the upstream link was open, 0 if it never opened.
    pub fn open_duration_seconds(&self) -> f64 {
        match self.opened_at {
            Some(opened) => {
                let end_time = self.ended_at.unwrap_or_else(Utc::now);
                end_time.signed_duration_since(opened).num_milliseconds() as f64 / 1000.0
            }
            None => 0.0,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.to_string(),
            status: self.status.clone(),
            duration_seconds: self.duration_seconds(),
            traffic: self.traffic.clone(),
        }
    }
}

impl Default for RelaySession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut session = RelaySession::new();
        assert_eq!(session.status(), &SessionStatus::Connecting);
        assert_eq!(session.open_duration_seconds(), 0.0);

        session.mark_open();
        assert_eq!(session.status(), &SessionStatus::Open);

        session.mark_closing();
        assert_eq!(session.status(), &SessionStatus::Closing);

        // Open after closing is ignored
        session.mark_open();
        assert_eq!(session.status(), &SessionStatus::Closing);

        session.mark_closed();
        assert_eq!(session.status(), &SessionStatus::Closed);
    }

    #[test]
    fn test_failed_status_survives_close() {
        let mut session = RelaySession::new();
        session.mark_failed();
        session.mark_closed();
        assert_eq!(session.status(), &SessionStatus::Failed);
        assert_eq!(session.summary().status.as_str(), "failed");
    }

    #[test]
    fn test_traffic_counters() {
        let mut session = RelaySession::new();
        session.record_client_message(640);
        session.record_client_message(640);
        session.record_upstream_message(100);
        session.record_dropped_message();

        let traffic = session.traffic();
        assert_eq!(traffic.client_messages, 2);
        assert_eq!(traffic.client_bytes, 1280);
        assert_eq!(traffic.upstream_messages, 1);
        assert_eq!(traffic.upstream_bytes, 100);
        assert_eq!(traffic.dropped_messages, 1);
    }

    #[test]
    fn test_sessions_have_distinct_ids() {
        assert_ne!(RelaySession::new().id, RelaySession::new().id);
    }
}
