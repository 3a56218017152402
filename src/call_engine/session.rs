//! Call Session - Zustand und Datensätze eines Anrufs

use super::error::CallError;
use super::negotiator::RemoteStreamInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf wird aufgebaut
    Calling,
    /// Eingehender Anruf wartet auf Antwort
    Incoming,
    /// Anruf aktiv
    Connected,
    /// Anruf beendet, wird gleich auf `Idle` zurückgesetzt
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Incoming => "incoming",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        }
    }

    /// Zustände, in denen eine Sitzung Ressourcen halten darf
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallState::Calling | CallState::Incoming | CallState::Connected
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Eine Anrufsitzung, vom Start bzw. Klingeln bis zum Aufräumen
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub local_participant_id: String,
    pub remote_participant_id: String,
    pub room_id: String,
    pub state: CallState,
    pub direction: CallDirection,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
}

impl CallSession {
    /// Neue ausgehende Sitzung im Zustand `Calling`
    pub fn outgoing(local: String, remote: String, room_id: String) -> Self {
        Self::new(local, remote, room_id, CallDirection::Outgoing, CallState::Calling)
    }

    /// Neue eingehende Sitzung im Zustand `Incoming`
    pub fn incoming(local: String, remote: String, room_id: String) -> Self {
        Self::new(local, remote, room_id, CallDirection::Incoming, CallState::Incoming)
    }

    fn new(
        local: String,
        remote: String,
        room_id: String,
        direction: CallDirection,
        state: CallState,
    ) -> Self {
        Self {
            local_participant_id: local,
            remote_participant_id: remote,
            room_id,
            state,
            direction,
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            duration_seconds: 0,
        }
    }
}

// ============================================================================
// STATUS SNAPSHOT
// ============================================================================

/// Momentaufnahme für die Anwendung (`get_call_state`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatus {
    pub state: CallState,
    pub duration: u64,
    pub has_local_stream: bool,
    pub has_remote_stream: bool,
}

// ============================================================================
// CALL EVENTS
// ============================================================================

/// Events an die Anwendung
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallState),
    RemoteStream(RemoteStreamInfo),
    /// Verstrichene Sekunden, einmal pro Sekunde im Zustand `connected`
    DurationTick(u64),
    Error(CallError),
    /// Nicht-fataler Fehler vom Relay
    RelayError { code: i32, message: String },
}
