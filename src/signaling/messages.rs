//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht ist ein JSON-Objekt mit `type` (kebab-case) und
//! camelCase-Feldern. Der Client ergänzt beim Senden den Envelope
//! (`senderId`, `roomId`, `timestamp`, `signature`).

use serde::{Deserialize, Serialize};

// ============================================================================
// NEGOTIATION PAYLOAD
// ============================================================================

/// Undurchsichtiger Aushandlungs-Blob (Offer, Answer oder Candidate)
///
/// Wird unverändert zwischen den Signaling Clients weitergereicht. Die
/// Struktur gehört dem Negotiator, nicht dieser Schicht.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NegotiationPayload(serde_json::Value);

impl NegotiationPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

// ============================================================================
// CLIENT → RELAY MESSAGES
// ============================================================================

/// Nachrichten, die der lokale Client an das Relay schickt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Raum betreten, Voraussetzung für jedes Routing
    JoinRoom {
        user_id: String,
        room_id: String,
        public_key: String,
    },

    StartCall {
        target_user_id: String,
        room_id: String,
        caller_id: String,
    },

    AnswerCall {
        caller_id: String,
        room_id: String,
        answerer_id: String,
    },

    RejectCall {
        caller_id: String,
        room_id: String,
        rejecter_id: String,
    },

    EndCall { ender_id: String },

    NegotiationSignal { payload: NegotiationPayload },

    Heartbeat { user_id: String },
}

impl ClientMessage {
    /// Wert des `type`-Felds auf dem Draht
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::StartCall { .. } => "start-call",
            ClientMessage::AnswerCall { .. } => "answer-call",
            ClientMessage::RejectCall { .. } => "reject-call",
            ClientMessage::EndCall { .. } => "end-call",
            ClientMessage::NegotiationSignal { .. } => "negotiation-signal",
            ClientMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

/// Alle Nachrichten, die das Relay zustellt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// Jemand ruft uns an
    IncomingCall {
        caller_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    /// Unser Anruf wurde angenommen
    CallAnswered { answerer_id: String },

    /// Unser Anruf wurde abgelehnt
    CallRejected { rejecter_id: String },

    /// Die Gegenseite hat aufgelegt
    CallEnded { ender_id: String },

    /// Aushandlungs-Blob der Gegenseite
    NegotiationSignal {
        payload: NegotiationPayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
    },

    /// Heartbeat Antwort
    Pong,

    /// Fehler vom Relay
    Error { code: i32, message: String },
}

// ============================================================================
// TESTS
// ============================================================================
