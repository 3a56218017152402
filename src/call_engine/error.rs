//! Fehler-Taxonomie des Call-Orchestrators

use super::audio::MediaError;
use crate::crypto::IdentityError;
use crate::signaling::SignalingError;
use thiserror::Error;

/// Warum eine Operation im aktuellen Zustand nicht erlaubt ist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// Es läuft bereits ein Anruf (Zustand != idle)
    CallInProgress,
    /// Kein eingehender Anruf zum Annehmen/Ablehnen
    NoIncomingCall,
    /// Kein Anruf zum Beenden
    NoActiveCall,
    NotInitialized,
    AlreadyInitialized,
    /// Eine vorherige Operation wartet noch auf Mikrofon/Negotiator
    OperationPending,
    /// Die Sitzung hat sich geändert, während die Operation lief
    SessionChanged,
    /// Der Manager läuft nicht mehr
    ManagerClosed,
}

impl std::fmt::Display for StateErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StateErrorKind::CallInProgress => "CallInProgress",
            StateErrorKind::NoIncomingCall => "NoIncomingCall",
            StateErrorKind::NoActiveCall => "NoActiveCall",
            StateErrorKind::NotInitialized => "NotInitialized",
            StateErrorKind::AlreadyInitialized => "AlreadyInitialized",
            StateErrorKind::OperationPending => "OperationPending",
            StateErrorKind::SessionChanged => "SessionChanged",
            StateErrorKind::ManagerClosed => "ManagerClosed",
        };
        f.write_str(name)
    }
}

/// Wie die Gegenseite den Anruf beendet hat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    Rejected,
    Ended,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// Mikrofon verweigert, die Sitzung bleibt idle
    #[error("Media permission denied: {0}")]
    Permission(String),

    /// Signaling-Verbindung verloren, erzwingt `ended`
    #[error("Signaling connection error: {0}")]
    Connection(String),

    /// Peer-Aushandlung fehlgeschlagen, erzwingt `ended`
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Operation im aktuellen Zustand ungültig, keine Zustandsänderung
    #[error("Invalid call state: {0}")]
    State(StateErrorKind),

    /// Gegenseite hat aufgelegt oder abgelehnt (kein Fehlerfall)
    #[error("Call {kind:?} by {by}")]
    RemoteTermination { by: String, kind: TerminationKind },
}

impl CallError {
    /// `true` für Fehler, nach denen der Manager sofort weiter benutzbar ist
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CallError::Permission(_) | CallError::State(_) | CallError::RemoteTermination { .. }
        )
    }
}

impl From<StateErrorKind> for CallError {
    fn from(kind: StateErrorKind) -> Self {
        CallError::State(kind)
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        CallError::Permission(err.to_string())
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::Connection(err.to_string())
    }
}

impl From<IdentityError> for CallError {
    fn from(err: IdentityError) -> Self {
        CallError::Connection(format!("signing identity unavailable: {}", err))
    }
}
