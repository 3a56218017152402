//! Peer Connection Negotiator - Schnittstelle
//!
//! Der Negotiator handelt den direkten Audio-Pfad aus (Offer/Answer +
//! Candidates). Die Call Engine kennt nur diese Schnittstelle; die
//! WebRTC-Implementierung liegt in `webrtc.rs`.

use super::audio::MediaStreamHandle;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use crate::signaling::NegotiationPayload;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Failed to set up peer connection: {0}")]
    Setup(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid negotiation payload: {0}")]
    InvalidPayload(String),

    #[error("Negotiation timed out after {0}s")]
    Timeout(u64),
}

impl From<NegotiationError> for super::CallError {
    fn from(err: NegotiationError) -> Self {
        super::CallError::Negotiation(err.to_string())
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Beschreibung des eingehenden Audio-Streams der Gegenseite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStreamInfo {
    pub stream_id: String,
    pub track_id: String,
    pub codec: String,
}

/// Events die ein Negotiator auslöst
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    /// Blob, der an die Gegenseite weitergereicht werden muss
    OutboundSignal(NegotiationPayload),
    RemoteStream(RemoteStreamInfo),
    Connect,
    Close,
    Error(NegotiationError),
}

/// Rückkanal vom Negotiator zur Call Engine
///
/// Jeder Sink gehört zu genau einer Sitzung. Events alter Sitzungen
/// verwirft die Engine.
#[derive(Clone)]
pub struct NegotiatorSink {
    emit: Arc<dyn Fn(NegotiatorEvent) + Send + Sync>,
}

impl NegotiatorSink {
    pub fn new(emit: impl Fn(NegotiatorEvent) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub fn emit(&self, event: NegotiatorEvent) {
        (self.emit)(event);
    }
}

impl std::fmt::Debug for NegotiatorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatorSink").finish_non_exhaustive()
    }
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

/// Eine laufende Aushandlung
///
/// Beide Methoden blockieren nicht; die Arbeit passiert im Negotiator selbst.
pub trait Negotiator: Send + Sync {
    /// Übergibt einen eingehenden Blob der Gegenseite
    fn signal(&self, payload: NegotiationPayload);

    /// Schließt die Verbindung (idempotent)
    fn close(&self);
}

/// Erzeugt Negotiatoren für eine Sitzung
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    /// `initiator` erzeugt das Offer; `local` ist nur für die Dauer der Sitzung geliehen
    async fn create(
        &self,
        initiator: bool,
        local: &MediaStreamHandle,
        sink: NegotiatorSink,
    ) -> Result<Box<dyn Negotiator>, NegotiationError>;
}
