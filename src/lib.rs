//! Pulse Call - Anrufsteuerung für 1:1 Audio-Anrufe
//!
//! Orchestriert einen Anruf zwischen zwei Teilnehmern:
//! - Signaling-Relay über WebSocket (signierte Nachrichten)
//! - WebRTC für die direkte Audio-Verbindung
//! - Mikrofon über cpal
//! - Ed25519 Identität

pub mod call_engine;
pub mod config;
pub mod crypto;
pub mod signaling;

pub use call_engine::{
    format_duration, CallDirection, CallError, CallEvent, CallSession, CallSessionManager,
    CallState, CallStatus, StateErrorKind, TerminationKind,
};
pub use config::{CallConfig, ConfigError};

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "pulse_call=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// Liest `RUST_LOG`, sonst `pulse_call=debug,webrtc=warn`. Ein zweiter Aufruf
/// ändert nichts.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::debug!("Logging initialized");
    }
}

// ============================================================================
// TESTS
// ============================================================================
