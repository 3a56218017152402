//! Signaling Module - WebSocket Client für das Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Relay:
//! - Verbindung aufbauen und halten (Heartbeat)
//! - Nachrichten signieren und senden
//! - Eingehende Nachrichten parsen und weiterleiten
//!

mod client;
mod messages;
mod transport;

pub use client::{SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
pub use transport::{RelayConnector, RelayLink, WebSocketConnector};
