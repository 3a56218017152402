//! Crypto Module - Ed25519 Identität
//!
//! Dieses Modul verwaltet die kryptographische Identität des Teilnehmers:
//! - Ed25519 Schlüsselpaar, flüchtig oder persistent gespeichert
//! - Signierung von Nachrichten für das Relay
//!

mod identity;

pub use identity::{verify_envelope, IdentityError, SigningIdentity};
