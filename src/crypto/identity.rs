//! Ed25519 Signatur-Identität für das Signaling
//!
//! Jede ausgehende Signaling-Nachricht wird mit diesem Schlüssel signiert,
//! damit das Relay (und die Gegenseite) den Absender prüfen kann.
//! Ohne konfigurierten Pfad wird pro Prozess ein flüchtiger Schlüssel erzeugt.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Failed to access key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode base64: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Signature missing from envelope")]
    MissingSignature,

    #[error("Signature does not match envelope")]
    BadSignature,
}

// ============================================================================
// SIGNING IDENTITY
// ============================================================================

/// Schlüssel, mit dem der Signaling Client seine Nachrichten signiert
#[derive(Clone)]
pub struct SigningIdentity {
    signing_key: SigningKey,
}

impl SigningIdentity {
    /// Erzeugt einen neuen zufälligen Schlüssel
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// Lädt den Schlüssel von `path` oder legt dort einen neuen an
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            tracing::info!("Loading signing key from {:?}", path);
            let encoded = fs::read_to_string(path)?;
            let bytes = BASE64.decode(encoded.trim())?;
            let key_bytes: [u8; 32] =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| IdentityError::InvalidLength {
                        expected: 32,
                        actual: bytes.len(),
                    })?;
            return Ok(Self {
                signing_key: SigningKey::from_bytes(&key_bytes),
            });
        }

        tracing::info!("Creating signing key at {:?}", path);
        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Nur der Owner darf den Private Key lesen, schon beim Anlegen
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(BASE64.encode(identity.signing_key.to_bytes()).as_bytes())?;

        Ok(identity)
    }

    /// Public Key als Base64 (32 Bytes -> 44 Zeichen)
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Signiert ein Envelope-Objekt
    ///
    /// Signiert wird der JSON-String aller Felder außer `signature`,
    /// rekursiv alphabetisch nach Keys sortiert.
    pub fn sign_envelope(&self, envelope: &Value) -> String {
        let canonical = canonical_json(envelope);
        let signature: Signature = self.signing_key.sign(canonical.as_bytes());
        BASE64.encode(signature.to_bytes())
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

/// Prüft die `signature` eines empfangenen Envelopes gegen `public_key` (Base64)
pub fn verify_envelope(public_key: &str, envelope: &Value) -> Result<(), IdentityError> {
    let key_bytes = BASE64.decode(public_key)?;
    let key_bytes: [u8; 32] =
        key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidLength {
                expected: 32,
                actual: key_bytes.len(),
            })?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| IdentityError::InvalidPublicKey)?;

    let signature = envelope
        .get("signature")
        .and_then(Value::as_str)
        .ok_or(IdentityError::MissingSignature)?;
    let sig_bytes = BASE64.decode(signature)?;
    let sig_bytes: [u8; 64] =
        sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidLength {
                expected: 64,
                actual: sig_bytes.len(),
            })?;

    verifying_key
        .verify(
            canonical_json(envelope).as_bytes(),
            &Signature::from_bytes(&sig_bytes),
        )
        .map_err(|_| IdentityError::BadSignature)
}

fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sorted_without_signature(value, true)).unwrap_or_default()
}

fn sorted_without_signature(value: &Value, top_level: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                if top_level && key == "signature" {
                    continue;
                }
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sorted_without_signature(v, false));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| sorted_without_signature(v, false))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
