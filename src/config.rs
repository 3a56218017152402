//! Konfiguration des Call-Orchestrators
//!
//! Reihenfolge: Defaults -> `config.json` im Plattform-Konfigurationsverzeichnis
//! -> Umgebungsvariablen (`SIGNALING_URL`, `PULSE_STUN_URLS`).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8787";

const CONFIG_FILE_NAME: &str = "config.json";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid signaling URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

// ============================================================================
// CALL CONFIG
// ============================================================================

/// Laufzeit-Konfiguration für einen `CallSessionManager`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Adresse des Signaling-Relays (`ws://`, `wss://`, `http://` oder `https://`)
    pub signaling_url: String,
    /// STUN Server für die ICE-Aushandlung
    pub stun_urls: Vec<String>,
    pub negotiation_timeout_secs: u64,
    /// Wie lange der Zustand `ended` sichtbar bleibt, bevor auf `idle` zurückgesetzt wird
    pub ended_linger_ms: u64,
    /// Keep-Alive Intervall Richtung Relay, `None` schaltet es ab
    pub heartbeat_secs: Option<u64>,
    pub send_queue: usize,
    pub identity_key_path: Option<PathBuf>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            negotiation_timeout_secs: 30,
            ended_linger_ms: 500,
            heartbeat_secs: Some(25),
            send_queue: 100,
            identity_key_path: None,
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus dem Plattform-Verzeichnis und der Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Lädt die Konfiguration aus einer JSON-Datei
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(serde_json::from_str(&raw)?)
    }

    /// `config.json` im Konfigurationsverzeichnis der Anwendung
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "questxen", "pulse-call")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SIGNALING_URL") {
            self.signaling_url = url;
        }
        if let Some(urls) = lookup("PULSE_STUN_URLS") {
            self.stun_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// WebSocket-URL des Relays: `http(s)` wird zu `ws(s)`, ohne Pfad wird `/ws` angehängt
    pub fn websocket_url(&self) -> Result<url::Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: self.signaling_url.clone(),
            reason,
        };

        let mut url = url::Url::parse(&self.signaling_url).map_err(|e| invalid(e.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid(format!("unsupported scheme '{}'", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| invalid("cannot change scheme".to_string()))?;
        if url.path().is_empty() || url.path() == "/" {
            url.set_path("/ws");
        }
        Ok(url)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn ended_linger(&self) -> Duration {
        Duration::from_millis(self.ended_linger_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

// ============================================================================
// TESTS
// ============================================================================
