//! Konfiguration
//!
//! Defaults entsprechen der ursprünglichen App (Google STUN + öffentlicher
//! TURN-Server). Alles kann über `PEERCALL_*` Umgebungsvariablen
//! überschrieben werden.

use crate::media::MediaConstraints;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:9000/peerjs";

pub const ENV_RELAY_URL: &str = "PEERCALL_RELAY_URL";
pub const ENV_TURN_URL: &str = "PEERCALL_TURN_URL";
pub const ENV_TURN_USERNAME: &str = "PEERCALL_TURN_USERNAME";
pub const ENV_TURN_CREDENTIAL: &str = "PEERCALL_TURN_CREDENTIAL";
pub const ENV_AUDIO: &str = "PEERCALL_AUDIO";
pub const ENV_VIDEO: &str = "PEERCALL_VIDEO";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid relay URL '{url}': {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("No ICE servers configured")]
    NoIceServers,

    #[error("At least one TURN server is required for relayed transport")]
    NoRelayServer,

    #[error("ICE server entry without URLs")]
    EmptyIceServer,

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },
}

// ============================================================================
// ICE SERVERS
// ============================================================================

/// Ein STUN- oder TURN-Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Unterstützt der Server Relayed Transport (TURN)?
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Standard STUN/TURN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig::stun("stun:stun.l.google.com:19302"),
        IceServerConfig::turn("turn:numb.viagenie.ca", "webrtc@live.com", "muazkh"),
    ]
}

// ============================================================================
// APP CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// WebSocket-URL des Relays
    pub relay_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub constraints: MediaConstraints,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_secs")]
    pub registration_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            ice_servers: default_ice_servers(),
            constraints: MediaConstraints::default(),
            heartbeat_interval: Duration::from_secs(25),
            registration_timeout: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    /// Liest die Konfiguration aus der Umgebung (Defaults für fehlende Werte)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Wie `from_env`, aber mit beliebiger Quelle (für Tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_RELAY_URL) {
            config.relay_url = url;
        }

        // Eigener TURN-Server ersetzt den öffentlichen
        if let Some(turn_url) = lookup(ENV_TURN_URL) {
            config.ice_servers.retain(|s| !s.is_relay());
            config.ice_servers.push(IceServerConfig {
                urls: vec![turn_url],
                username: lookup(ENV_TURN_USERNAME),
                credential: lookup(ENV_TURN_CREDENTIAL),
            });
        }

        if let Some(value) = lookup(ENV_AUDIO) {
            config.constraints.audio = parse_flag(ENV_AUDIO, value)?;
        }
        if let Some(value) = lookup(ENV_VIDEO) {
            config.constraints.video = parse_flag(ENV_VIDEO, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Prüft Relay-URL und ICE-Server
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.relay_url).map_err(|e| ConfigError::InvalidRelayUrl {
            url: self.relay_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidRelayUrl {
                url: self.relay_url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        if self.ice_servers.is_empty() {
            return Err(ConfigError::NoIceServers);
        }
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(ConfigError::EmptyIceServer);
        }
        if !self.ice_servers.iter().any(IceServerConfig::is_relay) {
            return Err(ConfigError::NoRelayServer);
        }

        Ok(())
    }
}

fn parse_flag(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { var, value }),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

// ============================================================================
// TESTS
// ============================================================================
