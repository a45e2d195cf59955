//! Negotiation Module - Offer/Answer-Austausch und Media-Transport
//!
//! Der Call Negotiator sieht nur die beiden Traits `Dialer` und
//! `Negotiation`. Ergebnisse (Remote-Stream, Schließen) kommen nicht als
//! Rückgabewerte, sondern als `SessionEvent`s mit der `NegotiationId`.

mod rtc;

pub use rtc::{ice_servers_from_config, WebRtcDialer, WebRtcNegotiation};

use crate::media::MediaStream;
use crate::relay::RelayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Negotiation was already answered")]
    AlreadyAnswered,

    #[error("Only incoming negotiations can be answered")]
    NotIncoming,

    #[error("Negotiation is closed")]
    Closed,

    #[error("Peer {0} is unavailable")]
    PeerUnavailable(String),

    #[error("{0}")]
    ConnectionFailed(String),
}

// ============================================================================
// TYPES
// ============================================================================

/// Eindeutige ID einer Negotiation (entspricht der `connectionId` im Relay)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NegotiationId(String);

impl NegotiationId {
    /// Neue ID im Format `mc_<uuid>`
    pub fn generate() -> Self {
        Self(format!("mc_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NegotiationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for NegotiationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NegotiationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grund für das Schließen einer Negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Lokal über `close()` geschlossen
    Local,
    /// Gegenseite hat aufgelegt
    Remote,
    /// Verbindungsaufbau oder Transport fehlgeschlagen
    Failed(NegotiationError),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Handle auf einen einzelnen Offer/Answer-Austausch.
///
/// `close()` muss genau eine `NegotiationClosed`-Notification auslösen,
/// synchron oder asynchron.
pub trait Negotiation: Send + Sync + fmt::Debug {
    fn id(&self) -> &NegotiationId;

    fn remote_id(&self) -> &str;

    /// Beantwortet eine eingehende Negotiation mit dem lokalen Stream
    fn answer(&self, local: &MediaStream) -> Result<(), NegotiationError>;

    fn close(&self);
}

/// Öffnet ausgehende Negotiations über das Relay
pub trait Dialer: Send + Sync {
    fn call(
        &self,
        remote_id: &str,
        local: &MediaStream,
    ) -> Result<Box<dyn Negotiation>, NegotiationError>;
}
