//! Zustände und Call Attempt

use crate::media::MediaStream;
use crate::negotiation::{Negotiation, NegotiationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::reporter::EndCause;

// ============================================================================
// SESSION IDENTITY
// ============================================================================

/// Vom Relay vergebene Session-ID, unveränderlich nach Zuweisung
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Aktueller Status des Call Negotiators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "direction", rename_all = "snake_case")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Warten auf Kamera/Mikrofon
    AwaitingLocalMedia(Direction),
    /// Offer/Answer läuft
    Negotiating(Direction),
    /// Remote-Stream ist da
    InCall,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle)
    }
}

/// Laufende Nummer eines Call Attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(pub(crate) u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// CALL ATTEMPT
// ============================================================================

/// Ein logischer Anruf. Existiert genau dann, wenn der State nicht Idle ist.
#[derive(Debug)]
pub(crate) struct CallAttempt {
    pub id: AttemptId,
    pub direction: Direction,
    pub remote_id: String,
    pub local: Option<MediaStream>,
    pub remote: Option<MediaStream>,
    pub negotiation: Option<Box<dyn Negotiation>>,
    /// Gesetzt sobald lokal das Schließen angestoßen wurde
    pub closing: Option<EndCause>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// Anzahl gestoppter Tracks pro Stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Released {
    pub local_tracks: Option<usize>,
    pub remote_tracks: Option<usize>,
}

impl CallAttempt {
    pub fn new(
        id: AttemptId,
        direction: Direction,
        remote_id: String,
        negotiation: Option<Box<dyn Negotiation>>,
    ) -> Self {
        Self {
            id,
            direction,
            remote_id,
            local: None,
            remote: None,
            negotiation,
            closing: None,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    /// Zeit seit Beginn des Attempts (inkl. Warten auf Geräte)
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    pub fn negotiation_id(&self) -> Option<&NegotiationId> {
        self.negotiation.as_ref().map(|n| n.id())
    }

    /// Gibt lokale und Remote-Streams frei und verwirft die Negotiation
    pub fn release(self) -> Released {
        let released = Released {
            local_tracks: self.local.map(MediaStream::release),
            remote_tracks: self.remote.map(MediaStream::release),
        };
        drop(self.negotiation);
        released
    }
}
