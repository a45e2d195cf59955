//! Typisierte Events in die Session und aus ihr heraus

use super::error::RegistrationError;
use super::state::{AttemptId, CallState, SessionId};
use crate::media::{MediaAccessError, MediaStream, StreamInfo};
use crate::negotiation::{CloseReason, Negotiation, NegotiationId};
use tokio::sync::mpsc;

/// Sender, über den Relay, Negotiation und Geräte-Tasks Events einspeisen
pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

/// Empfangsseite, gehört dem `SessionDriver`
pub type EventStream = mpsc::UnboundedReceiver<SessionEvent>;

/// Erstellt den Event-Kanal der Session
pub fn event_channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

// ============================================================================
// INPUT EVENTS
// ============================================================================

/// Alles, was den Call Negotiator erreicht
#[derive(Debug)]
pub enum SessionEvent {
    // Relay
    IdentityAssigned(SessionId),
    RegistrationFailed(RegistrationError),
    IncomingNegotiation(Box<dyn Negotiation>),

    // Geräte-Zugriff
    MediaAcquired {
        attempt: AttemptId,
        result: Result<MediaStream, MediaAccessError>,
    },

    // Negotiation
    RemoteStreamAvailable {
        negotiation: NegotiationId,
        stream: MediaStream,
    },
    NegotiationClosed {
        negotiation: NegotiationId,
        reason: CloseReason,
    },

    // Presentation Shell
    PlaceCall { remote_id: String },
    EndCall,
}

impl SessionEvent {
    /// Kurzname für Logs
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::IdentityAssigned(_) => "identity-assigned",
            SessionEvent::RegistrationFailed(_) => "registration-failed",
            SessionEvent::IncomingNegotiation(_) => "incoming-negotiation",
            SessionEvent::MediaAcquired { .. } => "media-acquired",
            SessionEvent::RemoteStreamAvailable { .. } => "remote-stream-available",
            SessionEvent::NegotiationClosed { .. } => "negotiation-closed",
            SessionEvent::PlaceCall { .. } => "place-call",
            SessionEvent::EndCall => "end-call",
        }
    }
}

// ============================================================================
// OUTPUT EVENTS
// ============================================================================

/// Events für die Presentation Shell
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallState),
    Status(String),
    Error(String),
    ErrorCleared,
    IdentityAssigned(String),
    StreamsChanged {
        local: Option<StreamInfo>,
        remote: Option<StreamInfo>,
    },
    /// Eingabefeld für die Remote-ID leeren
    RemoteIdCleared,
}
