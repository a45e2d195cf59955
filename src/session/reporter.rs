//! Session Reporter
//!
//! Bildet Zustandsübergänge auf Status-Texte und Fehler auf Fehler-Texte
//! ab. Status und Fehler sind unabhängige Kanäle. Jeder Übergang erzeugt
//! genau ein Status-Update, nichts wird gedrosselt oder unterdrückt.

use super::error::{CallError, GuardViolation};
use super::events::CallEvent;
use super::state::{CallState, SessionId};
use crate::media::{MediaAccessError, StreamInfo};
use crate::negotiation::NegotiationError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const STATUS_INITIALIZING: &str = "Initializing...";
pub const STATUS_REGISTERED: &str = "Connected to relay server";

// ============================================================================
// TRANSITIONS
// ============================================================================

/// Warum ein Call Attempt beendet wurde
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndCause {
    /// Lokal aufgelegt
    Local,
    /// Gegenseite hat aufgelegt
    Remote,
    /// Vor dem Medienzugriff abgebrochen
    Cancelled,
    MediaFailed(MediaAccessError),
    Failed(NegotiationError),
}

impl EndCause {
    pub fn is_user_initiated(&self) -> bool {
        matches!(self, EndCause::Local | EndCause::Cancelled)
    }

    /// Fehler, der zusätzlich zum Status angezeigt wird
    pub fn error(&self) -> Option<CallError> {
        match self {
            EndCause::MediaFailed(e) => Some(CallError::MediaAccess(e.clone())),
            EndCause::Failed(e) => Some(CallError::Negotiation(e.clone())),
            _ => None,
        }
    }
}

/// Ein ausgeführter Zustandsübergang
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    OutboundRequested { remote_id: String },
    IncomingCall { remote_id: String },
    Dialing { remote_id: String },
    Answering { remote_id: String },
    Connected,
    Ended(EndCause),
}

impl Transition {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Transition::Ended(EndCause::MediaFailed(_)) | Transition::Ended(EndCause::Failed(_))
        )
    }
}

/// Status-Text für einen Übergang
pub fn status_message(transition: &Transition) -> String {
    match transition {
        Transition::OutboundRequested { .. } => "Initiating call...".to_string(),
        Transition::IncomingCall { .. } => "Incoming call...".to_string(),
        Transition::Dialing { remote_id } => format!("Calling {}...", remote_id),
        Transition::Answering { remote_id } => format!("Answering call from {}...", remote_id),
        Transition::Connected => "Connected to remote peer".to_string(),
        Transition::Ended(EndCause::Local) => "Call ended".to_string(),
        Transition::Ended(EndCause::Remote) => "Remote peer ended the call".to_string(),
        Transition::Ended(EndCause::Cancelled) => "Call cancelled".to_string(),
        Transition::Ended(EndCause::MediaFailed(_)) | Transition::Ended(EndCause::Failed(_)) => {
            "Call failed".to_string()
        }
    }
}

/// Fehler-Text für die Anzeige
pub fn error_message(error: &CallError) -> String {
    match error {
        CallError::Guard(GuardViolation::MissingRemoteId) => {
            "Please enter a remote peer ID".to_string()
        }
        CallError::Guard(GuardViolation::NotRegistered) => {
            "Not connected to relay server yet".to_string()
        }
        CallError::Guard(GuardViolation::CallInProgress) => {
            "A call is already in progress".to_string()
        }
        CallError::MediaAccess(e) => format!("Failed to access camera/microphone: {}", e),
        CallError::Registration(e) => format!("Relay error: {}", e.kind),
        CallError::Negotiation(e) => format!("Connection failed: {}", e),
        CallError::SessionStopped => "Call session is not running".to_string(),
    }
}

// ============================================================================
// SESSION VIEW
// ============================================================================

/// Reaktive Felder für die Presentation Shell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: Option<String>,
    pub status_message: String,
    pub error_message: Option<String>,
    pub call_state: CallState,
    pub remote_peer: Option<String>,
    pub local_stream: Option<StreamInfo>,
    pub remote_stream: Option<StreamInfo>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            session_id: None,
            status_message: STATUS_INITIALIZING.to_string(),
            error_message: None,
            call_state: CallState::Idle,
            remote_peer: None,
            local_stream: None,
            remote_stream: None,
            connected_at: None,
        }
    }
}

// ============================================================================
// SESSION REPORTER
// ============================================================================

#[derive(Clone)]
pub struct SessionReporter {
    view: Arc<RwLock<SessionView>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl SessionReporter {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            view: Arc::new(RwLock::new(SessionView::default())),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Aktueller Snapshot
    pub fn view(&self) -> SessionView {
        self.view.read().clone()
    }

    /// Meldet einen ausgeführten Übergang
    pub fn transition(&self, state: CallState, transition: &Transition) {
        let status = status_message(transition);

        let error_cleared = {
            let mut view = self.view.write();
            view.call_state = state;
            view.status_message = status.clone();

            match transition {
                Transition::OutboundRequested { remote_id }
                | Transition::IncomingCall { remote_id } => {
                    view.remote_peer = Some(remote_id.clone());
                }
                Transition::Connected => view.connected_at = Some(Utc::now()),
                Transition::Ended(_) => {
                    view.remote_peer = None;
                    view.connected_at = None;
                }
                _ => {}
            }

            // Nur ein erfolgreicher Übergang löscht den Fehler
            !transition.is_failure() && view.error_message.take().is_some()
        };

        tracing::info!("Call state -> {:?}: {}", state, status);

        let _ = self.event_tx.send(CallEvent::StateChanged(state));
        let _ = self.event_tx.send(CallEvent::Status(status));
        if error_cleared {
            let _ = self.event_tx.send(CallEvent::ErrorCleared);
        }
    }

    /// Meldet einen Fehler
    pub fn error(&self, error: &CallError) {
        let message = error_message(error);
        tracing::warn!("{} ({})", message, error);

        self.view.write().error_message = Some(message.clone());
        let _ = self.event_tx.send(CallEvent::Error(message));
    }

    /// Meldet die zugewiesene Session-ID
    pub fn identity(&self, id: &SessionId) {
        {
            let mut view = self.view.write();
            view.session_id = Some(id.to_string());
            view.status_message = STATUS_REGISTERED.to_string();
        }

        tracing::info!("My session id is: {}", id);

        let _ = self
            .event_tx
            .send(CallEvent::IdentityAssigned(id.to_string()));
        let _ = self
            .event_tx
            .send(CallEvent::Status(STATUS_REGISTERED.to_string()));
    }

    /// Meldet die aktuell gebundenen Streams
    pub fn streams(&self, local: Option<StreamInfo>, remote: Option<StreamInfo>) {
        {
            let mut view = self.view.write();
            if view.local_stream == local && view.remote_stream == remote {
                return;
            }
            view.local_stream = local.clone();
            view.remote_stream = remote.clone();
        }
        let _ = self
            .event_tx
            .send(CallEvent::StreamsChanged { local, remote });
    }

    pub fn remote_id_cleared(&self) {
        let _ = self.event_tx.send(CallEvent::RemoteIdCleared);
    }
}

impl Default for SessionReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReporter")
            .field("view", &*self.view.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
