//! Call Negotiator
//!
//! Synchrone Zustandsmaschine über genau einen Call Attempt. Alle
//! Eingaben kommen als `SessionEvent`, jedes Event ist genau ein
//! Übergangsversuch. Abgelehnte Events werden geloggt, der State bleibt.
//!
//! Streams werden nur an zwei Stellen freigegeben: in `teardown` und beim
//! Verwerfen veralteter Ergebnisse.

use super::error::{CallError, GuardViolation};
use super::events::SessionEvent;
use super::reporter::{EndCause, SessionReporter, Transition};
use super::state::{AttemptId, CallAttempt, CallState, Direction, SessionId};
use crate::media::{MediaAccessError, MediaConstraints, MediaStream};
use crate::negotiation::{CloseReason, Dialer, Negotiation, NegotiationError, NegotiationId};
use chrono::Utc;
use std::sync::Arc;

// ============================================================================
// OUTCOME
// ============================================================================

/// Auftrag an den Driver, lokale Medien anzufordern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireRequest {
    pub attempt: AttemptId,
    pub constraints: MediaConstraints,
}

/// Ergebnis eines verarbeiteten Events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Neuer State wurde betreten
    Transitioned(CallState),
    /// Neuer Attempt wartet auf Kamera/Mikrofon
    AcquireMedia(AcquireRequest),
    /// Negotiation wird geschlossen, Teardown folgt mit der Notification
    Closing,
    Unchanged,
}

// ============================================================================
// CALL NEGOTIATOR
// ============================================================================

pub struct CallNegotiator {
    state: CallState,
    attempt: Option<CallAttempt>,
    identity: Option<SessionId>,
    dialer: Arc<dyn Dialer>,
    reporter: SessionReporter,
    constraints: MediaConstraints,
    next_attempt: u64,
}

impl CallNegotiator {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        reporter: SessionReporter,
        constraints: MediaConstraints,
    ) -> Self {
        Self {
            state: CallState::Idle,
            attempt: None,
            identity: None,
            dialer,
            reporter,
            constraints,
            next_attempt: 1,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn identity(&self) -> Option<&SessionId> {
        self.identity.as_ref()
    }

    pub fn reporter(&self) -> &SessionReporter {
        &self.reporter
    }

    /// Verarbeitet ein Event.
    ///
    /// `Err` gibt es nur für abgelehnte Nutzer-Kommandos (Guards). Alle
    /// anderen Fehler beenden den Attempt und werden über den Reporter
    /// angezeigt.
    pub fn handle(&mut self, event: SessionEvent) -> Result<Outcome, CallError> {
        tracing::debug!("Handling {} in state {:?}", event.name(), self.state);

        let outcome = match event {
            SessionEvent::IdentityAssigned(id) => {
                self.identity_assigned(id);
                Ok(Outcome::Unchanged)
            }
            SessionEvent::RegistrationFailed(error) => {
                self.reporter.error(&CallError::Registration(error));
                Ok(Outcome::Unchanged)
            }
            SessionEvent::IncomingNegotiation(negotiation) => Ok(self.incoming(negotiation)),
            SessionEvent::MediaAcquired { attempt, result } => {
                Ok(self.media_acquired(attempt, result))
            }
            SessionEvent::RemoteStreamAvailable {
                negotiation,
                stream,
            } => Ok(self.remote_stream(&negotiation, stream)),
            SessionEvent::NegotiationClosed {
                negotiation,
                reason,
            } => Ok(self.negotiation_closed(&negotiation, reason)),
            SessionEvent::PlaceCall { remote_id } => self.place_call(&remote_id),
            SessionEvent::EndCall => Ok(self.end_call()),
        };

        debug_assert_eq!(self.attempt.is_some(), !self.state.is_idle());
        outcome
    }

    /// Beendet einen laufenden Attempt beim Herunterfahren
    pub fn shutdown(&mut self) {
        if let Some(attempt) = self.attempt.as_ref() {
            tracing::info!("Shutting down with active call to {}", attempt.remote_id);
            if let Some(negotiation) = attempt.negotiation.as_ref() {
                negotiation.close();
            }
            self.teardown(EndCause::Local);
        }
    }

    // ========================================================================
    // RELAY
    // ========================================================================

    fn identity_assigned(&mut self, id: SessionId) {
        match &self.identity {
            None => {
                self.reporter.identity(&id);
                self.identity = Some(id);
            }
            Some(existing) if *existing == id => {
                tracing::debug!("Session id {} confirmed again", id);
            }
            Some(existing) => {
                tracing::warn!(
                    "Ignoring session id {}, already registered as {}",
                    id,
                    existing
                );
            }
        }
    }

    fn incoming(&mut self, negotiation: Box<dyn Negotiation>) -> Outcome {
        if !self.state.is_idle() {
            tracing::warn!(
                "Rejecting call from {} ({}): busy",
                negotiation.remote_id(),
                negotiation.id()
            );
            negotiation.close();
            return Outcome::Unchanged;
        }

        let remote_id = negotiation.remote_id().to_string();
        tracing::info!("Incoming call from {} ({})", remote_id, negotiation.id());

        let id = self.next_attempt_id();
        self.attempt = Some(CallAttempt::new(
            id,
            Direction::Inbound,
            remote_id.clone(),
            Some(negotiation),
        ));
        self.enter(
            CallState::AwaitingLocalMedia(Direction::Inbound),
            Transition::IncomingCall { remote_id },
        );

        Outcome::AcquireMedia(AcquireRequest {
            attempt: id,
            constraints: self.constraints,
        })
    }

    // ========================================================================
    // USER COMMANDS
    // ========================================================================

    fn place_call(&mut self, remote_id: &str) -> Result<Outcome, CallError> {
        let remote_id = remote_id.trim();
        if remote_id.is_empty() {
            return Err(self.reject(GuardViolation::MissingRemoteId));
        }
        if self.identity.is_none() {
            return Err(self.reject(GuardViolation::NotRegistered));
        }
        if !self.state.is_idle() {
            return Err(self.reject(GuardViolation::CallInProgress));
        }

        let id = self.next_attempt_id();
        tracing::info!("Starting call attempt {} to {}", id, remote_id);

        self.attempt = Some(CallAttempt::new(
            id,
            Direction::Outbound,
            remote_id.to_string(),
            None,
        ));
        self.enter(
            CallState::AwaitingLocalMedia(Direction::Outbound),
            Transition::OutboundRequested {
                remote_id: remote_id.to_string(),
            },
        );

        Ok(Outcome::AcquireMedia(AcquireRequest {
            attempt: id,
            constraints: self.constraints,
        }))
    }

    fn end_call(&mut self) -> Outcome {
        let state = self.state;
        let Some(attempt) = self.attempt.as_mut() else {
            tracing::debug!("End call without active call");
            return Outcome::Unchanged;
        };

        if let CallState::AwaitingLocalMedia(_) = state {
            // Späte Medien-Ergebnisse werden als veraltet verworfen
            if let Some(negotiation) = attempt.negotiation.as_ref() {
                negotiation.close();
            }
            return self.teardown(EndCause::Cancelled);
        }

        if attempt.closing.is_some() {
            tracing::debug!("Call to {} is already closing", attempt.remote_id);
            return Outcome::Unchanged;
        }

        match attempt.negotiation.as_ref() {
            Some(negotiation) => {
                tracing::info!("Hanging up {} ({})", attempt.remote_id, negotiation.id());
                attempt.closing = Some(EndCause::Local);
                negotiation.close();
                Outcome::Closing
            }
            None => self.teardown(EndCause::Local),
        }
    }

    fn reject(&self, violation: GuardViolation) -> CallError {
        tracing::warn!("Call request rejected: {}", violation);
        let error = CallError::Guard(violation);
        self.reporter.error(&error);
        error
    }

    // ========================================================================
    // MEDIA
    // ========================================================================

    fn media_acquired(
        &mut self,
        attempt_id: AttemptId,
        result: Result<MediaStream, MediaAccessError>,
    ) -> Outcome {
        let direction = match (self.state, self.attempt.as_ref()) {
            (CallState::AwaitingLocalMedia(direction), Some(attempt))
                if attempt.id == attempt_id =>
            {
                direction
            }
            _ => {
                tracing::warn!("Discarding stale media result for attempt {}", attempt_id);
                if let Ok(stream) = result {
                    stream.release();
                }
                return Outcome::Unchanged;
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => return self.teardown(EndCause::MediaFailed(e)),
        };

        match direction {
            Direction::Outbound => self.dial(stream),
            Direction::Inbound => self.answer(stream),
        }
    }

    fn dial(&mut self, stream: MediaStream) -> Outcome {
        let Some(attempt) = self.attempt.as_mut() else {
            stream.release();
            return Outcome::Unchanged;
        };

        let result = self.dialer.call(&attempt.remote_id, &stream);
        attempt.local = Some(stream);

        match result {
            Ok(negotiation) => {
                tracing::info!("Calling {} ({})", attempt.remote_id, negotiation.id());
                attempt.negotiation = Some(negotiation);
                let remote_id = attempt.remote_id.clone();

                self.publish_streams();
                self.enter(
                    CallState::Negotiating(Direction::Outbound),
                    Transition::Dialing { remote_id },
                )
            }
            Err(e) => {
                tracing::error!("Failed to call {}: {}", attempt.remote_id, e);
                self.teardown(EndCause::Failed(e))
            }
        }
    }

    fn answer(&mut self, stream: MediaStream) -> Outcome {
        let Some(attempt) = self.attempt.as_mut() else {
            stream.release();
            return Outcome::Unchanged;
        };

        let answered = match attempt.negotiation.as_ref() {
            Some(negotiation) => negotiation.answer(&stream),
            None => Err(NegotiationError::Closed),
        };
        attempt.local = Some(stream);
        let remote_id = attempt.remote_id.clone();

        match answered {
            Ok(()) => {
                tracing::info!("Answering call from {}", remote_id);
                self.publish_streams();
                self.enter(
                    CallState::Negotiating(Direction::Inbound),
                    Transition::Answering { remote_id },
                )
            }
            Err(e) => {
                tracing::error!("Failed to answer call from {}: {}", remote_id, e);
                if let Some(negotiation) = attempt.negotiation.as_ref() {
                    negotiation.close();
                }
                self.teardown(EndCause::Failed(e))
            }
        }
    }

    // ========================================================================
    // NEGOTIATION
    // ========================================================================

    fn remote_stream(&mut self, negotiation: &NegotiationId, stream: MediaStream) -> Outcome {
        let negotiating = matches!(self.state, CallState::Negotiating(_));
        let attempt = match self.attempt.as_mut() {
            Some(attempt)
                if negotiating
                    && attempt.closing.is_none()
                    && attempt.negotiation_id() == Some(negotiation) =>
            {
                attempt
            }
            _ => {
                tracing::warn!(
                    "Discarding remote stream {} from negotiation {}",
                    stream.id(),
                    negotiation
                );
                stream.release();
                return Outcome::Unchanged;
            }
        };

        tracing::info!(
            "Remote stream {} from {} attached",
            stream.id(),
            attempt.remote_id
        );
        attempt.remote = Some(stream);
        attempt.connected_at = Some(Utc::now());

        self.publish_streams();
        self.enter(CallState::InCall, Transition::Connected)
    }

    fn negotiation_closed(&mut self, negotiation: &NegotiationId, reason: CloseReason) -> Outcome {
        let closing = match self.attempt.as_mut() {
            Some(attempt) if attempt.negotiation_id() == Some(negotiation) => {
                attempt.closing.take()
            }
            _ => {
                tracing::debug!("Ignoring closure of negotiation {}", negotiation);
                return Outcome::Unchanged;
            }
        };

        let cause = match (closing, reason) {
            (Some(cause), _) => cause,
            (None, CloseReason::Local) => EndCause::Local,
            (None, CloseReason::Remote) => EndCause::Remote,
            (None, CloseReason::Failed(e)) => EndCause::Failed(e),
        };

        tracing::info!("Negotiation {} closed ({:?})", negotiation, cause);
        self.teardown(cause)
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Einziger Weg zurück nach Idle
    fn teardown(&mut self, cause: EndCause) -> Outcome {
        let Some(attempt) = self.attempt.take() else {
            return Outcome::Unchanged;
        };

        let id = attempt.id;
        let direction = attempt.direction;
        let remote_id = attempt.remote_id.clone();
        let age = attempt.age();
        let duration = attempt.connected_at.map(|t| Utc::now() - t);
        let released = attempt.release();

        tracing::info!(
            "Call attempt {} ({:?}) with {} ended after {}ms, tracks {:?}/{:?}",
            id,
            direction,
            remote_id,
            age.num_milliseconds(),
            released.local_tracks,
            released.remote_tracks
        );
        if let Some(duration) = duration {
            tracing::info!("Call duration: {}s", duration.num_seconds());
        }

        self.publish_streams();
        let outcome = self.enter(CallState::Idle, Transition::Ended(cause.clone()));

        if let Some(error) = cause.error() {
            self.reporter.error(&error);
        }
        if cause.is_user_initiated() {
            self.reporter.remote_id_cleared();
        }

        outcome
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn enter(&mut self, state: CallState, transition: Transition) -> Outcome {
        self.state = state;
        self.reporter.transition(state, &transition);
        Outcome::Transitioned(state)
    }

    fn publish_streams(&self) {
        let (local, remote) = match self.attempt.as_ref() {
            Some(attempt) => (
                attempt.local.as_ref().map(MediaStream::info),
                attempt.remote.as_ref().map(MediaStream::info),
            ),
            None => (None, None),
        };
        self.reporter.streams(local, remote);
    }

    fn next_attempt_id(&mut self) -> AttemptId {
        let id = AttemptId(self.next_attempt);
        self.next_attempt += 1;
        id
    }
}

impl std::fmt::Debug for CallNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallNegotiator")
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================
