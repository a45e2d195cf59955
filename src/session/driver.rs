//! Session Driver
//!
//! Ein tokio Task besitzt den Call Negotiator und arbeitet Kommandos der
//! Shell und Events von Relay, Negotiation und Geräten nacheinander ab.
//! Geräte-Zugriffe laufen in eigenen Tasks und melden sich über den
//! Event-Kanal zurück.

use super::error::CallError;
use super::events::{EventSink, EventStream, SessionEvent};
use super::negotiator::{AcquireRequest, CallNegotiator, Outcome};
use crate::media::MediaAcquirer;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// COMMANDS
// ============================================================================

enum Command {
    PlaceCall {
        remote_id: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    EndCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Shutdown,
}

/// Handle für die Presentation Shell und die Adapter
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: EventSink,
}

impl SessionHandle {
    /// Startet einen ausgehenden Anruf. Guard-Fehler kommen direkt zurück.
    pub async fn place_call(&self, remote_id: impl Into<String>) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::PlaceCall {
                remote_id: remote_id.into(),
                reply,
            })
            .map_err(|_| CallError::SessionStopped)?;

        rx.await.map_err(|_| CallError::SessionStopped)?
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::EndCall { reply })
            .map_err(|_| CallError::SessionStopped)?;

        rx.await.map_err(|_| CallError::SessionStopped)?
    }

    /// Kanal für Relay-, Negotiation- und Geräte-Events
    pub fn event_sink(&self) -> EventSink {
        self.events.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

// ============================================================================
// SESSION DRIVER
// ============================================================================

pub struct SessionDriver {
    negotiator: CallNegotiator,
    acquirer: MediaAcquirer,
    commands: mpsc::UnboundedReceiver<Command>,
    events_rx: EventStream,
    events_tx: EventSink,
}

impl SessionDriver {
    /// `events` kommt aus `event_channel()`, damit Adapter den Sender
    /// schon vor dem Driver bekommen können
    pub fn new(
        negotiator: CallNegotiator,
        acquirer: MediaAcquirer,
        events: (EventSink, EventStream),
    ) -> (Self, SessionHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = events;

        let handle = SessionHandle {
            commands: command_tx,
            events: events_tx.clone(),
        };
        let driver = Self {
            negotiator,
            acquirer,
            commands,
            events_rx,
            events_tx,
        };

        (driver, handle)
    }

    /// Event-Loop bis `shutdown()` oder bis alle Handles weg sind
    pub async fn run(mut self) {
        tracing::info!("Call session started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::PlaceCall { remote_id, reply }) => {
                        let result = self.dispatch(SessionEvent::PlaceCall { remote_id });
                        let _ = reply.send(result.map(|_| ()));
                    }
                    Some(Command::EndCall { reply }) => {
                        let result = self.dispatch(SessionEvent::EndCall);
                        let _ = reply.send(result.map(|_| ()));
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = self.events_rx.recv() => {
                    if let Err(e) = self.dispatch(event) {
                        tracing::debug!("Event rejected: {}", e);
                    }
                }
            }
        }

        // Liegengebliebene Events tragen evtl. noch Streams
        self.events_rx.close();
        while let Ok(event) = self.events_rx.try_recv() {
            Self::discard(event);
        }

        self.negotiator.shutdown();
        tracing::info!("Call session stopped");
    }

    /// Gibt Ressourcen eines nicht mehr verarbeiteten Events frei
    fn discard(event: SessionEvent) {
        tracing::debug!("Dropping {} after shutdown", event.name());
        match event {
            SessionEvent::MediaAcquired {
                result: Ok(stream), ..
            }
            | SessionEvent::RemoteStreamAvailable { stream, .. } => {
                stream.release();
            }
            SessionEvent::IncomingNegotiation(negotiation) => negotiation.close(),
            _ => {}
        }
    }

    fn dispatch(&mut self, event: SessionEvent) -> Result<Outcome, CallError> {
        let outcome = self.negotiator.handle(event)?;
        if let Outcome::AcquireMedia(request) = outcome {
            self.spawn_acquisition(request);
        }
        Ok(outcome)
    }

    fn spawn_acquisition(&self, request: AcquireRequest) {
        let acquirer = self.acquirer.clone();
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let result = acquirer.acquire(request.constraints).await;
            let event = SessionEvent::MediaAcquired {
                attempt: request.attempt,
                result,
            };

            // Session ist weg, Stream darf nicht leaken
            if let Err(mpsc::error::SendError(SessionEvent::MediaAcquired {
                result: Ok(stream),
                ..
            })) = events.send(event)
            {
                tracing::warn!("Session stopped before media arrived, releasing");
                stream.release();
            }
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
