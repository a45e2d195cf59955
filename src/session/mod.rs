//! Session Module - Call Negotiator, Reporter und Driver
//!
//! Der Kern der Anwendung: genau ein Call Attempt zur Zeit, gesteuert
//! durch typisierte Events.

mod driver;
mod error;
mod events;
mod negotiator;
mod reporter;
mod state;

pub use driver::{SessionDriver, SessionHandle};
pub use error::{CallError, GuardViolation, RegistrationError};
pub use events::{event_channel, CallEvent, EventSink, EventStream, SessionEvent};
pub use negotiator::{AcquireRequest, CallNegotiator, Outcome};
pub use reporter::{
    error_message, status_message, EndCause, SessionReporter, SessionView, Transition,
};
pub use state::{AttemptId, CallState, Direction, SessionId};
