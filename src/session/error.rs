//! Fehler-Taxonomie der Call Session

use crate::media::MediaAccessError;
use crate::negotiation::NegotiationError;
use crate::relay::RelayErrorKind;
use thiserror::Error;

/// Verletzte Vorbedingung eines Nutzer-Kommandos
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardViolation {
    #[error("missing remote id")]
    MissingRemoteId,

    #[error("no session identity assigned yet")]
    NotRegistered,

    #[error("a call is already in progress")]
    CallInProgress,
}

/// Relay-Verbindungs- oder Protokollfehler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("relay registration error ({kind}): {message}")]
pub struct RegistrationError {
    pub kind: RelayErrorKind,
    pub message: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("media access failed: {0}")]
    MediaAccess(#[from] MediaAccessError),

    #[error("guard violation: {0}")]
    Guard(#[from] GuardViolation),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("call session is not running")]
    SessionStopped,
}
