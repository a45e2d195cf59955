//! Relay Module - Identity Registrar Client
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay-Server:
//! - WebSocket-Verbindung aufbauen und halten
//! - Session-ID vom Relay erhalten
//! - Offers, Answers und ICE Candidates weiterleiten
//!

mod client;
mod messages;

pub use client::{RelayClient, RelayError, RelayErrorKind, RelayEvent, RelaySink};
pub use messages::*;
