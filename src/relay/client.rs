//! WebSocket Client für den Relay-Server
//!
//! Verwaltet die Verbindung zum Relay:
//! - Session-ID beim Verbindungsaufbau erhalten (`OPEN`)
//! - Heartbeat-Keeping
//! - Event-basierte Weitergabe von Offers, Answers und Candidates
//!
//! Es gibt keine automatische Reconnection.

use super::messages::*;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehlerarten des Relays (angelehnt an die PeerJS Error-Types)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayErrorKind {
    Network,
    SocketError,
    SocketClosed,
    ServerError,
    UnavailableId,
    InvalidKey,
    PeerUnavailable,
    Timeout,
}

impl fmt::Display for RelayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayErrorKind::Network => "network",
            RelayErrorKind::SocketError => "socket-error",
            RelayErrorKind::SocketClosed => "socket-closed",
            RelayErrorKind::ServerError => "server-error",
            RelayErrorKind::UnavailableId => "unavailable-id",
            RelayErrorKind::InvalidKey => "invalid-key",
            RelayErrorKind::PeerUnavailable => "peer-unavailable",
            RelayErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(RelayErrorKind),
}

impl RelayError {
    pub fn kind(&self) -> RelayErrorKind {
        match self {
            RelayError::ConnectionFailed(_) => RelayErrorKind::Network,
            RelayError::NotConnected => RelayErrorKind::SocketClosed,
            RelayError::SendFailed(_) => RelayErrorKind::SocketError,
            RelayError::RegistrationFailed(kind) => *kind,
        }
    }
}

// ============================================================================
// RELAY EVENTS
// ============================================================================

/// Events die vom RelayClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Session-ID zugewiesen
    Open { id: String },

    /// Protokoll- oder Transportfehler (nicht fatal)
    Error { kind: RelayErrorKind, message: String },

    /// Eingehendes Offer
    Offer { src: String, payload: SdpPayload },

    /// Answer auf ein eigenes Offer
    Answer { src: String, payload: SdpPayload },

    /// ICE Candidate vom Peer
    Candidate {
        src: String,
        payload: CandidatePayload,
    },

    /// Peer hat aufgelegt (ohne `connection_id`: alle Verbindungen zu `src`)
    Leave {
        src: String,
        connection_id: Option<String>,
    },

    /// Peer nicht erreichbar
    Expire { src: String },

    /// WebSocket getrennt
    Disconnected,
}

// ============================================================================
// RELAY SINK
// ============================================================================

/// Ausgehende Richtung des Relays, wird von der Negotiation benutzt
pub trait RelaySink: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<(), RelayError>;

    /// Registriert und Socket offen
    fn is_connected(&self) -> bool;
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    session_id: Option<String>,
    /// Lokal getrennt, der Read-Task meldet nichts mehr
    closed_locally: bool,
}

// ============================================================================
// RELAY CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct RelayClient {
    url: String,
    heartbeat_interval: Duration,
    registration_timeout: Duration,
    state: Arc<RwLock<ClientState>>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
    event_tx: broadcast::Sender<RelayEvent>,
}

impl RelayClient {
    /// Erstellt einen neuen RelayClient
    pub fn new(url: String, heartbeat_interval: Duration, registration_timeout: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            url,
            heartbeat_interval,
            registration_timeout,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: RwLock::new(None),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt die zugewiesene Session-ID zurück (falls registriert)
    pub fn session_id(&self) -> Option<String> {
        self.state.read().session_id.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Relay und wartet auf die Session-ID.
    ///
    /// Jeder Fehler wird zusätzlich als `RelayEvent::Error` gemeldet.
    pub async fn connect(&self) -> Result<String, RelayError> {
        let result = self.connect_inner().await;
        if let Err(ref e) = result {
            // Keine halb registrierte Verbindung stehen lassen
            self.disconnect();

            // Server-Fehler wurden bereits vom Read-Task gemeldet
            let reported = matches!(
                e,
                RelayError::RegistrationFailed(kind) if *kind != RelayErrorKind::Timeout
            );
            if !reported {
                self.emit_error(e.kind(), e.to_string());
            }
        }
        result
    }

    async fn connect_inner(&self) -> Result<String, RelayError> {
        tracing::info!("Connecting to relay server: {}", self.url);

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(100);
        let heartbeat_tx = tx.downgrade();
        *self.tx.write() = Some(tx);
        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.closed_locally = false;
        }

        // Channel für die OPEN-Nachricht
        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, RelayError>>(1);

        // Read-Task starten
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &state, &event_tx, &reg_tx)
                                .await;
                        }
                        Err(e) => {
                            tracing::warn!("Ignoring malformed relay message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        let _ = event_tx.send(RelayEvent::Error {
                            kind: RelayErrorKind::SocketError,
                            message: e.to_string(),
                        });
                        break;
                    }
                    _ => {}
                }
            }

            // Disconnect-Status setzen
            let closed_locally = {
                let mut s = state.write();
                s.is_connected = false;
                s.closed_locally
            };
            if !closed_locally {
                let _ = event_tx.send(RelayEvent::Error {
                    kind: RelayErrorKind::SocketClosed,
                    message: "Relay connection closed".to_string(),
                });
            }
            let _ = event_tx.send(RelayEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Auf die OPEN-Nachricht warten
        let id = tokio::select! {
            result = reg_rx.recv() => {
                match result {
                    Some(result) => result?,
                    None => {
                        return Err(RelayError::RegistrationFailed(RelayErrorKind::SocketClosed));
                    }
                }
            }
            _ = tokio::time::sleep(self.registration_timeout) => {
                return Err(RelayError::RegistrationFailed(RelayErrorKind::Timeout));
            }
        };

        self.start_heartbeat(heartbeat_tx);

        tracing::info!("Registered with relay, session id {}", id);
        Ok(id)
    }

    /// Schließt die Verbindung zum Relay
    ///
    /// Der Write-Task endet mit dem letzten Sender und schließt den Socket.
    pub fn disconnect(&self) {
        if self.tx.write().take().is_some() {
            tracing::info!("Disconnecting from relay server");
        }
        let mut state = self.state.write();
        state.is_connected = false;
        state.closed_locally = true;
    }

    /// Verarbeitet eingehende Server-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<RelayEvent>,
        reg_tx: &mpsc::Sender<Result<String, RelayError>>,
    ) {
        match msg {
            ServerMessage::Open { id } => {
                {
                    let mut s = state.write();
                    if s.closed_locally {
                        tracing::warn!("Ignoring OPEN ({}) after registration was given up", id);
                        return;
                    }
                    if let Some(existing) = s.session_id.as_ref() {
                        tracing::warn!("Relay sent second OPEN ({}), keeping {}", id, existing);
                        return;
                    }
                    s.session_id = Some(id.clone());
                }
                let _ = reg_tx.send(Ok(id.clone())).await;
                let _ = event_tx.send(RelayEvent::Open { id });
            }

            ServerMessage::Error { payload } => {
                Self::report_server_error(RelayErrorKind::ServerError, payload, event_tx, reg_tx)
                    .await;
            }

            ServerMessage::IdTaken { payload } => {
                Self::report_server_error(RelayErrorKind::UnavailableId, payload, event_tx, reg_tx)
                    .await;
            }

            ServerMessage::InvalidKey { payload } => {
                Self::report_server_error(RelayErrorKind::InvalidKey, payload, event_tx, reg_tx)
                    .await;
            }

            ServerMessage::Offer { src, payload } => {
                tracing::debug!("OFFER from {} ({})", src, payload.connection_id);
                let _ = event_tx.send(RelayEvent::Offer { src, payload });
            }

            ServerMessage::Answer { src, payload } => {
                tracing::debug!("ANSWER from {} ({})", src, payload.connection_id);
                let _ = event_tx.send(RelayEvent::Answer { src, payload });
            }

            ServerMessage::Candidate { src, payload } => {
                let _ = event_tx.send(RelayEvent::Candidate { src, payload });
            }

            ServerMessage::Leave { src, payload } => {
                tracing::debug!("LEAVE from {}", src);
                let _ = event_tx.send(RelayEvent::Leave {
                    src,
                    connection_id: payload.map(|p| p.connection_id),
                });
            }

            ServerMessage::Expire { src } => {
                tracing::warn!("Could not reach peer {}", src);
                let _ = event_tx.send(RelayEvent::Expire { src });
            }

            ServerMessage::Heartbeat => {
                // Heartbeat-Echo - nichts zu tun
            }
        }
    }

    async fn report_server_error(
        kind: RelayErrorKind,
        payload: Option<ErrorPayload>,
        event_tx: &broadcast::Sender<RelayEvent>,
        reg_tx: &mpsc::Sender<Result<String, RelayError>>,
    ) {
        let message = payload.map(|p| p.msg).unwrap_or_default();
        tracing::error!("Relay error {}: {}", kind, message);
        // Während der Registrierung wartet connect() auf diese Antwort
        let _ = reg_tx.try_send(Err(RelayError::RegistrationFailed(kind)));
        let _ = event_tx.send(RelayEvent::Error { kind, message });
    }

    /// Startet einen Heartbeat-Task
    ///
    /// Hält nur einen schwachen Sender, damit `disconnect()` den Socket schließt.
    fn start_heartbeat(&self, tx: mpsc::WeakSender<String>) {
        let state = Arc::clone(&self.state);
        let interval = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Erster Tick kommt sofort
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !state.read().is_connected {
                    tracing::info!("Heartbeat: relay disconnected, stopping heartbeat task");
                    break;
                }
                let Some(tx) = tx.upgrade() else {
                    break;
                };
                let Ok(msg) = serde_json::to_string(&ClientMessage::Heartbeat) else {
                    break;
                };
                if let Err(e) = tx.send(msg).await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
        });
    }

    fn emit_error(&self, kind: RelayErrorKind, message: String) {
        let _ = self.event_tx.send(RelayEvent::Error { kind, message });
    }
}

impl RelaySink for RelayClient {
    /// Sendet eine Nachricht (non-blocking, verwendet try_send)
    fn send(&self, msg: ClientMessage) -> Result<(), RelayError> {
        let tx = self.tx.read().clone().ok_or(RelayError::NotConnected)?;
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }

        let kind = msg.kind();
        let text =
            serde_json::to_string(&msg).map_err(|e| RelayError::SendFailed(e.to_string()))?;

        tx.try_send(text)
            .map_err(|e| RelayError::SendFailed(e.to_string()))?;
        tracing::trace!("Sent {} to relay", kind);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        RelayClient::is_connected(self)
    }
}

impl fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayClient")
            .field("url", &self.url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Startet einen Relay-Server, der nach dem Handshake `first` sendet
    /// und danach empfangene Text-Nachrichten weiterreicht.
    async fn spawn_relay(first: &'static str) -> (String, mpsc::Receiver<String>) {
        spawn_relay_after(first, Duration::ZERO).await
    }

    /// Wie `spawn_relay`, sendet `first` aber erst nach `delay`
    async fn spawn_relay_after(
        first: &'static str,
        delay: Duration,
    ) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            tokio::time::sleep(delay).await;
            // Client kann schon aufgegeben haben
            let _ = ws.send(Message::Text(first.to_string())).await;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = seen_tx.send(text).await;
                }
            }
        });

        (format!("ws://{}", addr), seen_rx)
    }

    fn client(url: String) -> RelayClient {
        RelayClient::new(url, Duration::from_secs(25), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_connect_receives_session_id() {
        let (url, _seen) = spawn_relay(r#"{"type":"OPEN","id":"A1"}"#).await;
        let client = client(url);
        let mut events = client.subscribe();

        let id = client.connect().await.unwrap();

        assert_eq!(id, "A1");
        assert_eq!(client.session_id(), Some("A1".to_string()));
        assert!(client.is_connected());
        match events.recv().await.unwrap() {
            RelayEvent::Open { id } => assert_eq!(id, "A1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_id_taken_fails_registration() {
        let (url, _seen) = spawn_relay(r#"{"type":"ID-TAKEN","payload":{"msg":"taken"}}"#).await;
        let client = client(url);
        let mut events = client.subscribe();

        let err = client.connect().await.unwrap_err();

        assert_eq!(
            err,
            RelayError::RegistrationFailed(RelayErrorKind::UnavailableId)
        );
        match events.recv().await.unwrap() {
            RelayEvent::Error { kind, message } => {
                assert_eq!(kind, RelayErrorKind::UnavailableId);
                assert_eq!(message, "taken");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_relay_reports_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client(format!("ws://{}", addr));
        let mut events = client.subscribe();

        let err = client.connect().await.unwrap_err();

        assert_eq!(err.kind(), RelayErrorKind::Network);
        match events.recv().await.unwrap() {
            RelayEvent::Error { kind, .. } => assert_eq!(kind, RelayErrorKind::Network),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = client("ws://127.0.0.1:1".to_string());
        assert_eq!(
            client.send(ClientMessage::Heartbeat),
            Err(RelayError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_send_reaches_relay() {
        let (url, mut seen) = spawn_relay(r#"{"type":"OPEN","id":"A1"}"#).await;
        let client = client(url);
        client.connect().await.unwrap();

        client
            .send(ClientMessage::Leave {
                dst: "B2".to_string(),
                payload: LeavePayload {
                    connection_id: "mc_1".to_string(),
                },
            })
            .unwrap();

        let text = seen.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "LEAVE");
        assert_eq!(json["dst"], "B2");
        assert_eq!(json["payload"]["connectionId"], "mc_1");
    }

    #[tokio::test]
    async fn test_registration_timeout_reports_timeout() {
        let (url, _seen) =
            spawn_relay_after(r#"{"type":"OPEN","id":"A1"}"#, Duration::from_millis(300)).await;
        let client = RelayClient::new(url, Duration::from_millis(50), Duration::from_millis(100));
        let mut events = client.subscribe();

        let err = client.connect().await.unwrap_err();

        assert_eq!(err, RelayError::RegistrationFailed(RelayErrorKind::Timeout));
        match events.recv().await.unwrap() {
            RelayEvent::Error { kind, .. } => assert_eq!(kind, RelayErrorKind::Timeout),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_late_open_after_timeout_is_ignored() {
        let (url, mut seen) =
            spawn_relay_after(r#"{"type":"OPEN","id":"A1"}"#, Duration::from_millis(300)).await;
        let client = RelayClient::new(url, Duration::from_millis(50), Duration::from_millis(100));
        let mut events = client.subscribe();

        assert!(client.connect().await.is_err());
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(client.session_id(), None);
        assert!(!client.is_connected());
        assert_eq!(
            client.send(ClientMessage::Heartbeat),
            Err(RelayError::NotConnected)
        );

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert!(
            !received.iter().any(|e| matches!(e, RelayEvent::Open { .. })),
            "late OPEN leaked: {:?}",
            received
        );
        let errors: Vec<_> = received
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Error { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![RelayErrorKind::Timeout]);
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_is_sent() {
        let (url, mut seen) = spawn_relay(r#"{"type":"OPEN","id":"A1"}"#).await;
        let client = RelayClient::new(url, Duration::from_millis(50), Duration::from_secs(2));
        client.connect().await.unwrap();

        let text = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();

        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json, serde_json::json!({"type": "HEARTBEAT"}));
    }
}
