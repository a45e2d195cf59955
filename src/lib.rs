//! peercall - P2P Audio/Video Call Session
//!
//! Kern einer Peer-to-Peer Call-Applikation:
//! - Relay-Server (PeerJS-Protokoll) für Session-ID und Signaling
//! - WebRTC für den Media-Transport
//! - Ein Call Negotiator, der genau einen Anruf zur Zeit steuert
//!
//! Die Presentation Shell benutzt nur `CallApp`: `place_call`,
//! `end_call`, `view` und `subscribe`.

pub mod config;
pub mod media;
pub mod negotiation;
pub mod relay;
pub mod session;

use config::{AppConfig, ConfigError};
use media::{DeviceAccess, MediaAcquirer};
use negotiation::{ice_servers_from_config, WebRtcDialer};
use once_cell::sync::OnceCell;
use relay::{RelayClient, RelayError, RelayEvent, RelaySink};
use session::{
    event_channel, CallError, CallEvent, CallNegotiator, EventSink, RegistrationError,
    SessionDriver, SessionEvent, SessionHandle, SessionId, SessionReporter, SessionView,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Standard-Filter, `RUST_LOG` hat Vorrang
const DEFAULT_LOG_DIRECTIVES: &str = "peercall=debug,webrtc=warn";

static TRACING: OnceCell<()> = OnceCell::new();

/// Initialisiert das Logging (nur beim ersten Aufruf)
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));

        // Ein anderer Subscriber ist bereits gesetzt (z.B. durch die Shell)
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

// ============================================================================
// CALL APP
// ============================================================================

/// Application Context: besitzt Relay, Dialer und Session Driver
pub struct CallApp {
    config: AppConfig,
    relay: Arc<RelayClient>,
    dialer: Arc<WebRtcDialer>,
    session: SessionHandle,
    reporter: SessionReporter,
    driver_task: Option<JoinHandle<()>>,
    bridge_task: JoinHandle<()>,
    connect_task: JoinHandle<()>,
}

impl CallApp {
    /// Startet die Session und verbindet mit dem Relay.
    ///
    /// Die Registrierung läuft im Hintergrund. Bis zur Session-ID zeigt
    /// der Status "Initializing...", Fehler landen im `SessionView`.
    pub async fn start(
        config: AppConfig,
        devices: Arc<dyn DeviceAccess>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        tracing::info!("Initializing peercall...");

        let relay = Arc::new(RelayClient::new(
            config.relay_url.clone(),
            config.heartbeat_interval,
            config.registration_timeout,
        ));

        let (events_tx, events_rx) = event_channel();
        let relay_sink: Arc<dyn RelaySink> = relay.clone();
        let dialer = Arc::new(WebRtcDialer::new(
            relay_sink,
            ice_servers_from_config(&config.ice_servers),
            events_tx.clone(),
        ));

        let reporter = SessionReporter::new();
        let negotiator = CallNegotiator::new(dialer.clone(), reporter.clone(), config.constraints);
        let (driver, session) = SessionDriver::new(
            negotiator,
            MediaAcquirer::new(devices),
            (events_tx, events_rx),
        );
        let driver_task = tokio::spawn(driver.run());

        // Vor dem Verbinden abonnieren, sonst geht OPEN verloren
        let bridge_task = tokio::spawn(bridge_relay_events(
            relay.subscribe(),
            Arc::clone(&dialer),
            session.event_sink(),
        ));

        let connect_relay = Arc::clone(&relay);
        let connect_task = tokio::spawn(async move {
            if let Err(e) = connect_relay.connect().await {
                tracing::error!("Relay registration failed: {}", e);
            }
        });

        Ok(Self {
            config,
            relay,
            dialer,
            session,
            reporter,
            driver_task: Some(driver_task),
            bridge_task,
            connect_task,
        })
    }

    /// Ruft `remote_id` an
    pub async fn place_call(&self, remote_id: &str) -> Result<(), CallError> {
        self.session.place_call(remote_id).await
    }

    /// Legt auf (bzw. bricht den Verbindungsaufbau ab)
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.session.end_call().await
    }

    /// Snapshot für die Presentation Shell
    pub fn view(&self) -> SessionView {
        self.reporter.view()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.reporter.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.reporter.view().session_id
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Beendet einen laufenden Anruf und trennt vom Relay
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down peercall...");

        self.session.shutdown();
        if let Some(task) = self.driver_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Session driver ended abnormally: {}", e);
            }
        }

        self.bridge_task.abort();
        self.connect_task.abort();
        self.relay.disconnect();
        tracing::debug!("Open negotiations after shutdown: {}", self.dialer.active_links());
    }
}

impl Drop for CallApp {
    fn drop(&mut self) {
        self.session.shutdown();
        self.bridge_task.abort();
        self.connect_task.abort();
        self.relay.disconnect();
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("relay", &self.relay)
            .field("dialer", &self.dialer)
            .field("reporter", &self.reporter)
            .finish()
    }
}

// ============================================================================
// RELAY EVENT BRIDGE
// ============================================================================

/// Übersetzt Relay-Events in Session-Events bzw. routet sie zum Dialer
async fn bridge_relay_events(
    mut relay_rx: broadcast::Receiver<RelayEvent>,
    dialer: Arc<WebRtcDialer>,
    events: EventSink,
) {
    loop {
        let event = match relay_rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Relay bridge lagged, {} events dropped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let session_event = match event {
            RelayEvent::Open { id } => Some(SessionEvent::IdentityAssigned(SessionId::new(id))),

            RelayEvent::Error { kind, message } => {
                Some(SessionEvent::RegistrationFailed(RegistrationError {
                    kind,
                    message,
                }))
            }

            RelayEvent::Offer { src, payload } => dialer
                .accept_offer(src, payload)
                .map(SessionEvent::IncomingNegotiation),

            RelayEvent::Answer { src, payload } => {
                dialer.route_answer(&src, payload);
                None
            }

            RelayEvent::Candidate { src, payload } => {
                dialer.route_candidate(&src, payload);
                None
            }

            RelayEvent::Leave { src, connection_id } => {
                dialer.peer_left(&src, connection_id.as_deref());
                None
            }

            RelayEvent::Expire { src } => {
                dialer.peer_expired(&src);
                None
            }

            RelayEvent::Disconnected => {
                tracing::info!("Disconnected from relay server");
                None
            }
        };

        if let Some(session_event) = session_event {
            if events.send(session_event).is_err() {
                tracing::debug!("Call session gone, stopping relay bridge");
                break;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaAccessError, MediaConstraints, MediaStream};
    use crate::relay::RelayErrorKind;
    use crate::session::GuardViolation;
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    struct NoDevices;

    #[async_trait]
    impl DeviceAccess for NoDevices {
        async fn request(
            &self,
            _constraints: MediaConstraints,
        ) -> Result<MediaStream, MediaAccessError> {
            Err(MediaAccessError::DeviceUnavailable("no devices".to_string()))
        }
    }

    async fn spawn_relay(first: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            ws.send(Message::Text(first.to_string())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        format!("ws://{}", addr)
    }

    fn config(relay_url: String) -> AppConfig {
        AppConfig {
            relay_url,
            registration_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    async fn wait_until(app: &CallApp, check: impl Fn(&SessionView) -> bool) -> SessionView {
        for _ in 0..100 {
            let view = app.view();
            if check(&view) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session view never matched: {:?}", app.view());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = config("http://relay.example.com".to_string());
        let result = CallApp::start(config, Arc::new(NoDevices)).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_app_registers_with_relay() {
        let url = spawn_relay(r#"{"type":"OPEN","id":"A1"}"#).await;
        let app = CallApp::start(config(url), Arc::new(NoDevices)).await.unwrap();

        let view = wait_until(&app, |v| v.session_id.is_some()).await;
        assert_eq!(view.session_id.as_deref(), Some("A1"));
        assert_eq!(view.status_message, "Connected to relay server");

        let result = app.place_call("").await;
        assert_eq!(result, Err(CallError::Guard(GuardViolation::MissingRemoteId)));

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_media_failure_returns_to_idle() {
        let url = spawn_relay(r#"{"type":"OPEN","id":"A1"}"#).await;
        let app = CallApp::start(config(url), Arc::new(NoDevices)).await.unwrap();
        wait_until(&app, |v| v.session_id.is_some()).await;

        app.place_call("B2").await.unwrap();

        let view = wait_until(&app, |v| v.error_message.is_some()).await;
        assert!(view.call_state.is_idle());
        assert_eq!(view.status_message, "Call failed");
        assert_eq!(
            view.error_message.as_deref(),
            Some("Failed to access camera/microphone: Device unavailable: no devices")
        );

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let app = CallApp::start(config(format!("ws://{}", addr)), Arc::new(NoDevices))
            .await
            .unwrap();

        let view = wait_until(&app, |v| v.error_message.is_some()).await;
        assert_eq!(
            view.error_message.as_deref(),
            Some(format!("Relay error: {}", RelayErrorKind::Network).as_str())
        );
        assert!(view.session_id.is_none());

        app.shutdown().await;
    }
}
