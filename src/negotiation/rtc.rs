//! WebRTC Negotiation über das Relay
//!
//! Jede Negotiation ist ein `PeerLink` mit eigener Peer Connection. Offer,
//! Answer und ICE Candidates laufen als PeerJS-Nachrichten über das Relay,
//! Ergebnisse gehen als `SessionEvent` an den Call Negotiator.
//!
//! Ein `PeerLink` meldet sein Schließen genau einmal. Wird ein Handle
//! ohne `close()` verworfen, wird die Verbindung still abgebaut.

use super::{CloseReason, Dialer, Negotiation, NegotiationError, NegotiationId};
use crate::config::IceServerConfig;
use crate::media::{MediaStream, MediaTrack, TrackInfo, TrackKind};
use crate::relay::{
    CandidatePayload, ClientMessage, IceCandidate, LeavePayload, RelayError, RelaySink,
    SdpPayload, SessionDescription, CONNECTION_TYPE_MEDIA,
};
use crate::session::{EventSink, SessionEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const AUDIO_CLOCK_RATE: u32 = 48000;
const VIDEO_CLOCK_RATE: u32 = 90000;

type LinkRegistry = Arc<Mutex<HashMap<String, Arc<PeerLink>>>>;

fn webrtc_error(e: webrtc::Error) -> NegotiationError {
    NegotiationError::WebRtc(e.to_string())
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Übersetzt die Konfiguration in `RTCIceServer`
pub fn ice_servers_from_config(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

// ============================================================================
// PEER LINK
// ============================================================================

/// Gemeinsamer Zustand einer Negotiation (Handle, Dialer und Callbacks)
struct PeerLink {
    id: NegotiationId,
    remote_id: String,
    relay: Arc<dyn RelaySink>,
    events: EventSink,
    ice_servers: Vec<RTCIceServer>,
    links: LinkRegistry,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    /// Candidates, die vor der Remote Description ankommen
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    remote_described: AtomicBool,
    remote_reported: AtomicBool,
    closed: AtomicBool,
}

impl PeerLink {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.pc.lock().clone()
    }

    fn send(&self, msg: ClientMessage) -> Result<(), NegotiationError> {
        self.relay.send(msg).map_err(NegotiationError::from)
    }

    /// Schließt die Verbindung und meldet das genau einmal
    fn close_with(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown();

        tracing::info!(
            "Negotiation {} with {} closed: {:?}",
            self.id,
            self.remote_id,
            reason
        );
        let _ = self.events.send(SessionEvent::NegotiationClosed {
            negotiation: self.id.clone(),
            reason,
        });
    }

    /// Baut ab ohne Notification
    fn discard(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Negotiation {} discarded", self.id);
        self.teardown();
    }

    fn fail(&self, error: NegotiationError) {
        if !self.is_closed() {
            tracing::error!("Negotiation {} with {} failed: {}", self.id, self.remote_id, error);
        }
        self.close_with(CloseReason::Failed(error));
    }

    fn teardown(&self) {
        self.links.lock().remove(self.id.as_str());

        if let Some(pc) = self.pc.lock().take() {
            if let Ok(runtime) = Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = pc.close().await {
                        tracing::warn!("Failed to close peer connection: {}", e);
                    }
                });
            }
        }
    }

    /// Erstellt die Peer Connection und registriert die Event Handler
    async fn open_peer_connection(
        self: &Arc<Self>,
    ) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(webrtc_error)?,
        );
        self.register_handlers(&pc);

        *self.pc.lock() = Some(Arc::clone(&pc));

        // Während des Aufbaus geschlossen
        if self.is_closed() {
            let stale = self.pc.lock().take();
            if let Some(stale) = stale {
                let _ = stale.close().await;
            }
            return Err(NegotiationError::Closed);
        }

        Ok(pc)
    }

    fn register_handlers(self: &Arc<Self>, pc: &RTCPeerConnection) {
        let weak: Weak<PeerLink> = Arc::downgrade(self);

        let link = weak.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let link = link.clone();
            Box::pin(async move {
                let Some(link) = link.upgrade() else {
                    return;
                };
                tracing::info!("Peer connection {} state: {:?}", link.id, state);

                match state {
                    RTCPeerConnectionState::Failed => link.close_with(CloseReason::Failed(
                        NegotiationError::ConnectionFailed("ICE connection failed".to_string()),
                    )),
                    RTCPeerConnectionState::Closed => link.close_with(CloseReason::Remote),
                    RTCPeerConnectionState::Disconnected => {
                        tracing::warn!("Peer connection {} disconnected", link.id);
                    }
                    _ => {}
                }
            })
        }));

        let link = weak.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let link = link.clone();
            Box::pin(async move {
                let (Some(link), Some(candidate)) = (link.upgrade(), candidate) else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => link.send_candidate(init),
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let link = weak;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let link = link.clone();
            Box::pin(async move {
                if let Some(link) = link.upgrade() {
                    link.remote_track(&track);
                }
            })
        }));
    }

    /// Fügt die lokalen Tracks als Sender hinzu
    async fn add_local_tracks(
        &self,
        pc: &RTCPeerConnection,
        kinds: &[TrackKind],
    ) -> Result<(), NegotiationError> {
        let stream_id = format!("peercall-{}", self.id);

        for kind in kinds {
            let (mime_type, clock_rate, channels) = match kind {
                TrackKind::Audio => (MIME_TYPE_OPUS, AUDIO_CLOCK_RATE, 2),
                TrackKind::Video => (MIME_TYPE_VP8, VIDEO_CLOCK_RATE, 0),
            };

            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_string(),
                    clock_rate,
                    channels,
                    ..Default::default()
                },
                kind.to_string(),
                stream_id.clone(),
            ));

            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_error)?;
        }

        Ok(())
    }

    /// Setzt die Remote Description und spielt gepufferte Candidates ein
    async fn apply_remote_description(
        &self,
        pc: &RTCPeerConnection,
        description: RTCSessionDescription,
    ) -> Result<(), NegotiationError> {
        pc.set_remote_description(description)
            .await
            .map_err(webrtc_error)?;

        let pending = {
            let mut pending = self.pending_candidates.lock();
            self.remote_described.store(true, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };

        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered ICE candidate: {}", e);
            }
        }

        Ok(())
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), NegotiationError> {
        let pc = self.peer_connection().ok_or(NegotiationError::Closed)?;
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;
        self.apply_remote_description(&pc, answer).await
    }

    async fn add_candidate(&self, candidate: RTCIceCandidateInit) {
        let candidate = {
            let mut pending = self.pending_candidates.lock();
            if !self.remote_described.load(Ordering::SeqCst) {
                pending.push(candidate);
                return;
            }
            candidate
        };

        let Some(pc) = self.peer_connection() else {
            return;
        };
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            tracing::warn!("Failed to add ICE candidate for {}: {}", self.id, e);
        }
    }

    fn send_candidate(&self, init: RTCIceCandidateInit) {
        if self.is_closed() {
            return;
        }

        let payload = CandidatePayload::media(
            self.id.to_string(),
            IceCandidate {
                candidate: init.candidate,
                sdp_mid: init.sdp_mid,
                sdp_mline_index: init.sdp_mline_index,
                username_fragment: init.username_fragment,
            },
        );
        if let Err(e) = self.send(ClientMessage::Candidate {
            dst: self.remote_id.clone(),
            payload,
        }) {
            tracing::debug!("Dropping local ICE candidate for {}: {}", self.id, e);
        }
    }

    /// Erster Remote-Track wird als Stream gemeldet
    fn remote_track(&self, track: &TrackRemote) {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };

        if self.is_closed() || self.remote_reported.swap(true, Ordering::SeqCst) {
            tracing::debug!("Additional {} track from {} ignored", kind, self.remote_id);
            return;
        }

        tracing::info!("Received {} track from {}", kind, self.remote_id);

        let stream = MediaStream::new(
            track.stream_id(),
            vec![MediaTrack::detached(TrackInfo {
                id: track.id(),
                kind,
                label: format!("{} from {}", kind, self.remote_id),
            })],
        );

        if let Err(mpsc::error::SendError(SessionEvent::RemoteStreamAvailable { stream, .. })) =
            self.events.send(SessionEvent::RemoteStreamAvailable {
                negotiation: self.id.clone(),
                stream,
            })
        {
            stream.release();
        }
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote_id", &self.remote_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn local_kinds(local: &MediaStream) -> Vec<TrackKind> {
    [TrackKind::Audio, TrackKind::Video]
        .into_iter()
        .filter(|kind| local.has_kind(*kind))
        .collect()
}

async fn start_outbound(link: &Arc<PeerLink>, kinds: &[TrackKind]) -> Result<(), NegotiationError> {
    let pc = link.open_peer_connection().await?;
    link.add_local_tracks(&pc, kinds).await?;

    let offer = pc.create_offer(None).await.map_err(webrtc_error)?;
    pc.set_local_description(offer.clone())
        .await
        .map_err(webrtc_error)?;

    link.send(ClientMessage::Offer {
        dst: link.remote_id.clone(),
        payload: SdpPayload::media(
            link.id.to_string(),
            SessionDescription {
                sdp_type: "offer".to_string(),
                sdp: offer.sdp,
            },
        ),
    })?;

    tracing::debug!("Offer {} sent to {}", link.id, link.remote_id);
    Ok(())
}

async fn start_answer(
    link: &Arc<PeerLink>,
    offer_sdp: String,
    kinds: &[TrackKind],
) -> Result<(), NegotiationError> {
    let pc = link.open_peer_connection().await?;

    let offer = RTCSessionDescription::offer(offer_sdp)
        .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;
    link.apply_remote_description(&pc, offer).await?;
    link.add_local_tracks(&pc, kinds).await?;

    let answer = pc.create_answer(None).await.map_err(webrtc_error)?;
    pc.set_local_description(answer.clone())
        .await
        .map_err(webrtc_error)?;

    link.send(ClientMessage::Answer {
        dst: link.remote_id.clone(),
        payload: SdpPayload::media(
            link.id.to_string(),
            SessionDescription {
                sdp_type: "answer".to_string(),
                sdp: answer.sdp,
            },
        ),
    })?;

    tracing::debug!("Answer {} sent to {}", link.id, link.remote_id);
    Ok(())
}

// ============================================================================
// WEBRTC NEGOTIATION
// ============================================================================

/// Handle, das der Call Negotiator besitzt
pub struct WebRtcNegotiation {
    link: Arc<PeerLink>,
    /// Offer der Gegenseite, nur bei eingehenden Negotiations
    offer: Option<String>,
    answered: AtomicBool,
}

impl Negotiation for WebRtcNegotiation {
    fn id(&self) -> &NegotiationId {
        &self.link.id
    }

    fn remote_id(&self) -> &str {
        &self.link.remote_id
    }

    fn answer(&self, local: &MediaStream) -> Result<(), NegotiationError> {
        let offer = self.offer.clone().ok_or(NegotiationError::NotIncoming)?;
        if self.link.is_closed() {
            return Err(NegotiationError::Closed);
        }
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(NegotiationError::AlreadyAnswered);
        }

        let runtime = Handle::try_current().map_err(|e| NegotiationError::WebRtc(e.to_string()))?;
        let link = Arc::clone(&self.link);
        let kinds = local_kinds(local);

        runtime.spawn(async move {
            if let Err(e) = start_answer(&link, offer, &kinds).await {
                link.fail(e);
            }
        });

        Ok(())
    }

    fn close(&self) {
        if self.link.is_closed() {
            return;
        }

        let leave = ClientMessage::Leave {
            dst: self.link.remote_id.clone(),
            payload: LeavePayload {
                connection_id: self.link.id.to_string(),
            },
        };
        if let Err(e) = self.link.send(leave) {
            tracing::warn!("Failed to notify {} about hangup: {}", self.link.remote_id, e);
        }

        self.link.close_with(CloseReason::Local);
    }
}

impl Drop for WebRtcNegotiation {
    fn drop(&mut self) {
        self.link.discard();
    }
}

impl fmt::Debug for WebRtcNegotiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcNegotiation")
            .field("link", &self.link)
            .field("incoming", &self.offer.is_some())
            .finish()
    }
}

// ============================================================================
// WEBRTC DIALER
// ============================================================================

/// Öffnet ausgehende Negotiations und routet Relay-Nachrichten
pub struct WebRtcDialer {
    relay: Arc<dyn RelaySink>,
    ice_servers: Vec<RTCIceServer>,
    events: EventSink,
    links: LinkRegistry,
}

impl WebRtcDialer {
    pub fn new(
        relay: Arc<dyn RelaySink>,
        ice_servers: Vec<RTCIceServer>,
        events: EventSink,
    ) -> Self {
        Self {
            relay,
            ice_servers,
            events,
            links: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Anzahl offener Negotiations
    pub fn active_links(&self) -> usize {
        self.links.lock().len()
    }

    fn new_link(&self, id: NegotiationId, remote_id: String) -> Arc<PeerLink> {
        let link = Arc::new(PeerLink {
            id,
            remote_id,
            relay: Arc::clone(&self.relay),
            events: self.events.clone(),
            ice_servers: self.ice_servers.clone(),
            links: Arc::clone(&self.links),
            pc: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            remote_described: AtomicBool::new(false),
            remote_reported: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        self.links
            .lock()
            .insert(link.id.to_string(), Arc::clone(&link));
        link
    }

    fn link(&self, connection_id: &str, src: &str) -> Option<Arc<PeerLink>> {
        let link = self.links.lock().get(connection_id).cloned();
        match link {
            Some(link) if link.remote_id == src => Some(link),
            Some(_) => {
                tracing::warn!("Message for {} from unexpected peer {}", connection_id, src);
                None
            }
            None => {
                tracing::debug!("Message for unknown connection {} from {}", connection_id, src);
                None
            }
        }
    }

    fn links_to(&self, src: &str, connection_id: Option<&str>) -> Vec<Arc<PeerLink>> {
        self.links
            .lock()
            .values()
            .filter(|l| l.remote_id == src)
            .filter(|l| connection_id.map_or(true, |id| l.id.as_str() == id))
            .cloned()
            .collect()
    }

    /// Erstellt aus einem eingehenden `OFFER` eine Negotiation
    pub fn accept_offer(&self, src: String, payload: SdpPayload) -> Option<Box<dyn Negotiation>> {
        if payload.connection_type != CONNECTION_TYPE_MEDIA {
            tracing::warn!(
                "Ignoring {} connection offer from {}",
                payload.connection_type,
                src
            );
            return None;
        }
        if payload.sdp.sdp_type != "offer" {
            tracing::warn!("Ignoring OFFER from {} with sdp type {}", src, payload.sdp.sdp_type);
            return None;
        }
        if self.links.lock().contains_key(&payload.connection_id) {
            tracing::warn!("Duplicate offer {} from {}", payload.connection_id, src);
            return None;
        }

        tracing::info!("Offer {} from {}", payload.connection_id, src);
        let link = self.new_link(NegotiationId::from(payload.connection_id), src);

        Some(Box::new(WebRtcNegotiation {
            link,
            offer: Some(payload.sdp.sdp),
            answered: AtomicBool::new(false),
        }))
    }

    /// `ANSWER` auf ein eigenes Offer
    pub fn route_answer(&self, src: &str, payload: SdpPayload) {
        let Some(link) = self.link(&payload.connection_id, src) else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            return;
        };

        let sdp = payload.sdp.sdp;
        runtime.spawn(async move {
            if let Err(e) = link.apply_answer(sdp).await {
                link.fail(e);
            }
        });
    }

    /// `CANDIDATE` vom Peer
    pub fn route_candidate(&self, src: &str, payload: CandidatePayload) {
        let Some(link) = self.link(&payload.connection_id, src) else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            return;
        };

        let candidate = RTCIceCandidateInit {
            candidate: payload.candidate.candidate,
            sdp_mid: payload.candidate.sdp_mid,
            sdp_mline_index: payload.candidate.sdp_mline_index,
            username_fragment: payload.candidate.username_fragment,
        };
        runtime.spawn(async move {
            link.add_candidate(candidate).await;
        });
    }

    /// `LEAVE`: Gegenseite hat aufgelegt
    pub fn peer_left(&self, src: &str, connection_id: Option<&str>) {
        for link in self.links_to(src, connection_id) {
            link.close_with(CloseReason::Remote);
        }
    }

    /// `EXPIRE`: Nachricht an `src` konnte nicht zugestellt werden
    pub fn peer_expired(&self, src: &str) {
        for link in self.links_to(src, None) {
            link.close_with(CloseReason::Failed(NegotiationError::PeerUnavailable(
                src.to_string(),
            )));
        }
    }
}

impl Dialer for WebRtcDialer {
    fn call(
        &self,
        remote_id: &str,
        local: &MediaStream,
    ) -> Result<Box<dyn Negotiation>, NegotiationError> {
        if !self.relay.is_connected() {
            return Err(NegotiationError::Relay(RelayError::NotConnected));
        }
        let runtime = Handle::try_current().map_err(|e| NegotiationError::WebRtc(e.to_string()))?;

        let link = self.new_link(NegotiationId::generate(), remote_id.to_string());
        let kinds = local_kinds(local);
        tracing::info!("Opening negotiation {} to {}", link.id, remote_id);

        let task_link = Arc::clone(&link);
        runtime.spawn(async move {
            if let Err(e) = start_outbound(&task_link, &kinds).await {
                task_link.fail(e);
            }
        });

        Ok(Box::new(WebRtcNegotiation {
            link,
            offer: None,
            answered: AtomicBool::new(false),
        }))
    }
}

impl fmt::Debug for WebRtcDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcDialer")
            .field("ice_servers", &self.ice_servers.len())
            .field("active_links", &self.active_links())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{event_channel, EventStream};
    use std::time::Duration;

    #[derive(Default)]
    struct CapturingRelay {
        offline: bool,
        sent: Mutex<Vec<ClientMessage>>,
    }

    impl RelaySink for CapturingRelay {
        fn send(&self, msg: ClientMessage) -> Result<(), RelayError> {
            if self.offline {
                return Err(RelayError::NotConnected);
            }
            self.sent.lock().push(msg);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.offline
        }
    }

    impl CapturingRelay {
        async fn wait_for(&self, kind: &str) -> ClientMessage {
            for _ in 0..250 {
                if let Some(msg) = self.sent.lock().iter().find(|m| m.kind() == kind) {
                    return msg.clone();
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("no {} message sent", kind);
        }
    }

    fn dialer(relay: &Arc<CapturingRelay>) -> (WebRtcDialer, EventStream) {
        let (events, rx) = event_channel();
        let sink: Arc<dyn RelaySink> = relay.clone();
        (WebRtcDialer::new(sink, Vec::new(), events), rx)
    }

    fn microphone() -> MediaStream {
        MediaStream::new(
            "local",
            vec![MediaTrack::detached(TrackInfo::new(TrackKind::Audio, "mic"))],
        )
    }

    fn offer_payload(connection_type: &str) -> SdpPayload {
        SdpPayload {
            sdp: SessionDescription {
                sdp_type: "offer".to_string(),
                sdp: "v=0".to_string(),
            },
            connection_type: connection_type.to_string(),
            connection_id: "mc_remote".to_string(),
        }
    }

    fn closed_reason(rx: &mut EventStream) -> Option<CloseReason> {
        match rx.try_recv() {
            Ok(SessionEvent::NegotiationClosed { reason, .. }) => Some(reason),
            _ => None,
        }
    }

    #[test]
    fn test_ice_servers_from_config() {
        let servers = ice_servers_from_config(&[
            IceServerConfig::stun("stun:stun.l.google.com:19302"),
            IceServerConfig::turn("turn:turn.example.com", "alice", "secret"),
        ]);

        assert_eq!(servers.len(), 2);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].urls, vec!["turn:turn.example.com".to_string()]);
        assert_eq!(servers[1].username, "alice");
        assert_eq!(servers[1].credential, "secret");
    }

    #[tokio::test]
    async fn test_call_sends_offer_over_relay() {
        let relay = Arc::new(CapturingRelay::default());
        let (dialer, _rx) = dialer(&relay);
        let local = microphone();

        let negotiation = dialer.call("B2", &local).unwrap();

        match relay.wait_for("OFFER").await {
            ClientMessage::Offer { dst, payload } => {
                assert_eq!(dst, "B2");
                assert_eq!(payload.connection_type, CONNECTION_TYPE_MEDIA);
                assert_eq!(payload.connection_id, negotiation.id().as_str());
                assert!(payload.sdp.sdp.contains("m=audio"));
            }
            other => panic!("unexpected message {:?}", other),
        }

        negotiation.close();
        local.release();
    }

    #[tokio::test]
    async fn test_call_without_relay_fails() {
        let relay = Arc::new(CapturingRelay {
            offline: true,
            ..Default::default()
        });
        let (dialer, _rx) = dialer(&relay);
        let local = microphone();

        let result = dialer.call("B2", &local);

        assert!(matches!(
            result,
            Err(NegotiationError::Relay(RelayError::NotConnected))
        ));
        assert_eq!(dialer.active_links(), 0);
        local.release();
    }

    #[tokio::test]
    async fn test_answer_sends_answer_over_relay() {
        let caller_relay = Arc::new(CapturingRelay::default());
        let callee_relay = Arc::new(CapturingRelay::default());
        let (caller, _caller_rx) = dialer(&caller_relay);
        let (callee, _callee_rx) = dialer(&callee_relay);
        let local = microphone();

        let outgoing = caller.call("C3", &local).unwrap();
        let ClientMessage::Offer { payload, .. } = caller_relay.wait_for("OFFER").await else {
            panic!("expected offer");
        };

        let incoming = callee.accept_offer("A1".to_string(), payload).unwrap();
        assert_eq!(incoming.remote_id(), "A1");
        assert_eq!(incoming.id(), outgoing.id());
        incoming.answer(&local).unwrap();
        assert_eq!(
            incoming.answer(&local),
            Err(NegotiationError::AlreadyAnswered)
        );

        match callee_relay.wait_for("ANSWER").await {
            ClientMessage::Answer { dst, payload } => {
                assert_eq!(dst, "A1");
                assert_eq!(payload.sdp.sdp_type, "answer");
                assert!(payload.sdp.sdp.contains("m=audio"));
            }
            other => panic!("unexpected message {:?}", other),
        }

        outgoing.close();
        incoming.close();
        local.release();
    }

    #[tokio::test]
    async fn test_close_sends_leave_and_reports_once() {
        let relay = Arc::new(CapturingRelay::default());
        let (dialer, mut rx) = dialer(&relay);

        let negotiation = dialer
            .accept_offer("C3".to_string(), offer_payload(CONNECTION_TYPE_MEDIA))
            .unwrap();
        negotiation.close();
        negotiation.close();

        assert!(matches!(
            relay.sent.lock().as_slice(),
            [ClientMessage::Leave { dst, .. }] if dst == "C3"
        ));
        assert_eq!(closed_reason(&mut rx), Some(CloseReason::Local));
        assert_eq!(closed_reason(&mut rx), None);
        assert_eq!(dialer.active_links(), 0);
    }

    #[test]
    fn test_outgoing_negotiation_cannot_be_answered() {
        let relay = Arc::new(CapturingRelay::default());
        let (dialer, _rx) = dialer(&relay);
        let link = dialer.new_link(NegotiationId::generate(), "B2".to_string());
        let negotiation = WebRtcNegotiation {
            link,
            offer: None,
            answered: AtomicBool::new(false),
        };
        let local = microphone();

        assert_eq!(
            negotiation.answer(&local),
            Err(NegotiationError::NotIncoming)
        );
        local.release();
    }

    #[test]
    fn test_non_media_offer_is_ignored() {
        let relay = Arc::new(CapturingRelay::default());
        let (dialer, _rx) = dialer(&relay);

        assert!(dialer
            .accept_offer("C3".to_string(), offer_payload("data"))
            .is_none());
        assert_eq!(dialer.active_links(), 0);
    }

    #[test]
    fn test_peer_left_reports_remote_close() {
        let relay = Arc::new(CapturingRelay::default());
        let (dialer, mut rx) = dialer(&relay);

        let negotiation = dialer
            .accept_offer("C3".to_string(), offer_payload(CONNECTION_TYPE_MEDIA))
            .unwrap();
        dialer.peer_left("D4", None);
        assert_eq!(closed_reason(&mut rx), None);

        dialer.peer_left("C3", Some("mc_remote"));
        assert_eq!(closed_reason(&mut rx), Some(CloseReason::Remote));

        // Handle nach dem Schließen verwerfen meldet nichts mehr
        drop(negotiation);
        assert_eq!(closed_reason(&mut rx), None);
        assert!(relay.sent.lock().is_empty());
    }

    #[test]
    fn test_peer_expired_reports_failure() {
        let relay = Arc::new(CapturingRelay::default());
        let (dialer, mut rx) = dialer(&relay);

        let _negotiation = dialer
            .accept_offer("C3".to_string(), offer_payload(CONNECTION_TYPE_MEDIA))
            .unwrap();
        dialer.peer_expired("C3");

        assert_eq!(
            closed_reason(&mut rx),
            Some(CloseReason::Failed(NegotiationError::PeerUnavailable(
                "C3".to_string()
            )))
        );
    }

    #[test]
    fn test_dropping_unanswered_handle_is_silent() {
        let relay = Arc::new(CapturingRelay::default());
        let (dialer, mut rx) = dialer(&relay);

        let negotiation = dialer
            .accept_offer("C3".to_string(), offer_payload(CONNECTION_TYPE_MEDIA))
            .unwrap();
        assert_eq!(dialer.active_links(), 1);
        drop(negotiation);

        assert_eq!(dialer.active_links(), 0);
        assert_eq!(closed_reason(&mut rx), None);
        assert!(relay.sent.lock().is_empty());
    }
}
