//! Message Types für das Relay-Protokoll
//!
//! JSON-Nachrichten im PeerJS-Format: `type` als Tag, `src`/`dst` für
//! Absender und Empfänger, alles Weitere im `payload`.

use serde::{Deserialize, Serialize};

/// Verbindungstyp im Payload (nur Media-Verbindungen werden unterstützt)
pub const CONNECTION_TYPE_MEDIA: &str = "media";

// ============================================================================
// PAYLOADS
// ============================================================================

/// SDP wie es `RTCSessionDescription` serialisiert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// Offer oder Answer für eine Media-Verbindung
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
}

impl SdpPayload {
    pub fn media(connection_id: String, sdp: SessionDescription) -> Self {
        Self {
            sdp,
            connection_type: CONNECTION_TYPE_MEDIA.to_string(),
            connection_id,
        }
    }
}

/// ICE Candidate im Format von `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
}

impl CandidatePayload {
    pub fn media(connection_id: String, candidate: IceCandidate) -> Self {
        Self {
            candidate,
            connection_type: CONNECTION_TYPE_MEDIA.to_string(),
            connection_id,
        }
    }
}

/// Auflegen einer einzelnen Verbindung
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeavePayload {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
}

/// Fehlermeldung des Servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub msg: String,
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum ClientMessage {
    Offer { dst: String, payload: SdpPayload },
    Answer { dst: String, payload: SdpPayload },
    Candidate { dst: String, payload: CandidatePayload },
    Leave { dst: String, payload: LeavePayload },
    Heartbeat,
}

impl ClientMessage {
    /// Kurzname für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Offer { .. } => "OFFER",
            ClientMessage::Answer { .. } => "ANSWER",
            ClientMessage::Candidate { .. } => "CANDIDATE",
            ClientMessage::Leave { .. } => "LEAVE",
            ClientMessage::Heartbeat => "HEARTBEAT",
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum ServerMessage {
    /// Verbindung steht, `id` ist die zugewiesene Session-ID
    Open { id: String },

    /// Allgemeiner Server-Fehler
    Error {
        #[serde(default)]
        payload: Option<ErrorPayload>,
    },

    /// Angeforderte ID ist vergeben
    IdTaken {
        #[serde(default)]
        payload: Option<ErrorPayload>,
    },

    /// API-Key ungültig
    InvalidKey {
        #[serde(default)]
        payload: Option<ErrorPayload>,
    },

    Offer { src: String, payload: SdpPayload },

    Answer { src: String, payload: SdpPayload },

    Candidate { src: String, payload: CandidatePayload },

    /// Peer hat aufgelegt bzw. den Server verlassen
    Leave {
        src: String,
        #[serde(default)]
        payload: Option<LeavePayload>,
    },

    /// Nachricht an `src` konnte nicht zugestellt werden
    Expire { src: String },

    /// Heartbeat-Echo mancher Server
    Heartbeat,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_serializes_peerjs_shape() {
        let msg = ClientMessage::Offer {
            dst: "B2".to_string(),
            payload: SdpPayload::media(
                "mc_1".to_string(),
                SessionDescription {
                    sdp_type: "offer".to_string(),
                    sdp: "v=0".to_string(),
                },
            ),
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "OFFER");
        assert_eq!(json["dst"], "B2");
        assert_eq!(json["payload"]["type"], "media");
        assert_eq!(json["payload"]["connectionId"], "mc_1");
        assert_eq!(json["payload"]["sdp"]["type"], "offer");
    }

    #[test]
    fn test_heartbeat_has_only_type() {
        let json = serde_json::to_string(&ClientMessage::Heartbeat).unwrap();
        assert_eq!(json, r#"{"type":"HEARTBEAT"}"#);
    }

    #[test]
    fn test_parse_open() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"OPEN","id":"A1"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Open {
                id: "A1".to_string()
            }
        );
    }

    #[test]
    fn test_parse_id_taken_without_payload() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"ID-TAKEN"}"#).unwrap();
        assert_eq!(msg, ServerMessage::IdTaken { payload: None });
    }

    #[test]
    fn test_parse_candidate() {
        let raw = r#"{
            "type": "CANDIDATE",
            "src": "C3",
            "payload": {
                "candidate": {
                    "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                },
                "type": "media",
                "connectionId": "mc_7"
            }
        }"#;

        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ServerMessage::Candidate { src, payload } => {
                assert_eq!(src, "C3");
                assert_eq!(payload.connection_id, "mc_7");
                assert_eq!(payload.candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(payload.candidate.sdp_mline_index, Some(0));
                assert!(payload.candidate.username_fragment.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_leave_with_connection() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"LEAVE","src":"B2","payload":{"connectionId":"mc_1"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Leave {
                src: "B2".to_string(),
                payload: Some(LeavePayload {
                    connection_id: "mc_1".to_string()
                }),
            }
        );
    }
}
