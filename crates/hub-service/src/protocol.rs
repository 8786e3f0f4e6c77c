//! WebSocket wire protocol.
//!
//! Every frame, inbound and outbound, is a JSON envelope:
//!
//! ```text
//! {"type": "...", "meetingId": "...", "from": "...", "to": "...",
//!  "data": {...}, "timestamp": "..."}
//! ```
//!
//! `type` and `data` are decoded together into the closed [`Body`] union, so
//! an unknown type or a payload of the wrong shape fails at the boundary
//! before any room state is touched.

use crate::errors::HubError;
use crate::signaling::PeerConnectionState;

use chrono::{DateTime, Utc};
use common::types::{MeetingId, PeerIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub body: Body,
    pub meeting_id: MeetingId,
    /// Sender peer id. Filled in by the server for outbound frames; ignored inbound.
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Build a server-originated frame stamped with the current time.
    #[must_use]
    pub fn new(meeting_id: MeetingId, from: impl Into<String>, body: Body) -> Self {
        Self {
            body,
            meeting_id,
            from: from.into(),
            to: None,
            timestamp: Utc::now(),
        }
    }

    /// Address the frame to a single peer.
    #[must_use]
    pub fn to(mut self, peer_id: impl Into<String>) -> Self {
        self.to = Some(peer_id.into());
        self
    }

    /// Error frame sent back to the originator of a rejected request.
    #[must_use]
    pub fn error(meeting_id: MeetingId, err: &HubError) -> Self {
        Self::new(
            meeting_id,
            String::new(),
            Body::Error(ErrorPayload {
                code: err.error_code().to_string(),
                message: err.client_message(),
            }),
        )
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Protocol` for malformed JSON, unknown types or
    /// payloads that do not match their type.
    pub fn decode(text: &str) -> Result<Self, HubError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode to a text frame.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Internal` if serialization fails.
    pub fn encode(&self) -> Result<String, HubError> {
        serde_json::to_string(self)
            .map_err(|e| HubError::Internal(format!("frame encoding failed: {e}")))
    }
}

/// Frame type plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Body {
    Join(JoinPayload),
    Leave(LeavePayload),
    PeerState(PeerStatePayload),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidatePayload),
    ChatMessage(ChatMessagePayload),
    ChatMessageEdit(ChatMessagePayload),
    ChatMessageDelete(ChatMessagePayload),
    ChatReaction(ChatReactionPayload),
    ChatReadStatus(ChatReadStatusPayload),
    ChatTyping(ChatTypingPayload),
    ChatTypingStop(ChatTypingPayload),
    ParticipantJoined(ParticipantPayload),
    ParticipantLeft(ParticipantLeftPayload),
    Error(ErrorPayload),
}

impl Body {
    /// Wire type name, also used as a bounded metric label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Body::Join(_) => "join",
            Body::Leave(_) => "leave",
            Body::PeerState(_) => "peer-state",
            Body::Offer(_) => "offer",
            Body::Answer(_) => "answer",
            Body::IceCandidate(_) => "ice-candidate",
            Body::ChatMessage(_) => "chat-message",
            Body::ChatMessageEdit(_) => "chat-message-edit",
            Body::ChatMessageDelete(_) => "chat-message-delete",
            Body::ChatReaction(_) => "chat-reaction",
            Body::ChatReadStatus(_) => "chat-read-status",
            Body::ChatTyping(_) => "chat-typing",
            Body::ChatTypingStop(_) => "chat-typing-stop",
            Body::ParticipantJoined(_) => "participant-joined",
            Body::ParticipantLeft(_) => "participant-left",
            Body::Error(_) => "error",
        }
    }

    /// Types only the server may emit.
    #[must_use]
    pub const fn is_server_only(&self) -> bool {
        matches!(
            self,
            Body::ParticipantJoined(_) | Body::ParticipantLeft(_) | Body::Error(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub is_authenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeavePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    pub state: PeerConnectionState,
}

/// SDP offer or answer. The SDP body is opaque to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(default)]
    pub sdp: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub sdp_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

/// Chat message body shared by `chat-message`, `chat-message-edit` and
/// `chat-message-delete`.
///
/// Clients send the request subset (`messageId`, `content`, ...); the server
/// answers with the full message including sequence and identity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<PeerIdentity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReactionPayload {
    pub message_id: Uuid,
    pub reaction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ReactionAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<PeerIdentity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReadStatusPayload {
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<PeerIdentity>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTypingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<PeerIdentity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPayload {
    pub participant_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub is_authenticated: bool,
}

/// Why a peer left its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveReason {
    /// Explicit `leave` or a `closed` state report.
    Voluntary,
    /// Transport closed or `disconnected` state report.
    Disconnected,
    /// `failed` state report, outbound overflow or transport error.
    Failed,
    /// No heartbeat within the timeout.
    Timeout,
    /// Same identity joined again.
    Replaced,
    /// Hub shutting down.
    Shutdown,
}

impl LeaveReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Voluntary => "voluntary",
            LeaveReason::Disconnected => "disconnected",
            LeaveReason::Failed => "failed",
            LeaveReason::Timeout => "timeout",
            LeaveReason::Replaced => "replaced",
            LeaveReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeftPayload {
    pub participant_id: String,
    pub reason: LeaveReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    const MEETING: &str = "6f1c2a9e-3b1d-4c55-9a77-2f5d0c8e4b10";

    #[test]
    fn test_decode_offer_frame() {
        let text = format!(
            r#"{{"type":"offer","meetingId":"{MEETING}","from":"ignored","to":"peer-b",
                "data":{{"sdp":"v=0\r\n","type":"offer"}},"timestamp":"2026-01-01T00:00:00Z"}}"#
        );

        let env = Envelope::decode(&text).unwrap();
        assert_eq!(env.meeting_id.to_string(), MEETING);
        assert_eq!(env.to.as_deref(), Some("peer-b"));
        match env.body {
            Body::Offer(desc) => {
                assert_eq!(desc.sdp, "v=0\r\n");
                assert_eq!(desc.sdp_type.as_deref(), Some("offer"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_decode_defaults_missing_timestamp_and_from() {
        let text = format!(r#"{{"type":"leave","meetingId":"{MEETING}","data":{{}}}}"#);
        let env = Envelope::decode(&text).unwrap();
        assert!(env.from.is_empty());
        assert_eq!(env.body, Body::Leave(LeavePayload::default()));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let text = format!(r#"{{"type":"screen-share","meetingId":"{MEETING}","data":{{}}}}"#);
        let err = Envelope::decode(&text).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_decode_rejects_wrong_payload_shape() {
        let text = format!(
            r#"{{"type":"ice-candidate","meetingId":"{MEETING}","to":"b","data":{{"sdpMid":"0"}}}}"#
        );
        assert!(Envelope::decode(&text).is_err());
    }

    #[test]
    fn test_decode_rejects_non_uuid_meeting() {
        let text = r#"{"type":"leave","meetingId":"room-1","data":{}}"#;
        assert!(Envelope::decode(text).is_err());
    }

    #[test]
    fn test_encode_chat_message_wire_shape() {
        let meeting = MeetingId::parse(MEETING).unwrap();
        let env = Envelope::new(
            meeting,
            "user_alice",
            Body::ChatMessage(ChatMessagePayload {
                content: "hi".to_string(),
                sequence: Some(1),
                identity: Some(PeerIdentity::User("alice".to_string())),
                ..ChatMessagePayload::default()
            }),
        );

        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "chat-message");
        assert_eq!(json["meetingId"], MEETING);
        assert_eq!(json["from"], "user_alice");
        assert_eq!(json["data"]["content"], "hi");
        assert_eq!(json["data"]["sequence"], 1);
        assert_eq!(json["data"]["identity"]["userId"], "alice");
        assert_eq!(json["data"]["messageType"], "text");
        assert!(json.get("to").is_none());
    }

    #[test]
    fn test_ice_candidate_field_names() {
        let payload = IceCandidatePayload {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.1 54400 typ host".to_string(),
            sdp_m_line_index: Some(0),
            sdp_mid: Some("0".to_string()),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["sdpMLineIndex"], 0);
        assert_eq!(json["sdpMid"], "0");
    }

    #[test]
    fn test_error_frame_uses_client_message() {
        let meeting = MeetingId::new();
        let env = Envelope::error(meeting, &HubError::Redis("10.1.1.1 refused".to_string()));
        match env.body {
            Body::Error(payload) => {
                assert_eq!(payload.code, "INTERNAL_ERROR");
                assert!(!payload.message.contains("10.1.1.1"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_participant_left_reason_is_lowercase() {
        let body = Body::ParticipantLeft(ParticipantLeftPayload {
            participant_id: "user_b".to_string(),
            reason: LeaveReason::Timeout,
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "participant-left");
        assert_eq!(json["data"]["reason"], "timeout");
    }

    #[test]
    fn test_server_only_types() {
        assert!(Body::Error(ErrorPayload {
            code: "X".to_string(),
            message: String::new()
        })
        .is_server_only());
        assert!(!Body::Leave(LeavePayload::default()).is_server_only());
    }
}
