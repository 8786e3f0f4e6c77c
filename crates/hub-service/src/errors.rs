//! Hub error types.
//!
//! Every error carries a stable wire code (`error_code`) used in WebSocket
//! `error` frames and REST error bodies, plus an HTTP status for the control
//! plane. Internal details are logged server-side but not exposed to clients.

use crate::signaling::PeerConnectionState;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::types::InvalidMeetingId;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Control-plane operation an error occurred in.
///
/// Membership and protocol errors raised inside an operation are reported
/// with the operation's failure code (`OFFER_FAILED`, `JOIN_FAILED`, ...),
/// except for the few codes clients branch on directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Join,
    Leave,
    Offer,
    Answer,
    IceCandidate,
    UpdateState,
    IssueCredential,
}

impl Operation {
    /// Wire code reported when this operation fails.
    #[must_use]
    pub const fn failure_code(&self) -> &'static str {
        match self {
            Operation::Join => "JOIN_FAILED",
            Operation::Leave => "LEAVE_FAILED",
            Operation::Offer => "OFFER_FAILED",
            Operation::Answer => "ANSWER_FAILED",
            Operation::IceCandidate => "ICE_CANDIDATE_FAILED",
            Operation::UpdateState => "UPDATE_FAILED",
            Operation::IssueCredential => "TOKEN_GENERATION_FAILED",
        }
    }

    /// HTTP status reported when this operation fails.
    #[must_use]
    pub const fn failure_status(&self) -> u16 {
        match self {
            Operation::Join | Operation::IssueCredential => 500,
            Operation::Leave
            | Operation::Offer
            | Operation::Answer
            | Operation::IceCandidate
            | Operation::UpdateState => 400,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Join => "join",
            Operation::Leave => "leave",
            Operation::Offer => "offer",
            Operation::Answer => "answer",
            Operation::IceCandidate => "ice_candidate",
            Operation::UpdateState => "update_state",
            Operation::IssueCredential => "issue_credential",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hub error type.
#[derive(Debug, Error)]
pub enum HubError {
    /// Meeting id is not a UUID.
    #[error("Invalid meeting id")]
    InvalidMeetingId,

    /// No live room for this meeting.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The room actor stopped (evicted or shut down) before handling the request.
    #[error("Room closed: {0}")]
    RoomClosed(String),

    /// Peer is not a member of the room.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Sender or target of a signaling message is not in the room.
    #[error("Peer not in room: {0}")]
    PeerNotInRoom(String),

    /// The caller has no peer in the room.
    #[error("Caller is not in this meeting")]
    NotInMeeting,

    /// Room is at its participant ceiling.
    #[error("Room is full (capacity {capacity})")]
    RoomFull { capacity: usize },

    /// Connection-state transition not allowed by the state machine.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: PeerConnectionState,
        to: PeerConnectionState,
    },

    /// Malformed envelope or unknown message type.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Well-formed request with invalid content.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Chat message id unknown to the room.
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Peer id already held by a different identity.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Caller may not act on this resource.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No identity supplied by the upstream auth layer.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Hub is shutting down.
    #[error("Hub is draining")]
    Draining,

    /// Chat persistence collaborator failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Relay credential derivation failed.
    #[error("Credential error: {0}")]
    Credential(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Error raised while performing a control-plane operation.
    #[error("{operation} failed: {source}")]
    Failed {
        operation: Operation,
        #[source]
        source: Box<HubError>,
    },
}

impl HubError {
    /// Attach the operation this error occurred in.
    #[must_use]
    pub fn during(self, operation: Operation) -> Self {
        match self {
            HubError::Failed { .. } => self,
            other => HubError::Failed {
                operation,
                source: Box::new(other),
            },
        }
    }

    /// Codes that survive operation wrapping unchanged.
    fn passes_through(&self) -> bool {
        matches!(
            self,
            HubError::InvalidMeetingId
                | HubError::NotInMeeting
                | HubError::RoomFull { .. }
                | HubError::Unauthorized(_)
                | HubError::Draining
        )
    }

    /// Returns the wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            HubError::InvalidMeetingId => "INVALID_MEETING_ID",
            HubError::NotInMeeting => "NOT_IN_MEETING",
            HubError::RoomFull { .. } => "ROOM_FULL",
            HubError::RoomNotFound(_)
            | HubError::RoomClosed(_)
            | HubError::PeerNotFound(_)
            | HubError::MessageNotFound(_) => "NOT_FOUND",
            HubError::PeerNotInRoom(_) => "PEER_NOT_IN_ROOM",
            HubError::InvalidTransition { .. } => "INVALID_TRANSITION",
            HubError::Protocol(_) | HubError::Validation(_) => "VALIDATION_ERROR",
            HubError::Conflict(_) => "CONFLICT",
            HubError::PermissionDenied(_) => "FORBIDDEN",
            HubError::Unauthorized(_) => "UNAUTHORIZED",
            HubError::Draining => "SERVICE_UNAVAILABLE",
            HubError::Credential(_) => "TOKEN_GENERATION_FAILED",
            HubError::Persistence(_)
            | HubError::Redis(_)
            | HubError::Internal(_) => "INTERNAL_ERROR",
            HubError::Failed { operation, source } => {
                if source.passes_through() {
                    source.error_code()
                } else {
                    operation.failure_code()
                }
            }
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            HubError::InvalidMeetingId
            | HubError::NotInMeeting
            | HubError::PeerNotInRoom(_)
            | HubError::InvalidTransition { .. }
            | HubError::Protocol(_)
            | HubError::Validation(_) => 400,
            HubError::Unauthorized(_) => 401,
            HubError::RoomFull { .. } | HubError::PermissionDenied(_) => 403,
            HubError::RoomNotFound(_)
            | HubError::RoomClosed(_)
            | HubError::PeerNotFound(_)
            | HubError::MessageNotFound(_) => 404,
            HubError::Conflict(_) => 409,
            HubError::Draining => 503,
            HubError::Persistence(_)
            | HubError::Redis(_)
            | HubError::Credential(_)
            | HubError::Internal(_) => 500,
            HubError::Failed { operation, source } => {
                if source.passes_through() {
                    source.status_code()
                } else {
                    operation.failure_status()
                }
            }
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            HubError::InvalidMeetingId => "invalid_meeting_id",
            HubError::RoomNotFound(_) => "room_not_found",
            HubError::RoomClosed(_) => "room_closed",
            HubError::PeerNotFound(_) => "peer_not_found",
            HubError::PeerNotInRoom(_) => "peer_not_in_room",
            HubError::NotInMeeting => "not_in_meeting",
            HubError::RoomFull { .. } => "room_full",
            HubError::InvalidTransition { .. } => "invalid_transition",
            HubError::Protocol(_) => "protocol",
            HubError::Validation(_) => "validation",
            HubError::MessageNotFound(_) => "message_not_found",
            HubError::Conflict(_) => "conflict",
            HubError::PermissionDenied(_) => "permission_denied",
            HubError::Unauthorized(_) => "unauthorized",
            HubError::Draining => "draining",
            HubError::Persistence(_) => "persistence",
            HubError::Redis(_) => "redis",
            HubError::Credential(_) => "credential",
            HubError::Internal(_) => "internal",
            HubError::Failed { source, .. } => source.error_type_label(),
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            HubError::Persistence(_)
            | HubError::Redis(_)
            | HubError::Internal(_) => "An internal error occurred".to_string(),
            HubError::Credential(_) => "Failed to generate relay credentials".to_string(),
            HubError::RoomNotFound(_) | HubError::RoomClosed(_) => "Room not found".to_string(),
            HubError::PeerNotFound(_) => "Peer not found".to_string(),
            HubError::PeerNotInRoom(_) => "Target peer is not in this meeting".to_string(),
            HubError::MessageNotFound(_) => "Message not found".to_string(),
            HubError::Draining => "Server is shutting down, please reconnect".to_string(),
            HubError::Failed { source, .. } => source.client_message(),
            other => other.to_string(),
        }
    }
}

impl From<InvalidMeetingId> for HubError {
    fn from(_: InvalidMeetingId) -> Self {
        HubError::InvalidMeetingId
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Protocol(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let operation = match &self {
            HubError::Failed { operation, .. } => operation.as_str(),
            _ => "request",
        };
        crate::observability::metrics::record_error(
            operation,
            self.error_type_label(),
            self.status_code(),
        );

        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                message: self.client_message(),
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(HubError::InvalidMeetingId.error_code(), "INVALID_MEETING_ID");
        assert_eq!(HubError::NotInMeeting.error_code(), "NOT_IN_MEETING");
        assert_eq!(HubError::RoomFull { capacity: 50 }.error_code(), "ROOM_FULL");
        assert_eq!(
            HubError::RoomNotFound("r".to_string()).error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            HubError::Protocol("bad".to_string()).error_code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            HubError::Redis("down".to_string()).error_code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_operation_wrapping_uses_failure_code() {
        let err = HubError::PeerNotInRoom("peer-b".to_string()).during(Operation::Offer);
        assert_eq!(err.error_code(), "OFFER_FAILED");
        assert_eq!(err.status_code(), 400);

        let err = HubError::Internal("boom".to_string()).during(Operation::Join);
        assert_eq!(err.error_code(), "JOIN_FAILED");
        assert_eq!(err.status_code(), 500);

        let err = HubError::InvalidTransition {
            from: PeerConnectionState::Closed,
            to: PeerConnectionState::Connected,
        }
        .during(Operation::UpdateState);
        assert_eq!(err.error_code(), "UPDATE_FAILED");
    }

    #[test]
    fn test_operation_wrapping_keeps_client_facing_codes() {
        let err = HubError::RoomFull { capacity: 50 }.during(Operation::Join);
        assert_eq!(err.error_code(), "ROOM_FULL");
        assert_eq!(err.status_code(), 403);

        let err = HubError::NotInMeeting.during(Operation::Offer);
        assert_eq!(err.error_code(), "NOT_IN_MEETING");
        assert_eq!(err.status_code(), 400);

        let err = HubError::InvalidMeetingId.during(Operation::Leave);
        assert_eq!(err.error_code(), "INVALID_MEETING_ID");
    }

    #[test]
    fn test_wrapping_is_not_nested() {
        let err = HubError::Validation("x".to_string())
            .during(Operation::Answer)
            .during(Operation::Offer);
        assert_eq!(err.error_code(), "ANSWER_FAILED");
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let redis_err = HubError::Redis("connection refused at 10.0.0.7:6379".to_string());
        assert!(!redis_err.client_message().contains("10.0.0.7"));
        assert_eq!(redis_err.client_message(), "An internal error occurred");

        let wrapped = HubError::Persistence("disk full on node-3".to_string())
            .during(Operation::Join);
        assert!(!wrapped.client_message().contains("node-3"));
    }

    #[test]
    fn test_error_type_label_is_bounded() {
        let err = HubError::PeerNotInRoom("a-very-specific-peer-id".to_string())
            .during(Operation::IceCandidate);
        assert_eq!(err.error_type_label(), "peer_not_in_room");
    }

    #[test]
    fn test_invalid_meeting_id_conversion() {
        let err: HubError = common::types::MeetingId::parse("nope").unwrap_err().into();
        assert!(matches!(err, HubError::InvalidMeetingId));
    }

    #[tokio::test]
    async fn test_into_response_body() {
        use http_body_util::BodyExt;

        let response = HubError::RoomFull { capacity: 50 }
            .during(Operation::Join)
            .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "ROOM_FULL");
    }
}
