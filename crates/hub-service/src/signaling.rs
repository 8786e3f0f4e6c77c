//! Peer connection-state machine and signaling envelopes.
//!
//! ```text
//! new ──► connecting ──► connected
//!  │          │              │
//!  └──────────┴──────────────┴──► disconnected | failed | closed
//! ```
//!
//! `failed` and `closed` are terminal. Re-asserting the current state is a
//! lateral no-op. Entering any of the three departure states removes the
//! peer from its room.

use crate::errors::HubError;
use crate::protocol::{Body, Envelope, IceCandidatePayload, SessionDescription};

use common::types::MeetingId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// WebRTC connection state reported by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub const ALL: [PeerConnectionState; 6] = [
        PeerConnectionState::New,
        PeerConnectionState::Connecting,
        PeerConnectionState::Connected,
        PeerConnectionState::Disconnected,
        PeerConnectionState::Failed,
        PeerConnectionState::Closed,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PeerConnectionState::New => "new",
            PeerConnectionState::Connecting => "connecting",
            PeerConnectionState::Connected => "connected",
            PeerConnectionState::Disconnected => "disconnected",
            PeerConnectionState::Failed => "failed",
            PeerConnectionState::Closed => "closed",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Failed | PeerConnectionState::Closed
        )
    }

    /// States that remove the peer from its room.
    #[must_use]
    pub const fn is_departure(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }

    #[must_use]
    pub fn can_transition_to(&self, next: PeerConnectionState) -> bool {
        use PeerConnectionState::{Closed, Connected, Connecting, Disconnected, Failed, New};

        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (New, Connecting) | (Connecting, Connected) | (_, Disconnected | Failed | Closed)
        )
    }

    /// Validate a transition.
    ///
    /// # Errors
    ///
    /// Returns `HubError::InvalidTransition` when the state machine forbids it.
    pub fn transition(self, next: PeerConnectionState) -> Result<PeerConnectionState, HubError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(HubError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relayable negotiation payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidatePayload),
}

impl SignalPayload {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "offer",
            SignalPayload::Answer(_) => "answer",
            SignalPayload::IceCandidate(_) => "ice-candidate",
        }
    }

    /// Structural checks done before any room state is consulted.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Validation` for an empty SDP.
    pub fn validate(&self) -> Result<(), HubError> {
        match self {
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => {
                if desc.sdp.trim().is_empty() {
                    return Err(HubError::Validation(format!(
                        "{} requires a non-empty sdp",
                        self.kind()
                    )));
                }
            }
            // `candidate` is required by the wire type; the empty string is
            // the end-of-candidates marker and is relayed as-is.
            SignalPayload::IceCandidate(_) => {}
        }
        Ok(())
    }

    fn into_body(self) -> Body {
        match self {
            SignalPayload::Offer(desc) => Body::Offer(desc),
            SignalPayload::Answer(desc) => Body::Answer(desc),
            SignalPayload::IceCandidate(candidate) => Body::IceCandidate(candidate),
        }
    }
}

/// An offer, answer or ICE candidate addressed from one peer to another in
/// the same room. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingEnvelope {
    pub room_id: MeetingId,
    pub from: String,
    pub to: String,
    pub payload: SignalPayload,
}

impl SignalingEnvelope {
    /// Build and validate an envelope.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Validation` if the target is empty or the payload
    /// fails structural validation.
    pub fn new(
        room_id: MeetingId,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: SignalPayload,
    ) -> Result<Self, HubError> {
        let to = to.into();
        if to.trim().is_empty() {
            return Err(HubError::Validation(format!(
                "{} requires a target peer",
                payload.kind()
            )));
        }
        payload.validate()?;
        Ok(Self {
            room_id,
            from: from.into(),
            to,
            payload,
        })
    }

    /// Extract a signaling envelope from an inbound frame.
    ///
    /// `sender` is the connection's own peer id; the frame's `from` field is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Protocol` if the frame is not a signaling type, or
    /// `HubError::Validation` if it fails validation.
    pub fn from_frame(frame: Envelope, sender: &str) -> Result<Self, HubError> {
        let payload = match frame.body {
            Body::Offer(desc) => SignalPayload::Offer(desc),
            Body::Answer(desc) => SignalPayload::Answer(desc),
            Body::IceCandidate(candidate) => SignalPayload::IceCandidate(candidate),
            other => {
                return Err(HubError::Protocol(format!(
                    "{} is not a signaling message",
                    other.kind()
                )))
            }
        };
        Self::new(
            frame.meeting_id,
            sender,
            frame.to.unwrap_or_default(),
            payload,
        )
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Outbound frame delivered to the target.
    #[must_use]
    pub fn into_frame(self) -> Envelope {
        Envelope::new(self.room_id, self.from, self.payload.into_body()).to(self.to)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use PeerConnectionState::{Closed, Connected, Connecting, Disconnected, Failed, New};

    #[test]
    fn test_forward_path() {
        assert!(New.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(!New.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(New));
    }

    #[test]
    fn test_any_non_terminal_state_can_depart() {
        for from in [New, Connecting, Connected, Disconnected] {
            for to in [Disconnected, Failed, Closed] {
                assert!(from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in [Failed, Closed] {
            for to in PeerConnectionState::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_lateral_reassert_is_accepted() {
        assert!(Connected.can_transition_to(Connected));
        assert!(New.can_transition_to(New));
    }

    #[test]
    fn test_transition_error_carries_states() {
        let err = Closed.transition(Connected).unwrap_err();
        assert!(matches!(
            err,
            HubError::InvalidTransition {
                from: Closed,
                to: Connected
            }
        ));
    }

    #[test]
    fn test_departure_states() {
        assert!(Disconnected.is_departure());
        assert!(Failed.is_departure());
        assert!(Closed.is_departure());
        assert!(!Connected.is_departure());
    }

    #[test]
    fn test_offer_requires_sdp() {
        let payload = SignalPayload::Offer(SessionDescription {
            sdp: "  ".to_string(),
            sdp_type: None,
        });
        let err = SignalingEnvelope::new(MeetingId::new(), "a", "b", payload).unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }

    #[test]
    fn test_signal_requires_target() {
        let payload = SignalPayload::Answer(SessionDescription {
            sdp: "v=0".to_string(),
            sdp_type: Some("answer".to_string()),
        });
        assert!(SignalingEnvelope::new(MeetingId::new(), "a", "", payload).is_err());
    }

    #[test]
    fn test_from_frame_ignores_client_from() {
        let room = MeetingId::new();
        let frame = Envelope {
            from: "spoofed".to_string(),
            ..Envelope::new(
                room,
                "",
                Body::IceCandidate(IceCandidatePayload {
                    candidate: "candidate:0 1 UDP 1 10.0.0.2 9 typ host".to_string(),
                    sdp_m_line_index: Some(0),
                    sdp_mid: None,
                }),
            )
            .to("peer-b")
        };

        let signal = SignalingEnvelope::from_frame(frame, "peer-a").unwrap();
        assert_eq!(signal.from, "peer-a");
        assert_eq!(signal.to, "peer-b");

        let out = signal.into_frame();
        assert_eq!(out.from, "peer-a");
        assert_eq!(out.to.as_deref(), Some("peer-b"));
        assert_eq!(out.body.kind(), "ice-candidate");
    }

    #[test]
    fn test_from_frame_rejects_chat() {
        let frame = Envelope::new(
            MeetingId::new(),
            "",
            Body::ChatTyping(crate::protocol::ChatTypingPayload::default()),
        );
        let err = SignalingEnvelope::from_frame(frame, "peer-a").unwrap_err();
        assert!(matches!(err, HubError::Protocol(_)));
    }
}
