use serde::{Deserialize, Serialize};

use crate::{PeerId, RoomId};

/// A trickled ICE candidate, in the browser's JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    Join { room_id: RoomId, user_id: PeerId },
    #[serde(rename_all = "camelCase")]
    Leave { room_id: RoomId, user_id: PeerId },
    Offer { to: PeerId, from: PeerId, sdp: String },
    Answer { to: PeerId, from: PeerId, sdp: String },
    IceCandidate {
        to: PeerId,
        from: PeerId,
        candidate: IceCandidate,
    },
    /// Sent by the answering side of a pair when its tracks changed; the offering
    /// side runs the renegotiation.
    Renegotiate { to: PeerId, from: PeerId },
    /// The relay's reply to a join: everyone already in the room.
    #[serde(rename_all = "camelCase")]
    AllUsers { room_id: RoomId, user_ids: Vec<PeerId> },
    #[serde(rename_all = "camelCase")]
    PeerJoined { user_id: PeerId },
    #[serde(rename_all = "camelCase")]
    PeerLeft { user_id: PeerId },
    Error { message: String },
}

impl SignalMessage {
    /// The peer a negotiation message is addressed to.
    pub fn target(&self) -> Option<&str> {
        match self {
            SignalMessage::Offer { to, .. }
            | SignalMessage::Answer { to, .. }
            | SignalMessage::IceCandidate { to, .. }
            | SignalMessage::Renegotiate { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::Leave { .. } => "leave",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::Renegotiate { .. } => "renegotiate",
            SignalMessage::AllUsers { .. } => "all-users",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::Error { .. } => "error",
        }
    }
}
