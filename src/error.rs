use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::PeerId;

#[derive(Debug, Error)]
pub enum Error {
    /// A connection entry for this peer already exists in the session.
    #[error("already connected to peer {0}")]
    AlreadyConnected(PeerId),

    /// Peer-level negotiation failure. The entry has been removed; other peers are untouched.
    #[error("negotiation with peer {peer} failed: {reason}")]
    NegotiationFailed { peer: PeerId, reason: String },

    /// A negotiation was requested while another one was still running for the same peer.
    #[error("negotiation with peer {0} already in progress")]
    NegotiationBusy(PeerId),

    #[error("signaling channel unavailable: {0}")]
    SignalDeliveryUnavailable(String),

    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("presence store error: {0}")]
    Presence(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn negotiation(peer: &str, reason: impl ToString) -> Self {
        Error::NegotiationFailed {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    /// The remote participant a peer-level error belongs to.
    pub fn peer(&self) -> Option<&str> {
        match self {
            Error::AlreadyConnected(peer)
            | Error::NegotiationBusy(peer)
            | Error::NegotiationFailed { peer, .. } => Some(peer.as_str()),
            _ => None,
        }
    }

    /// Peer-level errors are isolated to one connection entry and never end the session.
    pub fn is_peer_level(&self) -> bool {
        matches!(
            self,
            Error::AlreadyConnected(_) | Error::NegotiationFailed { .. } | Error::NegotiationBusy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
