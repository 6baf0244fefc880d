use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::media::RemoteStream;
use crate::negotiation::{NegotiationState, Role};
use crate::PeerId;

/// Transport-level state of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "New"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Failed => write!(f, "Failed"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// What the presentation layer sees of one remote participant.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub role: Role,
    pub negotiation: NegotiationState,
    pub connection: ConnectionState,
    pub remote_stream: Option<RemoteStream>,
}

/// Publishes per-peer status on every change, so readers subscribe instead of polling.
#[derive(Clone)]
pub struct PeerMonitor {
    status: Arc<watch::Sender<HashMap<PeerId, PeerStatus>>>,
    receiver: watch::Receiver<HashMap<PeerId, PeerStatus>>,
}

impl PeerMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(HashMap::new());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update(&self, peer_id: &str, status: PeerStatus) {
        self.status.send_modify(|peers| {
            peers.insert(peer_id.to_owned(), status);
        });
    }

    pub fn remove(&self, peer_id: &str) {
        self.status.send_if_modified(|peers| peers.remove(peer_id).is_some());
    }

    pub fn clear(&self) {
        self.status.send_if_modified(|peers| {
            let had_peers = !peers.is_empty();
            peers.clear();
            had_peers
        });
    }

    pub fn snapshot(&self) -> HashMap<PeerId, PeerStatus> {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HashMap<PeerId, PeerStatus>> {
        self.receiver.clone()
    }
}

impl Default for PeerMonitor {
    fn default() -> Self {
        Self::new()
    }
}
