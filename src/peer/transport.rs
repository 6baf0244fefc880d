//! Seam between the connection manager and a peer connection implementation.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::connection::ConnectionState;
use crate::error::Result;
use crate::media::{LocalStream, RemoteTrack};
use crate::signaling::IceCandidate;
use crate::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One transport-level peer connection, exclusively owned by its registry entry.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Fails for descriptions that cannot be parsed or negotiated.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Makes the sent tracks match `stream`. Returns true if a track was added or
    /// removed, which means the session needs renegotiating.
    async fn sync_tracks(&self, stream: Option<&LocalStream>) -> Result<bool>;

    /// Releases the connection. Closing twice may fail; callers ignore that.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Opens peer connections. Each connection reports its callbacks through the sink.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: PeerEventSink) -> Result<Box<dyn PeerTransport>>;
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(ConnectionState),
}

/// A transport callback, queued for the session loop.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer_id: PeerId,
    /// Identifies the connection that produced the event; a peer that left and came
    /// back gets a new one.
    pub connection_id: u64,
    pub kind: PeerEventKind,
}

/// Handed to a transport so its callbacks can reach the session loop.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer_id: PeerId,
    connection_id: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(peer_id: PeerId, connection_id: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            peer_id,
            connection_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerEventKind::LocalCandidate(candidate));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.emit(PeerEventKind::RemoteTrack(track));
    }

    pub fn state_changed(&self, state: ConnectionState) {
        self.emit(PeerEventKind::StateChanged(state));
    }

    fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
            kind,
        };
        // The session may already be gone.
        if self.tx.send(event).is_err() {
            trace!(peer = %self.peer_id, "peer event dropped, session closed");
        }
    }
}
