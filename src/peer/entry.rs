use tracing::{debug, warn};

use super::transport::{PeerTransport, SessionDescription};
use crate::connection::{ConnectionState, PeerStatus};
use crate::error::Result;
use crate::media::RemoteStream;
use crate::negotiation::{Negotiation, NegotiationState, Role};
use crate::signaling::IceCandidate;
use crate::PeerId;

/// Registry entry for one remote participant.
pub struct PeerEntry {
    peer_id: PeerId,
    connection_id: u64,
    pub(super) negotiation: Negotiation,
    pub(super) remote_stream: Option<RemoteStream>,
    pub(super) connection_state: ConnectionState,
    transport: Box<dyn PeerTransport>,
}

impl PeerEntry {
    pub(super) fn new(
        peer_id: PeerId,
        connection_id: u64,
        role: Role,
        transport: Box<dyn PeerTransport>,
    ) -> Self {
        Self {
            peer_id,
            connection_id,
            negotiation: Negotiation::new(role),
            remote_stream: None,
            connection_state: ConnectionState::New,
            transport,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn role(&self) -> Role {
        self.negotiation.role()
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    pub fn negotiation(&self) -> &Negotiation {
        &self.negotiation
    }

    pub fn pending_candidates(&self) -> usize {
        self.negotiation.pending_candidates()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn transport(&self) -> &dyn PeerTransport {
        self.transport.as_ref()
    }

    pub(super) fn status(&self) -> PeerStatus {
        PeerStatus {
            role: self.role(),
            negotiation: self.negotiation_state(),
            connection: self.connection_state,
            remote_stream: self.remote_stream.clone(),
        }
    }

    /// Creates and applies a local offer. The caller has entered `LocalOfferPending`.
    pub(super) async fn make_offer(&mut self) -> Result<SessionDescription> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.negotiation.local_offer_set();
        Ok(offer)
    }

    /// Applies a remote offer and produces the local answer.
    pub(super) async fn accept_offer(&mut self, sdp: String) -> Result<SessionDescription> {
        self.transport
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.negotiation.remote_offer_applied();

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.negotiation.local_answer_set();
        Ok(answer)
    }

    pub(super) async fn accept_answer(&mut self, sdp: String) -> Result<()> {
        self.transport
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        self.negotiation.remote_answer_applied();
        Ok(())
    }

    /// Applies now, or queues until a remote description exists.
    pub(super) async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.negotiation.discards_remote_candidates() {
            debug!(peer = %self.peer_id, "candidate from a superseded remote offer dropped");
            return;
        }
        match self.negotiation.buffer_candidate(candidate) {
            Some(candidate) => self.apply_candidate(candidate).await,
            None => debug!(
                peer = %self.peer_id,
                queued = self.negotiation.pending_candidates(),
                "no remote description yet, candidate queued"
            ),
        }
    }

    /// Applies every queued candidate in receipt order and empties the queue.
    pub(super) async fn flush_candidates(&mut self) {
        let pending = self.negotiation.take_pending_candidates();
        if !pending.is_empty() {
            debug!(peer = %self.peer_id, count = pending.len(), "applying queued candidates");
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!(peer = %self.peer_id, error = %e, "failed to add remote ICE candidate");
        }
    }

    /// Closes the transport. Errors from an already-closed transport are swallowed.
    pub(super) async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            debug!(peer = %self.peer_id, error = %e, "close failed, treating as already closed");
        }
    }
}
