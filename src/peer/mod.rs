//! The peer connection registry: the single owner of "who am I connected to".

mod entry;
mod transport;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub use entry::PeerEntry;
pub use transport::{
    PeerConnector, PeerEvent, PeerEventKind, PeerEventSink, PeerTransport, SdpKind,
    SessionDescription,
};

use crate::connection::{ConnectionState, PeerMonitor};
use crate::error::{Error, Result};
use crate::media::{LocalStream, RemoteStream};
use crate::negotiation::{OfferDecision, Role};
use crate::signaling::{IceCandidate, Outbox, SignalMessage, SignalingChannel};
use crate::PeerId;

/// Candidates kept per peer that has not offered yet.
const MAX_EARLY_CANDIDATES: usize = 64;
/// Distinct senders whose candidates may be parked at once.
const MAX_EARLY_PEERS: usize = 32;

/// Something the session should pass on to the application.
#[derive(Debug, Clone)]
pub enum PeerUpdate {
    RemoteStream { peer_id: PeerId, stream: RemoteStream },
    TransportFailed { peer_id: PeerId },
}

pub struct PeerConnectionManager {
    local_id: PeerId,
    connector: Arc<dyn PeerConnector>,
    entries: HashMap<PeerId, PeerEntry>,
    /// Candidates that raced ahead of the offer creating their entry.
    early_candidates: HashMap<PeerId, VecDeque<IceCandidate>>,
    local_media: Option<LocalStream>,
    outbox: Outbox,
    monitor: PeerMonitor,
    events: mpsc::UnboundedSender<PeerEvent>,
    next_connection_id: u64,
}

impl PeerConnectionManager {
    /// Returns the manager and the receiver its transports report into. The owner
    /// feeds every event back through [`handle_peer_event`](Self::handle_peer_event).
    pub fn new(
        local_id: impl Into<PeerId>,
        connector: Arc<dyn PeerConnector>,
        channel: Arc<dyn SignalingChannel>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id: local_id.into(),
            connector,
            entries: HashMap::new(),
            early_candidates: HashMap::new(),
            local_media: None,
            outbox: Outbox::new(channel),
            monitor: PeerMonitor::new(),
            events,
            next_connection_id: 0,
        };
        (manager, rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn entry(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.entries.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn local_media(&self) -> Option<&LocalStream> {
        self.local_media.as_ref()
    }

    pub fn monitor(&self) -> &PeerMonitor {
        &self.monitor
    }

    pub fn outbox(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    pub async fn signal(&mut self, message: SignalMessage) -> Result<()> {
        self.outbox.send(message).await
    }

    /// Opens a connection to `peer_id` and attaches the current local tracks.
    ///
    /// Fails with [`Error::AlreadyConnected`] if an entry exists. Local candidates
    /// start arriving as [`PeerEvent`]s once the transport begins gathering.
    pub async fn create_connection(&mut self, peer_id: &str, role: Role) -> Result<&PeerEntry> {
        if peer_id == self.local_id {
            return Err(Error::negotiation(peer_id, "refusing to connect to self"));
        }
        if self.entries.contains_key(peer_id) {
            return Err(Error::AlreadyConnected(peer_id.to_owned()));
        }

        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;
        let sink = PeerEventSink::new(peer_id.to_owned(), connection_id, self.events.clone());
        let transport = self
            .connector
            .connect(sink)
            .await
            .map_err(|e| Error::negotiation(peer_id, e))?;

        if let Err(e) = transport.sync_tracks(self.local_media.as_ref()).await {
            if let Err(close_err) = transport.close().await {
                debug!(peer = %peer_id, error = %close_err, "close after failed attach");
            }
            return Err(Error::negotiation(peer_id, e));
        }

        let mut entry = PeerEntry::new(peer_id.to_owned(), connection_id, role, transport);
        if let Some(early) = self.early_candidates.remove(peer_id) {
            for candidate in early {
                entry.negotiation.buffer_candidate(candidate);
            }
        }

        info!(peer = %peer_id, %role, connection_id, "peer connection created");
        self.monitor.update(peer_id, entry.status());
        Ok(self.entries.entry(peer_id.to_owned()).or_insert(entry))
    }

    /// Closes and forgets the connection to `peer_id`. No-op if there is none.
    ///
    /// Returns whether an entry was removed.
    pub async fn remove_connection(&mut self, peer_id: &str) -> bool {
        self.early_candidates.remove(peer_id);
        let Some(entry) = self.entries.remove(peer_id) else {
            debug!(peer = %peer_id, "no connection to remove");
            return false;
        };

        entry.close().await;
        self.outbox.discard_addressed_to(peer_id);
        self.monitor.remove(peer_id);
        info!(peer = %peer_id, "peer connection removed");
        true
    }

    /// Replaces the local media and re-attaches it on every connection. Connections
    /// whose sent tracks changed are renegotiated.
    ///
    /// Returns the peer-level failures; the affected entries are already gone.
    pub async fn set_local_media(&mut self, stream: Option<LocalStream>) -> Vec<Error> {
        self.local_media = stream;

        let mut failures = Vec::new();
        let peers: Vec<PeerId> = self.entries.keys().cloned().collect();
        for peer_id in peers {
            let Some(entry) = self.entries.get(&peer_id) else {
                continue;
            };
            let changed = match entry.transport().sync_tracks(self.local_media.as_ref()).await {
                Ok(changed) => changed,
                Err(e) => {
                    failures.push(self.fail_peer(&peer_id, e).await);
                    continue;
                }
            };
            if !changed {
                continue;
            }

            match self.negotiate(&peer_id).await {
                Ok(()) | Err(Error::NegotiationBusy(_)) => {}
                Err(e) => failures.push(e),
            }
        }
        failures
    }

    /// Snapshot of peer id to remote stream, `None` until a track arrived.
    pub fn get_remote_streams(&self) -> HashMap<PeerId, Option<RemoteStream>> {
        self.entries
            .iter()
            .map(|(peer_id, entry)| (peer_id.clone(), entry.remote_stream.clone()))
            .collect()
    }

    /// Closes every connection. Safe to call repeatedly.
    pub async fn teardown_all(&mut self) {
        let entries: Vec<PeerEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            entry.close().await;
        }
        if !entries.is_empty() {
            info!(count = entries.len(), "tore down all peer connections");
        }
        self.early_candidates.clear();
        self.outbox.discard_peer_messages();
        self.monitor.clear();
    }

    /// Starts a negotiation round with `peer_id`.
    ///
    /// The offering side sends a fresh offer; the answering side asks the offerer to
    /// renegotiate. While a round is in flight the request is queued as a single
    /// follow-up and [`Error::NegotiationBusy`] is returned.
    pub async fn negotiate(&mut self, peer_id: &str) -> Result<()> {
        let local_id = self.local_id.clone();
        let Some(entry) = self.entries.get_mut(peer_id) else {
            debug!(peer = %peer_id, "no connection, negotiation skipped");
            return Ok(());
        };

        if entry.role() == Role::Answerer {
            if entry.negotiation.is_stable() {
                debug!(peer = %peer_id, "asking offerer to renegotiate");
                return self
                    .outbox
                    .send(SignalMessage::Renegotiate {
                        to: peer_id.to_owned(),
                        from: local_id,
                    })
                    .await;
            }
            entry.negotiation.request_follow_up();
            return Err(Error::NegotiationBusy(peer_id.to_owned()));
        }

        if let Err(e) = entry.negotiation.begin_local_offer(peer_id) {
            if matches!(e, Error::NegotiationBusy(_)) {
                warn!(
                    peer = %peer_id,
                    state = %entry.negotiation_state(),
                    "negotiation already in flight, follow-up queued"
                );
            }
            return Err(e);
        }

        let offer = match entry.make_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail_peer(peer_id, e).await),
        };
        self.publish(peer_id);

        info!(peer = %peer_id, "sending offer");
        self.outbox
            .send(SignalMessage::Offer {
                to: peer_id.to_owned(),
                from: local_id,
                sdp: offer.sdp,
            })
            .await
    }

    /// Answers an offer from `from`, creating the answering entry on first contact.
    pub async fn handle_offer(&mut self, from: &str, sdp: String) -> Result<()> {
        let decision = self
            .entries
            .get(from)
            .map(|entry| entry.negotiation.offer_decision(&self.local_id, from));

        match decision {
            None => {
                self.create_connection(from, Role::Answerer).await?;
            }
            Some(OfferDecision::Accept) => {}
            Some(OfferDecision::Ignore) => {
                let dropped = self
                    .entries
                    .get_mut(from)
                    .map(|entry| entry.negotiation.remote_offer_ignored())
                    .unwrap_or_default();
                warn!(
                    peer = %from,
                    dropped,
                    "offer discarded, our own offer takes precedence"
                );
                return Ok(());
            }
            Some(OfferDecision::Yield) => {
                info!(peer = %from, "offer collision, yielding to the remote offer");
                let carried = self
                    .entries
                    .get_mut(from)
                    .map(|entry| entry.negotiation.take_pending_candidates())
                    .unwrap_or_default();
                self.remove_connection(from).await;
                if !carried.is_empty() {
                    self.early_candidates
                        .entry(from.to_owned())
                        .or_default()
                        .extend(carried);
                }
                self.create_connection(from, Role::Answerer).await?;
            }
        }

        let local_id = self.local_id.clone();
        let Some(entry) = self.entries.get_mut(from) else {
            return Ok(());
        };
        let answer = match entry.accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail_peer(from, e).await),
        };

        info!(peer = %from, "sending answer");
        self.outbox
            .send(SignalMessage::Answer {
                to: from.to_owned(),
                from: local_id,
                sdp: answer.sdp,
            })
            .await?;
        self.finish_cycle(from).await
    }

    /// Applies an answer to our outstanding offer. Answers in any other state are
    /// stale and discarded.
    pub async fn handle_answer(&mut self, from: &str, sdp: String) -> Result<()> {
        let Some(entry) = self.entries.get_mut(from) else {
            debug!(peer = %from, "answer from unknown peer discarded");
            return Ok(());
        };
        if !entry.negotiation.accepts_answer() {
            warn!(
                peer = %from,
                state = %entry.negotiation_state(),
                "stale answer discarded"
            );
            return Ok(());
        }

        if let Err(e) = entry.accept_answer(sdp).await {
            return Err(self.fail_peer(from, e).await);
        }
        info!(peer = %from, "remote answer applied");
        self.finish_cycle(from).await
    }

    pub async fn handle_remote_candidate(&mut self, from: &str, candidate: IceCandidate) {
        if let Some(entry) = self.entries.get_mut(from) {
            entry.add_remote_candidate(candidate).await;
            return;
        }

        if !self.early_candidates.contains_key(from)
            && self.early_candidates.len() >= MAX_EARLY_PEERS
        {
            warn!(peer = %from, "too many unknown senders with parked candidates, dropping");
            return;
        }
        let early = self.early_candidates.entry(from.to_owned()).or_default();
        if early.len() >= MAX_EARLY_CANDIDATES {
            warn!(peer = %from, "too many candidates ahead of an offer, dropping");
            return;
        }
        debug!(peer = %from, "candidate arrived before any offer, parked");
        early.push_back(candidate);
    }

    /// The answering side of a pair asked us to renegotiate.
    pub async fn handle_renegotiate_request(&mut self, from: &str) -> Result<()> {
        match self.entries.get(from).map(PeerEntry::role) {
            Some(Role::Offerer) => match self.negotiate(from).await {
                Err(Error::NegotiationBusy(_)) => Ok(()),
                other => other,
            },
            Some(Role::Answerer) => {
                warn!(peer = %from, "renegotiation request from the offering side ignored");
                Ok(())
            }
            None => {
                debug!(peer = %from, "renegotiation request for unknown peer discarded");
                Ok(())
            }
        }
    }

    /// Applies a transport callback. Events from connections that were removed in
    /// the meantime are dropped.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Option<PeerUpdate> {
        let PeerEvent {
            peer_id,
            connection_id,
            kind,
        } = event;

        let entry = match self.entries.get_mut(&peer_id) {
            Some(entry) if entry.connection_id() == connection_id => entry,
            _ => {
                trace!(peer = %peer_id, connection_id, "event from a closed connection ignored");
                return None;
            }
        };

        match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                let message = SignalMessage::IceCandidate {
                    to: peer_id.clone(),
                    from: self.local_id.clone(),
                    candidate,
                };
                if let Err(e) = self.outbox.send(message).await {
                    warn!(peer = %peer_id, error = %e, "failed to send local candidate");
                }
                None
            }
            PeerEventKind::RemoteTrack(track) => {
                debug!(peer = %peer_id, kind = %track.kind, track = %track.id, "remote track received");
                let stream = entry
                    .remote_stream
                    .get_or_insert_with(|| RemoteStream::new(track.stream_id.clone()));
                stream.add_track(track);
                let stream = stream.clone();
                self.publish(&peer_id);
                Some(PeerUpdate::RemoteStream { peer_id, stream })
            }
            PeerEventKind::StateChanged(state) => {
                entry.connection_state = state;
                info!(peer = %peer_id, %state, "peer connection state changed");
                self.publish(&peer_id);
                (state == ConnectionState::Failed).then_some(PeerUpdate::TransportFailed { peer_id })
            }
        }
    }

    async fn finish_cycle(&mut self, peer_id: &str) -> Result<()> {
        let Some(entry) = self.entries.get_mut(peer_id) else {
            return Ok(());
        };
        entry.flush_candidates().await;
        let follow_up = entry.negotiation.take_follow_up();
        self.publish(peer_id);

        if !follow_up {
            return Ok(());
        }
        debug!(peer = %peer_id, "running coalesced renegotiation");
        match self.negotiate(peer_id).await {
            Err(Error::NegotiationBusy(_)) => Ok(()),
            other => other,
        }
    }

    /// Marks the entry failed, drops it and returns the peer-level error.
    async fn fail_peer(&mut self, peer_id: &str, cause: Error) -> Error {
        if let Some(entry) = self.entries.get_mut(peer_id) {
            entry.negotiation.fail();
        }
        warn!(peer = %peer_id, error = %cause, "negotiation failed, dropping peer connection");
        self.remove_connection(peer_id).await;
        if matches!(cause, Error::NegotiationFailed { .. }) {
            cause
        } else {
            Error::negotiation(peer_id, cause)
        }
    }

    fn publish(&self, peer_id: &str) {
        if let Some(entry) = self.entries.get(peer_id) {
            self.monitor.update(peer_id, entry.status());
        }
    }
}
