use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::Room;
use crate::config::{ClientConfig, OfferPolicy};
use crate::error::{Error, Result};
use crate::media::{LocalStream, MediaKind, MediaSource, RemoteStream};
use crate::negotiation::Role;
use crate::peer::{PeerConnectionManager, PeerConnector, PeerEvent, PeerUpdate};
use crate::presence::PresenceStore;
use crate::signaling::{ChannelEvent, SignalMessage, SignalingChannel};
use crate::{PeerId, RoomId};

/// Intents from the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    JoinCall { room_id: RoomId },
    LeaveCall,
    ToggleMute,
    ToggleVideo,
    Shutdown,
}

/// What the session reports back to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Joined { room_id: RoomId },
    Left { room_id: RoomId },
    RemoteStreamUpdated { peer_id: PeerId, stream: RemoteStream },
    PeerRemoved { peer_id: PeerId },
    /// A single peer failed; the rest of the session carries on.
    PeerFailed { peer_id: PeerId, reason: String },
    MediaUnavailable { reason: String },
    MuteChanged { muted: bool },
    VideoChanged { enabled: bool },
}

/// Sends commands to a running [`RoomSession::run`] loop.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn channel() -> (Self, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }

    pub async fn join_call(&self, room_id: impl Into<RoomId>) -> Result<()> {
        self.send(SessionCommand::JoinCall {
            room_id: room_id.into(),
        })
        .await
    }

    pub async fn leave_call(&self) -> Result<()> {
        self.send(SessionCommand::LeaveCall).await
    }

    pub async fn toggle_mute(&self) -> Result<()> {
        self.send(SessionCommand::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> Result<()> {
        self.send(SessionCommand::ToggleVideo).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown).await
    }

    /// Resolves once the session loop has stopped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::Other(anyhow::anyhow!("session is no longer running")))
    }
}

/// Bridges room membership to the peer connection manager for the local participant.
///
/// All state is owned by one task; signaling messages, transport callbacks and
/// application commands are handled one at a time.
pub struct RoomSession {
    local_id: PeerId,
    policy: OfferPolicy,
    want_audio: bool,
    want_video: bool,
    room: Option<Room>,
    manager: PeerConnectionManager,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    media: Box<dyn MediaSource>,
    local_stream: Option<LocalStream>,
    presence: Arc<dyn PresenceStore>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl RoomSession {
    pub fn new(
        local_id: impl Into<PeerId>,
        config: &ClientConfig,
        connector: Arc<dyn PeerConnector>,
        channel: Arc<dyn SignalingChannel>,
        media: Box<dyn MediaSource>,
        presence: Arc<dyn PresenceStore>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let local_id = local_id.into();
        let (manager, peer_events) = PeerConnectionManager::new(local_id.clone(), connector, channel);
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            local_id,
            policy: config.offer_policy,
            want_audio: config.audio,
            want_video: config.video,
            room: None,
            manager,
            peer_events,
            media,
            local_stream: None,
            presence,
            events,
        };
        (session, rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    pub fn is_in_call(&self) -> bool {
        self.room.is_some()
    }

    pub fn manager(&self) -> &PeerConnectionManager {
        &self.manager
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.local_stream.as_ref()
    }

    /// Runs until shutdown, the command channel closing, or the signaling channel
    /// closing. Leaves the current room on the way out.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut inbound: mpsc::Receiver<ChannelEvent>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => {
                        if let Err(e) = self.execute(command).await {
                            warn!(error = %e, "session command failed");
                        }
                    }
                },
                Some(event) = self.peer_events.recv() => self.handle_peer_event(event).await,
                event = inbound.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_channel_event(event).await {
                            warn!(error = %e, "failed to handle signaling event");
                        }
                    }
                    None => {
                        warn!("signaling channel closed, ending session");
                        break;
                    }
                },
            }
        }
        self.leave_call().await
    }

    async fn execute(&mut self, command: SessionCommand) -> Result<()> {
        match command {
            SessionCommand::JoinCall { room_id } => self.join_call(&room_id).await,
            SessionCommand::LeaveCall => self.leave_call().await,
            SessionCommand::ToggleMute => self.toggle_mute().await.map(|_| ()),
            SessionCommand::ToggleVideo => self.toggle_video().await.map(|_| ()),
            SessionCommand::Shutdown => Ok(()),
        }
    }

    /// Joins `room_id`, leaving any other room first.
    ///
    /// Local media is acquired before anything else; if that fails no connection is
    /// created. Under [`OfferPolicy::NewcomerOffers`] an offer goes to every member
    /// already present.
    pub async fn join_call(&mut self, room_id: &str) -> Result<()> {
        if self.room.as_ref().is_some_and(|room| room.id() == room_id) {
            debug!(room = %room_id, "already in this room");
            return Ok(());
        }
        if self.room.is_some() {
            self.leave_call().await?;
        }

        let rooms = self.presence.rooms_with_users().await?;
        let Some(target) = rooms.iter().find(|room| room.id == room_id) else {
            return Err(Error::Presence(format!("unknown room {}", room_id)));
        };
        let present: Vec<PeerId> = target
            .participants
            .iter()
            .map(|p| p.id.clone())
            .filter(|id| *id != self.local_id)
            .collect();

        let stream = match self.media.acquire(self.want_video, self.want_audio).await {
            Ok(stream) => stream,
            Err(e) => {
                let reason = e.to_string();
                warn!(room = %room_id, %reason, "cannot join without local media");
                self.emit(SessionEvent::MediaUnavailable {
                    reason: reason.clone(),
                });
                return Err(match e {
                    Error::MediaUnavailable(_) => e,
                    _ => Error::MediaUnavailable(reason),
                });
            }
        };

        for stale in rooms
            .iter()
            .filter(|room| room.id != room_id && room.contains(&self.local_id))
        {
            info!(room = %stale.id, "leaving previous room");
            self.presence.leave_room(&stale.id, &self.local_id).await?;
            self.manager
                .signal(SignalMessage::Leave {
                    room_id: stale.id.clone(),
                    user_id: self.local_id.clone(),
                })
                .await?;
        }

        self.presence.join_room(room_id, &self.local_id).await?;
        for failure in self.manager.set_local_media(Some(stream.clone())).await {
            self.report_peer_error(failure);
        }
        self.local_stream = Some(stream);
        self.room = Some(Room::with_participants(room_id.to_owned(), present.clone()));

        self.manager
            .signal(SignalMessage::Join {
                room_id: room_id.to_owned(),
                user_id: self.local_id.clone(),
            })
            .await?;
        info!(room = %room_id, present = present.len(), "joined room");
        self.emit(SessionEvent::Joined {
            room_id: room_id.to_owned(),
        });

        if self.policy == OfferPolicy::NewcomerOffers {
            for peer_id in present {
                self.connect_and_offer(&peer_id).await;
            }
        }
        Ok(())
    }

    /// Tears down every connection, releases local media and leaves every room the
    /// local participant is listed in. No-op outside a call.
    pub async fn leave_call(&mut self) -> Result<()> {
        let Some(room) = self.room.take() else {
            debug!("not in a call");
            return Ok(());
        };

        self.manager.teardown_all().await;
        self.manager.set_local_media(None).await;
        self.local_stream = None;
        self.media.release();

        let mut rooms_to_leave = vec![room.id().to_owned()];
        match self.presence.rooms_with_users().await {
            Ok(rooms) => rooms_to_leave.extend(
                rooms
                    .into_iter()
                    .filter(|r| r.id != room.id() && r.contains(&self.local_id))
                    .map(|r| r.id),
            ),
            Err(e) => warn!(error = %e, "cannot list rooms, leaving current room only"),
        }

        for room_id in rooms_to_leave {
            if let Err(e) = self.presence.leave_room(&room_id, &self.local_id).await {
                warn!(room = %room_id, error = %e, "presence leave failed");
            }
            self.manager
                .signal(SignalMessage::Leave {
                    room_id,
                    user_id: self.local_id.clone(),
                })
                .await?;
        }

        info!(room = %room.id(), "left room");
        self.emit(SessionEvent::Left {
            room_id: room.id().to_owned(),
        });
        Ok(())
    }

    /// Flips the audio track. Local only: nothing is renegotiated. Returns whether
    /// audio is now muted.
    pub async fn toggle_mute(&mut self) -> Result<bool> {
        let stream = self
            .local_stream
            .as_ref()
            .ok_or_else(|| Error::MediaUnavailable("not in a call".into()))?;
        let enabled = stream
            .toggle(MediaKind::Audio)
            .ok_or_else(|| Error::MediaUnavailable("no audio track".into()))?;

        debug!(muted = !enabled, "audio toggled");
        self.publish_media_state().await;
        self.emit(SessionEvent::MuteChanged { muted: !enabled });
        Ok(!enabled)
    }

    /// Flips the video track. The first time video is turned on in an audio-only
    /// call a track is added, which renegotiates every connection. Returns whether
    /// video is now on.
    pub async fn toggle_video(&mut self) -> Result<bool> {
        let stream = self
            .local_stream
            .as_mut()
            .ok_or_else(|| Error::MediaUnavailable("not in a call".into()))?;

        if let Some(enabled) = stream.toggle(MediaKind::Video) {
            debug!(enabled, "video toggled");
            self.publish_media_state().await;
            self.emit(SessionEvent::VideoChanged { enabled });
            return Ok(enabled);
        }

        let video = match self.media.acquire(true, false).await {
            Ok(video) => video,
            Err(e) => {
                self.emit(SessionEvent::MediaUnavailable {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        stream.merge(video);
        let stream = stream.clone();

        info!("video track added, renegotiating peers");
        for failure in self.manager.set_local_media(Some(stream)).await {
            self.report_peer_error(failure);
        }
        self.publish_media_state().await;
        self.emit(SessionEvent::VideoChanged { enabled: true });
        Ok(true)
    }

    pub async fn handle_channel_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Message(message) => self.handle_signal(message).await,
            ChannelEvent::Disconnected => {
                warn!("signaling channel down, holding outbound messages");
                self.manager.outbox().suspend();
                Ok(())
            }
            ChannelEvent::Reconnected => {
                info!("signaling channel back, resuming");
                self.manager.outbox().resume().await
            }
        }
    }

    pub async fn handle_signal(&mut self, message: SignalMessage) -> Result<()> {
        match message {
            SignalMessage::AllUsers { room_id, user_ids } => {
                self.on_room_roster(&room_id, user_ids).await;
                Ok(())
            }
            SignalMessage::PeerJoined { user_id } => {
                self.on_peer_joined(user_id).await;
                Ok(())
            }
            SignalMessage::PeerLeft { user_id } => {
                self.on_peer_left(&user_id).await;
                Ok(())
            }
            SignalMessage::Offer { to, from, sdp } => {
                if !self.accepts(&to, &from) {
                    return Ok(());
                }
                if let Some(room) = self.room.as_mut() {
                    room.add_peer(&from);
                }
                let result = self.manager.handle_offer(&from, sdp).await;
                self.absorb(result)
            }
            SignalMessage::Answer { to, from, sdp } => {
                if !self.accepts(&to, &from) {
                    return Ok(());
                }
                let result = self.manager.handle_answer(&from, sdp).await;
                self.absorb(result)
            }
            SignalMessage::IceCandidate {
                to,
                from,
                candidate,
            } => {
                if self.accepts(&to, &from) {
                    self.manager.handle_remote_candidate(&from, candidate).await;
                }
                Ok(())
            }
            SignalMessage::Renegotiate { to, from } => {
                if !self.accepts(&to, &from) {
                    return Ok(());
                }
                let result = self.manager.handle_renegotiate_request(&from).await;
                self.absorb(result)
            }
            SignalMessage::Join { .. } | SignalMessage::Leave { .. } => {
                debug!("membership intent echoed by relay, ignored");
                Ok(())
            }
            SignalMessage::Error { message } => {
                warn!(%message, "signaling server reported an error");
                Ok(())
            }
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match self.manager.handle_peer_event(event).await {
            Some(PeerUpdate::RemoteStream { peer_id, stream }) => {
                self.emit(SessionEvent::RemoteStreamUpdated { peer_id, stream });
            }
            Some(PeerUpdate::TransportFailed { peer_id }) => {
                self.manager.remove_connection(&peer_id).await;
                self.emit(SessionEvent::PeerFailed {
                    peer_id,
                    reason: "transport failed".into(),
                });
            }
            None => {}
        }
    }

    /// Handles every transport event already queued, without waiting for more.
    /// Returns how many were handled.
    pub async fn flush_peer_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.peer_events.try_recv() {
            self.handle_peer_event(event).await;
            handled += 1;
        }
        handled
    }

    async fn on_peer_joined(&mut self, user_id: PeerId) {
        if user_id == self.local_id {
            return;
        }
        let Some(room) = self.room.as_mut() else {
            debug!(peer = %user_id, "peer joined while not in a call");
            return;
        };
        room.add_peer(&user_id);
        info!(peer = %user_id, room = %room.id(), "peer joined");

        if self.policy == OfferPolicy::ExistingMembersOffer {
            self.connect_and_offer(&user_id).await;
        }
    }

    /// The relay listed who was in the room when we joined. The local presence view
    /// may not know them; under [`OfferPolicy::NewcomerOffers`] we offer to each.
    async fn on_room_roster(&mut self, room_id: &str, user_ids: Vec<PeerId>) {
        let Some(room) = self.room.as_mut().filter(|room| room.id() == room_id) else {
            debug!(room = %room_id, "roster for a room we are not in, ignored");
            return;
        };
        let members: Vec<PeerId> = user_ids
            .into_iter()
            .filter(|user_id| *user_id != self.local_id)
            .collect();
        for user_id in &members {
            room.add_peer(user_id);
        }
        debug!(room = %room_id, members = members.len(), "room roster received");

        if self.policy == OfferPolicy::NewcomerOffers {
            for user_id in members {
                self.connect_and_offer(&user_id).await;
            }
        }
    }

    async fn on_peer_left(&mut self, user_id: &str) {
        if let Some(room) = self.room.as_mut() {
            room.remove_peer(user_id);
        }
        if self.manager.remove_connection(user_id).await {
            info!(peer = %user_id, "peer left");
            self.emit(SessionEvent::PeerRemoved {
                peer_id: user_id.to_owned(),
            });
        }
    }

    async fn connect_and_offer(&mut self, peer_id: &str) {
        match self.manager.create_connection(peer_id, Role::Offerer).await {
            Ok(_) => {}
            Err(Error::AlreadyConnected(_)) => {
                debug!(peer = %peer_id, "already connected, no new offer");
                return;
            }
            Err(e) => {
                self.report_peer_error(e);
                return;
            }
        }
        if let Err(e) = self.manager.negotiate(peer_id).await {
            self.report_peer_error(e);
        }
    }

    /// Negotiation messages are only for us, from someone else, while in a call.
    fn accepts(&self, to: &str, from: &str) -> bool {
        if to != self.local_id || from == self.local_id {
            debug!(%to, %from, "negotiation message not addressed to us");
            return false;
        }
        if self.room.is_none() {
            debug!(%from, "negotiation message while not in a call");
            return false;
        }
        true
    }

    /// Peer-level failures are reported and swallowed; anything else propagates.
    fn absorb(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if e.is_peer_level() => {
                self.report_peer_error(e);
                Ok(())
            }
            other => other,
        }
    }

    fn report_peer_error(&self, error: Error) {
        let peer_id = error.peer().unwrap_or_default().to_owned();
        if let Error::NegotiationBusy(_) = error {
            debug!(peer = %peer_id, "negotiation request coalesced");
            return;
        }
        warn!(peer = %peer_id, error = %error, "peer-level failure");
        self.emit(SessionEvent::PeerFailed {
            peer_id,
            reason: error.to_string(),
        });
    }

    async fn publish_media_state(&mut self) {
        let (Some(room), Some(stream)) = (&self.room, &self.local_stream) else {
            return;
        };
        let audio = stream.is_enabled(MediaKind::Audio);
        let video = stream.is_enabled(MediaKind::Video);
        if let Err(e) = self
            .presence
            .set_media_state(room.id(), &self.local_id, audio, video)
            .await
        {
            warn!(error = %e, "failed to publish media state");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // The application may not be listening.
        let _ = self.events.send(event);
    }
}
