#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use webrtc_room_client::connection::ConnectionState;
use webrtc_room_client::media::{DeviceMediaSource, LocalStream, MediaKind, MediaSource, RemoteTrack};
use webrtc_room_client::peer::{PeerConnector, PeerEventSink, PeerTransport, SdpKind, SessionDescription};
use webrtc_room_client::presence::InMemoryPresence;
use webrtc_room_client::signaling::{ChannelEvent, IceCandidate, SignalMessage, SignalingChannel};
use webrtc_room_client::{ClientConfig, Error, Result, RoomSession, SessionEvent};

pub fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// In-process relay: routes addressed messages and announces room membership.
#[derive(Default)]
pub struct Hub {
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<String, mpsc::UnboundedSender<ChannelEvent>>,
    rooms: HashMap<String, BTreeSet<String>>,
    sent: Vec<SignalMessage>,
    down: bool,
}

impl HubState {
    fn deliver(&self, to: &str, message: SignalMessage) {
        if let Some(tx) = self.clients.get(to) {
            let _ = tx.send(ChannelEvent::Message(message));
        }
    }
}

impl Hub {
    pub fn register(self: &Arc<Self>, id: &str) -> (Arc<HubClient>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().clients.insert(id.to_owned(), tx);
        let client = Arc::new(HubClient {
            hub: Arc::clone(self),
        });
        (client, rx)
    }

    pub fn set_down(&self, down: bool) {
        self.state.lock().unwrap().down = down;
    }

    /// Every message the hub accepted, in order.
    pub fn sent(&self) -> Vec<SignalMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn count(&self, pred: impl Fn(&SignalMessage) -> bool) -> usize {
        self.state.lock().unwrap().sent.iter().filter(|m| pred(m)).count()
    }

    pub fn offers(&self, from: &str, to: &str) -> usize {
        self.count(|m| matches!(m, SignalMessage::Offer { from: f, to: t, .. } if f == from && t == to))
    }

    pub fn offers_between(&self, a: &str, b: &str) -> usize {
        self.offers(a, b) + self.offers(b, a)
    }

    fn route(&self, message: SignalMessage) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if state.down {
            return Err(Error::SignalDeliveryUnavailable("hub offline".into()));
        }
        state.sent.push(message.clone());

        match &message {
            SignalMessage::Join { room_id, user_id } => {
                let members = state.rooms.entry(room_id.clone()).or_default();
                let others: Vec<String> = members.iter().filter(|m| *m != user_id).cloned().collect();
                members.insert(user_id.clone());
                state.deliver(
                    user_id,
                    SignalMessage::AllUsers {
                        room_id: room_id.clone(),
                        user_ids: others.clone(),
                    },
                );
                for other in others {
                    state.deliver(
                        &other,
                        SignalMessage::PeerJoined {
                            user_id: user_id.clone(),
                        },
                    );
                }
            }
            SignalMessage::Leave { room_id, user_id } => {
                let Some(members) = state.rooms.get_mut(room_id) else {
                    return Ok(());
                };
                if !members.remove(user_id) {
                    return Ok(());
                }
                let remaining: Vec<String> = members.iter().cloned().collect();
                for other in remaining {
                    state.deliver(
                        &other,
                        SignalMessage::PeerLeft {
                            user_id: user_id.clone(),
                        },
                    );
                }
            }
            other => {
                if let Some(to) = other.target() {
                    state.deliver(to, message.clone());
                }
            }
        }
        Ok(())
    }
}

pub struct HubClient {
    hub: Arc<Hub>,
}

#[async_trait]
impl SignalingChannel for HubClient {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        self.hub.route(message)
    }
}

type SentTrack = (MediaKind, String, String);

#[derive(Default)]
struct MockInner {
    tracks: Vec<SentTrack>,
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
    seen_remote_tracks: HashSet<String>,
    version: u32,
}

/// Recorded state of one fake peer connection.
pub struct MockTransportState {
    pub peer_id: String,
    pub connection_id: u64,
    sink: PeerEventSink,
    inner: Mutex<MockInner>,
    closed: AtomicBool,
}

impl MockTransportState {
    pub fn candidates(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.inner.lock().unwrap().remote.clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.inner.lock().unwrap().local.clone()
    }

    pub fn sent_tracks(&self) -> Vec<String> {
        self.inner.lock().unwrap().tracks.iter().map(|t| t.1.clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reports an ICE failure as the real transport would.
    pub fn fail(&self) {
        self.sink.state_changed(ConnectionState::Failed);
    }

    pub fn report_state(&self, state: ConnectionState) {
        self.sink.state_changed(state);
    }

    fn describe(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.version += 1;
        let mut sdp = format!(
            "v=0\r\no=mock {} {} IN IP4 127.0.0.1\r\n",
            self.connection_id, inner.version
        );
        for (kind, id, stream_id) in &inner.tracks {
            sdp.push_str(&format!("m={} {} {}\r\n", kind, id, stream_id));
        }
        sdp
    }
}

struct MockTransport(Arc<MockTransportState>);

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(self.0.describe()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(self.0.describe()))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let first = {
            let mut inner = self.0.inner.lock().unwrap();
            inner.local.push(description);
            inner.local.len() == 1
        };
        if first {
            let port = 5000 + self.0.connection_id;
            self.0.sink.local_candidate(IceCandidate::new(format!(
                "candidate:{} 1 udp 2130706431 10.0.0.1 {} typ host",
                self.0.connection_id, port
            )));
        }
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if !description.sdp.starts_with("v=0") {
            return Err(Error::Other(anyhow::anyhow!("unparseable session description")));
        }

        let mut announced = Vec::new();
        {
            let mut inner = self.0.inner.lock().unwrap();
            for line in description.sdp.lines() {
                let Some(media) = line.strip_prefix("m=") else {
                    continue;
                };
                let mut parts = media.split_whitespace();
                let (Some(kind), Some(id), Some(stream_id)) = (parts.next(), parts.next(), parts.next()) else {
                    continue;
                };
                let kind = match kind {
                    "audio" => MediaKind::Audio,
                    "video" => MediaKind::Video,
                    _ => continue,
                };
                if inner.seen_remote_tracks.insert(id.to_owned()) {
                    announced.push(RemoteTrack {
                        id: id.to_owned(),
                        stream_id: stream_id.to_owned(),
                        kind,
                        handle: None,
                    });
                }
            }
            inner.remote.push(description);
        }

        for track in announced {
            self.0.sink.remote_track(track);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.0.is_closed() {
            return Err(Error::Other(anyhow::anyhow!("connection closed")));
        }
        self.0.inner.lock().unwrap().candidates.push(candidate);
        Ok(())
    }

    async fn sync_tracks(&self, stream: Option<&LocalStream>) -> Result<bool> {
        let wanted: Vec<SentTrack> = stream
            .map(|s| {
                s.tracks()
                    .iter()
                    .map(|t| {
                        let stream_id = t.id().rsplit_once('-').map_or(t.id(), |(owner, _)| owner);
                        (t.kind(), t.id().to_owned(), stream_id.to_owned())
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut inner = self.0.inner.lock().unwrap();
        let changed = inner.tracks != wanted;
        inner.tracks = wanted;
        Ok(changed)
    }

    async fn close(&self) -> Result<()> {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Other(anyhow::anyhow!("already closed")));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

#[derive(Default)]
pub struct MockConnector {
    transports: Mutex<Vec<Arc<MockTransportState>>>,
}

impl MockConnector {
    /// Most recent connection opened towards `peer_id`.
    pub fn transport_to(&self, peer_id: &str) -> Arc<MockTransportState> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.peer_id == peer_id)
            .cloned()
            .unwrap_or_else(|| panic!("no transport towards {}", peer_id))
    }

    pub fn transports_to(&self, peer_id: &str) -> Vec<Arc<MockTransportState>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.peer_id == peer_id)
            .cloned()
            .collect()
    }

    pub fn opened(&self) -> usize {
        self.transports.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Box<dyn PeerTransport>> {
        let state = Arc::new(MockTransportState {
            peer_id: events.peer_id().to_owned(),
            connection_id: events.connection_id(),
            sink: events,
            inner: Mutex::new(MockInner::default()),
            closed: AtomicBool::new(false),
        });
        self.transports.lock().unwrap().push(Arc::clone(&state));
        Ok(Box::new(MockTransport(state)))
    }
}

/// A device that is never available.
pub struct NoDevices;

#[async_trait]
impl MediaSource for NoDevices {
    async fn acquire(&mut self, _video: bool, _audio: bool) -> Result<LocalStream> {
        Err(Error::MediaUnavailable("permission denied".into()))
    }

    fn release(&mut self) {}
}

pub fn offer_sdp(marker: &str) -> String {
    format!("v=0\r\no={} 1 1 IN IP4 127.0.0.1\r\n", marker)
}

pub fn is_offer(description: &SessionDescription) -> bool {
    description.kind == SdpKind::Offer
}

/// Shared signaling hub and presence store for a set of participants.
pub struct Mesh {
    pub hub: Arc<Hub>,
    pub presence: Arc<InMemoryPresence>,
}

impl Mesh {
    pub fn new() -> Self {
        setup();
        Self {
            hub: Arc::new(Hub::default()),
            presence: Arc::new(InMemoryPresence::with_rooms(["lobby", "games"])),
        }
    }

    pub fn node(&self, id: &str) -> Node {
        self.node_with(id, ClientConfig::default(), Box::new(DeviceMediaSource::new(id)))
    }

    pub fn node_with(&self, id: &str, config: ClientConfig, media: Box<dyn MediaSource>) -> Node {
        self.build_node(id, config, media, self.presence.clone())
    }

    /// A node whose presence store knows nobody else, like a standalone client.
    pub fn node_alone(&self, id: &str, config: ClientConfig) -> Node {
        let presence = Arc::new(InMemoryPresence::with_rooms(["lobby", "games"]));
        self.build_node(id, config, Box::new(DeviceMediaSource::new(id)), presence)
    }

    fn build_node(
        &self,
        id: &str,
        config: ClientConfig,
        media: Box<dyn MediaSource>,
        presence: Arc<InMemoryPresence>,
    ) -> Node {
        let (channel, inbound) = self.hub.register(id);
        let connector = Arc::new(MockConnector::default());
        let (session, events) = RoomSession::new(
            id,
            &config,
            connector.clone(),
            channel,
            media,
            presence,
        );
        Node {
            id: id.to_owned(),
            session,
            inbound,
            events,
            connector,
        }
    }
}

pub struct Node {
    pub id: String,
    pub session: RoomSession,
    pub inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub connector: Arc<MockConnector>,
}

impl Node {
    /// Handles what is queued for this node right now. Returns whether anything was.
    pub async fn drain(&mut self) -> bool {
        let mut progressed = false;
        while let Ok(event) = self.inbound.try_recv() {
            if let Err(e) = self.session.handle_channel_event(event).await {
                panic!("{} failed to handle signaling: {}", self.id, e);
            }
            progressed = true;
        }
        if self.session.flush_peer_events().await > 0 {
            progressed = true;
        }
        progressed
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn role_towards(&self, peer_id: &str) -> Option<webrtc_room_client::Role> {
        self.session.manager().entry(peer_id).map(|e| e.role())
    }

    pub fn state_towards(&self, peer_id: &str) -> Option<webrtc_room_client::NegotiationState> {
        self.session.manager().entry(peer_id).map(|e| e.negotiation_state())
    }
}

/// Runs every node until no messages or transport events are left.
pub async fn pump(nodes: &mut [&mut Node]) {
    for _ in 0..100 {
        let mut progressed = false;
        for node in nodes.iter_mut() {
            progressed |= node.drain().await;
        }
        if !progressed {
            return;
        }
    }
    panic!("mesh did not settle");
}
