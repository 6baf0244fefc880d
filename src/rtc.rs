//! [`PeerConnector`] backed by webrtc-rs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::media::{LocalStream, MediaKind, RemoteTrack};
use crate::peer::{PeerConnector, PeerEventSink, PeerTransport, SdpKind, SessionDescription};
use crate::signaling::IceCandidate;

pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: &[String]) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
        })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Box<dyn PeerTransport>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);

        // Trickle: every gathered candidate goes straight to the session loop.
        let sink = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.local_candidate(init.into()),
                    Err(e) => warn!(peer = %sink.peer_id(), error = %e, "unusable local candidate"),
                }
            })
        }));

        let sink = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                if let Some(track) = RemoteTrack::from_remote(track) {
                    sink.remote_track(track);
                }
                Box::pin(async {})
            },
        ));

        let sink = events;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                debug!(peer = %sink.peer_id(), state = %s, "Peer Connection State has changed");
                sink.state_changed(s.into());
                Box::pin(async {})
            },
        ));

        Ok(Box::new(WebRtcTransport {
            peer_connection,
            senders: Mutex::new(Senders::default()),
        }))
    }
}

/// Every offer carries one m-line per kind, so media added later on either side
/// has a transceiver to ride on.
const MEDIA_SECTIONS: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

#[derive(Default)]
struct Senders {
    /// Local track id to the transceiver sending it.
    attached: HashMap<String, Arc<RTCRtpTransceiver>>,
    /// Senders whose RTCP is already being read.
    drained: Vec<Arc<RTCRtpSender>>,
}

pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<Senders>,
}

impl WebRtcTransport {
    /// Adds a receive-only transceiver for every kind that has none yet.
    async fn ensure_media_sections(&self) -> Result<()> {
        let transceivers = self.peer_connection.get_transceivers().await;
        for kind in MEDIA_SECTIONS {
            if transceivers.iter().any(|t| t.kind() == kind.codec_type()) {
                continue;
            }
            self.peer_connection
                .add_transceiver_from_kind(
                    kind.codec_type(),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
            debug!(%kind, "receive-only transceiver added");
        }
        Ok(())
    }

    /// A transceiver of `kind` with no track to send and not claimed by a local track.
    async fn idle_transceiver(
        &self,
        kind: RTPCodecType,
        senders: &Senders,
    ) -> Option<Arc<RTCRtpTransceiver>> {
        for transceiver in self.peer_connection.get_transceivers().await {
            if transceiver.kind() != kind
                || senders
                    .attached
                    .values()
                    .any(|claimed| Arc::ptr_eq(claimed, &transceiver))
            {
                continue;
            }
            if transceiver.sender().await.track().await.is_none() {
                return Some(transceiver);
            }
        }
        None
    }

    async fn attach(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
        senders: &Senders,
    ) -> Result<Arc<RTCRtpTransceiver>> {
        if let Some(transceiver) = self.idle_transceiver(track.kind(), senders).await {
            transceiver.sender().await.replace_track(Some(track)).await?;
            let direction = transceiver.direction();
            transceiver
                .set_direction(RTCRtpTransceiverDirection::from_send_recv(
                    true,
                    direction.has_recv(),
                ))
                .await;
            return Ok(transceiver);
        }

        let sender = self.peer_connection.add_track(track).await?;
        for transceiver in self.peer_connection.get_transceivers().await {
            if Arc::ptr_eq(&transceiver.sender().await, &sender) {
                return Ok(transceiver);
            }
        }
        Err(webrtc::Error::ErrSenderNotCreatedByConnection.into())
    }

    async fn detach(&self, transceiver: &RTCRtpTransceiver) -> Result<()> {
        transceiver.sender().await.replace_track(None).await?;
        let direction = transceiver.direction();
        transceiver
            .set_direction(RTCRtpTransceiverDirection::from_send_recv(
                false,
                direction.has_recv(),
            ))
            .await;
        Ok(())
    }

    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
        let parsed = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        Ok(parsed)
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_media_sections().await?;
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = Self::to_rtc(description)?;
        self.peer_connection.set_local_description(description).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = Self::to_rtc(description)?;
        self.peer_connection.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn sync_tracks(&self, stream: Option<&LocalStream>) -> Result<bool> {
        let wanted: HashMap<String, _> = stream
            .map(|stream| {
                stream
                    .tracks()
                    .iter()
                    .map(|track| (track.id().to_owned(), track.track()))
                    .collect()
            })
            .unwrap_or_default();

        let mut senders = self.senders.lock().await;
        let mut changed = false;

        let stale: Vec<String> = senders
            .attached
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(transceiver) = senders.attached.remove(&id) {
                self.detach(&transceiver).await?;
                debug!(track = %id, "local track detached");
                changed = true;
            }
        }

        for (id, track) in wanted {
            if senders.attached.contains_key(&id) {
                continue;
            }
            let transceiver = self.attach(track, &senders).await?;

            // Drain RTCP so interceptors keep running.
            let sender = transceiver.sender().await;
            if !senders.drained.iter().any(|s| Arc::ptr_eq(s, &sender)) {
                let rtcp_sender = Arc::clone(&sender);
                tokio::spawn(async move {
                    let mut rtcp_buf = vec![0u8; 1500];
                    while rtcp_sender.read(&mut rtcp_buf).await.is_ok() {}
                });
                senders.drained.push(sender);
            }

            debug!(track = %id, "local track attached");
            senders.attached.insert(id, transceiver);
            changed = true;
        }

        Ok(changed)
    }

    async fn close(&self) -> Result<()> {
        let mut senders = self.senders.lock().await;
        senders.attached.clear();
        senders.drained.clear();
        drop(senders);
        self.peer_connection.close().await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.peer_connection.connection_state() == RTCPeerConnectionState::Closed
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}
