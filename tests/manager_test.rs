use std::sync::Arc;

use tokio::sync::mpsc;

use webrtc_room_client::media::{DeviceMediaSource, MediaSource};
use webrtc_room_client::peer::{PeerConnectionManager, PeerEvent, PeerUpdate};
use webrtc_room_client::signaling::{IceCandidate, SignalMessage};
use webrtc_room_client::{Error, NegotiationState, Role};

use common::{is_offer, offer_sdp, Hub, MockConnector};

// importing common module.
mod common;

struct Fixture {
    hub: Arc<Hub>,
    connector: Arc<MockConnector>,
    manager: PeerConnectionManager,
    events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Fixture {
    fn new(local_id: &str) -> Self {
        common::setup();
        let hub = Arc::new(Hub::default());
        let (channel, _) = hub.register(local_id);
        let connector = Arc::new(MockConnector::default());
        let (manager, events) = PeerConnectionManager::new(local_id, connector.clone(), channel);
        Self {
            hub,
            connector,
            manager,
            events,
        }
    }

    async fn drain_events(&mut self) -> Vec<PeerUpdate> {
        let mut updates = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let Some(update) = self.manager.handle_peer_event(event).await {
                updates.push(update);
            }
        }
        updates
    }
}

fn answer_sdp(track: &str) -> String {
    format!("v=0\r\no=remote 1 1 IN IP4 127.0.0.1\r\nm=audio {} remote\r\n", track)
}

#[tokio::test]
async fn one_entry_per_peer() -> anyhow::Result<()> {
    let mut fx = Fixture::new("alice");
    fx.manager.create_connection("bob", Role::Offerer).await?;

    let again = fx.manager.create_connection("bob", Role::Answerer).await;
    assert!(matches!(again, Err(Error::AlreadyConnected(peer)) if peer == "bob"));
    assert_eq!(fx.manager.entry("bob").map(|e| e.role()), Some(Role::Offerer));

    let to_self = fx.manager.create_connection("alice", Role::Offerer).await;
    assert!(matches!(to_self, Err(Error::NegotiationFailed { .. })));
    assert_eq!(fx.manager.len(), 1);
    assert_eq!(fx.connector.opened(), 1);
    Ok(())
}

#[tokio::test]
async fn removal_is_idempotent() -> anyhow::Result<()> {
    let mut fx = Fixture::new("alice");
    fx.manager.create_connection("bob", Role::Offerer).await?;

    assert!(fx.manager.remove_connection("bob").await);
    assert!(!fx.manager.remove_connection("bob").await);
    assert!(!fx.manager.remove_connection("nobody").await);
    assert!(fx.connector.transport_to("bob").is_closed());
    assert!(fx.manager.is_empty());
    assert!(fx.manager.monitor().snapshot().is_empty());
    Ok(())
}

#[tokio::test]
async fn overlapping_requests_collapse_into_one_follow_up() -> anyhow::Result<()> {
    let mut fx = Fixture::new("alice");
    fx.manager.create_connection("bob", Role::Offerer).await?;

    fx.manager.negotiate("bob").await?;
    for _ in 0..3 {
        assert!(matches!(
            fx.manager.negotiate("bob").await,
            Err(Error::NegotiationBusy(_))
        ));
    }
    let entry = fx.manager.entry("bob").expect("entry");
    assert!(entry.negotiation().follow_up_queued());
    assert_eq!(fx.hub.offers("alice", "bob"), 1);

    fx.manager.handle_answer("bob", answer_sdp("bob-audio")).await?;

    // The queued request runs once the first cycle is done.
    assert_eq!(fx.hub.offers("alice", "bob"), 2);
    let entry = fx.manager.entry("bob").expect("entry");
    assert_eq!(entry.negotiation_state(), NegotiationState::LocalOfferSet);
    assert!(!entry.negotiation().follow_up_queued());

    fx.manager.handle_answer("bob", answer_sdp("bob-audio")).await?;
    assert_eq!(fx.hub.offers("alice", "bob"), 2);
    assert_eq!(
        fx.manager.entry("bob").map(|e| e.negotiation().completed_cycles()),
        Some(2)
    );
    Ok(())
}

#[tokio::test]
async fn answering_side_requests_renegotiation() -> anyhow::Result<()> {
    let mut fx = Fixture::new("bob");
    fx.manager.handle_offer("alice", offer_sdp("alice")).await?;
    assert_eq!(fx.manager.entry("alice").map(|e| e.role()), Some(Role::Answerer));
    assert_eq!(
        fx.hub.count(|m| matches!(m, SignalMessage::Answer { to, .. } if to == "alice")),
        1
    );

    fx.manager.negotiate("alice").await?;
    assert_eq!(
        fx.hub.count(|m| matches!(m, SignalMessage::Renegotiate { to, .. } if to == "alice")),
        1
    );
    assert_eq!(fx.hub.offers("bob", "alice"), 0);
    Ok(())
}

#[tokio::test]
async fn changed_media_renegotiates_each_peer_once() -> anyhow::Result<()> {
    let mut fx = Fixture::new("alice");
    let mut source = DeviceMediaSource::new("alice");
    let audio = source.acquire(false, true).await?;
    assert!(fx.manager.set_local_media(Some(audio.clone())).await.is_empty());

    for peer in ["bob", "carol"] {
        fx.manager.create_connection(peer, Role::Offerer).await?;
        fx.manager.negotiate(peer).await?;
        fx.manager.handle_answer(peer, answer_sdp(&format!("{}-audio", peer))).await?;
    }

    // Same tracks again: nothing to negotiate.
    assert!(fx.manager.set_local_media(Some(audio.clone())).await.is_empty());
    assert_eq!(fx.hub.offers("alice", "bob"), 1);

    let mut with_video = audio;
    with_video.merge(source.acquire(true, false).await?);
    assert!(fx.manager.set_local_media(Some(with_video)).await.is_empty());
    assert_eq!(fx.hub.offers("alice", "bob"), 2);
    assert_eq!(fx.hub.offers("alice", "carol"), 2);
    assert_eq!(
        fx.connector.transport_to("bob").sent_tracks(),
        ["alice-audio", "alice-video"]
    );
    Ok(())
}

#[tokio::test]
async fn early_candidates_are_capped() -> anyhow::Result<()> {
    let mut fx = Fixture::new("bob");
    for n in 0..70 {
        fx.manager
            .handle_remote_candidate("alice", IceCandidate::new(format!("c{}", n)))
            .await;
    }
    fx.manager.handle_offer("alice", offer_sdp("alice")).await?;

    let applied = fx.connector.transport_to("alice").candidates();
    assert_eq!(applied.len(), 64);
    assert_eq!(applied.first().map(String::as_str), Some("c0"));
    assert_eq!(applied.last().map(String::as_str), Some("c63"));
    Ok(())
}

#[tokio::test]
async fn parked_candidates_are_kept_for_a_bounded_set_of_senders() -> anyhow::Result<()> {
    let mut fx = Fixture::new("bob");
    for n in 0..40 {
        fx.manager
            .handle_remote_candidate(&format!("ghost-{:02}", n), IceCandidate::new(format!("g{}", n)))
            .await;
    }
    // A sender already holding a slot can still add to it.
    fx.manager
        .handle_remote_candidate("ghost-00", IceCandidate::new("g0-again"))
        .await;

    fx.manager.handle_offer("ghost-00", offer_sdp("ghost-00")).await?;
    assert_eq!(fx.connector.transport_to("ghost-00").candidates(), ["g0", "g0-again"]);

    fx.manager.handle_offer("ghost-31", offer_sdp("ghost-31")).await?;
    assert_eq!(fx.connector.transport_to("ghost-31").candidates(), ["g31"]);

    // Past the limit nothing was parked.
    fx.manager.handle_offer("ghost-35", offer_sdp("ghost-35")).await?;
    assert!(fx.connector.transport_to("ghost-35").candidates().is_empty());
    Ok(())
}

#[tokio::test]
async fn remote_stream_appears_with_the_first_track() -> anyhow::Result<()> {
    let mut fx = Fixture::new("alice");
    fx.manager.create_connection("bob", Role::Offerer).await?;
    assert!(fx.manager.get_remote_streams()["bob"].is_none());

    fx.manager.negotiate("bob").await?;
    fx.manager.handle_answer("bob", answer_sdp("bob-audio")).await?;
    let updates = fx.drain_events().await;

    assert!(updates
        .iter()
        .any(|u| matches!(u, PeerUpdate::RemoteStream { peer_id, .. } if peer_id == "bob")));
    let streams = fx.manager.get_remote_streams();
    let stream = streams["bob"].as_ref().expect("stream");
    assert_eq!(stream.tracks.len(), 1);
    assert_eq!(stream.tracks[0].id, "bob-audio");

    // The offer went out before the first local candidate.
    let local = fx.connector.transport_to("bob").local_descriptions();
    assert!(is_offer(&local[0]));
    let sent = fx.hub.sent();
    let offer_at = sent.iter().position(|m| matches!(m, SignalMessage::Offer { .. }));
    let candidate_at = sent
        .iter()
        .position(|m| matches!(m, SignalMessage::IceCandidate { .. }));
    assert!(offer_at < candidate_at);
    Ok(())
}

#[tokio::test]
async fn teardown_closes_everything() -> anyhow::Result<()> {
    let mut fx = Fixture::new("alice");
    fx.manager.create_connection("bob", Role::Offerer).await?;
    fx.manager.create_connection("carol", Role::Answerer).await?;
    fx.manager
        .handle_remote_candidate("dave", IceCandidate::new("parked"))
        .await;

    fx.manager.teardown_all().await;
    fx.manager.teardown_all().await;

    assert!(fx.manager.is_empty());
    assert!(fx.connector.transport_to("bob").is_closed());
    assert!(fx.connector.transport_to("carol").is_closed());

    // Nothing parked survives a teardown.
    fx.manager.handle_offer("dave", offer_sdp("dave")).await?;
    assert!(fx.connector.transport_to("dave").candidates().is_empty());
    Ok(())
}

#[tokio::test]
async fn answer_without_offer_is_ignored() -> anyhow::Result<()> {
    let mut fx = Fixture::new("alice");
    fx.manager.handle_answer("bob", answer_sdp("bob-audio")).await?;
    assert!(fx.manager.is_empty());

    fx.manager.create_connection("bob", Role::Offerer).await?;
    fx.manager.handle_answer("bob", answer_sdp("bob-audio")).await?;
    assert_eq!(fx.manager.entry("bob").map(|e| e.negotiation_state()), Some(NegotiationState::Idle));
    Ok(())
}
