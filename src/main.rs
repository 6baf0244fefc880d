use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use webrtc_room_client::media::DeviceMediaSource;
use webrtc_room_client::presence::InMemoryPresence;
use webrtc_room_client::rtc::WebRtcConnector;
use webrtc_room_client::signaling::WebSocketChannel;
use webrtc_room_client::{ClientConfig, OfferPolicy, RoomSession, SessionEvent, SessionHandle};

/// Joins a mesh call room and stays in it until Ctrl-C.
#[derive(Debug, Parser)]
#[command(name = "webrtc-room-client", version)]
struct Args {
    /// JSON config file; flags override its values.
    #[arg(short, long, env = "ROOM_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "ROOM_CLIENT_SIGNALING_URL")]
    signaling_url: Option<String>,

    #[arg(short, long, default_value = "test-room")]
    room: String,

    /// Defaults to a random `user-<n>` id.
    #[arg(short, long)]
    user_id: Option<String>,

    /// Send video as well as audio.
    #[arg(long)]
    video: bool,

    #[arg(long, value_enum)]
    policy: Option<OfferPolicy>,
}

impl Args {
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => ClientConfig::default(),
        };
        if let Some(url) = &self.signaling_url {
            config.signaling_url = url.clone();
        }
        if self.video {
            config.video = true;
        }
        if let Some(policy) = self.policy {
            config.offer_policy = policy;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.client_config()?;
    let user_id = args
        .user_id
        .clone()
        .unwrap_or_else(|| format!("user-{}", rand::random::<u32>()));
    info!(user = %user_id, room = %args.room, url = %config.signaling_url, "starting");

    let (channel, inbound) = WebSocketChannel::connect(&config)
        .await
        .context("connecting to signaling server")?;
    let connector = Arc::new(WebRtcConnector::new(&config.ice_servers)?);
    let presence = Arc::new(InMemoryPresence::with_rooms([args.room.clone()]));
    let media = Box::new(DeviceMediaSource::new(user_id.clone()));

    let (session, events) = RoomSession::new(user_id, &config, connector, channel, media, presence);
    let (handle, commands) = SessionHandle::channel();
    let runner = tokio::spawn(session.run(commands, inbound));
    tokio::spawn(log_events(events));

    handle.join_call(args.room.clone()).await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "cannot listen for Ctrl-C");
            }
            info!("leaving call");
            // The loop may already be gone if signaling closed.
            let _ = handle.leave_call().await;
            let _ = handle.shutdown().await;
        }
        _ = handle.closed() => {}
    }

    match runner.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "session ended with an error");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("session task panicked: {}", e)),
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Joined { room_id } => info!(room = %room_id, "in call"),
            SessionEvent::Left { room_id } => info!(room = %room_id, "call ended"),
            SessionEvent::RemoteStreamUpdated { peer_id, stream } => {
                info!(peer = %peer_id, tracks = stream.tracks.len(), "remote media")
            }
            SessionEvent::PeerRemoved { peer_id } => info!(peer = %peer_id, "peer gone"),
            SessionEvent::PeerFailed { peer_id, reason } => {
                warn!(peer = %peer_id, %reason, "peer connection failed")
            }
            SessionEvent::MediaUnavailable { reason } => error!(%reason, "local media unavailable"),
            SessionEvent::MuteChanged { muted } => info!(muted, "microphone"),
            SessionEvent::VideoChanged { enabled } => info!(enabled, "camera"),
        }
    }
}
