use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{ChannelEvent, SignalMessage, SignalingChannel};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::{PeerId, RoomId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// JSON-over-WebSocket signaling client.
///
/// A background task owns the socket. When the server drops the connection it
/// reconnects with a fixed delay, re-sends `join` for the current room and reports
/// [`ChannelEvent::Reconnected`].
pub struct WebSocketChannel {
    tx: mpsc::Sender<SignalMessage>,
    connected: Arc<AtomicBool>,
    membership: Arc<Mutex<Option<(RoomId, PeerId)>>>,
}

impl WebSocketChannel {
    pub async fn connect(config: &ClientConfig) -> Result<(Arc<Self>, mpsc::Receiver<ChannelEvent>)> {
        let (ws_stream, _) = connect_async(config.signaling_url.as_str()).await?;
        info!(url = %config.signaling_url, "connected to signaling server");

        let (tx, outgoing) = mpsc::channel(100);
        let (inbound, rx) = mpsc::channel(100);
        let connected = Arc::new(AtomicBool::new(true));
        let membership = Arc::new(Mutex::new(None));

        let supervisor = Supervisor {
            url: config.signaling_url.clone(),
            max_attempts: config.max_reconnect_attempts,
            delay: config.reconnect_delay(),
            outgoing,
            inbound,
            connected: connected.clone(),
            membership: membership.clone(),
            unsent: None,
        };
        tokio::spawn(supervisor.run(ws_stream));

        Ok((
            Arc::new(Self {
                tx,
                connected,
                membership,
            }),
            rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for WebSocketChannel {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::SignalDeliveryUnavailable(
                "websocket disconnected".to_string(),
            ));
        }

        match &message {
            SignalMessage::Join { room_id, user_id } => {
                *self.membership.lock().await = Some((room_id.clone(), user_id.clone()));
            }
            SignalMessage::Leave { room_id, .. } => {
                let mut membership = self.membership.lock().await;
                if membership.as_ref().is_some_and(|(current, _)| current == room_id) {
                    *membership = None;
                }
            }
            _ => {}
        }

        self.tx
            .send(message)
            .await
            .map_err(|e| Error::SignalDeliveryUnavailable(format!("Failed to send message: {}", e)))
    }
}

enum Closed {
    /// The client side was dropped; stop for good.
    Local,
    Remote,
}

struct Supervisor {
    url: String,
    max_attempts: u32,
    delay: Duration,
    outgoing: mpsc::Receiver<SignalMessage>,
    inbound: mpsc::Sender<ChannelEvent>,
    connected: Arc<AtomicBool>,
    membership: Arc<Mutex<Option<(RoomId, PeerId)>>>,
    /// Message taken off the queue whose write failed.
    unsent: Option<SignalMessage>,
}

impl Supervisor {
    async fn run(mut self, mut stream: WsStream) {
        loop {
            match self.pump(stream).await {
                Ok(Closed::Local) => {
                    debug!("signaling client dropped, closing socket");
                    return;
                }
                Ok(Closed::Remote) => warn!("signaling server closed the connection"),
                Err(e) => warn!(error = %e, "signaling connection lost"),
            }

            self.connected.store(false, Ordering::SeqCst);
            if self.inbound.send(ChannelEvent::Disconnected).await.is_err() {
                return;
            }

            stream = match self.reconnect().await {
                Some(stream) => stream,
                None => {
                    error!(
                        attempts = self.max_attempts,
                        "Max reconnection attempts reached, giving up"
                    );
                    return;
                }
            };

            self.connected.store(true, Ordering::SeqCst);
            if self.inbound.send(ChannelEvent::Reconnected).await.is_err() {
                return;
            }
        }
    }

    async fn pump(&mut self, stream: WsStream) -> Result<Closed> {
        let (mut write, mut read) = stream.split();

        if let Some(message) = self.unsent.take() {
            let text = serde_json::to_string(&message)?;
            if let Err(e) = write.send(Message::Text(text)).await {
                self.unsent = Some(message);
                return Err(e.into());
            }
        }

        loop {
            tokio::select! {
                outgoing = self.outgoing.recv() => {
                    let Some(message) = outgoing else {
                        let _ = write.close().await;
                        return Ok(Closed::Local);
                    };
                    let text = serde_json::to_string(&message)?;
                    if let Err(e) = write.send(Message::Text(text)).await {
                        self.unsent = Some(message);
                        return Err(e.into());
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(message) => {
                            if self.inbound.send(ChannelEvent::Message(message)).await.is_err() {
                                return Ok(Closed::Local);
                            }
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed signaling message"),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(Closed::Remote),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    async fn reconnect(&mut self) -> Option<WsStream> {
        for attempt in 1..=self.max_attempts {
            sleep(self.delay).await;

            let mut stream = match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnection failed");
                    continue;
                }
            };

            let rejoin = self.membership.lock().await.clone();
            if let Some((room_id, user_id)) = rejoin {
                let join = SignalMessage::Join { room_id, user_id };
                let sent = match serde_json::to_string(&join) {
                    Ok(text) => stream.send(Message::Text(text)).await.map_err(Error::from),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    warn!(attempt, error = %e, "re-joining room after reconnect failed");
                    continue;
                }
            }

            info!(attempt, "reconnected to signaling server");
            return Some(stream);
        }
        None
    }
}
