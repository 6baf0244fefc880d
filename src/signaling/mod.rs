//! Signaling: wire messages, the channel seam and the outbound queue.

mod message;
mod outbox;
pub mod websocket;

use async_trait::async_trait;

use crate::error::Result;

pub use message::{IceCandidate, SignalMessage};
pub use outbox::Outbox;
pub use websocket::WebSocketChannel;

/// Room-scoped, peer-addressed message bus.
///
/// Messages for one pair of peers must be delivered in the order they were sent.
/// Implementations report an unreachable relay as
/// [`Error::SignalDeliveryUnavailable`](crate::Error::SignalDeliveryUnavailable).
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: SignalMessage) -> Result<()>;
}

/// What a channel delivers to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(SignalMessage),
    /// The relay went away; outbound messages are held until it comes back.
    Disconnected,
    Reconnected,
}
