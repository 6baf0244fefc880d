use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{SignalMessage, SignalingChannel};
use crate::error::{Error, Result};

/// Ordered outbound queue in front of a [`SignalingChannel`].
///
/// While the channel is unavailable messages are held in send order instead of
/// being dropped, so negotiations in flight are suspended rather than aborted.
pub struct Outbox {
    channel: Arc<dyn SignalingChannel>,
    suspended: bool,
    queue: VecDeque<SignalMessage>,
}

impl Outbox {
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            channel,
            suspended: false,
            queue: VecDeque::new(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Delivers `message`, or queues it if the channel is down.
    ///
    /// Only errors other than [`Error::SignalDeliveryUnavailable`] are returned.
    pub async fn send(&mut self, message: SignalMessage) -> Result<()> {
        if self.suspended {
            debug!(kind = message.kind(), "signaling suspended, queueing message");
            self.queue.push_back(message);
            return Ok(());
        }

        match self.channel.send(message.clone()).await {
            Ok(()) => Ok(()),
            Err(Error::SignalDeliveryUnavailable(reason)) => {
                warn!(%reason, "signaling channel unavailable, suspending outbound messages");
                self.suspended = true;
                self.queue.push_back(message);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Flushes held messages in order. Stops and stays suspended if the channel
    /// drops again part-way through.
    pub async fn resume(&mut self) -> Result<()> {
        self.suspended = false;
        let held = self.queue.len();
        while let Some(message) = self.queue.pop_front() {
            match self.channel.send(message.clone()).await {
                Ok(()) => {}
                Err(Error::SignalDeliveryUnavailable(reason)) => {
                    warn!(%reason, "signaling channel dropped again while flushing");
                    self.queue.push_front(message);
                    self.suspended = true;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        if held > 0 {
            info!(held, "flushed held signaling messages");
        }
        Ok(())
    }

    /// Drops held negotiation messages for a peer whose connection is gone.
    pub fn discard_addressed_to(&mut self, peer_id: &str) {
        self.queue.retain(|message| message.target() != Some(peer_id));
    }

    /// Drops every held negotiation message, keeping membership messages.
    pub fn discard_peer_messages(&mut self) {
        self.queue.retain(|message| message.target().is_none());
    }
}
