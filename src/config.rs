use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY_MS: u64 = 1000;

/// Who starts the handshake for a pair of participants.
///
/// Every client of a room must run the same policy; either one yields exactly one
/// offerer per pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OfferPolicy {
    /// Members already in the room offer to a newcomer when they see it join.
    #[default]
    ExistingMembersOffer,
    /// The newcomer offers to every member present when it joins.
    NewcomerOffers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub signaling_url: String,
    /// STUN servers used for candidate discovery. No relay servers.
    pub ice_servers: Vec<String>,
    pub offer_policy: OfferPolicy,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// Media requested from the local source on join.
    pub audio: bool,
    pub video: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_owned(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_owned(),
                "stun:stun1.l.google.com:19302".to_owned(),
            ],
            offer_policy: OfferPolicy::default(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
            audio: true,
            video: false,
        }
    }
}

impl ClientConfig {
    /// Reads a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: ClientConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.signaling_url.starts_with("ws://") || self.signaling_url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "signaling url must be ws:// or wss://, got {}",
                self.signaling_url
            )));
        }
        if self.ice_servers.is_empty() {
            return Err(Error::Config("at least one STUN server is required".into()));
        }
        if let Some(url) = self
            .ice_servers
            .iter()
            .find(|url| !(url.starts_with("stun:") || url.starts_with("stuns:")))
        {
            return Err(Error::Config(format!("only STUN servers are supported, got {}", url)));
        }
        if !self.audio && !self.video {
            return Err(Error::Config("at least one of audio or video must be requested".into()));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
