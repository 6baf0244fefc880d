//! Mesh room calls over WebRTC.
//!
//! Every participant of a room holds one direct peer connection to every other
//! participant. [`room::RoomSession`] reacts to membership changes and drives the
//! [`peer::PeerConnectionManager`], which owns the connection registry and runs the
//! offer/answer/ICE handshake for each pair through a [`negotiation::Negotiation`].

pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod presence;
pub mod rtc;
pub mod room;
pub mod signaling;

pub use config::{ClientConfig, OfferPolicy};
pub use error::{Error, Result};
pub use negotiation::{NegotiationState, Role};
pub use peer::PeerConnectionManager;
pub use room::{RoomSession, SessionCommand, SessionEvent, SessionHandle};

/// Opaque participant identifier, stable for a session.
pub type PeerId = String;

pub type RoomId = String;
