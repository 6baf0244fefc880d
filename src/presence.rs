//! Who is in which room, as kept by the external presence store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Error, Result};
use crate::{PeerId, RoomId};

const CHANGE_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: PeerId,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

impl Participant {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            audio_enabled: true,
            video_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub participants: Vec<Participant>,
}

impl RoomSnapshot {
    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Joined { room_id: RoomId, user_id: PeerId },
    Left { room_id: RoomId, user_id: PeerId },
    MediaChanged { room_id: RoomId, participant: Participant },
}

/// Persisted room membership. Rooms themselves are created elsewhere.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn join_room(&self, room_id: &str, user_id: &str) -> Result<()>;

    async fn leave_room(&self, room_id: &str, user_id: &str) -> Result<()>;

    async fn rooms_with_users(&self) -> Result<Vec<RoomSnapshot>>;

    async fn set_media_state(&self, room_id: &str, user_id: &str, audio: bool, video: bool) -> Result<()>;

    /// Change notifications for one room.
    fn subscribe(&self, room_id: &str) -> broadcast::Receiver<PresenceChange>;
}

/// Process-local presence store.
#[derive(Default)]
pub struct InMemoryPresence {
    rooms: Mutex<BTreeMap<RoomId, BTreeMap<PeerId, Participant>>>,
    channels: Mutex<HashMap<RoomId, broadcast::Sender<PresenceChange>>>,
}

impl InMemoryPresence {
    pub fn with_rooms<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RoomId>,
    {
        let rooms = rooms
            .into_iter()
            .map(|id| (id.into(), BTreeMap::new()))
            .collect();
        Self {
            rooms: Mutex::new(rooms),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn rooms(&self) -> Result<MutexGuard<'_, BTreeMap<RoomId, BTreeMap<PeerId, Participant>>>> {
        self.rooms
            .lock()
            .map_err(|_| Error::Presence("room table poisoned".into()))
    }

    fn notify(&self, room_id: &str, change: PresenceChange) {
        let channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = channels.get(room_id) {
            // No subscribers is fine.
            let _ = tx.send(change);
        }
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresence {
    async fn join_room(&self, room_id: &str, user_id: &str) -> Result<()> {
        {
            let mut rooms = self.rooms()?;
            let room = rooms
                .get_mut(room_id)
                .ok_or_else(|| Error::Presence(format!("unknown room {}", room_id)))?;
            if room.contains_key(user_id) {
                return Ok(());
            }
            room.insert(user_id.to_owned(), Participant::new(user_id));
        }
        debug!(room = %room_id, user = %user_id, "presence: joined");
        self.notify(
            room_id,
            PresenceChange::Joined {
                room_id: room_id.to_owned(),
                user_id: user_id.to_owned(),
            },
        );
        Ok(())
    }

    async fn leave_room(&self, room_id: &str, user_id: &str) -> Result<()> {
        let removed = self
            .rooms()?
            .get_mut(room_id)
            .map(|room| room.remove(user_id).is_some())
            .unwrap_or(false);
        if removed {
            debug!(room = %room_id, user = %user_id, "presence: left");
            self.notify(
                room_id,
                PresenceChange::Left {
                    room_id: room_id.to_owned(),
                    user_id: user_id.to_owned(),
                },
            );
        }
        Ok(())
    }

    async fn rooms_with_users(&self) -> Result<Vec<RoomSnapshot>> {
        Ok(self
            .rooms()?
            .iter()
            .map(|(id, participants)| RoomSnapshot {
                id: id.clone(),
                participants: participants.values().cloned().collect(),
            })
            .collect())
    }

    async fn set_media_state(&self, room_id: &str, user_id: &str, audio: bool, video: bool) -> Result<()> {
        let participant = {
            let mut rooms = self.rooms()?;
            let Some(participant) = rooms.get_mut(room_id).and_then(|room| room.get_mut(user_id)) else {
                return Err(Error::Presence(format!("{} is not in room {}", user_id, room_id)));
            };
            participant.audio_enabled = audio;
            participant.video_enabled = video;
            participant.clone()
        };
        self.notify(
            room_id,
            PresenceChange::MediaChanged {
                room_id: room_id.to_owned(),
                participant,
            },
        );
        Ok(())
    }

    fn subscribe(&self, room_id: &str) -> broadcast::Receiver<PresenceChange> {
        let mut channels = self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(room_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANGE_BUFFER).0)
            .subscribe()
    }
}
