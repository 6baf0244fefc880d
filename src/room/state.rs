use std::collections::BTreeSet;

use crate::{PeerId, RoomId};

/// The locally joined room as the session sees it: who else is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    id: RoomId,
    participants: BTreeSet<PeerId>,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            participants: BTreeSet::new(),
        }
    }

    pub fn with_participants(id: RoomId, participants: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            id,
            participants: participants.into_iter().collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns false if the participant was already present.
    pub fn add_peer(&mut self, peer_id: &str) -> bool {
        self.participants.insert(peer_id.to_owned())
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        self.participants.remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.participants.contains(peer_id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &str> {
        self.participants.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_diffs() {
        let mut room = Room::with_participants("lobby".into(), ["bob".to_owned()]);
        assert!(room.add_peer("carol"));
        assert!(!room.add_peer("bob"));
        assert_eq!(room.participants().collect::<Vec<_>>(), vec!["bob", "carol"]);

        assert!(room.remove_peer("bob"));
        assert!(!room.remove_peer("bob"));
        assert!(!room.contains("bob"));
        assert_eq!(room.len(), 1);
        assert_eq!(room.id(), "lobby");
    }
}
