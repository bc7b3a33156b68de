//! Room membership scoped to one connection.
//!
//! Memberships are an additive set owned by the connection; this facade
//! mutates the desired set and queues the matching control message. Joins
//! and leaves are idempotent and safe before the transport is up: the
//! desired set is replayed by the driver on every (re)connect, before any
//! health event is published, and the driver de-duplicates so the server is
//! told about each distinct room at most once per live session.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::transport::Command;

/// Cloneable join/leave handle bound to one connection.
#[derive(Clone)]
pub struct RoomMembership {
    rooms: Arc<RwLock<HashSet<String>>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for RoomMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.rooms.read().map(|r| r.len()).unwrap_or(0);
        f.debug_struct("RoomMembership").field("rooms", &count).finish()
    }
}

impl RoomMembership {
    pub(crate) fn new(
        rooms: Arc<RwLock<HashSet<String>>>,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self { rooms, cmd_tx }
    }

    /// Join a room. Idempotent: re-joining a room this connection already
    /// belongs to emits nothing.
    pub fn join(&self, room: impl Into<String>) {
        let room = room.into();
        let newly_added = {
            let mut rooms = self.rooms.write().expect("rooms lock poisoned");
            rooms.insert(room.clone())
        };
        if newly_added {
            // Queued if the transport is down; the driver replays the
            // desired set on connect.
            let _ = self.cmd_tx.send(Command::Subscribe(room));
        }
    }

    /// Leave a room. Leaving a room never joined is a no-op.
    pub fn leave(&self, room: &str) {
        let was_member = {
            let mut rooms = self.rooms.write().expect("rooms lock poisoned");
            rooms.remove(room)
        };
        if was_member {
            let _ = self.cmd_tx.send(Command::Unsubscribe(room.to_string()));
        }
    }

    /// Whether `room` is in the desired membership set.
    #[must_use]
    pub fn is_member(&self, room: &str) -> bool {
        self.rooms.read().expect("rooms lock poisoned").contains(room)
    }

    /// Snapshot of current desired memberships.
    #[must_use]
    pub fn memberships(&self) -> Vec<String> {
        let rooms = self.rooms.read().expect("rooms lock poisoned");
        rooms.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership() -> (RoomMembership, mpsc::UnboundedReceiver<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            RoomMembership::new(Arc::new(RwLock::new(HashSet::new())), cmd_tx),
            cmd_rx,
        )
    }

    #[test]
    fn test_double_join_emits_one_subscribe() {
        let (rooms, mut cmd_rx) = membership();
        rooms.join("podcast-7");
        rooms.join("podcast-7");

        assert!(matches!(cmd_rx.try_recv(), Ok(Command::Subscribe(r)) if r == "podcast-7"));
        assert!(cmd_rx.try_recv().is_err());
    }

    #[test]
    fn test_leave_unknown_room_is_noop() {
        let (rooms, mut cmd_rx) = membership();
        rooms.leave("never-joined");
        assert!(cmd_rx.try_recv().is_err());
    }

    #[test]
    fn test_join_then_leave_round_trip() {
        let (rooms, mut cmd_rx) = membership();
        rooms.join("admin");
        rooms.leave("admin");

        assert!(matches!(cmd_rx.try_recv(), Ok(Command::Subscribe(_))));
        assert!(matches!(cmd_rx.try_recv(), Ok(Command::Unsubscribe(r)) if r == "admin"));
        assert!(!rooms.is_member("admin"));
    }

    #[test]
    fn test_join_is_queued_while_disconnected() {
        // RoomMembership never checks connection state: commands queue on the
        // channel and the desired set is replayed by the driver on connect.
        let (rooms, mut cmd_rx) = membership();
        rooms.join("podcast-3");
        assert!(rooms.is_member("podcast-3"));
        assert!(matches!(cmd_rx.try_recv(), Ok(Command::Subscribe(_))));
    }
}
