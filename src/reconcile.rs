//! Optimistic update reconciliation.
//!
//! A locally-issued mutation (posting a comment) shows up in the visible
//! list immediately, tagged unconfirmed. The same logical item then arrives
//! again, possibly twice: once as the server's confirmation of our request
//! and once as the room broadcast echoed to every member including us. The
//! [`Reconciler`] collapses all copies into exactly one visible entry.
//!
//! Correlation is by `serverId` only. A broadcast arriving before our own
//! confirmation carries a `serverId` the local entry does not have yet, so
//! it is inserted as a distinct item; the later confirmation supplies the
//! correlation and the duplicate is collapsed then.

use std::sync::{Arc, Mutex as StdMutex};

use uuid::Uuid;

use crate::bus::{EventBus, Subscription};
use crate::error::LiveError;
use crate::transport::{CommentPayload, LiveEvent};

/// What `apply_broadcast` did with the incoming entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// A visible entry with this `serverId` already exists; echo suppressed.
    Suppressed,
    /// No match; inserted as a new item.
    Inserted,
}

/// One visible list entry.
#[derive(Debug, Clone)]
pub struct Entry<T> {
    /// Client-generated identity, stable across reconciliation.
    pub local_id: Uuid,
    /// Server identity once known.
    pub server_id: Option<String>,
    /// True once the server has confirmed this entry.
    pub confirmed: bool,
    pub value: T,
}

impl<T> Entry<T> {
    fn optimistic(value: T) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            server_id: None,
            confirmed: false,
            value,
        }
    }
}

/// Visible list of live items with optimistic insert and merge.
///
/// Append-ordered; reconciliation keeps an entry's position, it only
/// replaces the value and removes duplicates.
#[derive(Debug, Default)]
pub struct Reconciler<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Reconciler<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert `value` as an unconfirmed entry, visible immediately.
    ///
    /// The returned id addresses the entry for [`confirm`](Self::confirm)
    /// and [`roll_back`](Self::roll_back).
    pub fn submit_local(&mut self, value: T) -> Uuid {
        let entry = Entry::optimistic(value);
        let local_id = entry.local_id;
        self.entries.push(entry);
        local_id
    }

    /// Replace the unconfirmed entry `local_id` with the authoritative
    /// server copy, keeping its position in the list.
    ///
    /// Any other entry already carrying the same `server_id` (a broadcast
    /// echo that arrived first) is removed so exactly one copy remains.
    ///
    /// A confirmation with no matching local entry is a conflict: it is
    /// reported and the server copy is inserted so the item is never lost.
    pub fn confirm(
        &mut self,
        local_id: Uuid,
        server_id: impl Into<String>,
        value: T,
    ) -> Result<(), LiveError> {
        let server_id = server_id.into();
        let Some(index) = self.entries.iter().position(|e| e.local_id == local_id) else {
            let conflict = LiveError::ReconciliationConflict {
                server_id: server_id.clone(),
            };
            log::warn!("{conflict}; keeping server copy");
            // Insert unless the broadcast echo already made it visible.
            self.apply_broadcast(server_id, value);
            return Err(conflict);
        };

        let entry = &mut self.entries[index];
        entry.server_id = Some(server_id.clone());
        entry.confirmed = true;
        entry.value = value;

        // Collapse a broadcast echo that beat the confirmation here.
        self.entries
            .retain(|e| e.local_id == local_id || e.server_id.as_deref() != Some(&server_id));
        Ok(())
    }

    /// Merge a peer broadcast (or our own echo) into the list.
    pub fn apply_broadcast(&mut self, server_id: impl Into<String>, value: T) -> BroadcastOutcome {
        let server_id = server_id.into();
        if self
            .entries
            .iter()
            .any(|e| e.server_id.as_deref() == Some(&server_id))
        {
            return BroadcastOutcome::Suppressed;
        }
        self.entries.push(Entry {
            local_id: Uuid::new_v4(),
            server_id: Some(server_id),
            confirmed: true,
            value,
        });
        BroadcastOutcome::Inserted
    }

    /// Replace the value of the entry carrying `server_id`, if present.
    pub fn apply_update(&mut self, server_id: &str, value: T) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.server_id.as_deref() == Some(server_id))
        {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    /// Remove the entry carrying `server_id`, if present.
    pub fn apply_delete(&mut self, server_id: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.server_id.as_deref() != Some(server_id));
        self.entries.len() != before
    }

    /// Remove a still-unconfirmed entry after a failed submission.
    ///
    /// Confirmed entries are left alone; a no-op returns `false`.
    pub fn roll_back(&mut self, local_id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| e.local_id != local_id || e.confirmed);
        self.entries.len() != before
    }

    /// Visible entries in display order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry<T>> {
        self.entries.iter()
    }

    /// Visible values in display order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A comment list kept live by bus events.
///
/// Subscribes to the comment events and feeds them into a shared
/// [`Reconciler`]; dropping the feed disposes the subscriptions.
pub struct CommentFeed {
    reconciler: Arc<StdMutex<Reconciler<CommentPayload>>>,
    subscriptions: Vec<Subscription>,
}

impl std::fmt::Debug for CommentFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommentFeed")
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl CommentFeed {
    /// Attach a new feed to `bus`.
    #[must_use]
    pub fn attach(bus: &EventBus) -> Self {
        let reconciler = Arc::new(StdMutex::new(Reconciler::new()));

        let created = {
            let reconciler = Arc::clone(&reconciler);
            bus.on("comment-created", move |event| {
                if let LiveEvent::CommentCreated(comment) = event {
                    reconciler
                        .lock()
                        .expect("reconciler lock poisoned")
                        .apply_broadcast(comment.id.clone(), comment.clone());
                }
                Ok(())
            })
        };
        let updated = {
            let reconciler = Arc::clone(&reconciler);
            bus.on("comment-updated", move |event| {
                if let LiveEvent::CommentUpdated(comment) = event {
                    reconciler
                        .lock()
                        .expect("reconciler lock poisoned")
                        .apply_update(&comment.id, comment.clone());
                }
                Ok(())
            })
        };
        let deleted = {
            let reconciler = Arc::clone(&reconciler);
            bus.on("comment-deleted", move |event| {
                if let LiveEvent::CommentDeleted { id } = event {
                    reconciler
                        .lock()
                        .expect("reconciler lock poisoned")
                        .apply_delete(id);
                }
                Ok(())
            })
        };

        Self {
            reconciler,
            subscriptions: vec![created, updated, deleted],
        }
    }

    /// Show a comment immediately while the create request is in flight.
    pub fn submit_local(&self, comment: CommentPayload) -> Uuid {
        self.reconciler
            .lock()
            .expect("reconciler lock poisoned")
            .submit_local(comment)
    }

    /// Apply the server's create confirmation.
    pub fn confirm(&self, local_id: Uuid, comment: CommentPayload) -> Result<(), LiveError> {
        let server_id = comment.id.clone();
        self.reconciler
            .lock()
            .expect("reconciler lock poisoned")
            .confirm(local_id, server_id, comment)
    }

    /// Drop the optimistic entry after a failed create.
    pub fn roll_back(&self, local_id: Uuid) -> bool {
        self.reconciler
            .lock()
            .expect("reconciler lock poisoned")
            .roll_back(local_id)
    }

    /// Snapshot of the visible comments in display order.
    #[must_use]
    pub fn comments(&self) -> Vec<CommentPayload> {
        self.reconciler
            .lock()
            .expect("reconciler lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl Drop for CommentFeed {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: &str, body: &str) -> CommentPayload {
        CommentPayload {
            id: id.to_string(),
            body: body.to_string(),
            author: "sam".to_string(),
            created_at: None,
        }
    }

    #[test]
    fn test_submit_then_confirm_yields_one_entry() {
        let mut list = Reconciler::new();
        let local = list.submit_local(comment("", "hi"));
        assert_eq!(list.len(), 1);
        assert!(!list.entries().next().map(|e| e.confirmed).unwrap_or(true));

        list.confirm(local, "s1", comment("s1", "hi"))
            .expect("confirm");
        assert_eq!(list.len(), 1);
        let entry = list.entries().next().expect("entry");
        assert!(entry.confirmed);
        assert_eq!(entry.server_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_echo_after_confirm_is_suppressed() {
        let mut list = Reconciler::new();
        let local = list.submit_local(comment("", "hi"));
        list.confirm(local, "s1", comment("s1", "hi"))
            .expect("confirm");

        let outcome = list.apply_broadcast("s1", comment("s1", "hi"));
        assert_eq!(outcome, BroadcastOutcome::Suppressed);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_broadcast_before_confirm_collapses_on_confirm() {
        // No serverId correlation exists yet, so two entries are visible
        // until the confirmation supplies it.
        let mut list = Reconciler::new();
        let local = list.submit_local(comment("", "hi"));

        let outcome = list.apply_broadcast("s1", comment("s1", "hi"));
        assert_eq!(outcome, BroadcastOutcome::Inserted);
        assert_eq!(list.len(), 2);

        list.confirm(local, "s1", comment("s1", "hi"))
            .expect("confirm");
        assert_eq!(list.len(), 1);
        // The surviving entry is the locally-submitted one, in place.
        let entry = list.entries().next().expect("entry");
        assert_eq!(entry.local_id, local);
    }

    #[test]
    fn test_peer_broadcasts_insert_in_arrival_order() {
        let mut list = Reconciler::new();
        list.apply_broadcast("s1", comment("s1", "first"));
        list.apply_broadcast("s2", comment("s2", "second"));
        let bodies: Vec<_> = list.values().map(|c| c.body.clone()).collect();
        assert_eq!(bodies, vec!["first", "second"]);
    }

    #[test]
    fn test_roll_back_removes_only_unconfirmed() {
        let mut list = Reconciler::new();
        let failed = list.submit_local(comment("", "oops"));
        let kept = list.submit_local(comment("", "fine"));
        list.confirm(kept, "s2", comment("s2", "fine"))
            .expect("confirm");

        assert!(list.roll_back(failed));
        assert!(!list.roll_back(kept));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_conflicting_confirm_prefers_server_copy() {
        let mut list = Reconciler::new();
        let err = list
            .confirm(Uuid::new_v4(), "s9", comment("s9", "ghost"))
            .expect_err("no local entry");
        assert!(matches!(err, LiveError::ReconciliationConflict { .. }));
        // Never dropped, never duplicated.
        assert_eq!(list.len(), 1);

        let outcome = list.apply_broadcast("s9", comment("s9", "ghost"));
        assert_eq!(outcome, BroadcastOutcome::Suppressed);
    }

    #[test]
    fn test_update_and_delete_by_server_id() {
        let mut list = Reconciler::new();
        list.apply_broadcast("s1", comment("s1", "draft"));

        assert!(list.apply_update("s1", comment("s1", "edited")));
        assert_eq!(list.values().next().map(|c| c.body.as_str()), Some("edited"));
        assert!(!list.apply_update("s2", comment("s2", "missing")));

        assert!(list.apply_delete("s1"));
        assert!(list.is_empty());
        assert!(!list.apply_delete("s1"));
    }

    #[test]
    fn test_feed_tracks_bus_events() {
        let bus = EventBus::default();
        let feed = CommentFeed::attach(&bus);

        bus.dispatch(&LiveEvent::CommentCreated(comment("s1", "hello")));
        bus.dispatch(&LiveEvent::CommentUpdated(comment("s1", "hello!")));
        assert_eq!(
            feed.comments().first().map(|c| c.body.clone()),
            Some("hello!".to_string())
        );

        bus.dispatch(&LiveEvent::CommentDeleted {
            id: "s1".to_string(),
        });
        assert!(feed.comments().is_empty());
    }

    #[test]
    fn test_dropping_feed_detaches_from_bus() {
        let bus = EventBus::default();
        let feed = CommentFeed::attach(&bus);
        assert_eq!(bus.listener_count(), 3);
        drop(feed);
        assert_eq!(bus.listener_count(), 0);
    }
}
