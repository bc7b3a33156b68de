//! In-process pub/sub for live events.
//!
//! All inbound frames (and locally-generated status changes) fan out to UI
//! consumers through one `EventBus`. Registration is additive: the same
//! closure registered twice runs twice per dispatch. `on()` returns a
//! [`Subscription`] handle whose `dispose()` performs the removal, so
//! callers can never mismatch an `(event, callback)` pair at removal time.
//!
//! Dispatch rules:
//! - listeners for an event run in registration order;
//! - a listener returning `Err` is logged and does not stop its siblings;
//! - a listener may dispose itself or any sibling mid-dispatch;
//! - dispatching with no listeners is a no-op.

use std::sync::{Arc, Mutex, Weak};

use crate::transport::wire::LiveEvent;

/// Listener invoked per dispatch. Errors are reported to the log collaborator
/// and never propagated to the dispatcher.
pub type Callback = Arc<dyn Fn(&LiveEvent) -> anyhow::Result<()> + Send + Sync>;

struct Entry {
    id: u64,
    event: String,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    // Vec preserves registration order for dispatch.
    entries: Vec<Entry>,
}

impl Registry {
    fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|e| e.id != id);
    }
}

/// Named-event listener registry with de-duplicated removal via handles.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.registry.lock().map(|r| r.entries.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event`. Returns the handle that removes it.
    ///
    /// Registration is additive: registering the same closure twice yields
    /// two invocations per dispatch. De-duplication, if wanted, is the
    /// caller's own guard.
    pub fn on<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&LiveEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event = event.into();
        let mut registry = self.registry.lock().expect("bus registry poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push(Entry {
            id,
            event: event.clone(),
            callback: Arc::new(callback),
        });

        Subscription {
            id,
            event,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to every listener registered for its name.
    ///
    /// Listeners run in registration order. The listener snapshot is taken
    /// up front and each entry is re-checked against the registry right
    /// before it runs, so a listener disposed mid-dispatch (by itself or a
    /// sibling) is skipped without corrupting iteration.
    pub fn dispatch(&self, event: &LiveEvent) {
        let name = event.name();
        let snapshot: Vec<(u64, Callback)> = {
            let registry = self.registry.lock().expect("bus registry poisoned");
            registry
                .entries
                .iter()
                .filter(|e| e.event == name)
                .map(|e| (e.id, Arc::clone(&e.callback)))
                .collect()
        };

        for (id, callback) in snapshot {
            let still_registered = {
                let registry = self.registry.lock().expect("bus registry poisoned");
                registry.contains(id)
            };
            if !still_registered {
                continue;
            }
            if let Err(e) = callback(event) {
                log::error!("listener for '{name}' failed: {e:#}");
            }
        }
    }

    /// Number of live subscriptions (all events).
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registry.lock().expect("bus registry poisoned").entries.len()
    }
}

/// Handle to one registered listener.
///
/// `dispose()` removes exactly this registration; other listeners for the
/// same event are untouched. Dropping the handle without calling `dispose()`
/// leaves the listener registered for the lifetime of the bus.
#[must_use = "keep the Subscription to dispose the listener later"]
pub struct Subscription {
    id: u64,
    event: String,
    registry: Weak<Mutex<Registry>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event", &self.event)
            .finish()
    }
}

impl Subscription {
    /// Remove the listener. Idempotent; a second call (or a call after the
    /// bus was dropped) is a no-op, never an error.
    pub fn dispose(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().expect("bus registry poisoned");
            registry.remove(self.id);
        }
    }

    /// Event name this subscription listens on.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }
}
