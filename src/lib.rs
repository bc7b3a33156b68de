//! Stationlink - live connectivity core for station clients.
//!
//! This crate provides the realtime plumbing a station front end needs:
//! a reconnecting transport, an event bus, room membership, live playback
//! resilience, and optimistic update reconciliation.
//!
//! # Architecture
//!
//! The crate follows a single-connection fan-out pattern:
//!
//! - **Connection** - Owns the one realtime transport, runs the driver loop
//! - **EventBus** - Fan-out of validated inbound events to subscribers
//! - **RoomMembership** - Idempotent join/leave on top of the Connection
//! - **PlaybackController** - Per-surface media resilience state machine
//! - **Reconciler** - Collapses optimistic, confirmed, and broadcast copies
//!
//! # Modules
//!
//! - [`transport`] - Connection, transport strategies, wire normalization
//! - [`bus`] - Listener registry and dispatch
//! - [`rooms`] - Room membership facade
//! - [`playback`] - Playback controller, session machine, buffer gauge
//! - [`reconcile`] - Optimistic update reconciliation
//! - [`retry`] - Bounded fixed-delay retry shared by transport and playback
//! - [`config`] - Tunables with environment overrides

// Library modules
pub mod bus;
pub mod config;
pub mod error;
pub mod playback;
pub mod reconcile;
pub mod retry;
pub mod rooms;
pub mod transport;

// Re-export commonly used types
pub use bus::{EventBus, Subscription};
pub use config::LiveConfig;
pub use error::LiveError;
pub use playback::{MediaErrorKind, MediaPipeline, PlaybackController, SessionState, SourceKind};
pub use reconcile::{CommentFeed, Reconciler};
pub use retry::RetryPolicy;
pub use rooms::RoomMembership;
pub use transport::{CommentPayload, ConnectionStatus, LiveEvent};

// Re-export Connection
pub use transport::{Connection, ConnectionBuilder};
