//! Transport connection: one physical realtime channel per browser session.
//!
//! # Architecture
//!
//! ```text
//! Connection
//!     ├── strategy (WebSocket preferred, long-poll fallback, opportunistic upgrade)
//!     ├── wire (frame normalization + tagged payload validation)
//!     ├── driver task (connect / session / bounded reconnect)
//!     └── EventBus (all inbound frames and status changes fan out here)
//! ```
//!
//! The driver task owns the socket and is the only mutator of connection
//! status. Reconnection after a drop is automatic but bounded: a fixed
//! number of attempts with a fixed delay, after which status becomes
//! `Degraded` and the driver exits — a caller must invoke [`Connection::connect`]
//! again to resume.

pub mod strategy;
pub mod wire;

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::time::Instant;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::retry::{RetryError, RetryPolicy};

pub use strategy::{Transport, TransportKind, TransportStream};
pub use wire::{CommentPayload, ConnectionStatusPayload, LiveEvent, NotificationPayload};

use strategy::{LongPollTransport, WebSocketTransport};
use wire::{CableCommand, RoomIdentifier, WireMessage};

/// Connection lifecycle status. Only the driver task mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No transport, no driver running.
    #[default]
    Disconnected,
    /// Driver is establishing (or re-establishing) a transport.
    Connecting,
    /// A live transport exists and all rooms are re-joined.
    Connected,
    /// The reconnect budget is exhausted; no silent retrying. A caller must
    /// invoke `connect()` to resume.
    Degraded,
}

/// Control messages flowing from membership/reconciler facades to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    /// Join a room stream.
    Subscribe(String),
    /// Leave a room stream.
    Unsubscribe(String),
    /// Entity mutation sent over the channel.
    Perform {
        room: Option<String>,
        action: String,
        payload: serde_json::Value,
    },
}

/// One realtime connection per browser session.
///
/// Created by a composition root and shared (read-many) by room membership
/// and any number of bus listeners. Construct via [`Connection::builder`].
pub struct Connection {
    config: LiveConfig,
    bearer: String,
    bus: EventBus,
    transports: Vec<Arc<dyn Transport>>,
    rooms: Arc<StdRwLock<HashSet<String>>>,
    status_tx: watch::Sender<ConnectionStatus>,
    status_rx: watch::Receiver<ConnectionStatus>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Arc<TokioMutex<mpsc::UnboundedReceiver<Command>>>,
    shutdown_tx: watch::Sender<bool>,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server_url", &self.config.server_url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Connection`].
#[derive(Default)]
pub struct ConnectionBuilder {
    config: Option<LiveConfig>,
    bearer: Option<String>,
    bus: Option<EventBus>,
    transports: Vec<Arc<dyn Transport>>,
}

impl std::fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("transports", &self.transports.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionBuilder {
    /// Tunables; defaults to [`LiveConfig::load`].
    #[must_use]
    pub fn config(mut self, config: LiveConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Opaque bearer credential supplied by the auth collaborator (required).
    #[must_use]
    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Share an existing bus; defaults to a fresh one.
    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Append a transport strategy. Order is preference order (first =
    /// upgrade target). Defaults to WebSocket then long-poll.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Build the connection.
    ///
    /// # Panics
    ///
    /// Panics if `bearer` was not set.
    #[must_use]
    pub fn build(self) -> Connection {
        let transports = if self.transports.is_empty() {
            vec![
                Arc::new(WebSocketTransport) as Arc<dyn Transport>,
                Arc::new(LongPollTransport::default()) as Arc<dyn Transport>,
            ]
        } else {
            self.transports
        };
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Connection {
            config: self.config.unwrap_or_else(LiveConfig::load),
            bearer: self.bearer.expect("bearer is required"),
            bus: self.bus.unwrap_or_default(),
            transports,
            rooms: Arc::new(StdRwLock::new(HashSet::new())),
            status_tx,
            status_rx,
            cmd_tx,
            cmd_rx: Arc::new(TokioMutex::new(cmd_rx)),
            shutdown_tx,
            driver: StdMutex::new(None),
        }
    }
}

impl Connection {
    /// Create a connection builder.
    #[must_use]
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch status changes (for callers that prefer a stream over bus events).
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// The bus all inbound frames and status events are dispatched on.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Room membership facade bound to this connection.
    #[must_use]
    pub fn rooms(&self) -> crate::rooms::RoomMembership {
        crate::rooms::RoomMembership::new(Arc::clone(&self.rooms), self.cmd_tx.clone())
    }

    /// Queue an outbound entity mutation ("create/update/delete entity").
    ///
    /// Queues while disconnected and flushes once a transport is live.
    pub fn perform(
        &self,
        room: Option<&str>,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<(), LiveError> {
        self.cmd_tx
            .send(Command::Perform {
                room: room.map(ToString::to_string),
                action: action.to_string(),
                payload,
            })
            .map_err(|_| LiveError::Closed)
    }

    /// Establish a transport, resolving once one is live and all previously
    /// joined rooms are re-subscribed.
    ///
    /// Transient attempt failures are retried internally under the bounded
    /// connect policy; only budget exhaustion (or an unrecoverable setup
    /// error) is returned. Calling while already connected is a no-op.
    pub async fn connect(&self) -> Result<(), LiveError> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }
        self.ensure_driver();

        let mut rx = self.status_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Degraded => {
                    return Err(LiveError::TransportUnavailable(
                        "connection attempt budget exhausted".to_string(),
                    ))
                }
                ConnectionStatus::Connecting | ConnectionStatus::Disconnected => {}
            }
            if rx.changed().await.is_err() {
                return Err(LiveError::Closed);
            }
        }
    }

    /// Tear down the transport. Synchronous and idempotent: calling twice
    /// produces the same end state as calling once.
    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
    }

    /// Spawn the driver task if none is running.
    fn ensure_driver(&self) {
        let mut driver = self.driver.lock().expect("driver lock poisoned");
        if let Some(handle) = driver.as_ref() {
            // A driver whose shutdown was requested counts as dead even if
            // the task has not been polled since: left alone it would
            // observe the flag and exit, and a connect() waiting on the
            // status watch would hang. Abort it so the replacement cannot
            // race it for the stream or the command queue.
            let shutting_down = *self.shutdown_tx.borrow();
            if !handle.is_finished() && !shutting_down {
                return;
            }
            handle.abort();
        }

        // Clear any stale shutdown request from a previous disconnect.
        let _ = self.shutdown_tx.send(false);
        self.status_tx.send_replace(ConnectionStatus::Connecting);

        let task = Driver {
            config: self.config.clone(),
            bearer: self.bearer.clone(),
            bus: self.bus.clone(),
            transports: self.transports.clone(),
            rooms: Arc::clone(&self.rooms),
            status: self.status_tx.clone(),
            cmd_rx: Arc::clone(&self.cmd_rx),
            shutdown: self.shutdown_tx.subscribe(),
        };
        *driver = Some(tokio::spawn(task.run()));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Why a live session ended.
enum SessionEnd {
    /// Explicit teardown; the driver exits without reconnecting.
    Shutdown,
    /// Unexpected drop; the driver enters bounded reconnection.
    Dropped(String),
}

/// The connection driver: owns the transport stream for its lifetime.
struct Driver {
    config: LiveConfig,
    bearer: String,
    bus: EventBus,
    transports: Vec<Arc<dyn Transport>>,
    rooms: Arc<StdRwLock<HashSet<String>>>,
    status: watch::Sender<ConnectionStatus>,
    cmd_rx: Arc<TokioMutex<mpsc::UnboundedReceiver<Command>>>,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    async fn run(self) {
        // Initial establishment uses the connect policy; after a drop the
        // (typically larger) reconnect policy applies.
        let mut policy = self.config.connect_policy();

        loop {
            match self.establish(policy).await {
                Ok(stream) => {
                    let end = self.session(stream).await;
                    match end {
                        SessionEnd::Shutdown => {
                            self.status.send_replace(ConnectionStatus::Disconnected);
                            log::info!("connection shut down");
                            return;
                        }
                        SessionEnd::Dropped(reason) => {
                            log::warn!("transport dropped: {reason}");
                            self.status.send_replace(ConnectionStatus::Connecting);
                            self.dispatch_status(false, true, Some(reason));
                            policy = self.config.reconnect_policy();
                        }
                    }
                }
                Err(EstablishEnd::Shutdown) => {
                    self.status.send_replace(ConnectionStatus::Disconnected);
                    return;
                }
                Err(EstablishEnd::Exhausted(detail)) => {
                    log::error!("connection attempt budget exhausted: {detail}");
                    self.status.send_replace(ConnectionStatus::Degraded);
                    self.dispatch_status(false, false, Some(detail));
                    // No silent retrying past the budget; connect() restarts us.
                    return;
                }
            }
        }
    }

    /// Run the bounded-retry loop until a transport is live or the budget
    /// is exhausted.
    async fn establish(
        &self,
        policy: RetryPolicy,
    ) -> Result<Box<dyn TransportStream>, EstablishEnd> {
        let mut shutdown = self.shutdown.clone();
        let attempt_loop = policy.run_observed(
            "connect",
            |_attempt| self.open_any(),
            |attempt, err| {
                // The final failure is reported as exhaustion by our caller,
                // not as one more retrying notice.
                if attempt < policy.max_attempts {
                    self.dispatch_status(false, true, Some(err.to_string()));
                }
            },
        );

        tokio::select! {
            result = attempt_loop => result.map_err(|e| {
                let detail = match e {
                    RetryError::Failed(inner) => inner.to_string(),
                    RetryError::AttemptTimedOut => "attempt timed out".to_string(),
                };
                EstablishEnd::Exhausted(detail)
            }),
            _ = wait_for_shutdown(&mut shutdown) => Err(EstablishEnd::Shutdown),
        }
    }

    /// Try each strategy in preference order; first live one wins.
    async fn open_any(&self) -> Result<Box<dyn TransportStream>, LiveError> {
        let mut last: Option<LiveError> = None;
        for transport in &self.transports {
            match open_and_welcome(transport.as_ref(), &self.config.server_url, &self.bearer).await
            {
                Ok(stream) => {
                    log::info!("transport live via {}", stream.kind());
                    return Ok(stream);
                }
                Err(e) => {
                    log::warn!("{} strategy failed: {e}", transport.kind());
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            LiveError::TransportUnavailable("no transport strategies configured".to_string())
        }))
    }

    /// Run one live session until shutdown or drop.
    async fn session(&self, mut stream: Box<dyn TransportStream>) -> SessionEnd {
        // Re-join everything BEFORE announcing health, so no caller ever
        // observes "connected but not subscribed".
        let mut subscribed: HashSet<String> = HashSet::new();
        if let Err(e) = self.resubscribe(stream.as_mut(), &mut subscribed).await {
            return SessionEnd::Dropped(format!("resubscribe failed: {e}"));
        }

        self.status.send_replace(ConnectionStatus::Connected);
        self.dispatch_status(true, false, None);

        let mut last_activity = Instant::now();
        let mut stale_check = tokio::time::interval(Duration::from_secs(
            (self.config.stale_timeout_secs / 3).max(1),
        ));
        let preferred = self.transports[0].kind();
        let mut upgrade_tick =
            tokio::time::interval(Duration::from_secs(self.config.upgrade_retry_secs.max(1)));
        upgrade_tick.tick().await; // first tick fires immediately; skip it

        let mut shutdown = self.shutdown.clone();
        let cmd_rx_slot = Arc::clone(&self.cmd_rx);
        let mut cmd_rx = cmd_rx_slot.lock().await;

        enum Step {
            Shutdown,
            Command(Command),
            Frame(Option<String>),
            StaleCheck,
            UpgradeAttempt,
        }

        loop {
            let on_fallback = stream.kind() != preferred;

            // Resolve the select into a value first so arm handlers below
            // are free to replace the stream.
            let step = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => Step::Shutdown,
                Some(command) = cmd_rx.recv() => Step::Command(command),
                frame = stream.next_frame() => Step::Frame(frame),
                _ = stale_check.tick() => Step::StaleCheck,
                _ = upgrade_tick.tick(), if on_fallback => Step::UpgradeAttempt,
            };

            match step {
                Step::Shutdown => return SessionEnd::Shutdown,

                Step::Command(command) => {
                    if let Err(e) = self
                        .handle_command(stream.as_mut(), &mut subscribed, command)
                        .await
                    {
                        return SessionEnd::Dropped(format!("send failed: {e}"));
                    }
                }

                Step::Frame(Some(text)) => {
                    last_activity = Instant::now();
                    if let Some(end) = self.handle_frame(&text) {
                        return end;
                    }
                }
                Step::Frame(None) => return SessionEnd::Dropped("stream closed".to_string()),

                Step::StaleCheck => {
                    let idle = last_activity.elapsed();
                    if idle > Duration::from_secs(self.config.stale_timeout_secs) {
                        return SessionEnd::Dropped(format!("stale for {}s", idle.as_secs()));
                    }
                }

                Step::UpgradeAttempt => match self.try_upgrade().await {
                    Some(mut upgraded) => {
                        let mut fresh = HashSet::new();
                        if self.resubscribe(upgraded.as_mut(), &mut fresh).await.is_ok() {
                            log::info!("upgraded transport to {}", preferred);
                            stream = upgraded;
                            subscribed = fresh;
                            last_activity = Instant::now();
                        }
                    }
                    None => log::debug!("upgrade attempt to {} failed", preferred),
                },
            }
        }
    }

    /// Subscribe the global stream plus every desired room on `stream`.
    async fn resubscribe(
        &self,
        stream: &mut dyn TransportStream,
        subscribed: &mut HashSet<String>,
    ) -> anyhow::Result<()> {
        stream
            .send_frame(CableCommand::subscribe(&RoomIdentifier::broadcast()).encode())
            .await?;

        let desired: Vec<String> = {
            let rooms = self.rooms.read().expect("rooms lock poisoned");
            rooms.iter().cloned().collect()
        };
        for room in desired {
            stream
                .send_frame(CableCommand::subscribe(&RoomIdentifier::room(&room)).encode())
                .await?;
            subscribed.insert(room);
        }
        Ok(())
    }

    async fn handle_command(
        &self,
        stream: &mut dyn TransportStream,
        subscribed: &mut HashSet<String>,
        command: Command,
    ) -> anyhow::Result<()> {
        match command {
            Command::Subscribe(room) => {
                // Dedupe here as well: a queued join may race the replay.
                if subscribed.insert(room.clone()) {
                    stream
                        .send_frame(CableCommand::subscribe(&RoomIdentifier::room(&room)).encode())
                        .await?;
                    log::debug!("joined room '{room}'");
                }
            }
            Command::Unsubscribe(room) => {
                if subscribed.remove(&room) {
                    stream
                        .send_frame(
                            CableCommand::unsubscribe(&RoomIdentifier::room(&room)).encode(),
                        )
                        .await?;
                    log::debug!("left room '{room}'");
                }
            }
            Command::Perform {
                room,
                action,
                payload,
            } => {
                let identifier = match room {
                    Some(room) => RoomIdentifier::room(room),
                    None => RoomIdentifier::broadcast(),
                };
                stream
                    .send_frame(CableCommand::perform(&identifier, &action, &payload).encode())
                    .await?;
            }
        }
        Ok(())
    }

    /// Normalize and dispatch one inbound frame. Returns `Some` when the
    /// frame ends the session.
    fn handle_frame(&self, text: &str) -> Option<SessionEnd> {
        match wire::parse_incoming(text)? {
            WireMessage::Welcome | WireMessage::Ping => None,
            WireMessage::SubscriptionConfirmed { room } => {
                log::debug!("subscription confirmed: {room:?}");
                None
            }
            WireMessage::SubscriptionRejected { room, reason } => {
                let room = room.unwrap_or_else(|| "broadcast".to_string());
                log::warn!(
                    "{}",
                    LiveError::RoomJoinRejected {
                        room: room.clone(),
                        reason: reason.clone(),
                    }
                );
                // Drop the desired membership so reconnects don't re-request it.
                self.rooms
                    .write()
                    .expect("rooms lock poisoned")
                    .remove(&room);
                self.bus.dispatch(&LiveEvent::RoomRejected { room, reason });
                None
            }
            WireMessage::Disconnect => {
                Some(SessionEnd::Dropped("server requested disconnect".to_string()))
            }
            WireMessage::Frame(frame) => {
                self.bus.dispatch(frame.event());
                None
            }
        }
    }

    /// One upgrade attempt to the preferred strategy, bounded by the
    /// connect timeout.
    async fn try_upgrade(&self) -> Option<Box<dyn TransportStream>> {
        let preferred = &self.transports[0];
        let window = Duration::from_secs(self.config.connect_timeout_secs);
        match tokio::time::timeout(
            window,
            open_and_welcome(preferred.as_ref(), &self.config.server_url, &self.bearer),
        )
        .await
        {
            Ok(Ok(stream)) => Some(stream),
            Ok(Err(_)) | Err(_) => None,
        }
    }

    fn dispatch_status(&self, connected: bool, retrying: bool, detail: Option<String>) {
        self.bus
            .dispatch(&LiveEvent::ConnectionStatus(ConnectionStatusPayload {
                connected,
                retrying,
                detail,
            }));
    }
}

enum EstablishEnd {
    Shutdown,
    Exhausted(String),
}

/// Open a stream on `transport` and wait for the server welcome.
async fn open_and_welcome(
    transport: &dyn Transport,
    server_url: &str,
    bearer: &str,
) -> Result<Box<dyn TransportStream>, LiveError> {
    let mut stream = transport.open(server_url, bearer).await?;
    loop {
        match stream.next_frame().await {
            Some(text) => {
                if matches!(wire::parse_incoming(&text), Some(WireMessage::Welcome)) {
                    return Ok(stream);
                }
                // Anything pre-welcome is protocol noise.
            }
            None => {
                return Err(LiveError::TransportUnavailable(
                    "stream closed before welcome".to_string(),
                ))
            }
        }
    }
}

/// Resolve once the shutdown flag flips to `true`.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Connection dropped entirely; treat as shutdown.
            return;
        }
    }
}
