//! Integration tests for the realtime connection driver.
//!
//! These tests run the full driver loop (connect, session, bounded
//! reconnect) against a scripted in-memory transport, so every wire frame
//! the driver sends is observable and every inbound frame is injectable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use stationlink::transport::{Transport, TransportKind, TransportStream};
use stationlink::{
    CommentFeed, Connection, ConnectionStatus, EventBus, LiveConfig, LiveError, LiveEvent,
};

/// What the next `open()` call should do.
#[derive(Clone, Copy)]
enum OpenPlan {
    /// Fail immediately.
    Fail,
    /// Never resolve (exercises the fixed attempt timeout).
    Hang,
    /// Yield a live stream that has already sent its welcome.
    Live,
}

struct ScriptedTransport {
    plans: Mutex<VecDeque<OpenPlan>>,
    opens: AtomicUsize,
    sent: Arc<Mutex<Vec<String>>>,
    inject: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl ScriptedTransport {
    fn new(plans: Vec<OpenPlan>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into_iter().collect()),
            opens: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
            inject: Mutex::new(None),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// All frames sent so far whose cable command matches `command`.
    fn sent_commands(&self, command: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(frame).ok())
            .filter(|value| value["command"] == command)
            .collect()
    }

    fn subscribes_for(&self, room: &str) -> usize {
        self.sent_commands("subscribe")
            .iter()
            .filter(|v| v["identifier"].as_str().unwrap_or("").contains(room))
            .count()
    }

    /// Inject an inbound frame into the currently live stream.
    fn push_frame(&self, frame: impl Into<String>) {
        let guard = self.inject.lock().unwrap();
        let tx = guard.as_ref().expect("no live stream to inject into");
        tx.send(frame.into()).expect("stream receiver gone");
    }

    /// Close the live stream, simulating an unexpected drop.
    fn drop_stream(&self) {
        self.inject.lock().unwrap().take();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(
        &self,
        _server_url: &str,
        _bearer: &str,
    ) -> Result<Box<dyn TransportStream>, LiveError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OpenPlan::Live);
        match plan {
            OpenPlan::Fail => Err(LiveError::TransportUnavailable(
                "scripted failure".to_string(),
            )),
            OpenPlan::Hang => std::future::pending().await,
            OpenPlan::Live => {
                let (tx, rx) = mpsc::unbounded_channel();
                tx.send(r#"{"type":"welcome"}"#.to_string())
                    .expect("welcome queued");
                *self.inject.lock().unwrap() = Some(tx);
                Ok(Box::new(ScriptedStream {
                    rx,
                    sent: Arc::clone(&self.sent),
                }))
            }
        }
    }
}

struct ScriptedStream {
    rx: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TransportStream for ScriptedStream {
    async fn next_frame(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    async fn send_frame(&mut self, text: String) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }
}

fn test_config() -> LiveConfig {
    LiveConfig {
        connect_timeout_secs: 2,
        connect_attempts: 3,
        reconnect_attempts: 2,
        reconnect_delay_ms: 100,
        // Keep periodic session timers out of the way.
        upgrade_retry_secs: 1_000_000,
        stale_timeout_secs: 1_000_000,
        ..LiveConfig::default()
    }
}

fn build(transport: &Arc<ScriptedTransport>, bus: EventBus) -> Connection {
    let _ = env_logger::builder().is_test(true).try_init();
    Connection::builder()
        .config(test_config())
        .bearer("test-token")
        .bus(bus)
        .transport(Arc::clone(transport) as Arc<dyn Transport>)
        .build()
}

async fn wait_for(connection: &Connection, want: ConnectionStatus) {
    let mut rx = connection.status_watch();
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("status channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
}

/// Spin until `check` passes, yielding to let the driver task run.
async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

/// Record every connection-status payload the bus dispatches.
fn record_status(bus: &EventBus) -> (Arc<Mutex<Vec<(bool, bool)>>>, stationlink::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    let sub = bus.on("connection-status", move |event| {
        if let LiveEvent::ConnectionStatus(payload) = event {
            seen_in
                .lock()
                .unwrap()
                .push((payload.connected, payload.retrying));
        }
        Ok(())
    });
    (seen, sub)
}

#[tokio::test(start_paused = true)]
async fn test_connect_succeeds_on_second_attempt_with_one_health_event() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Hang, OpenPlan::Live]);
    let bus = EventBus::new();
    let (statuses, _sub) = record_status(&bus);
    let connection = build(&transport, bus);

    connection.connect().await.expect("connect");
    assert_eq!(connection.status(), ConnectionStatus::Connected);
    assert_eq!(transport.opens(), 2);

    let seen = statuses.lock().unwrap().clone();
    // The timed-out first attempt is reported as a retrying notice before
    // the second attempt lands.
    assert_eq!(seen.first(), Some(&(false, true)));
    assert_eq!(seen.last(), Some(&(true, false)));
    let connected_events = seen.iter().filter(|(connected, _)| *connected).count();
    assert_eq!(connected_events, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_budget_exhaustion_degrades_and_stops() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Live, OpenPlan::Fail, OpenPlan::Fail]);
    let bus = EventBus::new();
    let (statuses, _sub) = record_status(&bus);
    let connection = build(&transport, bus);

    connection.connect().await.expect("connect");
    transport.drop_stream();
    wait_for(&connection, ConnectionStatus::Degraded).await;

    // Initial open plus exactly the two budgeted reconnect attempts.
    assert_eq!(transport.opens(), 3);

    // No silent retrying once degraded.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.opens(), 3);

    // The terminal status event says "not retrying"; the drop said it was.
    let seen = statuses.lock().unwrap().clone();
    assert!(seen.contains(&(false, true)));
    assert_eq!(seen.last(), Some(&(false, false)));

    // An explicit connect() starts a fresh budget.
    connection.connect().await.expect("reconnect");
    assert_eq!(connection.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_returns_transport_unavailable() {
    let transport =
        ScriptedTransport::new(vec![OpenPlan::Fail, OpenPlan::Fail, OpenPlan::Fail]);
    let connection = build(&transport, EventBus::new());

    let err = connection.connect().await.expect_err("budget exhausted");
    assert!(matches!(err, LiveError::TransportUnavailable(_)));
    assert_eq!(connection.status(), ConnectionStatus::Degraded);
    assert_eq!(transport.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_double_join_sends_one_subscribe() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Live]);
    let connection = build(&transport, EventBus::new());
    connection.connect().await.expect("connect");

    let rooms = connection.rooms();
    rooms.join("podcast-7");
    rooms.join("podcast-7");

    eventually(|| transport.subscribes_for("podcast-7") > 0).await;
    assert_eq!(transport.subscribes_for("podcast-7"), 1);
    assert!(rooms.is_member("podcast-7"));

    rooms.leave("podcast-7");
    eventually(|| !transport.sent_commands("unsubscribe").is_empty()).await;
    assert!(!rooms.is_member("podcast-7"));

    // Leaving a room never joined is a no-op.
    rooms.leave("never-joined");
    assert_eq!(transport.sent_commands("unsubscribe").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rooms_joined_while_disconnected_replay_before_health_event() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Live]);
    let bus = EventBus::new();

    // When the health event fires, the join must already be on the wire.
    let subscribes_at_connect = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&subscribes_at_connect);
    let observer_transport = Arc::clone(&transport);
    let _sub = bus.on("connection-status", move |event| {
        if let LiveEvent::ConnectionStatus(payload) = event {
            if payload.connected {
                *observed.lock().unwrap() =
                    Some(observer_transport.subscribes_for("podcast-7"));
            }
        }
        Ok(())
    });

    let connection = build(&transport, bus);
    connection.rooms().join("podcast-7");
    connection.connect().await.expect("connect");

    assert_eq!(*subscribes_at_connect.lock().unwrap(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_rooms_rejoin_silently_after_reconnect() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Live]);
    let connection = build(&transport, EventBus::new());
    connection.connect().await.expect("connect");

    connection.rooms().join("podcast-7");
    eventually(|| transport.subscribes_for("podcast-7") == 1).await;

    transport.drop_stream();
    eventually(|| transport.subscribes_for("podcast-7") == 2).await;
    wait_for(&connection, ConnectionStatus::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_perform_sends_entity_mutation_with_action() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Live]);
    let connection = build(&transport, EventBus::new());
    connection.connect().await.expect("connect");

    connection
        .perform(
            Some("podcast-7"),
            "create_comment",
            serde_json::json!({"body": "hi", "local_id": "L1"}),
        )
        .expect("perform queued");

    eventually(|| !transport.sent_commands("message").is_empty()).await;
    let sent = transport.sent_commands("message");
    let data: Value =
        serde_json::from_str(sent[0]["data"].as_str().expect("data string")).expect("data json");
    assert_eq!(data["action"], "create_comment");
    assert_eq!(data["body"], "hi");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Live]);
    let connection = build(&transport, EventBus::new());
    connection.connect().await.expect("connect");

    connection.disconnect();
    connection.disconnect();
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);

    // Still usable afterwards.
    connection.connect().await.expect("reconnect");
    assert_eq!(connection.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_right_after_disconnect_respawns_driver() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Live, OpenPlan::Live]);
    let connection = build(&transport, EventBus::new());
    connection.connect().await.expect("connect");

    // No yield between the two calls: the old driver task has not been
    // polled yet and so has not observed the shutdown flag.
    connection.disconnect();
    connection.connect().await.expect("reconnect");

    assert_eq!(connection.status(), ConnectionStatus::Connected);
    assert_eq!(transport.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_room_is_surfaced_and_forgotten() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Live]);
    let bus = EventBus::new();
    let rejections = Arc::new(Mutex::new(Vec::new()));
    let rejections_in = Arc::clone(&rejections);
    let _sub = bus.on("room-rejected", move |event| {
        if let LiveEvent::RoomRejected { room, .. } = event {
            rejections_in.lock().unwrap().push(room.clone());
        }
        Ok(())
    });

    let connection = build(&transport, bus);
    connection.connect().await.expect("connect");
    let rooms = connection.rooms();
    rooms.join("members-only");
    eventually(|| transport.subscribes_for("members-only") == 1).await;

    transport.push_frame(
        serde_json::json!({
            "type": "reject_subscription",
            "identifier": "{\"channel\":\"LiveChannel\",\"room\":\"members-only\"}",
        })
        .to_string(),
    );

    eventually(|| !rejections.lock().unwrap().is_empty()).await;
    assert_eq!(rejections.lock().unwrap().as_slice(), ["members-only"]);
    assert!(!rooms.is_member("members-only"));
}

#[tokio::test(start_paused = true)]
async fn test_inbound_comment_frames_reach_a_live_feed() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Live]);
    let bus = EventBus::new();
    let feed = CommentFeed::attach(&bus);

    let connection = build(&transport, bus);
    connection.connect().await.expect("connect");

    transport.push_frame(
        serde_json::json!({
            "identifier": "{\"channel\":\"LiveChannel\",\"room\":\"podcast-7\"}",
            "message": {
                "event": "comment-created",
                "data": {"id": "c1", "body": "first!", "author": "ana"}
            }
        })
        .to_string(),
    );

    eventually(|| !feed.comments().is_empty()).await;
    assert_eq!(feed.comments()[0].body, "first!");

    transport.push_frame(
        serde_json::json!({
            "identifier": "{\"channel\":\"LiveChannel\",\"room\":\"podcast-7\"}",
            "message": {"event": "comment-deleted", "data": {"id": "c1"}}
        })
        .to_string(),
    );
    eventually(|| feed.comments().is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_dropped_not_fatal() {
    let transport = ScriptedTransport::new(vec![OpenPlan::Live]);
    let bus = EventBus::new();
    let feed = CommentFeed::attach(&bus);

    let connection = build(&transport, bus);
    connection.connect().await.expect("connect");

    transport.push_frame("not json at all");
    transport.push_frame(
        serde_json::json!({
            "identifier": "{\"channel\":\"LiveChannel\"}",
            "message": {"event": "comment-created", "data": {"wrong": "shape"}}
        })
        .to_string(),
    );
    transport.push_frame(
        serde_json::json!({
            "identifier": "{\"channel\":\"LiveChannel\"}",
            "message": {
                "event": "comment-created",
                "data": {"id": "c2", "body": "still here", "author": "bo"}
            }
        })
        .to_string(),
    );

    eventually(|| !feed.comments().is_empty()).await;
    assert_eq!(connection.status(), ConnectionStatus::Connected);
    assert_eq!(feed.comments().len(), 1);
}
