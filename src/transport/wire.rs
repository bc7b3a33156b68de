//! Wire format for the realtime channel.
//!
//! This module is the only place that understands the cable protocol. Every
//! inbound text frame is normalized here into either a system message
//! (welcome, ping, subscription control) or a [`Frame`] carrying a validated
//! [`LiveEvent`]. Payloads are a tagged union discriminated by event name;
//! anything that fails validation is rejected at this boundary and never
//! reaches the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound cable command (`subscribe`, `unsubscribe`, `message`).
#[derive(Debug, Serialize, Deserialize)]
pub struct CableCommand {
    pub command: String,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Subscription identifier, serialized as a JSON string inside the command
/// (cable convention: the identifier field is double-encoded).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomIdentifier {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl RoomIdentifier {
    /// Identifier for a room-scoped stream.
    #[must_use]
    pub fn room(room: impl Into<String>) -> Self {
        Self {
            channel: "LiveChannel".to_string(),
            room: Some(room.into()),
        }
    }

    /// Identifier for the global broadcast stream.
    #[must_use]
    pub fn broadcast() -> Self {
        Self {
            channel: "LiveChannel".to_string(),
            room: None,
        }
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).expect("identifier serializable")
    }
}

impl CableCommand {
    /// Subscribe to a room stream.
    #[must_use]
    pub fn subscribe(identifier: &RoomIdentifier) -> Self {
        Self {
            command: "subscribe".to_string(),
            identifier: identifier.encode(),
            data: None,
        }
    }

    /// Unsubscribe from a room stream.
    #[must_use]
    pub fn unsubscribe(identifier: &RoomIdentifier) -> Self {
        Self {
            command: "unsubscribe".to_string(),
            identifier: identifier.encode(),
            data: None,
        }
    }

    /// Entity mutation ("create/update/delete entity" control message).
    #[must_use]
    pub fn perform(identifier: &RoomIdentifier, action: &str, payload: &Value) -> Self {
        let mut data = payload.clone();
        if let Value::Object(ref mut map) = data {
            map.insert("action".to_string(), Value::String(action.to_string()));
        }
        Self {
            command: "message".to_string(),
            identifier: identifier.encode(),
            data: Some(data.to_string()),
        }
    }

    /// Serialize for the socket.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("command serializable")
    }
}

/// Raw inbound cable message shape (pre-normalization).
#[derive(Debug, Deserialize)]
struct RawIncoming {
    #[serde(rename = "type")]
    msg_type: Option<String>,
    identifier: Option<String>,
    message: Option<Value>,
    reason: Option<String>,
}

/// A normalized inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Handshake acknowledgment; the transport is live.
    Welcome,
    /// Server heartbeat. Resets the staleness clock, carries no payload.
    Ping,
    /// Server confirmed a room subscription.
    SubscriptionConfirmed { room: Option<String> },
    /// Server refused a room subscription.
    SubscriptionRejected {
        room: Option<String>,
        reason: Option<String>,
    },
    /// Server is closing the connection.
    Disconnect,
    /// A data frame carrying a validated event.
    Frame(Frame),
}

/// An inbound event frame, classified by addressing.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Scoped to one room; only members receive it.
    Addressed { room: String, event: LiveEvent },
    /// Global; every connection receives it.
    Broadcast { event: LiveEvent },
}

impl Frame {
    /// The event carried by this frame, regardless of addressing.
    #[must_use]
    pub fn event(&self) -> &LiveEvent {
        match self {
            Self::Addressed { event, .. } | Self::Broadcast { event } => event,
        }
    }
}

/// Validated event payloads, discriminated by event name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum LiveEvent {
    /// Connection health change, dispatched locally by the connection itself.
    ConnectionStatus(ConnectionStatusPayload),
    /// A comment was posted (peer broadcast or echo of our own).
    CommentCreated(CommentPayload),
    /// A comment was edited.
    CommentUpdated(CommentPayload),
    /// A comment was removed.
    CommentDeleted {
        /// Server identifier of the removed comment.
        id: String,
    },
    /// Station-wide notification.
    NotificationPosted(NotificationPayload),
    /// Program metadata changed (title, live flag).
    ProgramUpdated {
        program_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default)]
        live: bool,
    },
    /// The server refused a room membership; dispatched locally by the
    /// connection so the owning surface can react.
    RoomRejected {
        room: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl LiveEvent {
    /// Event name used for bus subscription lookup.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionStatus(_) => "connection-status",
            Self::CommentCreated(_) => "comment-created",
            Self::CommentUpdated(_) => "comment-updated",
            Self::CommentDeleted { .. } => "comment-deleted",
            Self::NotificationPosted(_) => "notification-posted",
            Self::ProgramUpdated { .. } => "program-updated",
            Self::RoomRejected { .. } => "room-rejected",
        }
    }
}

/// Payload of `connection-status` events.
///
/// `retrying` distinguishes "still trying" (reconnecting) from "needs your
/// action" (gave up); UI copy is expected to differ between the two.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStatusPayload {
    pub connected: bool,
    #[serde(default)]
    pub retrying: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A comment entity as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommentPayload {
    /// Server-assigned identifier. Present on confirmed/broadcast copies.
    pub id: String,
    pub body: String,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A station notification as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPayload {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Normalize one inbound text frame.
///
/// Returns `None` for frames that are not valid cable messages or whose
/// payload fails tagged-union validation; such frames are dropped here with
/// a log line and never reach listeners.
#[must_use]
pub fn parse_incoming(text: &str) -> Option<WireMessage> {
    let raw: RawIncoming = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            log::debug!("dropping unparseable frame: {e}");
            return None;
        }
    };

    if let Some(ref msg_type) = raw.msg_type {
        let room = raw
            .identifier
            .as_deref()
            .and_then(|id| serde_json::from_str::<RoomIdentifier>(id).ok())
            .and_then(|id| id.room);
        return match msg_type.as_str() {
            "welcome" => Some(WireMessage::Welcome),
            "ping" => Some(WireMessage::Ping),
            "confirm_subscription" => Some(WireMessage::SubscriptionConfirmed { room }),
            "reject_subscription" => Some(WireMessage::SubscriptionRejected {
                room,
                reason: raw.reason,
            }),
            "disconnect" => Some(WireMessage::Disconnect),
            other => {
                log::debug!("ignoring unknown system message type '{other}'");
                None
            }
        };
    }

    let message = raw.message?;
    let event: LiveEvent = match serde_json::from_value(message) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("dropping frame with invalid payload: {e}");
            return None;
        }
    };

    let room = raw
        .identifier
        .as_deref()
        .and_then(|id| serde_json::from_str::<RoomIdentifier>(id).ok())
        .and_then(|id| id.room);

    let frame = match room {
        Some(room) => Frame::Addressed { room, event },
        None => Frame::Broadcast { event },
    };
    Some(WireMessage::Frame(frame))
}
