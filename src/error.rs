//! Error taxonomy for the live connectivity core.
//!
//! Transient classes (`TransportDropped`, `MediaStalled`) are handled
//! internally by the retry/recovery machinery and surface only as status
//! events. Terminal classes are returned to the caller and require an
//! explicit retry action.

use crate::playback::MediaErrorKind;

/// Errors surfaced by the live connectivity core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveError {
    /// No transport strategy could be established within the attempt budget.
    TransportUnavailable(String),
    /// An established transport was lost. Handled internally; only appears
    /// in status events, never returned from the public API.
    TransportDropped(String),
    /// The server refused a room membership request.
    RoomJoinRejected {
        /// Room whose join was refused.
        room: String,
        /// Server-supplied reason, if any.
        reason: Option<String>,
    },
    /// The media source format cannot be played; names the missing capability.
    MediaUnsupported(String),
    /// Playback forward progress stopped. Handled internally via recovery.
    MediaStalled,
    /// The media pipeline failed to decode the stream.
    MediaDecodeFailure(String),
    /// A server-confirmed entity has no matching local optimistic entry.
    ReconciliationConflict {
        /// Server identifier of the orphaned confirmation.
        server_id: String,
    },
    /// The connection (or session) was torn down while an operation was pending.
    Closed,
}

impl std::fmt::Display for LiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TransportUnavailable(msg) => write!(f, "no transport available: {msg}"),
            Self::TransportDropped(msg) => write!(f, "transport dropped: {msg}"),
            Self::RoomJoinRejected { room, reason } => match reason {
                Some(r) => write!(f, "join rejected for room '{room}': {r}"),
                None => write!(f, "join rejected for room '{room}'"),
            },
            Self::MediaUnsupported(capability) => {
                write!(f, "media format unsupported (requires {capability})")
            }
            Self::MediaStalled => write!(f, "media playback stalled"),
            Self::MediaDecodeFailure(msg) => write!(f, "media decode failure: {msg}"),
            Self::ReconciliationConflict { server_id } => {
                write!(f, "no local entry matches confirmed entity {server_id}")
            }
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for LiveError {}

impl From<MediaErrorKind> for LiveError {
    fn from(kind: MediaErrorKind) -> Self {
        match kind {
            MediaErrorKind::Network => Self::TransportDropped("media network error".to_string()),
            MediaErrorKind::Decode => Self::MediaDecodeFailure("decode error".to_string()),
            MediaErrorKind::UnsupportedFormat => {
                Self::MediaUnsupported("adaptive stream playback".to_string())
            }
            MediaErrorKind::Aborted => Self::Closed,
        }
    }
}
