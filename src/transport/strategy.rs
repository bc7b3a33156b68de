//! Transport strategies: persistent WebSocket and long-poll fallback.
//!
//! The connection tries strategies in preference order and, while running on
//! a fallback, periodically re-attempts the preferred one (opportunistic
//! upgrade). Both strategies yield the same raw text frames; normalization
//! into [`super::wire::WireMessage`] happens in the connection loop.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};

use crate::error::LiveError;

/// Which strategy a stream came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Persistent socket (preferred).
    WebSocket,
    /// HTTP long-poll fallback.
    LongPoll,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::LongPoll => write!(f, "long-poll"),
        }
    }
}

/// One way of reaching the backend. Implementations must be cheap to retry;
/// the bounded-retry policy around `open` lives in the connection loop.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Strategy identity, used for upgrade decisions and log lines.
    fn kind(&self) -> TransportKind;

    /// Establish a live stream. The bearer credential is opaque to the
    /// core; it is attached as an `Authorization` header.
    async fn open(
        &self,
        server_url: &str,
        bearer: &str,
    ) -> Result<Box<dyn TransportStream>, LiveError>;
}

/// An established bidirectional frame stream.
#[async_trait]
pub trait TransportStream: Send {
    /// Next raw inbound text frame. `None` means the stream is closed.
    async fn next_frame(&mut self) -> Option<String>;

    /// Send a raw outbound text frame.
    async fn send_frame(&mut self, text: String) -> anyhow::Result<()>;

    /// Strategy this stream belongs to.
    fn kind(&self) -> TransportKind;
}

/// Persistent WebSocket strategy (`wss://…/cable`).
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(
        &self,
        server_url: &str,
        bearer: &str,
    ) -> Result<Box<dyn TransportStream>, LiveError> {
        let ws_url = format!(
            "{}/cable",
            server_url
                .replace("https://", "wss://")
                .replace("http://", "ws://")
        );
        log::debug!("opening websocket: {ws_url}");

        let mut request = ws_url
            .into_client_request()
            .map_err(|e| LiveError::TransportUnavailable(format!("invalid URL: {e}")))?;

        let origin = server_url.parse().map_err(|e| {
            LiveError::TransportUnavailable(format!("invalid server URL '{server_url}': {e}"))
        })?;
        request.headers_mut().insert("Origin", origin);
        let auth = format!("Bearer {bearer}")
            .parse()
            .map_err(|e| LiveError::TransportUnavailable(format!("invalid bearer: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| LiveError::TransportUnavailable(format!("websocket connect: {e}")))?;

        let (write, read) = ws_stream.split();
        Ok(Box::new(WebSocketFrames { write, read }))
    }
}

struct WebSocketFrames {
    write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

#[async_trait]
impl TransportStream for WebSocketFrames {
    async fn next_frame(&mut self) -> Option<String> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(text.to_string()),
                Ok(Message::Ping(data)) => {
                    if self.write.send(Message::Pong(data)).await.is_err() {
                        return None;
                    }
                }
                Ok(Message::Close(_)) => {
                    log::info!("websocket closed by server");
                    return None;
                }
                Err(e) => {
                    log::warn!("websocket error: {e}");
                    return None;
                }
                // Binary/pong frames carry nothing for us.
                Ok(_) => {}
            }
        }
    }

    async fn send_frame(&mut self, text: String) -> anyhow::Result<()> {
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }
}

/// Poll session handshake response.
#[derive(Debug, Deserialize)]
struct PollSession {
    session: String,
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

/// One long-poll response: raw cable frames plus the next cursor.
#[derive(Debug, Deserialize)]
struct PollBatch {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
    cursor: u64,
}

/// HTTP long-poll fallback strategy.
///
/// Keeps the channel alive when the socket cannot be established (restrictive
/// proxies). Frames are fetched in batches from `/live/poll/{session}` and
/// sent via POST; the server replays the same cable message shapes the
/// socket carries, so normalization downstream is identical.
#[derive(Debug, Clone)]
pub struct LongPollTransport {
    client: reqwest::Client,
    /// Server-side hold time per poll request.
    poll_window: Duration,
}

impl Default for LongPollTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(25))
    }
}

impl LongPollTransport {
    /// Create a long-poll strategy holding each request open for
    /// `poll_window` at most.
    #[must_use]
    pub fn new(poll_window: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(poll_window + Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            poll_window,
        }
    }
}

#[async_trait]
impl Transport for LongPollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPoll
    }

    async fn open(
        &self,
        server_url: &str,
        bearer: &str,
    ) -> Result<Box<dyn TransportStream>, LiveError> {
        let url = format!("{server_url}/live/poll");
        log::debug!("opening long-poll session: {url}");

        let response = self
            .client
            .post(&url)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| LiveError::TransportUnavailable(format!("poll handshake: {e}")))?;

        if !response.status().is_success() {
            return Err(LiveError::TransportUnavailable(format!(
                "poll handshake: HTTP {}",
                response.status()
            )));
        }

        let session: PollSession = response
            .json()
            .await
            .map_err(|e| LiveError::TransportUnavailable(format!("poll handshake body: {e}")))?;

        let pending = session.messages.iter().map(ToString::to_string).collect();

        Ok(Box::new(LongPollFrames {
            client: self.client.clone(),
            base_url: server_url.to_string(),
            bearer: bearer.to_string(),
            session: session.session,
            cursor: 0,
            poll_window: self.poll_window,
            pending,
            closed: false,
        }))
    }
}

struct LongPollFrames {
    client: reqwest::Client,
    base_url: String,
    bearer: String,
    session: String,
    cursor: u64,
    poll_window: Duration,
    pending: std::collections::VecDeque<String>,
    closed: bool,
}

#[async_trait]
impl TransportStream for LongPollFrames {
    async fn next_frame(&mut self) -> Option<String> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            if self.closed {
                return None;
            }

            let url = format!(
                "{}/live/poll/{}?cursor={}&hold={}",
                self.base_url,
                self.session,
                self.cursor,
                self.poll_window.as_secs()
            );
            let response = match self.client.get(&url).bearer_auth(&self.bearer).send().await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("long-poll request failed: {e}");
                    self.closed = true;
                    return None;
                }
            };
            // 410 = the server dropped the session; treat as a transport drop.
            if response.status() == reqwest::StatusCode::GONE {
                log::info!("long-poll session expired");
                self.closed = true;
                return None;
            }
            if !response.status().is_success() {
                log::warn!("long-poll HTTP {}", response.status());
                self.closed = true;
                return None;
            }

            match response.json::<PollBatch>().await {
                Ok(batch) => {
                    self.cursor = batch.cursor;
                    self.pending
                        .extend(batch.messages.iter().map(ToString::to_string));
                    // Empty batch = the hold expired; poll again.
                }
                Err(e) => {
                    log::warn!("long-poll body: {e}");
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    async fn send_frame(&mut self, text: String) -> anyhow::Result<()> {
        let url = format!("{}/live/poll/{}/send", self.base_url, self.session);
        let body: serde_json::Value = serde_json::from_str(&text)?;
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.bearer)
            .json(&body)
            .send()
            .await?;
        anyhow::ensure!(
            response.status().is_success(),
            "poll send: HTTP {}",
            response.status()
        );
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::LongPoll
    }
}
