//! Live playback resilience.
//!
//! # Architecture
//!
//! ```text
//! PlaybackController (async driver, timers, generation counter)
//!   ├── PlaybackSession (pure state machine, playback/session.rs)
//!   ├── BufferGauge     (sustained-low detection, playback/buffer.rs)
//!   └── dyn MediaPipeline (host-provided media surface)
//! ```
//!
//! The controller owns one [`PlaybackSession`] per player surface, runs its
//! timers, samples the pipeline's buffer, and executes the effects the
//! machine emits. Every event is tagged with a generation number; events
//! from a closed session generation are discarded, so a transition that was
//! in flight when the caller closed the session can never fire afterwards.

mod buffer;
mod session;

pub use buffer::{BufferGauge, BufferReading};
pub use session::{
    Effect, MediaErrorKind, PlaybackSession, SessionEvent, SessionState, SourceKind, StatusNote,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::LiveConfig;

/// Seconds between buffered-ahead samples while a source is mounted.
const BUFFER_SAMPLE_SECS: u64 = 1;

/// Host-provided media surface the controller drives.
///
/// Implementations wrap whatever actually plays media (an adaptive stream
/// engine, a native pipeline). Methods should return quickly; long-running
/// work belongs behind the implementation's own tasks.
#[async_trait]
pub trait MediaPipeline: Send + Sync {
    /// Attach and begin loading `url`.
    async fn load(&self, url: &str) -> anyhow::Result<()>;

    /// Tear down and reload the current source from scratch.
    async fn reload(&self) -> anyhow::Result<()>;

    /// Resume in place without reloading (network interruption path).
    async fn resume(&self) -> anyhow::Result<()>;

    /// Run the pipeline's own recovery primitive (decode path).
    async fn recover(&self) -> anyhow::Result<()>;

    /// Release native resources.
    async fn detach(&self);

    /// Seconds of media buffered ahead of the play head.
    async fn buffered_ahead(&self) -> f64;
}

struct Inner {
    config: LiveConfig,
    pipeline: Arc<dyn MediaPipeline>,
    session: StdMutex<PlaybackSession>,
    /// Bumped on close; events tagged with an older value are stale.
    generation: AtomicU64,
    event_tx: mpsc::UnboundedSender<(u64, SessionEvent)>,
    status_tx: watch::Sender<StatusNote>,
    timers: StdMutex<Vec<JoinHandle<()>>>,
    sampler: StdMutex<Option<JoinHandle<()>>>,
}

/// Async driver for one player surface.
///
/// Cheap to clone; all clones share the same session. Host callbacks
/// (`first_frame`, `media_error`, ...) are synchronous and non-blocking so
/// they can be called from any context.
#[derive(Clone)]
pub struct PlaybackController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackController")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PlaybackController {
    /// Create a controller around `pipeline` and start its event loop.
    #[must_use]
    pub fn new(config: &LiveConfig, pipeline: Arc<dyn MediaPipeline>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(StatusNote {
            state: SessionState::Idle,
            detail: None,
            needs_action: false,
        });
        let inner = Arc::new(Inner {
            config: config.clone(),
            pipeline,
            session: StdMutex::new(PlaybackSession::new(config)),
            generation: AtomicU64::new(0),
            event_tx,
            status_tx,
            timers: StdMutex::new(Vec::new()),
            sampler: StdMutex::new(None),
        });
        // The loop holds only a weak handle so dropping the last controller
        // clone shuts everything down.
        tokio::spawn(event_loop(Arc::downgrade(&inner), event_rx));
        Self { inner }
    }

    /// Mount a source on the (idle) session.
    pub fn open(&self, url: impl Into<String>, kind: SourceKind) {
        self.send(SessionEvent::Open {
            url: url.into(),
            kind,
        });
    }

    /// Caller-initiated retry from `Failed`; opens a fresh recovery budget.
    pub fn retry(&self) {
        self.send(SessionEvent::Retry);
    }

    /// Tear the session down. Transitions still in flight for the old
    /// session are discarded.
    pub fn close(&self) {
        // Bump first so queued events from the old generation go stale,
        // then deliver the close under the new generation.
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.inner.event_tx.send((generation, SessionEvent::Close));
    }

    /// Host callback: first decodable frame rendered.
    pub fn first_frame(&self) {
        self.send(SessionEvent::FirstFrameReady);
    }

    /// Host callback: classified pipeline error.
    pub fn media_error(&self, kind: MediaErrorKind) {
        self.send(SessionEvent::MediaError(kind));
    }

    /// Host callback: an in-flight recovery restored forward progress.
    pub fn progressed(&self) {
        self.send(SessionEvent::RecoverySucceeded);
    }

    /// Host callback: a third-party embed failed to load.
    pub fn embed_failed(&self) {
        self.send(SessionEvent::EmbedFailed);
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.session.lock().expect("session lock poisoned").state()
    }

    /// Watch handle for user-facing status changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<StatusNote> {
        self.inner.status_tx.subscribe()
    }

    /// Bounded ring of classified errors for this session, oldest first.
    #[must_use]
    pub fn error_history(&self) -> Vec<MediaErrorKind> {
        self.inner
            .session
            .lock()
            .expect("session lock poisoned")
            .error_history()
    }

    fn send(&self, event: SessionEvent) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let _ = self.inner.event_tx.send((generation, event));
    }
}

async fn event_loop(
    inner: Weak<Inner>,
    mut event_rx: mpsc::UnboundedReceiver<(u64, SessionEvent)>,
) {
    while let Some((generation, event)) = event_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if generation != inner.generation.load(Ordering::SeqCst) {
            log::debug!("discarding stale playback event {event:?}");
            continue;
        }
        let effects = inner
            .session
            .lock()
            .expect("session lock poisoned")
            .handle(event);
        execute(&inner, generation, effects).await;
    }
}

async fn execute(inner: &Arc<Inner>, generation: u64, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Load(url) => {
                if let Err(err) = inner.pipeline.load(&url).await {
                    log::error!("source load failed: {err:#}");
                    let _ = inner
                        .event_tx
                        .send((generation, SessionEvent::MediaError(MediaErrorKind::Network)));
                } else {
                    start_sampler(inner, generation);
                }
            }
            Effect::Reload => {
                if let Err(err) = inner.pipeline.reload().await {
                    log::error!("source reload failed: {err:#}");
                    let _ = inner
                        .event_tx
                        .send((generation, SessionEvent::RecoveryTimeout));
                }
            }
            Effect::ResumeInPlace => {
                if let Err(err) = inner.pipeline.resume().await {
                    log::warn!("in-place resume failed: {err:#}");
                }
            }
            Effect::RecoverPipeline => {
                if let Err(err) = inner.pipeline.recover().await {
                    log::warn!("pipeline recovery failed: {err:#}");
                }
            }
            Effect::Detach => {
                stop_sampler(inner);
                inner.pipeline.detach().await;
            }
            Effect::StartLoadTimer => start_timer(
                inner,
                generation,
                Duration::from_secs(inner.config.connect_timeout_secs),
                SessionEvent::LoadTimeout,
            ),
            Effect::StartStallTimer => start_timer(
                inner,
                generation,
                Duration::from_secs(inner.config.stall_timeout_secs),
                SessionEvent::StallTimeout,
            ),
            Effect::StartRecoveryTimer => start_timer(
                inner,
                generation,
                Duration::from_secs(inner.config.recovery_window_secs),
                SessionEvent::RecoveryTimeout,
            ),
            Effect::CancelTimers => cancel_timers(inner),
            Effect::Notify(note) => {
                log::info!(
                    "playback status: {:?}{}",
                    note.state,
                    note.detail
                        .as_deref()
                        .map(|d| format!(" ({d})"))
                        .unwrap_or_default()
                );
                let _ = inner.status_tx.send(note);
            }
        }
    }
}

fn start_timer(inner: &Arc<Inner>, generation: u64, after: Duration, event: SessionEvent) {
    let tx = inner.event_tx.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send((generation, event));
    });
    let mut timers = inner.timers.lock().expect("timers lock poisoned");
    timers.retain(|t| !t.is_finished());
    timers.push(handle);
}

fn cancel_timers(inner: &Arc<Inner>) {
    for handle in inner.timers.lock().expect("timers lock poisoned").drain(..) {
        handle.abort();
    }
}

fn start_sampler(inner: &Arc<Inner>, generation: u64) {
    let pipeline = Arc::clone(&inner.pipeline);
    let tx = inner.event_tx.clone();
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(BUFFER_SAMPLE_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let ahead = pipeline.buffered_ahead().await;
            if tx.send((generation, SessionEvent::BufferSample(ahead))).is_err() {
                break;
            }
        }
    });
    if let Some(old) = inner
        .sampler
        .lock()
        .expect("sampler lock poisoned")
        .replace(handle)
    {
        old.abort();
    }
}

fn stop_sampler(inner: &Arc<Inner>) {
    if let Some(handle) = inner.sampler.lock().expect("sampler lock poisoned").take() {
        handle.abort();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for handle in self.timers.lock().expect("timers lock poisoned").drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.sampler.lock().expect("sampler lock poisoned").take() {
            handle.abort();
        }
    }
}
