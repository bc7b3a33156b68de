//! Playback session state machine.
//!
//! Pure and synchronous: events in, effects out. The async controller in
//! [`super`] owns timers and the media pipeline and feeds events here; this
//! separation keeps every transition deterministic and testable without a
//! runtime.
//!
//! ```text
//! idle --open(source)--> loading
//! loading --firstFrameReady--> playing
//! loading --timeout/unsupportedSource--> failed
//! playing --bufferBelowThreshold--> stalled
//! stalled --bufferRecovered--> playing
//! stalled --stallTimeout--> recovering
//! recovering --resourceReattached--> playing
//! recovering --recoveryExhausted--> failed
//! any --explicitClose()--> idle
//! failed --retry()--> loading      (caller-initiated only)
//! ```

use std::collections::VecDeque;

use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::retry::AttemptBudget;

use super::buffer::{BufferGauge, BufferReading};

/// How the source should be played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Segmented-manifest stream driven through the full resilience machine.
    Adaptive,
    /// Opaque third-party embed; only idle/playing/failed apply.
    Embedded,
    /// Cannot be played at all.
    Unsupported,
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Loading,
    Playing,
    Stalled,
    Recovering,
    Failed,
}

/// Classified media error buckets; the recovery policy differs per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorKind {
    /// Connectivity interruption; in-place resume first, one reload after.
    Network,
    /// Pipeline decode failure; pipeline recovery first, reload on repeat.
    Decode,
    /// Source format the pipeline cannot play; terminal.
    UnsupportedFormat,
    /// Caller-intended interruption; silent, no retry.
    Aborted,
}

/// Which recovery mechanism is currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryStep {
    ResumeInPlace,
    PipelineRecover,
    Reload,
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Mount a source on an idle session.
    Open { url: String, kind: SourceKind },
    /// First decodable frame is on screen.
    FirstFrameReady,
    /// Loading exceeded its window.
    LoadTimeout,
    /// Periodic buffered-ahead reading in seconds.
    BufferSample(f64),
    /// A stall lasted past the stall window.
    StallTimeout,
    /// Classified pipeline error.
    MediaError(MediaErrorKind),
    /// The in-flight recovery step restored forward progress.
    RecoverySucceeded,
    /// The in-flight recovery step ran out of time.
    RecoveryTimeout,
    /// Third-party embed failed to load (embedded sources only).
    EmbedFailed,
    /// Caller-initiated retry from `Failed`.
    Retry,
    /// Explicit teardown; terminal for the session.
    Close,
}

/// Side effects the controller must execute.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Attach and load the source.
    Load(String),
    /// Full source reload.
    Reload,
    /// In-place resume without reloading (network bucket).
    ResumeInPlace,
    /// Pipeline-specific recovery primitive (decode bucket).
    RecoverPipeline,
    /// Release native pipeline resources.
    Detach,
    StartLoadTimer,
    StartStallTimer,
    StartRecoveryTimer,
    /// Cancel every pending timer for this session.
    CancelTimers,
    /// User-facing status change.
    Notify(StatusNote),
}

/// User-facing status: distinguishes "still trying" from "needs your action".
#[derive(Debug, Clone, PartialEq)]
pub struct StatusNote {
    pub state: SessionState,
    pub detail: Option<String>,
    /// True only for terminal failures that require a caller retry.
    pub needs_action: bool,
}

impl StatusNote {
    fn trying(state: SessionState, detail: impl Into<Option<String>>) -> Self {
        Self {
            state,
            detail: detail.into(),
            needs_action: false,
        }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self {
            state: SessionState::Failed,
            detail: Some(detail.into()),
            needs_action: true,
        }
    }
}

/// One player surface's resilience state machine.
#[derive(Debug)]
pub struct PlaybackSession {
    state: SessionState,
    source_url: Option<String>,
    source_kind: Option<SourceKind>,
    gauge: BufferGauge,
    budget: AttemptBudget,
    decode_errors: u32,
    /// Set while a network resume is being tried inside `Stalled`.
    resume_in_flight: bool,
    recovery_step: Option<RecoveryStep>,
    error_history: VecDeque<MediaErrorKind>,
    history_cap: usize,
    config: LiveConfig,
}

impl PlaybackSession {
    /// New idle session with the given tunables.
    #[must_use]
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            state: SessionState::Idle,
            source_url: None,
            source_kind: None,
            gauge: BufferGauge::new(config.min_buffer_ahead_secs, config.stall_samples),
            budget: config.recovery_policy().budget(),
            decode_errors: 0,
            resume_in_flight: false,
            recovery_step: None,
            error_history: VecDeque::new(),
            history_cap: config.error_history_len,
            config: config.clone(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Source URL, if a source is mounted.
    #[must_use]
    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    /// Bounded ring of classified errors, oldest first.
    #[must_use]
    pub fn error_history(&self) -> Vec<MediaErrorKind> {
        self.error_history.iter().copied().collect()
    }

    /// Automatic recovery attempts consumed so far.
    #[must_use]
    pub fn recovery_attempts(&self) -> u32 {
        self.budget.used()
    }

    /// Apply one event, returning the effects to execute.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        // Embedded sources are opaque: no buffer sampling, no classification.
        if self.source_kind == Some(SourceKind::Embedded)
            && !matches!(
                event,
                SessionEvent::Open { .. }
                    | SessionEvent::EmbedFailed
                    | SessionEvent::Retry
                    | SessionEvent::Close
            )
        {
            return Vec::new();
        }

        match event {
            SessionEvent::Open { url, kind } => self.on_open(url, kind),
            SessionEvent::FirstFrameReady => self.on_first_frame(),
            SessionEvent::LoadTimeout => self.on_load_timeout(),
            SessionEvent::BufferSample(secs) => self.on_buffer_sample(secs),
            SessionEvent::StallTimeout => self.on_stall_timeout(),
            SessionEvent::MediaError(kind) => self.on_media_error(kind),
            SessionEvent::RecoverySucceeded => self.on_recovery_succeeded(),
            SessionEvent::RecoveryTimeout => self.on_recovery_timeout(),
            SessionEvent::EmbedFailed => self.on_embed_failed(),
            SessionEvent::Retry => self.on_retry(),
            SessionEvent::Close => self.on_close(),
        }
    }

    fn on_open(&mut self, url: String, kind: SourceKind) -> Vec<Effect> {
        if self.state != SessionState::Idle {
            log::warn!("open ignored in state {:?}", self.state);
            return Vec::new();
        }
        self.reset_counters();
        self.error_history.clear();
        self.source_url = Some(url.clone());
        self.source_kind = Some(kind);

        match kind {
            SourceKind::Adaptive => {
                self.state = SessionState::Loading;
                vec![
                    Effect::Load(url),
                    Effect::StartLoadTimer,
                    Effect::Notify(StatusNote::trying(SessionState::Loading, None)),
                ]
            }
            SourceKind::Embedded => {
                // Opaque embed: mount and assume playing until told otherwise.
                self.state = SessionState::Playing;
                vec![
                    Effect::Load(url),
                    Effect::Notify(StatusNote::trying(SessionState::Playing, None)),
                ]
            }
            SourceKind::Unsupported => {
                self.record_error(MediaErrorKind::UnsupportedFormat);
                self.state = SessionState::Failed;
                vec![Effect::Notify(StatusNote::failed(
                    LiveError::MediaUnsupported("adaptive stream playback".to_string())
                        .to_string(),
                ))]
            }
        }
    }

    fn on_first_frame(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Loading {
            return Vec::new();
        }
        self.state = SessionState::Playing;
        vec![
            Effect::CancelTimers,
            Effect::Notify(StatusNote::trying(SessionState::Playing, None)),
        ]
    }

    fn on_load_timeout(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Loading {
            return Vec::new();
        }
        self.state = SessionState::Failed;
        vec![
            Effect::CancelTimers,
            Effect::Detach,
            Effect::Notify(StatusNote::failed("stream took too long to start")),
        ]
    }

    fn on_buffer_sample(&mut self, secs: f64) -> Vec<Effect> {
        match self.state {
            SessionState::Playing => match self.gauge.observe(secs) {
                BufferReading::SustainedLow => {
                    self.state = SessionState::Stalled;
                    vec![
                        Effect::StartStallTimer,
                        Effect::Notify(StatusNote::trying(
                            SessionState::Stalled,
                            Some("buffering".to_string()),
                        )),
                    ]
                }
                BufferReading::Healthy | BufferReading::LowTransient => Vec::new(),
            },
            SessionState::Stalled => {
                if secs >= self.config.min_buffer_ahead_secs {
                    // bufferRecovered: back to playing without recovery.
                    self.state = SessionState::Playing;
                    self.gauge.reset();
                    self.resume_in_flight = false;
                    vec![
                        Effect::CancelTimers,
                        Effect::Notify(StatusNote::trying(SessionState::Playing, None)),
                    ]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_stall_timeout(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Stalled {
            return Vec::new();
        }
        // If an in-place resume already ran during the stall window, the
        // network policy's next (and last) automatic step is a full reload.
        let step = if self.resume_in_flight {
            RecoveryStep::Reload
        } else {
            RecoveryStep::ResumeInPlace
        };
        self.enter_recovery(step)
    }

    fn on_media_error(&mut self, kind: MediaErrorKind) -> Vec<Effect> {
        if matches!(self.state, SessionState::Idle | SessionState::Failed) {
            return Vec::new();
        }
        self.record_error(kind);

        match kind {
            MediaErrorKind::Aborted => {
                // Caller-intended: no retry, no user-facing error.
                self.teardown();
                vec![Effect::CancelTimers, Effect::Detach]
            }
            MediaErrorKind::UnsupportedFormat => {
                self.state = SessionState::Failed;
                vec![
                    Effect::CancelTimers,
                    Effect::Detach,
                    Effect::Notify(StatusNote::failed(
                        LiveError::MediaUnsupported("adaptive stream playback".to_string())
                            .to_string(),
                    )),
                ]
            }
            MediaErrorKind::Network => {
                if self.state == SessionState::Recovering {
                    // Another drop mid-recovery escalates.
                    return self.on_recovery_timeout();
                }
                // In-place resume without leaving the stall path; the buffer
                // either recovers in the stall window (back to playing,
                // never recovering) or the stall timer escalates.
                if !self.budget.try_consume() {
                    return self.fail_exhausted();
                }
                self.state = SessionState::Stalled;
                self.resume_in_flight = true;
                vec![
                    Effect::ResumeInPlace,
                    Effect::StartStallTimer,
                    Effect::Notify(StatusNote::trying(
                        SessionState::Stalled,
                        Some("connection interrupted, resuming".to_string()),
                    )),
                ]
            }
            MediaErrorKind::Decode => {
                self.decode_errors += 1;
                let step = if self.decode_errors >= 2 {
                    // Second decode failure this session: full reload.
                    RecoveryStep::Reload
                } else {
                    RecoveryStep::PipelineRecover
                };
                self.enter_recovery(step)
            }
        }
    }

    fn on_recovery_succeeded(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Recovering {
            return Vec::new();
        }
        self.state = SessionState::Playing;
        self.recovery_step = None;
        self.resume_in_flight = false;
        self.gauge.reset();
        vec![
            Effect::CancelTimers,
            Effect::Notify(StatusNote::trying(SessionState::Playing, None)),
        ]
    }

    fn on_recovery_timeout(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Recovering {
            return Vec::new();
        }
        match self.recovery_step {
            // Lightweight step stalled out: escalate to one full reload.
            Some(RecoveryStep::ResumeInPlace | RecoveryStep::PipelineRecover) => {
                self.enter_recovery(RecoveryStep::Reload)
            }
            // The reload itself failed: recovery is exhausted.
            Some(RecoveryStep::Reload) | None => self.fail_exhausted(),
        }
    }

    fn on_embed_failed(&mut self) -> Vec<Effect> {
        if self.source_kind != Some(SourceKind::Embedded) || self.state != SessionState::Playing {
            return Vec::new();
        }
        self.state = SessionState::Failed;
        vec![Effect::Notify(StatusNote::failed("embed failed to load"))]
    }

    fn on_retry(&mut self) -> Vec<Effect> {
        if self.state != SessionState::Failed {
            return Vec::new();
        }
        let (Some(url), Some(kind)) = (self.source_url.clone(), self.source_kind) else {
            return Vec::new();
        };
        // A caller-sanctioned retry opens a fresh automatic-recovery cycle.
        self.reset_counters();

        match kind {
            SourceKind::Adaptive => {
                self.state = SessionState::Loading;
                vec![
                    Effect::Load(url),
                    Effect::StartLoadTimer,
                    Effect::Notify(StatusNote::trying(SessionState::Loading, None)),
                ]
            }
            SourceKind::Embedded => {
                self.state = SessionState::Playing;
                vec![
                    Effect::Load(url),
                    Effect::Notify(StatusNote::trying(SessionState::Playing, None)),
                ]
            }
            SourceKind::Unsupported => vec![Effect::Notify(StatusNote::failed(
                LiveError::MediaUnsupported("adaptive stream playback".to_string()).to_string(),
            ))],
        }
    }

    fn on_close(&mut self) -> Vec<Effect> {
        self.teardown();
        vec![
            Effect::CancelTimers,
            Effect::Detach,
            Effect::Notify(StatusNote::trying(SessionState::Idle, None)),
        ]
    }

    /// Move to `Recovering` running `step`, spending one automatic attempt.
    fn enter_recovery(&mut self, step: RecoveryStep) -> Vec<Effect> {
        if !self.budget.try_consume() {
            return self.fail_exhausted();
        }
        self.state = SessionState::Recovering;
        self.recovery_step = Some(step);
        let action = match step {
            RecoveryStep::ResumeInPlace => Effect::ResumeInPlace,
            RecoveryStep::PipelineRecover => Effect::RecoverPipeline,
            RecoveryStep::Reload => Effect::Reload,
        };
        vec![
            Effect::CancelTimers,
            action,
            Effect::StartRecoveryTimer,
            Effect::Notify(StatusNote::trying(
                SessionState::Recovering,
                Some("recovering playback".to_string()),
            )),
        ]
    }

    fn fail_exhausted(&mut self) -> Vec<Effect> {
        self.state = SessionState::Failed;
        self.recovery_step = None;
        vec![
            Effect::CancelTimers,
            Effect::Detach,
            Effect::Notify(StatusNote::failed("playback could not be recovered")),
        ]
    }

    fn record_error(&mut self, kind: MediaErrorKind) {
        if self.error_history.len() == self.history_cap {
            self.error_history.pop_front();
        }
        self.error_history.push_back(kind);
    }

    fn reset_counters(&mut self) {
        self.budget = self.config.recovery_policy().budget();
        self.decode_errors = 0;
        self.resume_in_flight = false;
        self.recovery_step = None;
        self.gauge.reset();
    }

    fn teardown(&mut self) {
        self.state = SessionState::Idle;
        self.source_url = None;
        self.source_kind = None;
        self.reset_counters();
    }
}
