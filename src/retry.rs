//! Bounded retry with a fixed inter-attempt delay.
//!
//! Both the transport connection and the playback controller recover through
//! the same policy shape: a fixed maximum attempt count, a fixed (not
//! exponential) delay between attempts, and an optional per-attempt timeout.
//! When the budget is exhausted, automatic retrying stops and the caller must
//! act. This module is the single place that policy lives.

use std::future::Future;
use std::time::Duration;

/// A bounded retry policy: fixed attempt cap, fixed delay, optional
/// per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
    /// Per-attempt timeout. An attempt that neither succeeds nor fails
    /// within this window counts as a failed attempt.
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Policy with the given attempt cap and inter-attempt delay.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            attempt_timeout: None,
        }
    }

    /// Add a per-attempt timeout.
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Create an attempt counter for event-driven consumers (the playback
    /// state machine counts recovery attempts against its budget rather than
    /// looping).
    #[must_use]
    pub fn budget(&self) -> AttemptBudget {
        AttemptBudget {
            used: 0,
            cap: self.max_attempts,
        }
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted.
    ///
    /// `label` appears in log lines. Returns the last error when every
    /// attempt fails or times out.
    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_observed(label, op, |_, _| {}).await
    }

    /// Like [`RetryPolicy::run`], but calls `on_error` with the attempt
    /// number after each failed or timed-out attempt, before the inter-attempt
    /// delay. The transport uses this to surface per-attempt failures to
    /// status listeners while a reconnect is still in progress.
    pub async fn run_observed<T, E, F, Fut, O>(
        &self,
        label: &str,
        mut op: F,
        mut on_error: O,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        O: FnMut(u32, &RetryError<E>),
    {
        let mut last: Option<RetryError<E>> = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.delay).await;
            }

            let outcome = match self.attempt_timeout {
                Some(window) => match tokio::time::timeout(window, op(attempt)).await {
                    Ok(result) => result.map_err(RetryError::Failed),
                    Err(_) => Err(RetryError::AttemptTimedOut),
                },
                None => op(attempt).await.map_err(RetryError::Failed),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    match &e {
                        RetryError::AttemptTimedOut => {
                            log::warn!("{label}: attempt {attempt}/{} timed out", self.max_attempts);
                        }
                        RetryError::Failed(inner) => {
                            log::warn!(
                                "{label}: attempt {attempt}/{} failed: {inner}",
                                self.max_attempts
                            );
                        }
                    }
                    on_error(attempt, &e);
                    last = Some(e);
                }
            }
        }

        Err(last.unwrap_or(RetryError::AttemptTimedOut))
    }
}

/// Outcome of an exhausted retry run.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The final attempt returned this error.
    Failed(E),
    /// The final attempt exceeded the per-attempt timeout.
    AttemptTimedOut,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::AttemptTimedOut => write!(f, "attempt timed out"),
        }
    }
}

impl<E: std::fmt::Display + std::fmt::Debug> std::error::Error for RetryError<E> {}

/// Counts attempts against a fixed cap for event-driven recovery.
///
/// Unlike [`RetryPolicy::run`], which drives the loop itself, the playback
/// state machine is fed events from outside and only needs to know whether
/// another automatic recovery is still allowed.
#[derive(Debug, Clone, Copy)]
pub struct AttemptBudget {
    used: u32,
    cap: u32,
}

impl AttemptBudget {
    /// Consume one attempt. Returns `false` when the budget is exhausted,
    /// in which case the attempt must NOT be made.
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.cap {
            return false;
        }
        self.used += 1;
        true
    }

    /// Attempts consumed so far.
    #[must_use]
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Whether no further attempts remain.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.used >= self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_second_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        let result = policy
            .run("test", |_attempt| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 2 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        let result: Result<(), _> = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope") }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let policy =
            RetryPolicy::new(2, Duration::from_millis(10)).with_attempt_timeout(Duration::from_millis(50));

        let result: Result<(), RetryError<&str>> = policy
            .run("test", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(RetryError::AttemptTimedOut)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_each_failed_attempt() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let mut seen = Vec::new();

        let result: Result<(), _> = policy
            .run_observed(
                "test",
                |_| async { Err("nope") },
                |attempt, _err| seen.push(attempt),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_attempt_budget_cap() {
        let mut budget = RetryPolicy::new(2, Duration::ZERO).budget();
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert!(budget.exhausted());
        assert_eq!(budget.used(), 2);
    }
}
