//! Tunables for the live connectivity core.
//!
//! All retry caps, delays, and thresholds live here so tests can tighten
//! them. Values can be overridden per-process via `STATIONLINK_*`
//! environment variables; the hosting application owns any persistence.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Configuration for connection and playback resilience.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LiveConfig {
    /// Base URL of the realtime backend (e.g. `https://station.example.com`).
    pub server_url: String,
    /// Seconds a single connection attempt may stay pending before it is
    /// treated as failed (fixed window, not exponential).
    pub connect_timeout_secs: u64,
    /// Attempts allowed per `connect()` call before giving up.
    pub connect_attempts: u32,
    /// Automatic reconnection attempts after an unexpected drop.
    pub reconnect_attempts: u32,
    /// Fixed delay in milliseconds between reconnection attempts.
    pub reconnect_delay_ms: u64,
    /// Seconds between opportunistic upgrade attempts while running on a
    /// fallback transport.
    pub upgrade_retry_secs: u64,
    /// Seconds without any inbound frame (including server pings) before the
    /// socket is considered stale and dropped.
    pub stale_timeout_secs: u64,
    /// Automatic recovery attempts allowed per playback session.
    pub max_recovery_attempts: u32,
    /// Minimum seconds of buffered-ahead media; sustained readings below
    /// this trigger a stall.
    pub min_buffer_ahead_secs: f64,
    /// Consecutive low readings required before declaring a stall
    /// (filters out single-sample jitter).
    pub stall_samples: u32,
    /// Seconds a stall may last before escalating to active recovery.
    pub stall_timeout_secs: u64,
    /// Seconds an in-place network resume may run without forward progress
    /// before escalating to a full source reload.
    pub recovery_window_secs: u64,
    /// Capacity of the per-session classified error ring.
    pub error_history_len: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            server_url: "https://localhost:3000".to_string(),
            connect_timeout_secs: 10,
            connect_attempts: 3,
            reconnect_attempts: 5,
            reconnect_delay_ms: 3000,
            upgrade_retry_secs: 30,
            stale_timeout_secs: 15,
            max_recovery_attempts: 4,
            min_buffer_ahead_secs: 2.0,
            stall_samples: 3,
            stall_timeout_secs: 8,
            recovery_window_secs: 6,
            error_history_len: 16,
        }
    }
}

impl LiveConfig {
    /// Load defaults with `STATIONLINK_*` environment overrides applied.
    #[must_use]
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("STATIONLINK_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(v) = env_parse("STATIONLINK_CONNECT_TIMEOUT_SECS") {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = env_parse("STATIONLINK_CONNECT_ATTEMPTS") {
            self.connect_attempts = v;
        }
        if let Some(v) = env_parse("STATIONLINK_RECONNECT_ATTEMPTS") {
            self.reconnect_attempts = v;
        }
        if let Some(v) = env_parse("STATIONLINK_RECONNECT_DELAY_MS") {
            self.reconnect_delay_ms = v;
        }
        if let Some(v) = env_parse("STATIONLINK_MAX_RECOVERY_ATTEMPTS") {
            self.max_recovery_attempts = v;
        }
    }

    /// Policy for the initial `connect()` call.
    #[must_use]
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_attempts,
            Duration::from_millis(self.reconnect_delay_ms),
        )
        .with_attempt_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    /// Policy for automatic reconnection after a drop.
    #[must_use]
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.reconnect_attempts,
            Duration::from_millis(self.reconnect_delay_ms),
        )
        .with_attempt_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    /// Budget-only policy for playback recovery (event-driven, no loop).
    #[must_use]
    pub fn recovery_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_recovery_attempts,
            Duration::from_secs(self.recovery_window_secs),
        )
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LiveConfig::default();
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay_ms, 3000);
        assert_eq!(config.max_recovery_attempts, 4);
        assert!(config.min_buffer_ahead_secs > 0.0);
    }

    #[test]
    fn test_policies_reflect_config() {
        let config = LiveConfig {
            connect_attempts: 7,
            reconnect_delay_ms: 1234,
            ..LiveConfig::default()
        };
        let policy = config.connect_policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.delay, Duration::from_millis(1234));
        assert!(policy.attempt_timeout.is_some());
    }
}
