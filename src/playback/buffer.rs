//! Buffer look-ahead gauge.
//!
//! A single dip below the minimum look-ahead is jitter, not a stall; only a
//! sustained run of low readings should move the session to `stalled`. The
//! gauge counts consecutive low samples and reports the first one that
//! crosses the configured run length.

/// Classification of one buffer-health sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferReading {
    /// At or above the minimum look-ahead.
    Healthy,
    /// Below minimum, but not yet long enough to call a stall.
    LowTransient,
    /// Below minimum for the configured run length; stall confirmed.
    SustainedLow,
}

/// Counts consecutive low look-ahead samples.
#[derive(Debug, Clone)]
pub struct BufferGauge {
    min_ahead_secs: f64,
    samples_needed: u32,
    low_run: u32,
}

impl BufferGauge {
    /// Gauge declaring a stall after `samples_needed` consecutive readings
    /// below `min_ahead_secs`.
    #[must_use]
    pub fn new(min_ahead_secs: f64, samples_needed: u32) -> Self {
        Self {
            min_ahead_secs,
            samples_needed: samples_needed.max(1),
            low_run: 0,
        }
    }

    /// Feed one sample of buffered-ahead seconds.
    pub fn observe(&mut self, buffered_ahead_secs: f64) -> BufferReading {
        if buffered_ahead_secs >= self.min_ahead_secs {
            self.low_run = 0;
            return BufferReading::Healthy;
        }
        self.low_run += 1;
        if self.low_run == self.samples_needed {
            BufferReading::SustainedLow
        } else if self.low_run > self.samples_needed {
            // Already reported; don't re-trigger every sample.
            BufferReading::LowTransient
        } else {
            BufferReading::LowTransient
        }
    }

    /// Forget any accumulated low run (source changed, recovery succeeded).
    pub fn reset(&mut self) {
        self.low_run = 0;
    }
}
