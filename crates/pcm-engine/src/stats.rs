use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the delivery loop.
///
/// Shared through an `Arc` so a status reporter on another thread can read them while the
/// loop runs. All counters use relaxed ordering; values are diagnostics, not coordination.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Negotiated output rate in Hz, used for elapsed time.
    sample_rate: AtomicU32,
    /// Frames accepted by the device.
    frames_written: AtomicU64,
    /// Completed wait → write cycles.
    cycles: AtomicU64,
    /// Wakeups that reported no free frames.
    empty_wakeups: AtomicU64,
    wait_timeouts: AtomicU64,
    underrun_events: AtomicU64,
    /// Underruns recovered by re-preparing the device.
    recoveries: AtomicU64,
    /// Producer fills that returned fewer frames than requested.
    short_fills: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sample_rate: Option<u32>,
    pub elapsed_ms: Option<u64>,
    pub frames_written: u64,
    pub cycles: u64,
    pub empty_wakeups: u64,
    pub wait_timeouts: u64,
    pub underrun_events: u64,
    pub recoveries: u64,
    pub short_fills: u64,
}

impl EngineStats {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_sample_rate(&self, rate_hz: u32) {
        self.sample_rate.store(rate_hz, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, frames: usize) {
        self.frames_written.fetch_add(frames as u64, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_empty_wakeup(&self) {
        self.empty_wakeups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_underrun(&self) {
        self.underrun_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_short_fill(&self) {
        self.short_fills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let sample_rate = match self.sample_rate.load(Ordering::Relaxed) {
            0 => None,
            sr => Some(sr),
        };
        let frames_written = self.frames_written.load(Ordering::Relaxed);
        StatsSnapshot {
            sample_rate,
            elapsed_ms: sample_rate.map(|sr| frames_written.saturating_mul(1000) / sr as u64),
            frames_written,
            cycles: self.cycles.load(Ordering::Relaxed),
            empty_wakeups: self.empty_wakeups.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            underrun_events: self.underrun_events.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            short_fills: self.short_fills.load(Ordering::Relaxed),
        }
    }
}
