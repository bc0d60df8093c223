//! Processor statistics.
//!
//! Monotonic counters and gauges updated atomically by workers, plus an
//! exponentially-weighted moving average of handler duration. A `Stats`
//! snapshot is cheap and safe to take from any thread at any time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct ProcessorStats {
    processed: AtomicU64,
    fails: AtomicU64,
    retries: AtomicU64,
    in_flight: AtomicU64,
    deleting: AtomicU64,
    avg_duration_ns: AtomicU64,
}

impl ProcessorStats {
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail(&self) {
        self.fails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn incr_deleting(&self) {
        self.deleting.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_deleting(&self) {
        self.deleting.fetch_sub(1, Ordering::Relaxed);
    }

    /// Fold one handler duration into the moving average (alpha = 1/8).
    pub fn observe_duration(&self, elapsed: Duration) {
        let sample = elapsed.as_nanos() as u64;
        let old = self.avg_duration_ns.load(Ordering::Relaxed);
        let new = if old == 0 {
            sample
        } else {
            old - old / 8 + sample / 8
        };
        self.avg_duration_ns.store(new, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            processed: self.processed.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            deleting: self.deleting.load(Ordering::Relaxed),
            avg_duration: Duration::from_nanos(self.avg_duration_ns.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time view of a processor's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub processed: u64,
    pub fails: u64,
    pub retries: u64,
    pub in_flight: u64,
    pub deleting: u64,
    pub avg_duration: Duration,
}
