//! Queue configuration.
//!
//! `QueueOptions` is filled by the caller, normalized once by `init`, and
//! treated as immutable afterwards. Zero-valued fields mean "use the
//! default", mirroring how job options default in adapters.

use std::sync::Arc;
use std::time::Duration;

use crate::codec::Codec;
use crate::handler::{FallbackHandler, Handler};
use crate::limiter::RateLimit;
use crate::processor::Tracer;
use crate::store::KvStore;

/// Computes the redelivery delay for a failed message from its reserved
/// count and the configured backoff bounds.
pub type DelayFn = dyn Fn(u32, Duration, Duration) -> Duration + Send + Sync;

#[derive(Clone, Default)]
pub struct QueueOptions {
    /// Queue name. Required.
    pub name: String,

    /// Consumer group name. Defaults to the queue name.
    pub group_name: String,

    /// Bound of the ready FIFO in the memory queue. Default 1000.
    pub buffer_size: usize,

    /// Concurrent handler invocations. Default 4x available parallelism.
    pub worker_count: usize,

    /// Backend lease duration for reserved messages. Default 60 s.
    pub reservation_timeout: Duration,

    /// Long-poll wait for reservations, and the producer block timeout on a
    /// full buffer. Default 10 s.
    pub wait_timeout: Duration,

    /// Reservations after which a failing message goes to the fallback.
    /// Default 8.
    pub retry_limit: u32,

    /// First retry backoff. Default 500 ms.
    pub min_backoff: Duration,

    /// Backoff ceiling. Default 30 min.
    pub max_backoff: Duration,

    /// Pre-dispatch token budget shared through the store. None disables
    /// rate limiting.
    pub rate_limit: Option<RateLimit>,

    /// Consecutive failures before the fetcher pauses. Default 10.
    pub pause_error_count: u32,

    pub handler: Option<Arc<dyn Handler>>,
    pub fallback_handler: Option<Arc<dyn FallbackHandler>>,

    /// Overrides the default exponential-with-jitter redelivery delay.
    pub redelivery_delay: Option<Arc<DelayFn>>,

    pub codec: Codec,

    /// Gzip the encoded body at enqueue.
    pub compress: bool,

    /// Shared store for rate limiting and name dedup. None disables rate
    /// limiting and drops dedup to process-local scope.
    pub store: Option<Arc<dyn KvStore>>,

    pub tracer: Option<Arc<dyn Tracer>>,
}

impl QueueOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Fill zero-valued fields with defaults. Idempotent.
    pub fn init(&mut self) {
        if self.group_name.is_empty() {
            self.group_name = self.name.clone();
        }
        if self.buffer_size == 0 {
            self.buffer_size = 1000;
        }
        if self.worker_count == 0 {
            self.worker_count = default_worker_count();
        }
        if self.reservation_timeout.is_zero() {
            self.reservation_timeout = Duration::from_secs(60);
        }
        if self.wait_timeout.is_zero() {
            self.wait_timeout = Duration::from_secs(10);
        }
        if self.retry_limit == 0 {
            self.retry_limit = 8;
        }
        if self.min_backoff.is_zero() {
            self.min_backoff = Duration::from_millis(500);
        }
        if self.max_backoff.is_zero() {
            self.max_backoff = Duration::from_secs(30 * 60);
        }
        if self.pause_error_count == 0 {
            self.pause_error_count = 10;
        }
    }

    /// Fetcher pause after sustained failure: a minute, or the backoff
    /// ceiling if that is shorter.
    pub(crate) fn pause_duration(&self) -> Duration {
        self.max_backoff.min(Duration::from_secs(60))
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_fills_defaults() {
        let mut opt = QueueOptions::new("q");
        opt.init();

        assert_eq!(opt.group_name, "q");
        assert_eq!(opt.buffer_size, 1000);
        assert!(opt.worker_count > 0);
        assert_eq!(opt.retry_limit, 8);
        assert_eq!(opt.wait_timeout, Duration::from_secs(10));
        assert_eq!(opt.pause_error_count, 10);
    }

    #[test]
    fn init_keeps_explicit_values() {
        let mut opt = QueueOptions::new("q");
        opt.worker_count = 2;
        opt.retry_limit = 3;
        opt.min_backoff = Duration::from_secs(1);
        opt.init();

        assert_eq!(opt.worker_count, 2);
        assert_eq!(opt.retry_limit, 3);
        assert_eq!(opt.min_backoff, Duration::from_secs(1));
    }

    #[test]
    fn pause_is_capped_by_max_backoff() {
        let mut opt = QueueOptions::new("q");
        opt.max_backoff = Duration::from_secs(5);
        opt.init();
        assert_eq!(opt.pause_duration(), Duration::from_secs(5));

        let mut opt = QueueOptions::new("q");
        opt.init();
        assert_eq!(opt.pause_duration(), Duration::from_secs(60));
    }
}
