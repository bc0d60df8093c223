//! Pre-dispatch rate limiting.
//!
//! The limiter is a windowed counter over the shared store, so every
//! processor consuming the same queue against the same store draws from one
//! budget. A denied call returns the advisory delay until the next window.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::store::KvStore;
use crate::time;

/// Token budget: `limit` dispatches per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u32,
    pub period: Duration,
}

impl RateLimit {
    pub fn new(limit: u32, period: Duration) -> Self {
        Self { limit, period }
    }

    pub fn per_second(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }

    /// One dispatch per `period`.
    pub fn every(period: Duration) -> Self {
        Self::new(1, period)
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy)]
pub struct Allow {
    pub allowed: bool,
    /// How long to wait before the next window opens. Zero when allowed.
    pub retry_after: Duration,
}

pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    queue: String,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
        }
    }

    /// Consume one token from the current window.
    pub async fn allow(&self, limit: RateLimit) -> Result<Allow, Error> {
        let period_ms = limit.period.as_millis().max(1) as u64;
        let now = time::now_ms();
        let window = now / period_ms;

        let key = format!("rate:{{{}}}:{}", self.queue, window);
        // Keep the window key around one extra period so late stragglers
        // still hit the same counter.
        let count = self.store.incr(&key, limit.period * 2).await?;

        if count <= u64::from(limit.limit) {
            Ok(Allow {
                allowed: true,
                retry_after: Duration::ZERO,
            })
        } else {
            let window_end = (window + 1) * period_ms;
            Ok(Allow {
                allowed: false,
                retry_after: Duration::from_millis(window_end.saturating_sub(now).max(1)),
            })
        }
    }
}
