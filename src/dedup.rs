//! Name-scoped at-most-once-per-period claims.
//!
//! A claim is a set-if-absent on the shared store keyed by
//! `(queue, name)`. Presence means a message with that logical identity was
//! already accepted inside the TTL window; later adds surface `Duplicate`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::store::KvStore;

/// Dedup period applied when the message carries no delay of its own.
pub const DEFAULT_DEDUP_PERIOD: Duration = Duration::from_secs(30 * 60);

pub struct Deduper {
    store: Arc<dyn KvStore>,
}

impl Deduper {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn key(queue: &str, name: &str) -> String {
        format!("dedup:{{{queue}}}:{name}")
    }

    /// Claim `(queue, name)` for `ttl`. Returns whether this caller won the
    /// claim; a losing call means a duplicate.
    pub async fn claim(&self, queue: &str, name: &str, ttl: Duration) -> Result<bool, Error> {
        let ttl = if ttl.is_zero() {
            DEFAULT_DEDUP_PERIOD
        } else {
            ttl
        };
        self.store.set_nx(&Self::key(queue, name), ttl).await
    }
}
