//! Shared key/value store contract.
//!
//! Rate limiting and name deduplication sit on top of two primitives a
//! shared store (Redis and friends) can provide atomically: set-if-absent
//! with TTL, and a TTL'd counter. `InMemoryStore` is the process-local
//! fallback used when no shared store is configured.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::Error;
use crate::time;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Set `key` if absent, with `ttl`. Returns whether the key was set.
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, Error>;

    /// Atomically increment the counter at `key`, creating it with `ttl`
    /// on first increment. Returns the post-increment value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, Error>;
}

#[derive(Debug)]
struct Entry {
    count: u64,
    expires_at: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Process-local store. Best-effort only: keys are not shared across
/// processes, so dedup and rate limits degrade to per-process scope.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Expiry is otherwise lazy, so long-lived stores
    /// with churning keys should sweep periodically.
    pub fn sweep(&self) {
        let now = time::now();
        self.entries.retain(|_, entry| !entry.expired(now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn set_nx(&self, key: &str, ttl: Duration) -> Result<bool, Error> {
        let now = time::now();
        let mut set = false;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| {
                set = true;
                Entry {
                    count: 1,
                    expires_at: now + ttl,
                }
            });
        if !set && entry.expired(now) {
            entry.count = 1;
            entry.expires_at = now + ttl;
            set = true;
        }
        Ok(set)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        let now = time::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                count: 0,
                expires_at: now + ttl,
            });
        if entry.expired(now) {
            entry.count = 0;
            entry.expires_at = now + ttl;
        }
        entry.count += 1;
        Ok(entry.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_nx_claims_once_per_ttl() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(1);

        assert!(store.set_nx("k", ttl).await.unwrap());
        assert!(!store.set_nx("k", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.set_nx("k", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn incr_resets_after_expiry() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(1);

        assert_eq!(store.incr("k", ttl).await.unwrap(), 1);
        assert_eq!(store.incr("k", ttl).await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.incr("k", ttl).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_expired_keys() {
        let store = InMemoryStore::new();
        store.set_nx("a", Duration::from_secs(1)).await.unwrap();
        store.set_nx("b", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        store.sweep();
        assert_eq!(store.len(), 1);
    }
}
