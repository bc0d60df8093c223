//! The backend-neutral queue contract and the queue registry.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use compact_str::CompactString;
use parking_lot::RwLock;

use crate::codec::{ArgValue, Codec};
use crate::error::Error;
use crate::message::Message;
use crate::time;

/// The interface the processor consumes. Implemented by the in-process
/// memory queue and by backend adapter shells.
#[async_trait]
pub trait Queuer: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a message. Named messages that lose their dedup claim fail
    /// with `Error::Duplicate` and are not enqueued.
    async fn add(&self, msg: Message) -> Result<(), Error>;

    /// Long-poll reservation of up to `n` messages. An empty result means
    /// the wait timed out with nothing ready.
    async fn reserve_n(
        &self,
        n: usize,
        reservation_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Vec<Message>, Error>;

    /// Return a reserved message for redelivery after `delay`.
    async fn release(&self, msg: &Message, delay: Duration) -> Result<(), Error>;

    /// Acknowledge a reserved message.
    async fn delete(&self, msg: &Message) -> Result<(), Error>;

    /// Bulk acknowledgment, used by the delete batcher.
    async fn delete_batch(&self, msgs: &[Message]) -> Result<(), Error>;

    /// Drop every message, including delayed and in-flight ones.
    async fn purge(&self) -> Result<(), Error>;

    /// Messages waiting to be reserved (ready plus delayed).
    async fn len(&self) -> Result<usize, Error>;
}

/// Convenience producers layered over any `Queuer`.
#[async_trait]
pub trait QueuerExt: Queuer {
    /// Build a message from `args` and enqueue it.
    async fn call(&self, args: Vec<ArgValue>) -> Result<(), Error> {
        self.add(Message::from_args(args)).await
    }

    /// Like `call`, but messages with the same args enqueue at most once
    /// per `period`. The name embeds the period slot, so a new slot opens a
    /// new claim even against stores with coarse TTLs.
    async fn call_once(&self, period: Duration, args: Vec<ArgValue>) -> Result<(), Error> {
        let period_ms = period.as_millis().max(1) as u64;
        let now = time::now_ms();
        let slot = now / period_ms;

        let mut msg = Message::from_args(args);
        msg.name = Some(format!("{:x}:{slot}", args_digest(&msg.args)?));
        // Fire at the end of the slot so every producer in the slot
        // collapses into one delivery.
        msg.delay = Duration::from_millis((slot + 1) * period_ms - now);
        self.add(msg).await
    }
}

impl<T: Queuer + ?Sized> QueuerExt for T {}

fn args_digest(args: &[ArgValue]) -> Result<u64, Error> {
    let encoded = Codec::MessagePack.encode(args)?;
    let mut hasher = DefaultHasher::new();
    encoded.hash(&mut hasher);
    Ok(hasher.finish())
}

/// Explicitly-owned registry of queues, usually one per application.
#[derive(Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<CompactString, Arc<dyn Queuer>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue under its name, returning the previous occupant if
    /// one was replaced.
    pub fn register(&self, queue: Arc<dyn Queuer>) -> Option<Arc<dyn Queuer>> {
        self.queues
            .write()
            .insert(CompactString::from(queue.name()), queue)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Queuer>> {
        self.queues.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Queuer>> {
        self.queues.write().remove(name)
    }

    pub fn queues(&self) -> Vec<Arc<dyn Queuer>> {
        self.queues.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;
    use crate::memqueue::MemoryQueue;

    #[tokio::test]
    async fn registry_tracks_queues_by_name() {
        let registry = QueueRegistry::new();
        assert!(registry.is_empty());

        let q = MemoryQueue::new(QueueOptions::new("jobs"));
        assert!(registry.register(q).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("jobs").is_some());
        assert!(registry.get("other").is_none());

        // Same name replaces and returns the previous queue.
        let replacement = MemoryQueue::new(QueueOptions::new("jobs"));
        assert!(registry.register(replacement).is_some());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("jobs").is_some());
        assert!(registry.is_empty());
    }
}
