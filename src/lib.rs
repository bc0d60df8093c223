//! relayq - broker-neutral task queue processing.
//!
//! The crate is the consuming core of a message-queue library: a
//! `Processor` pulls reserved messages from any `Queuer` implementation and
//! dispatches them to handlers with bounded concurrency, retries with
//! backoff, shared rate limiting, at-most-once named messages, batched
//! acknowledgment, and graceful shutdown.
//!
//! ## Module organization
//!
//! - `message` / `codec` - the work unit and its argument wire format
//! - `queuer` - the backend-neutral queue contract and registry
//! - `memqueue` - in-process delayed queue, standalone or as a staging
//!   buffer inside adapters
//! - `batcher` - size/time coalescing of unit operations into bulk calls
//! - `processor` - fetcher, worker pool, retry/pause engine, statistics
//! - `limiter` / `dedup` / `store` - shared-store rate limiting and
//!   name-based deduplication
//! - `backend` - the adapter shell concrete brokers plug into

pub mod backend;
pub mod batcher;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod error;
pub mod handler;
pub mod limiter;
pub mod memqueue;
pub mod message;
pub mod processor;
pub mod queuer;
pub mod store;

mod time;

pub use backend::{Backend, BackendQueue, DELETE_BATCH_LIMIT};
pub use batcher::{batch_fn, BatchHandler, Batcher, BatcherOptions};
pub use codec::{ArgValue, Codec};
pub use config::QueueOptions;
pub use error::{BackendError, Error};
pub use handler::{fallback_fn, handler_fn, Args, FallbackHandler, Handler};
pub use limiter::{RateLimit, RateLimiter};
pub use memqueue::MemoryQueue;
pub use message::Message;
pub use processor::{Processor, ProcessorState, Stats, Tracer};
pub use queuer::{QueueRegistry, Queuer, QueuerExt};
pub use store::{InMemoryStore, KvStore};

#[cfg(test)]
mod tests;
