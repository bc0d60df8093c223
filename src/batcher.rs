//! Size/time-window coalescing of unit operations into bulk calls.
//!
//! Adds accumulate in a buffer that flushes when it reaches `max_size` or
//! when the oldest pending entry exceeds `max_timeout`. Each `add` suspends
//! until the flush that carries its message completes, and receives that
//! flush's result; a failed bulk call fails every message in the flush with
//! the same error, which the supplying processor then retries per message.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::error;

use crate::error::Error;
use crate::message::Message;
use crate::time;

/// Performs the bulk operation for one flush.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn call(&self, msgs: Vec<Message>) -> Result<(), Error>;
}

struct BatchFn<F>(F);

#[async_trait]
impl<F, Fut> BatchHandler for BatchFn<F>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    async fn call(&self, msgs: Vec<Message>) -> Result<(), Error> {
        (self.0)(msgs).await
    }
}

/// Wrap an async closure as a `BatchHandler`.
pub fn batch_fn<F, Fut>(f: F) -> Arc<dyn BatchHandler>
where
    F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(BatchFn(f))
}

/// Splits a size-triggered batch into `(flush_now, hold_back)`. Must
/// partition in order: concatenating the two halves yields the input.
/// Ignored for timeout and sync flushes, which always take everything.
pub type Splitter = dyn Fn(Vec<Message>) -> (Vec<Message>, Vec<Message>) + Send + Sync;

pub struct BatcherOptions {
    /// Flush when the buffer reaches this count. Default 10.
    pub max_size: usize,
    /// Flush when the oldest pending entry exceeds this age. Default 3 s.
    pub max_timeout: Duration,
    pub handler: Arc<dyn BatchHandler>,
    pub splitter: Option<Arc<Splitter>>,
}

impl BatcherOptions {
    pub fn new(handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            max_size: 0,
            max_timeout: Duration::ZERO,
            handler,
            splitter: None,
        }
    }

    fn init(&mut self) {
        if self.max_size == 0 {
            self.max_size = 10;
        }
        if self.max_timeout.is_zero() {
            self.max_timeout = Duration::from_secs(3);
        }
    }
}

struct Pending {
    msg: Message,
    done: oneshot::Sender<Result<(), Error>>,
    at: Instant,
}

#[derive(Default)]
struct BatchState {
    buf: Vec<Pending>,
    sync: bool,
}

pub struct Batcher {
    opt: BatcherOptions,
    state: Mutex<BatchState>,
    /// Timer task wakeups: buffer state changed.
    wake: Arc<Notify>,
    /// At most one flush in flight.
    flush_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Batcher {
    pub fn new(mut opt: BatcherOptions) -> Arc<Self> {
        opt.init();
        let batcher = Arc::new(Self {
            opt,
            state: Mutex::new(BatchState::default()),
            wake: Arc::new(Notify::new()),
            flush_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(timer_loop(
            Arc::downgrade(&batcher),
            Arc::clone(&batcher.wake),
        ));
        batcher
    }

    /// Buffer `msg` and wait for the flush that carries it.
    pub async fn add(&self, msg: Message) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let (done, rx) = oneshot::channel();
        let to_flush = {
            let mut state = self.state.lock();
            let was_empty = state.buf.is_empty();
            state.buf.push(Pending {
                msg,
                done,
                at: time::now(),
            });

            let batch = if state.sync {
                Some(std::mem::take(&mut state.buf))
            } else if state.buf.len() >= self.opt.max_size {
                Some(self.split_off(&mut state))
            } else {
                None
            };

            if was_empty && batch.is_none() {
                // Arm the timer for this entry.
                self.wake.notify_one();
            }
            batch
        };

        if let Some(batch) = to_flush {
            self.flush(batch).await;
        }

        rx.await.unwrap_or(Err(Error::Closed))
    }

    /// In sync mode every add flushes immediately. Turning it on flushes
    /// whatever is pending; used during shutdown so no tail is lost.
    pub async fn set_sync(&self, sync: bool) {
        let leftover = {
            let mut state = self.state.lock();
            state.sync = sync;
            if sync {
                std::mem::take(&mut state.buf)
            } else {
                Vec::new()
            }
        };
        self.flush(leftover).await;
    }

    /// Stop the timer task and flush anything still pending.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
        let leftover = std::mem::take(&mut self.state.lock().buf);
        self.flush(leftover).await;
    }

    pub fn pending(&self) -> usize {
        self.state.lock().buf.len()
    }

    /// Size-triggered split: let the splitter hold back a sub-threshold
    /// tail. The splitter sees messages only; entries are rejoined by
    /// position.
    fn split_off(&self, state: &mut BatchState) -> Vec<Pending> {
        let Some(splitter) = &self.opt.splitter else {
            return std::mem::take(&mut state.buf);
        };

        let msgs: Vec<Message> = state.buf.iter().map(|p| p.msg.clone()).collect();
        let (flush_now, hold_back) = splitter(msgs);
        debug_assert_eq!(flush_now.len() + hold_back.len(), state.buf.len());

        let mut buf = std::mem::take(&mut state.buf);
        let tail = buf.split_off(flush_now.len().min(buf.len()));
        state.buf = tail;
        buf
    }

    async fn flush(&self, batch: Vec<Pending>) {
        if batch.is_empty() {
            return;
        }
        let _gate = self.flush_gate.lock().await;

        let msgs: Vec<Message> = batch.iter().map(|p| p.msg.clone()).collect();
        let result = self.opt.handler.call(msgs).await;
        if let Err(e) = &result {
            error!(error = %e, batch_size = batch.len(), "batch flush failed");
        }

        // A partial failure fails the whole flush: every waiter sees the
        // same result and retries individually upstream.
        for pending in batch {
            let _ = pending.done.send(result.clone());
        }
    }
}

impl Drop for Batcher {
    fn drop(&mut self) {
        // Wake the timer so it observes the dead Weak and exits.
        self.closed.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

/// Flushes the whole buffer once its oldest entry ages past `max_timeout`.
async fn timer_loop(batcher: Weak<Batcher>, wake: Arc<Notify>) {
    loop {
        let action = {
            let Some(batcher) = batcher.upgrade() else {
                return;
            };
            if batcher.closed.load(Ordering::Acquire) {
                return;
            }

            let deadline = {
                let state = batcher.state.lock();
                state.buf.first().map(|p| p.at + batcher.opt.max_timeout)
            };

            match deadline {
                Some(at) if at <= time::now() => {
                    let batch = std::mem::take(&mut batcher.state.lock().buf);
                    batcher.flush(batch).await;
                    continue;
                }
                other => other,
            }
        };

        match action {
            Some(at) => {
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = sleep_until(at) => {}
                }
            }
            None => wake.notified().await,
        }
    }
}
