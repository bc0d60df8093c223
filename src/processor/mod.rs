//! The processing engine.
//!
//! One fetcher task long-polls the queue and hands reserved messages to a
//! pool of workers bounded by a semaphore. Workers gate on the rate
//! limiter, dispatch to the handler, and classify the result into
//! delete / release-with-backoff / fallback. Sustained failure pauses the
//! fetcher so a broken handler cannot hammer the backend.

mod stats;

pub use stats::Stats;
use stats::ProcessorStats;

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::QueueOptions;
use crate::error::Error;
use crate::handler::{ArgsDispatch, MessageHandler};
use crate::limiter::RateLimiter;
use crate::message::Message;
use crate::queuer::Queuer;
use crate::time;

/// Optional per-message observation hook.
pub trait Tracer: Send + Sync {
    fn on_start(&self, _msg: &Message) {}
    fn on_end(&self, _msg: &Message, _result: &Result<(), Error>, _elapsed: Duration) {}
}

/// Lifecycle of a processor. Transitions are one-way; a stopped processor
/// is not restartable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl ProcessorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProcessorState::Idle,
            1 => ProcessorState::Running,
            2 => ProcessorState::Draining,
            _ => ProcessorState::Stopped,
        }
    }
}

const RESERVE_ERR_BACKOFF: Duration = Duration::from_millis(250);
const RESERVE_ERR_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct Processor {
    queue: Arc<dyn Queuer>,
    opt: QueueOptions,
    dispatch: Option<Arc<dyn MessageHandler>>,
    fallback: Option<Arc<dyn MessageHandler>>,
    limiter: Option<RateLimiter>,
    stats: ProcessorStats,
    workers: Arc<Semaphore>,
    state: AtomicU8,
    stop_notify: Notify,
    resume_notify: Notify,
    consecutive_errors: AtomicU32,
    fetcher: Mutex<Option<JoinHandle<()>>>,
}

impl Processor {
    pub fn new(queue: Arc<dyn Queuer>, mut opt: QueueOptions) -> Arc<Self> {
        opt.init();

        let dispatch: Option<Arc<dyn MessageHandler>> =
            opt.handler.clone().map(|handler| {
                Arc::new(ArgsDispatch {
                    handler,
                    codec: opt.codec,
                }) as Arc<dyn MessageHandler>
            });
        let fallback = opt.fallback_handler.clone().map(|fb| {
            let fb = fb.clone();
            Arc::new(crate::handler::MessageFn(move |_msg: Message| {
                let fb = fb.clone();
                async move { fb.call().await }
            })) as Arc<dyn MessageHandler>
        });

        Self::with_dispatch(queue, opt, dispatch, fallback)
    }

    /// Stage queues dispatch whole messages instead of decoded args.
    pub(crate) fn with_dispatch(
        queue: Arc<dyn Queuer>,
        mut opt: QueueOptions,
        dispatch: Option<Arc<dyn MessageHandler>>,
        fallback: Option<Arc<dyn MessageHandler>>,
    ) -> Arc<Self> {
        opt.init();

        let limiter = match (&opt.rate_limit, &opt.store) {
            (Some(_), Some(store)) => Some(RateLimiter::new(store.clone(), opt.name.clone())),
            _ => None,
        };
        let workers = Arc::new(Semaphore::new(opt.worker_count));

        Arc::new(Self {
            queue,
            opt,
            dispatch,
            fallback,
            limiter,
            stats: ProcessorStats::default(),
            workers,
            state: AtomicU8::new(ProcessorState::Idle as u8),
            stop_notify: Notify::new(),
            resume_notify: Notify::new(),
            consecutive_errors: AtomicU32::new(0),
            fetcher: Mutex::new(None),
        })
    }

    /// Create a processor over `queue` and start it immediately.
    pub fn start_new(queue: Arc<dyn Queuer>, opt: QueueOptions) -> Arc<Self> {
        let p = Self::new(queue, opt);
        p.start();
        p
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Spawn the fetcher. No-op unless the processor is still idle.
    pub fn start(self: &Arc<Self>) {
        let was_idle = self
            .state
            .compare_exchange(
                ProcessorState::Idle as u8,
                ProcessorState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !was_idle {
            return;
        }

        info!(queue = self.queue.name(), workers = self.opt.worker_count, "processor started");
        let p = Arc::clone(self);
        let handle = tokio::spawn(async move { p.fetch_loop().await });
        *self.fetcher.lock() = Some(handle);
    }

    /// `stop_timeout` with the default 30 s grace period.
    pub async fn stop(&self) -> Result<(), Error> {
        self.stop_timeout(Duration::from_secs(30)).await
    }

    /// Stop reserving, then wait up to `timeout` for in-flight workers.
    /// Workers still running at the deadline are abandoned; their messages
    /// redeliver once the backend reservation expires. Flushing a delete
    /// batcher is the owning queue's job, in its close path.
    pub async fn stop_timeout(&self, timeout_after: Duration) -> Result<(), Error> {
        let was_running = self
            .state
            .compare_exchange(
                ProcessorState::Running as u8,
                ProcessorState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !was_running {
            // Never started, or a concurrent stop is already draining.
            self.state
                .store(ProcessorState::Stopped as u8, Ordering::Release);
            return Ok(());
        }

        self.stop_notify.notify_waiters();

        let worker_count = self.opt.worker_count as u32;
        let result = match timeout(timeout_after, self.workers.acquire_many(worker_count)).await {
            Ok(permits) => {
                drop(permits.expect("worker semaphore closed"));
                Ok(())
            }
            Err(_) => {
                let stragglers = self.opt.worker_count - self.workers.available_permits();
                warn!(
                    queue = self.queue.name(),
                    stragglers, "stop timed out, abandoning in-flight workers"
                );
                Err(Error::StopTimeout(stragglers))
            }
        };

        self.state
            .store(ProcessorState::Stopped as u8, Ordering::Release);
        // The fetcher exits on its own once it observes the state change;
        // abort covers one parked mid-poll in a backend long-poll.
        if let Some(handle) = self.fetcher.lock().take() {
            handle.abort();
        }
        info!(queue = self.queue.name(), "processor stopped");
        result
    }

    /// Reserve and process exactly one message, inline. For tests.
    pub async fn process_one(self: &Arc<Self>) -> Result<(), Error> {
        let msgs = self
            .queue
            .reserve_n(1, self.opt.reservation_timeout, self.opt.wait_timeout)
            .await?;
        let Some(msg) = msgs.into_iter().next() else {
            return Err(Error::NoMessages);
        };

        let permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .expect("worker semaphore closed");
        self.stats.incr_in_flight();
        Arc::clone(self).process_message(msg, permit).await;
        Ok(())
    }

    /// Process inline until the queue reports empty twice in a row with no
    /// in-flight messages. For tests.
    pub async fn process_all(self: &Arc<Self>) -> Result<(), Error> {
        let mut empty_runs = 0;
        while empty_runs < 2 {
            let msgs = self
                .queue
                .reserve_n(
                    self.opt.worker_count.max(1),
                    self.opt.reservation_timeout,
                    Duration::from_millis(50),
                )
                .await?;

            if msgs.is_empty() && self.stats.in_flight() == 0 {
                empty_runs += 1;
                continue;
            }
            empty_runs = 0;

            for msg in msgs {
                let permit = Arc::clone(&self.workers)
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                self.stats.incr_in_flight();
                Arc::clone(self).process_message(msg, permit).await;
            }
        }
        Ok(())
    }

    async fn fetch_loop(self: Arc<Self>) {
        let mut batch = self.opt.worker_count.min(10).max(1);
        let mut err_backoff = RESERVE_ERR_BACKOFF;

        loop {
            if self.state() != ProcessorState::Running {
                break;
            }

            if self.consecutive_errors.load(Ordering::Relaxed) >= self.opt.pause_error_count {
                let pause = self.opt.pause_duration();
                warn!(
                    queue = self.queue.name(),
                    pause_ms = pause.as_millis() as u64,
                    "pausing reservations after sustained failures"
                );
                tokio::select! {
                    _ = sleep(pause) => {
                        // Give the handler a fresh chance.
                        self.consecutive_errors.store(0, Ordering::Relaxed);
                    }
                    _ = self.resume_notify.notified() => {}
                    _ = self.stop_notify.notified() => break,
                }
                continue;
            }

            let reserved = tokio::select! {
                _ = self.stop_notify.notified() => break,
                res = self.queue.reserve_n(
                    batch,
                    self.opt.reservation_timeout,
                    self.opt.wait_timeout,
                ) => res,
            };

            let msgs = match reserved {
                Ok(msgs) => {
                    err_backoff = RESERVE_ERR_BACKOFF;
                    msgs
                }
                Err(Error::Closed) => break,
                Err(e) => {
                    error!(queue = self.queue.name(), error = %e, "reserve failed");
                    batch = (batch / 2).max(1);
                    tokio::select! {
                        _ = sleep(err_backoff) => {}
                        _ = self.stop_notify.notified() => break,
                    }
                    err_backoff = (err_backoff * 2).min(RESERVE_ERR_BACKOFF_MAX);
                    continue;
                }
            };

            if msgs.is_empty() {
                continue;
            }
            let full_batch = msgs.len() == batch;

            let mut iter = msgs.into_iter();
            let mut stopping = false;
            while let Some(msg) = iter.next() {
                let permit = tokio::select! {
                    _ = self.stop_notify.notified() => {
                        stopping = true;
                        self.requeue_undispatched(msg).await;
                        break;
                    }
                    permit = Arc::clone(&self.workers).acquire_owned() => {
                        permit.expect("worker semaphore closed")
                    }
                };
                if self.state() != ProcessorState::Running {
                    drop(permit);
                    stopping = true;
                    self.requeue_undispatched(msg).await;
                    break;
                }
                // The failure threshold may have tripped while this batch
                // was waiting on a worker slot; dispatching now would dodge
                // the pause.
                if self.consecutive_errors.load(Ordering::Relaxed) >= self.opt.pause_error_count {
                    drop(permit);
                    self.requeue_undispatched(msg).await;
                    break;
                }

                self.stats.incr_in_flight();
                let p = Arc::clone(&self);
                tokio::spawn(async move { p.process_message(msg, permit).await });
            }
            for msg in iter {
                self.requeue_undispatched(msg).await;
            }
            if stopping {
                break;
            }

            // Adapt the reservation batch: grow while workers keep up,
            // shrink once the pool saturates.
            if full_batch && self.workers.available_permits() > 0 {
                batch = (batch * 2).min(self.opt.worker_count);
            } else if self.workers.available_permits() == 0 {
                batch = (batch / 2).max(1);
            }
        }

        debug!(queue = self.queue.name(), "fetcher exited");
    }

    async fn requeue_undispatched(&self, msg: Message) {
        if let Err(e) = self.queue.release(&msg, Duration::ZERO).await {
            warn!(queue = self.queue.name(), error = %e, "failed to requeue on shutdown");
        }
    }

    async fn process_message(
        self: Arc<Self>,
        msg: Message,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        self.run_message(&msg).await;
        self.stats.decr_in_flight();
        drop(permit);
    }

    async fn run_message(&self, msg: &Message) {
        if let (Some(limit), Some(limiter)) = (self.opt.rate_limit, &self.limiter) {
            match limiter.allow(limit).await {
                Ok(allow) if !allow.allowed => {
                    if let Err(e) = self.queue.release(msg, allow.retry_after).await {
                        warn!(queue = self.queue.name(), error = %e, "rate-limited release failed");
                    }
                    return;
                }
                Ok(_) => {}
                // A store outage must not halt processing.
                Err(e) => warn!(queue = self.queue.name(), error = %e, "rate limiter unavailable"),
            }
        }

        let Some(dispatch) = &self.dispatch else {
            error!(queue = self.queue.name(), "no handler configured, dropping message");
            self.fallback(msg).await;
            self.stats.record_fail();
            self.delete_message(msg).await;
            return;
        };

        if let Some(tracer) = &self.opt.tracer {
            tracer.on_start(msg);
        }
        let started = time::now();
        let result = dispatch.call(msg).await;
        let elapsed = started.elapsed();
        self.stats.observe_duration(elapsed);
        if let Some(tracer) = &self.opt.tracer {
            tracer.on_end(msg, &result, elapsed);
        }

        match result {
            Ok(()) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                self.resume_notify.notify_waiters();
                self.stats.record_processed();
                self.delete_message(msg).await;
            }
            Err(err) => self.handle_failure(msg, err).await,
        }
    }

    async fn handle_failure(&self, msg: &Message, err: Error) {
        // A delay-carrying error is a rate-limit signal, not a failure: it
        // neither counts toward the retry limit nor the pause threshold.
        if let Some(delay) = err.delay() {
            debug!(queue = self.queue.name(), id = %msg.id, delay_ms = delay.as_millis() as u64, "handler requested redelivery");
            if let Err(e) = self.queue.release(msg, delay).await {
                warn!(queue = self.queue.name(), error = %e, "release failed");
            }
            return;
        }

        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);

        if !err.is_terminal() && msg.reserved_count < self.opt.retry_limit {
            let delay = self.redelivery_delay(msg.reserved_count);
            warn!(
                queue = self.queue.name(),
                id = %msg.id,
                attempt = msg.reserved_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "handler failed, retrying"
            );
            self.stats.record_retry();
            if let Err(e) = self.queue.release(msg, delay).await {
                warn!(queue = self.queue.name(), error = %e, "release failed");
            }
            return;
        }

        error!(
            queue = self.queue.name(),
            id = %msg.id,
            attempt = msg.reserved_count,
            error = %err,
            "handler failed terminally"
        );
        self.stats.record_fail();
        self.fallback(msg).await;
        self.delete_message(msg).await;
    }

    async fn fallback(&self, msg: &Message) {
        if let Some(fallback) = &self.fallback {
            if let Err(e) = fallback.call(msg).await {
                error!(queue = self.queue.name(), id = %msg.id, error = %e, "fallback handler failed");
            }
        }
    }

    async fn delete_message(&self, msg: &Message) {
        self.stats.incr_deleting();
        if let Err(e) = self.queue.delete(msg).await {
            warn!(queue = self.queue.name(), id = %msg.id, error = %e, "delete failed");
        }
        self.stats.decr_deleting();
    }

    fn redelivery_delay(&self, reserved_count: u32) -> Duration {
        if let Some(delay_fn) = &self.opt.redelivery_delay {
            return delay_fn(reserved_count, self.opt.min_backoff, self.opt.max_backoff);
        }
        exp_backoff(reserved_count, self.opt.min_backoff, self.opt.max_backoff)
    }
}

/// Exponential backoff from the reserved count, jittered upward into
/// `[d, 1.5d]` so a retry never lands before its nominal slot.
fn exp_backoff(reserved_count: u32, min: Duration, max: Duration) -> Duration {
    let exp = reserved_count.saturating_sub(1).min(20);
    let base = min.saturating_mul(1u32 << exp).min(max);
    let jitter = base.mul_f64(rand::random::<f64>() * 0.5);
    (base + jitter).min(max)
}
