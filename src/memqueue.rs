//! In-process queue with delayed delivery.
//!
//! The queue keeps three disjoint sets: a bounded ready FIFO, a delay heap
//! keyed by release time, and the in-flight reservations. A dedicated
//! scheduler task wakes at the earliest deadline to promote due messages
//! and to requeue expired reservations, so consumers never poll.
//!
//! Standalone it is a fully functional queue with a built-in processor;
//! inside a backend shell it is the staging buffer for adds and deletes.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use compact_str::CompactString;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::debug;

use crate::config::QueueOptions;
use crate::dedup::Deduper;
use crate::error::Error;
use crate::message::Message;
use crate::processor::Processor;
use crate::queuer::Queuer;
use crate::store::InMemoryStore;
use crate::time;

/// Delay-heap entry. Min-heap on `(ready_at, seq)`; `seq` keeps same-instant
/// messages in add order.
struct Scheduled {
    ready_at: Instant,
    seq: u64,
    msg: Message,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so BinaryHeap pops the earliest entry first.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct InFlight {
    msg: Message,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    delayed: BinaryHeap<Scheduled>,
    in_flight: HashMap<CompactString, InFlight>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            delayed: BinaryHeap::new(),
            in_flight: HashMap::new(),
        }
    }
}

pub struct MemoryQueue {
    opt: QueueOptions,
    state: Mutex<QueueState>,
    /// A message became ready.
    ready_notify: Notify,
    /// A ready slot was freed.
    space_notify: Notify,
    /// The scheduler's wake set changed.
    scheduler_notify: Arc<Notify>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    closed: AtomicBool,
    deduper: Deduper,
    processor: Mutex<Option<Arc<Processor>>>,
}

impl MemoryQueue {
    pub fn new(mut opt: QueueOptions) -> Arc<Self> {
        opt.init();

        // Without a shared store, dedup degrades to process-local scope.
        let store = opt
            .store
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));

        let queue = Arc::new(Self {
            opt,
            state: Mutex::new(QueueState::new()),
            ready_notify: Notify::new(),
            space_notify: Notify::new(),
            scheduler_notify: Arc::new(Notify::new()),
            next_id: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            deduper: Deduper::new(store),
            processor: Mutex::new(None),
        });

        tokio::spawn(scheduler_loop(
            Arc::downgrade(&queue),
            Arc::clone(&queue.scheduler_notify),
        ));

        queue
    }

    pub fn options(&self) -> &QueueOptions {
        &self.opt
    }

    /// The built-in processor over this queue, created on first use with
    /// the queue's own options. It is not started automatically.
    pub fn processor(self: &Arc<Self>) -> Arc<Processor> {
        let mut slot = self.processor.lock();
        slot.get_or_insert_with(|| {
            Processor::new(Arc::clone(self) as Arc<dyn Queuer>, self.opt.clone())
        })
        .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// `close_timeout` with the default 30 s grace period.
    pub async fn close(self: &Arc<Self>) -> Result<(), Error> {
        self.close_timeout(Duration::from_secs(30)).await
    }

    /// Stop the built-in processor, then refuse further operations. Waits
    /// up to `timeout` for in-flight handlers.
    pub async fn close_timeout(self: &Arc<Self>, timeout: Duration) -> Result<(), Error> {
        let processor = self.processor.lock().take();

        let mut first_err = None;
        if let Some(p) = processor {
            if let Err(e) = p.stop_timeout(timeout).await {
                first_err = Some(e);
            }
        }

        self.closed.store(true, Ordering::Release);
        self.scheduler_notify.notify_one();
        self.ready_notify.notify_waiters();
        self.space_notify.notify_waiters();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn push_ready(&self, msg: Message) -> Result<(), Error> {
        let deadline = time::now() + self.opt.wait_timeout;
        let mut msg = Some(msg);

        loop {
            {
                let mut state = self.state.lock();
                if state.ready.len() < self.opt.buffer_size {
                    state.ready.push_back(msg.take().expect("message consumed twice"));
                    drop(state);
                    self.ready_notify.notify_one();
                    return Ok(());
                }
            }
            if self.is_closed() {
                return Err(Error::Closed);
            }
            if timeout_at(deadline, self.space_notify.notified())
                .await
                .is_err()
            {
                return Err(Error::BufferFull);
            }
        }
    }

    fn schedule_delayed(&self, msg: Message, delay: Duration) {
        let entry = Scheduled {
            ready_at: time::now() + delay,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            msg,
        };
        self.state.lock().delayed.push(entry);
        self.scheduler_notify.notify_one();
    }
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        // Wake the scheduler so it observes the dead Weak and exits.
        self.closed.store(true, Ordering::Release);
        self.scheduler_notify.notify_one();
    }
}

#[async_trait]
impl Queuer for MemoryQueue {
    fn name(&self) -> &str {
        &self.opt.name
    }

    async fn add(&self, mut msg: Message) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        msg.ensure_encoded(self.opt.codec, self.opt.compress)?;

        if let Some(name) = msg.name.clone() {
            if !self.deduper.claim(&self.opt.name, &name, msg.delay).await? {
                return Err(Error::Duplicate);
            }
        }

        msg.id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();

        if msg.delay.is_zero() {
            self.push_ready(msg).await
        } else {
            let delay = msg.delay;
            self.schedule_delayed(msg, delay);
            Ok(())
        }
    }

    async fn reserve_n(
        &self,
        n: usize,
        reservation_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Vec<Message>, Error> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let deadline = time::now() + wait_timeout;

        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }

            let batch = {
                let mut state = self.state.lock();
                let take = n.min(state.ready.len());
                let mut batch = Vec::with_capacity(take);
                let lease_deadline = time::now() + reservation_timeout;
                for _ in 0..take {
                    let mut msg = state.ready.pop_front().expect("ready drained under lock");
                    msg.reserved_count += 1;
                    msg.reservation_id = format!("r{:x}", rand::random::<u64>());
                    state.in_flight.insert(
                        CompactString::from(msg.id.as_str()),
                        InFlight {
                            msg: msg.clone(),
                            deadline: lease_deadline,
                        },
                    );
                    batch.push(msg);
                }
                batch
            };

            if !batch.is_empty() {
                for _ in 0..batch.len() {
                    self.space_notify.notify_one();
                }
                // New lease deadlines for the scheduler to watch.
                self.scheduler_notify.notify_one();
                return Ok(batch);
            }

            if timeout_at(deadline, self.ready_notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn release(&self, msg: &Message, delay: Duration) -> Result<(), Error> {
        let removed = {
            let mut state = self.state.lock();
            let matches = state
                .in_flight
                .get(msg.id.as_str())
                .is_some_and(|inf| inf.msg.reservation_id == msg.reservation_id);
            if matches {
                state.in_flight.remove(msg.id.as_str());
                true
            } else {
                false
            }
        };

        // An expired reservation was already requeued by the scheduler.
        if !removed {
            return Ok(());
        }

        let requeued = msg.clone();
        if delay.is_zero() {
            self.state.lock().ready.push_back(requeued);
            self.ready_notify.notify_one();
        } else {
            self.schedule_delayed(requeued, delay);
        }
        Ok(())
    }

    async fn delete(&self, msg: &Message) -> Result<(), Error> {
        let mut state = self.state.lock();
        let matches = state
            .in_flight
            .get(msg.id.as_str())
            .is_some_and(|inf| inf.msg.reservation_id == msg.reservation_id);
        if matches {
            state.in_flight.remove(msg.id.as_str());
        }
        Ok(())
    }

    async fn delete_batch(&self, msgs: &[Message]) -> Result<(), Error> {
        for msg in msgs {
            self.delete(msg).await?;
        }
        Ok(())
    }

    async fn purge(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            state.ready.clear();
            state.delayed.clear();
            state.in_flight.clear();
        }
        self.space_notify.notify_waiters();
        Ok(())
    }

    async fn len(&self) -> Result<usize, Error> {
        let state = self.state.lock();
        Ok(state.ready.len() + state.delayed.len())
    }
}

/// Wakes at the earliest deadline: promotes due delayed messages to the
/// ready FIFO and requeues reservations whose lease expired. Exits when the
/// queue is closed or dropped.
async fn scheduler_loop(queue: Weak<MemoryQueue>, notify: Arc<Notify>) {
    loop {
        let next_wake = {
            let Some(queue) = queue.upgrade() else {
                return;
            };
            if queue.is_closed() {
                return;
            }

            let now = time::now();
            let mut promoted = 0usize;
            let mut next_wake: Option<Instant> = None;

            {
                let mut state = queue.state.lock();

                while let Some(top) = state.delayed.peek() {
                    if top.ready_at > now {
                        next_wake = Some(top.ready_at);
                        break;
                    }
                    let entry = state.delayed.pop().expect("peeked entry vanished");
                    state.ready.push_back(entry.msg);
                    promoted += 1;
                }

                let expired: Vec<CompactString> = state
                    .in_flight
                    .iter()
                    .filter(|(_, inf)| inf.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    if let Some(inf) = state.in_flight.remove(&id) {
                        debug!(queue = queue.name(), id = %id, "reservation expired, requeueing");
                        state.ready.push_back(inf.msg);
                        promoted += 1;
                    }
                }

                for inf in state.in_flight.values() {
                    next_wake = Some(match next_wake {
                        Some(at) => at.min(inf.deadline),
                        None => inf.deadline,
                    });
                }
            }

            for _ in 0..promoted {
                queue.ready_notify.notify_one();
            }
            next_wake
        };

        match next_wake {
            Some(at) => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = sleep_until(at) => {}
                }
            }
            None => notify.notified().await,
        }
    }
}
