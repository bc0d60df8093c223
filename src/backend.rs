//! Backend adapter shell.
//!
//! Concrete brokers plug in through the `Backend` trait: the raw service
//! calls only. `BackendQueue` supplies the rest of an adapter: adds stage
//! through a memory queue whose handler pushes to the backend with retries,
//! deletes stage through a second memory queue feeding a batcher that folds
//! them into bulk calls, and missing queues are created lazily.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::batcher::{batch_fn, Batcher, BatcherOptions};
use crate::config::QueueOptions;
use crate::dedup::Deduper;
use crate::error::{BackendError, Error};
use crate::handler::{ArgsDispatch, MessageFn, MessageHandler};
use crate::memqueue::MemoryQueue;
use crate::message::Message;
use crate::processor::Processor;
use crate::queuer::Queuer;
use crate::store::InMemoryStore;
use crate::time;

/// Most hosted brokers cap bulk deletion around this.
pub const DELETE_BATCH_LIMIT: usize = 10;

/// Largest reservation the shell will ask a backend for.
const RESERVE_LIMIT: usize = 100;

/// Raw service client seam implemented per broker.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue an encoded message, honoring `msg.delay`. Returns the
    /// backend-assigned id.
    async fn push(&self, msg: &Message) -> Result<String, BackendError>;

    /// Long-poll reservation. Returned messages carry `id`,
    /// `reservation_id`, `reserved_count`, `body`, and the compression flag.
    async fn reserve(
        &self,
        n: usize,
        reservation_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Vec<Message>, BackendError>;

    async fn release(&self, msg: &Message, delay: Duration) -> Result<(), BackendError>;

    /// Bulk acknowledgment of up to `DELETE_BATCH_LIMIT` messages.
    async fn delete_batch(&self, msgs: &[Message]) -> Result<(), BackendError>;

    /// Create the queue; invoked lazily on `MissingQueue`.
    async fn create_queue(&self) -> Result<(), BackendError>;

    async fn purge(&self) -> Result<(), BackendError>;

    async fn len(&self) -> Result<usize, BackendError>;
}

/// Run `op` up to three times, stopping early on the first non-transient
/// outcome.
pub async fn retry<T, F, Fut>(mut op: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut last = None;
    for _ in 0..3 {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => last = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last.expect("retry loop ran zero times"))
}

/// Stage wrapper: the producer message rides inside the staging message's
/// body so local queue bookkeeping never clobbers backend ids.
fn wrap(msg: &Message) -> Result<Message, Error> {
    let body = rmp_serde::to_vec(msg).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(Message {
        body,
        ..Message::default()
    })
}

fn unwrap(staged: &Message) -> Result<Message, Error> {
    rmp_serde::from_slice(&staged.body).map_err(|e| Error::Codec(e.to_string()))
}

pub struct BackendQueue {
    backend: Arc<dyn Backend>,
    opt: QueueOptions,
    deduper: Deduper,
    add_queue: Arc<MemoryQueue>,
    add_processor: Arc<Processor>,
    del_queue: Arc<MemoryQueue>,
    del_processor: Arc<Processor>,
    del_batcher: Arc<Batcher>,
    processor: Mutex<Option<Arc<Processor>>>,
}

impl BackendQueue {
    pub fn new(backend: Arc<dyn Backend>, mut opt: QueueOptions) -> Arc<Self> {
        if opt.name.is_empty() {
            opt.name = backend.name().to_string();
        }
        opt.init();

        let store = opt
            .store
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let deduper = Deduper::new(store);

        let (add_queue, add_processor) = Self::init_add_stage(&backend, &opt);
        let (del_queue, del_processor, del_batcher) = Self::init_del_stage(&backend, &opt);

        Arc::new(Self {
            backend,
            opt,
            deduper,
            add_queue,
            add_processor,
            del_queue,
            del_processor,
            del_batcher,
            processor: Mutex::new(None),
        })
    }

    fn stage_options(opt: &QueueOptions, suffix: &str) -> QueueOptions {
        QueueOptions {
            name: format!("{}-{suffix}", opt.name),
            group_name: opt.group_name.clone(),
            buffer_size: 1000,
            // Enough workers that staged deletes can fill a bulk batch
            // regardless of host parallelism.
            worker_count: 4 * DELETE_BATCH_LIMIT,
            retry_limit: 3,
            min_backoff: Duration::from_secs(1),
            ..QueueOptions::default()
        }
    }

    fn init_add_stage(
        backend: &Arc<dyn Backend>,
        opt: &QueueOptions,
    ) -> (Arc<MemoryQueue>, Arc<Processor>) {
        let queue = MemoryQueue::new(Self::stage_options(opt, "add"));

        let push_backend = Arc::clone(backend);
        let dispatch: Arc<dyn MessageHandler> = Arc::new(MessageFn(move |staged: Message| {
            let backend = Arc::clone(&push_backend);
            async move {
                let msg = unwrap(&staged)?;
                match retry(|| backend.push(&msg)).await {
                    Ok(_) => Ok(()),
                    Err(BackendError::MissingQueue) => {
                        backend.create_queue().await?;
                        retry(|| backend.push(&msg)).await?;
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }));

        // Last resort when the backend stays unreachable: run the queue's
        // own handler in-process so the message is not lost.
        let fallback: Option<Arc<dyn MessageHandler>> = opt.handler.clone().map(|handler| {
            let dispatch = Arc::new(ArgsDispatch {
                handler,
                codec: opt.codec,
            });
            Arc::new(MessageFn(move |staged: Message| {
                let dispatch = Arc::clone(&dispatch);
                async move {
                    let msg = unwrap(&staged)?;
                    dispatch.call(&msg).await
                }
            })) as Arc<dyn MessageHandler>
        });

        let processor = Processor::with_dispatch(
            Arc::clone(&queue) as Arc<dyn Queuer>,
            queue.options().clone(),
            Some(dispatch),
            fallback,
        );
        processor.start();
        (queue, processor)
    }

    fn init_del_stage(
        backend: &Arc<dyn Backend>,
        opt: &QueueOptions,
    ) -> (Arc<MemoryQueue>, Arc<Processor>, Arc<Batcher>) {
        let queue = MemoryQueue::new(Self::stage_options(opt, "delete"));

        let delete_backend = Arc::clone(backend);
        let mut batcher_opt = BatcherOptions::new(batch_fn(move |msgs: Vec<Message>| {
            let backend = Arc::clone(&delete_backend);
            async move {
                // The flush conditions never produce an empty batch.
                debug_assert!(!msgs.is_empty(), "empty delete batch");
                if msgs.is_empty() {
                    return Ok(());
                }
                match retry(|| backend.delete_batch(&msgs)).await {
                    // Already gone counts as deleted.
                    Err(BackendError::NotFound) => Ok(()),
                    other => other.map_err(Error::from),
                }
            }
        }));
        batcher_opt.max_size = DELETE_BATCH_LIMIT;
        batcher_opt.splitter = Some(Arc::new(|msgs: Vec<Message>| {
            if msgs.len() >= DELETE_BATCH_LIMIT {
                (msgs, Vec::new())
            } else {
                (Vec::new(), msgs)
            }
        }));
        let batcher = Batcher::new(batcher_opt);

        let add_to_batcher = Arc::clone(&batcher);
        let dispatch: Arc<dyn MessageHandler> = Arc::new(MessageFn(move |staged: Message| {
            let batcher = Arc::clone(&add_to_batcher);
            async move {
                let msg = unwrap(&staged)?;
                batcher.add(msg).await
            }
        }));

        let processor = Processor::with_dispatch(
            Arc::clone(&queue) as Arc<dyn Queuer>,
            queue.options().clone(),
            Some(dispatch),
            None,
        );
        processor.start();
        (queue, processor, batcher)
    }

    pub fn options(&self) -> &QueueOptions {
        &self.opt
    }

    /// The consuming processor over this queue, created on first use. Not
    /// started automatically.
    pub fn processor(self: &Arc<Self>) -> Arc<Processor> {
        let mut slot = self.processor.lock();
        slot.get_or_insert_with(|| {
            Processor::new(Arc::clone(self) as Arc<dyn Queuer>, self.opt.clone())
        })
        .clone()
    }

    /// `close_timeout` with the default 30 s grace period.
    pub async fn close(self: &Arc<Self>) -> Result<(), Error> {
        self.close_timeout(Duration::from_secs(30)).await
    }

    /// Stop consuming, drain the staged adds and deletes, and flush the
    /// delete batcher so no acknowledgment tail is lost.
    pub async fn close_timeout(self: &Arc<Self>, timeout: Duration) -> Result<(), Error> {
        let deadline = time::now() + timeout;
        let mut first_err: Option<Error> = None;
        let mut record = |res: Result<(), Error>| {
            if let Err(e) = res {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        let consumer = self.processor.lock().take();
        if let Some(p) = consumer {
            record(p.stop_timeout(timeout).await);
        }

        self.del_batcher.set_sync(true).await;

        // Let the stages run dry before stopping their processors.
        loop {
            let pending = self.add_queue.len().await.unwrap_or(0)
                + self.add_processor.stats().in_flight as usize
                + self.del_queue.len().await.unwrap_or(0)
                + self.del_processor.stats().in_flight as usize
                + self.del_batcher.pending();
            if pending == 0 {
                break;
            }
            if time::now() >= deadline {
                warn!(queue = %self.opt.name, pending, "close timed out with staged work pending");
                record(Err(Error::StopTimeout(pending)));
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }

        let remaining = deadline.saturating_duration_since(time::now());
        record(self.add_processor.stop_timeout(remaining).await);
        record(self.del_processor.stop_timeout(remaining).await);
        record(self.add_queue.close_timeout(remaining).await);
        record(self.del_queue.close_timeout(remaining).await);
        self.del_batcher.close().await;

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Queuer for BackendQueue {
    fn name(&self) -> &str {
        &self.opt.name
    }

    async fn add(&self, mut msg: Message) -> Result<(), Error> {
        msg.ensure_encoded(self.opt.codec, self.opt.compress)?;

        if let Some(name) = &msg.name {
            if !self.deduper.claim(&self.opt.name, name, msg.delay).await? {
                return Err(Error::Duplicate);
            }
        }

        self.add_queue.add(wrap(&msg)?).await
    }

    async fn reserve_n(
        &self,
        n: usize,
        reservation_timeout: Duration,
        wait_timeout: Duration,
    ) -> Result<Vec<Message>, Error> {
        let n = n.min(RESERVE_LIMIT);
        match retry(|| self.backend.reserve(n, reservation_timeout, wait_timeout)).await {
            Ok(msgs) => Ok(msgs),
            Err(BackendError::NotFound) => Ok(Vec::new()),
            Err(BackendError::MissingQueue) => {
                debug!(queue = %self.opt.name, "queue missing, creating");
                if let Err(e) = self.backend.create_queue().await {
                    warn!(queue = %self.opt.name, error = %e, "lazy queue creation failed");
                }
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, msg: &Message, delay: Duration) -> Result<(), Error> {
        retry(|| self.backend.release(msg, delay))
            .await
            .map_err(Error::from)
    }

    async fn delete(&self, msg: &Message) -> Result<(), Error> {
        self.del_queue.add(wrap(msg)?).await
    }

    async fn delete_batch(&self, msgs: &[Message]) -> Result<(), Error> {
        if msgs.is_empty() {
            return Ok(());
        }
        match retry(|| self.backend.delete_batch(msgs)).await {
            Err(BackendError::NotFound) => Ok(()),
            other => other.map_err(Error::from),
        }
    }

    async fn purge(&self) -> Result<(), Error> {
        self.add_queue.purge().await?;
        self.del_queue.purge().await?;
        retry(|| self.backend.purge()).await.map_err(Error::from)
    }

    async fn len(&self) -> Result<usize, Error> {
        retry(|| self.backend.len()).await.map_err(Error::from)
    }
}
