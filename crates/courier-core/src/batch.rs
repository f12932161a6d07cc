//! Bounded-concurrency executor for fan-out workloads.
//!
//! One [`BatchQueue`] serves one batch submission: at most `concurrency`
//! items run at a time, the rest wait their turn in FIFO order. Transport
//! failures are retried with exponential backoff; provider failures settle
//! the item immediately. Settled items are reported on a bounded event
//! channel rather than through callbacks.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, warn};

use crate::types::{CoreError, TaskId};

/// Tuning for one batch run.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Maximum number of items running at once.
    pub concurrency: usize,
    /// Retry budget per item; beyond it the item is terminally failed.
    pub max_retries: u32,
    /// Backoff base: the delay before retry `n` is `base * 2^n`.
    pub backoff_base: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: 3,
            backoff_base: Duration::from_millis(5000),
        }
    }
}

/// One unit of batch work and its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct BatchJob<T> {
    pub item: T,
    pub retry_count: u32,
    /// Position of the item within its batch, in `add` order.
    pub index: usize,
}

/// A settled batch item.
#[derive(Debug)]
pub enum BatchEvent<O> {
    Completed {
        index: usize,
        output: O,
        retries: u32,
    },
    Failed {
        index: usize,
        error: CoreError,
        retries: u32,
    },
}

impl<O> BatchEvent<O> {
    pub fn index(&self) -> usize {
        match self {
            BatchEvent::Completed { index, .. } | BatchEvent::Failed { index, .. } => *index,
        }
    }
}

/// Capacity of the settled-item event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

type ItemFuture<O> = Pin<Box<dyn Future<Output = Result<O, CoreError>> + Send>>;
type Runner<T, O> = dyn Fn(T) -> ItemFuture<O> + Send + Sync;

/// Bounded-concurrency batch executor.
///
/// Owns its in-flight job list exclusively for the batch's lifetime; the
/// whole queue is discarded once the batch settles.
pub struct BatchQueue<T, O> {
    inner: Arc<QueueInner<T, O>>,
}

struct QueueInner<T, O> {
    /// Record id of the batch the items belong to, for log correlation.
    task_id: TaskId,
    opts: BatchOptions,
    slots: Arc<Semaphore>,
    runner: Box<Runner<T, O>>,
    events: mpsc::Sender<BatchEvent<O>>,
    /// Items added but not yet settled. Reaching zero releases every
    /// `wait_for_idle` caller together.
    outstanding: watch::Sender<usize>,
    next_index: AtomicUsize,
}

impl<T, O> BatchQueue<T, O>
where
    T: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    /// Create a queue and the receiving end of its settled-item events.
    pub fn new<R, RF>(
        task_id: TaskId,
        opts: BatchOptions,
        runner: R,
    ) -> (Self, mpsc::Receiver<BatchEvent<O>>)
    where
        R: Fn(T) -> RF + Send + Sync + 'static,
        RF: Future<Output = Result<O, CoreError>> + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (outstanding_tx, _) = watch::channel(0usize);
        let inner = Arc::new(QueueInner {
            task_id,
            slots: Arc::new(Semaphore::new(opts.concurrency)),
            opts,
            runner: Box::new(move |item| Box::pin(runner(item)) as ItemFuture<O>),
            events: events_tx,
            outstanding: outstanding_tx,
            next_index: AtomicUsize::new(0),
        });
        (Self { inner }, events_rx)
    }

    /// Enqueue one item. Runs as soon as a slot frees up, FIFO.
    pub fn add(&self, item: T) {
        let index = self.inner.next_index.fetch_add(1, Ordering::Relaxed);
        self.inner.outstanding.send_modify(|n| *n += 1);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner
                .drive(BatchJob {
                    item,
                    retry_count: 0,
                    index,
                })
                .await;
        });
    }

    /// Resolves once every added item has settled (completed or permanently
    /// failed). All concurrent waiters are released together.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl<T, O> QueueInner<T, O>
where
    T: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    /// Drive one item to settlement, retrying transport-class errors within
    /// the budget. The slot is released during backoff so other items run.
    async fn drive(&self, mut job: BatchJob<T>) {
        let event = loop {
            let permit = match self.slots.acquire().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let result = (self.runner)(job.item.clone()).await;
            drop(permit);

            match result {
                Ok(output) => {
                    debug!(
                        task_id = self.task_id,
                        index = job.index,
                        retries = job.retry_count,
                        "batch item completed"
                    );
                    break BatchEvent::Completed {
                        index: job.index,
                        output,
                        retries: job.retry_count,
                    };
                }
                Err(e) if e.is_retryable() && job.retry_count < self.opts.max_retries => {
                    let delay = self.opts.backoff_base * 2u32.pow(job.retry_count);
                    warn!(
                        task_id = self.task_id,
                        index = job.index,
                        retry = job.retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transport error; requeueing batch item"
                    );
                    job.retry_count += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        task_id = self.task_id,
                        index = job.index,
                        retries = job.retry_count,
                        error = %e,
                        "batch item failed"
                    );
                    break BatchEvent::Failed {
                        index: job.index,
                        error: e,
                        retries: job.retry_count,
                    };
                }
            }
        };

        // The receiver may have been dropped by an aborted batch driver.
        let _ = self.events.send(event).await;
        self.outstanding.send_modify(|n| *n -= 1);
    }
}
