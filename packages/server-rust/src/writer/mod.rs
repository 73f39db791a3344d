//! Async writer (M2): bounded-queue write-behind persistence for the primary.
//!
//! Handlers acknowledge writes as soon as the local cache accepts them; this
//! module persists them to the durable store afterwards. The bounded queue is
//! the sole backpressure surface: when it is full the write is **dropped**
//! (the cache still holds the value, so correctness is preserved modulo
//! eventual durability) rather than blocking the request path.
//!
//! Retry backoff sleeps inside the worker body, which temporarily reduces
//! effective worker count under sustained store failure. The enqueue path is
//! unaffected: `write` is non-blocking regardless of worker state.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use warren_core::WriteRequest;

use crate::error::StoreError;
use crate::metrics::{self, error_types};
use crate::store::InstanceStore;

/// Tuning knobs for the writer.
#[derive(Debug, Clone)]
pub struct AsyncWriterConfig {
    /// Bounded queue capacity.
    pub queue_size: usize,
    /// Number of worker tasks competing for the queue.
    pub workers: usize,
    /// Maximum retries per request before it is dropped.
    pub max_retries: u32,
    /// Per-attempt timeout for one durable write.
    pub write_timeout: Duration,
    /// Linear backoff unit: attempt `n` sleeps `n * backoff_unit`.
    pub backoff_unit: Duration,
    /// `instance_id` label for the queue gauges (the service's default
    /// instance -- the queue itself is shared by all tenants).
    pub metrics_instance: String,
}

impl Default for AsyncWriterConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            workers: 5,
            max_retries: 3,
            write_timeout: Duration::from_secs(5),
            backoff_unit: Duration::from_secs(1),
            metrics_instance: "global".to_string(),
        }
    }
}

/// Point-in-time writer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    /// Requests currently queued.
    pub queue_depth: u64,
    /// Queue capacity.
    pub queue_capacity: u64,
    /// Configured worker count.
    pub worker_count: usize,
    /// Requests accepted onto the queue since startup.
    pub enqueued: u64,
    /// Requests durably written.
    pub persisted: u64,
    /// Accepted requests dropped after requeue failure or retry exhaustion.
    /// At quiescence `persisted + dropped == enqueued`.
    pub dropped: u64,
    /// Requests rejected at enqueue time (queue full or writer shut down).
    pub rejected: u64,
}

struct Shared {
    store: Arc<dyn InstanceStore>,
    config: AsyncWriterConfig,
    depth: AtomicI64,
    enqueued: AtomicU64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn publish_depth(&self) {
        let depth = u64::try_from(self.depth.load(Ordering::Relaxed)).unwrap_or(0);
        metrics::set_queue_gauges(
            &self.config.metrics_instance,
            depth,
            self.config.queue_size as u64,
        );
    }

    fn note_enqueue(&self) {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.publish_depth();
    }

    fn note_dequeue(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
        self.publish_depth();
    }
}

/// The write-behind worker pool.
///
/// Constructed once at startup on the primary; `shutdown` drains the queue
/// and joins the workers.
pub struct AsyncWriter {
    tx: mpsc::Sender<WriteRequest>,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncWriter {
    /// Creates the queue and spawns the worker pool.
    #[must_use]
    pub fn new(store: Arc<dyn InstanceStore>, config: AsyncWriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            store,
            config,
            depth: AtomicI64::new(0),
            enqueued: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        shared.publish_depth();

        let workers = (0..shared.config.workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&rx),
                    tx.clone(),
                    Arc::clone(&shared),
                    shutdown_tx.subscribe(),
                ))
            })
            .collect();

        Self {
            tx,
            shared,
            shutdown_tx,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues one durable write without blocking.
    ///
    /// Returns `false` when the request was rejected: the queue is full or
    /// the writer is shut down. Either way the caller's cache write already
    /// succeeded, so the client response is unaffected.
    pub fn write(
        &self,
        key: &str,
        value: Bytes,
        instance_id: &str,
        timestamp: DateTime<Utc>,
    ) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            warn!(key, instance_id, "async writer is shut down; dropping write");
            self.shared.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let request = WriteRequest::new(key, value, instance_id, timestamp);
        match self.tx.try_send(request) {
            Ok(()) => {
                self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
                self.shared.note_enqueue();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::record_async_write_error(instance_id, error_types::QUEUE_FULL);
                warn!(
                    key,
                    instance_id,
                    capacity = self.shared.config.queue_size,
                    "write queue full; dropping request (cache remains authoritative)",
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(key, instance_id, "write queue closed; dropping request");
                false
            }
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            queue_depth: u64::try_from(self.shared.depth.load(Ordering::Relaxed)).unwrap_or(0),
            queue_capacity: self.shared.config.queue_size as u64,
            worker_count: self.shared.config.workers,
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            persisted: self.shared.persisted.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
        }
    }

    /// Whether the queue is above 80% occupancy.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        let stats = self.stats();
        stats.queue_depth * 5 > stats.queue_capacity * 4
    }

    /// Stops accepting writes, signals the workers, and waits for them to
    /// drain the queue. Idempotent.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "async writer worker panicked");
            }
        }
        debug!("async writer shut down");
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<WriteRequest>>>,
    requeue: mpsc::Sender<WriteRequest>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                request = rx.recv() => request,
                _ = shutdown.changed() => None,
            }
        };
        let Some(request) = next else { break };
        shared.note_dequeue();
        process_request(request, &requeue, &shared).await;
    }

    // Shutdown: drain whatever is still queued, then exit.
    loop {
        let next = rx.lock().await.try_recv();
        match next {
            Ok(request) => {
                shared.note_dequeue();
                process_request(request, &requeue, &shared).await;
            }
            Err(_) => break,
        }
    }
    debug!(worker_id, "async writer worker exited");
}

async fn process_request(
    mut request: WriteRequest,
    requeue: &mpsc::Sender<WriteRequest>,
    shared: &Arc<Shared>,
) {
    let attempt: Result<Result<(), StoreError>, _> = tokio::time::timeout(
        shared.config.write_timeout,
        shared.store.set(
            &request.instance_id,
            &request.key,
            &request.value,
            request.timestamp,
        ),
    )
    .await;

    let failure = match attempt {
        Ok(Ok(())) => {
            shared.persisted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Ok(Err(err)) => err.to_string(),
        Err(_) => format!(
            "store write timed out after {:?}",
            shared.config.write_timeout
        ),
    };

    if request.retry_count < shared.config.max_retries {
        request.retry_count += 1;
        warn!(
            key = %request.key,
            instance_id = %request.instance_id,
            retry = request.retry_count,
            error = %failure,
            "durable write failed; backing off",
        );
        tokio::time::sleep(shared.config.backoff_unit * request.retry_count).await;

        let instance_id = request.instance_id.clone();
        let key = request.key.clone();
        match requeue.try_send(request) {
            Ok(()) => shared.note_enqueue(),
            Err(_) => {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_async_write_error(&instance_id, error_types::REQUEUE_FAILED);
                error!(key, instance_id, "re-enqueue failed; dropping write");
            }
        }
    } else {
        shared.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::record_async_write_error(&request.instance_id, error_types::MAX_RETRIES_EXCEEDED);
        error!(
            key = %request.key,
            instance_id = %request.instance_id,
            retries = request.retry_count,
            error = %failure,
            "durable write dropped after exhausting retries",
        );
    }
}
