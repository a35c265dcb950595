//! The hit queue: a persistent queue fed to a processor by a single worker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pulse_types::PrivacyStatus;
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::data_queue::{DataEntity, DataQueue};
use crate::error::QueueError;

/// Default wait before re-presenting a hit after a recoverable failure.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Pause before retrying queue storage after an unexpected storage error.
const STORAGE_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome of processing one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOutcome {
    /// The hit was delivered; remove it from the queue.
    Success,
    /// A recoverable failure; keep the hit and retry after the processor's
    /// retry interval.
    Retry,
    /// A fatal failure; remove the hit without delivery.
    Drop,
}

impl HitOutcome {
    /// Maps an HTTP status code to an outcome: 2xx is success, 408/429 and
    /// 5xx are recoverable, everything else is fatal-and-drop.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            408 | 429 | 500..=599 => Self::Retry,
            _ => Self::Drop,
        }
    }
}

/// Consumes hits one at a time on behalf of a [`HitQueue`].
///
/// Implementations perform the actual network delivery. `process` is awaited
/// to completion before the next hit is presented, so at most one hit per
/// queue is in flight.
#[async_trait]
pub trait HitProcessor: Send + Sync + 'static {
    /// Processes one hit and reports the outcome.
    async fn process(&self, hit: &DataEntity) -> HitOutcome;

    /// How long to wait before re-presenting `hit` after a `Retry` outcome.
    fn retry_interval(&self, _hit: &DataEntity) -> Duration {
        DEFAULT_RETRY_INTERVAL
    }
}

struct Inner {
    queue: Arc<DataQueue>,
    processor: Arc<dyn HitProcessor>,
    suspended: AtomicBool,
    closed: AtomicBool,
    batch_limit: AtomicUsize,
    wake: Notify,
}

/// A persistent hit queue with a single worker task.
///
/// Starts suspended; call [`begin_processing`](Self::begin_processing) (or
/// deliver an opt-in privacy change) to start draining. Hits are removed
/// only after the processor reports `Success` or `Drop`, so delivery is
/// at-least-once across process restarts.
pub struct HitQueue {
    inner: Arc<Inner>,
}

impl HitQueue {
    /// Wraps `queue` and spawns the worker task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(queue: DataQueue, processor: Arc<dyn HitProcessor>) -> Self {
        let inner = Arc::new(Inner {
            queue: Arc::new(queue),
            processor,
            suspended: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            batch_limit: AtomicUsize::new(0),
            wake: Notify::new(),
        });

        tokio::spawn(worker_loop(Arc::clone(&inner)));

        Self { inner }
    }

    /// Appends a hit. Triggers processing if the queue is not suspended.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after [`close`](Self::close), or a storage error.
    pub fn queue(&self, hit: DataEntity) -> Result<(), QueueError> {
        self.inner.queue.add(&hit)?;
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Resumes the worker.
    pub fn begin_processing(&self) {
        self.inner.suspended.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Pauses the worker. A hit already handed to the processor completes;
    /// nothing further is presented until processing resumes.
    pub fn suspend(&self) {
        self.inner.suspended.store(true, Ordering::SeqCst);
    }

    /// Sets the batch threshold: the worker waits until at least `n` hits
    /// are queued, then drains that batch before waiting for the next
    /// threshold. Zero processes hits as they arrive.
    pub fn set_batch_limit(&self, n: usize) {
        self.inner.batch_limit.store(n, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Removes all queued hits.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after close, or a storage error.
    pub fn clear(&self) -> Result<(), QueueError> {
        self.inner.queue.clear()
    }

    /// Number of queued hits.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after close, or a storage error.
    pub fn count(&self) -> Result<usize, QueueError> {
        self.inner.queue.count()
    }

    /// Applies a privacy status change: opt-in resumes processing, unknown
    /// suspends (hits accumulate), opt-out suspends and clears.
    pub fn handle_privacy_change(&self, status: PrivacyStatus) {
        match status {
            PrivacyStatus::OptedIn => self.begin_processing(),
            PrivacyStatus::Unknown => self.suspend(),
            PrivacyStatus::OptedOut => {
                self.suspend();
                if let Err(e) = self.clear() {
                    tracing::error!(error = %e, "failed to clear hit queue on opt-out");
                }
            }
        }
    }

    /// Stops the worker and closes the underlying queue. Rows already on
    /// disk remain for the next open.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.queue.close();
        self.inner.wake.notify_one();
    }
}

impl Drop for HitQueue {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }
}

/// The single worker. Waits for the batch threshold, then drains that batch
/// one hit at a time, retrying recoverable failures in place.
async fn worker_loop(inner: Arc<Inner>) {
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            tracing::debug!("hit queue worker exiting");
            return;
        }
        if inner.suspended.load(Ordering::SeqCst) {
            inner.wake.notified().await;
            continue;
        }

        let queue = Arc::clone(&inner.queue);
        let count = match tokio::task::spawn_blocking(move || queue.count()).await {
            Ok(Ok(count)) => count,
            Ok(Err(QueueError::Closed)) => return,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to read hit queue depth");
                sleep(STORAGE_BACKOFF).await;
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "hit queue storage task join error");
                continue;
            }
        };

        let threshold = inner.batch_limit.load(Ordering::SeqCst).max(1);
        if count < threshold {
            inner.wake.notified().await;
            continue;
        }

        drain_batch(&inner, count).await;
    }
}

/// Processes up to `batch` hits, stopping early on suspension, close, or a
/// queue that empties underneath us (e.g. a concurrent clear).
async fn drain_batch(inner: &Arc<Inner>, batch: usize) {
    for _ in 0..batch {
        if inner.suspended.load(Ordering::SeqCst) || inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let queue = Arc::clone(&inner.queue);
        let hit = match tokio::task::spawn_blocking(move || queue.peek()).await {
            Ok(Ok(Some(hit))) => hit,
            Ok(Ok(None)) => return,
            Ok(Err(QueueError::Closed)) => return,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to peek hit queue");
                sleep(STORAGE_BACKOFF).await;
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "hit queue storage task join error");
                return;
            }
        };

        loop {
            let outcome = inner.processor.process(&hit).await;
            match outcome {
                HitOutcome::Success | HitOutcome::Drop => {
                    if outcome == HitOutcome::Drop {
                        tracing::warn!(hit = %hit.unique_id, "dropping hit after fatal outcome");
                    }
                    let queue = Arc::clone(&inner.queue);
                    let id = hit.unique_id.clone();
                    match tokio::task::spawn_blocking(move || queue.remove_matching(&id)).await {
                        Ok(Ok(true)) => break,
                        // The head changed underneath us (cleared or already
                        // removed); the batch accounting is stale, start over.
                        Ok(Ok(false)) => return,
                        Ok(Err(QueueError::Closed)) => return,
                        Ok(Err(e)) => {
                            tracing::error!(error = %e, "failed to remove processed hit");
                            return;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "hit queue storage task join error");
                            return;
                        }
                    }
                }
                HitOutcome::Retry => {
                    let interval = inner.processor.retry_interval(&hit);
                    tracing::debug!(hit = %hit.unique_id, ?interval, "recoverable failure, retrying");
                    sleep(interval).await;
                    if inner.suspended.load(Ordering::SeqCst)
                        || inner.closed.load(Ordering::SeqCst)
                    {
                        return;
                    }
                }
            }
        }
    }
}
