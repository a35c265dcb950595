//! Unit tests for the data queue and hit queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{DataEntity, DataQueue, HitOutcome, HitProcessor, HitQueue, QueueError};
use pulse_types::PrivacyStatus;

fn temp_queue(dir: &tempfile::TempDir) -> DataQueue {
    DataQueue::open(&dir.path().join("hits.db")).expect("should open queue")
}

fn hit(payload: &[u8]) -> DataEntity {
    DataEntity::new(payload.to_vec())
}

/// Polls `predicate` every 10 ms until it returns true or `timeout` elapses.
async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

// ── DataQueue tests ──────────────────────────────────────────────────

#[test]
fn add_peek_remove_preserve_fifo_order() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let queue = temp_queue(&dir);

    let first = hit(b"first");
    let second = hit(b"second");
    queue.add(&first).expect("add should succeed");
    queue.add(&second).expect("add should succeed");

    assert_eq!(queue.count().unwrap(), 2);
    assert_eq!(queue.peek().unwrap().as_ref(), Some(&first));

    queue.remove().expect("remove should succeed");
    assert_eq!(queue.peek().unwrap().as_ref(), Some(&second));

    queue.remove().expect("remove should succeed");
    assert_eq!(queue.peek().unwrap(), None);
    assert_eq!(queue.count().unwrap(), 0);
}

#[test]
fn peek_n_and_remove_n_operate_on_the_head() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let queue = temp_queue(&dir);

    for i in 0..5u8 {
        queue.add(&hit(&[i])).expect("add should succeed");
    }

    let head = queue.peek_n(3).expect("peek_n should succeed");
    assert_eq!(head.len(), 3);
    assert_eq!(head[0].data, vec![0]);
    assert_eq!(head[2].data, vec![2]);

    let removed = queue.remove_n(3).expect("remove_n should succeed");
    assert_eq!(removed, 3);
    assert_eq!(queue.peek().unwrap().unwrap().data, vec![3]);
}

#[test]
fn rows_survive_reopening_the_database() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("hits.db");

    let durable = hit(b"durable");
    {
        let queue = DataQueue::open(&path).expect("should open queue");
        queue.add(&durable).expect("add should succeed");
        queue.close();
    }

    let queue = DataQueue::open(&path).expect("should reopen queue");
    assert_eq!(queue.count().unwrap(), 1);
    assert_eq!(queue.peek().unwrap().as_ref(), Some(&durable));
}

#[test]
fn closed_queue_rejects_operations() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let queue = temp_queue(&dir);
    queue.close();

    assert!(matches!(queue.add(&hit(b"x")), Err(QueueError::Closed)));
    assert!(matches!(queue.peek(), Err(QueueError::Closed)));
    assert!(matches!(queue.count(), Err(QueueError::Closed)));
    assert!(matches!(queue.clear(), Err(QueueError::Closed)));
}

#[test]
fn capacity_limit_rejects_overflow() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let queue = DataQueue::open_with_capacity(&dir.path().join("hits.db"), Some(2))
        .expect("should open queue");

    queue.add(&hit(b"a")).expect("add should succeed");
    queue.add(&hit(b"b")).expect("add should succeed");
    assert!(matches!(queue.add(&hit(b"c")), Err(QueueError::Full(2))));

    queue.remove().expect("remove should succeed");
    queue.add(&hit(b"c")).expect("add should succeed after remove");
}

#[test]
fn remove_matching_only_removes_the_matching_head() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let queue = temp_queue(&dir);

    let a = hit(b"a");
    let b = hit(b"b");
    queue.add(&a).expect("add should succeed");
    queue.add(&b).expect("add should succeed");

    // Wrong id: the head is `a`, so nothing is removed.
    assert!(!queue.remove_matching(&b.unique_id).unwrap());
    assert_eq!(queue.count().unwrap(), 2);

    assert!(queue.remove_matching(&a.unique_id).unwrap());
    assert_eq!(queue.peek().unwrap().as_ref(), Some(&b));
}

// ── HitQueue tests ───────────────────────────────────────────────────

/// Processor that replays a scripted list of outcomes, then succeeds.
struct ScriptedProcessor {
    outcomes: Mutex<VecDeque<HitOutcome>>,
    calls: Mutex<Vec<Vec<u8>>>,
    retry: Duration,
}

impl ScriptedProcessor {
    fn new(outcomes: &[HitOutcome], retry: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
            retry,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls(&self) -> Vec<Vec<u8>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HitProcessor for ScriptedProcessor {
    async fn process(&self, hit: &DataEntity) -> HitOutcome {
        self.calls.lock().unwrap().push(hit.data.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(HitOutcome::Success)
    }

    fn retry_interval(&self, _hit: &DataEntity) -> Duration {
        self.retry
    }
}

#[tokio::test]
async fn hits_are_processed_in_order_after_begin() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let processor = ScriptedProcessor::new(&[], Duration::from_millis(10));
    let hits = HitQueue::new(temp_queue(&dir), processor.clone());

    hits.queue(hit(b"one")).expect("queue should succeed");
    hits.queue(hit(b"two")).expect("queue should succeed");

    // Suspended by default: nothing is processed yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(processor.call_count(), 0);

    hits.begin_processing();
    assert!(
        wait_until(Duration::from_secs(2), || processor.call_count() == 2).await,
        "both hits should be processed"
    );
    assert_eq!(processor.calls(), vec![b"one".to_vec(), b"two".to_vec()]);
    assert_eq!(hits.count().unwrap(), 0);
}

#[tokio::test]
async fn recoverable_failures_retry_the_same_hit() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let retry = Duration::from_millis(50);
    let processor = ScriptedProcessor::new(&[HitOutcome::Retry, HitOutcome::Retry], retry);
    let hits = HitQueue::new(temp_queue(&dir), processor.clone());

    let started = Instant::now();
    hits.queue(hit(b"flaky")).expect("queue should succeed");
    hits.begin_processing();

    assert!(
        wait_until(Duration::from_secs(2), || hits.count().unwrap_or(1) == 0).await,
        "the hit should eventually succeed and be removed"
    );

    // Same payload bytes presented exactly three times, two retry waits apart.
    assert_eq!(
        processor.calls(),
        vec![b"flaky".to_vec(), b"flaky".to_vec(), b"flaky".to_vec()]
    );
    assert!(started.elapsed() >= retry * 2);
}

#[tokio::test]
async fn fatal_outcome_drops_the_hit() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let processor = ScriptedProcessor::new(&[HitOutcome::Drop], Duration::from_millis(10));
    let hits = HitQueue::new(temp_queue(&dir), processor.clone());

    hits.queue(hit(b"bad")).expect("queue should succeed");
    hits.queue(hit(b"good")).expect("queue should succeed");
    hits.begin_processing();

    assert!(
        wait_until(Duration::from_secs(2), || hits.count().unwrap_or(1) == 0).await,
        "both hits should leave the queue"
    );
    // The dropped hit is presented once, never retried.
    assert_eq!(processor.calls(), vec![b"bad".to_vec(), b"good".to_vec()]);
}

#[tokio::test]
async fn batch_limit_holds_until_threshold_met() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let processor = ScriptedProcessor::new(&[], Duration::from_millis(10));
    let hits = HitQueue::new(temp_queue(&dir), processor.clone());

    hits.set_batch_limit(3);
    hits.begin_processing();

    hits.queue(hit(b"1")).expect("queue should succeed");
    hits.queue(hit(b"2")).expect("queue should succeed");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.call_count(), 0, "below threshold, nothing drains");

    hits.queue(hit(b"3")).expect("queue should succeed");
    assert!(
        wait_until(Duration::from_secs(2), || processor.call_count() == 3).await,
        "the full batch should drain once the threshold is met"
    );
    assert_eq!(hits.count().unwrap(), 0);
}

#[tokio::test]
async fn privacy_opt_out_clears_and_halts() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let processor = ScriptedProcessor::new(&[], Duration::from_millis(10));
    let hits = HitQueue::new(temp_queue(&dir), processor.clone());

    for i in 0..5u8 {
        hits.queue(hit(&[i])).expect("queue should succeed");
    }

    hits.handle_privacy_change(PrivacyStatus::OptedOut);
    assert_eq!(hits.count().unwrap(), 0);

    // Nothing is processed while opted out, even with new hits arriving.
    hits.queue(hit(b"late")).expect("queue should succeed");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.call_count(), 0);

    // A subsequent opt-in resumes processing of post-opt-out hits.
    hits.handle_privacy_change(PrivacyStatus::OptedIn);
    assert!(
        wait_until(Duration::from_secs(2), || processor.call_count() == 1).await,
        "post-opt-out hit should process after opt-in"
    );
    assert_eq!(processor.calls(), vec![b"late".to_vec()]);
}

#[tokio::test]
async fn privacy_unknown_suspends_but_accumulates() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let processor = ScriptedProcessor::new(&[], Duration::from_millis(10));
    let hits = HitQueue::new(temp_queue(&dir), processor.clone());

    hits.begin_processing();
    hits.handle_privacy_change(PrivacyStatus::Unknown);

    hits.queue(hit(b"held")).expect("queue should succeed");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.call_count(), 0);
    assert_eq!(hits.count().unwrap(), 1, "hits accumulate while unknown");
}

#[tokio::test]
async fn queued_hit_survives_restart_and_is_represented() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("hits.db");
    let payload = b"restart-me".to_vec();

    {
        let processor = ScriptedProcessor::new(&[], Duration::from_millis(10));
        let queue = DataQueue::open(&path).expect("should open queue");
        let hits = HitQueue::new(queue, processor.clone());
        // Never begin processing: the hit stays durable on disk.
        hits.queue(DataEntity::new(payload.clone()))
            .expect("queue should succeed");
        hits.close();
    }

    let processor = ScriptedProcessor::new(&[], Duration::from_millis(10));
    let queue = DataQueue::open(&path).expect("should reopen queue");
    let hits = HitQueue::new(queue, processor.clone());
    assert_eq!(hits.count().unwrap(), 1);

    hits.begin_processing();
    assert!(
        wait_until(Duration::from_secs(2), || processor.call_count() == 1).await,
        "the persisted hit should be re-presented"
    );
    assert_eq!(processor.calls(), vec![payload]);
}

#[test]
fn outcome_from_http_status() {
    assert_eq!(HitOutcome::from_status(200), HitOutcome::Success);
    assert_eq!(HitOutcome::from_status(204), HitOutcome::Success);
    assert_eq!(HitOutcome::from_status(408), HitOutcome::Retry);
    assert_eq!(HitOutcome::from_status(429), HitOutcome::Retry);
    assert_eq!(HitOutcome::from_status(503), HitOutcome::Retry);
    assert_eq!(HitOutcome::from_status(400), HitOutcome::Drop);
    assert_eq!(HitOutcome::from_status(301), HitOutcome::Drop);
    assert_eq!(HitOutcome::from_status(404), HitOutcome::Drop);
}
