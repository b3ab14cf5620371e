//! Priority/age-ordered bulk task creation with backpressure and retry.
//!
//! Producers hand tasks to the batcher; the batcher collects them into
//! a pending list and flushes to a worker pool when either the batch
//! size is reached or the flush interval elapses. Ordering is
//! guaranteed within a batch only (priority desc, then age); consumers
//! that need strict per-process ordering must group by process
//! upstream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::types::Task;

/// The task service's create path, as the batcher sees it. A whole
/// batch succeeds or fails together.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn create_tasks(&self, tasks: &[Task]) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct BatcherConfig {
    /// Bounded intake capacity; `add` fails with `QueueFull` beyond it.
    pub queue_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub workers: usize,
    /// Per-batch retries after the first attempt.
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
            workers: 4,
            max_retries: 3,
            retry_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Default)]
struct Metrics {
    items_received: AtomicU64,
    items_processed: AtomicU64,
    items_failed: AtomicU64,
    batches_created: AtomicU64,
    batches_succeeded: AtomicU64,
    batches_failed: AtomicU64,
    processing_ms: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub items_received: u64,
    pub items_processed: u64,
    pub items_failed: u64,
    pub batches_created: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub processing_ms: u64,
}

struct Item {
    task: Task,
    priority: i32,
    enqueued_at: Instant,
    seq: u64,
    retry_count: u32,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl Item {
    fn resolve(mut self, result: Result<()>) {
        if let Some(done) = self.done.take() {
            // The waiter may have gone away (cancelled add_sync).
            let _ = done.send(result);
        }
    }
}

/// Amortizes task creation under load.
pub struct TaskBatcher {
    cfg: BatcherConfig,
    sink: Arc<dyn TaskSink>,
    intake_tx: std::sync::Mutex<Option<mpsc::Sender<Item>>>,
    intake_rx: std::sync::Mutex<Option<mpsc::Receiver<Item>>>,
    metrics: Arc<Metrics>,
    token: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    seq: AtomicU64,
}

impl TaskBatcher {
    /// Construct without starting; the intake accepts items immediately,
    /// workers run after [`TaskBatcher::start`].
    pub fn new(cfg: BatcherConfig, sink: Arc<dyn TaskSink>) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_size.max(1));
        Self {
            cfg,
            sink,
            intake_tx: std::sync::Mutex::new(Some(tx)),
            intake_rx: std::sync::Mutex::new(Some(rx)),
            metrics: Arc::new(Metrics::default()),
            token: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn make_item(&self, task: Task, priority: i32, done: Option<oneshot::Sender<Result<()>>>) -> Item {
        Item {
            task,
            priority,
            enqueued_at: Instant::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            retry_count: 0,
            done,
        }
    }

    /// Non-blocking enqueue. `QueueFull` when the bounded intake is at
    /// capacity; `Conflict` after `stop`.
    pub fn add(&self, task: Task, priority: i32) -> Result<()> {
        let tx = {
            let guard = self.intake_tx.lock().unwrap();
            guard
                .as_ref()
                .ok_or_else(|| EngineError::Conflict("batcher stopped".into()))?
                .clone()
        };
        let item = self.make_item(task, priority, None);
        match tx.try_send(item) {
            Ok(()) => {
                self.metrics.items_received.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(EngineError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(EngineError::Conflict("batcher stopped".into()))
            }
        }
    }

    /// Enqueue and wait until the item's batch completes (or
    /// permanently fails). Blocks on a full intake instead of
    /// returning `QueueFull`.
    pub async fn add_sync(&self, token: &CancellationToken, task: Task, priority: i32) -> Result<()> {
        let tx = {
            let guard = self.intake_tx.lock().unwrap();
            guard
                .as_ref()
                .ok_or_else(|| EngineError::Conflict("batcher stopped".into()))?
                .clone()
        };
        let (done_tx, done_rx) = oneshot::channel();
        let item = self.make_item(task, priority, Some(done_tx));

        tokio::select! {
            _ = token.cancelled() => return Err(EngineError::Cancelled("add_sync".into())),
            sent = tx.send(item) => {
                sent.map_err(|_| EngineError::Conflict("batcher stopped".into()))?;
            }
        }
        self.metrics.items_received.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            _ = token.cancelled() => Err(EngineError::Cancelled("add_sync".into())),
            result = done_rx => match result {
                Ok(r) => r,
                Err(_) => Err(EngineError::Conflict("batcher stopped".into())),
            },
        }
    }

    /// Spawn the flusher and worker pool.
    pub async fn start(&self) {
        let mut intake_rx = match self.intake_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return, // already started
        };

        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Item>>(self.cfg.workers.max(1));
        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));

        let mut tasks = self.tasks.lock().await;

        for worker_id in 0..self.cfg.workers.max(1) {
            let rx = batch_rx.clone();
            let sink = self.sink.clone();
            let cfg = self.cfg.clone();
            let metrics = self.metrics.clone();
            let token = self.token.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let batch = { rx.lock().await.recv().await };
                    match batch {
                        Some(batch) => {
                            process_batch(worker_id, &sink, &cfg, &metrics, &token, batch).await;
                        }
                        None => break,
                    }
                }
            }));
        }

        let cfg = self.cfg.clone();
        let metrics = self.metrics.clone();
        tasks.push(tokio::spawn(async move {
            let mut pending: Vec<Item> = Vec::new();
            let mut ticker = tokio::time::interval(cfg.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    maybe = intake_rx.recv() => match maybe {
                        Some(item) => {
                            pending.push(item);
                            if pending.len() >= cfg.batch_size {
                                flush(&mut pending, &batch_tx, &cfg, &metrics).await;
                            }
                        }
                        // Intake closed: drain with a final flush.
                        None => {
                            flush(&mut pending, &batch_tx, &cfg, &metrics).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        flush(&mut pending, &batch_tx, &cfg, &metrics).await;
                    }
                }
            }
            // Dropping batch_tx lets workers finish outstanding batches
            // and exit.
        }));
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let m = &self.metrics;
        MetricsSnapshot {
            items_received: m.items_received.load(Ordering::Relaxed),
            items_processed: m.items_processed.load(Ordering::Relaxed),
            items_failed: m.items_failed.load(Ordering::Relaxed),
            batches_created: m.batches_created.load(Ordering::Relaxed),
            batches_succeeded: m.batches_succeeded.load(Ordering::Relaxed),
            batches_failed: m.batches_failed.load(Ordering::Relaxed),
            processing_ms: m.processing_ms.load(Ordering::Relaxed),
        }
    }

    /// Close the intake, drain remaining items with a final flush, and
    /// wait for workers to finish.
    pub async fn stop(&self) {
        self.intake_tx.lock().unwrap().take();
        for handle in self.tasks.lock().await.drain(..) {
            let _ = handle.await;
        }
        self.token.cancel();
    }
}

/// Sort pending by (priority desc, age asc) and hand it to the worker
/// pool in `batch_size` chunks.
async fn flush(
    pending: &mut Vec<Item>,
    batch_tx: &mpsc::Sender<Vec<Item>>,
    cfg: &BatcherConfig,
    metrics: &Metrics,
) {
    if pending.is_empty() {
        return;
    }
    let mut items = std::mem::take(pending);
    items.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.enqueued_at.cmp(&b.enqueued_at))
            .then(a.seq.cmp(&b.seq))
    });

    while !items.is_empty() {
        let rest = items.split_off(cfg.batch_size.min(items.len()));
        let batch = std::mem::replace(&mut items, rest);
        metrics.batches_created.fetch_add(1, Ordering::Relaxed);
        debug!(batch_len = batch.len(), "flushing batch");
        if batch_tx.send(batch).await.is_err() {
            // Worker pool gone; nothing more to do.
            return;
        }
    }
}

async fn process_batch(
    worker_id: usize,
    sink: &Arc<dyn TaskSink>,
    cfg: &BatcherConfig,
    metrics: &Metrics,
    token: &CancellationToken,
    mut batch: Vec<Item>,
) {
    let started = Instant::now();
    let mut failures = 0u32;

    loop {
        let tasks: Vec<Task> = batch.iter().map(|i| i.task.clone()).collect();
        match sink.create_tasks(&tasks).await {
            Ok(()) => {
                metrics.batches_succeeded.fetch_add(1, Ordering::Relaxed);
                metrics
                    .items_processed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                for item in batch {
                    item.resolve(Ok(()));
                }
                break;
            }
            Err(err) => {
                metrics.batches_failed.fetch_add(1, Ordering::Relaxed);
                failures += 1;
                for item in &mut batch {
                    item.retry_count += 1;
                }
                if failures > cfg.max_retries {
                    warn!(worker_id, %err, "batch permanently failed");
                    metrics
                        .items_failed
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    let msg = err.to_string();
                    for item in batch {
                        item.resolve(Err(EngineError::MaxRetriesExceeded(msg.clone())));
                    }
                    break;
                }
                debug!(worker_id, attempt = failures, %err, "batch failed, retrying");
                tokio::select! {
                    _ = token.cancelled() => {
                        metrics
                            .items_failed
                            .fetch_add(batch.len() as u64, Ordering::Relaxed);
                        for item in batch {
                            item.resolve(Err(EngineError::Cancelled("batcher stopping".into())));
                        }
                        break;
                    }
                    _ = tokio::time::sleep(cfg.retry_interval) => {}
                }
            }
        }
    }

    metrics
        .processing_ms
        .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeInstance, NodeStatus, NodeType};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn task(label: &str) -> Task {
        let node = NodeInstance {
            id: Uuid::now_v7(),
            node_key: label.to_string(),
            process_id: Uuid::now_v7(),
            node_type: NodeType::Approval,
            status: NodeStatus::Active,
            name: label.to_string(),
            prev_nodes: vec![],
            next_nodes: vec![],
            parallel_nodes: vec![],
            branch_nodes: vec![],
            conditions: vec![],
            default_branch: None,
            assignees: vec!["alice".into()],
            candidates: vec![],
            countersign: Default::default(),
            assignee_strategy: Default::default(),
            continue_on_reject: false,
            properties: serde_json::Value::Null,
            handlers: vec![],
            retry_times: 0,
            retry_interval_ms: 0,
            is_working_day: false,
            timeout_duration_ms: None,
            timeout_strategy: Default::default(),
            entered_at: None,
            completed_at: None,
        };
        Task::new(node.process_id, &node, vec!["alice".into()])
    }

    /// Records created tasks; optionally fails the first N calls.
    struct RecordingSink {
        created: Mutex<Vec<String>>,
        fail_first: Mutex<u32>,
    }

    impl RecordingSink {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                created: Mutex::new(Vec::new()),
                fail_first: Mutex::new(fail_first),
            })
        }

        fn created(&self) -> Vec<String> {
            self.created.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskSink for RecordingSink {
        async fn create_tasks(&self, tasks: &[Task]) -> Result<()> {
            {
                let mut remaining = self.fail_first.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EngineError::database_timeout("injected"));
                }
            }
            let mut created = self.created.lock().unwrap();
            created.extend(tasks.iter().map(|t| t.node_key.clone()));
            Ok(())
        }
    }

    fn quick_cfg() -> BatcherConfig {
        BatcherConfig {
            queue_size: 64,
            batch_size: 10,
            flush_interval: Duration::from_millis(20),
            workers: 2,
            max_retries: 3,
            retry_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn add_sync_completes_when_batch_lands() {
        let sink = RecordingSink::new(0);
        let batcher = TaskBatcher::new(quick_cfg(), sink.clone());
        batcher.start().await;

        let token = CancellationToken::new();
        batcher.add_sync(&token, task("a"), 0).await.unwrap();
        assert_eq!(sink.created(), vec!["a".to_string()]);

        let m = batcher.metrics();
        assert_eq!(m.items_received, 1);
        assert_eq!(m.items_processed, 1);
        assert_eq!(m.items_failed, 0);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn backpressure_returns_queue_full_before_start() {
        // Spec scenario: QueueSize=2, BatchSize=10, workers not started.
        let sink = RecordingSink::new(0);
        let cfg = BatcherConfig {
            queue_size: 2,
            batch_size: 10,
            ..quick_cfg()
        };
        let batcher = TaskBatcher::new(cfg, sink.clone());

        batcher.add(task("a"), 0).unwrap();
        batcher.add(task("b"), 0).unwrap();
        let err = batcher.add(task("c"), 0).unwrap_err();
        assert!(matches!(err, EngineError::QueueFull));

        // Start workers; the queued items complete.
        batcher.start().await;
        batcher.stop().await;
        let mut created = sink.created();
        created.sort();
        assert_eq!(created, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn batch_is_ordered_by_priority_then_age() {
        let sink = RecordingSink::new(0);
        let cfg = BatcherConfig {
            workers: 1,
            flush_interval: Duration::from_millis(50),
            ..quick_cfg()
        };
        let batcher = TaskBatcher::new(cfg, sink.clone());

        batcher.add(task("old-low"), 1).unwrap();
        batcher.add(task("high"), 9).unwrap();
        batcher.add(task("young-low"), 1).unwrap();

        batcher.start().await;
        batcher.stop().await;

        assert_eq!(
            sink.created(),
            vec![
                "high".to_string(),
                "old-low".to_string(),
                "young-low".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn failed_batches_are_retried_then_succeed() {
        let sink = RecordingSink::new(2);
        let batcher = TaskBatcher::new(quick_cfg(), sink.clone());
        batcher.start().await;

        let token = CancellationToken::new();
        batcher.add_sync(&token, task("x"), 0).await.unwrap();
        assert_eq!(sink.created(), vec!["x".to_string()]);

        let m = batcher.metrics();
        assert_eq!(m.batches_failed, 2);
        assert_eq!(m.batches_succeeded, 1);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_item() {
        let sink = RecordingSink::new(u32::MAX);
        let cfg = BatcherConfig {
            max_retries: 1,
            ..quick_cfg()
        };
        let batcher = TaskBatcher::new(cfg, sink.clone());
        batcher.start().await;

        let token = CancellationToken::new();
        let err = batcher.add_sync(&token, task("x"), 0).await.unwrap_err();
        assert!(matches!(err, EngineError::MaxRetriesExceeded(_)));

        let m = batcher.metrics();
        assert_eq!(m.items_failed, 1);
        assert_eq!(m.items_processed, 0);
        assert!(m.items_received >= m.items_processed + m.items_failed);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_pending_items() {
        let sink = RecordingSink::new(0);
        let cfg = BatcherConfig {
            flush_interval: Duration::from_secs(3600), // never ticks in test
            ..quick_cfg()
        };
        let batcher = TaskBatcher::new(cfg, sink.clone());
        batcher.start().await;

        for label in ["a", "b", "c"] {
            batcher.add(task(label), 0).unwrap();
        }
        batcher.stop().await;

        let mut created = sink.created();
        created.sort();
        assert_eq!(
            created,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        let m = batcher.metrics();
        assert_eq!(m.items_processed, 3);
    }

    #[tokio::test]
    async fn add_after_stop_is_rejected() {
        let sink = RecordingSink::new(0);
        let batcher = TaskBatcher::new(quick_cfg(), sink);
        batcher.start().await;
        batcher.stop().await;
        let err = batcher.add(task("late"), 0).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }
}
