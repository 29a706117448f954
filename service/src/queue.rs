//! In-process task queue with a bounded worker pool.
//!
//! Delivery is at-least-once: a handler error that is retryable, or a
//! delivery that exceeds the task timeout, is redelivered after an
//! exponential backoff until `max_retry` redeliveries have been made.
//! Redeliveries are only scheduled while the queue is open.

use async_trait::async_trait;
use fxquote_common::QuoteError;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::metrics::SharedMetrics;
use crate::task::{QueueError, Task, TaskHandler, TaskQueue};

#[derive(Debug)]
struct Delivery {
    task: Task,
    /// 0 for the first delivery.
    attempt: u32,
}

/// Bounded in-memory [`TaskQueue`].
pub struct InProcessQueue {
    config: WorkerConfig,
    sender: mpsc::Sender<Delivery>,
    receiver: Mutex<Option<mpsc::Receiver<Delivery>>>,
    closed: Arc<AtomicBool>,
    metrics: SharedMetrics,
}

impl InProcessQueue {
    pub fn new(config: WorkerConfig, metrics: SharedMetrics) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            config,
            sender,
            receiver: Mutex::new(Some(receiver)),
            closed: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    /// Stop accepting tasks and redeliveries.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Spawn the worker pool. Can be called once.
    pub fn start(&self, handler: Arc<dyn TaskHandler>) -> Result<WorkerPool, QueueError> {
        let receiver = self.receiver.lock().take().ok_or(QueueError::AlreadyStarted)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let dispatcher = Arc::new(Dispatcher {
            handler,
            semaphore: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            config: self.config.clone(),
            sender: self.sender.clone(),
            closed: self.closed.clone(),
            metrics: self.metrics.clone(),
        });

        info!(
            concurrency = self.config.concurrency,
            max_retry = self.config.max_retry,
            "Worker pool started"
        );

        Ok(WorkerPool {
            handle: tokio::spawn(dispatcher.run(receiver, shutdown_rx)),
            shutdown_tx,
            closed: self.closed.clone(),
        })
    }
}

#[async_trait]
impl TaskQueue for InProcessQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.sender
            .try_send(Delivery { task, attempt: 0 })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full(self.config.queue_capacity),
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Handle on the running worker pool.
pub struct WorkerPool {
    handle: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
    closed: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Close intake, run what is already queued, and wait for in-flight tasks.
    ///
    /// Returns `false` if `timeout` expired first; remaining tasks are aborted.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(()).await;

        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                info!("Worker pool drained");
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "Worker pool dispatcher failed");
                false
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Worker pool drain timed out");
                handle.abort();
                false
            }
        }
    }
}

struct Dispatcher {
    handler: Arc<dyn TaskHandler>,
    semaphore: Arc<Semaphore>,
    config: WorkerConfig,
    /// Used for redelivery.
    sender: mpsc::Sender<Delivery>,
    closed: Arc<AtomicBool>,
    metrics: SharedMetrics,
}

impl Dispatcher {
    async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Delivery>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                delivery = receiver.recv() => match delivery {
                    Some(delivery) => self.dispatch(delivery).await,
                    None => break,
                },
            }
        }

        while let Ok(delivery) = receiver.try_recv() {
            self.dispatch(delivery).await;
        }

        // Every permit back means every spawned task has finished.
        let permits = self.config.concurrency.max(1) as u32;
        if let Ok(all) = self.semaphore.acquire_many(permits).await {
            drop(all);
        }
    }

    async fn dispatch(self: &Arc<Self>, delivery: Delivery) {
        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(delivery).await;
            drop(permit);
        });
    }

    async fn execute(&self, delivery: Delivery) {
        let timeout = self.config.task_timeout;
        let result = match tokio::time::timeout(timeout, self.handler.handle(&delivery.task)).await {
            Ok(result) => result,
            Err(_) => Err(QuoteError::Timeout(format!(
                "task exceeded {}ms",
                timeout.as_millis()
            ))),
        };

        let kind = delivery.task.kind.as_str();
        match result {
            Ok(()) => debug!(kind, attempt = delivery.attempt, "Task handled"),
            Err(e) if e.is_retryable() && delivery.attempt < self.config.max_retry => {
                warn!(kind, attempt = delivery.attempt, error = %e, "Task failed, scheduling redelivery");
                self.redeliver(delivery);
            }
            Err(e) if e.is_retryable() => {
                error!(kind, attempt = delivery.attempt, error = %e, "Task failed, retries exhausted");
            }
            Err(e) => {
                warn!(kind, error = %e, code = e.error_code(), "Task failed permanently, dropping");
            }
        }
    }

    fn redeliver(&self, delivery: Delivery) {
        let attempt = delivery.attempt + 1;
        let delay = retry_delay(&self.config, attempt);
        let sender = self.sender.clone();
        let closed = self.closed.clone();
        self.metrics.task_retried();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if closed.load(Ordering::SeqCst) {
                warn!(kind = %delivery.task.kind, attempt, "Queue closed, redelivery dropped");
                return;
            }
            let next = Delivery {
                task: delivery.task,
                attempt,
            };
            if sender.send(next).await.is_err() {
                warn!(attempt, "Queue gone, redelivery dropped");
            }
        });
    }
}

/// Delay before redelivery `attempt` (1-based): doubling from the base
/// delay, capped at the max delay, plus up to 25% jitter.
fn retry_delay(config: &WorkerConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let capped = config
        .retry_base_delay
        .saturating_mul(factor)
        .min(config.retry_max_delay);
    let jitter_ms = (capped.as_millis() / 4) as u64;
    if jitter_ms == 0 {
        return capped;
    }
    capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            max_retry: 2,
            task_timeout: Duration::from_millis(200),
            queue_capacity: 16,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(2),
            orphan_after: Duration::from_secs(1),
        }
    }

    fn task(n: u8) -> Task {
        Task {
            kind: "test".to_string(),
            payload: vec![n],
        }
    }

    /// Counts calls and answers with a fixed result after an optional delay.
    struct ScriptedHandler {
        calls: AtomicUsize,
        result: Result<(), QuoteError>,
        delay: Duration,
    }

    impl ScriptedHandler {
        fn new(result: Result<(), QuoteError>) -> Arc<Self> {
            Self::slow(result, Duration::ZERO)
        }

        fn slow(result: Result<(), QuoteError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                result,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        async fn handle(&self, _task: &Task) -> Result<(), QuoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.result.clone()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_delivers_each_task_once_on_success() {
        let queue = InProcessQueue::new(fast_config(), Arc::new(Metrics::new()));
        let handler = ScriptedHandler::new(Ok(()));
        let pool = queue.start(handler.clone()).unwrap();

        for n in 0..3 {
            assert_ok!(queue.enqueue(task(n)).await);
        }
        wait_until(|| handler.calls() == 3).await;
        assert!(pool.shutdown(Duration::from_secs(1)).await);
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_redelivered_up_to_max_retry() {
        let metrics = Arc::new(Metrics::new());
        let queue = InProcessQueue::new(fast_config(), metrics.clone());
        let handler = ScriptedHandler::new(Err(QuoteError::Infrastructure("store down".into())));
        let pool = queue.start(handler.clone()).unwrap();

        queue.enqueue(task(1)).await.unwrap();
        wait_until(|| handler.calls() == 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(handler.calls(), 3);
        assert_eq!(metrics.snapshot().task_retries, 2);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dropped() {
        let queue = InProcessQueue::new(fast_config(), Arc::new(Metrics::new()));
        let handler = ScriptedHandler::new(Err(QuoteError::InvalidFormat("bad payload".into())));
        let pool = queue.start(handler.clone()).unwrap();

        queue.enqueue(task(1)).await.unwrap();
        wait_until(|| handler.calls() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(handler.calls(), 1);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_task_timeout_counts_as_retryable_failure() {
        let config = WorkerConfig {
            task_timeout: Duration::from_millis(20),
            max_retry: 1,
            ..fast_config()
        };
        let queue = InProcessQueue::new(config, Arc::new(Metrics::new()));
        let handler = ScriptedHandler::slow(Ok(()), Duration::from_secs(5));
        let pool = queue.start(handler.clone()).unwrap();

        queue.enqueue(task(1)).await.unwrap();
        wait_until(|| handler.calls() == 2).await;
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_full_and_closed_queue_refuse_tasks() {
        let config = WorkerConfig {
            queue_capacity: 1,
            ..fast_config()
        };
        let queue = InProcessQueue::new(config, Arc::new(Metrics::new()));

        assert_ok!(queue.enqueue(task(1)).await);
        assert_eq!(queue.enqueue(task(2)).await, Err(QueueError::Full(1)));

        queue.close();
        assert_eq!(queue.enqueue(task(3)).await, Err(QueueError::Closed));
        assert_eq!(queue.ping().await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_tasks() {
        let config = WorkerConfig {
            concurrency: 1,
            ..fast_config()
        };
        let queue = InProcessQueue::new(config, Arc::new(Metrics::new()));
        let handler = ScriptedHandler::slow(Ok(()), Duration::from_millis(10));
        let pool = queue.start(handler.clone()).unwrap();

        for n in 0..5 {
            queue.enqueue(task(n)).await.unwrap();
        }
        assert!(pool.shutdown(Duration::from_secs(2)).await);
        assert_eq!(handler.calls(), 5);
        assert_err!(queue.enqueue(task(9)).await);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let queue = InProcessQueue::new(fast_config(), Arc::new(Metrics::new()));
        let pool = queue.start(ScriptedHandler::new(Ok(()))).unwrap();
        assert!(matches!(
            queue.start(ScriptedHandler::new(Ok(()))),
            Err(QueueError::AlreadyStarted)
        ));
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = WorkerConfig {
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_millis(300),
            ..fast_config()
        };
        for (attempt, base) in [(1, 100), (2, 200), (3, 300), (10, 300)] {
            let delay = retry_delay(&config, attempt).as_millis() as u64;
            assert!(delay >= base && delay <= base + base / 4, "attempt {attempt}: {delay}ms");
        }
    }

    proptest! {
        #[test]
        fn prop_retry_delay_stays_within_jittered_cap(
            base_ms in 1u64..1_000,
            max_ms in 1_000u64..60_000,
            attempt in 1u32..40,
        ) {
            let config = WorkerConfig {
                retry_base_delay: Duration::from_millis(base_ms),
                retry_max_delay: Duration::from_millis(max_ms),
                ..fast_config()
            };
            let delay = retry_delay(&config, attempt);
            prop_assert!(delay >= Duration::from_millis(base_ms));
            prop_assert!(delay <= Duration::from_millis(max_ms + max_ms / 4));
        }
    }
}
