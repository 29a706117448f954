//! Metrics collection for quote update monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Service metrics.
#[derive(Debug)]
pub struct Metrics {
    /// Update requests that passed validation.
    pub updates_requested: AtomicU64,
    /// Requests that created a new record.
    pub updates_created: AtomicU64,
    /// Requests that joined an in-flight record.
    pub updates_joined: AtomicU64,
    /// Tasks handed to the queue.
    pub tasks_enqueued: AtomicU64,
    /// Tasks the queue refused.
    pub enqueue_failures: AtomicU64,
    /// Executions that stored a price.
    pub executions_succeeded: AtomicU64,
    /// Executions that stored a failure.
    pub executions_failed: AtomicU64,
    /// Deliveries acknowledged without work.
    pub duplicate_deliveries: AtomicU64,
    /// Redeliveries scheduled by the queue.
    pub task_retries: AtomicU64,
    /// Tasks re-enqueued at startup for orphaned in-flight records.
    pub tasks_recovered: AtomicU64,
    /// Latest-quote reads served from cache.
    pub latest_cache_hits: AtomicU64,
    /// Latest-quote reads that fell back to the store.
    pub latest_cache_misses: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            updates_requested: AtomicU64::new(0),
            updates_created: AtomicU64::new(0),
            updates_joined: AtomicU64::new(0),
            tasks_enqueued: AtomicU64::new(0),
            enqueue_failures: AtomicU64::new(0),
            executions_succeeded: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            duplicate_deliveries: AtomicU64::new(0),
            task_retries: AtomicU64::new(0),
            tasks_recovered: AtomicU64::new(0),
            latest_cache_hits: AtomicU64::new(0),
            latest_cache_misses: AtomicU64::new(0),
        }
    }

    /// Record a validated update request and whether it created a record.
    pub fn update_requested(&self, created: bool) {
        self.updates_requested.fetch_add(1, Ordering::Relaxed);
        if created {
            self.updates_created.fetch_add(1, Ordering::Relaxed);
        } else {
            self.updates_joined.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn task_enqueued(&self) {
        self.tasks_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueue_failed(&self) {
        self.enqueue_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_succeeded(&self) {
        self.executions_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_failed(&self) {
        self.executions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_delivery(&self) {
        self.duplicate_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.task_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_recovered(&self) {
        self.tasks_recovered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a latest-quote cache lookup.
    pub fn latest_lookup(&self, hit: bool) {
        if hit {
            self.latest_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.latest_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            updates_requested: self.updates_requested.load(Ordering::Relaxed),
            updates_created: self.updates_created.load(Ordering::Relaxed),
            updates_joined: self.updates_joined.load(Ordering::Relaxed),
            tasks_enqueued: self.tasks_enqueued.load(Ordering::Relaxed),
            enqueue_failures: self.enqueue_failures.load(Ordering::Relaxed),
            executions_succeeded: self.executions_succeeded.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            duplicate_deliveries: self.duplicate_deliveries.load(Ordering::Relaxed),
            task_retries: self.task_retries.load(Ordering::Relaxed),
            tasks_recovered: self.tasks_recovered.load(Ordering::Relaxed),
            latest_cache_hits: self.latest_cache_hits.load(Ordering::Relaxed),
            latest_cache_misses: self.latest_cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("updates_requested_total", "Validated update requests", snapshot.updates_requested),
            ("updates_created_total", "Update requests that created a record", snapshot.updates_created),
            ("updates_joined_total", "Update requests joined to an in-flight record", snapshot.updates_joined),
            ("tasks_enqueued_total", "Tasks handed to the queue", snapshot.tasks_enqueued),
            ("enqueue_failures_total", "Tasks refused by the queue", snapshot.enqueue_failures),
            ("executions_succeeded_total", "Executions that stored a price", snapshot.executions_succeeded),
            ("executions_failed_total", "Executions that stored a failure", snapshot.executions_failed),
            ("duplicate_deliveries_total", "Deliveries acknowledged without work", snapshot.duplicate_deliveries),
            ("task_retries_total", "Task redeliveries scheduled", snapshot.task_retries),
            ("tasks_recovered_total", "Orphaned updates re-enqueued at startup", snapshot.tasks_recovered),
            ("latest_cache_hits_total", "Latest quote reads served from cache", snapshot.latest_cache_hits),
            ("latest_cache_misses_total", "Latest quote reads served from the store", snapshot.latest_cache_misses),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP fxquote_{name} {help}\n# TYPE fxquote_{name} counter\nfxquote_{name} {value}\n\n"
            ));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub updates_requested: u64,
    pub updates_created: u64,
    pub updates_joined: u64,
    pub tasks_enqueued: u64,
    pub enqueue_failures: u64,
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub duplicate_deliveries: u64,
    pub task_retries: u64,
    pub tasks_recovered: u64,
    pub latest_cache_hits: u64,
    pub latest_cache_misses: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
