//! Application wiring and lifecycle.

use fxquote_common::{HashCache, MemoryHashCache, QuoteError, QuoteUpdateView, Result, UpdateId};
use fxquote_fx::{build_source_stack, RateSource};
use fxquote_store::SqliteQuoteStore;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::ServiceConfig;
use crate::latest_cache::LatestQuoteCache;
use crate::metrics::{Metrics, SharedMetrics};
use crate::queue::{InProcessQueue, WorkerPool};
use crate::service::QuoteService;
use crate::state::AppState;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

/// A fully wired quote service with its worker pool.
pub struct App {
    config: ServiceConfig,
    state: Arc<RwLock<AppState>>,
    store: SqliteQuoteStore,
    queue: Arc<InProcessQueue>,
    service: Arc<QuoteService>,
    workers: Mutex<Option<WorkerPool>>,
    recovery: Mutex<Option<RecoverySweep>>,
    metrics: SharedMetrics,
}

/// Background loop re-enqueueing in-flight records that outlived their task.
struct RecoverySweep {
    handle: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RecoverySweep {
    fn spawn(service: Arc<QuoteService>, orphan_after: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            let period = orphan_after.max(MIN_SWEEP_PERIOD);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        match service.recover_in_flight(orphan_after, orphan_after).await {
                            Ok(0) => {}
                            Ok(recovered) => info!(recovered, "Recovery sweep re-enqueued orphaned updates"),
                            Err(e) => warn!(error = %e, "Recovery sweep failed"),
                        }
                    }
                }
            }
        });
        Self {
            handle,
            shutdown_tx,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            error!(error = %e, "Recovery sweep ended abnormally");
        }
    }
}

impl App {
    /// Connect the store and build the configured rate sources.
    #[instrument(skip_all)]
    pub async fn build(config: ServiceConfig) -> Result<Self> {
        let cache: Arc<dyn HashCache> = Arc::new(MemoryHashCache::new());
        let source = build_source_stack(&config.sources, cache.clone())?;
        Self::assemble(config, source, cache).await
    }

    /// Like [`App::build`], with a caller-supplied rate source.
    pub async fn with_source(config: ServiceConfig, source: Arc<dyn RateSource>) -> Result<Self> {
        Self::assemble(config, source, Arc::new(MemoryHashCache::new())).await
    }

    async fn assemble(
        config: ServiceConfig,
        source: Arc<dyn RateSource>,
        cache: Arc<dyn HashCache>,
    ) -> Result<Self> {
        let validator = config.pair_validator()?;
        let store = SqliteQuoteStore::connect(&config.database).await?;
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(InProcessQueue::new(config.worker.clone(), metrics.clone()));
        let latest = LatestQuoteCache::new(cache, config.latest_ttl, config.timeouts.cache);

        let service = Arc::new(QuoteService::new(
            validator,
            Arc::new(store.clone()),
            source,
            latest,
            queue.clone(),
            metrics.clone(),
            config.timeouts.clone(),
        ));

        info!(database = %config.database.url, "Application assembled");

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(AppState::Starting)),
            store,
            queue,
            service,
            workers: Mutex::new(None),
            recovery: Mutex::new(None),
            metrics,
        })
    }

    pub fn service(&self) -> &Arc<QuoteService> {
        &self.service
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn state(&self) -> AppState {
        *self.state.read()
    }

    pub fn is_accepting_requests(&self) -> bool {
        self.state.read().accepts_requests()
    }

    /// Start the worker pool and recover updates orphaned by a previous run.
    ///
    /// Tasks live only in this process, so every `PENDING` record found at
    /// startup lost its task. `RUNNING` records are re-enqueued once they
    /// have been idle for `orphan_after`, here and by a periodic sweep.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        self.transition(AppState::Running)?;
        let pool = self.queue.start(self.service.clone())?;
        *self.workers.lock() = Some(pool);

        let orphan_after = self.config.worker.orphan_after;
        match self.service.recover_in_flight(Duration::ZERO, orphan_after).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "Re-enqueued updates left in flight by a previous run"),
            Err(e) => warn!(error = %e, "Startup recovery failed, leaving it to the sweep"),
        }
        *self.recovery.lock() = Some(RecoverySweep::spawn(self.service.clone(), orphan_after));

        info!(concurrency = self.config.worker.concurrency, "Application running");
        Ok(())
    }

    /// Close intake, drain the workers and close the store.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        match self.state() {
            AppState::Running => self.transition(AppState::ShuttingDown)?,
            AppState::Starting => {}
            AppState::ShuttingDown | AppState::Stopped => return Ok(()),
        }

        let sweep = self.recovery.lock().take();
        if let Some(sweep) = sweep {
            sweep.stop().await;
        }

        self.queue.close();
        let pool = self.workers.lock().take();
        if let Some(pool) = pool {
            if !pool.shutdown(self.config.worker.shutdown_timeout).await {
                warn!("Workers did not drain before the shutdown timeout");
            }
        }

        self.store.close().await;
        self.transition(AppState::Stopped)?;

        let snapshot = self.metrics.snapshot();
        info!(
            created = snapshot.updates_created,
            joined = snapshot.updates_joined,
            succeeded = snapshot.executions_succeeded,
            failed = snapshot.executions_failed,
            "Application stopped"
        );
        Ok(())
    }

    /// Poll an update until it reaches a terminal status or `timeout` passes.
    ///
    /// Returns the last view seen either way.
    pub async fn await_result(&self, id: UpdateId, timeout: Duration) -> Result<QuoteUpdateView> {
        let id = id.to_string();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self.service.get_result(&id).await?;
            if view.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(view);
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    fn transition(&self, next: AppState) -> Result<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(next) {
            return Err(QuoteError::Infrastructure(format!(
                "cannot move application from {:?} to {:?}",
                *state, next
            )));
        }
        *state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxquote_common::QuoteStatus;
    use fxquote_fx::MockRateSource;
    use fxquote_store::QuoteStore;

    fn memory_config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.database.url = "sqlite::memory:".to_string();
        config.worker.retry_base_delay = Duration::from_millis(5);
        config.worker.retry_max_delay = Duration::from_millis(20);
        config
    }

    async fn app_with(source: Arc<MockRateSource>) -> App {
        App::with_source(memory_config(), source).await.unwrap()
    }

    fn disk_config(dir: &tempfile::TempDir) -> ServiceConfig {
        let mut config = memory_config();
        config.database.url = format!("sqlite://{}", dir.path().join("quotes.db").display());
        config
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let app = app_with(Arc::new(MockRateSource::always("mock", "1.0850"))).await;
        assert_eq!(app.state(), AppState::Starting);
        assert!(!app.is_accepting_requests());

        app.start().await.unwrap();
        assert_eq!(app.state(), AppState::Running);
        assert!(app.service().readiness().await.is_ready());
        assert!(app.start().await.is_err());

        app.stop().await.unwrap();
        assert_eq!(app.state(), AppState::Stopped);
        app.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_update() {
        let app = app_with(Arc::new(MockRateSource::always("mock", "1.0850"))).await;
        app.start().await.unwrap();

        let ticket = app.service().request_update("USD/EUR").await.unwrap();
        let view = app.await_result(ticket.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(view.status, QuoteStatus::Success);
        assert_eq!(view.price.as_deref(), Some("1.0850"));

        let latest = app.service().get_latest(("USD", "EUR")).await.unwrap();
        assert_eq!(latest.id, ticket.id);

        app.stop().await.unwrap();
        assert_eq!(app.metrics().snapshot().executions_succeeded, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_redelivered_by_workers() {
        let source = Arc::new(MockRateSource::always("mock", "0.8571"));
        source.push_error("connection refused");
        let app = app_with(source.clone()).await;
        app.start().await.unwrap();

        let ticket = app.service().request_update("EUR/GBP").await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let view = loop {
            let view = app.service().get_result(&ticket.id.to_string()).await.unwrap();
            if view.status == QuoteStatus::Success || tokio::time::Instant::now() > deadline {
                break view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        assert_eq!(view.status, QuoteStatus::Success);
        assert_eq!(source.calls(), 2);
        app.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_enqueued_work() {
        let app = app_with(Arc::new(MockRateSource::always("mock", "151.20"))).await;
        app.start().await.unwrap();

        app.service().request_update("USD/JPY").await.unwrap();
        app.stop().await.unwrap();

        let snapshot = app.metrics().snapshot();
        assert_eq!(snapshot.tasks_enqueued, 1);
        assert_eq!(snapshot.executions_succeeded, 1);
    }

    #[tokio::test]
    async fn test_restart_recovers_pending_update() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockRateSource::always("mock", "1.0850"));

        // Enqueued but never executed: the process goes away with the task.
        let first = App::with_source(disk_config(&dir), source.clone()).await.unwrap();
        let orphan = first.service().request_update("USD/EUR").await.unwrap();
        assert!(orphan.created);
        drop(first);

        let app = App::with_source(disk_config(&dir), source.clone()).await.unwrap();
        let again = app.service().request_update("USD/EUR").await.unwrap();
        assert_eq!(again.id, orphan.id);
        assert!(!again.created);

        app.start().await.unwrap();
        let view = app.await_result(orphan.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(view.status, QuoteStatus::Success);
        assert_eq!(source.calls(), 1);

        app.stop().await.unwrap();
        let snapshot = app.metrics().snapshot();
        assert_eq!(snapshot.tasks_recovered, 1);
        assert_eq!(snapshot.executions_succeeded, 1);
    }

    #[tokio::test]
    async fn test_sweep_recovers_running_update_once_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = disk_config(&dir);
        config.worker.task_timeout = Duration::from_millis(100);
        config.worker.orphan_after = Duration::from_millis(500);

        // Left RUNNING by a run that died mid-fetch.
        let first = App::with_source(config.clone(), Arc::new(MockRateSource::always("mock", "1.0")))
            .await
            .unwrap();
        let orphan = first.service().request_update("EUR/GBP").await.unwrap();
        drop(first);
        let store = SqliteQuoteStore::connect(&config.database).await.unwrap();
        store.mark_running(orphan.id).await.unwrap();
        store.close().await;

        let app = App::with_source(config, Arc::new(MockRateSource::always("mock", "0.8571")))
            .await
            .unwrap();
        app.start().await.unwrap();
        let view = app.service().get_result(&orphan.id.to_string()).await.unwrap();
        assert_eq!(view.status, QuoteStatus::Running);

        let view = app.await_result(orphan.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(view.status, QuoteStatus::Success);
        assert_eq!(view.price.as_deref(), Some("0.8571"));

        app.stop().await.unwrap();
        assert_eq!(app.metrics().snapshot().tasks_recovered, 1);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let app = app_with(Arc::new(MockRateSource::always("mock", "1.0"))).await;
        app.stop().await.unwrap();
        assert_eq!(app.state(), AppState::Stopped);
        assert!(app.start().await.is_err());
    }
}
