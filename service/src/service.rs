//! Quote update orchestration.
//!
//! [`QuoteService`] accepts update requests, deduplicates them per pair,
//! hands new ones to the task queue and executes delivered tasks. Every
//! store mutation is a guarded transition, so duplicate or stale deliveries
//! end as no-ops instead of double completions.

use async_trait::async_trait;
use chrono::Utc;
use fxquote_common::{
    with_timeout, CurrencyPair, LatestQuote, Outcome, PairInput, PairValidator, QuoteError,
    QuoteStatus, QuoteUpdateView, Result, UpdateId,
};
use fxquote_fx::{RateQuote, RateSource};
use fxquote_store::{Admission, QuoteStore, StoreResult};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::TimeoutConfig;
use crate::latest_cache::LatestQuoteCache;
use crate::metrics::SharedMetrics;
use crate::task::{QuoteUpdatePayload, Task, TaskHandler, TaskQueue};

/// Answer to an update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateTicket {
    pub id: UpdateId,
    pub status: QuoteStatus,
    /// `false` when the request joined an update already in flight.
    pub created: bool,
}

/// How a delivered task ended when it did not ask for redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// The price was fetched and stored.
    Succeeded,
    /// The task named an invalid pair; the record was failed.
    Rejected,
    /// The record was already finished or superseded; nothing was done.
    Duplicate,
}

/// Dependency availability, as reported by [`QuoteService::readiness`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Readiness {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.unavailable().is_empty()
    }

    /// Names of the dependencies that failed their check.
    pub fn unavailable(&self) -> Vec<&'static str> {
        [
            ("store", &self.store),
            ("cache", &self.cache),
            ("queue", &self.queue),
        ]
        .into_iter()
        .filter(|(_, error)| error.is_some())
        .map(|(name, _)| name)
        .collect()
    }
}

/// The update orchestrator.
pub struct QuoteService {
    validator: PairValidator,
    store: Arc<dyn QuoteStore>,
    source: Arc<dyn RateSource>,
    latest: LatestQuoteCache,
    queue: Arc<dyn TaskQueue>,
    metrics: SharedMetrics,
    timeouts: TimeoutConfig,
}

impl QuoteService {
    pub fn new(
        validator: PairValidator,
        store: Arc<dyn QuoteStore>,
        source: Arc<dyn RateSource>,
        latest: LatestQuoteCache,
        queue: Arc<dyn TaskQueue>,
        metrics: SharedMetrics,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            validator,
            store,
            source,
            latest,
            queue,
            metrics,
            timeouts,
        }
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Request a refresh of `input`'s quote.
    ///
    /// Joins the pair's in-flight update when there is one. Otherwise a new
    /// `PENDING` record is created and exactly one task is enqueued for it;
    /// if the enqueue fails the record is failed before the error is returned.
    #[instrument(skip_all, fields(pair = tracing::field::Empty))]
    pub async fn request_update(&self, input: impl Into<PairInput>) -> Result<UpdateTicket> {
        let pair = self.validator.validate(input)?;
        tracing::Span::current().record("pair", tracing::field::display(&pair));

        let candidate = UpdateId::new();
        let admission = self
            .store_call("create_or_join", self.store.create_or_join(&pair, candidate))
            .await?;
        self.metrics.update_requested(admission.is_created());

        if let Admission::Joined { id, status } = admission {
            info!(update_id = %id, %status, "Joined in-flight update");
            return Ok(UpdateTicket {
                id,
                status,
                created: false,
            });
        }

        if let Err(e) = self.enqueue(candidate, &pair).await {
            self.metrics.enqueue_failed();
            error!(update_id = %candidate, error = %e, "Enqueue failed, abandoning update");
            let reason = format!("enqueue failed: {e}");
            if let Err(abandon) = self
                .store_call("abandon", self.store.abandon(candidate, &reason))
                .await
            {
                error!(update_id = %candidate, error = %abandon, "Could not abandon update");
            }
            return Err(e);
        }

        self.metrics.task_enqueued();
        info!(update_id = %candidate, "Update requested");
        Ok(UpdateTicket {
            id: candidate,
            status: QuoteStatus::Pending,
            created: true,
        })
    }

    /// Run a delivered update task.
    ///
    /// Returns `Err` when the task should be redelivered: the fetch failed
    /// (the failure is stored first) or the store could not be reached.
    #[instrument(skip_all, fields(update_id = %payload.update_id))]
    pub async fn execute(&self, payload: &QuoteUpdatePayload) -> Result<Execution> {
        let id = payload.update_id;
        let pair = match self
            .validator
            .validate((payload.base.as_str(), payload.quote.as_str()))
        {
            Ok(pair) => pair,
            Err(e) => return self.reject(id, e).await,
        };

        if let Some(done) = self.begin(id).await? {
            return Ok(done);
        }

        let fetched = with_timeout(self.timeouts.fetch, "rate fetch", async {
            self.source.get_rate(&pair).await.map_err(QuoteError::from)
        })
        .await;

        match fetched {
            Ok(quote) => self.record_success(id, &pair, quote).await,
            Err(e) => self.record_failure(id, e).await,
        }
    }

    /// Current state of one update.
    #[instrument(skip(self))]
    pub async fn get_result(&self, id: &str) -> Result<QuoteUpdateView> {
        let id = UpdateId::parse(id)?;
        let update = self.store_call("get_by_id", self.store.get_by_id(id)).await?;
        Ok(QuoteUpdateView::from(&update))
    }

    /// Latest known price for a pair. Never triggers a fetch.
    #[instrument(skip_all, fields(pair = tracing::field::Empty))]
    pub async fn get_latest(&self, input: impl Into<PairInput>) -> Result<QuoteUpdateView> {
        let pair = self.validator.validate(input)?;
        tracing::Span::current().record("pair", tracing::field::display(&pair));

        if let Some(latest) = self.latest.get(&pair).await {
            self.metrics.latest_lookup(true);
            debug!(update_id = %latest.id, "Latest quote served from cache");
            return Ok(QuoteUpdateView::from(&latest));
        }
        self.metrics.latest_lookup(false);

        let update = self
            .store_call("get_latest_success", self.store.get_latest_success(&pair))
            .await?;
        let latest = LatestQuote::from_update(&update).ok_or_else(|| {
            QuoteError::Infrastructure(format!("update {} is not a complete success", update.id))
        })?;

        self.latest.put(&latest).await;
        Ok(QuoteUpdateView::from(&latest))
    }

    /// Check store, cache and queue.
    pub async fn readiness(&self) -> Readiness {
        Readiness {
            store: self
                .store_call("ping", self.store.ping())
                .await
                .err()
                .map(|e| e.to_string()),
            cache: self.latest.ping().await.err().map(|e| e.to_string()),
            queue: self.queue.ping().await.err().map(|e| e.to_string()),
        }
    }

    /// Re-enqueue in-flight records whose task may have been lost.
    ///
    /// `PENDING` records idle for at least `pending_after` and `RUNNING`
    /// records idle for at least `running_after` get a fresh task. A record
    /// that still had a live task ends up delivered twice, which the guarded
    /// transitions absorb. Returns how many tasks were enqueued.
    #[instrument(skip(self))]
    pub async fn recover_in_flight(
        &self,
        pending_after: Duration,
        running_after: Duration,
    ) -> Result<usize> {
        let in_flight = self
            .store_call("list_in_flight", self.store.list_in_flight())
            .await?;
        let now = Utc::now();
        let mut recovered = 0;

        for update in in_flight {
            let threshold = match update.status {
                QuoteStatus::Running => running_after,
                _ => pending_after,
            };
            let since = update.updated_at.unwrap_or(update.requested_at);
            let idle = (now - since).to_std().unwrap_or_default();
            if idle < threshold {
                continue;
            }

            match self.enqueue(update.id, &update.pair).await {
                Ok(()) => {
                    self.metrics.task_enqueued();
                    self.metrics.task_recovered();
                    recovered += 1;
                    info!(
                        update_id = %update.id,
                        pair = %update.pair,
                        status = %update.status,
                        idle_ms = idle.as_millis() as u64,
                        "Re-enqueued orphaned update"
                    );
                }
                Err(e) => {
                    self.metrics.enqueue_failed();
                    error!(update_id = %update.id, error = %e, "Could not re-enqueue orphaned update");
                }
            }
        }

        Ok(recovered)
    }

    async fn enqueue(&self, id: UpdateId, pair: &CurrencyPair) -> Result<()> {
        let task = QuoteUpdatePayload::new(id, pair).into_task()?;
        self.queue.enqueue(task).await?;
        Ok(())
    }

    /// Move the record to `RUNNING`. `Some` means the delivery is finished
    /// without fetching.
    async fn begin(&self, id: UpdateId) -> Result<Option<Execution>> {
        let err = match self.store_call("mark_running", self.store.mark_running(id)).await {
            Ok(()) => return Ok(None),
            Err(e) => e,
        };

        let QuoteError::InvalidTransition { from, .. } = err else {
            return Err(err);
        };

        match from {
            Some(QuoteStatus::Running) => {
                warn!("Update already running, fetching anyway");
                Ok(None)
            }
            Some(QuoteStatus::Success) => {
                self.metrics.duplicate_delivery();
                info!("Update already succeeded, acknowledging duplicate delivery");
                Ok(Some(Execution::Duplicate))
            }
            Some(QuoteStatus::Failed) => {
                self.metrics.duplicate_delivery();
                info!("Update superseded by a newer attempt, acknowledging");
                Ok(Some(Execution::Duplicate))
            }
            Some(QuoteStatus::Pending) => Err(QuoteError::Infrastructure(format!(
                "update {id} could not leave PENDING"
            ))),
            None => Err(QuoteError::NotFound(id.to_string())),
        }
    }

    async fn reject(&self, id: UpdateId, reason: QuoteError) -> Result<Execution> {
        warn!(error = %reason, "Task names an invalid pair");
        if let Some(done) = self.begin(id).await? {
            return Ok(done);
        }
        let outcome = Outcome::Failed {
            error: reason.to_string(),
        };
        if !self.complete(id, outcome).await? {
            return Ok(Execution::Duplicate);
        }
        self.metrics.execution_failed();
        Ok(Execution::Rejected)
    }

    async fn record_success(
        &self,
        id: UpdateId,
        pair: &CurrencyPair,
        quote: RateQuote,
    ) -> Result<Execution> {
        let outcome = Outcome::Success {
            price: quote.price.clone(),
            observed_at: quote.observed_at,
        };
        if !self.complete(id, outcome).await? {
            return Ok(Execution::Duplicate);
        }

        self.metrics.execution_succeeded();
        info!(pair = %pair, price = %quote.price, "Quote updated");

        match self.store_call("get_by_id", self.store.get_by_id(id)).await {
            Ok(update) => {
                if let Some(latest) = LatestQuote::from_update(&update) {
                    self.latest.put(&latest).await;
                }
            }
            Err(e) => warn!(error = %e, "Could not read completed update for the latest cache"),
        }
        Ok(Execution::Succeeded)
    }

    async fn record_failure(&self, id: UpdateId, cause: QuoteError) -> Result<Execution> {
        let outcome = Outcome::Failed {
            error: cause.to_string(),
        };
        if !self.complete(id, outcome).await? {
            return Ok(Execution::Duplicate);
        }

        self.metrics.execution_failed();
        warn!(error = %cause, "Quote fetch failed");
        Err(cause)
    }

    /// Apply a completion. `Ok(false)` means another delivery already finished it.
    async fn complete(&self, id: UpdateId, outcome: Outcome) -> Result<bool> {
        match self.store_call("complete", self.store.complete(id, outcome)).await {
            Ok(()) => Ok(true),
            Err(QuoteError::InvalidTransition { from, .. }) => {
                self.metrics.duplicate_delivery();
                info!(
                    from = from.map(|s| s.as_str()).unwrap_or("<missing>"),
                    "Completion rejected, treating as duplicate delivery"
                );
                Ok(false)
            }
            Err(e) => {
                error!(error = %e, "Could not complete update");
                Err(e)
            }
        }
    }

    async fn store_call<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        with_timeout(self.timeouts.store, operation, async {
            fut.await.map_err(QuoteError::from)
        })
        .await
    }
}

#[async_trait]
impl TaskHandler for QuoteService {
    async fn handle(&self, task: &Task) -> Result<()> {
        let payload = match QuoteUpdatePayload::from_task(task) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = %task.kind, error = %e, "Dropping undecodable task");
                return Err(e);
            }
        };
        self.execute(&payload).await.map(|_| ())
    }
}
