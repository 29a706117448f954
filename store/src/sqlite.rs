//! SQLite-backed quote store.
//!
//! Admission relies on a partial unique index over in-flight statuses, so the
//! database itself arbitrates concurrent `create_or_join` calls across
//! processes. Transitions are single conditional `UPDATE`s.

use async_trait::async_trait;
use chrono::Utc;
use fxquote_common::{
    from_unix_millis, to_unix_millis, Currency, CurrencyPair, Outcome, Price, QuoteStatus,
    QuoteUpdate, UpdateId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::{Admission, QuoteStore, ADMISSION_ATTEMPTS};

const SELECT_COLUMNS: &str =
    "SELECT id, base, quote, status, price, observed_at, error, requested_at, updated_at FROM quote_updates";

/// Connection settings for [`SqliteQuoteStore`].
#[derive(Debug, Clone)]
pub struct SqliteStoreConfig {
    /// e.g. `sqlite://fxquote.db` or `sqlite::memory:`.
    pub url: String,
    pub max_connections: u32,
    /// How long a writer waits on a locked database.
    pub busy_timeout: Duration,
    /// How long a caller waits for a pooled connection.
    pub acquire_timeout: Duration,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://fxquote.db".to_string(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteStoreConfig {
    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

#[derive(Debug, FromRow)]
struct QuoteRow {
    id: String,
    base: String,
    quote: String,
    status: String,
    price: Option<String>,
    observed_at: Option<i64>,
    error: Option<String>,
    requested_at: i64,
    updated_at: Option<i64>,
}

impl TryFrom<QuoteRow> for QuoteUpdate {
    type Error = StoreError;

    fn try_from(row: QuoteRow) -> StoreResult<Self> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row.id.clone(),
            reason,
        };

        let id = UpdateId::parse(&row.id).map_err(|e| corrupt(e.to_string()))?;
        let pair = CurrencyPair::new(
            Currency::parse(&row.base).map_err(|e| corrupt(e.to_string()))?,
            Currency::parse(&row.quote).map_err(|e| corrupt(e.to_string()))?,
        );
        let status = QuoteStatus::from_str(&row.status).map_err(|e| corrupt(e.to_string()))?;
        let price = row
            .price
            .as_deref()
            .map(Price::parse)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let requested_at = from_unix_millis(row.requested_at)
            .ok_or_else(|| corrupt(format!("bad requested_at {}", row.requested_at)))?;

        Ok(QuoteUpdate {
            id,
            pair,
            status,
            price,
            observed_at: row.observed_at.and_then(from_unix_millis),
            error: row.error.clone(),
            requested_at,
            updated_at: row.updated_at.and_then(from_unix_millis),
        })
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// [`QuoteStore`] on a SQLite connection pool.
#[derive(Clone)]
pub struct SqliteQuoteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteQuoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteQuoteStore")
            .field("pool", &self.pool)
            .finish()
    }
}

impl SqliteQuoteStore {
    /// Open the database, creating it if needed, and apply migrations.
    pub async fn connect(config: &SqliteStoreConfig) -> StoreResult<Self> {
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);
        if !config.is_memory() {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to an in-memory database is a separate database.
        let max_connections = if config.is_memory() { 1 } else { config.max_connections };

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(config.acquire_timeout);
        if config.is_memory() {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url = %config.url, max_connections, "Quote store ready");
        Ok(store)
    }

    /// Private in-memory database, mostly for tests.
    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect(&SqliteStoreConfig {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        })
        .await
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn find_in_flight(&self, pair: &CurrencyPair) -> StoreResult<Option<(UpdateId, QuoteStatus)>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT id, status FROM quote_updates \
             WHERE base = ? AND quote = ? AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(pair.base.code())
        .bind(pair.quote.code())
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, status)) = row else {
            return Ok(None);
        };
        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.clone(),
            reason,
        };
        Ok(Some((
            UpdateId::parse(&id).map_err(|e| corrupt(e.to_string()))?,
            QuoteStatus::from_str(&status).map_err(|e| corrupt(e.to_string()))?,
        )))
    }

    async fn current_status(&self, id: UpdateId) -> StoreResult<Option<QuoteStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM quote_updates WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        status
            .map(|s| {
                QuoteStatus::from_str(&s).map_err(|e| StoreError::Corrupt {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Build the error for a conditional update that matched nothing.
    async fn rejected(&self, id: UpdateId, to: QuoteStatus) -> StoreError {
        match self.current_status(id).await {
            Ok(from) => StoreError::InvalidTransition { id, from, to },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl QuoteStore for SqliteQuoteStore {
    #[instrument(skip_all, fields(pair = %pair, candidate = %candidate))]
    async fn create_or_join(&self, pair: &CurrencyPair, candidate: UpdateId) -> StoreResult<Admission> {
        for attempt in 1..=ADMISSION_ATTEMPTS {
            let inserted = sqlx::query(
                "INSERT INTO quote_updates (id, base, quote, status, requested_at) \
                 VALUES (?, ?, ?, 'PENDING', ?)",
            )
            .bind(candidate.to_string())
            .bind(pair.base.code())
            .bind(pair.quote.code())
            .bind(to_unix_millis(Utc::now()))
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    debug!("Created pending update");
                    return Ok(Admission::Created(candidate));
                }
                Err(e) if is_unique_violation(&e) => {}
                Err(e) => return Err(e.into()),
            }

            if let Some((id, status)) = self.find_in_flight(pair).await? {
                debug!(existing = %id, status = %status, "Joined in-flight update");
                return Ok(Admission::Joined { id, status });
            }

            warn!(attempt, "In-flight update finished before it could be joined, retrying");
        }

        Err(StoreError::Contention(pair.to_string()))
    }

    async fn mark_running(&self, id: UpdateId) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE quote_updates SET status = 'RUNNING', error = NULL, updated_at = ? \
             WHERE id = ? AND status IN ('PENDING', 'FAILED')",
        )
        .bind(to_unix_millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await;

        // A failed record cannot re-enter RUNNING while a newer attempt holds the pair.
        match result {
            Ok(done) if done.rows_affected() > 0 => Ok(()),
            Ok(_) => Err(self.rejected(id, QuoteStatus::Running).await),
            Err(e) if is_unique_violation(&e) => Err(self.rejected(id, QuoteStatus::Running).await),
            Err(e) => Err(e.into()),
        }
    }

    async fn complete(&self, id: UpdateId, outcome: Outcome) -> StoreResult<()> {
        let to = outcome.status();
        let (price, observed_at, error) = match outcome {
            Outcome::Success { price, observed_at } => {
                (Some(price.to_string()), Some(to_unix_millis(observed_at)), None)
            }
            Outcome::Failed { error } => (None, None, Some(error)),
        };

        let result = sqlx::query(
            "UPDATE quote_updates \
             SET status = ?, price = ?, observed_at = ?, error = ?, updated_at = ? \
             WHERE id = ? AND status = 'RUNNING'",
        )
        .bind(to.as_str())
        .bind(price)
        .bind(observed_at)
        .bind(error)
        .bind(to_unix_millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(id, to).await);
        }
        Ok(())
    }

    async fn abandon(&self, id: UpdateId, reason: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE quote_updates SET status = 'FAILED', error = ?, updated_at = ? \
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(reason)
        .bind(to_unix_millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejected(id, QuoteStatus::Failed).await);
        }
        Ok(())
    }

    async fn get_by_id(&self, id: UpdateId) -> StoreResult<QuoteUpdate> {
        let row: Option<QuoteRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .try_into()
    }

    async fn get_latest_success(&self, pair: &CurrencyPair) -> StoreResult<QuoteUpdate> {
        let row: Option<QuoteRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE base = ? AND quote = ? AND status = 'SUCCESS' \
             ORDER BY updated_at DESC, rowid DESC LIMIT 1"
        ))
        .bind(pair.base.code())
        .bind(pair.quote.code())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| StoreError::NotFound(format!("no successful quote for {pair}")))?
            .try_into()
    }

    async fn list_in_flight(&self) -> StoreResult<Vec<QuoteUpdate>> {
        let rows: Vec<QuoteRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('PENDING', 'RUNNING') ORDER BY requested_at, rowid"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QuoteUpdate::try_from).collect()
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn usd_eur() -> CurrencyPair {
        CurrencyPair::new(Currency::usd(), Currency::eur())
    }

    fn success(price: &str) -> Outcome {
        Outcome::Success {
            price: Price::parse(price).unwrap(),
            observed_at: Utc::now(),
        }
    }

    async fn store() -> SqliteQuoteStore {
        SqliteQuoteStore::in_memory().await.unwrap()
    }

    async fn in_flight_count(store: &SqliteQuoteStore, pair: &CurrencyPair) -> i64 {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM quote_updates \
             WHERE base = ? AND quote = ? AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(pair.base.code())
        .bind(pair.quote.code())
        .fetch_one(store.pool())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_join() {
        let store = store().await;
        let first = UpdateId::new();

        let created = store.create_or_join(&usd_eur(), first).await.unwrap();
        assert_eq!(created, Admission::Created(first));

        let joined = store.create_or_join(&usd_eur(), UpdateId::new()).await.unwrap();
        assert_eq!(
            joined,
            Admission::Joined {
                id: first,
                status: QuoteStatus::Pending
            }
        );

        let record = store.get_by_id(first).await.unwrap();
        assert_eq!(record.status, QuoteStatus::Pending);
        assert!(record.updated_at.is_none());
        assert_eq!(in_flight_count(&store, &usd_eur()).await, 1);
    }

    #[tokio::test]
    async fn test_other_pair_is_independent() {
        let store = store().await;
        store.create_or_join(&usd_eur(), UpdateId::new()).await.unwrap();

        let gbp = CurrencyPair::new(Currency::usd(), Currency::gbp());
        let admission = store.create_or_join(&gbp, UpdateId::new()).await.unwrap();
        assert!(admission.is_created());
    }

    #[tokio::test]
    async fn test_full_lifecycle_and_new_record_after_success() {
        let store = store().await;
        let id = UpdateId::new();
        store.create_or_join(&usd_eur(), id).await.unwrap();

        store.mark_running(id).await.unwrap();
        let joined = store.create_or_join(&usd_eur(), UpdateId::new()).await.unwrap();
        assert_eq!(joined.status(), QuoteStatus::Running);
        assert_eq!(joined.id(), id);

        store.complete(id, success("1.0850")).await.unwrap();
        let record = store.get_by_id(id).await.unwrap();
        assert_eq!(record.status, QuoteStatus::Success);
        assert_eq!(record.price.unwrap().as_str(), "1.0850");
        assert!(record.updated_at.is_some());
        assert!(record.observed_at.is_some());

        let next = UpdateId::new();
        assert_eq!(
            store.create_or_join(&usd_eur(), next).await.unwrap(),
            Admission::Created(next)
        );
    }

    #[tokio::test]
    async fn test_mark_running_guards() {
        let store = store().await;
        let id = UpdateId::new();
        store.create_or_join(&usd_eur(), id).await.unwrap();
        store.mark_running(id).await.unwrap();

        let err = store.mark_running(id).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: Some(QuoteStatus::Running), to: QuoteStatus::Running, .. }
        ));

        store.complete(id, Outcome::Failed { error: "boom".into() }).await.unwrap();
        store.mark_running(id).await.unwrap();
        let record = store.get_by_id(id).await.unwrap();
        assert_eq!(record.status, QuoteStatus::Running);
        assert!(record.error.is_none());

        store.complete(id, success("1.1")).await.unwrap();
        assert!(matches!(
            store.mark_running(id).await,
            Err(StoreError::InvalidTransition { from: Some(QuoteStatus::Success), .. })
        ));

        let missing = UpdateId::new();
        assert!(matches!(
            store.mark_running(missing).await,
            Err(StoreError::InvalidTransition { from: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_retry_cannot_displace_newer_attempt() {
        let store = store().await;
        let old = UpdateId::new();
        store.create_or_join(&usd_eur(), old).await.unwrap();
        store.mark_running(old).await.unwrap();
        store.complete(old, Outcome::Failed { error: "down".into() }).await.unwrap();

        let newer = UpdateId::new();
        assert!(store.create_or_join(&usd_eur(), newer).await.unwrap().is_created());

        assert!(matches!(
            store.mark_running(old).await,
            Err(StoreError::InvalidTransition { from: Some(QuoteStatus::Failed), .. })
        ));
        assert_eq!(in_flight_count(&store, &usd_eur()).await, 1);
    }

    #[tokio::test]
    async fn test_complete_requires_running_and_leaves_data_alone() {
        let store = store().await;
        let id = UpdateId::new();
        store.create_or_join(&usd_eur(), id).await.unwrap();
        let before = store.get_by_id(id).await.unwrap();

        assert!(matches!(
            store.complete(id, success("1.2")).await,
            Err(StoreError::InvalidTransition { from: Some(QuoteStatus::Pending), .. })
        ));
        assert_eq!(store.get_by_id(id).await.unwrap(), before);

        store.mark_running(id).await.unwrap();
        store.complete(id, success("1.2")).await.unwrap();
        let done = store.get_by_id(id).await.unwrap();

        assert!(store
            .complete(id, Outcome::Failed { error: "late".into() })
            .await
            .is_err());
        assert_eq!(store.get_by_id(id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn test_failed_clears_price() {
        let store = store().await;
        let id = UpdateId::new();
        store.create_or_join(&usd_eur(), id).await.unwrap();
        store.mark_running(id).await.unwrap();
        store
            .complete(id, Outcome::Failed { error: "all rate sources failed".into() })
            .await
            .unwrap();

        let record = store.get_by_id(id).await.unwrap();
        assert_eq!(record.status, QuoteStatus::Failed);
        assert!(record.price.is_none());
        assert_eq!(record.error.as_deref(), Some("all rate sources failed"));
    }

    #[tokio::test]
    async fn test_abandon_only_from_pending() {
        let store = store().await;
        let id = UpdateId::new();
        store.create_or_join(&usd_eur(), id).await.unwrap();
        store.abandon(id, "queue down").await.unwrap();

        let record = store.get_by_id(id).await.unwrap();
        assert_eq!(record.status, QuoteStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("queue down"));
        assert_eq!(in_flight_count(&store, &usd_eur()).await, 0);

        let running = UpdateId::new();
        store.create_or_join(&usd_eur(), running).await.unwrap();
        store.mark_running(running).await.unwrap();
        assert!(store.abandon(running, "x").await.is_err());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = store().await;
        assert!(matches!(
            store.get_by_id(UpdateId::new()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.get_latest_success(&usd_eur()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_latest_success_is_most_recent_completion() {
        let store = store().await;

        for price in ["1.01", "1.02", "1.03"] {
            let id = UpdateId::new();
            store.create_or_join(&usd_eur(), id).await.unwrap();
            store.mark_running(id).await.unwrap();
            store.complete(id, success(price)).await.unwrap();
        }
        let failed = UpdateId::new();
        store.create_or_join(&usd_eur(), failed).await.unwrap();
        store.mark_running(failed).await.unwrap();
        store.complete(failed, Outcome::Failed { error: "x".into() }).await.unwrap();

        let latest = store.get_latest_success(&usd_eur()).await.unwrap();
        assert_eq!(latest.price.unwrap().as_str(), "1.03");
    }

    #[tokio::test]
    async fn test_concurrent_admission_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("quotes.db").display());
        let store = Arc::new(
            SqliteQuoteStore::connect(&SqliteStoreConfig {
                url,
                ..Default::default()
            })
            .await
            .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create_or_join(&usd_eur(), UpdateId::new()).await.unwrap()
            }));
        }

        let mut ids = HashSet::new();
        let mut created = 0;
        for handle in handles {
            let admission = handle.await.unwrap();
            ids.insert(admission.id());
            if admission.is_created() {
                created += 1;
            }
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(created, 1);
        assert_eq!(in_flight_count(&store, &usd_eur()).await, 1);
        store.close().await;
    }

    #[tokio::test]
    async fn test_list_in_flight() {
        let store = store().await;
        let gbp = CurrencyPair::new(Currency::usd(), Currency::gbp());
        let jpy = CurrencyPair::new(Currency::usd(), Currency::jpy());

        let pending = UpdateId::new();
        store.create_or_join(&usd_eur(), pending).await.unwrap();
        let running = UpdateId::new();
        store.create_or_join(&gbp, running).await.unwrap();
        store.mark_running(running).await.unwrap();
        let done = UpdateId::new();
        store.create_or_join(&jpy, done).await.unwrap();
        store.mark_running(done).await.unwrap();
        store.complete(done, success("151.20")).await.unwrap();

        let in_flight = store.list_in_flight().await.unwrap();
        let ids: Vec<_> = in_flight.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![pending, running]);
        assert_eq!(in_flight[1].status, QuoteStatus::Running);
        assert!(in_flight[1].updated_at.is_some());
    }

    #[tokio::test]
    async fn test_in_flight_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteStoreConfig {
            url: format!("sqlite://{}", dir.path().join("quotes.db").display()),
            ..Default::default()
        };

        let id = UpdateId::new();
        let first = SqliteQuoteStore::connect(&config).await.unwrap();
        first.create_or_join(&usd_eur(), id).await.unwrap();
        first.close().await;

        let reopened = SqliteQuoteStore::connect(&config).await.unwrap();
        let in_flight = reopened.list_in_flight().await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].id, id);
        assert_eq!(in_flight[0].status, QuoteStatus::Pending);
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_debug_is_single_line() {
        let store = store().await;
        let rendered = format!("{store:?}");
        assert!(rendered.starts_with("SqliteQuoteStore"));
        assert!(!rendered.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_ping() {
        let store = store().await;
        store.ping().await.unwrap();
        store.close().await;
        assert!(store.ping().await.is_err());
    }
}
