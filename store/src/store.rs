//! The quote store contract.

use async_trait::async_trait;
use fxquote_common::{CurrencyPair, Outcome, QuoteStatus, QuoteUpdate, UpdateId};

use crate::error::StoreResult;

/// How many times admission retries when the conflicting record vanishes.
pub const ADMISSION_ATTEMPTS: usize = 3;

/// Result of [`QuoteStore::create_or_join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new pending record was stored under the candidate id.
    Created(UpdateId),
    /// An in-flight record already existed for the pair.
    Joined { id: UpdateId, status: QuoteStatus },
}

impl Admission {
    pub fn id(&self) -> UpdateId {
        match self {
            Admission::Created(id) => *id,
            Admission::Joined { id, .. } => *id,
        }
    }

    pub fn status(&self) -> QuoteStatus {
        match self {
            Admission::Created(_) => QuoteStatus::Pending,
            Admission::Joined { status, .. } => *status,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Admission::Created(_))
    }
}

/// Durable record of every update attempt.
///
/// Implementations must keep at most one `PENDING`/`RUNNING` record per pair
/// under any number of concurrent callers, and apply every transition as a
/// conditional update on the expected prior status.
#[async_trait]
pub trait QuoteStore: Send + Sync {
    /// Insert a pending record under `candidate`, or return the pair's in-flight record.
    async fn create_or_join(&self, pair: &CurrencyPair, candidate: UpdateId) -> StoreResult<Admission>;

    /// `PENDING | FAILED -> RUNNING`.
    async fn mark_running(&self, id: UpdateId) -> StoreResult<()>;

    /// `RUNNING -> SUCCESS | FAILED`.
    async fn complete(&self, id: UpdateId, outcome: Outcome) -> StoreResult<()>;

    /// `PENDING -> FAILED`, for a record whose task never reached the queue.
    async fn abandon(&self, id: UpdateId, reason: &str) -> StoreResult<()>;

    async fn get_by_id(&self, id: UpdateId) -> StoreResult<QuoteUpdate>;

    /// Most recently completed `SUCCESS` record for the pair.
    async fn get_latest_success(&self, pair: &CurrencyPair) -> StoreResult<QuoteUpdate>;

    /// Every `PENDING`/`RUNNING` record, oldest request first.
    async fn list_in_flight(&self) -> StoreResult<Vec<QuoteUpdate>>;

    /// Check the store is reachable.
    async fn ping(&self) -> StoreResult<()>;
}
