//! Quote store error types.

use fxquote_common::{QuoteError, QuoteStatus, UpdateId};
use thiserror::Error;

/// Errors raised by a [`QuoteStore`](crate::QuoteStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Quote update not found: {0}")]
    NotFound(String),

    /// A guarded update matched no row in an allowed state.
    #[error("Invalid transition for update {id}: {} -> {to}", .from.map(|s| s.as_str()).unwrap_or("<missing>"))]
    InvalidTransition {
        id: UpdateId,
        from: Option<QuoteStatus>,
        to: QuoteStatus,
    },

    /// Admission kept conflicting with records that finished before they could be read.
    #[error("Could not admit update for {0}: in-flight record kept changing")]
    Contention(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    /// A stored row does not decode into a valid record.
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Unavailable(e.to_string())
            }
            sqlx::Error::Io(_) => StoreError::Unavailable(e.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database(format!("migration failed: {e}"))
    }
}

impl From<StoreError> for QuoteError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => QuoteError::NotFound(what),
            StoreError::InvalidTransition { id, from, to } => {
                QuoteError::InvalidTransition { id, from, to }
            }
            other => QuoteError::Infrastructure(other.to_string()),
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
