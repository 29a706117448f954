//! Error types for the FxQuote pipeline.

use crate::{QuoteStatus, UpdateId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for FxQuote operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuoteError {
    /// Malformed currency code or pair.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Well-formed currency outside the allow-list.
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// Malformed update identifier.
    #[error("Invalid update id: {0:?}")]
    InvalidId(String),

    /// No such record or pair.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Guarded state change rejected by the store.
    #[error("Invalid transition for update {id}: {} -> {to}", .from.map(|s| s.as_str()).unwrap_or("<missing>"))]
    InvalidTransition {
        id: UpdateId,
        from: Option<QuoteStatus>,
        to: QuoteStatus,
    },

    /// Store, cache, or other backing service unavailable.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Task channel refused the task.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Operation exceeded its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Every rate source failed.
    #[error("{0}")]
    Source(SourceFailures),
}

impl QuoteError {
    /// Check if a task that failed with this error should be redelivered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QuoteError::Infrastructure(_)
                | QuoteError::Queue(_)
                | QuoteError::Timeout(_)
                | QuoteError::Source(_)
        )
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            QuoteError::InvalidFormat(_) => "INVALID_FORMAT",
            QuoteError::UnsupportedCurrency(_) => "UNSUPPORTED_CURRENCY",
            QuoteError::InvalidId(_) => "INVALID_ID",
            QuoteError::NotFound(_) => "NOT_FOUND",
            QuoteError::InvalidTransition { .. } => "INVALID_TRANSITION",
            QuoteError::Infrastructure(_) => "INTERNAL_ERROR",
            QuoteError::Queue(_) => "QUEUE_ERROR",
            QuoteError::Timeout(_) => "TIMEOUT",
            QuoteError::Source(_) => "SOURCE_ERROR",
        }
    }

    /// Check if the caller can fix this by correcting its input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            QuoteError::InvalidFormat(_) | QuoteError::UnsupportedCurrency(_) | QuoteError::InvalidId(_)
        )
    }
}

/// Result type alias for FxQuote operations.
pub type Result<T> = std::result::Result<T, QuoteError>;

/// One rate source's failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    /// Source name.
    pub source: String,
    /// Human-readable reason.
    pub reason: String,
}

impl SourceFailure {
    pub fn new(source: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.reason)
    }
}

/// Every source's failure, in the order the sources were tried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailures(pub Vec<SourceFailure>);

impl SourceFailures {
    pub fn iter(&self) -> impl Iterator<Item = &SourceFailure> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SourceFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all rate sources failed")?;
        for (i, failure) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

/// Errors raised by a key-value cache backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// The backend cannot be reached.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// The operation exceeded its deadline.
    #[error("Cache operation timed out")]
    Timeout,
}

impl From<CacheError> for QuoteError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Timeout => QuoteError::Timeout("cache".to_string()),
            other => QuoteError::Infrastructure(other.to_string()),
        }
    }
}
