//! Rate source error types.

use fxquote_common::{QuoteError, SourceFailure, SourceFailures};
use thiserror::Error;

/// Errors that can occur while obtaining a rate.
#[derive(Debug, Clone, Error)]
pub enum FxError {
    /// The request never produced a response.
    #[error("{source_name} request failed: {message}")]
    Http { source_name: String, message: String },

    /// Upstream answered with a non-success status.
    #[error("{source_name} returned status {status}: {body}")]
    Status {
        source_name: String,
        status: u16,
        body: String,
    },

    /// Response body could not be decoded.
    #[error("failed to decode {source_name} response: {message}")]
    Decode { source_name: String, message: String },

    /// Upstream explicitly reported failure.
    #[error("{source_name} rejected the request: {message}")]
    Rejected { source_name: String, message: String },

    /// Response lacked the requested rate.
    #[error("no rate for {key} in {source_name} response")]
    MissingRate { source_name: String, key: String },

    /// Upstream supplied something that is not a usable price.
    #[error("{source_name} returned an invalid price: {message}")]
    InvalidPrice { source_name: String, message: String },

    /// The fallback chain was built without sources.
    #[error("No rate sources configured")]
    NoSources,

    /// Unknown or incomplete source configuration.
    #[error("Rate source configuration error: {0}")]
    Config(String),

    /// Every source in a fallback chain failed.
    #[error("{0}")]
    AllFailed(SourceFailures),
}

impl FxError {
    /// Name of the source that raised this error, if it is a single-source error.
    pub fn source_name(&self) -> Option<&str> {
        match self {
            FxError::Http { source_name, .. }
            | FxError::Status { source_name, .. }
            | FxError::Decode { source_name, .. }
            | FxError::Rejected { source_name, .. }
            | FxError::MissingRate { source_name, .. }
            | FxError::InvalidPrice { source_name, .. } => Some(source_name),
            FxError::NoSources | FxError::Config(_) | FxError::AllFailed(_) => None,
        }
    }
}

impl From<FxError> for QuoteError {
    fn from(e: FxError) -> Self {
        match e {
            FxError::AllFailed(failures) => QuoteError::Source(failures),
            FxError::NoSources | FxError::Config(_) => QuoteError::Infrastructure(e.to_string()),
            other => {
                let source = other.source_name().unwrap_or("unknown").to_string();
                QuoteError::Source(SourceFailures(vec![SourceFailure::new(
                    source,
                    other.to_string(),
                )]))
            }
        }
    }
}

/// Result type for rate source operations.
pub type FxResult<T> = Result<T, FxError>;
