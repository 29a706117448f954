//! Task channel contract and the quote update task payload.

use async_trait::async_trait;
use fxquote_common::{CurrencyPair, QuoteError, UpdateId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Task type carried by every quote update task.
pub const QUOTE_UPDATE_TASK: &str = "quote:update";

/// An opaque unit of work on the task channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub kind: String,
    pub payload: Vec<u8>,
}

/// Body of a [`QUOTE_UPDATE_TASK`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteUpdatePayload {
    pub update_id: UpdateId,
    pub base: String,
    pub quote: String,
}

impl QuoteUpdatePayload {
    pub fn new(update_id: UpdateId, pair: &CurrencyPair) -> Self {
        Self {
            update_id,
            base: pair.base.to_string(),
            quote: pair.quote.to_string(),
        }
    }

    pub fn into_task(self) -> Result<Task, QueueError> {
        let payload = serde_json::to_vec(&self).map_err(|e| QueueError::Encode(e.to_string()))?;
        Ok(Task {
            kind: QUOTE_UPDATE_TASK.to_string(),
            payload,
        })
    }

    /// Decode a delivered task. Wrong kinds and bad JSON are not retryable.
    pub fn from_task(task: &Task) -> Result<Self, QuoteError> {
        if task.kind != QUOTE_UPDATE_TASK {
            return Err(QuoteError::InvalidFormat(format!(
                "unexpected task type {:?}",
                task.kind
            )));
        }
        serde_json::from_slice(&task.payload)
            .map_err(|e| QuoteError::InvalidFormat(format!("undecodable task payload: {e}")))
    }
}

/// Task channel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Task queue is full ({0} tasks buffered)")]
    Full(usize),

    #[error("Task queue is closed")]
    Closed,

    #[error("Task queue unavailable: {0}")]
    Unavailable(String),

    #[error("Could not encode task: {0}")]
    Encode(String),

    #[error("Worker pool already started")]
    AlreadyStarted,
}

impl From<QueueError> for QuoteError {
    fn from(e: QueueError) -> Self {
        QuoteError::Queue(e.to_string())
    }
}

/// At-least-once task channel.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Hand a task over for asynchronous delivery.
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Check the channel accepts tasks.
    async fn ping(&self) -> Result<(), QueueError>;
}

/// Receives delivered tasks.
///
/// A retryable error asks the channel to redeliver; any other error drops
/// the task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<(), QuoteError>;
}


#[cfg(test)]
mod tests {
    use super::*;
    use fxquote_common::Currency;

    #[test]
    fn test_payload_wire_shape() {
        let id = UpdateId::new();
        let pair = CurrencyPair::new(Currency::usd(), Currency::eur());
        let task = QuoteUpdatePayload::new(id, &pair).into_task().unwrap();

        assert_eq!(task.kind, "quote:update");
        let json: serde_json::Value = serde_json::from_slice(&task.payload).unwrap();
        assert_eq!(json["update_id"], id.to_string());
        assert_eq!(json["base"], "USD");
        assert_eq!(json["quote"], "EUR");
    }

    #[test]
    fn test_undecodable_payload_is_not_retryable() {
        let task = Task {
            kind: QUOTE_UPDATE_TASK.to_string(),
            payload: b"{not json".to_vec(),
        };
        let err = QuoteUpdatePayload::from_task(&task).unwrap_err();
        assert!(matches!(err, QuoteError::InvalidFormat(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unknown_task_kind_is_rejected() {
        let task = Task {
            kind: "quote:purge".to_string(),
            payload: b"{}".to_vec(),
        };
        assert!(QuoteUpdatePayload::from_task(&task).is_err());
    }

    #[test]
    fn test_queue_errors_map_to_queue_kind() {
        let err: QuoteError = QueueError::Full(8).into();
        assert_eq!(err.error_code(), "QUEUE_ERROR");
    }
}
