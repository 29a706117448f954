//! Quote update records and their state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{CurrencyPair, QuoteError, UpdateId};

/// Lifecycle state of a quote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteStatus {
    /// Created, waiting for a worker.
    Pending,
    /// A worker is fetching the rate.
    Running,
    /// Rate fetched and stored.
    Success,
    /// The attempt failed; a redelivery may re-enter `Running`.
    Failed,
}

impl QuoteStatus {
    pub const ALL: [QuoteStatus; 4] = [
        QuoteStatus::Pending,
        QuoteStatus::Running,
        QuoteStatus::Success,
        QuoteStatus::Failed,
    ];

    /// Statuses covered by the one-in-flight-per-pair rule.
    pub const IN_FLIGHT: [QuoteStatus; 2] = [QuoteStatus::Pending, QuoteStatus::Running];

    /// Stable wire/storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Pending => "PENDING",
            QuoteStatus::Running => "RUNNING",
            QuoteStatus::Success => "SUCCESS",
            QuoteStatus::Failed => "FAILED",
        }
    }

    /// Check if an update in this state blocks new updates for its pair.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, QuoteStatus::Pending | QuoteStatus::Running)
    }

    /// Check if this attempt is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QuoteStatus::Success | QuoteStatus::Failed)
    }

    /// Get valid next states from current state.
    ///
    /// `Pending -> Failed` is reserved for abandoning a record whose task
    /// could not be enqueued.
    pub fn valid_transitions(&self) -> &'static [QuoteStatus] {
        match self {
            QuoteStatus::Pending => &[QuoteStatus::Running, QuoteStatus::Failed],
            QuoteStatus::Running => &[QuoteStatus::Success, QuoteStatus::Failed],
            QuoteStatus::Success => &[],
            QuoteStatus::Failed => &[QuoteStatus::Running],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: QuoteStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for QuoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuoteStatus {
    type Err = QuoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuoteStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QuoteError::Infrastructure(format!("unknown quote status {s:?}")))
    }
}

/// A provider-supplied price, kept as the exact decimal text received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Price(String);

impl Price {
    /// Accept a finite, positive decimal string without re-rounding it.
    pub fn parse(text: &str) -> Result<Self, QuoteError> {
        let text = text.trim();
        let value = Decimal::from_str(text)
            .or_else(|_| Decimal::from_scientific(text))
            .map_err(|e| QuoteError::InvalidFormat(format!("invalid price {text:?}: {e}")))?;
        if value <= Decimal::ZERO {
            return Err(QuoteError::InvalidFormat(format!(
                "price must be positive, got {text:?}"
            )));
        }
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, for callers that need arithmetic.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::from_str(&self.0)
            .or_else(|_| Decimal::from_scientific(&self.0))
            .unwrap_or_default()
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Price {
    type Error = QuoteError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Price> for String {
    fn from(price: Price) -> Self {
        price.0
    }
}

/// Durable record of one update attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteUpdate {
    pub id: UpdateId,
    pub pair: CurrencyPair,
    pub status: QuoteStatus,
    /// Present iff `status == Success`.
    pub price: Option<Price>,
    /// Provider observation time, present iff `status == Success`.
    pub observed_at: Option<DateTime<Utc>>,
    /// Present iff `status == Failed`.
    pub error: Option<String>,
    pub requested_at: DateTime<Utc>,
    /// Time of the last status transition; `None` while pending.
    pub updated_at: Option<DateTime<Utc>>,
}

impl QuoteUpdate {
    /// Create a fresh pending record.
    pub fn pending(id: UpdateId, pair: CurrencyPair, requested_at: DateTime<Utc>) -> Self {
        Self {
            id,
            pair,
            status: QuoteStatus::Pending,
            price: None,
            observed_at: None,
            error: None,
            requested_at,
            updated_at: None,
        }
    }

    /// Apply a guarded transition in memory.
    pub fn transition_to(
        &mut self,
        next: QuoteStatus,
        at: DateTime<Utc>,
    ) -> Result<(), QuoteError> {
        if !self.status.can_transition_to(next) {
            return Err(QuoteError::InvalidTransition {
                id: self.id,
                from: Some(self.status),
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Some(at);
        Ok(())
    }

    /// Record the outcome of a running attempt.
    pub fn complete(&mut self, outcome: Outcome, at: DateTime<Utc>) -> Result<(), QuoteError> {
        if self.status != QuoteStatus::Running {
            return Err(QuoteError::InvalidTransition {
                id: self.id,
                from: Some(self.status),
                to: outcome.status(),
            });
        }
        self.transition_to(outcome.status(), at)?;
        match outcome {
            Outcome::Success { price, observed_at } => {
                self.price = Some(price);
                self.observed_at = Some(observed_at);
                self.error = None;
            }
            Outcome::Failed { error } => {
                self.price = None;
                self.observed_at = None;
                self.error = Some(error);
            }
        }
        Ok(())
    }
}

/// Result of executing an update.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success {
        price: Price,
        observed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
}

impl Outcome {
    pub fn status(&self) -> QuoteStatus {
        match self {
            Outcome::Success { .. } => QuoteStatus::Success,
            Outcome::Failed { .. } => QuoteStatus::Failed,
        }
    }
}

/// Client-facing projection of an update.
///
/// `price`, `observed_at` and `updated_at` are set only for `SUCCESS`,
/// `error` only for `FAILED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteUpdateView {
    pub id: UpdateId,
    pub base: String,
    pub quote: String,
    pub status: QuoteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&QuoteUpdate> for QuoteUpdateView {
    fn from(update: &QuoteUpdate) -> Self {
        let mut view = Self {
            id: update.id,
            base: update.pair.base.to_string(),
            quote: update.pair.quote.to_string(),
            status: update.status,
            price: None,
            error: None,
            observed_at: None,
            updated_at: None,
        };

        match update.status {
            QuoteStatus::Success => {
                view.price = update.price.as_ref().map(|p| p.to_string());
                view.observed_at = update.observed_at;
                view.updated_at = update.updated_at;
            }
            QuoteStatus::Failed => view.error = update.error.clone(),
            QuoteStatus::Pending | QuoteStatus::Running => {}
        }

        view
    }
}

impl From<QuoteUpdate> for QuoteUpdateView {
    fn from(update: QuoteUpdate) -> Self {
        Self::from(&update)
    }
}

/// Most recent successful price for a pair, as held by the latest-quote cache.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestQuote {
    pub id: UpdateId,
    pub pair: CurrencyPair,
    pub price: Price,
    pub observed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LatestQuote {
    /// Build from a successful record; `None` for any other status.
    pub fn from_update(update: &QuoteUpdate) -> Option<Self> {
        if update.status != QuoteStatus::Success {
            return None;
        }
        let price = update.price.clone()?;
        let updated_at = update.updated_at?;
        Some(Self {
            id: update.id,
            pair: update.pair.clone(),
            price,
            observed_at: update.observed_at.unwrap_or(updated_at),
            updated_at,
        })
    }
}

impl From<&LatestQuote> for QuoteUpdateView {
    fn from(latest: &LatestQuote) -> Self {
        Self {
            id: latest.id,
            base: latest.pair.base.to_string(),
            quote: latest.pair.quote.to_string(),
            status: QuoteStatus::Success,
            price: Some(latest.price.to_string()),
            error: None,
            observed_at: Some(latest.observed_at),
            updated_at: Some(latest.updated_at),
        }
    }
}
