//! Rate source trait and the sequential fallback facade.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxquote_common::{CurrencyPair, Price, SourceFailure, SourceFailures};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{FxError, FxResult};

/// A price as reported by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct RateQuote {
    pub price: Price,
    /// When the source observed the price.
    pub observed_at: DateTime<Utc>,
}

impl RateQuote {
    pub fn new(price: Price, observed_at: DateTime<Utc>) -> Self {
        Self { price, observed_at }
    }
}

/// Anything that can produce a rate for a currency pair.
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Source name, used in cache keys and diagnostics.
    fn name(&self) -> &str;

    /// Get the current rate for a pair.
    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<RateQuote>;
}

/// Tries each source in order and returns the first success.
pub struct FallbackRateSource {
    sources: Vec<Arc<dyn RateSource>>,
}

impl FallbackRateSource {
    /// Create a fallback chain. Fails if `sources` is empty.
    pub fn new(sources: Vec<Arc<dyn RateSource>>) -> FxResult<Self> {
        if sources.is_empty() {
            return Err(FxError::NoSources);
        }
        Ok(Self { sources })
    }

    /// Names of the chained sources, in call order.
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl RateSource for FallbackRateSource {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<RateQuote> {
        let mut failures = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            match source.get_rate(pair).await {
                Ok(quote) => {
                    debug!(
                        source = source.name(),
                        pair = %pair,
                        price = %quote.price,
                        "Got rate from source"
                    );
                    return Ok(quote);
                }
                Err(e) => {
                    warn!(
                        source = source.name(),
                        pair = %pair,
                        error = %e,
                        "Source failed to return rate"
                    );
                    failures.push(SourceFailure::new(source.name(), e.to_string()));
                }
            }
        }

        Err(FxError::AllFailed(SourceFailures(failures)))
    }
}

/// Scripted rate source for testing.
#[cfg(any(test, feature = "test-utils"))]
pub struct MockRateSource {
    name: String,
    responses: parking_lot::Mutex<std::collections::VecDeque<FxResult<RateQuote>>>,
    fallback: parking_lot::Mutex<Option<FxResult<RateQuote>>>,
    delay: parking_lot::Mutex<Option<std::time::Duration>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockRateSource {
    /// Create a mock that fails every call until scripted.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            fallback: parking_lot::Mutex::new(None),
            delay: parking_lot::Mutex::new(None),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Answer every call with `price`, observed now.
    pub fn always(name: impl Into<String>, price: &str) -> Self {
        let mock = Self::new(name);
        mock.set_default(Ok(RateQuote::new(Self::price(price), Utc::now())));
        mock
    }

    /// Fail every call.
    pub fn failing(name: impl Into<String>, reason: &str) -> Self {
        let mock = Self::new(name);
        let err = mock.error(reason);
        mock.set_default(Err(err));
        mock
    }

    /// Response used once the scripted queue is empty.
    pub fn set_default(&self, response: FxResult<RateQuote>) {
        *self.fallback.lock() = Some(response);
    }

    /// Queue a one-shot response.
    pub fn push(&self, response: FxResult<RateQuote>) {
        self.responses.lock().push_back(response);
    }

    /// Queue a one-shot success.
    pub fn push_price(&self, price: &str, observed_at: DateTime<Utc>) {
        self.push(Ok(RateQuote::new(Self::price(price), observed_at)));
    }

    /// Queue a one-shot failure.
    pub fn push_error(&self, reason: &str) {
        let err = self.error(reason);
        self.push(Err(err));
    }

    /// Sleep this long before answering.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Number of `get_rate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn error(&self, reason: &str) -> FxError {
        FxError::Http {
            source_name: self.name.clone(),
            message: reason.to_string(),
        }
    }

    fn price(text: &str) -> Price {
        Price::parse(text).unwrap_or_else(|e| panic!("mock price {text:?}: {e}"))
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl RateSource for MockRateSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_rate(&self, _pair: &CurrencyPair) -> FxResult<RateQuote> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(response) = self.responses.lock().pop_front() {
            return response;
        }
        self.fallback.lock().clone().unwrap_or_else(|| {
            Err(FxError::Http {
                source_name: self.name.clone(),
                message: "no scripted response".to_string(),
            })
        })
    }
}
