//! Per-source rate caching with TTL support.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fxquote_common::{CacheFields, CurrencyPair, HashCache, Price};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FxResult;
use crate::provider::{RateQuote, RateSource};

const PRICE_FIELD: &str = "price";
const UPDATED_AT_FIELD: &str = "updated_at";

/// Wraps one source with a short-lived cache keyed by (source, pair).
///
/// Only successes are cached. Cache faults degrade to calling the source.
pub struct CachedRateSource {
    inner: Arc<dyn RateSource>,
    cache: Arc<dyn HashCache>,
    ttl: Duration,
}

impl CachedRateSource {
    pub fn new(inner: Arc<dyn RateSource>, cache: Arc<dyn HashCache>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }

    /// Cache key, e.g. `provider_cache:frankfurter:{USD:EUR}`.
    pub fn cache_key(&self, pair: &CurrencyPair) -> String {
        format!("provider_cache:{}:{}", self.inner.name(), pair.cache_tag())
    }

    async fn lookup(&self, key: &str) -> Option<RateQuote> {
        let fields = match self.cache.get(key).await {
            Ok(fields) => fields?,
            Err(e) => {
                warn!(key, error = %e, "Source cache read failed");
                return None;
            }
        };
        decode(&fields)
    }
}

fn decode(fields: &CacheFields) -> Option<RateQuote> {
    let price = Price::parse(fields.get(PRICE_FIELD)?).ok()?;
    let observed_at = DateTime::parse_from_rfc3339(fields.get(UPDATED_AT_FIELD)?)
        .ok()?
        .with_timezone(&Utc);
    Some(RateQuote::new(price, observed_at))
}

fn encode(quote: &RateQuote) -> CacheFields {
    CacheFields::from([
        (PRICE_FIELD.to_string(), quote.price.to_string()),
        (UPDATED_AT_FIELD.to_string(), quote.observed_at.to_rfc3339()),
    ])
}

#[async_trait]
impl RateSource for CachedRateSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<RateQuote> {
        let key = self.cache_key(pair);

        if let Some(quote) = self.lookup(&key).await {
            debug!(source = self.name(), pair = %pair, "Source cache hit");
            return Ok(quote);
        }

        let quote = self.inner.get_rate(pair).await?;

        if let Err(e) = self.cache.set(&key, encode(&quote), self.ttl).await {
            warn!(key, error = %e, "Source cache write failed");
        }

        Ok(quote)
    }
}
