//! Read-through cache of the latest successful quote per pair.
//!
//! Entries are advisory. Every fault is logged and reported as a miss, so the
//! quote store stays the source of truth.

use chrono::{DateTime, Utc};
use fxquote_common::{CacheError, CacheFields, CurrencyPair, HashCache, LatestQuote, Price, UpdateId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const ID_FIELD: &str = "id";
const PRICE_FIELD: &str = "price";
const OBSERVED_AT_FIELD: &str = "observed_at";
const UPDATED_AT_FIELD: &str = "updated_at";

/// Latest-quote namespace on top of a [`HashCache`].
#[derive(Clone)]
pub struct LatestQuoteCache {
    cache: Arc<dyn HashCache>,
    ttl: Duration,
    timeout: Duration,
}

impl LatestQuoteCache {
    pub fn new(cache: Arc<dyn HashCache>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            cache,
            ttl,
            timeout,
        }
    }

    /// Cache key, e.g. `latest:{USD:EUR}`.
    pub fn key(pair: &CurrencyPair) -> String {
        format!("latest:{}", pair.cache_tag())
    }

    /// Cached quote for `pair`, or `None` on miss, expiry, corruption or outage.
    pub async fn get(&self, pair: &CurrencyPair) -> Option<LatestQuote> {
        let key = Self::key(pair);
        let fields = match self.bounded(self.cache.get(&key)).await {
            Ok(fields) => fields?,
            Err(e) => {
                warn!(key, error = %e, "Latest quote cache read failed");
                return None;
            }
        };

        let latest = decode(pair, &fields);
        if latest.is_none() {
            warn!(key, "Ignoring malformed latest quote cache entry");
        }
        latest
    }

    /// Overwrite the entry for the quote's pair. Failures are logged only.
    pub async fn put(&self, latest: &LatestQuote) {
        let key = Self::key(&latest.pair);
        match self.bounded(self.cache.set(&key, encode(latest), self.ttl)).await {
            Ok(()) => debug!(key, update_id = %latest.id, "Latest quote cached"),
            Err(e) => warn!(key, error = %e, "Latest quote cache write failed"),
        }
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.bounded(self.cache.ping()).await
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or(Err(CacheError::Timeout))
    }
}

fn timestamp(fields: &CacheFields, field: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(fields.get(field)?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn decode(pair: &CurrencyPair, fields: &CacheFields) -> Option<LatestQuote> {
    Some(LatestQuote {
        id: UpdateId::parse(fields.get(ID_FIELD)?).ok()?,
        pair: pair.clone(),
        price: Price::parse(fields.get(PRICE_FIELD)?).ok()?,
        observed_at: timestamp(fields, OBSERVED_AT_FIELD)?,
        updated_at: timestamp(fields, UPDATED_AT_FIELD)?,
    })
}

fn encode(latest: &LatestQuote) -> CacheFields {
    CacheFields::from([
        (ID_FIELD.to_string(), latest.id.to_string()),
        (PRICE_FIELD.to_string(), latest.price.to_string()),
        (OBSERVED_AT_FIELD.to_string(), latest.observed_at.to_rfc3339()),
        (UPDATED_AT_FIELD.to_string(), latest.updated_at.to_rfc3339()),
    ])
}
