//! Assembles configured sources into one cached fallback chain.

use fxquote_common::HashCache;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cache::CachedRateSource;
use crate::error::{FxError, FxResult};
use crate::provider::{FallbackRateSource, RateSource};
use crate::sources::{ExchangeRateHostSource, FrankfurterSource};

/// Known upstream sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Frankfurter,
    ExchangeRateHost,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Frankfurter => "frankfurter",
            SourceKind::ExchangeRateHost => "exchangerate_host",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = FxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frankfurter" => Ok(SourceKind::Frankfurter),
            "exchangerate_host" | "exchangerate.host" => Ok(SourceKind::ExchangeRateHost),
            other => Err(FxError::Config(format!("unknown rate source {other:?}"))),
        }
    }
}

/// Source stack configuration.
#[derive(Debug, Clone)]
pub struct SourceStackConfig {
    /// Sources in fallback order.
    pub sources: Vec<SourceKind>,
    pub frankfurter_url: Option<String>,
    pub exchangerate_host_url: Option<String>,
    pub exchangerate_host_key: Option<String>,
    /// Per-request HTTP timeout.
    pub source_timeout: Duration,
    /// TTL of each source's cache entries.
    pub cache_ttl: Duration,
}

impl Default for SourceStackConfig {
    fn default() -> Self {
        Self {
            sources: vec![SourceKind::Frankfurter],
            frankfurter_url: None,
            exchangerate_host_url: None,
            exchangerate_host_key: None,
            source_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Build the HTTP sources named in `config`, each behind its own cache.
pub fn build_source_stack(
    config: &SourceStackConfig,
    cache: Arc<dyn HashCache>,
) -> FxResult<Arc<dyn RateSource>> {
    let mut sources: Vec<Arc<dyn RateSource>> = Vec::with_capacity(config.sources.len());

    for kind in &config.sources {
        let source: Arc<dyn RateSource> = match kind {
            SourceKind::Frankfurter => Arc::new(FrankfurterSource::new(
                config.frankfurter_url.as_deref(),
                config.source_timeout,
            )?),
            SourceKind::ExchangeRateHost => {
                let key = config
                    .exchangerate_host_key
                    .as_deref()
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| {
                        FxError::Config("exchangerate_host requires an access key".to_string())
                    })?;
                Arc::new(ExchangeRateHostSource::new(
                    config.exchangerate_host_url.as_deref(),
                    key,
                    config.source_timeout,
                )?)
            }
        };
        sources.push(source);
    }

    let chain = cached_chain(sources, cache, config.cache_ttl)?;
    info!(sources = ?chain.source_names(), "Rate source stack ready");
    Ok(Arc::new(chain))
}

/// Wrap each source in its own cache and chain them in order.
pub fn cached_chain(
    sources: Vec<Arc<dyn RateSource>>,
    cache: Arc<dyn HashCache>,
    ttl: Duration,
) -> FxResult<FallbackRateSource> {
    let wrapped = sources
        .into_iter()
        .map(|source| Arc::new(CachedRateSource::new(source, cache.clone(), ttl)) as Arc<dyn RateSource>)
        .collect();
    FallbackRateSource::new(wrapped)
}
