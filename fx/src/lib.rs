//! FxQuote Rate Sources
//!
//! Obtains a price for a currency pair from one or more upstream sources.
//!
//! # Features
//!
//! - One `RateSource` contract for single sources and fallback chains
//! - Sequential fallback that keeps every source's failure reason
//! - Per-source TTL caching that never caches failures
//! - Frankfurter and exchangerate.host HTTP sources
//!
//! # Example
//!
//! ```rust,ignore
//! use fxquote_fx::{build_source_stack, SourceStackConfig};
//! use fxquote_common::{CurrencyPair, MemoryHashCache};
//!
//! let stack = build_source_stack(&SourceStackConfig::default(), Arc::new(MemoryHashCache::new()))?;
//! let quote = stack.get_rate(&"USD/EUR".parse::<CurrencyPair>()?).await?;
//! ```

pub mod provider;
pub mod cache;
pub mod sources;
pub mod stack;
pub mod error;

pub use provider::{FallbackRateSource, RateQuote, RateSource};
#[cfg(any(test, feature = "test-utils"))]
pub use provider::MockRateSource;
pub use cache::CachedRateSource;
pub use stack::{build_source_stack, cached_chain, SourceKind, SourceStackConfig};
pub use error::{FxError, FxResult};
