//! FxQuote Common Types
//!
//! This crate contains shared types used across the FxQuote update pipeline,
//! including identifiers, currency pairs, the quote-update state machine,
//! the error taxonomy, and the key-value cache abstraction.

pub mod identifiers;
pub mod currency;
pub mod quote;
pub mod error;
pub mod cache;
pub mod time;

pub use identifiers::*;
pub use currency::*;
pub use quote::*;
pub use error::*;
pub use cache::{CacheFields, CacheStats, HashCache, MemoryCacheConfig, MemoryHashCache};
pub use time::*;
