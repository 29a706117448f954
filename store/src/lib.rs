//! FxQuote Quote Store
//!
//! Durable record of every quote update attempt, with the status state
//! machine and one-in-flight-per-pair admission.

pub mod store;
pub mod sqlite;
pub mod memory;
pub mod error;

pub use store::{Admission, QuoteStore, ADMISSION_ATTEMPTS};
pub use sqlite::{SqliteQuoteStore, SqliteStoreConfig};
pub use memory::MemoryQuoteStore;
pub use error::{StoreError, StoreResult};
