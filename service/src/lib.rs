//! FxQuote Service
//!
//! Orchestrates asynchronous quote updates: requests are deduplicated per
//! currency pair, executed by a worker pool through the rate source stack,
//! and served back by id or as the pair's latest known price.

pub mod app;
pub mod config;
pub mod latest_cache;
pub mod metrics;
pub mod queue;
pub mod service;
pub mod state;
pub mod task;

pub use app::App;
pub use config::{LogFormat, ServiceConfig, TimeoutConfig, WorkerConfig};
pub use latest_cache::LatestQuoteCache;
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use queue::{InProcessQueue, WorkerPool};
pub use service::{Execution, QuoteService, Readiness, UpdateTicket};
pub use state::AppState;
pub use task::{QueueError, QuoteUpdatePayload, Task, TaskHandler, TaskQueue, QUOTE_UPDATE_TASK};
