//! Service configuration.
//!
//! Every setting has a default and can be overridden through a
//! `QUOTESVC_`-prefixed environment variable. Values that fail to parse are
//! kept out of the config and reported by [`ServiceConfig::validate`].

use fxquote_common::{parse_duration, PairValidator, DEFAULT_SUPPORTED_CURRENCIES};
use fxquote_fx::{SourceKind, SourceStackConfig};
use fxquote_store::SqliteStoreConfig;
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every environment variable the service reads.
pub const ENV_PREFIX: &str = "QUOTESVC_";

/// Worker pool and redelivery configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Tasks executed at the same time.
    pub concurrency: usize,
    /// Redeliveries after the first attempt.
    pub max_retry: u32,
    /// Deadline for one delivery.
    pub task_timeout: Duration,
    /// Tasks buffered before enqueue is refused.
    pub queue_capacity: usize,
    /// First redelivery delay, doubled per attempt.
    pub retry_base_delay: Duration,
    /// Upper bound on the redelivery delay.
    pub retry_max_delay: Duration,
    /// How long shutdown waits for in-flight tasks.
    pub shutdown_timeout: Duration,
    /// Age after which an in-flight record is assumed to have lost its task
    /// and is re-enqueued. Also the interval of the recovery sweep.
    pub orphan_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_retry: 3,
            task_timeout: Duration::from_secs(30),
            queue_capacity: 1024,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            orphan_after: Duration::from_secs(60),
        }
    }
}

/// Deadlines for calls made by the orchestrator.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub store: Duration,
    pub cache: Duration,
    /// Whole fallback chain. Together with the two store calls around it,
    /// must fit in the task timeout.
    pub fetch: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            store: Duration::from_secs(5),
            cache: Duration::from_secs(1),
            fetch: Duration::from_secs(15),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Main service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Quote store connection.
    pub database: SqliteStoreConfig,
    /// Currency allow-list.
    pub supported_currencies: Vec<String>,
    /// TTL of latest-quote cache entries.
    pub latest_ttl: Duration,
    /// Rate sources, their order and their cache TTL.
    pub sources: SourceStackConfig,
    pub worker: WorkerConfig,
    pub timeouts: TimeoutConfig,
    pub log_format: LogFormat,
    /// Environment values that could not be parsed.
    env_errors: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database: SqliteStoreConfig::default(),
            supported_currencies: DEFAULT_SUPPORTED_CURRENCIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            latest_ttl: Duration::from_secs(600),
            sources: SourceStackConfig::default(),
            worker: WorkerConfig::default(),
            timeouts: TimeoutConfig::default(),
            log_format: LogFormat::Json,
            env_errors: Vec::new(),
        }
    }
}

/// Reads prefixed variables through a lookup function, collecting parse errors.
struct EnvReader<F> {
    lookup: F,
    errors: Vec<String>,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.string(key).map(|v| {
            v.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
    }

    fn parse<T>(&mut self, key: &str, target: &mut T)
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.string(key) {
            match raw.parse() {
                Ok(value) => *target = value,
                Err(e) => self.errors.push(format!("{ENV_PREFIX}{key}={raw:?}: {e}")),
            }
        }
    }

    fn duration(&mut self, key: &str, target: &mut Duration) {
        if let Some(raw) = self.string(key) {
            match parse_duration(&raw) {
                Some(value) => *target = value,
                None => self
                    .errors
                    .push(format!("{ENV_PREFIX}{key}={raw:?}: expected a duration like 30s")),
            }
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let mut env = EnvReader {
            lookup,
            errors: Vec::new(),
        };

        if let Some(url) = env.string("DATABASE_URL") {
            config.database.url = url;
        }
        env.parse("DB_MAX_CONNECTIONS", &mut config.database.max_connections);

        if let Some(codes) = env.list("SUPPORTED_CURRENCIES") {
            config.supported_currencies = codes;
        }
        env.duration("LATEST_TTL", &mut config.latest_ttl);

        if let Some(names) = env.list("SOURCES") {
            match names
                .iter()
                .map(|n| n.parse::<SourceKind>())
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(kinds) => config.sources.sources = kinds,
                Err(e) => env.errors.push(format!("{ENV_PREFIX}SOURCES: {e}")),
            }
        }
        config.sources.frankfurter_url = env.string("FRANKFURTER_URL");
        config.sources.exchangerate_host_url = env.string("EXCHANGERATE_HOST_URL");
        config.sources.exchangerate_host_key = env.string("EXCHANGERATE_HOST_KEY");
        env.duration("PROVIDER_TTL", &mut config.sources.cache_ttl);
        env.duration("SOURCE_TIMEOUT", &mut config.sources.source_timeout);

        env.parse("WORKER_CONCURRENCY", &mut config.worker.concurrency);
        env.parse("MAX_RETRY", &mut config.worker.max_retry);
        env.duration("TASK_TIMEOUT", &mut config.worker.task_timeout);
        env.parse("QUEUE_CAPACITY", &mut config.worker.queue_capacity);
        env.duration("RETRY_BASE_DELAY", &mut config.worker.retry_base_delay);
        env.duration("RETRY_MAX_DELAY", &mut config.worker.retry_max_delay);
        env.duration("SHUTDOWN_TIMEOUT", &mut config.worker.shutdown_timeout);
        env.duration("ORPHAN_AFTER", &mut config.worker.orphan_after);

        env.duration("STORE_TIMEOUT", &mut config.timeouts.store);
        env.duration("CACHE_TIMEOUT", &mut config.timeouts.cache);
        env.duration("FETCH_TIMEOUT", &mut config.timeouts.fetch);

        env.parse("LOG_FORMAT", &mut config.log_format);

        config.env_errors = env.errors;
        config
    }

    /// Build the pair validator for the configured allow-list.
    pub fn pair_validator(&self) -> fxquote_common::Result<PairValidator> {
        PairValidator::from_codes(&self.supported_currencies)
    }

    /// Validate configuration, reporting every problem found.
    pub fn validate(&self) -> Result<(), String> {
        let mut problems = self.env_errors.clone();

        if self.database.url.is_empty() {
            problems.push("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            problems.push("Database pool needs at least one connection".to_string());
        }

        match self.pair_validator() {
            Ok(validator) if validator.supported().count() < 2 => {
                problems.push("At least two supported currencies are required".to_string())
            }
            Ok(_) => {}
            Err(e) => problems.push(format!("Supported currencies: {e}")),
        }

        if self.sources.sources.is_empty() {
            problems.push("At least one rate source is required".to_string());
        }
        if self.sources.sources.contains(&SourceKind::ExchangeRateHost)
            && self.sources.exchangerate_host_key.is_none()
        {
            problems.push(format!(
                "{ENV_PREFIX}EXCHANGERATE_HOST_KEY is required when exchangerate_host is enabled"
            ));
        }

        for (name, ttl) in [
            ("Latest quote TTL", self.latest_ttl),
            ("Provider cache TTL", self.sources.cache_ttl),
            ("Task timeout", self.worker.task_timeout),
            ("Fetch timeout", self.timeouts.fetch),
            ("Orphan age", self.worker.orphan_after),
        ] {
            if ttl.is_zero() {
                problems.push(format!("{name} cannot be zero"));
            }
        }

        if self.worker.concurrency == 0 {
            problems.push("Worker concurrency cannot be 0".to_string());
        }
        if self.worker.queue_capacity == 0 {
            problems.push("Queue capacity cannot be 0".to_string());
        }
        // mark_running, the fetch and complete must all land before the task deadline.
        let execution_budget = self.timeouts.fetch + self.timeouts.store * 2;
        if execution_budget >= self.worker.task_timeout {
            problems.push(format!(
                "Fetch timeout plus two store timeouts ({}ms) must be shorter than the task timeout ({}ms)",
                execution_budget.as_millis(),
                self.worker.task_timeout.as_millis()
            ));
        }
        if self.worker.orphan_after <= self.worker.task_timeout {
            problems.push("Orphan age must be longer than the task timeout".to_string());
        }
        if self.worker.retry_base_delay > self.worker.retry_max_delay {
            problems.push("Retry base delay cannot exceed the max delay".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}
