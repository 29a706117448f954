//! Key-value cache abstraction with hash entries and TTL.
//!
//! Entries are small field maps written whole, so a reader never observes a
//! price without its timestamp.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::CacheError;

/// Field map stored under one cache key.
pub type CacheFields = HashMap<String, String>;

/// Hash-valued cache with per-key expiry.
#[async_trait]
pub trait HashCache: Send + Sync {
    /// Read every field of a key. `None` on miss or expiry.
    async fn get(&self, key: &str) -> Result<Option<CacheFields>, CacheError>;

    /// Replace a key's fields and TTL in one step.
    async fn set(&self, key: &str, fields: CacheFields, ttl: Duration) -> Result<(), CacheError>;

    /// Remove a key. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Check the backend is reachable.
    async fn ping(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    fields: CacheFields,
    cached_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn new(fields: CacheFields, ttl: Duration) -> Self {
        Self {
            fields,
            cached_at: Instant::now(),
            ttl,
        }
    }

    fn is_valid(&self) -> bool {
        self.cached_at.elapsed() < self.ttl
    }
}

/// Configuration for the in-memory cache.
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// Entry count above which expired entries are swept on insert.
    pub max_entries: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

/// Process-local [`HashCache`] backed by a concurrent map.
pub struct MemoryHashCache {
    entries: DashMap<String, CacheEntry>,
    config: MemoryCacheConfig,
    available: AtomicBool,
}

impl MemoryHashCache {
    pub fn new() -> Self {
        Self::with_config(MemoryCacheConfig::default())
    }

    pub fn with_config(config: MemoryCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every operation fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::Unavailable("memory cache offline".to_string()))
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove `key` only if its entry is still expired, so a concurrent
    /// `set` between the read and the removal survives.
    fn remove_expired(&self, key: &str) {
        self.entries.remove_if(key, |_, entry| !entry.is_valid());
    }

    /// Drop every expired entry.
    pub fn evict_expired(&self) {
        self.entries.retain(|_, entry| entry.is_valid());
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.entries.len();
        let valid = self.entries.iter().filter(|e| e.is_valid()).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }
}

impl Default for MemoryHashCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HashCache for MemoryHashCache {
    async fn get(&self, key: &str) -> Result<Option<CacheFields>, CacheError> {
        self.check_available()?;

        if let Some(entry) = self.entries.get(key) {
            if entry.is_valid() {
                debug!(key, "Cache hit");
                return Ok(Some(entry.fields.clone()));
            }
            debug!(key, "Cache entry expired");
            drop(entry);
            self.remove_expired(key);
        }

        debug!(key, "Cache miss");
        Ok(None)
    }

    async fn set(&self, key: &str, fields: CacheFields, ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;

        if self.entries.len() >= self.config.max_entries {
            self.evict_expired();
        }

        self.entries
            .insert(key.to_string(), CacheEntry::new(fields, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.check_available()
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}
