//! TTL and capacity bounded cache for per-device configuration.
//!
//! Lets a controller restore its settings when a device reconnects.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Cache limits.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Maximum number of entries; the oldest one is evicted on overflow
    pub capacity: usize,
    /// Default lifetime of an entry
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Shared key/value cache with expiry.
#[derive(Debug)]
pub struct ConfigCache<V> {
    config: CacheConfig,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> ConfigCache<V> {
    /// Create an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Live value for `key`. Expired entries are dropped on access.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` with the default lifetime.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.config.ttl);
    }

    /// Store `value` for `ttl`.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        entries.retain(|_, entry| entry.expires_at > now);
        if !entries.contains_key(&key) && entries.len() >= self.config.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }

    /// Drop `key`.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|entry| entry.value)
    }

    /// Number of stored entries, including ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for ConfigCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
