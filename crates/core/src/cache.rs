//! TTL key/value cache with count and byte-size eviction
//!
//! - Entries expire `ttl` after insertion and are dropped lazily on read
//! - Capacity is bounded by entry count and by serialized byte size
//! - Eviction always removes the oldest entry first
//! - Optional JSON persistence across restarts

use crate::digest::{digest_bytes, Digest};
use crate::error::CacheError;
use crate::event::now_ms;
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of live entries
    pub max_entries: usize,
    /// TTL applied when `set` is called without one
    pub default_ttl: Duration,
    /// Maximum total serialized size in bytes
    pub max_size: usize,
    /// Where to persist entries, if anywhere
    pub persist_path: Option<PathBuf>,
    /// Period of the background cleanup task
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Duration::from_secs(300),
            max_size: 50 * 1024 * 1024,
            persist_path: None,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry<T> {
    key: String,
    value: T,
    created_at: u64,
    ttl_ms: u64,
    size: usize,
    hash: Digest,
    #[serde(skip)]
    seq: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.created_at) > self.ttl_ms
    }

    fn age_key(&self) -> (u64, u64) {
        (self.created_at, self.seq)
    }
}

/// Metadata of a cached entry, without its value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryMetadata {
    pub key: String,
    pub created_at: u64,
    pub ttl: Duration,
    pub size: usize,
    pub hash: Digest,
}

/// Cache counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub total_entries: usize,
    pub total_size: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    /// Percentage of lookups that hit, 0..=100
    pub hit_rate: f64,
    pub eviction_count: u64,
    pub oldest_entry: Option<u64>,
    pub newest_entry: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct PersistedCache<T> {
    timestamp: u64,
    entries: Vec<CacheEntry<T>>,
}

struct CacheInner<T> {
    entries: AHashMap<String, CacheEntry<T>>,
    config: CacheConfig,
    current_size: usize,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<T> CacheInner<T> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.current_size -= entry.size;
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .entries
            .values()
            .min_by_key(|e| e.age_key())
            .map(|e| e.key.clone());

        match oldest {
            Some(key) => {
                self.remove(&key);
                self.evictions += 1;
                debug!("Evicted cache entry {}", key);
                true
            }
            None => false,
        }
    }

    /// Make room for an entry of `incoming` bytes
    fn ensure_capacity(&mut self, incoming: usize, adding_entry: bool) {
        let max_entries = self.config.max_entries;
        let limit = if adding_entry {
            max_entries.saturating_sub(1)
        } else {
            max_entries
        };
        while self.entries.len() > limit {
            if !self.evict_oldest() {
                break;
            }
        }
        while self.current_size + incoming > self.config.max_size {
            if !self.evict_oldest() {
                break;
            }
        }
    }
}

/// Generic TTL cache
///
/// All methods take `&self`; the cache is safe to share behind an `Arc`.
pub struct Cache<T> {
    inner: Mutex<CacheInner<T>>,
}

impl<T> Cache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: AHashMap::new(),
                config,
                current_size: 0,
                next_seq: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    /// Look up a live entry
    ///
    /// An expired entry is removed and counts as a miss.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = now_ms();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Insert a value with the default TTL
    pub fn set(&self, key: impl Into<String>, value: T) -> Result<bool, CacheError> {
        self.set_with_ttl(key, value, None)
    }

    /// Insert a value, evicting the oldest entries as needed
    ///
    /// Returns false when the value alone exceeds the size budget and was
    /// not stored.
    pub fn set_with_ttl(
        &self,
        key: impl Into<String>,
        value: T,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let key = key.into();
        let serialized = serde_json::to_vec(&value)?;
        let size = serialized.len();
        let hash = digest_bytes(&serialized);

        let mut inner = self.inner.lock();
        if size > inner.config.max_size {
            debug!("Cache entry {} ({} bytes) exceeds size budget", key, size);
            return Ok(false);
        }

        inner.remove(&key);
        inner.ensure_capacity(size, true);

        let ttl = ttl.unwrap_or(inner.config.default_ttl);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.current_size += size;
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                created_at: now_ms(),
                ttl_ms: ttl.as_millis() as u64,
                size,
                hash,
                seq,
            },
        );
        Ok(true)
    }

    /// Whether a live entry exists (expired entries are dropped)
    pub fn has(&self, key: &str) -> bool {
        let now = now_ms();
        let mut inner = self.inner.lock();
        match inner.entries.get(key).map(|e| e.is_expired(now)) {
            Some(false) => true,
            Some(true) => {
                inner.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.current_size = 0;
        inner.evictions = 0;
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total serialized size of live entries in bytes
    pub fn size(&self) -> usize {
        self.inner.lock().current_size
    }

    /// Drop every expired entry, returning how many were removed
    pub fn cleanup(&self) -> usize {
        let now = now_ms();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn entry_metadata(&self, key: &str) -> Option<EntryMetadata> {
        self.inner.lock().entries.get(key).map(|e| EntryMetadata {
            key: e.key.clone(),
            created_at: e.created_at,
            ttl: Duration::from_millis(e.ttl_ms),
            size: e.size,
            hash: e.hash,
        })
    }

    pub fn statistics(&self) -> CacheStatistics {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStatistics {
            total_entries: inner.entries.len(),
            total_size: inner.current_size,
            hit_count: inner.hits,
            miss_count: inner.misses,
            hit_rate: if lookups > 0 {
                inner.hits as f64 / lookups as f64 * 100.0
            } else {
                0.0
            },
            eviction_count: inner.evictions,
            oldest_entry: inner.entries.values().map(|e| e.created_at).min(),
            newest_entry: inner.entries.values().map(|e| e.created_at).max(),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.lock().config.clone()
    }

    /// Swap configuration; shrinking limits evicts immediately
    pub fn update_config(&self, config: CacheConfig) {
        let mut inner = self.inner.lock();
        inner.config = config;
        inner.ensure_capacity(0, false);
    }

    /// Restore unexpired entries from the persistence file
    ///
    /// A missing file is not an error and loads nothing.
    pub fn load_persisted(&self) -> Result<usize, CacheError> {
        let Some(path) = self.config().persist_path else {
            return Ok(0);
        };
        if !path.exists() {
            debug!("No persisted cache at {}", path.display());
            return Ok(0);
        }

        let data = std::fs::read(&path)?;
        let persisted: PersistedCache<T> = serde_json::from_slice(&data)?;
        let now = now_ms();

        let mut inner = self.inner.lock();
        let mut loaded = 0;
        let mut entries = persisted.entries;
        entries.sort_by_key(|e| e.created_at);
        for mut entry in entries {
            if entry.is_expired(now) {
                continue;
            }
            inner.remove(&entry.key);
            inner.ensure_capacity(entry.size, true);
            if inner.current_size + entry.size > inner.config.max_size {
                continue;
            }
            entry.seq = inner.next_seq;
            inner.next_seq += 1;
            inner.current_size += entry.size;
            inner.entries.insert(entry.key.clone(), entry);
            loaded += 1;
        }

        info!("Loaded {} cache entries from {}", loaded, path.display());
        Ok(loaded)
    }

    /// Write live entries to the persistence file
    pub fn save_persisted(&self) -> Result<(), CacheError> {
        let Some(path) = self.config().persist_path else {
            return Ok(());
        };

        let data = {
            let inner = self.inner.lock();
            let persisted = PersistedCache {
                timestamp: now_ms(),
                entries: inner.entries.values().cloned().collect(),
            };
            serde_json::to_vec_pretty(&persisted)?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        debug!("Saved cache to {}", path.display());
        Ok(())
    }

    /// Spawn the periodic cleanup loop
    ///
    /// The task holds a weak reference and exits once the cache is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config().cleanup_interval;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.cleanup();
                if removed > 0 {
                    debug!("Cache cleanup removed {} expired entries", removed);
                }
            }
        })
    }

    /// Persist if configured, then drop every entry
    pub fn destroy(&self) {
        if let Err(e) = self.save_persisted() {
            warn!("Failed to persist cache on shutdown: {}", e);
        }
        self.clear();
    }
}
