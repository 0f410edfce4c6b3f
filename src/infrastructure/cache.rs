//! Tiered In-Process Cache
//!
//! Namespaced TTL caches with approximate LRU eviction, lazy expiry on read
//! and a periodic expiry sweep.

use crate::domain::entities::unix_millis;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lower bound for the sweep period; a zero period would spin.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(1);

/// Predefined cache namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    Memory,
    Session,
    Api,
    Database,
    User,
    Static,
}

impl CacheType {
    pub const ALL: [CacheType; 6] = [
        CacheType::Memory,
        CacheType::Session,
        CacheType::Api,
        CacheType::Database,
        CacheType::User,
        CacheType::Static,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Memory => "memory",
            CacheType::Session => "session",
            CacheType::Api => "api",
            CacheType::Database => "database",
            CacheType::User => "user",
            CacheType::Static => "static",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        match self {
            CacheType::Memory => Duration::from_secs(60),
            CacheType::Session => Duration::from_secs(30 * 60),
            CacheType::Api => Duration::from_secs(5 * 60),
            CacheType::Database => Duration::from_secs(10 * 60),
            CacheType::User => Duration::from_secs(15 * 60),
            CacheType::Static => Duration::from_secs(24 * 60 * 60),
        }
    }

    fn default_max_size(&self) -> usize {
        match self {
            CacheType::Session => 10_000,
            CacheType::Static => 500,
            _ => 1_000,
        }
    }

    pub fn config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Some(self.default_ttl()),
            max_size: self.default_max_size(),
        }
    }
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-namespace configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when `set` gets none; `None` means entries never expire
    pub default_ttl: Option<Duration>,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheType::Memory.config()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created: u64,
    /// None = never expires
    expires: Option<Instant>,
    last_accessed: Instant,
    hits: u64,
    size: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires.map(|at| now >= at).unwrap_or(false)
    }
}

/// Entries plus their byte estimate, updated together.
#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, CacheEntry>,
    size_estimate: usize,
}

impl Store {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.size_estimate = self.size_estimate.saturating_sub(entry.size);
        Some(entry)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub namespace: String,
    pub entries: usize,
    pub max_size: usize,
    pub size_estimate_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    #[serde(serialize_with = "two_decimals")]
    pub hit_rate: f64,
}

fn two_decimals<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((v * 100.0).round() / 100.0)
}

/// Approximate in-memory footprint of a JSON value, in bytes.
pub fn estimate_size(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(s) => s.chars().count() * 2,
        Value::Array(items) => items.iter().map(estimate_size).sum(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.chars().count() * 2 + estimate_size(v))
            .sum(),
    }
}

/// A single cache namespace.
pub struct Cache {
    namespace: String,
    config: CacheConfig,
    store: Mutex<Store>,
    counters: Counters,
}

impl Cache {
    pub fn new(namespace: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            namespace: namespace.into(),
            config,
            store: Mutex::new(Store::default()),
            counters: Counters::default(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn composite_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Look up a value. Expired entries count as misses and are removed.
    pub fn get(&self, key: &str) -> Option<Value> {
        let key = self.composite_key(key);
        let now = Instant::now();
        let mut store = self.store.lock();

        let expired = match store.entries.get_mut(&key) {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                entry.hits += 1;
                entry.last_accessed = now;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        };

        if expired && store.remove(&key).is_some() {
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Typed lookup; values that fail to deserialize are treated as misses.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Store a value. `ttl` overrides the namespace default; a zero TTL never expires.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let key = self.composite_key(key);
        let now = Instant::now();
        let ttl = ttl.or(self.config.default_ttl).filter(|t| !t.is_zero());
        let size = estimate_size(&value) + key.len() * 2;

        let mut store = self.store.lock();
        store.remove(&key);

        if self.config.max_size == 0 {
            tracing::debug!(category = "cache", "{} has no capacity, dropping {}", self.namespace, key);
            return;
        }
        if store.entries.len() >= self.config.max_size {
            self.evict_lru(&mut store);
        }

        store.entries.insert(
            key,
            CacheEntry {
                value,
                created: unix_millis(),
                expires: ttl.map(|t| now + t),
                last_accessed: now,
                hits: 0,
                size,
            },
        );
        store.size_estimate += size;
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Typed store.
    pub fn set_as<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), serde_json::Error> {
        self.set(key, serde_json::to_value(value)?, ttl);
        Ok(())
    }

    fn evict_lru(&self, store: &mut Store) {
        let oldest = store
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(k, _)| k.clone());

        if let Some(key) = oldest {
            store.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(category = "cache", "{} evicted {}", self.namespace, key);
        }
    }

    /// Whether a live entry exists. Expired entries are removed.
    pub fn has(&self, key: &str) -> bool {
        let key = self.composite_key(key);
        let now = Instant::now();
        let mut store = self.store.lock();

        let expired = match store.entries.get(&key) {
            None => return false,
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            store.remove(&key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        !expired
    }

    pub fn delete(&self, key: &str) -> bool {
        let key = self.composite_key(key);
        let removed = self.store.lock().remove(&key).is_some();
        if removed {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn clear(&self) {
        let mut store = self.store.lock();
        store.entries.clear();
        store.size_estimate = 0;
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut store = self.store.lock();

        let expired: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = 0;
        for key in &expired {
            if store.remove(key).is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            self.counters
                .expirations
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(
                category = "cache",
                "{} cleanup removed {} expired entries",
                self.namespace,
                removed
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit count and creation time (Unix ms) of a live entry.
    pub fn entry_info(&self, key: &str) -> Option<(u64, u64)> {
        let key = self.composite_key(key);
        let store = self.store.lock();
        store
            .entries
            .get(&key)
            .filter(|e| !e.is_expired(Instant::now()))
            .map(|e| (e.hits, e.created))
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.store.lock();
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            namespace: self.namespace.clone(),
            entries: store.entries.len(),
            max_size: self.config.max_size,
            size_estimate_bytes: store.size_estimate,
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64 * 100.0
            },
        }
    }
}

/// Owns every cache namespace of one process.
pub struct CacheManager {
    caches: DashMap<String, Arc<Cache>>,
    cleanup_interval: Duration,
    /// Parent of every sweeper token; cancelled when the manager drops
    cancel: CancellationToken,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CacheManager {
    /// Create a manager with the predefined namespaces.
    pub fn new(cleanup_interval: Duration) -> Self {
        let caches = DashMap::new();
        for ty in CacheType::ALL {
            caches.insert(ty.as_str().to_string(), Arc::new(Cache::new(ty.as_str(), ty.config())));
        }
        Self {
            caches,
            cleanup_interval,
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// A predefined namespace.
    pub fn cache(&self, ty: CacheType) -> Arc<Cache> {
        self.named(ty.as_str())
    }

    /// A namespace by name, created with memory defaults if unknown.
    pub fn named(&self, namespace: &str) -> Arc<Cache> {
        self.caches
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Cache::new(namespace, CacheConfig::default())))
            .clone()
    }

    /// Register a namespace with explicit settings, replacing any existing one.
    pub fn configure(&self, namespace: &str, config: CacheConfig) -> Arc<Cache> {
        let cache = Arc::new(Cache::new(namespace, config));
        self.caches.insert(namespace.to_string(), cache.clone());
        cache
    }

    /// Sweep every namespace once.
    pub fn cleanup(&self) -> usize {
        self.caches.iter().map(|c| c.cleanup()).sum()
    }

    pub fn clear_all(&self) {
        for cache in self.caches.iter() {
            cache.clear();
        }
    }

    /// Stats for every namespace, sorted by name.
    pub fn stats(&self) -> Vec<CacheStats> {
        let mut stats: Vec<CacheStats> = self.caches.iter().map(|c| c.stats()).collect();
        stats.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        stats
    }

    /// Start the periodic expiry sweep.
    pub fn start_cleanup(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let manager = Arc::downgrade(self);
        let cancel = self.cancel.child_token();
        let interval = self.cleanup_interval.max(MIN_CLEANUP_INTERVAL);

        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.cleanup();
                    }
                }
            }
        });
        *sweeper = Some((token, handle));
    }

    /// Stop the sweep. `start_cleanup` may be called again afterwards.
    pub fn stop(&self) {
        if let Some((cancel, _)) = self.sweeper.lock().take() {
            cancel.cancel();
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
