//! Hot cache layer using [`moka`].
//!
//! A named, bounded, TTL-limited cache with hit/miss accounting.  Used in
//! front of the embedding table so repeated utterances never touch SQLite or
//! the embedding provider.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

// ── cache stats ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Between 0.0 and 1.0; 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── cache layer ──────────────────────────────────────────────────────

/// Cheaply cloneable async cache.  Clones share entries and statistics.
pub struct CacheLayer<K, V> {
    name: &'static str,
    inner: Cache<K, V>,
    stats: Arc<CacheStats>,
}

impl<K, V> Clone for CacheLayer<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<K, V> CacheLayer<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(name: &'static str) -> CacheLayerBuilder<K, V> {
        CacheLayerBuilder {
            name,
            max_capacity: 10_000,
            ttl: None,
            _marker: std::marker::PhantomData,
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let found = self.inner.get(key).await;
        if found.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            debug!(cache = self.name, key = ?key, "cache miss");
        }
        found
    }

    pub async fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value).await;
    }

    pub async fn invalidate(&self, key: &K) {
        self.inner.invalidate(key).await;
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
        debug!(cache = self.name, "cache cleared");
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Approximate; moka applies evictions lazily.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

// ── builder ──────────────────────────────────────────────────────────

pub struct CacheLayerBuilder<K, V> {
    name: &'static str,
    max_capacity: u64,
    ttl: Option<Duration>,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V> CacheLayerBuilder<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn max_capacity(mut self, cap: u64) -> Self {
        self.max_capacity = cap;
        self
    }

    /// Entries without a TTL live until evicted by capacity.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn build(self) -> CacheLayer<K, V> {
        let mut builder = Cache::builder().max_capacity(self.max_capacity);
        if let Some(ttl) = self.ttl {
            builder = builder.time_to_live(ttl);
        }
        debug!(
            name = self.name,
            max_capacity = self.max_capacity,
            "cache layer created"
        );
        CacheLayer {
            name: self.name,
            inner: builder.build(),
            stats: Arc::new(CacheStats::default()),
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
