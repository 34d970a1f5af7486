//! Read-through TTL cache
//!
//! Small get-or-compute cache used by the plan catalog. Entries expire after
//! a fixed TTL and can be invalidated explicitly when plans are edited.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Keeps memory bounded if keys are attacker-controlled (e.g. plan codes
/// from request bodies that miss).
const MAX_CACHE_ENTRIES: usize = 1_024;

#[derive(Clone)]
struct CachedValue<V> {
    value: V,
    cached_at: Instant,
}

#[derive(Clone)]
pub struct TtlCache<K, V> {
    entries: Arc<RwLock<HashMap<K, CachedValue<V>>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Returns the cached value if still fresh.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        if entries.len() >= MAX_CACHE_ENTRIES && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.cached_at.elapsed() < ttl);
            if entries.len() >= MAX_CACHE_ENTRIES {
                entries.clear();
            }
        }
        entries.insert(
            key,
            CachedValue {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// Get the value for `key`, computing and caching it on a miss.
    ///
    /// Errors from `compute` are returned as-is and nothing is cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }
        let value = compute().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }
}
