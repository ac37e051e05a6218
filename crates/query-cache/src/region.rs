//! A named cache region over a shared backend.
//!
//! Backend failures never fail the caller: lookups degrade to misses and
//! stores are skipped, both logged at error level.

use crate::backend::{CacheBackend, CacheValue};
use crate::key::CacheKey;
use crate::stats::CacheStats;
use query_core::Result;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct CacheRegion {
    name: &'static str,
    backend: Arc<dyn CacheBackend>,
    stats: Arc<CacheStats>,
}

impl CacheRegion {
    pub fn new(name: &'static str, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            name,
            backend,
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn lookup<T>(&self, key: &CacheKey) -> Option<T>
    where
        T: Any + Clone + Send + Sync,
    {
        let value = match self.backend.get(key.as_str()) {
            Ok(value) => value,
            Err(e) => {
                error!("{} cache lookup failed for {}: {}", self.name, key, e);
                self.stats.record_error();
                None
            }
        };

        match value.map(|v| v.downcast::<T>()) {
            Some(Ok(hit)) => {
                debug!("{} cache hit: {}", self.name, key);
                self.stats.record_hit();
                Some(T::clone(&hit))
            }
            Some(Err(_)) => {
                warn!("{} cache entry {} holds an unexpected type", self.name, key);
                self.stats.record_miss();
                None
            }
            None => {
                debug!("{} cache miss: {}", self.name, key);
                self.stats.record_miss();
                None
            }
        }
    }

    /// Returns whether the value was stored.
    pub fn store<T>(&self, key: &CacheKey, value: T, expiry: Duration) -> bool
    where
        T: Any + Send + Sync,
    {
        let value: CacheValue = Arc::new(value);
        match self.backend.set(key.as_str(), value, Some(expiry)) {
            Ok(()) => true,
            Err(e) => {
                error!("{} cache store failed for {}: {}", self.name, key, e);
                self.stats.record_error();
                false
            }
        }
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        match self.backend.remove(key.as_str()) {
            Ok(removed) => removed,
            Err(e) => {
                error!("{} cache remove failed for {}: {}", self.name, key, e);
                self.stats.record_error();
                false
            }
        }
    }

    /// Cached value for `key`, computing and storing it on a miss. Racing
    /// callers may both compute; the last store wins.
    pub fn try_get<T, F>(&self, key: &CacheKey, expiry: Duration, compute: F) -> Result<T>
    where
        T: Any + Clone + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        if let Some(hit) = self.lookup::<T>(key) {
            return Ok(hit);
        }
        let value = compute()?;
        self.store(key, value.clone(), expiry);
        Ok(value)
    }

    pub async fn try_get_async<T, F, Fut>(
        &self,
        key: &CacheKey,
        expiry: Duration,
        compute: F,
    ) -> Result<T>
    where
        T: Any + Clone + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.lookup::<T>(key) {
            return Ok(hit);
        }
        let value = compute().await?;
        self.store(key, value.clone(), expiry);
        Ok(value)
    }
}

impl std::fmt::Debug for CacheRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegion")
            .field("name", &self.name)
            .field("hits", &self.stats.hits())
            .field("misses", &self.stats.misses())
            .finish()
    }
}
