//! Materialized result cache.
//!
//! Entries carry the page total next to the payload so a cache hit can
//! still tell the caller how many rows the unpaged query matched.

use crate::backend::CacheBackend;
use crate::key::CacheKey;
use crate::reference::ReferenceIndex;
use crate::region::CacheRegion;
use crate::stats::CacheStats;
use query_core::{Pager, Result};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error};

/// Values the result cache can hold.
pub trait CacheableOutput: Any + Clone + Send + Sync {
    /// Whether rows are still produced lazily from a backend result
    fn is_deferred(&self) -> bool {
        false
    }

    /// Forces deferred rows into memory.
    fn materialize(self) -> Result<Self> {
        Ok(self)
    }
}

#[derive(Debug, Clone)]
struct CachedResult<T> {
    data: T,
    total: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    region: CacheRegion,
    references: Arc<ReferenceIndex>,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, references: Arc<ReferenceIndex>) -> Self {
        Self {
            region: CacheRegion::new("result", backend),
            references,
        }
    }

    pub fn references(&self) -> &Arc<ReferenceIndex> {
        &self.references
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.region.stats()
    }

    fn hit<T: CacheableOutput>(&self, key: &CacheKey, pager: Option<&Pager>) -> Option<T> {
        let cached = self.region.lookup::<CachedResult<T>>(key)?;
        if let (Some(pager), Some(total)) = (pager, cached.total) {
            pager.set_record_count(total);
        }
        Some(cached.data)
    }

    fn populate<T: CacheableOutput>(
        &self,
        tenant: &str,
        key: &CacheKey,
        expiry: Duration,
        entity_types: &[String],
        pager: Option<&Pager>,
        output: T,
    ) -> Result<T> {
        let output = if pager.is_some() && output.is_deferred() {
            output.materialize()?
        } else {
            output
        };
        let total = pager.and_then(Pager::record_count);

        let entry = CachedResult {
            data: output.clone(),
            total,
        };
        if self.region.store(key, entry, expiry) {
            self.register(tenant, key, entity_types);
        }
        Ok(output)
    }

    /// Records `key` under its entity types. Inside a runtime the update runs
    /// on the blocking pool, since the index lock can be held for seconds.
    fn register(&self, tenant: &str, key: &CacheKey, entity_types: &[String]) {
        let references = self.references.clone();
        let region = self.region.clone();
        let tenant = tenant.to_string();
        let key = key.clone();
        let entity_types = entity_types.to_vec();
        let update = move || {
            if let Err(e) = references.add(&tenant, &entity_types, &key) {
                error!("Reference index update for {} failed: {}", key, e);
                // An unreferenced entry would survive invalidation
                region.remove(&key);
            } else {
                debug!("Cached result {} for {:?}", key, entity_types);
            }
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(update);
            }
            Err(_) => update(),
        }
    }

    /// Cached output for `key`, executing and storing it on a miss.
    pub fn get_or_execute<T, F>(
        &self,
        tenant: &str,
        key: &CacheKey,
        expiry: Duration,
        entity_types: &[String],
        pager: Option<&Pager>,
        execute: F,
    ) -> Result<T>
    where
        T: CacheableOutput,
        F: FnOnce() -> Result<T>,
    {
        if let Some(hit) = self.hit(key, pager) {
            return Ok(hit);
        }
        let output = execute()?;
        self.populate(tenant, key, expiry, entity_types, pager, output)
    }

    pub async fn get_or_execute_async<T, F, Fut>(
        &self,
        tenant: &str,
        key: &CacheKey,
        expiry: Duration,
        entity_types: &[String],
        pager: Option<&Pager>,
        execute: F,
    ) -> Result<T>
    where
        T: CacheableOutput,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.hit(key, pager) {
            return Ok(hit);
        }
        let output = execute().await?;
        self.populate(tenant, key, expiry, entity_types, pager, output)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.region.backend().contains(key.as_str()).unwrap_or(false)
    }
}
