//! Compiled plan cache.

use crate::backend::CacheBackend;
use crate::key::CacheKey;
use crate::region::CacheRegion;
use crate::stats::CacheStats;
use query_core::{Pager, PagerBound, Result};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PlanCache {
    region: CacheRegion,
}

/// Points `plan` at the caller's pager when it was built against another.
pub fn rebind<P: PagerBound>(plan: P, pager: Option<&Pager>) -> P {
    let Some(live) = pager else {
        return plan;
    };
    if plan.bound_pager().map_or(false, |bound| bound.ptr_eq(live)) {
        return plan;
    }
    debug!("Rebinding cached plan to the caller's pager");
    plan.rebind_pager(live)
}

impl PlanCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            region: CacheRegion::new("plan", backend),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.region.stats()
    }

    pub fn get_or_build<P, F>(
        &self,
        key: &CacheKey,
        expiry: Duration,
        pager: Option<&Pager>,
        build: F,
    ) -> Result<P>
    where
        P: PagerBound + Any + Clone + Send + Sync,
        F: FnOnce() -> Result<P>,
    {
        let plan = self.region.try_get(key, expiry, build)?;
        Ok(rebind(plan, pager))
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.region.remove(key)
    }
}
