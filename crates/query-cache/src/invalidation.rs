//! Cache invalidation support
//!
//! Mutations drop every cached result read from the entity types they
//! wrote. Removal runs on the tokio blocking pool when a runtime is
//! available and inline otherwise.

use crate::backend::CacheBackend;
use crate::reference::ReferenceIndex;
use crate::stats::CacheStats;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Events that can trigger cache invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationEvent {
    /// Rows of these entity types were inserted, updated or deleted
    EntitiesMutated {
        tenant: String,
        entity_types: Vec<String>,
    },
    /// Drop everything the tenant has cached
    InvalidateAll { tenant: String },
}

impl InvalidationEvent {
    pub fn entities_mutated(tenant: impl Into<String>, entity_types: Vec<String>) -> Self {
        Self::EntitiesMutated {
            tenant: tenant.into(),
            entity_types,
        }
    }

    pub fn invalidate_all(tenant: impl Into<String>) -> Self {
        Self::InvalidateAll {
            tenant: tenant.into(),
        }
    }

    pub fn tenant(&self) -> &str {
        match self {
            Self::EntitiesMutated { tenant, .. } | Self::InvalidateAll { tenant } => tenant,
        }
    }
}

#[derive(Clone)]
pub struct Invalidator {
    backend: Arc<dyn CacheBackend>,
    references: Arc<ReferenceIndex>,
    stats: Arc<CacheStats>,
}

impl Invalidator {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        references: Arc<ReferenceIndex>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            backend,
            references,
            stats,
        }
    }

    /// Schedules removal of every result read from `entity_types`. Returns
    /// the task handle when the work was spawned.
    pub fn on_mutation(&self, tenant: &str, entity_types: &[String]) -> Option<JoinHandle<usize>> {
        if entity_types.is_empty() {
            return None;
        }
        let event = InvalidationEvent::entities_mutated(tenant, entity_types.to_vec());

        match Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                Some(handle.spawn_blocking(move || this.handle(&event)))
            }
            Err(_) => {
                self.handle(&event);
                None
            }
        }
    }

    /// Applies `event` now, returning how many entries were removed.
    pub fn handle(&self, event: &InvalidationEvent) -> usize {
        let tenant = event.tenant();
        let entity_types = match event {
            InvalidationEvent::EntitiesMutated { entity_types, .. } => entity_types.clone(),
            InvalidationEvent::InvalidateAll { .. } => {
                match self.references.entity_types(tenant) {
                    Ok(types) => types,
                    Err(e) => {
                        error!("Listing cached entity types for '{}' failed: {}", tenant, e);
                        return 0;
                    }
                }
            }
        };

        let mut removed = 0;
        for entity_type in &entity_types {
            let keys = match self.references.take(tenant, entity_type) {
                Ok(keys) => keys,
                Err(e) => {
                    error!("Invalidating results of {} failed: {}", entity_type, e);
                    continue;
                }
            };
            for key in keys {
                match self.backend.remove(key.as_str()) {
                    Ok(true) => removed += 1,
                    Ok(false) => debug!("Result {} already gone", key),
                    Err(e) => error!("Removing result {} failed: {}", key, e),
                }
            }
        }

        self.stats.record_invalidations(removed as u64);
        info!(
            "Invalidated {} cached results for {:?} (tenant '{}')",
            removed, entity_types, tenant
        );
        removed
    }
}

impl std::fmt::Debug for Invalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invalidator")
            .field("invalidations", &self.stats.invalidations())
            .finish()
    }
}
