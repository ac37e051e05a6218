//! Reference index: entity type to the result-cache keys whose payload was
//! read from it.
//!
//! Buckets live in the cache backend's set primitive. A root set per
//! (cache kind, tenant) lists the entity types that currently own a bucket.
//! Every bucket update runs in a critical section: the backend's own
//! transaction when it offers one, a local lock otherwise.

use crate::backend::CacheBackend;
use crate::key::{CacheKey, KeyKind};
use parking_lot::RwLock;
use query_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Outcome of one sweep pass over a tenant's buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub buckets: usize,
    /// Keys dropped because their entry no longer exists
    pub pruned: usize,
    pub removed_buckets: usize,
    pub failures: usize,
}

pub struct ReferenceIndex {
    backend: Arc<dyn CacheBackend>,
    kind: KeyKind,
    lock_timeout: Duration,
    local: RwLock<()>,
}

impl ReferenceIndex {
    pub fn new(backend: Arc<dyn CacheBackend>, kind: KeyKind, lock_timeout: Duration) -> Self {
        Self {
            backend,
            kind,
            lock_timeout,
            local: RwLock::new(()),
        }
    }

    pub fn root_key(&self, tenant: &str) -> String {
        format!("__refs:{}:{}", self.kind.tag(), tenant)
    }

    fn bucket_key(&self, tenant: &str, entity_type: &str) -> String {
        format!("{}:{}", self.root_key(tenant), entity_type)
    }

    fn critical(&self, lock_key: &str, body: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        match self.backend.transactions() {
            Some(transactions) => transactions.use_transaction(lock_key, self.lock_timeout, body),
            None => {
                let _guard = self.local.write();
                body()
            }
        }
    }

    /// Records that `key` was populated from each of `entity_types`.
    pub fn add(&self, tenant: &str, entity_types: &[String], key: &CacheKey) -> Result<()> {
        let root = self.root_key(tenant);
        for entity_type in entity_types {
            let bucket = self.bucket_key(tenant, entity_type);
            self.critical(&bucket, &mut || {
                self.backend.set_add(&root, entity_type)?;
                self.backend.set_add(&bucket, key.as_str())
            })?;
        }
        Ok(())
    }

    pub fn entity_types(&self, tenant: &str) -> Result<Vec<String>> {
        let mut types = self.backend.set_members(&self.root_key(tenant))?;
        types.sort();
        Ok(types)
    }

    pub fn keys_for(&self, tenant: &str, entity_type: &str) -> Result<Vec<CacheKey>> {
        let mut keys = self
            .backend
            .set_members(&self.bucket_key(tenant, entity_type))?;
        keys.sort();
        Ok(keys.into_iter().map(CacheKey::from_stored).collect())
    }

    /// Empties the bucket of `entity_type`, returning the keys it held.
    pub fn take(&self, tenant: &str, entity_type: &str) -> Result<Vec<CacheKey>> {
        let root = self.root_key(tenant);
        let bucket = self.bucket_key(tenant, entity_type);
        let mut taken = Vec::new();
        self.critical(&bucket, &mut || {
            taken = self.backend.set_members(&bucket)?;
            self.backend.remove_set(&bucket)?;
            self.backend.set_remove(&root, entity_type)
        })?;
        Ok(taken.into_iter().map(CacheKey::from_stored).collect())
    }

    /// Drops keys whose entry vanished and buckets left empty. A failing
    /// bucket is logged and skipped.
    pub fn sweep(&self, tenant: &str) -> SweepReport {
        let mut report = SweepReport::default();
        let types = match self.entity_types(tenant) {
            Ok(types) => types,
            Err(e) => {
                error!("Reference sweep for tenant '{}' failed: {}", tenant, e);
                report.failures += 1;
                return report;
            }
        };

        let root = self.root_key(tenant);
        for entity_type in types {
            report.buckets += 1;
            let bucket = self.bucket_key(tenant, &entity_type);
            let mut pruned = 0;
            let mut emptied = false;

            let outcome = self.critical(&bucket, &mut || {
                pruned = 0;
                let keys = self.backend.set_members(&bucket)?;
                let mut live = keys.len();
                for key in &keys {
                    if !self.backend.contains(key)? {
                        self.backend.set_remove(&bucket, key)?;
                        pruned += 1;
                        live -= 1;
                    }
                }
                emptied = live == 0;
                if emptied {
                    self.backend.remove_set(&bucket)?;
                    self.backend.set_remove(&root, &entity_type)?;
                }
                Ok(())
            });

            match outcome {
                Ok(()) => {
                    report.pruned += pruned;
                    if emptied {
                        report.removed_buckets += 1;
                    }
                }
                Err(e) => {
                    error!("Sweep of bucket {} failed: {}", bucket, e);
                    report.failures += 1;
                }
            }
        }

        debug!("Reference sweep for tenant '{}': {:?}", tenant, report);
        report
    }
}

impl std::fmt::Debug for ReferenceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceIndex")
            .field("kind", &self.kind)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}
