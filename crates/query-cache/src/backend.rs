//! Cache storage backends
//!
//! [`CacheBackend`] is the storage contract the plan cache, result cache and
//! reference index are written against: keyed values with optional expiry
//! plus a string-set primitive. Backends that can serialize access to one key
//! across callers also implement [`TransactionalBackend`].

use crate::config::CacheConfig;
use crate::stats::CacheStats;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use query_core::{QueryError, Result};
use std::any::Any;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Type-erased cached value
pub type CacheValue = Arc<dyn Any + Send + Sync>;

pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheValue>>;

    /// Stores `value`, replacing any previous entry wholesale.
    fn set(&self, key: &str, value: CacheValue, expiry: Option<Duration>) -> Result<()>;

    fn remove(&self, key: &str) -> Result<bool>;

    fn contains(&self, key: &str) -> Result<bool>;

    fn set_add(&self, set: &str, member: &str) -> Result<()>;

    fn set_members(&self, set: &str) -> Result<Vec<String>>;

    fn set_remove(&self, set: &str, member: &str) -> Result<()>;

    fn remove_set(&self, set: &str) -> Result<()>;

    /// Drops every entry and set.
    fn clear(&self) -> Result<()>;

    /// Per-key critical sections, when supported.
    fn transactions(&self) -> Option<&dyn TransactionalBackend> {
        None
    }
}

pub trait TransactionalBackend: Send + Sync {
    /// Runs `body` while holding the lock on `lock_key`, waiting at most
    /// `timeout` for it.
    fn use_transaction(
        &self,
        lock_key: &str,
        timeout: Duration,
        body: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()>;
}

struct Entry {
    value: CacheValue,
    created_at: Instant,
    expiry: Option<Duration>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expiry
            .map_or(false, |ttl| self.created_at.elapsed() > ttl)
    }
}

/// LRU-bounded, TTL-aware in-process backend
pub struct MemoryCacheBackend {
    entries: Mutex<LruCache<String, Entry>>,
    sets: DashMap<String, HashSet<String>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    stats: Arc<CacheStats>,
}

impl MemoryCacheBackend {
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            sets: DashMap::new(),
            locks: DashMap::new(),
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries)
    }

    /// Eviction and expiration counters
    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let mut entries = self.entries.lock();

        if entries.peek(key).map_or(false, Entry::is_expired) {
            entries.pop(key);
            self.stats.record_expiration();
            self.stats.set_entry_count(entries.len() as u64);
            return Ok(None);
        }
        Ok(entries.get(key).map(|entry| Arc::clone(&entry.value)))
    }

    fn set(&self, key: &str, value: CacheValue, expiry: Option<Duration>) -> Result<()> {
        let entry = Entry {
            value,
            created_at: Instant::now(),
            expiry,
        };

        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key.to_string(), entry) {
            if evicted != key {
                self.stats.record_eviction();
            }
        }
        self.stats.set_entry_count(entries.len() as u64);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let removed = entries.pop(key).is_some();
        self.stats.set_entry_count(entries.len() as u64);
        Ok(removed)
    }

    fn contains(&self, key: &str) -> Result<bool> {
        let entries = self.entries.lock();
        Ok(entries.peek(key).map_or(false, |entry| !entry.is_expired()))
    }

    fn set_add(&self, set: &str, member: &str) -> Result<()> {
        self.sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    fn set_members(&self, set: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn set_remove(&self, set: &str, member: &str) -> Result<()> {
        if let Some(mut members) = self.sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    fn remove_set(&self, set: &str) -> Result<()> {
        self.sets.remove(set);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.clear();
        self.sets.clear();
        self.stats.set_entry_count(0);
        Ok(())
    }

    fn transactions(&self) -> Option<&dyn TransactionalBackend> {
        Some(self)
    }
}

impl TransactionalBackend for MemoryCacheBackend {
    fn use_transaction(
        &self,
        lock_key: &str,
        timeout: Duration,
        body: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        let lock = Arc::clone(
            self.locks
                .entry(lock_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _guard = lock
            .try_lock_for(timeout)
            .ok_or_else(|| QueryError::LockTimeout(lock_key.to_string()))?;
        body()
    }
}

impl std::fmt::Debug for MemoryCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheBackend")
            .field("entries", &self.len())
            .field("sets", &self.sets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn value(v: i64) -> CacheValue {
        Arc::new(v)
    }

    fn read(backend: &MemoryCacheBackend, key: &str) -> Option<i64> {
        backend
            .get(key)
            .unwrap()
            .and_then(|v| v.downcast_ref::<i64>().copied())
    }

    #[test]
    fn test_set_get_remove() {
        let backend = MemoryCacheBackend::default();
        backend.set("a", value(1), None).unwrap();
        assert_eq!(read(&backend, "a"), Some(1));
        assert!(backend.contains("a").unwrap());

        backend.set("a", value(2), None).unwrap();
        assert_eq!(read(&backend, "a"), Some(2));

        assert!(backend.remove("a").unwrap());
        assert!(!backend.remove("a").unwrap());
        assert_eq!(read(&backend, "a"), None);

        backend.set("b", value(3), None).unwrap();
        backend.set_add("refs", "b").unwrap();
        backend.clear().unwrap();
        assert!(backend.is_empty());
        assert!(backend.set_members("refs").unwrap().is_empty());
    }

    #[test]
    fn test_expiry() {
        let backend = MemoryCacheBackend::default();
        backend
            .set("a", value(1), Some(Duration::from_millis(30)))
            .unwrap();
        assert_eq!(read(&backend, "a"), Some(1));

        thread::sleep(Duration::from_millis(60));
        assert!(!backend.contains("a").unwrap());
        assert_eq!(read(&backend, "a"), None);
        assert_eq!(backend.stats().expirations(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let backend = MemoryCacheBackend::new(3);
        for i in 0..4 {
            backend.set(&format!("k{}", i), value(i), None).unwrap();
        }
        assert_eq!(backend.len(), 3);
        assert_eq!(read(&backend, "k0"), None);
        assert_eq!(backend.stats().evictions(), 1);
    }

    #[test]
    fn test_set_primitive() {
        let backend = MemoryCacheBackend::default();
        backend.set_add("refs", "a").unwrap();
        backend.set_add("refs", "b").unwrap();
        backend.set_add("refs", "a").unwrap();

        let mut members = backend.set_members("refs").unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        backend.set_remove("refs", "a").unwrap();
        assert_eq!(backend.set_members("refs").unwrap(), vec!["b".to_string()]);

        backend.remove_set("refs").unwrap();
        assert!(backend.set_members("refs").unwrap().is_empty());
    }

    #[test]
    fn test_transaction_times_out_while_held() {
        let backend = Arc::new(MemoryCacheBackend::default());
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let holder = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                backend
                    .use_transaction("bucket", Duration::from_secs(1), &mut || {
                        held_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        };

        held_rx.recv().unwrap();
        let err = backend
            .use_transaction("bucket", Duration::from_millis(20), &mut || Ok(()))
            .unwrap_err();
        assert!(matches!(err, QueryError::LockTimeout(ref key) if key == "bucket"));

        release_tx.send(()).unwrap();
        holder.join().unwrap();

        let mut ran = false;
        backend
            .use_transaction("bucket", Duration::from_millis(20), &mut || {
                ran = true;
                Ok(())
            })
            .unwrap();
        assert!(ran);
    }
}
