//! Per-region cache statistics

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Counter {
    Hit,
    Miss,
    Eviction,
    Expiration,
    Invalidation,
    Sweep,
    Error,
}

const COUNTERS: usize = 7;

/// Counters for one cache region, updated lock-free. The entry gauge is
/// only maintained by backends that know their size.
#[derive(Debug, Default)]
pub struct CacheStats {
    counters: [AtomicU64; COUNTERS],
    entries: AtomicU64,
}

/// Point-in-time copy of a region's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub sweeps: u64,
    pub errors: u64,
    pub entries: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, counter: Counter, n: u64) {
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn record_hit(&self) {
        self.add(Counter::Hit, 1);
    }

    pub fn record_miss(&self) {
        self.add(Counter::Miss, 1);
    }

    pub fn record_eviction(&self) {
        self.add(Counter::Eviction, 1);
    }

    /// An entry was found past its expiry and dropped
    pub fn record_expiration(&self) {
        self.add(Counter::Expiration, 1);
    }

    pub fn record_invalidations(&self, count: u64) {
        self.add(Counter::Invalidation, count);
    }

    pub fn record_sweep(&self) {
        self.add(Counter::Sweep, 1);
    }

    /// A backend failure degraded a call to uncached execution
    pub fn record_error(&self) {
        self.add(Counter::Error, 1);
    }

    pub fn set_entry_count(&self, count: u64) {
        self.entries.store(count, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.get(Counter::Hit)
    }

    pub fn misses(&self) -> u64 {
        self.get(Counter::Miss)
    }

    pub fn evictions(&self) -> u64 {
        self.get(Counter::Eviction)
    }

    pub fn expirations(&self) -> u64 {
        self.get(Counter::Expiration)
    }

    pub fn invalidations(&self) -> u64 {
        self.get(Counter::Invalidation)
    }

    pub fn sweeps(&self) -> u64 {
        self.get(Counter::Sweep)
    }

    pub fn errors(&self) -> u64 {
        self.get(Counter::Error)
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Hits over lookups, 0.0 before the first lookup
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits() + self.misses();
        if lookups == 0 {
            return 0.0;
        }
        self.hits() as f64 / lookups as f64
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            expirations: self.expirations(),
            invalidations: self.invalidations(),
            sweeps: self.sweeps(),
            errors: self.errors(),
            entries: self.entry_count(),
            hit_rate: self.hit_rate(),
        }
    }

    /// Zeroes the counters. The entry gauge is left alone.
    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} hit_rate={:.1}% entries={} evictions={} expirations={} invalidations={} sweeps={} errors={}",
            self.hits,
            self.misses,
            self.hit_rate * 100.0,
            self.entries,
            self.evictions,
            self.expirations,
            self.invalidations,
            self.sweeps,
            self.errors
        )
    }
}
