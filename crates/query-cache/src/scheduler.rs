//! Periodic reference sweeps.
//!
//! Each barrier (one per tenant) arms at most one sweep. The first run and
//! the period are drawn at random from the configured ranges so that many
//! processes sharing a backend do not sweep in lockstep.

use crate::config::SweepConfig;
use crate::reference::ReferenceIndex;
use crate::stats::CacheStats;
use dashmap::DashSet;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

pub type PeriodicTask = Arc<dyn Fn() + Send + Sync>;

pub trait TaskScheduler: Send + Sync {
    /// Runs `task` after `initial_delay`, then every `period`. Returns
    /// false when the task could not be scheduled.
    fn start_periodic(
        &self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> bool;
}

/// Schedules on the ambient tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct TokioScheduler;

impl TaskScheduler for TokioScheduler {
    fn start_periodic(
        &self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        task: PeriodicTask,
    ) -> bool {
        let Ok(handle) = Handle::try_current() else {
            warn!("No tokio runtime to schedule '{}' on", name);
            return false;
        };

        let name = name.to_string();
        handle.spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut timer = tokio::time::interval(period.max(Duration::from_millis(1)));
            loop {
                timer.tick().await;
                debug!("Running periodic task '{}'", name);
                // Sweeps take index locks; keep them off the async workers
                let run = task.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || run()).await {
                    warn!("Periodic task '{}' failed: {}", name, e);
                }
            }
        });
        true
    }
}

fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

pub struct SweepScheduler {
    scheduler: Arc<dyn TaskScheduler>,
    config: SweepConfig,
    barriers: DashSet<String>,
}

impl SweepScheduler {
    pub fn new(scheduler: Arc<dyn TaskScheduler>, config: SweepConfig) -> Self {
        Self {
            scheduler,
            config,
            barriers: DashSet::new(),
        }
    }

    pub fn is_started(&self, tenant: &str) -> bool {
        self.barriers.contains(tenant)
    }

    /// Arms the sweep of `tenant`'s reference buckets unless it already is.
    /// Returns whether this call armed it.
    pub fn start_periodic_sweep(
        &self,
        tenant: &str,
        references: Arc<ReferenceIndex>,
        stats: Arc<CacheStats>,
    ) -> bool {
        if !self.barriers.insert(tenant.to_string()) {
            return false;
        }

        let delay = random_between(self.config.min_delay, self.config.max_delay);
        let period = random_between(self.config.min_period, self.config.max_period);
        let sweep_tenant = tenant.to_string();
        let task: PeriodicTask = Arc::new(move || {
            let report = references.sweep(&sweep_tenant);
            stats.record_sweep();
            if report.pruned > 0 || report.failures > 0 {
                info!(
                    "Swept references of '{}': {} pruned, {} buckets removed, {} failures",
                    sweep_tenant, report.pruned, report.removed_buckets, report.failures
                );
            }
        });

        let name = format!("reference-sweep:{}", tenant);
        if self.scheduler.start_periodic(&name, delay, period, task) {
            debug!(
                "Armed sweep for '{}' in {:?}, every {:?}",
                tenant, delay, period
            );
            true
        } else {
            // Allow a later call to try again
            self.barriers.remove(tenant);
            false
        }
    }
}

impl std::fmt::Debug for SweepScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepScheduler")
            .field("config", &self.config)
            .field("barriers", &self.barriers.len())
            .finish()
    }
}
