//! Plan and result caching for compiled queries
//!
//! Two regions share one [`CacheBackend`]:
//!
//! - **Plan cache**: compiled plans keyed by the canonical query shape,
//!   rebound to the caller's pager on a hit
//! - **Result cache**: materialized outputs keyed by shape, literal values,
//!   arguments and tenant, with the page total stored alongside
//!
//! Result keys are indexed per entity type so mutations can drop exactly the
//! results they invalidate. A periodic, jittered sweep prunes index entries
//! whose results expired on their own.

pub mod backend;
pub mod config;
pub mod invalidation;
pub mod key;
pub mod plan_cache;
pub mod reference;
pub mod region;
pub mod result_cache;
pub mod scheduler;
pub mod stats;

pub use backend::{CacheBackend, CacheValue, MemoryCacheBackend, TransactionalBackend};
pub use config::{CacheConfig, RegionConfig, SweepConfig};
pub use invalidation::{InvalidationEvent, Invalidator};
pub use key::{CacheKey, KeyKind};
pub use plan_cache::PlanCache;
pub use reference::{ReferenceIndex, SweepReport};
pub use region::CacheRegion;
pub use result_cache::{CacheableOutput, ResultCache};
pub use scheduler::{SweepScheduler, TaskScheduler, TokioScheduler};
pub use stats::{CacheStats, StatsSnapshot};
