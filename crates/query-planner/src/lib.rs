pub mod analyzer;
pub mod canonical;
pub mod eval;
pub mod materialize;
pub mod parameterize;
pub mod plan;
pub mod planner;
pub mod rebind;

pub use analyzer::{analyze, Cacheability};
pub use canonical::{canonicalize, CanonicalForm, SLOT_PREFIX};
pub use eval::Bindings;
pub use plan::{CallShape, Plan, PlanEntry};
pub use planner::{BuildOptions, CompileContext, PlanBuilder};
