pub mod cached_executor;
pub mod executor;
pub mod options;
pub mod output;

pub use cached_executor::CachedQueryExecutor;
pub use executor::QueryExecutor;
pub use options::{CacheOptions, CachePolicy, QueryRequest};
pub use output::{DeferredRows, QueryOutput, Sequence};
