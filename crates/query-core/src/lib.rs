//! Core data model of the query compiler: values and types, entity
//! instances, the query tree, pagination, mappings and the collaborator
//! interfaces the compiler and caches are bound to.

pub mod backend;
pub mod cancel;
pub mod entity;
pub mod error;
pub mod pager;
pub mod schema;
pub mod tree;
pub mod types;

pub use backend::{
    AsyncBackend, Backend, BatchOutcome, Command, ConverterRegistry, Converters,
    IdentityGenerator, RelationalPlan, RowSet, TranslateResult, Translator, ValueConverter,
};
pub use cancel::CancellationToken;
pub use entity::{EntityRef, EntityState};
pub use error::{QueryError, Result};
pub use pager::{DataSegment, Pager, PagerBound, PagerState};
pub use schema::{ColumnMap, EntityMap, MappingRegistry, Mappings, PersistenceEnvironment};
pub use tree::{NodeRef, QueryNode};
pub use types::*;
