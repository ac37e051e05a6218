//! Values returned by plan execution.

use query_cache::CacheableOutput;
use query_core::{QueryError, Result, RowSet, Value};
use query_planner::plan::{ClientLookup, RowContext, RowFn};
use query_planner::Bindings;
use std::fmt;
use std::sync::Arc;

/// Backend rows that have not been projected yet. Every projection builds
/// fresh values, so two consumers never share entity instances.
#[derive(Clone)]
pub struct DeferredRows {
    rows: Arc<RowSet>,
    projector: RowFn,
    bindings: Arc<Bindings>,
    lookups: Arc<Vec<ClientLookup>>,
}

impl DeferredRows {
    pub fn new(rows: RowSet, projector: RowFn, bindings: Bindings, lookups: Vec<ClientLookup>) -> Self {
        Self {
            rows: Arc::new(rows),
            projector,
            bindings: Arc::new(bindings),
            lookups: Arc::new(lookups),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn project(&self) -> Result<Vec<Value>> {
        self.project_at_most(usize::MAX)
    }

    /// Projects at most `limit` rows, in backend order.
    pub fn project_at_most(&self, limit: usize) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(self.len().min(limit));
        'batches: for batch in &self.rows.batches {
            for row in 0..batch.num_rows() {
                if values.len() >= limit {
                    break 'batches;
                }
                let ctx = RowContext {
                    batch,
                    row,
                    bindings: &self.bindings,
                    lookups: &self.lookups,
                };
                values.push((self.projector)(&ctx)?);
            }
        }
        Ok(values)
    }
}

impl fmt::Debug for DeferredRows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredRows")
            .field("rows", &self.len())
            .field("lookups", &self.lookups.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Sequence {
    Deferred(DeferredRows),
    Materialized(Arc<Vec<Value>>),
}

impl Sequence {
    pub fn values(&self) -> Result<Vec<Value>> {
        match self {
            Sequence::Deferred(rows) => rows.project(),
            Sequence::Materialized(values) => Ok(values.as_ref().clone()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Sequence::Deferred(rows) => rows.len(),
            Sequence::Materialized(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one plan invocation.
#[derive(Debug, Clone)]
pub enum QueryOutput {
    /// Rows affected by a command; `-1` when nothing was sent
    Affected(i64),
    Value(Value),
    Sequence(Sequence),
}

impl QueryOutput {
    pub fn affected(&self) -> Option<i64> {
        match self {
            QueryOutput::Affected(n) => Some(*n),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            QueryOutput::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Rows of a sequence, or the single value as a one-element list.
    pub fn values(&self) -> Result<Vec<Value>> {
        match self {
            QueryOutput::Sequence(sequence) => sequence.values(),
            QueryOutput::Value(value) => Ok(vec![value.clone()]),
            QueryOutput::Affected(_) => Err(QueryError::ExecutionError(
                "command output has no rows".into(),
            )),
        }
    }
}

impl CacheableOutput for QueryOutput {
    fn is_deferred(&self) -> bool {
        matches!(self, QueryOutput::Sequence(Sequence::Deferred(_)))
    }

    fn materialize(self) -> Result<Self> {
        match self {
            QueryOutput::Sequence(Sequence::Deferred(rows)) => Ok(QueryOutput::Sequence(
                Sequence::Materialized(Arc::new(rows.project()?)),
            )),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType as ArrowDataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use query_core::EntityRef;

    fn ids(values: Vec<i64>) -> RowSet {
        let schema = Arc::new(Schema::new(vec![Field::new("Id", ArrowDataType::Int64, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap();
        RowSet::new(vec![batch])
    }

    fn as_entities(rows: RowSet) -> DeferredRows {
        let projector: RowFn = Arc::new(|ctx: &RowContext<'_>| {
            let id = ctx
                .batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .map(|a| a.value(ctx.row))
                .unwrap_or_default();
            Ok(Value::Entity(EntityRef::new("Person").with("Id", id)))
        });
        DeferredRows::new(rows, projector, Bindings::new(), Vec::new())
    }

    #[test]
    fn test_each_projection_builds_fresh_entities() {
        let rows = as_entities(ids(vec![1, 2]));
        let first = rows.project().unwrap();
        let second = rows.project().unwrap();
        assert_eq!(first.len(), 2);
        match (&first[0], &second[0]) {
            (Value::Entity(a), Value::Entity(b)) => {
                assert!(!a.ptr_eq(b));
                assert_eq!(a.value("Id"), Some(Value::Int64(1)));
            }
            _ => panic!("Expected entities"),
        }
    }

    #[test]
    fn test_project_at_most() {
        let rows = as_entities(ids(vec![1, 2, 3]));
        assert_eq!(rows.project_at_most(2).unwrap().len(), 2);
        assert_eq!(rows.project_at_most(0).unwrap().len(), 0);
    }

    #[test]
    fn test_materialize_deferred_sequence() {
        let output = QueryOutput::Sequence(Sequence::Deferred(as_entities(ids(vec![5]))));
        assert!(output.is_deferred());
        let ready = output.materialize().unwrap();
        assert!(!ready.is_deferred());
        assert_eq!(ready.values().unwrap().len(), 1);
    }

    #[test]
    fn test_command_output_has_no_rows() {
        let output = QueryOutput::Affected(3);
        assert_eq!(output.affected(), Some(3));
        assert!(output.values().is_err());
        assert!(output.materialize().is_ok());
    }
}
