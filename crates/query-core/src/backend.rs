//! Collaborator interfaces: storage backend, dialect translator, value
//! converters and identity generation.

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::pager::DataSegment;
use crate::tree::{AggregateFunction, BatchOperation, JoinKind, NodeRef};
use crate::types::{DataType, Value};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A bound command ready to be sent to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub text: String,
    /// Positional parameters, in command-text order
    pub params: Vec<(String, Value)>,
    pub segment: Option<DataSegment>,
    /// Ask the backend to report the unbounded row count alongside the page
    pub count_total: bool,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
            segment: None,
            count_total: false,
        }
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Rows returned by an enumerable command.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub batches: Vec<RecordBatch>,
    /// Unbounded row count when the command was segmented with `count_total`
    pub total: Option<u64>,
}

impl RowSet {
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self {
            batches,
            total: None,
        }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub affected: i64,
    /// Store-generated keys, one per inserted row in row order
    pub generated_keys: Vec<Value>,
}

pub trait Backend: Send + Sync {
    fn execute_no_result(&self, command: &Command) -> Result<i64>;

    fn execute_scalar(&self, command: &Command) -> Result<Value>;

    fn execute_enumerable(&self, command: &Command) -> Result<RowSet>;

    /// Runs `command` once per row of `rows`, binding parameters by column name.
    fn execute_batch(&self, table: &str, command: &Command, rows: &RecordBatch) -> Result<BatchOutcome>;
}

#[async_trait]
pub trait AsyncBackend: Send + Sync {
    async fn execute_no_result(&self, command: &Command, cancel: &CancellationToken) -> Result<i64>;

    async fn execute_scalar(&self, command: &Command, cancel: &CancellationToken) -> Result<Value>;

    async fn execute_enumerable(&self, command: &Command, cancel: &CancellationToken) -> Result<RowSet>;

    async fn execute_batch(
        &self,
        table: &str,
        command: &Command,
        rows: &RecordBatch,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome>;
}

#[derive(Debug, Clone)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub table: String,
    pub alias: String,
    pub on: NodeRef,
}

/// Relational select handed to the translator. Expressions only contain
/// columns, named values, operators and scalar method calls.
#[derive(Debug, Clone)]
pub struct SelectCommand {
    pub table: String,
    pub alias: String,
    pub joins: Vec<JoinClause>,
    /// Output columns, read back by ordinal
    pub columns: Vec<NodeRef>,
    pub predicate: Option<NodeRef>,
    pub order_by: Vec<(NodeRef, bool)>,
    pub aggregate: Option<(AggregateFunction, Option<NodeRef>)>,
    pub distinct: bool,
    /// Row cap implied by the select's cardinality (`First` = 1, `Single` = 2)
    pub take: Option<u64>,
    pub segment: Option<DataSegment>,
}

#[derive(Debug, Clone)]
pub enum RelationalPlan {
    Select(SelectCommand),
    Insert {
        table: String,
        values: Vec<(String, NodeRef)>,
        /// Column whose generated value is returned as a scalar
        returning: Option<String>,
    },
    Update {
        table: String,
        alias: String,
        assignments: Vec<(String, NodeRef)>,
        predicate: Option<NodeRef>,
    },
    Delete {
        table: String,
        alias: String,
        predicate: Option<NodeRef>,
    },
    /// One command executed per parameter row; parameters are named after `columns`
    Batch {
        table: String,
        operation: BatchOperation,
        columns: Vec<String>,
        key_columns: Vec<String>,
        returning: Option<String>,
    },
}

impl RelationalPlan {
    pub fn table(&self) -> &str {
        match self {
            RelationalPlan::Select(select) => &select.table,
            RelationalPlan::Insert { table, .. }
            | RelationalPlan::Update { table, .. }
            | RelationalPlan::Delete { table, .. }
            | RelationalPlan::Batch { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslateResult {
    pub command_text: String,
    pub data_segment: Option<DataSegment>,
    /// Names of the placeholders referenced by the command text, in order
    pub parameters: Vec<String>,
    /// Follow-up statements split out by the dialect
    pub nested_results: Vec<TranslateResult>,
}

/// Dialect-specific text generator.
pub trait Translator: Send + Sync {
    fn translate(&self, plan: &RelationalPlan) -> Result<TranslateResult>;
}

pub trait ValueConverter: Send + Sync {
    /// Store value to property value.
    fn convert_from(&self, raw: Value, db_type: &DataType) -> Result<Value>;

    /// Property value to store value.
    fn convert_to(&self, value: Value, db_type: &DataType) -> Result<Value>;
}

pub trait ConverterRegistry: Send + Sync {
    fn get_converter(&self, data_type: &DataType) -> Option<Arc<dyn ValueConverter>>;
}

/// Converters registered by property type.
#[derive(Default)]
pub struct Converters {
    converters: RwLock<HashMap<DataType, Arc<dyn ValueConverter>>>,
}

impl Converters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, data_type: DataType, converter: Arc<dyn ValueConverter>) {
        self.converters.write().insert(data_type, converter);
    }

    pub fn with(self, data_type: DataType, converter: Arc<dyn ValueConverter>) -> Self {
        self.register(data_type, converter);
        self
    }
}

impl ConverterRegistry for Converters {
    fn get_converter(&self, data_type: &DataType) -> Option<Arc<dyn ValueConverter>> {
        self.converters.read().get(data_type.non_null()).cloned()
    }
}

impl std::fmt::Debug for Converters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Converters")
            .field("types", &self.converters.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Store-side key generation for non-string identity columns.
pub trait IdentityGenerator: Send + Sync {
    fn generate(&self, table: &str, column: &str) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BoolAsInt;

    impl ValueConverter for BoolAsInt {
        fn convert_from(&self, raw: Value, _db_type: &DataType) -> Result<Value> {
            Ok(match raw {
                Value::Int32(v) => Value::Boolean(v != 0),
                other => other,
            })
        }

        fn convert_to(&self, value: Value, _db_type: &DataType) -> Result<Value> {
            Ok(match value {
                Value::Boolean(b) => Value::Int32(i32::from(b)),
                other => other,
            })
        }
    }

    #[test]
    fn test_converter_lookup_ignores_nullability() {
        let converters = Converters::new().with(DataType::Boolean, Arc::new(BoolAsInt));
        let converter = converters
            .get_converter(&DataType::Boolean.nullable())
            .unwrap();
        assert_eq!(
            converter.convert_from(Value::Int32(1), &DataType::Int32).unwrap(),
            Value::Boolean(true)
        );
        assert!(converters.get_converter(&DataType::Utf8).is_none());
    }

    #[test]
    fn test_command_param_lookup() {
        let mut command = Command::new("SELECT 1");
        command.params.push(("p0".into(), Value::Int32(30)));
        assert_eq!(command.param("p0"), Some(&Value::Int32(30)));
        assert_eq!(command.param("p1"), None);
    }
}
