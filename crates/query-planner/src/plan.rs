//! Compiled plans: reusable, thread-safe descriptions of the backend calls
//! and row materialization a query needs.

use crate::eval::Bindings;
use ahash::AHashMap;
use arrow::record_batch::RecordBatch;
use query_core::backend::ValueConverter;
use query_core::tree::Cardinality;
use query_core::{DataSegment, DataType, EntityRef, Pager, Result, Value};
use std::fmt;
use std::sync::Arc;

/// Materializes one output value from the current row.
pub type RowFn = Arc<dyn Fn(&RowContext<'_>) -> Result<Value> + Send + Sync>;

/// Computes a value from the execution bindings only.
pub type ValueFn = Arc<dyn Fn(&Bindings) -> Result<Value> + Send + Sync>;

/// Client-join lookup: join key to the inner values sharing it.
pub type ClientLookup = AHashMap<Vec<Value>, Vec<Value>>;

pub struct RowContext<'a> {
    pub batch: &'a RecordBatch,
    pub row: usize,
    pub bindings: &'a Bindings,
    /// One lookup per client join, in plan order
    pub lookups: &'a [ClientLookup],
}

/// Normalizes join key parts so that keys read from columns of different
/// integer widths still match.
pub fn join_key(parts: Vec<Value>) -> Vec<Value> {
    parts
        .into_iter()
        .map(|v| match v {
            Value::Int32(i) => Value::Int64(i64::from(i)),
            other => other,
        })
        .collect()
}

/// Binding under which nested projections read correlated value `slot`.
/// The slot prefix keeps it clear of caller arguments.
pub fn correlated_binding(slot: usize) -> String {
    format!("$outer{}", slot)
}

#[derive(Clone)]
pub enum ParamSource {
    /// Read from the execution bindings (slot literals, declared arguments)
    Bound(String),
    Compute(ValueFn),
    /// Distinct values of one outer join key part, bound as a list
    OuterKey(usize),
    /// One correlated value read from the enclosing query's row
    OuterValue(usize),
}

impl fmt::Debug for ParamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamSource::Bound(name) => write!(f, "Bound({})", name),
            ParamSource::Compute(_) => write!(f, "Compute"),
            ParamSource::OuterKey(part) => write!(f, "OuterKey({})", part),
            ParamSource::OuterValue(slot) => write!(f, "OuterValue({})", slot),
        }
    }
}

#[derive(Clone)]
pub struct ParamBinding {
    pub name: String,
    pub source: ParamSource,
    pub db_type: DataType,
    /// Applied with `convert_to` before the value is sent
    pub converter: Option<Arc<dyn ValueConverter>>,
}

impl fmt::Debug for ParamBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamBinding")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("db_type", &self.db_type)
            .field("converter", &self.converter.is_some())
            .finish()
    }
}

/// Translated command text with its parameter bindings in text order.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub text: String,
    pub params: Vec<ParamBinding>,
    /// Segment requested at translation time; replaced by the live pager's
    /// segment when the plan is paged
    pub segment: Option<DataSegment>,
    pub nested: Vec<CommandTemplate>,
}

#[derive(Clone)]
pub struct QueryPlan {
    pub command: CommandTemplate,
    /// Names of the columns read back, by ordinal
    pub columns: Vec<String>,
    pub projector: RowFn,
    pub cardinality: Cardinality,
    pub client_joins: Vec<ClientJoinPlan>,
    pub paged: bool,
}

impl fmt::Debug for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryPlan")
            .field("command", &self.command)
            .field("columns", &self.columns)
            .field("cardinality", &self.cardinality)
            .field("client_joins", &self.client_joins)
            .field("paged", &self.paged)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ClientJoinPlan {
    pub outer_key: Vec<RowFn>,
    pub inner: Box<QueryPlan>,
    pub inner_key: Vec<RowFn>,
    /// Outer-row values by slot, sent as `OuterValue` placeholders or read
    /// by the nested projection. The inner plan runs once per distinct
    /// tuple of the sent ones; none sent means a single batched query.
    pub correlated: Vec<RowFn>,
}

impl fmt::Debug for ClientJoinPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientJoinPlan")
            .field("key_parts", &self.outer_key.len())
            .field("correlated", &self.correlated.len())
            .field("inner", &self.inner)
            .finish()
    }
}

/// Generated key written back onto the entity the command was built from.
#[derive(Clone)]
pub struct KeyWriteBack {
    pub target: ValueFn,
    pub property: String,
}

#[derive(Clone)]
pub struct ScalarPlan {
    pub command: CommandTemplate,
    pub result_type: DataType,
    pub write_back: Option<KeyWriteBack>,
}

impl fmt::Debug for ScalarPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarPlan")
            .field("command", &self.command)
            .field("result_type", &self.result_type)
            .field(
                "write_back",
                &self.write_back.as_ref().map(|w| w.property.as_str()),
            )
            .finish()
    }
}

#[derive(Clone)]
pub enum ColumnSetter {
    /// Same value for every row, computed once per execution
    Constant(ValueFn),
    /// Computed per input item
    PerItem(ValueFn),
}

#[derive(Clone)]
pub struct BatchColumn {
    pub name: String,
    pub db_type: DataType,
    pub setter: ColumnSetter,
}

impl fmt::Debug for BatchColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let setter = match self.setter {
            ColumnSetter::Constant(_) => "constant",
            ColumnSetter::PerItem(_) => "per-item",
        };
        f.debug_struct("BatchColumn")
            .field("name", &self.name)
            .field("db_type", &self.db_type)
            .field("setter", &setter)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub table: String,
    pub command: CommandTemplate,
    pub columns: Vec<BatchColumn>,
    pub items: Vec<EntityRef>,
    /// Parameter the setters see the current item under
    pub item_param: String,
    /// Property receiving generated keys, insert batches only
    pub key_property: Option<String>,
}

#[derive(Clone)]
pub enum PlanEntry {
    /// Answered without touching the backend
    Constant(Value),
    Evaluate(ValueFn),
    NoResult(CommandTemplate),
    Scalar(ScalarPlan),
    Query(QueryPlan),
    Batch(BatchPlan),
}

impl fmt::Debug for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanEntry::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            PlanEntry::Evaluate(_) => write!(f, "Evaluate"),
            PlanEntry::NoResult(c) => f.debug_tuple("NoResult").field(c).finish(),
            PlanEntry::Scalar(s) => f.debug_tuple("Scalar").field(s).finish(),
            PlanEntry::Query(q) => f.debug_tuple("Query").field(q).finish(),
            PlanEntry::Batch(b) => f.debug_tuple("Batch").field(b).finish(),
        }
    }
}

/// The runtime arguments a plan is invoked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Store,
    StorePager,
    StoreCancel,
    StorePagerCancel,
}

impl CallShape {
    pub fn of(is_async: bool, paged: bool) -> Self {
        match (is_async, paged) {
            (false, false) => CallShape::Store,
            (false, true) => CallShape::StorePager,
            (true, false) => CallShape::StoreCancel,
            (true, true) => CallShape::StorePagerCancel,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, CallShape::StoreCancel | CallShape::StorePagerCancel)
    }

    pub fn takes_pager(&self) -> bool {
        matches!(self, CallShape::StorePager | CallShape::StorePagerCancel)
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub entry: PlanEntry,
    pub shape: CallShape,
    pub entity_types: Vec<String>,
    pub pager: Option<Pager>,
}

impl Plan {
    pub fn is_constant(&self) -> bool {
        matches!(self.entry, PlanEntry::Constant(_))
    }

    /// Text of the main command, when the plan issues one.
    pub fn command_text(&self) -> Option<&str> {
        match &self.entry {
            PlanEntry::Constant(_) | PlanEntry::Evaluate(_) => None,
            PlanEntry::NoResult(command) => Some(&command.text),
            PlanEntry::Scalar(scalar) => Some(&scalar.command.text),
            PlanEntry::Query(query) => Some(&query.command.text),
            PlanEntry::Batch(batch) => Some(&batch.command.text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_shapes() {
        assert_eq!(CallShape::of(false, false), CallShape::Store);
        assert_eq!(CallShape::of(true, true), CallShape::StorePagerCancel);
        assert!(CallShape::StorePager.takes_pager());
        assert!(!CallShape::StorePager.is_async());
    }

    #[test]
    fn test_join_key_widens_integers() {
        assert_eq!(
            join_key(vec![Value::Int32(7), Value::from("a")]),
            join_key(vec![Value::Int64(7), Value::from("a")])
        );
    }
}
