//! Shared fixtures: a recording in-memory backend and a small SQL-ish
//! translator.

#![allow(dead_code)]

use arrow::array::{Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use parking_lot::Mutex;
use query_core::backend::SelectCommand;
use query_core::tree::{BatchOperation, QueryNode};
use query_core::{
    AsyncBackend, Backend, BatchOutcome, CancellationToken, ColumnMap, Command, DataType,
    EntityMap, Mappings, QueryError, RelationalPlan, Result, RowSet, TranslateResult, Translator,
    Value,
};
use query_cache::CacheConfig;
use query_executor::CachedQueryExecutor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn mappings() -> Mappings {
    Mappings::new()
        .with(EntityMap::new(
            "Person",
            "people",
            vec![
                ColumnMap::new("Id", DataType::Int64).auto_increment(),
                ColumnMap::new("Name", DataType::Utf8),
                ColumnMap::new("Age", DataType::Int32),
            ],
        ))
        .with(EntityMap::new(
            "Order",
            "orders",
            vec![
                ColumnMap::new("Id", DataType::Int64).primary_key(),
                ColumnMap::new("PersonId", DataType::Int64),
            ],
        ))
}

/// Renders relational plans as SQL-like text. List-valued placeholders
/// compare with `IN`.
#[derive(Debug, Default)]
pub struct SqlTranslator;

fn render(node: &QueryNode, params: &mut Vec<String>) -> String {
    match node {
        QueryNode::Column { alias, name, .. } => format!("{}.{}", alias, name),
        QueryNode::NamedValue { name, .. } => {
            params.push(name.clone());
            format!("@{}", name)
        }
        QueryNode::Binary {
            op, left, right, ..
        } => {
            let list = matches!(
                right.as_ref(),
                QueryNode::NamedValue { db_type: DataType::List(_), .. }
            );
            let left = render(left, params);
            let right = render(right, params);
            if list {
                format!("({} IN {})", left, right)
            } else {
                format!("({} {} {})", left, op.symbol(), right)
            }
        }
        QueryNode::Unary { op, operand, .. } => format!("{:?}({})", op, render(operand, params)),
        QueryNode::MethodCall {
            target, method, args, ..
        } => {
            let mut rendered: Vec<String> = target.iter().map(|t| render(t, params)).collect();
            rendered.extend(args.iter().map(|a| render(a, params)));
            format!("{}({})", method.name().to_uppercase(), rendered.join(", "))
        }
        QueryNode::Constant { value, .. } => {
            let mut out = String::new();
            value.encode(&mut out);
            out
        }
        other => other.kind_name().to_string(),
    }
}

fn render_select(select: &SelectCommand, params: &mut Vec<String>) -> String {
    let head = match &select.aggregate {
        Some((func, argument)) => {
            let argument = argument
                .as_ref()
                .map(|a| render(a, params))
                .unwrap_or_else(|| "*".to_string());
            format!("{:?}({})", func, argument).to_uppercase()
        }
        None => {
            let columns: Vec<String> = select.columns.iter().map(|c| render(c, params)).collect();
            columns.join(", ")
        }
    };
    let distinct = if select.distinct { "DISTINCT " } else { "" };
    let mut text = format!(
        "SELECT {}{} FROM {} AS {}",
        distinct, head, select.table, select.alias
    );
    for join in &select.joins {
        text.push_str(&format!(
            " {:?} JOIN {} AS {} ON {}",
            join.kind,
            join.table,
            join.alias,
            render(&join.on, params)
        ));
    }
    if let Some(predicate) = &select.predicate {
        text.push_str(&format!(" WHERE {}", render(predicate, params)));
    }
    if !select.order_by.is_empty() {
        let order: Vec<String> = select
            .order_by
            .iter()
            .map(|(expr, asc)| format!("{} {}", render(expr, params), if *asc { "ASC" } else { "DESC" }))
            .collect();
        text.push_str(&format!(" ORDER BY {}", order.join(", ")));
    }
    if let Some(take) = select.take {
        text.push_str(&format!(" LIMIT {}", take));
    }
    text
}

impl Translator for SqlTranslator {
    fn translate(&self, plan: &RelationalPlan) -> Result<TranslateResult> {
        let mut params = Vec::new();
        let text = match plan {
            RelationalPlan::Select(select) => render_select(select, &mut params),
            RelationalPlan::Insert {
                table,
                values,
                returning,
            } => {
                let columns: Vec<&str> = values.iter().map(|(c, _)| c.as_str()).collect();
                let rendered: Vec<String> = values.iter().map(|(_, v)| render(v, &mut params)).collect();
                let mut text = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    columns.join(", "),
                    rendered.join(", ")
                );
                if let Some(column) = returning {
                    text.push_str(&format!(" RETURNING {}", column));
                }
                text
            }
            RelationalPlan::Update {
                table,
                alias,
                assignments,
                predicate,
            } => {
                let sets: Vec<String> = assignments
                    .iter()
                    .map(|(c, v)| format!("{} = {}", c, render(v, &mut params)))
                    .collect();
                let mut text = format!("UPDATE {} AS {} SET {}", table, alias, sets.join(", "));
                if let Some(predicate) = predicate {
                    text.push_str(&format!(" WHERE {}", render(predicate, &mut params)));
                }
                text
            }
            RelationalPlan::Delete {
                table,
                alias,
                predicate,
            } => {
                let mut text = format!("DELETE FROM {} AS {}", table, alias);
                if let Some(predicate) = predicate {
                    text.push_str(&format!(" WHERE {}", render(predicate, &mut params)));
                }
                text
            }
            RelationalPlan::Batch {
                table,
                operation,
                columns,
                ..
            } => {
                params.extend(columns.iter().cloned());
                let verb = match operation {
                    BatchOperation::Insert => "INSERT",
                    BatchOperation::Update => "UPDATE",
                    BatchOperation::Delete => "DELETE",
                };
                format!("{} BATCH {} ({})", verb, table, columns.join(", "))
            }
        };
        Ok(TranslateResult {
            command_text: text,
            data_segment: None,
            parameters: params,
            nested_results: Vec::new(),
        })
    }
}

/// In-memory tables that record every command they receive. Predicates are
/// not evaluated; selects return the whole table, segmented on request.
pub struct RecordingBackend {
    tables: HashMap<String, RecordBatch>,
    commands: Mutex<Vec<Command>>,
    next_key: AtomicI64,
    affected: i64,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            commands: Mutex::new(Vec::new()),
            next_key: AtomicI64::new(100),
            affected: 1,
        }
    }

    pub fn with_people(mut self, count: usize) -> Self {
        let ids: Vec<i64> = (1..=count as i64).collect();
        let names: Vec<String> = ids.iter().map(|i| format!("person-{}", i)).collect();
        let ages: Vec<i32> = ids.iter().map(|i| 20 + (*i as i32 % 40)).collect();
        let schema = Arc::new(Schema::new(vec![
            Field::new("Id", ArrowDataType::Int64, false),
            Field::new("Name", ArrowDataType::Utf8, false),
            Field::new("Age", ArrowDataType::Int32, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names)),
                Arc::new(Int32Array::from(ages)),
            ],
        )
        .expect("people batch");
        self.tables.insert("people".to_string(), batch);
        self
    }

    pub fn with_orders(mut self, count: usize) -> Self {
        let ids: Vec<i64> = (1..=count as i64).collect();
        let owners: Vec<i64> = ids.iter().map(|i| 1 + i % 3).collect();
        let schema = Arc::new(Schema::new(vec![
            Field::new("Id", ArrowDataType::Int64, false),
            Field::new("PersonId", ArrowDataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(ids)), Arc::new(Int64Array::from(owners))],
        )
        .expect("orders batch");
        self.tables.insert("orders".to_string(), batch);
        self
    }

    pub fn with_affected(mut self, affected: i64) -> Self {
        self.affected = affected;
        self
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    /// Number of enumerable commands received.
    pub fn queries(&self) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.text.starts_with("SELECT"))
            .count()
    }

    fn record(&self, command: &Command) {
        self.commands.lock().push(command.clone());
    }

    fn table_of(text: &str) -> Option<&str> {
        let rest = text.split(" FROM ").nth(1)?;
        rest.split_whitespace().next()
    }

    fn select(&self, command: &Command) -> Result<RowSet> {
        let table = Self::table_of(&command.text)
            .and_then(|t| self.tables.get(t))
            .ok_or_else(|| QueryError::Backend(format!("unknown table in '{}'", command.text)))?;

        let list = command
            .text
            .trim_start_matches("SELECT ")
            .trim_start_matches("DISTINCT ")
            .split(" FROM ")
            .next()
            .unwrap_or_default();
        let schema = table.schema();
        let indices = list
            .split(", ")
            .map(|column| {
                let name = column.rsplit('.').next().unwrap_or(column);
                schema
                    .index_of(name)
                    .map_err(|_| QueryError::Backend(format!("unknown column {}", column)))
            })
            .collect::<Result<Vec<_>>>()?;
        let projected = table.project(&indices)?;

        let total = projected.num_rows() as u64;
        let rows = match command.segment {
            Some(segment) => {
                let offset = (segment.offset as usize).min(projected.num_rows());
                let length = (segment.limit as usize).min(projected.num_rows() - offset);
                projected.slice(offset, length)
            }
            None => projected,
        };
        let rows = RowSet::new(vec![rows]);
        Ok(if command.count_total {
            rows.with_total(total)
        } else {
            rows
        })
    }
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for RecordingBackend {
    fn execute_no_result(&self, command: &Command) -> Result<i64> {
        self.record(command);
        Ok(self.affected)
    }

    fn execute_scalar(&self, command: &Command) -> Result<Value> {
        self.record(command);
        if command.text.starts_with("INSERT") {
            return Ok(Value::Int64(self.next_key.fetch_add(1, Ordering::SeqCst)));
        }
        let rows = Self::table_of(&command.text)
            .and_then(|t| self.tables.get(t))
            .map_or(0, |t| t.num_rows());
        Ok(Value::Int64(rows as i64))
    }

    fn execute_enumerable(&self, command: &Command) -> Result<RowSet> {
        self.record(command);
        self.select(command)
    }

    fn execute_batch(&self, _table: &str, command: &Command, rows: &RecordBatch) -> Result<BatchOutcome> {
        self.record(command);
        let generated_keys = if command.text.starts_with("INSERT") {
            (0..rows.num_rows())
                .map(|_| Value::Int64(self.next_key.fetch_add(1, Ordering::SeqCst)))
                .collect()
        } else {
            Vec::new()
        };
        Ok(BatchOutcome {
            affected: rows.num_rows() as i64,
            generated_keys,
        })
    }
}

#[async_trait]
impl AsyncBackend for RecordingBackend {
    async fn execute_no_result(&self, command: &Command, cancel: &CancellationToken) -> Result<i64> {
        cancel.check()?;
        Backend::execute_no_result(self, command)
    }

    async fn execute_scalar(&self, command: &Command, cancel: &CancellationToken) -> Result<Value> {
        cancel.check()?;
        Backend::execute_scalar(self, command)
    }

    async fn execute_enumerable(&self, command: &Command, cancel: &CancellationToken) -> Result<RowSet> {
        cancel.check()?;
        Backend::execute_enumerable(self, command)
    }

    async fn execute_batch(
        &self,
        table: &str,
        command: &Command,
        rows: &RecordBatch,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        cancel.check()?;
        Backend::execute_batch(self, table, command, rows)
    }
}

/// Executor over `backend` with both caches enabled.
pub fn cached_executor(backend: Arc<RecordingBackend>) -> CachedQueryExecutor {
    let config = CacheConfig::default()
        .with_parsing(true, Duration::from_secs(600))
        .with_execution(true, Duration::from_secs(300));
    CachedQueryExecutor::new(Arc::new(mappings()), Arc::new(SqlTranslator), config)
        .with_backend(backend.clone())
        .with_async_backend(backend)
}
