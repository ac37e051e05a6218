//! Plan execution against a storage backend.
//!
//! Plans are dispatched on their call shape. Store shapes run through the
//! blocking [`Backend`]; the cancel shapes run through [`AsyncBackend`] and
//! check the cancellation token before every backend call.

use crate::output::{DeferredRows, QueryOutput, Sequence};
use ahash::{AHashMap, AHashSet};
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::future::BoxFuture;
use query_core::tree::Cardinality;
use query_core::{
    values_to_array, AsyncBackend, Backend, CancellationToken, Command, Pager, QueryError, Result,
    RowSet, Value,
};
use query_planner::plan::{
    correlated_binding, join_key, BatchPlan, CallShape, ClientJoinPlan, ClientLookup,
    ColumnSetter, CommandTemplate, ParamSource, PlanEntry, QueryPlan, RowContext, ScalarPlan,
};
use query_planner::{Bindings, Plan};
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outer rows of a client join that share their correlated values.
#[derive(Debug, Default)]
struct OuterRows {
    /// Correlated values by slot
    values: Vec<Value>,
    /// Distinct values of every key part, in first-seen order
    keys: Vec<Vec<Value>>,
}

impl OuterRows {
    /// Execution bindings plus the correlated values nested projections read.
    fn scoped<'b>(&self, bindings: &'b Bindings) -> Cow<'b, Bindings> {
        if self.values.is_empty() {
            return Cow::Borrowed(bindings);
        }
        let mut scoped = bindings.clone();
        for (slot, value) in self.values.iter().enumerate() {
            scoped.insert(correlated_binding(slot), value.clone());
        }
        Cow::Owned(scoped)
    }
}

/// One inner query of a client join and the outer groups it serves.
struct InnerBatch {
    query: OuterRows,
    seen: Vec<AHashSet<Value>>,
    groups: Vec<OuterRows>,
}

/// Rows of one query together with the lookups of its client joins.
struct Fetched {
    rows: RowSet,
    lookups: Vec<ClientLookup>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueryExecutor;

impl QueryExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Runs a `Store` or `StorePager` plan.
    pub fn execute(&self, plan: &Plan, backend: &dyn Backend, bindings: &Bindings) -> Result<QueryOutput> {
        if plan.shape.is_async() {
            return Err(QueryError::ExecutionError(format!(
                "{:?} plan invoked synchronously",
                plan.shape
            )));
        }
        let pager = live_pager(plan)?;

        match &plan.entry {
            PlanEntry::Constant(value) => Ok(constant_output(value)),
            PlanEntry::Evaluate(compute) => Ok(QueryOutput::Value(compute(bindings)?)),
            PlanEntry::NoResult(template) => {
                let mut affected = backend.execute_no_result(&bind_command(template, bindings, None, None)?)?;
                for nested in &template.nested {
                    affected += backend.execute_no_result(&bind_command(nested, bindings, None, None)?)?;
                }
                Ok(QueryOutput::Affected(affected))
            }
            PlanEntry::Scalar(scalar) => {
                let raw = backend.execute_scalar(&bind_command(&scalar.command, bindings, None, None)?)?;
                finish_scalar(scalar, raw, bindings)
            }
            PlanEntry::Query(query) => {
                let fetched = self.fetch(query, backend, bindings, pager, None)?;
                finish_query(query, fetched, bindings, pager)
            }
            PlanEntry::Batch(batch) => {
                let rows = batch_rows(batch, bindings)?;
                let command = bind_command(&batch.command, bindings, None, None)?;
                let outcome = backend.execute_batch(&batch.table, &command, &rows)?;
                write_back_keys(batch, outcome.generated_keys);
                Ok(QueryOutput::Affected(outcome.affected))
            }
        }
    }

    /// Runs a `StoreCancel` or `StorePagerCancel` plan.
    pub async fn execute_async(
        &self,
        plan: &Plan,
        backend: &dyn AsyncBackend,
        bindings: &Bindings,
        cancel: &CancellationToken,
    ) -> Result<QueryOutput> {
        if !plan.shape.is_async() {
            return Err(QueryError::ExecutionError(format!(
                "{:?} plan invoked asynchronously",
                plan.shape
            )));
        }
        let pager = live_pager(plan)?;

        match &plan.entry {
            PlanEntry::Constant(value) => Ok(constant_output(value)),
            PlanEntry::Evaluate(compute) => Ok(QueryOutput::Value(compute(bindings)?)),
            PlanEntry::NoResult(template) => {
                cancel.check()?;
                let mut affected = backend
                    .execute_no_result(&bind_command(template, bindings, None, None)?, cancel)
                    .await?;
                for nested in &template.nested {
                    cancel.check()?;
                    affected += backend
                        .execute_no_result(&bind_command(nested, bindings, None, None)?, cancel)
                        .await?;
                }
                Ok(QueryOutput::Affected(affected))
            }
            PlanEntry::Scalar(scalar) => {
                cancel.check()?;
                let command = bind_command(&scalar.command, bindings, None, None)?;
                let raw = backend.execute_scalar(&command, cancel).await?;
                finish_scalar(scalar, raw, bindings)
            }
            PlanEntry::Query(query) => {
                let fetched = self
                    .fetch_async(query, backend, bindings, pager, None, cancel)
                    .await?;
                finish_query(query, fetched, bindings, pager)
            }
            PlanEntry::Batch(batch) => {
                let rows = batch_rows(batch, bindings)?;
                let command = bind_command(&batch.command, bindings, None, None)?;
                cancel.check()?;
                let outcome = backend
                    .execute_batch(&batch.table, &command, &rows, cancel)
                    .await?;
                write_back_keys(batch, outcome.generated_keys);
                Ok(QueryOutput::Affected(outcome.affected))
            }
        }
    }

    fn fetch(
        &self,
        query: &QueryPlan,
        backend: &dyn Backend,
        bindings: &Bindings,
        pager: Option<&Pager>,
        outer: Option<&OuterRows>,
    ) -> Result<Fetched> {
        let command = bind_command(&query.command, bindings, outer, paged(query, pager))?;
        let rows = backend.execute_enumerable(&command)?;

        let mut lookups = Vec::with_capacity(query.client_joins.len());
        for join in &query.client_joins {
            let mut lookup = ClientLookup::default();
            for batch in inner_batches(join, outer_groups(join, &rows, bindings)?) {
                let scoped = batch.query.scoped(bindings);
                let inner = self.fetch(&join.inner, backend, &scoped, None, Some(&batch.query))?;
                for group in &batch.groups {
                    extend_lookup(&mut lookup, join, &inner, &group.scoped(bindings), &group.values)?;
                }
            }
            lookups.push(lookup);
        }
        Ok(Fetched { rows, lookups })
    }

    fn fetch_async<'a>(
        &'a self,
        query: &'a QueryPlan,
        backend: &'a dyn AsyncBackend,
        bindings: &'a Bindings,
        pager: Option<&'a Pager>,
        outer: Option<&'a OuterRows>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Fetched>> {
        Box::pin(async move {
            let command = bind_command(&query.command, bindings, outer, paged(query, pager))?;
            cancel.check()?;
            let rows = backend.execute_enumerable(&command, cancel).await?;

            let mut lookups = Vec::with_capacity(query.client_joins.len());
            for join in &query.client_joins {
                let mut lookup = ClientLookup::default();
                for batch in inner_batches(join, outer_groups(join, &rows, bindings)?) {
                    let scoped = batch.query.scoped(bindings);
                    let inner = self
                        .fetch_async(&join.inner, backend, &scoped, None, Some(&batch.query), cancel)
                        .await?;
                    for group in &batch.groups {
                        extend_lookup(&mut lookup, join, &inner, &group.scoped(bindings), &group.values)?;
                    }
                }
                lookups.push(lookup);
            }
            Ok(Fetched { rows, lookups })
        })
    }
}

fn live_pager(plan: &Plan) -> Result<Option<&Pager>> {
    match plan.shape {
        CallShape::Store | CallShape::StoreCancel => Ok(None),
        CallShape::StorePager | CallShape::StorePagerCancel => plan
            .pager
            .as_ref()
            .map(Some)
            .ok_or_else(|| QueryError::ExecutionError("paged plan invoked without a pager".into())),
    }
}

fn paged<'a>(query: &QueryPlan, pager: Option<&'a Pager>) -> Option<&'a Pager> {
    if query.paged {
        pager
    } else {
        None
    }
}

fn constant_output(value: &Value) -> QueryOutput {
    match value {
        Value::Int64(affected) => QueryOutput::Affected(*affected),
        other => QueryOutput::Value(other.clone()),
    }
}

/// Binds a command template for one execution. A live pager replaces the
/// translated segment and asks the backend for the unbounded total.
fn bind_command(
    template: &CommandTemplate,
    bindings: &Bindings,
    outer: Option<&OuterRows>,
    pager: Option<&Pager>,
) -> Result<Command> {
    let mut command = Command::new(template.text.clone());
    for param in &template.params {
        let value = match &param.source {
            ParamSource::Bound(name) => bindings
                .get(name)
                .cloned()
                .ok_or_else(|| QueryError::MissingArgument(name.clone()))?,
            ParamSource::Compute(compute) => compute(bindings)?,
            ParamSource::OuterKey(part) => Value::List(
                outer
                    .and_then(|o| o.keys.get(*part))
                    .cloned()
                    .unwrap_or_default(),
            ),
            ParamSource::OuterValue(slot) => outer
                .and_then(|o| o.values.get(*slot))
                .cloned()
                .ok_or_else(|| {
                    QueryError::ExecutionError(format!(
                        "correlated value {} for '{}' is not bound",
                        slot, param.name
                    ))
                })?,
        };
        let value = match &param.converter {
            Some(converter) if !value.is_null() => converter.convert_to(value, &param.db_type)?,
            _ => value,
        };
        command.params.push((param.name.clone(), value));
    }

    match pager {
        Some(pager) => {
            command.segment = Some(pager.segment());
            command.count_total = true;
        }
        None => command.segment = template.segment,
    }
    Ok(command)
}

fn for_each_row(
    rows: &RowSet,
    bindings: &Bindings,
    lookups: &[ClientLookup],
    mut f: impl FnMut(&RowContext<'_>) -> Result<()>,
) -> Result<()> {
    for batch in &rows.batches {
        for row in 0..batch.num_rows() {
            f(&RowContext {
                batch,
                row,
                bindings,
                lookups,
            })?;
        }
    }
    Ok(())
}

/// Outer rows of a client join grouped by their correlated values, in
/// first-seen order. Without correlated values every row lands in one group.
fn outer_groups(join: &ClientJoinPlan, rows: &RowSet, bindings: &Bindings) -> Result<Vec<OuterRows>> {
    let parts = join.outer_key.len();
    let mut groups: Vec<OuterRows> = Vec::new();
    let mut seen: Vec<Vec<AHashSet<Value>>> = Vec::new();
    let mut index: AHashMap<Vec<Value>, usize> = AHashMap::new();

    for_each_row(rows, bindings, &[], |ctx| {
        let values = join
            .correlated
            .iter()
            .map(|f| f(ctx))
            .collect::<Result<Vec<_>>>()?;
        let group = match index.get(&values) {
            Some(&group) => group,
            None => {
                index.insert(values.clone(), groups.len());
                groups.push(OuterRows {
                    values,
                    keys: vec![Vec::new(); parts],
                });
                seen.push(vec![AHashSet::new(); parts]);
                groups.len() - 1
            }
        };
        for (part, key) in join.outer_key.iter().enumerate() {
            let value = key(ctx)?;
            if !value.is_null() && seen[group][part].insert(value.clone()) {
                groups[group].keys[part].push(value);
            }
        }
        Ok(())
    })?;
    Ok(groups)
}

/// Merges groups that agree on every correlated value the inner command
/// sends, so values only read by the nested projection cost no extra query.
/// Groups with an empty key part need no query at all.
fn inner_batches(join: &ClientJoinPlan, groups: Vec<OuterRows>) -> Vec<InnerBatch> {
    let mut sent: Vec<usize> = join
        .inner
        .command
        .params
        .iter()
        .filter_map(|p| match p.source {
            ParamSource::OuterValue(slot) => Some(slot),
            _ => None,
        })
        .collect();
    sent.sort_unstable();
    sent.dedup();
    // Nested joins may read any correlated value while fetching
    let shared = join.inner.client_joins.is_empty();

    let mut batches: Vec<InnerBatch> = Vec::new();
    let mut index: AHashMap<Vec<Value>, usize> = AHashMap::new();
    for group in groups {
        if group.keys.iter().any(Vec::is_empty) {
            continue;
        }
        let signature: Vec<Value> = if shared {
            sent.iter()
                .map(|&slot| group.values.get(slot).cloned().unwrap_or(Value::Null))
                .collect()
        } else {
            group.values.clone()
        };
        let at = match index.get(&signature) {
            Some(&at) => at,
            None => {
                index.insert(signature, batches.len());
                batches.push(InnerBatch {
                    query: OuterRows {
                        values: group.values.clone(),
                        keys: vec![Vec::new(); group.keys.len()],
                    },
                    seen: vec![AHashSet::new(); group.keys.len()],
                    groups: Vec::new(),
                });
                batches.len() - 1
            }
        };
        let batch = &mut batches[at];
        for (part, values) in group.keys.iter().enumerate() {
            for value in values {
                if batch.seen[part].insert(value.clone()) {
                    batch.query.keys[part].push(value.clone());
                }
            }
        }
        batch.groups.push(group);
    }
    if batches.len() > 1 {
        debug!("Correlated client join runs {} inner queries", batches.len());
    }
    batches
}

/// Adds the inner rows of one client-join query to `lookup`, keyed by the
/// group's correlated values followed by the join key.
fn extend_lookup(
    lookup: &mut ClientLookup,
    join: &ClientJoinPlan,
    inner: &Fetched,
    bindings: &Bindings,
    prefix: &[Value],
) -> Result<()> {
    let before = lookup.len();
    for_each_row(&inner.rows, bindings, &inner.lookups, |ctx| {
        let mut key = prefix.to_vec();
        for f in &join.inner_key {
            key.push(f(ctx)?);
        }
        let value = (join.inner.projector)(ctx)?;
        lookup.entry(join_key(key)).or_default().push(value);
        Ok(())
    })?;
    debug!(
        "Client join grouped {} inner rows into {} keys",
        inner.rows.num_rows(),
        lookup.len() - before
    );
    Ok(())
}

fn finish_query(
    query: &QueryPlan,
    fetched: Fetched,
    bindings: &Bindings,
    pager: Option<&Pager>,
) -> Result<QueryOutput> {
    if let Some(pager) = paged(query, pager) {
        let total = fetched
            .rows
            .total
            .unwrap_or(pager.offset() + fetched.rows.num_rows() as u64);
        pager.set_record_count(total);
    }

    let rows = DeferredRows::new(
        fetched.rows,
        query.projector.clone(),
        bindings.clone(),
        fetched.lookups,
    );
    match query.cardinality {
        Cardinality::Many => Ok(QueryOutput::Sequence(Sequence::Deferred(rows))),
        Cardinality::First => rows
            .project_at_most(1)?
            .into_iter()
            .next()
            .map(QueryOutput::Value)
            .ok_or_else(|| QueryError::ExecutionError("sequence contains no elements".into())),
        Cardinality::FirstOrDefault => Ok(QueryOutput::Value(
            rows.project_at_most(1)?.into_iter().next().unwrap_or(Value::Null),
        )),
        Cardinality::Single => {
            let mut values = rows.project_at_most(2)?;
            match values.len() {
                1 => Ok(QueryOutput::Value(values.remove(0))),
                0 => Err(QueryError::ExecutionError("sequence contains no elements".into())),
                _ => Err(QueryError::ExecutionError(
                    "sequence contains more than one element".into(),
                )),
            }
        }
    }
}

fn finish_scalar(scalar: &ScalarPlan, raw: Value, bindings: &Bindings) -> Result<QueryOutput> {
    let value = raw.coerce(&scalar.result_type)?;
    if let Some(write_back) = &scalar.write_back {
        match (write_back.target)(bindings)? {
            Value::Entity(entity) => {
                debug!(
                    "Writing generated {} = {:?} back to {}",
                    write_back.property,
                    value,
                    entity.entity_type()
                );
                entity.bind(write_back.property.clone(), value.clone());
            }
            other => {
                return Err(QueryError::ExecutionError(format!(
                    "generated key target is {}, not an entity",
                    other.data_type()
                )))
            }
        }
    }
    Ok(QueryOutput::Value(value))
}

/// One row per input item. Constant setters are evaluated once.
fn batch_rows(batch: &BatchPlan, bindings: &Bindings) -> Result<RecordBatch> {
    let item_bindings: Vec<Bindings> = batch
        .items
        .iter()
        .map(|item| {
            let mut scoped = bindings.clone();
            scoped.insert(batch.item_param.clone(), Value::Entity(item.clone()));
            scoped
        })
        .collect();

    let mut fields = Vec::with_capacity(batch.columns.len());
    let mut arrays = Vec::with_capacity(batch.columns.len());
    for column in &batch.columns {
        let values = match &column.setter {
            ColumnSetter::Constant(compute) => vec![compute(bindings)?; batch.items.len()],
            ColumnSetter::PerItem(compute) => item_bindings
                .iter()
                .map(|scoped| compute(scoped))
                .collect::<Result<Vec<_>>>()?,
        };
        let array = values_to_array(&column.db_type, &values)?;
        fields.push(Field::new(column.name.as_str(), array.data_type().clone(), true));
        arrays.push(array);
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

fn write_back_keys(batch: &BatchPlan, keys: Vec<Value>) {
    let Some(property) = &batch.key_property else {
        return;
    };
    if keys.len() != batch.items.len() {
        warn!(
            "Backend returned {} generated keys for {} items",
            keys.len(),
            batch.items.len()
        );
    }
    for (item, key) in batch.items.iter().zip(keys) {
        item.bind(property.clone(), key);
    }
}
