//! Row materialization: compiles projection trees into closures that turn
//! one backend row into an output value.

use crate::eval;
use crate::parameterize::{bind_columns, mapped_column, outer_reference, Scope};
use crate::plan::{correlated_binding, join_key, ClientJoinPlan, RowContext, RowFn};
use crate::planner::{BuildState, PlanBuilder};
use arrow::array::{
    Array, BinaryArray, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use query_core::tree::{BinaryOperator, MethodKind, NodeRef, QueryNode};
use query_core::{DataType, EntityRef, QueryError, Result, Value};
use std::sync::Arc;

/// Reads one cell of a column with a known storage type.
pub type Accessor = fn(&dyn Array, usize) -> Result<Value>;

fn downcast<'a, T: 'static>(array: &'a dyn Array, expected: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| QueryError::TypeMismatch {
            expected: expected.to_string(),
            found: format!("{:?}", array.data_type()),
        })
}

fn read_bool(array: &dyn Array, row: usize) -> Result<Value> {
    Ok(Value::Boolean(downcast::<BooleanArray>(array, "bool")?.value(row)))
}

fn read_i32(array: &dyn Array, row: usize) -> Result<Value> {
    Ok(Value::Int32(downcast::<Int32Array>(array, "i32")?.value(row)))
}

fn read_i64(array: &dyn Array, row: usize) -> Result<Value> {
    Ok(Value::Int64(downcast::<Int64Array>(array, "i64")?.value(row)))
}

fn read_f64(array: &dyn Array, row: usize) -> Result<Value> {
    Ok(Value::Float64(downcast::<Float64Array>(array, "f64")?.value(row)))
}

fn read_utf8(array: &dyn Array, row: usize) -> Result<Value> {
    Ok(Value::Utf8(
        downcast::<StringArray>(array, "utf8")?.value(row).to_string(),
    ))
}

fn read_binary(array: &dyn Array, row: usize) -> Result<Value> {
    Ok(Value::Binary(
        downcast::<BinaryArray>(array, "binary")?.value(row).to_vec(),
    ))
}

fn read_timestamp(array: &dyn Array, row: usize) -> Result<Value> {
    Ok(Value::Timestamp(
        downcast::<TimestampMicrosecondArray>(array, "timestamp")?.value(row),
    ))
}

fn read_null(_array: &dyn Array, _row: usize) -> Result<Value> {
    Ok(Value::Null)
}

/// Typed accessor for a storage type; fails fast for types no column can hold.
pub fn accessor_for(db_type: &DataType) -> Result<Accessor> {
    let accessor: Accessor = match db_type.non_null() {
        DataType::Boolean => read_bool,
        DataType::Int32 => read_i32,
        DataType::Int64 => read_i64,
        DataType::Float64 => read_f64,
        DataType::Utf8 => read_utf8,
        DataType::Binary => read_binary,
        DataType::Timestamp => read_timestamp,
        DataType::Null => read_null,
        other => return Err(QueryError::TypeIncompatible(other.clone())),
    };
    Ok(accessor)
}

/// Columns a plan reads back, deduplicated and numbered by ordinal.
#[derive(Debug, Default, Clone)]
pub struct ColumnSet {
    columns: Vec<NodeRef>,
    keys: Vec<(String, String)>,
}

impl ColumnSet {
    pub fn add(&mut self, column: &NodeRef) -> usize {
        let key = match column.as_ref() {
            QueryNode::Column { alias, name, .. } => (alias.clone(), name.clone()),
            other => (String::new(), other.kind_name().to_string()),
        };
        match self.keys.iter().position(|k| *k == key) {
            Some(ordinal) => ordinal,
            None => {
                self.keys.push(key);
                self.columns.push(column.clone());
                self.columns.len() - 1
            }
        }
    }

    pub fn nodes(&self) -> Vec<NodeRef> {
        self.columns.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|(alias, name)| format!("{}.{}", alias, name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

pub struct Materializer<'b, 'a> {
    builder: &'b PlanBuilder<'a>,
    scope: &'b Scope,
    pub columns: ColumnSet,
    pub client_joins: Vec<ClientJoinPlan>,
    /// Parent-row reads in the projection, keyed by `alias.member`
    pub correlated: Vec<(String, NodeRef)>,
}

impl<'b, 'a> Materializer<'b, 'a> {
    pub fn new(builder: &'b PlanBuilder<'a>, scope: &'b Scope) -> Self {
        Self {
            builder,
            scope,
            columns: ColumnSet::default(),
            client_joins: Vec::new(),
            correlated: Vec::new(),
        }
    }

    pub fn compile(&mut self, node: &NodeRef, state: &mut BuildState) -> Result<RowFn> {
        if let Some((alias, label)) = outer_reference(node, self.scope) {
            return self.outer_read(node, alias, label);
        }
        let row_fn: RowFn = match node.as_ref() {
            QueryNode::Column { .. } => self.column(node)?,
            QueryNode::Parameter { name, .. } if self.scope.source(name).is_some() => {
                self.entity(name)?
            }
            QueryNode::Parameter { name, .. } if self.scope.is_outer(name) => {
                return Err(QueryError::Unsupported(format!(
                    "outer range variable '{}' read in a nested projection",
                    name
                )));
            }
            QueryNode::Parameter { name, .. } => {
                let name = name.clone();
                Arc::new(move |ctx: &RowContext<'_>| {
                    ctx.bindings
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| QueryError::MissingArgument(name.clone()))
                })
            }
            QueryNode::Constant { value, .. } => {
                let value = value.clone();
                Arc::new(move |_: &RowContext<'_>| Ok(value.clone()))
            }
            QueryNode::MemberAccess { target, member, .. } => {
                let target = self.compile(target, state)?;
                let member = member.clone();
                Arc::new(move |ctx: &RowContext<'_>| eval::member_of(&target(ctx)?, &member))
            }
            QueryNode::MethodCall {
                target: Some(target),
                method: MethodKind::CacheDirective,
                ..
            } => self.compile(target, state)?,
            QueryNode::MethodCall {
                target,
                method,
                args,
                ..
            } if !method.is_mutating() && *method != MethodKind::CacheDirective => {
                let target = target
                    .as_ref()
                    .map(|t| self.compile(t, state))
                    .transpose()?;
                let args = self.compile_all(args, state)?;
                let method = *method;
                Arc::new(move |ctx: &RowContext<'_>| {
                    let target = target.as_ref().map(|t| t(ctx)).transpose()?;
                    let args = args.iter().map(|a| a(ctx)).collect::<Result<Vec<_>>>()?;
                    eval::apply_method(method, target, args)
                })
            }
            QueryNode::Binary {
                op, left, right, ..
            } => {
                let left = self.compile(left, state)?;
                let right = self.compile(right, state)?;
                let op = *op;
                Arc::new(move |ctx: &RowContext<'_>| match op {
                    BinaryOperator::And if !eval::truthy(&left(ctx)?) => Ok(Value::Boolean(false)),
                    BinaryOperator::Or if eval::truthy(&left(ctx)?) => Ok(Value::Boolean(true)),
                    BinaryOperator::And | BinaryOperator::Or => {
                        Ok(Value::Boolean(eval::truthy(&right(ctx)?)))
                    }
                    _ => eval::apply_binary(op, left(ctx)?, right(ctx)?),
                })
            }
            QueryNode::Unary { op, operand, .. } => {
                let operand = self.compile(operand, state)?;
                let op = *op;
                Arc::new(move |ctx: &RowContext<'_>| eval::apply_unary(op, operand(ctx)?))
            }
            QueryNode::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => {
                let test = self.compile(test, state)?;
                let if_true = self.compile(if_true, state)?;
                let if_false = self.compile(if_false, state)?;
                Arc::new(move |ctx: &RowContext<'_>| {
                    if eval::truthy(&test(ctx)?) {
                        if_true(ctx)
                    } else {
                        if_false(ctx)
                    }
                })
            }
            QueryNode::New { ctor, members, args } => {
                let args = self.compile_all(args, state)?;
                let ctor = ctor.clone();
                let members = members.clone();
                Arc::new(move |ctx: &RowContext<'_>| {
                    let fields = members
                        .iter()
                        .zip(args.iter())
                        .map(|(member, arg)| Ok((member.clone(), arg(ctx)?)))
                        .collect::<Result<Vec<_>>>()?;
                    eval::construct(&ctor, fields)
                })
            }
            QueryNode::MemberInit { new, bindings } => {
                let new = self.compile(new, state)?;
                let members: Vec<String> = bindings.iter().map(|b| b.member.clone()).collect();
                let values = bindings
                    .iter()
                    .map(|b| self.compile(&b.value, state))
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(move |ctx: &RowContext<'_>| {
                    let fields = members
                        .iter()
                        .zip(values.iter())
                        .map(|(member, value)| Ok((member.clone(), value(ctx)?)))
                        .collect::<Result<Vec<_>>>()?;
                    eval::init_members(new(ctx)?, fields)
                })
            }
            QueryNode::OuterJoined { test, inner } => {
                let default = inner.data_type().default_value();
                let test = self.compile(test, state)?;
                let inner = self.compile(inner, state)?;
                Arc::new(move |ctx: &RowContext<'_>| {
                    if test(ctx)?.is_null() {
                        Ok(default.clone())
                    } else {
                        inner(ctx)
                    }
                })
            }
            QueryNode::ClientJoin {
                inner_key,
                outer_key,
                projection,
            } => self.client_join(inner_key, outer_key, projection, state)?,
            QueryNode::Select(_) => {
                return Err(QueryError::Unsupported(
                    "nested query outside a client join".into(),
                ))
            }
            other => {
                return Err(QueryError::Unsupported(format!(
                    "{} in a projection",
                    other.kind_name()
                )))
            }
        };
        Ok(row_fn)
    }

    fn compile_all(&mut self, nodes: &[NodeRef], state: &mut BuildState) -> Result<Vec<RowFn>> {
        nodes.iter().map(|n| self.compile(n, state)).collect()
    }

    fn column(&mut self, node: &NodeRef) -> Result<RowFn> {
        let QueryNode::Column {
            alias,
            name,
            data_type,
            map_info,
        } = node.as_ref()
        else {
            return Err(QueryError::Unsupported(format!(
                "{} read as a column",
                node.kind_name()
            )));
        };

        let db_type = map_info
            .as_ref()
            .map(|m| m.db_type.clone())
            .unwrap_or_else(|| data_type.clone());
        let accessor = accessor_for(&db_type)?;
        let nullable = data_type.is_nullable() || db_type.is_nullable();
        let converter = map_info
            .as_ref()
            .and_then(|_| self.builder.converters().get_converter(data_type));
        let ordinal = self.columns.add(node);
        let label = format!("{}.{}", alias, name);

        Ok(Arc::new(move |ctx: &RowContext<'_>| {
            let array = ctx.batch.columns().get(ordinal).ok_or_else(|| {
                QueryError::ExecutionError(format!("row has no column {} for {}", ordinal, label))
            })?;
            if array.is_null(ctx.row) {
                if nullable {
                    return Ok(Value::Null);
                }
                return Err(QueryError::ExecutionError(format!(
                    "null read from non-nullable column {}",
                    label
                )));
            }
            let raw = accessor(array.as_ref(), ctx.row)?;
            match &converter {
                Some(converter) => converter.convert_from(raw, &db_type),
                None => Ok(raw),
            }
        }))
    }

    /// Materializes the entity behind a range variable from all of its
    /// mapped columns.
    pub fn entity(&mut self, alias: &str) -> Result<RowFn> {
        let source = self
            .scope
            .source(alias)
            .ok_or_else(|| QueryError::compilation(format!("unknown alias '{}'", alias), None))?
            .clone();
        let entity_type = source.map.entity_type().to_string();

        let mut properties: Vec<(String, RowFn)> = Vec::new();
        for column in source.map.columns() {
            let node = mapped_column(alias, column);
            properties.push((column.property().to_string(), self.column(&node)?));
        }

        if self.builder.options().no_tracking {
            return Ok(Arc::new(move |ctx: &RowContext<'_>| {
                let values = properties
                    .iter()
                    .map(|(property, read)| Ok((property.clone(), read(ctx)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Entity(EntityRef::detached(entity_type.clone(), values)))
            }));
        }

        let environment = self.builder.environment_name();
        Ok(Arc::new(move |ctx: &RowContext<'_>| {
            let entity = EntityRef::raw(entity_type.clone());
            for (property, read) in &properties {
                entity.set_value(property.clone(), read(ctx)?);
            }
            entity.mark_unchanged();
            if let Some(environment) = &environment {
                entity.attach(environment.clone());
            }
            Ok(Value::Entity(entity))
        }))
    }

    /// Reads a parent-row value bound next to the execution arguments.
    fn outer_read(&mut self, node: &NodeRef, alias: &str, label: String) -> Result<RowFn> {
        if !self.scope.is_parent(alias) {
            return Err(QueryError::Unsupported(format!(
                "{} is not in the directly enclosing query",
                label
            )));
        }
        let slot = match self.correlated.iter().position(|(key, _)| *key == label) {
            Some(slot) => slot,
            None => {
                self.correlated.push((label, node.clone()));
                self.correlated.len() - 1
            }
        };
        let name = correlated_binding(slot);
        Ok(Arc::new(move |ctx: &RowContext<'_>| {
            ctx.bindings.get(&name).cloned().ok_or_else(|| {
                QueryError::ExecutionError(format!("correlated value '{}' is not bound", name))
            })
        }))
    }

    fn compile_outer(&mut self, nodes: &[NodeRef], state: &mut BuildState) -> Result<Vec<RowFn>> {
        nodes
            .iter()
            .map(|node| {
                let bound = bind_columns(node, self.scope)?;
                self.compile(&bound, state)
            })
            .collect()
    }

    fn client_join(
        &mut self,
        inner_key: &[NodeRef],
        outer_key: &[NodeRef],
        projection: &NodeRef,
        state: &mut BuildState,
    ) -> Result<RowFn> {
        if inner_key.len() != outer_key.len() || inner_key.is_empty() {
            return Err(QueryError::compilation(
                "client join needs matching, non-empty key lists",
                None,
            ));
        }
        let QueryNode::Select(inner_select) = projection.as_ref() else {
            return Err(QueryError::Unsupported(
                "client join projection must be a select".into(),
            ));
        };

        let inner = self
            .builder
            .build_client_join(inner_select, inner_key, outer_key, self.scope, state)?;
        let outer_fns = self.compile_outer(&inner.outer_key, state)?;
        let correlated = self.compile_outer(&inner.correlated, state)?;

        let index = self.client_joins.len();
        self.client_joins.push(ClientJoinPlan {
            outer_key: outer_fns.clone(),
            inner: Box::new(inner.plan),
            inner_key: inner.inner_key,
            correlated: correlated.clone(),
        });

        // Lookups are keyed by the correlated values followed by the key
        Ok(Arc::new(move |ctx: &RowContext<'_>| {
            let key = correlated
                .iter()
                .chain(outer_fns.iter())
                .map(|f| f(ctx))
                .collect::<Result<Vec<_>>>()?;
            let matches = ctx
                .lookups
                .get(index)
                .and_then(|lookup| lookup.get(&join_key(key)))
                .cloned()
                .unwrap_or_default();
            Ok(Value::List(matches))
        }))
    }
}
