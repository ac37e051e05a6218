use crate::eval::{self, Bindings};
use crate::materialize::Materializer;
use crate::parameterize::{bind_columns, mapped_column, reach, Parameterizer, Scope};
use crate::plan::{
    BatchColumn, BatchPlan, CallShape, ColumnSetter, CommandTemplate, KeyWriteBack, ParamSource,
    Plan, PlanEntry, QueryPlan, RowFn, ScalarPlan, ValueFn,
};
use query_core::backend::{
    ConverterRegistry, IdentityGenerator, JoinClause, RelationalPlan, SelectCommand,
    TranslateResult, Translator, ValueConverter,
};
use query_core::schema::{ColumnMap, EntityMap, MappingRegistry, PersistenceEnvironment};
use query_core::tree::{
    AggregateNode, BatchOperation, BinaryOperator, Cardinality, CommandKind, CommandNode,
    MethodKind, NodeRef, QueryNode, SelectNode, SourceRef,
};
use query_core::{DataType, EntityRef, Pager, QueryError, Result, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BuildOptions {
    pub is_async: bool,
    /// Materialize entities detached, without change tracking
    pub no_tracking: bool,
}

/// Everything the builder consults, passed explicitly down every call.
pub struct CompileContext<'a> {
    pub mappings: &'a dyn MappingRegistry,
    pub translator: &'a dyn Translator,
    pub converters: &'a dyn ConverterRegistry,
    pub identity: Option<Arc<dyn IdentityGenerator>>,
    pub environment: Option<&'a PersistenceEnvironment>,
    pub pager: Option<&'a Pager>,
    pub options: BuildOptions,
}

/// Mutable bookkeeping for one build.
#[derive(Debug, Default)]
pub struct BuildState {
    next_param: usize,
    entity_types: BTreeSet<String>,
}

/// Inner side of a client join, returned to the materializer that owns
/// the outer scope.
pub struct InnerJoin {
    pub plan: QueryPlan,
    pub inner_key: Vec<RowFn>,
    /// The caller's outer key with folded equalities appended
    pub outer_key: Vec<NodeRef>,
    /// Outer expressions behind the plan's `OuterValue` placeholders
    pub correlated: Vec<NodeRef>,
}

/// Lowers query trees into [`Plan`]s.
pub struct PlanBuilder<'a> {
    ctx: CompileContext<'a>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(ctx: CompileContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn options(&self) -> BuildOptions {
        self.ctx.options
    }

    pub fn converters(&self) -> &dyn ConverterRegistry {
        self.ctx.converters
    }

    pub fn environment_name(&self) -> Option<String> {
        self.ctx.environment.map(|e| e.name().to_string())
    }

    pub fn build(&self, tree: &NodeRef) -> Result<Plan> {
        self.build_with_source(tree, tree)
    }

    /// Builds `tree` (usually its canonical form); failures are reported
    /// as one compilation error carrying `source`.
    pub fn build_with_source(&self, tree: &NodeRef, source: &NodeRef) -> Result<Plan> {
        let mut state = BuildState::default();

        match self.build_entry(tree, &mut state) {
            Ok(entry) => {
                let plan = Plan {
                    entry,
                    shape: CallShape::of(self.ctx.options.is_async, self.ctx.pager.is_some()),
                    entity_types: state.entity_types.into_iter().collect(),
                    pager: self.ctx.pager.cloned(),
                };
                debug!(
                    "Compiled {:?} plan over {:?} with {} parameters",
                    plan.shape, plan.entity_types, state.next_param
                );
                Ok(plan)
            }
            Err(err) => {
                warn!("Query compilation failed: {}", err);
                Err(err.into_compilation(source))
            }
        }
    }

    fn build_entry(&self, node: &NodeRef, state: &mut BuildState) -> Result<PlanEntry> {
        match node.as_ref() {
            QueryNode::MethodCall {
                target: Some(target),
                method: MethodKind::CacheDirective,
                ..
            } => self.build_entry(target, state),
            QueryNode::Lambda { body, .. } => self.build_entry(body, state),
            QueryNode::Command(command) => self.build_command(command, state),
            QueryNode::MethodCall { method, .. } if method.is_mutating() => {
                let command = self.desugar_call(node)?;
                self.build_command(&command, state)
            }
            QueryNode::Select(select) => self.build_select(select, state),
            _ if eval::is_client_evaluable(node) => Ok(PlanEntry::Evaluate(value_fn(node))),
            other => Err(QueryError::Unsupported(format!(
                "{} at the root of a query",
                other.kind_name()
            ))),
        }
    }

    fn resolve_table(&self, table: &str) -> String {
        match self.ctx.environment {
            Some(environment) => environment.resolve_table(table).to_string(),
            None => table.to_string(),
        }
    }

    fn push_source(&self, scope: &mut Scope, source: &SourceRef, state: &mut BuildState) -> Result<()> {
        let map = self.ctx.mappings.get_mapping(&source.entity_type)?;
        let table = self.resolve_table(map.table());
        state.entity_types.insert(source.entity_type.clone());
        scope.push(source.alias.clone(), map, table);
        Ok(())
    }

    fn scope_for(&self, select: &SelectNode, outer: Option<&Scope>, state: &mut BuildState) -> Result<Scope> {
        let mut scope = outer.map(Scope::nested).unwrap_or_default();
        self.push_source(&mut scope, &select.source, state)?;
        for join in &select.joins {
            self.push_source(&mut scope, &join.source, state)?;
        }
        Ok(scope)
    }

    fn build_select(&self, select: &SelectNode, state: &mut BuildState) -> Result<PlanEntry> {
        let scope = self.scope_for(select, None, state)?;

        if let Some(aggregate) = &select.aggregate {
            return self
                .build_aggregate(select, aggregate, &scope, state)
                .map(PlanEntry::Scalar);
        }

        let (plan, _, _) = self.build_query(select, &scope, &[], &[], true, state)?;
        Ok(PlanEntry::Query(plan))
    }

    /// Inner side of a client join: the nested select restricted to the
    /// outer key values, plus the closures reading its join key.
    ///
    /// Equalities between an inner and an outer expression are folded into
    /// the join key so they stay within the one batched inner query. Any
    /// other outer reference becomes an `OuterValue` placeholder.
    pub fn build_client_join(
        &self,
        select: &SelectNode,
        inner_key: &[NodeRef],
        outer_key: &[NodeRef],
        outer: &Scope,
        state: &mut BuildState,
    ) -> Result<InnerJoin> {
        if select.aggregate.is_some() {
            return Err(QueryError::Unsupported(
                "aggregate inside a client join".into(),
            ));
        }
        let scope = self.scope_for(select, Some(outer), state)?;
        let mut keys = inner_key
            .iter()
            .map(|key| bind_columns(key, &scope))
            .collect::<Result<Vec<_>>>()?;
        let mut outer_key = outer_key.to_vec();

        let mut residual = Vec::new();
        if let Some(predicate) = &select.predicate {
            for conjunct in conjuncts(predicate) {
                match correlated_equality(&conjunct, &scope) {
                    Some((inner, outer)) => {
                        keys.push(bind_columns(&inner, &scope)?);
                        outer_key.push(outer);
                    }
                    None => residual.push(conjunct),
                }
            }
        }
        let select = SelectNode {
            predicate: residual
                .into_iter()
                .reduce(|acc, next| QueryNode::binary(BinaryOperator::And, acc, next)),
            ..select.clone()
        };

        let key_types: Vec<DataType> = outer_key.iter().map(|k| k.data_type()).collect();
        let (plan, inner_key, correlated) =
            self.build_query(&select, &scope, &keys, &key_types, false, state)?;
        Ok(InnerJoin {
            plan,
            inner_key,
            outer_key,
            correlated,
        })
    }

    fn build_query(
        &self,
        select: &SelectNode,
        scope: &Scope,
        inner_keys: &[NodeRef],
        key_types: &[DataType],
        allow_paging: bool,
        state: &mut BuildState,
    ) -> Result<(QueryPlan, Vec<RowFn>, Vec<NodeRef>)> {
        // Materializers first: they decide which columns are read and may
        // build nested client-join plans.
        let mut materializer = Materializer::new(self, scope);
        let projection = match &select.projection {
            Some(projection) => bind_columns(projection, scope)?,
            None => QueryNode::parameter(
                select.source.alias.clone(),
                DataType::Entity(select.source.entity_type.clone()),
            ),
        };
        let projector = materializer.compile(&projection, state)?;
        let key_fns = inner_keys
            .iter()
            .map(|key| materializer.compile(key, state))
            .collect::<Result<Vec<_>>>()?;
        let Materializer {
            columns,
            client_joins,
            correlated,
            ..
        } = materializer;

        let mut parameterizer = Parameterizer::new(self.ctx.converters, &mut state.next_param)
            .with_correlated(correlated);
        let (mut predicate, joins) = self.lower_filters(select, scope, &mut parameterizer)?;
        for (part, key) in inner_keys.iter().enumerate() {
            let key_type = key_types.get(part).cloned().unwrap_or_else(|| key.data_type());
            let restriction = QueryNode::binary(
                BinaryOperator::Equal,
                key.clone(),
                parameterizer.bind_outer_key(part, key_type),
            );
            predicate = Some(match predicate {
                Some(existing) => QueryNode::binary(BinaryOperator::And, existing, restriction),
                None => restriction,
            });
        }

        let order_by = select
            .order_by
            .iter()
            .map(|order| {
                let bound = bind_columns(&order.expr, scope)?;
                Ok((parameterizer.parameterize(&bound, scope)?, order.ascending))
            })
            .collect::<Result<Vec<_>>>()?;

        let paged = allow_paging && select.paged && self.ctx.pager.is_some();
        let take = match select.cardinality {
            Cardinality::Many => None,
            Cardinality::First | Cardinality::FirstOrDefault => Some(1),
            Cardinality::Single => Some(2),
        };
        let source = self.source_of(scope, &select.source.alias)?;

        let command = SelectCommand {
            table: source,
            alias: select.source.alias.clone(),
            joins,
            columns: columns.nodes(),
            predicate,
            order_by,
            aggregate: None,
            distinct: select.distinct,
            take,
            segment: if paged {
                self.ctx.pager.map(|p| p.segment())
            } else {
                None
            },
        };
        let template = self.translate(&RelationalPlan::Select(command), &parameterizer)?;
        single_statement(&template, "select")?;

        let plan = QueryPlan {
            command: template,
            columns: columns.names(),
            projector,
            cardinality: select.cardinality,
            client_joins,
            paged,
        };
        Ok((plan, key_fns, parameterizer.correlated()))
    }

    fn build_aggregate(
        &self,
        select: &SelectNode,
        aggregate: &AggregateNode,
        scope: &Scope,
        state: &mut BuildState,
    ) -> Result<ScalarPlan> {
        let mut parameterizer = Parameterizer::new(self.ctx.converters, &mut state.next_param);
        let (predicate, joins) = self.lower_filters(select, scope, &mut parameterizer)?;
        let argument = aggregate
            .argument
            .as_ref()
            .map(|arg| {
                let bound = bind_columns(arg, scope)?;
                parameterizer.parameterize(&bound, scope)
            })
            .transpose()?;

        let command = SelectCommand {
            table: self.source_of(scope, &select.source.alias)?,
            alias: select.source.alias.clone(),
            joins,
            columns: Vec::new(),
            predicate,
            order_by: Vec::new(),
            aggregate: Some((aggregate.func, argument)),
            distinct: select.distinct,
            take: None,
            segment: None,
        };
        let template = self.translate(&RelationalPlan::Select(command), &parameterizer)?;
        single_statement(&template, "aggregate")?;

        Ok(ScalarPlan {
            command: template,
            result_type: aggregate.data_type.clone(),
            write_back: None,
        })
    }

    fn lower_filters(
        &self,
        select: &SelectNode,
        scope: &Scope,
        parameterizer: &mut Parameterizer<'_>,
    ) -> Result<(Option<NodeRef>, Vec<JoinClause>)> {
        let predicate = select
            .predicate
            .as_ref()
            .map(|p| {
                let bound = bind_columns(p, scope)?;
                parameterizer.parameterize(&bound, scope)
            })
            .transpose()?;

        let joins = select
            .joins
            .iter()
            .map(|join| {
                let bound = bind_columns(&join.on, scope)?;
                Ok(JoinClause {
                    kind: join.kind,
                    table: self.source_of(scope, &join.source.alias)?,
                    alias: join.source.alias.clone(),
                    on: parameterizer.parameterize(&bound, scope)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((predicate, joins))
    }

    fn source_of(&self, scope: &Scope, alias: &str) -> Result<String> {
        scope
            .source(alias)
            .map(|s| s.table.clone())
            .ok_or_else(|| QueryError::compilation(format!("unknown alias '{}'", alias), None))
    }

    fn translate(&self, plan: &RelationalPlan, parameterizer: &Parameterizer<'_>) -> Result<CommandTemplate> {
        let result = self.ctx.translator.translate(plan)?;
        template_from(result, parameterizer)
    }

    fn build_command(&self, command: &CommandNode, state: &mut BuildState) -> Result<PlanEntry> {
        if command.is_noop() {
            debug!(
                "Command on {} has nothing to write, answering -1",
                command.entity_type
            );
            return Ok(PlanEntry::Constant(Value::Int64(-1)));
        }

        let map = self.ctx.mappings.get_mapping(&command.entity_type)?;
        let table = self.resolve_table(map.table());
        state.entity_types.insert(command.entity_type.clone());

        if let CommandKind::Batch(operation) = command.kind {
            return self
                .build_batch(command, operation, &map, table)
                .map(PlanEntry::Batch);
        }

        let mut scope = Scope::default();
        scope.push(command.alias.clone(), map.clone(), table.clone());
        let mut parameterizer = Parameterizer::new(self.ctx.converters, &mut state.next_param);

        let mut values = Vec::with_capacity(command.assignments.len());
        for assignment in &command.assignments {
            let column = resolve_column(&map, &assignment.column)?;
            let value = match assignment.value.as_ref() {
                QueryNode::Generator {
                    entity,
                    entity_type,
                    property,
                    data_type,
                } => {
                    let generate = self.generator(entity, entity_type, property, data_type)?;
                    parameterizer.bind(
                        &assignment.value,
                        ParamSource::Compute(generate),
                        column.db_type().clone(),
                        self.ctx.converters.get_converter(column.data_type()),
                    )
                }
                _ => {
                    let bound = bind_columns(&assignment.value, &scope)?;
                    parameterizer.parameterize_assignment(&bound, column, &scope)?
                }
            };
            values.push((column.column().to_string(), value));
        }

        let predicate = command
            .predicate
            .as_ref()
            .map(|p| {
                let bound = bind_columns(p, &scope)?;
                parameterizer.parameterize(&bound, &scope)
            })
            .transpose()?;

        match command.kind {
            CommandKind::Insert => {
                if predicate.is_some() {
                    return Err(QueryError::compilation("insert cannot carry a row filter", None));
                }
                let auto = command
                    .with_auto_increment
                    .as_ref()
                    .map(|auto| resolve_column(&map, &auto.column).map(|c| (auto, c.clone())))
                    .transpose()?;
                let plan = RelationalPlan::Insert {
                    table,
                    values,
                    returning: auto.as_ref().map(|(_, column)| column.column().to_string()),
                };
                let template = self.translate(&plan, &parameterizer)?;
                match auto {
                    Some((auto, column)) => {
                        single_statement(&template, "insert returning a key")?;
                        Ok(PlanEntry::Scalar(ScalarPlan {
                            command: template,
                            result_type: column.data_type().clone(),
                            write_back: Some(KeyWriteBack {
                                target: value_fn(&auto.target),
                                property: auto.property.clone(),
                            }),
                        }))
                    }
                    None => Ok(PlanEntry::NoResult(template)),
                }
            }
            CommandKind::Update => {
                let plan = RelationalPlan::Update {
                    table,
                    alias: command.alias.clone(),
                    assignments: values,
                    predicate,
                };
                Ok(PlanEntry::NoResult(self.translate(&plan, &parameterizer)?))
            }
            CommandKind::Delete | CommandKind::Batch(_) => {
                let plan = RelationalPlan::Delete {
                    table,
                    alias: command.alias.clone(),
                    predicate,
                };
                Ok(PlanEntry::NoResult(self.translate(&plan, &parameterizer)?))
            }
        }
    }

    fn build_batch(
        &self,
        command: &CommandNode,
        operation: BatchOperation,
        map: &EntityMap,
        table: String,
    ) -> Result<BatchPlan> {
        let source = command
            .batch
            .as_ref()
            .ok_or_else(|| QueryError::compilation("batch command without input items", None))?;
        let item = source.item.name.clone();

        let mut columns = Vec::with_capacity(command.assignments.len());
        for assignment in &command.assignments {
            let column = resolve_column(map, &assignment.column)?;
            let compute = match assignment.value.as_ref() {
                QueryNode::Generator {
                    entity,
                    entity_type,
                    property,
                    data_type,
                } => self.generator(entity, entity_type, property, data_type)?,
                _ if eval::is_client_evaluable(&assignment.value) => value_fn(&assignment.value),
                other => {
                    return Err(QueryError::Unsupported(format!(
                        "{} as a batch column value",
                        other.kind_name()
                    )))
                }
            };
            let compute = with_converter(
                compute,
                self.ctx.converters.get_converter(column.data_type()),
                column.db_type().clone(),
            );
            let per_item = eval::free_parameters(&assignment.value).contains(&item);
            columns.push(BatchColumn {
                name: column.column().to_string(),
                db_type: column.db_type().clone(),
                setter: if per_item {
                    ColumnSetter::PerItem(compute)
                } else {
                    ColumnSetter::Constant(compute)
                },
            });
        }

        let key_columns: Vec<String> = match operation {
            BatchOperation::Insert => Vec::new(),
            BatchOperation::Update | BatchOperation::Delete => {
                map.primary_keys().map(|c| c.column().to_string()).collect()
            }
        };
        if let Some(missing) = key_columns
            .iter()
            .find(|key| !columns.iter().any(|c| &c.name == *key))
        {
            return Err(QueryError::compilation(
                format!("batch {:?} does not set key column {}", operation, missing),
                None,
            ));
        }

        let auto = match (operation, &command.with_auto_increment) {
            (BatchOperation::Insert, Some(auto)) => Some(auto),
            _ => None,
        };
        let returning = auto
            .map(|auto| resolve_column(map, &auto.column).map(|c| c.column().to_string()))
            .transpose()?;

        let plan = RelationalPlan::Batch {
            table: table.clone(),
            operation,
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            key_columns,
            returning,
        };
        let result = self.ctx.translator.translate(&plan)?;
        if let Some(unknown) = result
            .parameters
            .iter()
            .find(|name| !columns.iter().any(|c| &c.name == *name))
        {
            return Err(QueryError::compilation(
                format!("translator referenced unknown batch column '{}'", unknown),
                None,
            ));
        }
        if !result.nested_results.is_empty() {
            return Err(QueryError::compilation(
                "batch commands must translate to a single statement",
                None,
            ));
        }

        debug!(
            "Batch {:?} on {} over {} items",
            operation,
            table,
            source.items.len()
        );
        Ok(BatchPlan {
            table,
            command: CommandTemplate {
                text: result.command_text,
                params: Vec::new(),
                segment: None,
                nested: Vec::new(),
            },
            columns,
            items: source.items.clone(),
            item_param: item,
            key_property: auto.map(|a| a.property.clone()),
        })
    }

    /// Key generation for a `Generator` node: a GUID assigned only when the
    /// current key is empty for string keys, the identity service otherwise.
    fn generator(
        &self,
        entity: &NodeRef,
        entity_type: &str,
        property: &str,
        data_type: &DataType,
    ) -> Result<ValueFn> {
        let map = self.ctx.mappings.get_mapping(entity_type)?;
        let column = map.column_for(property)?.column().to_string();
        let table = self.resolve_table(map.table());
        let entity = entity.clone();
        let property = property.to_string();

        if data_type.is_string() {
            return Ok(Arc::new(move |bindings: &Bindings| {
                let target = target_entity(&entity, bindings)?;
                let current = target.value(&property).unwrap_or(Value::Null);
                if !current.is_empty_key() {
                    return Ok(current);
                }
                let key = Value::Utf8(Uuid::new_v4().to_string());
                target.bind(property.clone(), key.clone());
                Ok(key)
            }));
        }

        let identity = self.ctx.identity.clone().ok_or_else(|| {
            QueryError::compilation(
                format!("no identity generator configured for {}.{}", table, column),
                None,
            )
        })?;
        Ok(Arc::new(move |bindings: &Bindings| {
            let target = target_entity(&entity, bindings)?;
            let key = identity.generate(&table, &column)?;
            target.bind(property.clone(), key.clone());
            Ok(key)
        }))
    }

    /// Lowers a mutating method call into the equivalent command node.
    fn desugar_call(&self, node: &NodeRef) -> Result<CommandNode> {
        let QueryNode::MethodCall {
            target,
            method,
            args,
            ..
        } = node.as_ref()
        else {
            return Err(QueryError::compilation("expected a method call", None));
        };

        match method {
            MethodKind::Insert | MethodKind::Create | MethodKind::Update | MethodKind::Delete => {
                let entity = args.first().or(target.as_ref()).ok_or_else(|| {
                    QueryError::compilation(format!("{} without an entity", method.name()), None)
                })?;
                let DataType::Entity(entity_type) = entity.data_type().non_null().clone() else {
                    return Err(QueryError::compilation(
                        format!("{} needs an entity, found {}", method.name(), entity.data_type()),
                        None,
                    ));
                };
                let map = self.ctx.mappings.get_mapping(&entity_type)?;
                entity_command(*method, entity, &map)
            }
            MethodKind::UpdateWhere | MethodKind::RemoveWhere => {
                let Some(QueryNode::Select(select)) = target.as_deref() else {
                    return Err(QueryError::compilation(
                        format!("{} needs a query to filter rows", method.name()),
                        None,
                    ));
                };
                let kind = if *method == MethodKind::UpdateWhere {
                    CommandKind::Update
                } else {
                    CommandKind::Delete
                };
                let mut command = CommandNode::new(kind, select.source.entity_type.clone())
                    .alias(select.source.alias.clone())
                    .filter(
                        select
                            .predicate
                            .clone()
                            .unwrap_or_else(|| QueryNode::constant(true)),
                    );
                if kind == CommandKind::Update {
                    for (member, value) in assignments_of(args.first())? {
                        command = command.assign(member, value);
                    }
                }
                Ok(command)
            }
            other => Err(QueryError::Unsupported(format!(
                "{} calls must be lowered to a command node",
                other.name()
            ))),
        }
    }
}

fn single_statement(template: &CommandTemplate, what: &str) -> Result<()> {
    if template.nested.is_empty() {
        Ok(())
    } else {
        Err(QueryError::compilation(
            format!("{} must translate to a single statement", what),
            None,
        ))
    }
}

fn conjuncts(node: &NodeRef) -> Vec<NodeRef> {
    match node.as_ref() {
        QueryNode::Binary {
            op: BinaryOperator::And,
            left,
            right,
            ..
        } => {
            let mut parts = conjuncts(left);
            parts.extend(conjuncts(right));
            parts
        }
        _ => vec![node.clone()],
    }
}

/// Splits `inner = outer` (either way round) into its inner and outer
/// sides. The outer side may only read the directly enclosing query.
fn correlated_equality(node: &NodeRef, scope: &Scope) -> Option<(NodeRef, NodeRef)> {
    let QueryNode::Binary {
        op: BinaryOperator::Equal,
        left,
        right,
        ..
    } = node.as_ref()
    else {
        return None;
    };
    let only_inner = |n: &NodeRef| {
        let r = reach(n, scope);
        r.inner && !r.outer
    };
    let only_parent = |n: &NodeRef| {
        let r = reach(n, scope);
        r.outer && !r.inner && !r.distant
    };
    if only_inner(left) && only_parent(right) {
        Some((left.clone(), right.clone()))
    } else if only_parent(left) && only_inner(right) {
        Some((right.clone(), left.clone()))
    } else {
        None
    }
}

fn template_from(result: TranslateResult, parameterizer: &Parameterizer<'_>) -> Result<CommandTemplate> {
    let params = parameterizer.resolve(&result.parameters)?;
    let nested = result
        .nested_results
        .into_iter()
        .map(|nested| template_from(nested, parameterizer))
        .collect::<Result<Vec<_>>>()?;
    Ok(CommandTemplate {
        text: result.command_text,
        params,
        segment: result.data_segment,
        nested,
    })
}

fn resolve_column<'m>(map: &'m EntityMap, name: &str) -> Result<&'m ColumnMap> {
    map.column_for(name).or_else(|_| map.column_named(name))
}

fn value_fn(node: &NodeRef) -> ValueFn {
    let node = node.clone();
    Arc::new(move |bindings: &Bindings| eval::evaluate(&node, bindings))
}

fn with_converter(
    compute: ValueFn,
    converter: Option<Arc<dyn ValueConverter>>,
    db_type: DataType,
) -> ValueFn {
    match converter {
        Some(converter) => Arc::new(move |bindings: &Bindings| {
            converter.convert_to(compute(bindings)?, &db_type)
        }),
        None => compute,
    }
}

fn target_entity(node: &NodeRef, bindings: &Bindings) -> Result<EntityRef> {
    match eval::evaluate(node, bindings)? {
        Value::Entity(entity) => Ok(entity),
        other => Err(QueryError::TypeMismatch {
            expected: "entity".into(),
            found: other.data_type().to_string(),
        }),
    }
}

/// Member assignments from a record construction or initializer.
fn assignments_of(node: Option<&NodeRef>) -> Result<Vec<(String, NodeRef)>> {
    match node.map(|n| n.as_ref()) {
        Some(QueryNode::New { members, args, .. }) => {
            Ok(members.iter().cloned().zip(args.iter().cloned()).collect())
        }
        Some(QueryNode::MemberInit { bindings, .. }) => Ok(bindings
            .iter()
            .map(|b| (b.member.clone(), b.value.clone()))
            .collect()),
        Some(QueryNode::Constant {
            value: Value::Record(fields),
            ..
        }) => Ok(fields
            .iter()
            .map(|(name, value)| (name.clone(), QueryNode::constant(value.clone())))
            .collect()),
        _ => Err(QueryError::compilation(
            "update-where needs a record of assignments",
            None,
        )),
    }
}

/// Insert, update or delete of one entity instance, driven by its mapping.
fn entity_command(method: MethodKind, entity: &NodeRef, map: &EntityMap) -> Result<CommandNode> {
    let entity_type = map.entity_type().to_string();
    let member = |column: &ColumnMap| {
        QueryNode::member(entity.clone(), column.property(), column.data_type().clone())
    };

    if matches!(method, MethodKind::Insert | MethodKind::Create) {
        let current = match entity.as_ref() {
            QueryNode::Constant {
                value: Value::Entity(instance),
                ..
            } => Some(instance.clone()),
            _ => None,
        };
        let mut command = CommandNode::new(CommandKind::Insert, entity_type.clone());
        for column in map.columns() {
            if column.is_auto_increment() {
                command = command.auto_increment(column.column(), column.property(), entity.clone());
                continue;
            }
            let key_missing = current.as_ref().map_or(false, |instance| {
                instance
                    .value(column.property())
                    .map_or(true, |v| v.is_empty_key())
            });
            if column.is_primary_key() && (column.data_type().is_string() || key_missing) {
                let generator = Arc::new(QueryNode::Generator {
                    entity: entity.clone(),
                    entity_type: entity_type.clone(),
                    property: column.property().to_string(),
                    data_type: column.data_type().clone(),
                });
                command = command.assign(column.property(), generator);
                continue;
            }
            command = command.assign(column.property(), member(column));
        }
        return Ok(command);
    }

    let alias = "t0";
    let key_predicate = map
        .primary_keys()
        .map(|column| {
            QueryNode::binary(
                BinaryOperator::Equal,
                mapped_column(alias, column),
                member(column),
            )
        })
        .reduce(|acc, next| QueryNode::binary(BinaryOperator::And, acc, next))
        .ok_or_else(|| {
            QueryError::compilation(
                format!("{} needs a primary key on {}", method.name(), entity_type),
                None,
            )
        })?;

    let kind = if method == MethodKind::Update {
        CommandKind::Update
    } else {
        CommandKind::Delete
    };
    let mut command = CommandNode::new(kind, entity_type).alias(alias).filter(key_predicate);
    if kind == CommandKind::Update {
        for column in map.columns().iter().filter(|c| !c.is_primary_key()) {
            command = command.assign(column.property(), member(column));
        }
    }
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ClientJoinPlan;
    use query_core::backend::Converters;
    use query_core::schema::Mappings;

    /// Renders just enough text to assert on; collects placeholders in order.
    struct TextTranslator;

    fn render(node: &QueryNode, params: &mut Vec<String>) -> String {
        match node {
            QueryNode::Column { alias, name, .. } => format!("{}.{}", alias, name),
            QueryNode::NamedValue { name, .. } => {
                params.push(name.clone());
                format!("@{}", name)
            }
            QueryNode::Binary { op, left, right, .. } => format!(
                "({} {} {})",
                render(left, params),
                op.symbol(),
                render(right, params)
            ),
            QueryNode::Constant { value, .. } => {
                let mut out = String::new();
                value.encode(&mut out);
                out
            }
            other => other.kind_name().to_string(),
        }
    }

    impl Translator for TextTranslator {
        fn translate(&self, plan: &RelationalPlan) -> Result<TranslateResult> {
            let mut params = Vec::new();
            let text = match plan {
                RelationalPlan::Select(select) => {
                    let columns: Vec<String> =
                        select.columns.iter().map(|c| render(c, &mut params)).collect();
                    let mut text = format!("SELECT {} FROM {}", columns.join(", "), select.table);
                    if let Some(predicate) = &select.predicate {
                        text.push_str(&format!(" WHERE {}", render(predicate, &mut params)));
                    }
                    text
                }
                RelationalPlan::Insert { table, values, returning } => {
                    let values: Vec<String> =
                        values.iter().map(|(_, v)| render(v, &mut params)).collect();
                    format!("INSERT {} ({}) RETURNING {:?}", table, values.join(", "), returning)
                }
                RelationalPlan::Update { table, predicate, .. }
                | RelationalPlan::Delete { table, predicate, .. } => {
                    let predicate = predicate.as_ref().map(|p| render(p, &mut params));
                    format!("WRITE {} WHERE {:?}", table, predicate)
                }
                RelationalPlan::Batch { table, columns, .. } => {
                    params.extend(columns.iter().cloned());
                    format!("BATCH {}", table)
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

    fn mappings() -> Mappings {
        Mappings::new().with(EntityMap::new(
            "Person",
            "people",
            vec![
                ColumnMap::new("Id", DataType::Int64).auto_increment(),
                ColumnMap::new("Name", DataType::Utf8),
            ],
        ))
    }

    fn build(tree: &NodeRef, pager: Option<&Pager>) -> Result<Plan> {
        let mappings = mappings();
        let converters = Converters::new();
        let builder = PlanBuilder::new(CompileContext {
            mappings: &mappings,
            translator: &TextTranslator,
            converters: &converters,
            identity: None,
            environment: None,
            pager,
            options: BuildOptions::default(),
        });
        builder.build(tree)
    }

    fn person() -> NodeRef {
        QueryNode::parameter("t0", DataType::Entity("Person".into()))
    }

    #[test]
    fn test_filter_query_reads_mapped_columns() {
        let tree = SelectNode::new(SourceRef::new("Person", "t0"))
            .filter(QueryNode::binary(
                BinaryOperator::Equal,
                QueryNode::member(person(), "Name", DataType::Utf8),
                QueryNode::parameter("$0", DataType::Utf8),
            ))
            .into_node();
        let plan = build(&tree, None).unwrap();

        let PlanEntry::Query(query) = &plan.entry else {
            panic!("expected a query plan, got {:?}", plan.entry);
        };
        assert_eq!(query.columns.len(), 2);
        assert_eq!(query.command.params.len(), 1);
        assert_eq!(query.command.text, "SELECT t0.Id, t0.Name FROM people WHERE (t0.Name = @p0)");
        assert_eq!(plan.shape, CallShape::Store);
        assert_eq!(plan.entity_types, vec!["Person".to_string()]);
    }

    #[test]
    fn test_paged_query_takes_the_pager_segment() {
        let pager = Pager::new(20, 10);
        let tree = SelectNode::new(SourceRef::new("Person", "t0")).paged().into_node();
        let plan = build(&tree, Some(&pager)).unwrap();
        assert_eq!(plan.shape, CallShape::StorePager);
        let PlanEntry::Query(query) = &plan.entry else {
            panic!("expected a query plan");
        };
        assert!(query.paged);
        assert!(plan.pager.as_ref().map_or(false, |p| p.ptr_eq(&pager)));
    }

    #[test]
    fn test_insert_with_auto_increment_returns_a_scalar() {
        let ann = EntityRef::new("Person").with("Name", "Ann");
        let call = QueryNode::call(
            None,
            MethodKind::Insert,
            vec![QueryNode::constant_entity(ann)],
            DataType::Int64,
        );
        let plan = build(&call, None).unwrap();
        let PlanEntry::Scalar(scalar) = &plan.entry else {
            panic!("expected a scalar plan, got {:?}", plan.entry);
        };
        assert_eq!(scalar.write_back.as_ref().map(|w| w.property.as_str()), Some("Id"));
        assert!(scalar.command.text.contains("RETURNING Some(\"Id\")"));
    }

    #[test]
    fn test_empty_update_compiles_to_a_constant() {
        let tree = CommandNode::new(CommandKind::Update, "Person")
            .filter(QueryNode::constant(true))
            .into_node();
        let plan = build(&tree, None).unwrap();
        assert!(matches!(plan.entry, PlanEntry::Constant(Value::Int64(-1))));
    }

    #[test]
    fn test_failures_carry_the_source_tree() {
        let tree = SelectNode::new(SourceRef::new("Ghost", "t0")).into_node();
        match build(&tree, None).unwrap_err() {
            QueryError::Compilation { tree: Some(source), .. } => {
                assert!(Arc::ptr_eq(&source, &tree))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_remove_where_without_filter_deletes_everything() {
        let call = QueryNode::call(
            Some(SelectNode::new(SourceRef::new("Person", "t0")).into_node()),
            MethodKind::RemoveWhere,
            Vec::new(),
            DataType::Int64,
        );
        let plan = build(&call, None).unwrap();
        assert_eq!(plan.command_text(), Some("WRITE people WHERE Some(\"@p0\")"));
    }

    fn kid() -> NodeRef {
        QueryNode::parameter("t1", DataType::Entity("Person".into()))
    }

    /// `t0` people, each with the `t1` people matched by `inner`/`outer`.
    fn with_kids(inner_key: Vec<NodeRef>, outer_key: Vec<NodeRef>, kids: SelectNode) -> NodeRef {
        let join = Arc::new(QueryNode::ClientJoin {
            inner_key,
            outer_key,
            projection: kids.into_node(),
        });
        SelectNode::new(SourceRef::new("Person", "t0"))
            .project(QueryNode::record(vec![
                ("Name", QueryNode::member(person(), "Name", DataType::Utf8)),
                ("Kids", join),
            ]))
            .into_node()
    }

    fn only_join(plan: &Plan) -> &ClientJoinPlan {
        let PlanEntry::Query(query) = &plan.entry else {
            panic!("expected a query plan, got {:?}", plan.entry);
        };
        assert_eq!(query.client_joins.len(), 1);
        &query.client_joins[0]
    }

    fn sources(join: &ClientJoinPlan) -> Vec<String> {
        join.inner
            .command
            .params
            .iter()
            .map(|p| format!("{:?}", p.source))
            .collect()
    }

    #[test]
    fn test_nested_projection_compiles_to_a_client_join() {
        let tree = with_kids(
            vec![QueryNode::member(kid(), "Id", DataType::Int64)],
            vec![QueryNode::member(person(), "Id", DataType::Int64)],
            SelectNode::new(SourceRef::new("Person", "t1")),
        );
        let plan = build(&tree, None).unwrap();

        let PlanEntry::Query(query) = &plan.entry else {
            panic!("expected a query plan");
        };
        assert_eq!(query.command.text, "SELECT t0.Name, t0.Id FROM people");
        let join = only_join(&plan);
        assert_eq!(join.inner.command.text, "SELECT t1.Id, t1.Name FROM people WHERE (t1.Id = @p0)");
        assert_eq!(sources(join), vec!["OuterKey(0)"]);
        assert_eq!(
            join.inner.command.params[0].db_type,
            DataType::List(Box::new(DataType::Int64))
        );
        assert!(join.correlated.is_empty());
    }

    #[test]
    fn test_composite_key_binds_one_list_per_part() {
        let tree = with_kids(
            vec![
                QueryNode::member(kid(), "Id", DataType::Int64),
                QueryNode::member(kid(), "Name", DataType::Utf8),
            ],
            vec![
                QueryNode::member(person(), "Id", DataType::Int64),
                QueryNode::member(person(), "Name", DataType::Utf8),
            ],
            SelectNode::new(SourceRef::new("Person", "t1")),
        );
        let plan = build(&tree, None).unwrap();

        let join = only_join(&plan);
        assert_eq!(join.outer_key.len(), 2);
        assert_eq!(join.inner_key.len(), 2);
        assert_eq!(sources(join), vec!["OuterKey(0)", "OuterKey(1)"]);
        assert!(join
            .inner
            .command
            .text
            .ends_with("WHERE ((t1.Id = @p0) AND (t1.Name = @p1))"));
    }

    #[test]
    fn test_outer_equality_in_nested_filter_joins_on_the_key() {
        let kids = SelectNode::new(SourceRef::new("Person", "t1")).filter(QueryNode::binary(
            BinaryOperator::Equal,
            QueryNode::member(kid(), "Name", DataType::Utf8),
            QueryNode::member(person(), "Name", DataType::Utf8),
        ));
        let tree = with_kids(
            vec![QueryNode::member(kid(), "Id", DataType::Int64)],
            vec![QueryNode::member(person(), "Id", DataType::Int64)],
            kids,
        );
        let plan = build(&tree, None).unwrap();

        // Still one batched inner query: the equality became a key part
        let join = only_join(&plan);
        assert_eq!(join.outer_key.len(), 2);
        assert!(join.correlated.is_empty());
        assert_eq!(sources(join), vec!["OuterKey(0)", "OuterKey(1)"]);
        assert!(join
            .inner
            .command
            .text
            .ends_with("WHERE ((t1.Id = @p0) AND (t1.Name = @p1))"));
    }

    #[test]
    fn test_outer_value_in_nested_filter_is_correlated() {
        let kids = SelectNode::new(SourceRef::new("Person", "t1")).filter(QueryNode::binary(
            BinaryOperator::Greater,
            QueryNode::member(kid(), "Id", DataType::Int64),
            QueryNode::member(person(), "Id", DataType::Int64),
        ));
        let tree = with_kids(
            vec![QueryNode::member(kid(), "Name", DataType::Utf8)],
            vec![QueryNode::member(person(), "Name", DataType::Utf8)],
            kids,
        );
        let plan = build(&tree, None).unwrap();

        let join = only_join(&plan);
        assert_eq!(join.correlated.len(), 1);
        assert_eq!(sources(join), vec!["OuterValue(0)", "OuterKey(0)"]);
        assert!(join
            .inner
            .command
            .text
            .ends_with("WHERE ((t1.Id > @p0) AND (t1.Name = @p1))"));
    }

    #[test]
    fn test_outer_member_in_nested_projection_is_read_from_the_row() {
        let kids = SelectNode::new(SourceRef::new("Person", "t1")).project(QueryNode::record(vec![
            ("Kid", QueryNode::member(kid(), "Name", DataType::Utf8)),
            ("Parent", QueryNode::member(person(), "Name", DataType::Utf8)),
        ]));
        let tree = with_kids(
            vec![QueryNode::member(kid(), "Id", DataType::Int64)],
            vec![QueryNode::member(person(), "Id", DataType::Int64)],
            kids,
        );
        let plan = build(&tree, None).unwrap();

        // Nothing extra is sent; the value comes from the outer row
        let join = only_join(&plan);
        assert_eq!(join.correlated.len(), 1);
        assert_eq!(sources(join), vec!["OuterKey(0)"]);
        assert_eq!(join.inner.command.text, "SELECT t1.Name, t1.Id FROM people WHERE (t1.Id = @p0)");
    }

    #[test]
    fn test_outer_range_variable_in_nested_projection_is_rejected() {
        let kids = SelectNode::new(SourceRef::new("Person", "t1")).project(person());
        let tree = with_kids(
            vec![QueryNode::member(kid(), "Id", DataType::Int64)],
            vec![QueryNode::member(person(), "Id", DataType::Int64)],
            kids,
        );
        let err = build(&tree, None).unwrap_err();
        assert!(err.to_string().contains("outer range variable 't0'"), "{}", err);
    }
}
