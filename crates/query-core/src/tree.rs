//! The query tree: the typed, immutable AST handed to the compiler by a
//! front-end builder.
//!
//! Sub-trees are shared through [`NodeRef`]; rewrites never mutate a node in
//! place but rebuild parents around new children (see [`QueryNode::with_children`]).

use crate::entity::EntityRef;
use crate::types::{DataType, Value};
use std::sync::Arc;

pub type NodeRef = Arc<QueryNode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    Coalesce,
}

impl BinaryOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Equal => "=",
            BinaryOperator::NotEqual => "<>",
            BinaryOperator::Less => "<",
            BinaryOperator::LessEqual => "<=",
            BinaryOperator::Greater => ">",
            BinaryOperator::GreaterEqual => ">=",
            BinaryOperator::And => "AND",
            BinaryOperator::Or => "OR",
            BinaryOperator::Coalesce => "??",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::Less
                | BinaryOperator::LessEqual
                | BinaryOperator::Greater
                | BinaryOperator::GreaterEqual
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOperator::And | BinaryOperator::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    Not,
    Negate,
    IsNull,
    IsNotNull,
}

/// Closed set of method identities attached at tree-construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Insert,
    Update,
    Delete,
    Batch,
    RemoveWhere,
    UpdateWhere,
    Create,
    /// `cache(enabled, expiry?)` marker wrapping a query
    CacheDirective,
    StartsWith,
    EndsWith,
    Contains,
    ToUpper,
    ToLower,
    Trim,
    Length,
    Abs,
}

impl MethodKind {
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            MethodKind::Insert
                | MethodKind::Update
                | MethodKind::Delete
                | MethodKind::Batch
                | MethodKind::RemoveWhere
                | MethodKind::UpdateWhere
                | MethodKind::Create
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            MethodKind::Insert => "Insert",
            MethodKind::Update => "Update",
            MethodKind::Delete => "Delete",
            MethodKind::Batch => "Batch",
            MethodKind::RemoveWhere => "RemoveWhere",
            MethodKind::UpdateWhere => "UpdateWhere",
            MethodKind::Create => "Create",
            MethodKind::CacheDirective => "Cache",
            MethodKind::StartsWith => "StartsWith",
            MethodKind::EndsWith => "EndsWith",
            MethodKind::Contains => "Contains",
            MethodKind::ToUpper => "ToUpper",
            MethodKind::ToLower => "ToLower",
            MethodKind::Trim => "Trim",
            MethodKind::Length => "Length",
            MethodKind::Abs => "Abs",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParamDecl {
    pub name: String,
    pub data_type: DataType,
}

impl ParamDecl {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemberBinding {
    pub member: String,
    pub value: NodeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub entity_type: String,
    pub alias: String,
}

impl SourceRef {
    pub fn new(entity_type: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            alias: alias.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Inner,
    Left,
}

#[derive(Debug, Clone)]
pub struct JoinNode {
    pub kind: JoinKind,
    pub source: SourceRef,
    pub on: NodeRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone)]
pub struct AggregateNode {
    pub func: AggregateFunction,
    pub argument: Option<NodeRef>,
    pub data_type: DataType,
}

#[derive(Debug, Clone)]
pub struct OrderNode {
    pub expr: NodeRef,
    pub ascending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    Many,
    First,
    FirstOrDefault,
    Single,
}

#[derive(Debug, Clone)]
pub struct SelectNode {
    pub source: SourceRef,
    pub predicate: Option<NodeRef>,
    /// `None` materializes the source entity with all mapped columns
    pub projection: Option<NodeRef>,
    pub joins: Vec<JoinNode>,
    pub aggregate: Option<AggregateNode>,
    pub order_by: Vec<OrderNode>,
    pub cardinality: Cardinality,
    pub distinct: bool,
    /// Bounded by the request's pager when one is supplied
    pub paged: bool,
}

impl SelectNode {
    pub fn new(source: SourceRef) -> Self {
        Self {
            source,
            predicate: None,
            projection: None,
            joins: Vec::new(),
            aggregate: None,
            order_by: Vec::new(),
            cardinality: Cardinality::Many,
            distinct: false,
            paged: false,
        }
    }

    pub fn filter(mut self, predicate: NodeRef) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn project(mut self, projection: NodeRef) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn join(mut self, kind: JoinKind, source: SourceRef, on: NodeRef) -> Self {
        self.joins.push(JoinNode { kind, source, on });
        self
    }

    pub fn aggregate(mut self, func: AggregateFunction, argument: Option<NodeRef>) -> Self {
        let data_type = match (func, &argument) {
            (AggregateFunction::Count, _) => DataType::Int64,
            (AggregateFunction::Avg, _) => DataType::Float64.nullable(),
            (_, Some(arg)) => arg.data_type().nullable(),
            (_, None) => DataType::Null,
        };
        self.aggregate = Some(AggregateNode {
            func,
            argument,
            data_type,
        });
        self
    }

    pub fn order_by(mut self, expr: NodeRef, ascending: bool) -> Self {
        self.order_by.push(OrderNode { expr, ascending });
        self
    }

    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn paged(mut self) -> Self {
        self.paged = true;
        self
    }

    /// Aliases introduced by this select (source and joins).
    pub fn aliases(&self) -> Vec<&str> {
        std::iter::once(self.source.alias.as_str())
            .chain(self.joins.iter().map(|j| j.source.alias.as_str()))
            .collect()
    }

    pub fn element_type(&self) -> DataType {
        self.projection
            .as_ref()
            .map(|p| p.data_type())
            .unwrap_or_else(|| DataType::Entity(self.source.entity_type.clone()))
    }

    pub fn into_node(self) -> NodeRef {
        Arc::new(QueryNode::Select(Box::new(self)))
    }
}

/// Mapping details attached to a bound column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnMapInfo {
    pub property: String,
    /// Storage type read from the backend
    pub db_type: DataType,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchOperation {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Insert,
    Update,
    Delete,
    Batch(BatchOperation),
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub column: String,
    pub value: NodeRef,
}

/// Key generated by the store on insert, written back onto `target`.
#[derive(Debug, Clone)]
pub struct AutoIncrement {
    pub column: String,
    pub property: String,
    pub target: NodeRef,
}

#[derive(Debug, Clone)]
pub struct BatchSource {
    pub items: Vec<EntityRef>,
    /// Parameter bound to each item inside assignment values
    pub item: ParamDecl,
}

#[derive(Debug, Clone)]
pub struct CommandNode {
    pub kind: CommandKind,
    pub entity_type: String,
    /// Range alias the predicate's columns refer to
    pub alias: String,
    pub assignments: Vec<Assignment>,
    pub with_auto_increment: Option<AutoIncrement>,
    /// Row filter for update-where / remove-where
    pub predicate: Option<NodeRef>,
    pub batch: Option<BatchSource>,
}

impl CommandNode {
    pub fn new(kind: CommandKind, entity_type: impl Into<String>) -> Self {
        Self {
            kind,
            entity_type: entity_type.into(),
            alias: "t0".to_string(),
            assignments: Vec::new(),
            with_auto_increment: None,
            predicate: None,
            batch: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// True when the command has nothing to write. A delete writes nothing
    /// only when it has no row filter either.
    pub fn is_noop(&self) -> bool {
        match self.kind {
            CommandKind::Insert | CommandKind::Update => self.assignments.is_empty(),
            CommandKind::Delete => self.assignments.is_empty() && self.predicate.is_none(),
            CommandKind::Batch(_) => {
                self.assignments.is_empty()
                    || self.batch.as_ref().map_or(true, |b| b.items.is_empty())
            }
        }
    }

    pub fn assign(mut self, column: impl Into<String>, value: NodeRef) -> Self {
        self.assignments.push(Assignment {
            column: column.into(),
            value,
        });
        self
    }

    pub fn auto_increment(
        mut self,
        column: impl Into<String>,
        property: impl Into<String>,
        target: NodeRef,
    ) -> Self {
        self.with_auto_increment = Some(AutoIncrement {
            column: column.into(),
            property: property.into(),
            target,
        });
        self
    }

    pub fn filter(mut self, predicate: NodeRef) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn batch(mut self, items: Vec<EntityRef>, item: ParamDecl) -> Self {
        self.batch = Some(BatchSource { items, item });
        self
    }

    pub fn into_node(self) -> NodeRef {
        Arc::new(QueryNode::Command(Box::new(self)))
    }
}

#[derive(Debug, Clone)]
pub enum QueryNode {
    Constant {
        value: Value,
        data_type: DataType,
    },
    Parameter {
        name: String,
        data_type: DataType,
    },
    MemberAccess {
        target: NodeRef,
        member: String,
        data_type: DataType,
    },
    MethodCall {
        target: Option<NodeRef>,
        method: MethodKind,
        args: Vec<NodeRef>,
        data_type: DataType,
    },
    Binary {
        op: BinaryOperator,
        left: NodeRef,
        right: NodeRef,
        data_type: DataType,
    },
    Unary {
        op: UnaryOperator,
        operand: NodeRef,
        data_type: DataType,
    },
    Conditional {
        test: NodeRef,
        if_true: NodeRef,
        if_false: NodeRef,
        data_type: DataType,
    },
    /// Construction of a record or entity; `members[i]` receives `args[i]`
    New {
        ctor: DataType,
        members: Vec<String>,
        args: Vec<NodeRef>,
    },
    MemberInit {
        new: NodeRef,
        bindings: Vec<MemberBinding>,
    },
    Lambda {
        params: Vec<ParamDecl>,
        body: NodeRef,
    },
    Select(Box<SelectNode>),
    Column {
        alias: String,
        name: String,
        data_type: DataType,
        map_info: Option<ColumnMapInfo>,
    },
    /// Named positional placeholder produced by parameterization
    NamedValue {
        name: String,
        value: NodeRef,
        db_type: DataType,
    },
    Generator {
        entity: NodeRef,
        entity_type: String,
        property: String,
        data_type: DataType,
    },
    OuterJoined {
        test: NodeRef,
        inner: NodeRef,
    },
    ClientJoin {
        inner_key: Vec<NodeRef>,
        outer_key: Vec<NodeRef>,
        projection: NodeRef,
    },
    Command(Box<CommandNode>),
}

impl QueryNode {
    pub fn constant(value: impl Into<Value>) -> NodeRef {
        let value = value.into();
        let data_type = value.data_type();
        Arc::new(QueryNode::Constant { value, data_type })
    }

    /// A live entity instance embedded in the tree.
    pub fn constant_entity(entity: EntityRef) -> NodeRef {
        let data_type = DataType::Entity(entity.entity_type());
        Arc::new(QueryNode::Constant {
            value: Value::Entity(entity),
            data_type,
        })
    }

    pub fn typed_constant(value: Value, data_type: DataType) -> NodeRef {
        Arc::new(QueryNode::Constant { value, data_type })
    }

    pub fn parameter(name: impl Into<String>, data_type: DataType) -> NodeRef {
        Arc::new(QueryNode::Parameter {
            name: name.into(),
            data_type,
        })
    }

    pub fn column(alias: impl Into<String>, name: impl Into<String>, data_type: DataType) -> NodeRef {
        Arc::new(QueryNode::Column {
            alias: alias.into(),
            name: name.into(),
            data_type,
            map_info: None,
        })
    }

    pub fn mapped_column(
        alias: impl Into<String>,
        name: impl Into<String>,
        data_type: DataType,
        map_info: ColumnMapInfo,
    ) -> NodeRef {
        Arc::new(QueryNode::Column {
            alias: alias.into(),
            name: name.into(),
            data_type,
            map_info: Some(map_info),
        })
    }

    pub fn member(target: NodeRef, member: impl Into<String>, data_type: DataType) -> NodeRef {
        Arc::new(QueryNode::MemberAccess {
            target,
            member: member.into(),
            data_type,
        })
    }

    pub fn call(
        target: Option<NodeRef>,
        method: MethodKind,
        args: Vec<NodeRef>,
        data_type: DataType,
    ) -> NodeRef {
        Arc::new(QueryNode::MethodCall {
            target,
            method,
            args,
            data_type,
        })
    }

    /// Wraps `query` in an inline cache directive.
    pub fn cache_directive(query: NodeRef, enabled: bool, expiry: Option<std::time::Duration>) -> NodeRef {
        let data_type = query.data_type();
        let mut args = vec![QueryNode::constant(enabled)];
        if let Some(expiry) = expiry {
            args.push(QueryNode::constant(expiry));
        }
        QueryNode::call(Some(query), MethodKind::CacheDirective, args, data_type)
    }

    pub fn binary(op: BinaryOperator, left: NodeRef, right: NodeRef) -> NodeRef {
        let data_type = if op.is_comparison() || op.is_logical() {
            DataType::Boolean
        } else if op == BinaryOperator::Coalesce {
            right.data_type()
        } else {
            match (left.data_type().non_null(), right.data_type().non_null()) {
                (DataType::Float64, _) | (_, DataType::Float64) => DataType::Float64,
                (DataType::Int64, _) | (_, DataType::Int64) => DataType::Int64,
                (l, _) => l.clone(),
            }
        };
        Arc::new(QueryNode::Binary {
            op,
            left,
            right,
            data_type,
        })
    }

    pub fn unary(op: UnaryOperator, operand: NodeRef) -> NodeRef {
        let data_type = match op {
            UnaryOperator::Negate => operand.data_type(),
            _ => DataType::Boolean,
        };
        Arc::new(QueryNode::Unary {
            op,
            operand,
            data_type,
        })
    }

    pub fn conditional(test: NodeRef, if_true: NodeRef, if_false: NodeRef) -> NodeRef {
        let data_type = if_true.data_type();
        Arc::new(QueryNode::Conditional {
            test,
            if_true,
            if_false,
            data_type,
        })
    }

    pub fn record(fields: Vec<(&str, NodeRef)>) -> NodeRef {
        let (members, args) = fields
            .into_iter()
            .map(|(name, node)| (name.to_string(), node))
            .unzip();
        Arc::new(QueryNode::New {
            ctor: DataType::Record,
            members,
            args,
        })
    }

    pub fn lambda(params: Vec<ParamDecl>, body: NodeRef) -> NodeRef {
        Arc::new(QueryNode::Lambda { params, body })
    }

    pub fn data_type(&self) -> DataType {
        match self {
            QueryNode::Constant { data_type, .. }
            | QueryNode::Parameter { data_type, .. }
            | QueryNode::MemberAccess { data_type, .. }
            | QueryNode::MethodCall { data_type, .. }
            | QueryNode::Binary { data_type, .. }
            | QueryNode::Unary { data_type, .. }
            | QueryNode::Conditional { data_type, .. }
            | QueryNode::Column { data_type, .. }
            | QueryNode::Generator { data_type, .. } => data_type.clone(),
            QueryNode::New { ctor, .. } => ctor.clone(),
            QueryNode::MemberInit { new, .. } => new.data_type(),
            QueryNode::Lambda { body, .. } => body.data_type(),
            QueryNode::NamedValue { value, .. } => value.data_type(),
            QueryNode::OuterJoined { inner, .. } => inner.data_type(),
            QueryNode::ClientJoin { projection, .. } => match projection.as_ref() {
                QueryNode::Select(select) => DataType::List(Box::new(select.element_type())),
                other => DataType::List(Box::new(other.data_type())),
            },
            QueryNode::Select(select) => {
                if let Some(aggregate) = &select.aggregate {
                    return aggregate.data_type.clone();
                }
                let element = select.element_type();
                match select.cardinality {
                    Cardinality::Many => DataType::List(Box::new(element)),
                    Cardinality::FirstOrDefault => element.nullable(),
                    Cardinality::First | Cardinality::Single => element,
                }
            }
            QueryNode::Command(_) => DataType::Int64,
        }
    }

    /// Short tag naming the node kind, used in diagnostics and canonical forms.
    pub fn kind_name(&self) -> &'static str {
        match self {
            QueryNode::Constant { .. } => "const",
            QueryNode::Parameter { .. } => "param",
            QueryNode::MemberAccess { .. } => "member",
            QueryNode::MethodCall { .. } => "call",
            QueryNode::Binary { .. } => "bin",
            QueryNode::Unary { .. } => "un",
            QueryNode::Conditional { .. } => "cond",
            QueryNode::New { .. } => "new",
            QueryNode::MemberInit { .. } => "init",
            QueryNode::Lambda { .. } => "lambda",
            QueryNode::Select(_) => "select",
            QueryNode::Column { .. } => "col",
            QueryNode::NamedValue { .. } => "named",
            QueryNode::Generator { .. } => "gen",
            QueryNode::OuterJoined { .. } => "outer",
            QueryNode::ClientJoin { .. } => "cjoin",
            QueryNode::Command(_) => "cmd",
        }
    }

    /// Direct children in a fixed order; [`with_children`](Self::with_children)
    /// consumes replacements in the same order.
    pub fn children(&self) -> Vec<&NodeRef> {
        match self {
            QueryNode::Constant { .. } | QueryNode::Parameter { .. } | QueryNode::Column { .. } => {
                vec![]
            }
            QueryNode::MemberAccess { target, .. } => vec![target],
            QueryNode::MethodCall { target, args, .. } => target.iter().chain(args.iter()).collect(),
            QueryNode::Binary { left, right, .. } => vec![left, right],
            QueryNode::Unary { operand, .. } => vec![operand],
            QueryNode::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => vec![test, if_true, if_false],
            QueryNode::New { args, .. } => args.iter().collect(),
            QueryNode::MemberInit { new, bindings } => std::iter::once(new)
                .chain(bindings.iter().map(|b| &b.value))
                .collect(),
            QueryNode::Lambda { body, .. } => vec![body],
            QueryNode::Select(select) => {
                let mut children: Vec<&NodeRef> = Vec::new();
                children.extend(select.predicate.iter());
                children.extend(select.projection.iter());
                children.extend(select.joins.iter().map(|j| &j.on));
                if let Some(aggregate) = &select.aggregate {
                    children.extend(aggregate.argument.iter());
                }
                children.extend(select.order_by.iter().map(|o| &o.expr));
                children
            }
            QueryNode::NamedValue { value, .. } => vec![value],
            QueryNode::Generator { entity, .. } => vec![entity],
            QueryNode::OuterJoined { test, inner } => vec![test, inner],
            QueryNode::ClientJoin {
                inner_key,
                outer_key,
                projection,
            } => inner_key
                .iter()
                .chain(outer_key.iter())
                .chain(std::iter::once(projection))
                .collect(),
            QueryNode::Command(command) => {
                let mut children: Vec<&NodeRef> =
                    command.assignments.iter().map(|a| &a.value).collect();
                if let Some(auto) = &command.with_auto_increment {
                    children.push(&auto.target);
                }
                children.extend(command.predicate.iter());
                children
            }
        }
    }

    /// Rebuilds this node around replacement children, given in
    /// [`children`](Self::children) order. Missing replacements keep the
    /// original child.
    pub fn with_children(&self, children: Vec<NodeRef>) -> QueryNode {
        let mut it = children.into_iter();
        let mut next = |original: &NodeRef| it.next().unwrap_or_else(|| original.clone());

        match self {
            QueryNode::Constant { .. } | QueryNode::Parameter { .. } | QueryNode::Column { .. } => {
                self.clone()
            }
            QueryNode::MemberAccess {
                target,
                member,
                data_type,
            } => QueryNode::MemberAccess {
                target: next(target),
                member: member.clone(),
                data_type: data_type.clone(),
            },
            QueryNode::MethodCall {
                target,
                method,
                args,
                data_type,
            } => QueryNode::MethodCall {
                target: target.as_ref().map(&mut next),
                method: *method,
                args: args.iter().map(&mut next).collect(),
                data_type: data_type.clone(),
            },
            QueryNode::Binary {
                op,
                left,
                right,
                data_type,
            } => QueryNode::Binary {
                op: *op,
                left: next(left),
                right: next(right),
                data_type: data_type.clone(),
            },
            QueryNode::Unary {
                op,
                operand,
                data_type,
            } => QueryNode::Unary {
                op: *op,
                operand: next(operand),
                data_type: data_type.clone(),
            },
            QueryNode::Conditional {
                test,
                if_true,
                if_false,
                data_type,
            } => QueryNode::Conditional {
                test: next(test),
                if_true: next(if_true),
                if_false: next(if_false),
                data_type: data_type.clone(),
            },
            QueryNode::New { ctor, members, args } => QueryNode::New {
                ctor: ctor.clone(),
                members: members.clone(),
                args: args.iter().map(&mut next).collect(),
            },
            QueryNode::MemberInit { new, bindings } => QueryNode::MemberInit {
                new: next(new),
                bindings: bindings
                    .iter()
                    .map(|b| MemberBinding {
                        member: b.member.clone(),
                        value: next(&b.value),
                    })
                    .collect(),
            },
            QueryNode::Lambda { params, body } => QueryNode::Lambda {
                params: params.clone(),
                body: next(body),
            },
            QueryNode::Select(select) => {
                let mut rebuilt = select.as_ref().clone();
                rebuilt.predicate = select.predicate.as_ref().map(&mut next);
                rebuilt.projection = select.projection.as_ref().map(&mut next);
                for join in rebuilt.joins.iter_mut() {
                    join.on = next(&join.on);
                }
                if let Some(aggregate) = rebuilt.aggregate.as_mut() {
                    aggregate.argument = aggregate.argument.as_ref().map(&mut next);
                }
                for order in rebuilt.order_by.iter_mut() {
                    order.expr = next(&order.expr);
                }
                QueryNode::Select(Box::new(rebuilt))
            }
            QueryNode::NamedValue {
                name,
                value,
                db_type,
            } => QueryNode::NamedValue {
                name: name.clone(),
                value: next(value),
                db_type: db_type.clone(),
            },
            QueryNode::Generator {
                entity,
                entity_type,
                property,
                data_type,
            } => QueryNode::Generator {
                entity: next(entity),
                entity_type: entity_type.clone(),
                property: property.clone(),
                data_type: data_type.clone(),
            },
            QueryNode::OuterJoined { test, inner } => QueryNode::OuterJoined {
                test: next(test),
                inner: next(inner),
            },
            QueryNode::ClientJoin {
                inner_key,
                outer_key,
                projection,
            } => QueryNode::ClientJoin {
                inner_key: inner_key.iter().map(&mut next).collect(),
                outer_key: outer_key.iter().map(&mut next).collect(),
                projection: next(projection),
            },
            QueryNode::Command(command) => {
                let mut rebuilt = command.as_ref().clone();
                for assignment in rebuilt.assignments.iter_mut() {
                    assignment.value = next(&assignment.value);
                }
                if let Some(auto) = rebuilt.with_auto_increment.as_mut() {
                    auto.target = next(&auto.target);
                }
                rebuilt.predicate = command.predicate.as_ref().map(&mut next);
                QueryNode::Command(Box::new(rebuilt))
            }
        }
    }

    /// Pre-order walk over the tree.
    pub fn walk(&self, visit: &mut impl FnMut(&QueryNode)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }
}

/// Applies `f` to each direct child, rebuilding `node` only when a child changed.
pub fn map_children<E>(
    node: &NodeRef,
    mut f: impl FnMut(&NodeRef) -> Result<NodeRef, E>,
) -> Result<NodeRef, E> {
    let children = node.children();
    if children.is_empty() {
        return Ok(node.clone());
    }
    let mut changed = false;
    let mut rewritten = Vec::with_capacity(children.len());
    for child in children {
        let new_child = f(child)?;
        changed |= !Arc::ptr_eq(child, &new_child);
        rewritten.push(new_child);
    }
    if changed {
        Ok(Arc::new(node.with_children(rewritten)))
    } else {
        Ok(node.clone())
    }
}

/// Rewrites children first, then the node itself. Parents are rebuilt only when
/// at least one child changed; untouched sub-trees keep their `Arc`.
pub fn transform_up<E>(
    node: &NodeRef,
    f: &mut impl FnMut(NodeRef) -> Result<NodeRef, E>,
) -> Result<NodeRef, E> {
    let node = map_children(node, |child| transform_up(child, f))?;
    f(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn age_filter() -> NodeRef {
        SelectNode::new(SourceRef::new("Person", "t0"))
            .filter(QueryNode::binary(
                BinaryOperator::Greater,
                QueryNode::column("t0", "Age", DataType::Int32),
                QueryNode::constant(30),
            ))
            .into_node()
    }

    #[test]
    fn test_select_data_type() {
        let tree = age_filter();
        assert_eq!(
            tree.data_type(),
            DataType::List(Box::new(DataType::Entity("Person".into())))
        );
    }

    #[test]
    fn test_children_round_trip() {
        let tree = age_filter();
        let children: Vec<NodeRef> = tree.children().into_iter().cloned().collect();
        assert_eq!(children.len(), 1);
        let rebuilt = tree.with_children(children);
        assert!(matches!(rebuilt, QueryNode::Select(_)));
    }

    #[test]
    fn test_transform_up_shares_untouched_subtrees() {
        let tree = age_filter();
        let same = transform_up::<Infallible>(&tree, &mut |n| Ok(n)).unwrap();
        assert!(Arc::ptr_eq(&tree, &same));

        let rewritten = transform_up::<Infallible>(&tree, &mut |n| match n.as_ref() {
            QueryNode::Constant { .. } => Ok(QueryNode::constant(40)),
            _ => Ok(n),
        })
        .unwrap();
        assert!(!Arc::ptr_eq(&tree, &rewritten));

        let mut constants = Vec::new();
        rewritten.walk(&mut |n| {
            if let QueryNode::Constant { value, .. } = n {
                constants.push(value.clone());
            }
        });
        assert_eq!(constants, vec![Value::Int32(40)]);
    }

    #[test]
    fn test_mutating_methods() {
        assert!(MethodKind::UpdateWhere.is_mutating());
        assert!(MethodKind::RemoveWhere.is_mutating());
        assert!(!MethodKind::CacheDirective.is_mutating());
        assert!(!MethodKind::StartsWith.is_mutating());
    }

    #[test]
    fn test_command_noop_rules() {
        let insert = CommandNode::new(CommandKind::Insert, "Person");
        assert!(insert.is_noop());
        assert!(!insert.assign("Name", QueryNode::constant("Ann")).is_noop());

        let delete = CommandNode::new(CommandKind::Delete, "Person");
        assert!(delete.is_noop());
        let remove_where = delete.filter(QueryNode::constant(true));
        assert!(!remove_where.is_noop());

        let batch = CommandNode::new(CommandKind::Batch(BatchOperation::Insert), "Person")
            .assign("Name", QueryNode::parameter("item", DataType::Entity("Person".into())))
            .batch(vec![], ParamDecl::new("item", DataType::Entity("Person".into())));
        assert!(batch.is_noop());
    }
}
