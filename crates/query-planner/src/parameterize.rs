//! Column binding and parameterization.
//!
//! Member accesses on range variables are bound to mapped columns, then
//! every value the backend has to receive (slot literals, declared
//! arguments, expressions computed from them) is replaced by a named
//! positional placeholder so one compiled plan serves any argument values.

use crate::eval::{self, Bindings};
use crate::plan::{ParamBinding, ParamSource};
use query_core::backend::{ConverterRegistry, ValueConverter};
use query_core::schema::{ColumnMap, EntityMap};
use query_core::tree::{self, ColumnMapInfo, NodeRef, QueryNode};
use query_core::{DataType, QueryError, Result, Value};
use std::sync::Arc;

/// One aliased source visible to expressions.
#[derive(Debug, Clone)]
pub struct ScopeSource {
    pub alias: String,
    pub map: EntityMap,
    /// Table name after persistence-environment overrides
    pub table: String,
}

/// Range variables visible while lowering one select or command.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    sources: Vec<ScopeSource>,
    /// Aliases of the directly enclosing select
    parent: Vec<String>,
    outer: Vec<String>,
}

impl Scope {
    /// A scope nested under `outer`. Outer aliases are reached through
    /// client-join keys or correlated placeholders.
    pub fn nested(outer: &Scope) -> Self {
        let parent: Vec<String> = outer.sources.iter().map(|s| s.alias.clone()).collect();
        let mut aliases = parent.clone();
        aliases.extend(outer.outer.iter().cloned());
        Self {
            sources: Vec::new(),
            parent,
            outer: aliases,
        }
    }

    pub fn push(&mut self, alias: impl Into<String>, map: EntityMap, table: impl Into<String>) {
        self.sources.push(ScopeSource {
            alias: alias.into(),
            map,
            table: table.into(),
        });
    }

    pub fn source(&self, alias: &str) -> Option<&ScopeSource> {
        self.sources.iter().find(|s| s.alias == alias)
    }

    pub fn is_outer(&self, alias: &str) -> bool {
        self.outer.iter().any(|a| a == alias)
    }

    pub fn is_parent(&self, alias: &str) -> bool {
        self.parent.iter().any(|a| a == alias)
    }

    fn is_range_variable(&self, name: &str) -> bool {
        self.source(name).is_some() || self.is_outer(name)
    }
}

/// Which scopes an expression reads from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reach {
    pub inner: bool,
    pub outer: bool,
    /// Reads a query further out than the direct parent
    pub distant: bool,
}

pub fn reach(node: &QueryNode, scope: &Scope) -> Reach {
    let mut reach = Reach::default();
    node.walk(&mut |n| {
        let alias = match n {
            QueryNode::Column { alias, .. } => alias,
            QueryNode::Parameter { name, .. } => name,
            _ => return,
        };
        if scope.source(alias).is_some() {
            reach.inner = true;
        } else if scope.is_outer(alias) {
            reach.outer = true;
            reach.distant |= !scope.is_parent(alias);
        }
    });
    reach
}

/// Outer-scope column or member read from inside a nested select.
pub(crate) fn outer_reference<'n>(node: &'n QueryNode, scope: &Scope) -> Option<(&'n str, String)> {
    match node {
        QueryNode::Column { alias, name, .. } if scope.source(alias).is_none() && scope.is_outer(alias) => {
            Some((alias, format!("{}.{}", alias, name)))
        }
        QueryNode::MemberAccess { target, member, .. } => match target.as_ref() {
            QueryNode::Parameter { name, .. } if scope.source(name).is_none() && scope.is_outer(name) => {
                Some((name, format!("{}.{}", name, member)))
            }
            _ => None,
        },
        _ => None,
    }
}

pub fn mapped_column(alias: &str, column: &ColumnMap) -> NodeRef {
    QueryNode::mapped_column(
        alias,
        column.column(),
        column.data_type().clone(),
        ColumnMapInfo {
            property: column.property().to_string(),
            db_type: column.db_type().clone(),
            primary_key: column.is_primary_key(),
        },
    )
}

/// Binds `alias.Member` accesses and bare columns to their mappings.
/// Nested selects and client joins are left for their own scope.
pub fn bind_columns(node: &NodeRef, scope: &Scope) -> Result<NodeRef> {
    match node.as_ref() {
        QueryNode::MemberAccess { target, member, .. } => {
            if let QueryNode::Parameter { name, .. } = target.as_ref() {
                if let Some(source) = scope.source(name) {
                    return Ok(mapped_column(name, source.map.column_for(member)?));
                }
            }
            tree::map_children(node, |child| bind_columns(child, scope))
        }
        QueryNode::Column {
            alias,
            name,
            map_info: None,
            ..
        } => match scope.source(alias) {
            Some(source) => {
                let column = source
                    .map
                    .column_named(name)
                    .or_else(|_| source.map.column_for(name))?;
                Ok(mapped_column(alias, column))
            }
            None if scope.is_outer(alias) => Ok(node.clone()),
            None => Err(QueryError::compilation(
                format!("unknown alias '{}' for column {}", alias, name),
                None,
            )),
        },
        QueryNode::Select(_) | QueryNode::ClientJoin { .. } | QueryNode::Lambda { .. } => {
            Ok(node.clone())
        }
        _ => tree::map_children(node, |child| bind_columns(child, scope)),
    }
}

/// Replaces backend-bound values with `NamedValue` placeholders and records
/// where each placeholder's value comes from at execution time.
pub struct Parameterizer<'a> {
    converters: &'a dyn ConverterRegistry,
    next: &'a mut usize,
    bindings: Vec<ParamBinding>,
    /// Outer expressions behind `OuterValue` placeholders, by slot
    correlated: Vec<(String, NodeRef)>,
}

impl<'a> Parameterizer<'a> {
    /// `next` numbers placeholders across every command of one plan.
    pub fn new(converters: &'a dyn ConverterRegistry, next: &'a mut usize) -> Self {
        Self {
            converters,
            next,
            bindings: Vec::new(),
            correlated: Vec::new(),
        }
    }

    /// Continues slot numbering from outer reads already taken by the
    /// projection.
    pub fn with_correlated(mut self, correlated: Vec<(String, NodeRef)>) -> Self {
        self.correlated = correlated;
        self
    }

    pub fn parameterize(&mut self, node: &NodeRef, scope: &Scope) -> Result<NodeRef> {
        self.rewrite(node, scope, None)
    }

    /// Parameterizes a value written to `column`, converting it to the
    /// column's storage type when a converter is registered.
    pub fn parameterize_assignment(
        &mut self,
        node: &NodeRef,
        column: &ColumnMap,
        scope: &Scope,
    ) -> Result<NodeRef> {
        let converter = self.converters.get_converter(column.data_type());
        self.rewrite(node, scope, converter)
    }

    fn rewrite(
        &mut self,
        node: &NodeRef,
        scope: &Scope,
        converter: Option<Arc<dyn ValueConverter>>,
    ) -> Result<NodeRef> {
        if let Some((alias, label)) = outer_reference(node, scope) {
            return self.correlate(node, alias, label, scope, converter);
        }
        match node.as_ref() {
            QueryNode::Column { alias, name, .. } => {
                if scope.source(alias).is_some() {
                    Ok(node.clone())
                } else {
                    Err(QueryError::compilation(
                        format!("unknown alias '{}' for column {}", alias, name),
                        None,
                    ))
                }
            }
            QueryNode::Constant { value: Value::Null, .. } => Ok(node.clone()),
            QueryNode::Parameter { name, .. } if scope.is_range_variable(name) => {
                Err(QueryError::Unsupported(format!(
                    "range variable '{}' used as a value",
                    name
                )))
            }
            QueryNode::Parameter { name, data_type } => Ok(self.bind(
                node,
                ParamSource::Bound(name.clone()),
                data_type.clone(),
                converter,
            )),
            QueryNode::Binary {
                op,
                left,
                right,
                data_type,
            } if op.is_comparison() => {
                // A value compared against a converted column travels in the
                // column's storage representation.
                let left_converter = self.column_converter(right).or_else(|| converter.clone());
                let right_converter = self.column_converter(left).or(converter);
                let new_left = self.rewrite(left, scope, left_converter)?;
                let new_right = self.rewrite(right, scope, right_converter)?;
                if Arc::ptr_eq(left, &new_left) && Arc::ptr_eq(right, &new_right) {
                    return Ok(node.clone());
                }
                Ok(Arc::new(QueryNode::Binary {
                    op: *op,
                    left: new_left,
                    right: new_right,
                    data_type: data_type.clone(),
                }))
            }
            _ if self.is_bindable(node, scope) => {
                let data_type = node.data_type();
                if let QueryNode::Constant { value, .. } = node.as_ref() {
                    if data_type.to_arrow().is_none() && !matches!(value, Value::List(_)) {
                        return Err(QueryError::Unsupported(format!(
                            "{} literal cannot be sent as a parameter",
                            data_type
                        )));
                    }
                }
                let expr = node.clone();
                let compute: Arc<dyn Fn(&Bindings) -> Result<Value> + Send + Sync> =
                    Arc::new(move |bindings| eval::evaluate(&expr, bindings));
                Ok(self.bind(node, ParamSource::Compute(compute), data_type, converter))
            }
            QueryNode::Select(_)
            | QueryNode::ClientJoin { .. }
            | QueryNode::Lambda { .. }
            | QueryNode::Command(_)
            | QueryNode::Generator { .. } => Err(QueryError::Unsupported(format!(
                "{} inside a backend expression",
                node.kind_name()
            ))),
            _ => tree::map_children(node, |child| self.rewrite(child, scope, None)),
        }
    }

    /// Placeholder for a value read from the enclosing query's row. Each
    /// distinct reference gets one slot.
    fn correlate(
        &mut self,
        node: &NodeRef,
        alias: &str,
        label: String,
        scope: &Scope,
        converter: Option<Arc<dyn ValueConverter>>,
    ) -> Result<NodeRef> {
        if !scope.is_parent(alias) {
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
        Ok(self.bind(node, ParamSource::OuterValue(slot), node.data_type(), converter))
    }

    /// Outer expressions feeding the `OuterValue` placeholders, by slot.
    pub fn correlated(&self) -> Vec<NodeRef> {
        self.correlated.iter().map(|(_, node)| node.clone()).collect()
    }

    fn is_bindable(&self, node: &QueryNode, scope: &Scope) -> bool {
        eval::is_client_evaluable(node)
            && eval::free_parameters(node)
                .iter()
                .all(|name| !scope.is_range_variable(name))
    }

    fn column_converter(&self, node: &QueryNode) -> Option<Arc<dyn ValueConverter>> {
        match node {
            QueryNode::Column {
                data_type,
                map_info: Some(_),
                ..
            } => self.converters.get_converter(data_type),
            _ => None,
        }
    }

    /// Registers a placeholder fed by `source` and returns its node.
    pub fn bind(
        &mut self,
        node: &NodeRef,
        source: ParamSource,
        db_type: DataType,
        converter: Option<Arc<dyn ValueConverter>>,
    ) -> NodeRef {
        let name = format!("p{}", *self.next);
        *self.next += 1;
        self.bindings.push(ParamBinding {
            name: name.clone(),
            source,
            db_type: db_type.clone(),
            converter,
        });
        Arc::new(QueryNode::NamedValue {
            name,
            value: node.clone(),
            db_type,
        })
    }

    /// Placeholder for the distinct values of one outer client-join key part.
    pub fn bind_outer_key(&mut self, part: usize, key_type: DataType) -> NodeRef {
        let list_type = DataType::List(Box::new(key_type));
        let value = QueryNode::parameter(format!("outer_key_{}", part), list_type.clone());
        self.bind(&value, ParamSource::OuterKey(part), list_type, None)
    }

    /// Bindings for the placeholders a translated command references, in
    /// command-text order.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<ParamBinding>> {
        names
            .iter()
            .map(|name| {
                self.bindings
                    .iter()
                    .find(|b| &b.name == name)
                    .cloned()
                    .ok_or_else(|| {
                        QueryError::compilation(
                            format!("translator referenced unknown parameter '{}'", name),
                            None,
                        )
                    })
            })
            .collect()
    }

    pub fn bindings(&self) -> &[ParamBinding] {
        &self.bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_core::backend::Converters;
    use query_core::tree::BinaryOperator;

    fn person_scope() -> Scope {
        let map = EntityMap::new(
            "Person",
            "people",
            vec![
                ColumnMap::new("Id", DataType::Int64).auto_increment(),
                ColumnMap::new("Age", DataType::Int32).with_column("age"),
            ],
        );
        let mut scope = Scope::default();
        scope.push("t0", map, "people");
        scope
    }

    fn age_over(value: NodeRef) -> NodeRef {
        QueryNode::binary(
            BinaryOperator::Greater,
            QueryNode::member(
                QueryNode::parameter("t0", DataType::Entity("Person".into())),
                "Age",
                DataType::Int32,
            ),
            value,
        )
    }

    #[test]
    fn test_member_access_binds_to_mapped_column() {
        let bound = bind_columns(&age_over(QueryNode::parameter("$0", DataType::Int32)), &person_scope())
            .unwrap();
        let QueryNode::Binary { left, .. } = bound.as_ref() else {
            panic!("expected binary");
        };
        assert!(matches!(
            left.as_ref(),
            QueryNode::Column { alias, name, map_info: Some(_), .. } if alias == "t0" && name == "age"
        ));
    }

    #[test]
    fn test_values_become_named_placeholders() {
        let scope = person_scope();
        let converters = Converters::new();
        let mut next = 0;
        let mut parameterizer = Parameterizer::new(&converters, &mut next);

        let bound = bind_columns(
            &age_over(QueryNode::binary(
                BinaryOperator::Add,
                QueryNode::parameter("min_age", DataType::Int32),
                QueryNode::parameter("$0", DataType::Int32),
            )),
            &scope,
        )
        .unwrap();
        let rewritten = parameterizer.parameterize(&bound, &scope).unwrap();

        let mut named = Vec::new();
        rewritten.walk(&mut |n| {
            if let QueryNode::NamedValue { name, .. } = n {
                named.push(name.clone());
            }
        });
        assert_eq!(named, vec!["p0".to_string()]);

        let bindings = parameterizer.resolve(&named).unwrap();
        let ParamSource::Compute(compute) = &bindings[0].source else {
            panic!("expected computed parameter");
        };
        let mut args = Bindings::new();
        args.insert("min_age".into(), Value::Int32(18));
        args.insert("$0".into(), Value::Int32(2));
        assert_eq!(compute(&args).unwrap(), Value::Int32(20));
        assert!(parameterizer.resolve(&["p9".to_string()]).is_err());
    }

    #[test]
    fn test_range_variable_cannot_be_a_value() {
        let scope = person_scope();
        let converters = Converters::new();
        let mut next = 0;
        let mut parameterizer = Parameterizer::new(&converters, &mut next);
        let err = parameterizer
            .parameterize(
                &QueryNode::parameter("t0", DataType::Entity("Person".into())),
                &scope,
            )
            .unwrap_err();
        assert!(matches!(err, QueryError::Unsupported(_)));
    }

    fn order_scope(parent: &Scope) -> Scope {
        let map = EntityMap::new(
            "Order",
            "orders",
            vec![
                ColumnMap::new("Id", DataType::Int64).primary_key(),
                ColumnMap::new("Total", DataType::Int32),
            ],
        );
        let mut scope = Scope::nested(parent);
        scope.push("t1", map, "orders");
        scope
    }

    #[test]
    fn test_outer_member_becomes_correlated_placeholder() {
        let outer = person_scope();
        let scope = order_scope(&outer);
        let converters = Converters::new();
        let mut next = 0;
        let mut parameterizer = Parameterizer::new(&converters, &mut next);
        let outer_age = QueryNode::member(
            QueryNode::parameter("t0", DataType::Entity("Person".into())),
            "Age",
            DataType::Int32,
        );
        let predicate = QueryNode::binary(
            BinaryOperator::And,
            QueryNode::binary(
                BinaryOperator::Greater,
                QueryNode::member(
                    QueryNode::parameter("t1", DataType::Entity("Order".into())),
                    "Total",
                    DataType::Int32,
                ),
                outer_age.clone(),
            ),
            QueryNode::binary(BinaryOperator::NotEqual, outer_age, QueryNode::constant(0)),
        );

        let bound = bind_columns(&predicate, &scope).unwrap();
        assert_eq!(
            reach(&bound, &scope),
            Reach {
                inner: true,
                outer: true,
                distant: false
            }
        );
        parameterizer.parameterize(&bound, &scope).unwrap();

        // Both reads of t0.Age share one slot
        let sources: Vec<_> = parameterizer
            .bindings()
            .iter()
            .map(|b| format!("{:?}", b.source))
            .collect();
        assert_eq!(sources, vec!["OuterValue(0)", "OuterValue(0)", "Compute"]);
        assert_eq!(parameterizer.correlated().len(), 1);
        assert_eq!(parameterizer.bindings()[0].db_type, DataType::Int32);
    }

    #[test]
    fn test_grandparent_reference_is_unsupported() {
        let outer = person_scope();
        let middle = order_scope(&outer);
        let mut scope = Scope::nested(&middle);
        scope.push(
            "t2",
            EntityMap::new("Tag", "tags", vec![ColumnMap::new("Id", DataType::Int64).primary_key()]),
            "tags",
        );
        let converters = Converters::new();
        let mut next = 0;
        let mut parameterizer = Parameterizer::new(&converters, &mut next);

        let err = parameterizer
            .parameterize(
                &QueryNode::member(
                    QueryNode::parameter("t0", DataType::Entity("Person".into())),
                    "Age",
                    DataType::Int32,
                ),
                &scope,
            )
            .unwrap_err();
        assert!(matches!(err, QueryError::Unsupported(_)));
        assert!(scope.is_outer("t0") && !scope.is_parent("t0"));
    }
}
