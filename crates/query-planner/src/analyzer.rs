//! Cacheability analysis: runs before any cache lookup.

use query_core::tree::{MethodKind, QueryNode};
use query_core::{DataType, Value};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cacheability {
    /// Set by an inline cache directive
    pub enabled: Option<bool>,
    pub expiry: Option<Duration>,
    /// False when the query mutates data; such queries never read or
    /// populate the result cache.
    pub required: bool,
    pub mutated_types: BTreeSet<String>,
    /// Every entity type the query reads or writes
    pub touched_types: BTreeSet<String>,
}

impl Default for Cacheability {
    fn default() -> Self {
        Self {
            enabled: None,
            expiry: None,
            required: true,
            mutated_types: BTreeSet::new(),
            touched_types: BTreeSet::new(),
        }
    }
}

impl Cacheability {
    pub fn is_mutating(&self) -> bool {
        !self.mutated_types.is_empty() || !self.required
    }
}

/// Pre-order walk collecting mutation markers, cache directives and
/// entity types. When several directives are present the last one visited
/// wins.
pub fn analyze(tree: &QueryNode) -> Cacheability {
    let mut result = Cacheability::default();

    tree.walk(&mut |node| match node {
        QueryNode::Command(command) => {
            result.required = false;
            result.mutated_types.insert(command.entity_type.clone());
            result.touched_types.insert(command.entity_type.clone());
        }
        QueryNode::MethodCall {
            method: MethodKind::CacheDirective,
            args,
            ..
        } => {
            if let Some(QueryNode::Constant {
                value: Value::Boolean(enabled),
                ..
            }) = args.first().map(|a| a.as_ref())
            {
                result.enabled = Some(*enabled);
            }
            if let Some(QueryNode::Constant {
                value: Value::Duration(expiry),
                ..
            }) = args.get(1).map(|a| a.as_ref())
            {
                result.expiry = Some(*expiry);
            }
        }
        QueryNode::MethodCall {
            target,
            method,
            args,
            ..
        } if method.is_mutating() => {
            result.required = false;
            let entity_type = target
                .iter()
                .chain(args.iter())
                .find_map(|n| entity_type_of(&n.data_type()));
            if let Some(entity_type) = entity_type {
                result.touched_types.insert(entity_type.clone());
                result.mutated_types.insert(entity_type);
            }
        }
        QueryNode::Select(select) => {
            result.touched_types.insert(select.source.entity_type.clone());
            for join in &select.joins {
                result.touched_types.insert(join.source.entity_type.clone());
            }
        }
        _ => {}
    });

    result
}

fn entity_type_of(data_type: &DataType) -> Option<String> {
    match data_type.non_null() {
        DataType::Entity(name) => Some(name.clone()),
        DataType::List(inner) => entity_type_of(inner),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_core::tree::{
        BinaryOperator, CommandKind, CommandNode, JoinKind, SelectNode, SourceRef,
    };

    fn people() -> SelectNode {
        SelectNode::new(SourceRef::new("Person", "t0"))
    }

    #[test]
    fn test_plain_select_is_cacheable() {
        let tree = people()
            .join(
                JoinKind::Left,
                SourceRef::new("Order", "t1"),
                QueryNode::binary(
                    BinaryOperator::Equal,
                    QueryNode::column("t0", "Id", DataType::Int64),
                    QueryNode::column("t1", "PersonId", DataType::Int64),
                ),
            )
            .into_node();
        let analysis = analyze(&tree);
        assert!(analysis.required);
        assert_eq!(analysis.enabled, None);
        assert_eq!(
            analysis.touched_types.into_iter().collect::<Vec<_>>(),
            vec!["Order".to_string(), "Person".to_string()]
        );
    }

    #[test]
    fn test_commands_are_not_cacheable() {
        let tree = CommandNode::new(CommandKind::Update, "Person")
            .assign("Name", QueryNode::constant("Bob"))
            .filter(QueryNode::constant(true))
            .into_node();
        let analysis = analyze(&tree);
        assert!(!analysis.required);
        assert!(analysis.mutated_types.contains("Person"));
    }

    #[test]
    fn test_mutating_method_call_records_target_type() {
        let tree = QueryNode::call(
            Some(people().into_node()),
            MethodKind::RemoveWhere,
            vec![],
            DataType::Int64,
        );
        let analysis = analyze(&tree);
        assert!(!analysis.required);
        assert!(analysis.mutated_types.contains("Person"));
    }

    #[test]
    fn test_last_directive_wins() {
        let inner = QueryNode::cache_directive(
            people().into_node(),
            false,
            Some(Duration::from_secs(5)),
        );
        let outer = QueryNode::cache_directive(inner, true, None);
        let analysis = analyze(&outer);
        // pre-order: outer visited first, inner last
        assert_eq!(analysis.enabled, Some(false));
        assert_eq!(analysis.expiry, Some(Duration::from_secs(5)));
    }
}
