//! Structural canonicalization of query trees.
//!
//! Closed sub-trees are collapsed into constants, then every literal that
//! can travel as a command parameter is lifted into a numbered slot
//! parameter (`$0`, `$1`, ...). The slotted tree's serialization (`shape`)
//! identifies the compiled plan; the shape plus the slot values (`text`)
//! identifies the result.

use crate::eval::{self, Bindings};
use query_core::tree::{self, CommandKind, MethodKind, NodeRef, QueryNode};
use query_core::{DataType, Value};
use std::convert::Infallible;
use std::fmt::Write;

/// Prefix reserved for slot parameter names.
pub const SLOT_PREFIX: &str = "$";

#[derive(Debug, Clone)]
pub struct CanonicalForm {
    /// Folded tree with literals replaced by slot parameters
    pub tree: NodeRef,
    /// Slot values, index `i` bound to `$i`
    pub literals: Vec<Value>,
    pub shape: String,
    /// The tree embeds live entity instances
    pub holds_instances: bool,
}

impl CanonicalForm {
    /// Shape plus literal values.
    pub fn text(&self) -> String {
        let mut out = self.shape.clone();
        out.push('#');
        Value::List(self.literals.clone()).encode(&mut out);
        out
    }

    pub fn slot_bindings(&self) -> Bindings {
        self.literals
            .iter()
            .enumerate()
            .map(|(i, v)| (slot_name(i), v.clone()))
            .collect()
    }
}

pub fn slot_name(index: usize) -> String {
    format!("{}{}", SLOT_PREFIX, index)
}

pub fn canonicalize(tree: &NodeRef) -> CanonicalForm {
    let folded = fold(tree);
    let mut literals = Vec::new();
    let slotted = slot(&folded, &mut literals);

    let mut shape = String::new();
    write_node(&slotted, &mut shape);

    CanonicalForm {
        holds_instances: holds_instances(&slotted),
        tree: slotted,
        literals,
        shape,
    }
}

/// Replaces each closed sub-tree with the constant it evaluates to.
/// Sub-trees that fail to evaluate are left as they are.
fn fold(node: &NodeRef) -> NodeRef {
    if !matches!(node.as_ref(), QueryNode::Constant { .. }) && eval::is_closed(node) {
        if let Ok(value) = eval::evaluate(node, &Bindings::new()) {
            return QueryNode::typed_constant(value, node.data_type());
        }
    }
    map_children(node, &mut |child| fold(child))
}

fn slot(node: &NodeRef, literals: &mut Vec<Value>) -> NodeRef {
    match node.as_ref() {
        QueryNode::Constant { value, data_type } if is_slot_literal(value) => {
            let name = slot_name(literals.len());
            literals.push(value.clone());
            QueryNode::parameter(name, data_type.clone())
        }
        // Directive arguments are read by the analyzer and stay literal
        QueryNode::MethodCall {
            target: Some(target),
            method: MethodKind::CacheDirective,
            args,
            data_type,
        } => {
            let new_target = slot(target, literals);
            if std::sync::Arc::ptr_eq(target, &new_target) {
                return node.clone();
            }
            QueryNode::call(
                Some(new_target),
                MethodKind::CacheDirective,
                args.clone(),
                data_type.clone(),
            )
        }
        _ => map_children(node, &mut |child| slot(child, literals)),
    }
}

/// Literals that can be sent to the store as a parameter value.
pub fn is_slot_literal(value: &Value) -> bool {
    match value {
        Value::Null | Value::Record(_) | Value::Entity(_) | Value::Duration(_) => false,
        Value::List(items) => items.iter().all(|v| is_slot_literal(v) || v.is_null()),
        _ => true,
    }
}

fn map_children(node: &NodeRef, f: &mut impl FnMut(&NodeRef) -> NodeRef) -> NodeRef {
    match tree::map_children::<Infallible>(node, |child| Ok(f(child))) {
        Ok(node) => node,
        Err(never) => match never {},
    }
}

fn holds_instances(tree: &NodeRef) -> bool {
    fn value_holds(value: &Value) -> bool {
        match value {
            Value::Entity(_) => true,
            Value::List(items) => items.iter().any(value_holds),
            Value::Record(fields) => fields.iter().any(|(_, v)| value_holds(v)),
            _ => false,
        }
    }

    let mut found = false;
    tree.walk(&mut |node| match node {
        QueryNode::Constant { value, .. } => found |= value_holds(value),
        QueryNode::Command(command) => found |= command.batch.is_some(),
        _ => {}
    });
    found
}

fn write_str(out: &mut String, s: &str) {
    let _ = write!(out, "{}:{}", s.len(), s);
}

fn write_type(out: &mut String, data_type: &DataType) {
    write_str(out, &data_type.to_string());
}

fn write_node(node: &QueryNode, out: &mut String) {
    out.push('(');
    out.push_str(node.kind_name());
    out.push('|');
    write_type(out, &node.data_type());

    match node {
        QueryNode::Constant { value, .. } => {
            out.push('|');
            value.encode(out);
        }
        QueryNode::Parameter { name, .. } => {
            out.push('|');
            write_str(out, name);
        }
        QueryNode::MemberAccess { member, .. } => {
            out.push('|');
            write_str(out, member);
        }
        QueryNode::MethodCall { target, method, .. } => {
            let _ = write!(out, "|{}|{}", method.name(), target.is_some());
        }
        QueryNode::Binary { op, .. } => {
            let _ = write!(out, "|{}", op.symbol());
        }
        QueryNode::Unary { op, .. } => {
            let _ = write!(out, "|{:?}", op);
        }
        QueryNode::New { ctor, members, .. } => {
            out.push('|');
            write_type(out, ctor);
            for member in members {
                out.push(',');
                write_str(out, member);
            }
        }
        QueryNode::MemberInit { bindings, .. } => {
            for binding in bindings {
                out.push(',');
                write_str(out, &binding.member);
            }
        }
        QueryNode::Lambda { params, .. } => {
            for param in params {
                out.push(',');
                write_str(out, &param.name);
                write_type(out, &param.data_type);
            }
        }
        QueryNode::Select(select) => {
            out.push('|');
            write_str(out, &select.source.entity_type);
            write_str(out, &select.source.alias);
            let _ = write!(
                out,
                "|{:?}|{}|{}|{}{}",
                select.cardinality,
                select.distinct,
                select.paged,
                select.predicate.is_some() as u8,
                select.projection.is_some() as u8,
            );
            for join in &select.joins {
                let _ = write!(out, "|j{:?}", join.kind);
                write_str(out, &join.source.entity_type);
                write_str(out, &join.source.alias);
            }
            if let Some(aggregate) = &select.aggregate {
                let _ = write!(
                    out,
                    "|a{:?}{}",
                    aggregate.func,
                    aggregate.argument.is_some() as u8
                );
            }
            for order in &select.order_by {
                out.push_str(if order.ascending { "|asc" } else { "|desc" });
            }
        }
        QueryNode::Column {
            alias,
            name,
            map_info,
            ..
        } => {
            out.push('|');
            write_str(out, alias);
            write_str(out, name);
            if let Some(info) = map_info {
                out.push('|');
                write_str(out, &info.property);
                write_type(out, &info.db_type);
            }
        }
        QueryNode::NamedValue { name, db_type, .. } => {
            out.push('|');
            write_str(out, name);
            write_type(out, db_type);
        }
        QueryNode::Generator {
            entity_type,
            property,
            ..
        } => {
            out.push('|');
            write_str(out, entity_type);
            write_str(out, property);
        }
        QueryNode::ClientJoin {
            inner_key,
            outer_key,
            ..
        } => {
            let _ = write!(out, "|{}|{}", inner_key.len(), outer_key.len());
        }
        QueryNode::Command(command) => {
            let kind = match command.kind {
                CommandKind::Insert => "insert".to_string(),
                CommandKind::Update => "update".to_string(),
                CommandKind::Delete => "delete".to_string(),
                CommandKind::Batch(op) => format!("batch-{:?}", op),
            };
            let _ = write!(out, "|{}|", kind);
            write_str(out, &command.entity_type);
            write_str(out, &command.alias);
            for assignment in &command.assignments {
                out.push(',');
                write_str(out, &assignment.column);
            }
            if let Some(auto) = &command.with_auto_increment {
                out.push_str("|auto");
                write_str(out, &auto.column);
                write_str(out, &auto.property);
            }
            let _ = write!(out, "|{}", command.predicate.is_some() as u8);
            if let Some(batch) = &command.batch {
                out.push_str("|items");
                write_str(out, &batch.item.name);
                let items = batch.items.iter().cloned().map(Value::Entity).collect();
                Value::List(items).encode(out);
            }
        }
        QueryNode::Conditional { .. } | QueryNode::OuterJoined { .. } => {}
    }

    for child in node.children() {
        write_node(child, out);
    }
    out.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_core::tree::{BinaryOperator, CommandNode, SelectNode, SourceRef};
    use query_core::EntityRef;

    fn older_than(age: i32) -> NodeRef {
        SelectNode::new(SourceRef::new("Person", "t0"))
            .filter(QueryNode::binary(
                BinaryOperator::Greater,
                QueryNode::column("t0", "Age", DataType::Int32),
                QueryNode::binary(
                    BinaryOperator::Add,
                    QueryNode::constant(age - 1),
                    QueryNode::constant(1),
                ),
            ))
            .into_node()
    }

    #[test]
    fn test_identical_trees_have_identical_forms() {
        let a = canonicalize(&older_than(30));
        let b = canonicalize(&older_than(30));
        assert_eq!(a.shape, b.shape);
        assert_eq!(a.text(), b.text());
    }

    #[test]
    fn test_literals_are_lifted_out_of_the_shape() {
        let a = canonicalize(&older_than(30));
        let b = canonicalize(&older_than(40));
        assert_eq!(a.shape, b.shape);
        assert_ne!(a.text(), b.text());
        assert_eq!(a.literals, vec![Value::Int32(30)]);
        assert!(!a.holds_instances);
    }

    #[test]
    fn test_closed_subtrees_are_folded() {
        let form = canonicalize(&older_than(30));
        let mut parameters = Vec::new();
        form.tree.walk(&mut |n| {
            if let QueryNode::Parameter { name, .. } = n {
                parameters.push(name.clone());
            }
        });
        assert_eq!(parameters, vec!["$0".to_string()]);
    }

    #[test]
    fn test_null_literals_stay_in_the_shape() {
        let tree = QueryNode::binary(
            BinaryOperator::Equal,
            QueryNode::column("t0", "Name", DataType::Utf8.nullable()),
            QueryNode::typed_constant(Value::Null, DataType::Utf8.nullable()),
        );
        let form = canonicalize(&tree);
        assert!(form.literals.is_empty());
    }

    #[test]
    fn test_entity_constants_mark_instances() {
        let person = EntityRef::new("Person").with("Name", "Ann");
        let tree = CommandNode::new(CommandKind::Insert, "Person")
            .assign(
                "Name",
                QueryNode::member(
                    QueryNode::constant_entity(person.clone()),
                    "Name",
                    DataType::Utf8,
                ),
            )
            .auto_increment("Id", "Id", QueryNode::constant_entity(person))
            .into_node();
        let form = canonicalize(&tree);
        assert!(form.holds_instances);
        assert_eq!(form.literals, vec![Value::from("Ann")]);
    }

    #[test]
    fn test_lambda_bound_parameters_block_folding() {
        let lambda = QueryNode::lambda(
            vec![query_core::tree::ParamDecl::new("x", DataType::Int32)],
            QueryNode::binary(
                BinaryOperator::Add,
                QueryNode::parameter("x", DataType::Int32),
                QueryNode::constant(1),
            ),
        );
        let form = canonicalize(&lambda);
        assert!(matches!(form.tree.as_ref(), QueryNode::Lambda { .. }));
        assert_eq!(form.literals, vec![Value::Int32(1)]);
    }
}
