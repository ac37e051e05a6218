//! Client-side expression evaluation and free-variable analysis.
//!
//! Used by the canonicalizer to collapse closed sub-trees, by the plan
//! builder for values computed per execution, and by row materializers for
//! projection expressions that are not plain columns.

use query_core::entity::EntityRef;
use query_core::tree::{BinaryOperator, MethodKind, QueryNode, UnaryOperator};
use query_core::{DataType, QueryError, Result, Value};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Values visible to evaluation by parameter name.
pub type Bindings = HashMap<String, Value>;

pub fn evaluate(node: &QueryNode, bindings: &Bindings) -> Result<Value> {
    match node {
        QueryNode::Constant { value, .. } => Ok(value.clone()),
        QueryNode::Parameter { name, .. } => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| QueryError::MissingArgument(name.clone())),
        QueryNode::MemberAccess { target, member, .. } => {
            let target = evaluate(target, bindings)?;
            member_of(&target, member)
        }
        QueryNode::MethodCall {
            target,
            method: MethodKind::CacheDirective,
            ..
        } => match target {
            Some(target) => evaluate(target, bindings),
            None => Err(QueryError::Unsupported("cache directive without a query".into())),
        },
        QueryNode::MethodCall {
            target,
            method,
            args,
            ..
        } => {
            if method.is_mutating() {
                return Err(QueryError::Unsupported(format!(
                    "{} cannot be evaluated client-side",
                    method.name()
                )));
            }
            let target = target
                .as_ref()
                .map(|t| evaluate(t, bindings))
                .transpose()?;
            let args = args
                .iter()
                .map(|a| evaluate(a, bindings))
                .collect::<Result<Vec<_>>>()?;
            apply_method(*method, target, args)
        }
        QueryNode::Binary {
            op: BinaryOperator::And,
            left,
            right,
            ..
        } => {
            if !truthy(&evaluate(left, bindings)?) {
                return Ok(Value::Boolean(false));
            }
            Ok(Value::Boolean(truthy(&evaluate(right, bindings)?)))
        }
        QueryNode::Binary {
            op: BinaryOperator::Or,
            left,
            right,
            ..
        } => {
            if truthy(&evaluate(left, bindings)?) {
                return Ok(Value::Boolean(true));
            }
            Ok(Value::Boolean(truthy(&evaluate(right, bindings)?)))
        }
        QueryNode::Binary {
            op, left, right, ..
        } => {
            let left = evaluate(left, bindings)?;
            let right = evaluate(right, bindings)?;
            apply_binary(*op, left, right)
        }
        QueryNode::Unary { op, operand, .. } => apply_unary(*op, evaluate(operand, bindings)?),
        QueryNode::Conditional {
            test,
            if_true,
            if_false,
            ..
        } => {
            if truthy(&evaluate(test, bindings)?) {
                evaluate(if_true, bindings)
            } else {
                evaluate(if_false, bindings)
            }
        }
        QueryNode::New { ctor, members, args } => {
            let values = args
                .iter()
                .map(|a| evaluate(a, bindings))
                .collect::<Result<Vec<_>>>()?;
            construct(ctor, members.iter().cloned().zip(values).collect())
        }
        QueryNode::MemberInit { new, bindings: members } => {
            let base = evaluate(new, bindings)?;
            let values = members
                .iter()
                .map(|b| Ok((b.member.clone(), evaluate(&b.value, bindings)?)))
                .collect::<Result<Vec<_>>>()?;
            init_members(base, values)
        }
        QueryNode::NamedValue { value, .. } => evaluate(value, bindings),
        other => Err(QueryError::Unsupported(format!(
            "{} cannot be evaluated client-side",
            other.kind_name()
        ))),
    }
}

pub fn member_of(target: &Value, member: &str) -> Result<Value> {
    if target.is_null() {
        return Ok(Value::Null);
    }
    match target.member(member) {
        Some(value) => Ok(value),
        // Unset entity properties read as null
        None if matches!(target, Value::Entity(_)) => Ok(Value::Null),
        None => Err(QueryError::Unsupported(format!(
            "member {} on {}",
            member,
            target.data_type()
        ))),
    }
}

pub fn construct(ctor: &DataType, fields: Vec<(String, Value)>) -> Result<Value> {
    match ctor {
        DataType::Record => Ok(Value::Record(fields)),
        DataType::Entity(entity_type) => {
            Ok(Value::Entity(EntityRef::detached(entity_type.clone(), fields)))
        }
        other => Err(QueryError::Unsupported(format!("construction of {}", other))),
    }
}

pub fn init_members(base: Value, members: Vec<(String, Value)>) -> Result<Value> {
    match base {
        Value::Record(mut fields) => {
            for (name, value) in members {
                match fields.iter_mut().find(|(field, _)| *field == name) {
                    Some(slot) => slot.1 = value,
                    None => fields.push((name, value)),
                }
            }
            Ok(Value::Record(fields))
        }
        Value::Entity(entity) => {
            for (name, value) in members {
                entity.bind(name, value);
            }
            Ok(Value::Entity(entity))
        }
        other => Err(QueryError::Unsupported(format!(
            "member initialization of {}",
            other.data_type()
        ))),
    }
}

pub fn truthy(value: &Value) -> bool {
    matches!(value, Value::Boolean(true))
}

/// Ordering between comparable values; numeric types compare across widths.
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
        (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
        (Value::Int32(_) | Value::Int64(_), Value::Int32(_) | Value::Int64(_)) => {
            Some(left.as_i64()?.cmp(&right.as_i64()?))
        }
        (a, b) if a.data_type().is_numeric() && b.data_type().is_numeric() => {
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (Value::Utf8(a), Value::Utf8(b)) => Some(a.cmp(b)),
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::Duration(a), Value::Duration(b)) => Some(a.cmp(b)),
        (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => match compare(left, right) {
            Some(ordering) => ordering == Ordering::Equal,
            None => left == right,
        },
    }
}

pub fn apply_binary(op: BinaryOperator, left: Value, right: Value) -> Result<Value> {
    use BinaryOperator::*;

    let result = match op {
        Equal => Value::Boolean(values_equal(&left, &right)),
        NotEqual => Value::Boolean(!values_equal(&left, &right)),
        Less | LessEqual | Greater | GreaterEqual => {
            let ordering = compare(&left, &right);
            Value::Boolean(match (op, ordering) {
                (_, None) => false,
                (Less, Some(o)) => o == Ordering::Less,
                (LessEqual, Some(o)) => o != Ordering::Greater,
                (Greater, Some(o)) => o == Ordering::Greater,
                (_, Some(o)) => o != Ordering::Less,
            })
        }
        And => Value::Boolean(truthy(&left) && truthy(&right)),
        Or => Value::Boolean(truthy(&left) || truthy(&right)),
        Coalesce => {
            if left.is_null() {
                right
            } else {
                left
            }
        }
        Add | Subtract | Multiply | Divide | Modulo => arithmetic(op, left, right)?,
    };
    Ok(result)
}

fn arithmetic(op: BinaryOperator, left: Value, right: Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    let overflow = || QueryError::ExecutionError(format!("arithmetic overflow in {}", op.symbol()));

    match (&left, &right) {
        (Value::Utf8(a), Value::Utf8(b)) if op == BinaryOperator::Add => {
            Ok(Value::Utf8(format!("{}{}", a, b)))
        }
        (Value::Int32(a), Value::Int32(b)) => {
            let (a, b) = (*a, *b);
            let value = match op {
                BinaryOperator::Add => a.checked_add(b),
                BinaryOperator::Subtract => a.checked_sub(b),
                BinaryOperator::Multiply => a.checked_mul(b),
                BinaryOperator::Divide => {
                    if b == 0 {
                        return Err(QueryError::ExecutionError("division by zero".into()));
                    }
                    a.checked_div(b)
                }
                _ => {
                    if b == 0 {
                        return Err(QueryError::ExecutionError("division by zero".into()));
                    }
                    a.checked_rem(b)
                }
            };
            value.map(Value::Int32).ok_or_else(overflow)
        }
        (Value::Int32(_) | Value::Int64(_), Value::Int32(_) | Value::Int64(_)) => {
            let (a, b) = match (left.as_i64(), right.as_i64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(overflow()),
            };
            let value = match op {
                BinaryOperator::Add => a.checked_add(b),
                BinaryOperator::Subtract => a.checked_sub(b),
                BinaryOperator::Multiply => a.checked_mul(b),
                BinaryOperator::Divide => {
                    if b == 0 {
                        return Err(QueryError::ExecutionError("division by zero".into()));
                    }
                    a.checked_div(b)
                }
                _ => {
                    if b == 0 {
                        return Err(QueryError::ExecutionError("division by zero".into()));
                    }
                    a.checked_rem(b)
                }
            };
            value.map(Value::Int64).ok_or_else(overflow)
        }
        (a, b) if a.data_type().is_numeric() && b.data_type().is_numeric() => {
            let (a, b) = match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => return Err(overflow()),
            };
            Ok(Value::Float64(match op {
                BinaryOperator::Add => a + b,
                BinaryOperator::Subtract => a - b,
                BinaryOperator::Multiply => a * b,
                BinaryOperator::Divide => a / b,
                _ => a % b,
            }))
        }
        _ => Err(QueryError::TypeMismatch {
            expected: "numeric operands".into(),
            found: format!("{} {} {}", left.data_type(), op.symbol(), right.data_type()),
        }),
    }
}

pub fn apply_unary(op: UnaryOperator, operand: Value) -> Result<Value> {
    match (op, operand) {
        (UnaryOperator::IsNull, v) => Ok(Value::Boolean(v.is_null())),
        (UnaryOperator::IsNotNull, v) => Ok(Value::Boolean(!v.is_null())),
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOperator::Not, Value::Boolean(b)) => Ok(Value::Boolean(!b)),
        (UnaryOperator::Negate, Value::Int32(v)) => v
            .checked_neg()
            .map(Value::Int32)
            .ok_or_else(|| QueryError::ExecutionError("arithmetic overflow in -".into())),
        (UnaryOperator::Negate, Value::Int64(v)) => v
            .checked_neg()
            .map(Value::Int64)
            .ok_or_else(|| QueryError::ExecutionError("arithmetic overflow in -".into())),
        (UnaryOperator::Negate, Value::Float64(v)) => Ok(Value::Float64(-v)),
        (op, v) => Err(QueryError::TypeMismatch {
            expected: format!("operand of {:?}", op),
            found: v.data_type().to_string(),
        }),
    }
}

pub fn apply_method(method: MethodKind, target: Option<Value>, args: Vec<Value>) -> Result<Value> {
    let target = target.unwrap_or(Value::Null);
    if target.is_null() && method != MethodKind::Contains {
        return Ok(Value::Null);
    }
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);

    match (method, &target) {
        (MethodKind::StartsWith, Value::Utf8(s)) => {
            Ok(Value::Boolean(arg(0).as_str().map_or(false, |p| s.starts_with(p))))
        }
        (MethodKind::EndsWith, Value::Utf8(s)) => {
            Ok(Value::Boolean(arg(0).as_str().map_or(false, |p| s.ends_with(p))))
        }
        (MethodKind::Contains, Value::Utf8(s)) => {
            Ok(Value::Boolean(arg(0).as_str().map_or(false, |p| s.contains(p))))
        }
        (MethodKind::Contains, Value::List(items)) => {
            let needle = arg(0);
            Ok(Value::Boolean(items.iter().any(|item| values_equal(item, &needle))))
        }
        (MethodKind::Contains, Value::Null) => Ok(Value::Boolean(false)),
        (MethodKind::ToUpper, Value::Utf8(s)) => Ok(Value::Utf8(s.to_uppercase())),
        (MethodKind::ToLower, Value::Utf8(s)) => Ok(Value::Utf8(s.to_lowercase())),
        (MethodKind::Trim, Value::Utf8(s)) => Ok(Value::Utf8(s.trim().to_string())),
        (MethodKind::Length, Value::Utf8(s)) => Ok(Value::Int32(s.chars().count() as i32)),
        (MethodKind::Abs, Value::Int32(v)) => v
            .checked_abs()
            .map(Value::Int32)
            .ok_or_else(|| QueryError::ExecutionError("arithmetic overflow in Abs".into())),
        (MethodKind::Abs, Value::Int64(v)) => v
            .checked_abs()
            .map(Value::Int64)
            .ok_or_else(|| QueryError::ExecutionError("arithmetic overflow in Abs".into())),
        (MethodKind::Abs, Value::Float64(v)) => Ok(Value::Float64(v.abs())),
        (method, target) => Err(QueryError::Unsupported(format!(
            "{} on {}",
            method.name(),
            target.data_type()
        ))),
    }
}

/// Parameters referenced by `node` that no lambda inside it binds.
pub fn free_parameters(node: &QueryNode) -> BTreeSet<String> {
    fn visit(node: &QueryNode, bound: &mut Vec<String>, free: &mut BTreeSet<String>) {
        match node {
            QueryNode::Parameter { name, .. } => {
                if !bound.contains(name) {
                    free.insert(name.clone());
                }
            }
            QueryNode::Lambda { params, body } => {
                let depth = bound.len();
                bound.extend(params.iter().map(|p| p.name.clone()));
                visit(body, bound, free);
                bound.truncate(depth);
            }
            other => {
                for child in other.children() {
                    visit(child, bound, free);
                }
            }
        }
    }

    let mut free = BTreeSet::new();
    visit(node, &mut Vec::new(), &mut free);
    free
}

/// True when the sub-tree only contains nodes the evaluator understands,
/// i.e. no columns, relational nodes, commands or cache directives.
pub fn is_client_evaluable(node: &QueryNode) -> bool {
    let own = match node {
        QueryNode::Constant { .. }
        | QueryNode::Parameter { .. }
        | QueryNode::MemberAccess { .. }
        | QueryNode::Binary { .. }
        | QueryNode::Unary { .. }
        | QueryNode::Conditional { .. }
        | QueryNode::New { .. }
        | QueryNode::MemberInit { .. } => true,
        QueryNode::MethodCall { method, .. } => {
            !method.is_mutating() && *method != MethodKind::CacheDirective
        }
        _ => false,
    };
    own && node.children().into_iter().all(|c| is_client_evaluable(c))
}

/// A closed sub-tree has no free variables and can be evaluated once.
pub fn is_closed(node: &QueryNode) -> bool {
    is_client_evaluable(node) && free_parameters(node).is_empty()
}
