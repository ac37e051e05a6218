use crate::entity::EntityRef;
use crate::error::{QueryError, Result};
use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float64Array, Int32Array, Int64Array, NullArray,
    StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType as ArrowDataType, TimeUnit};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Float64,
    Utf8,
    Binary,
    Timestamp,
    Duration,
    Null,
    Nullable(Box<DataType>),
    List(Box<DataType>),
    // Mapped entity type, by name
    Entity(String),
    // Anonymous projection record
    Record,
}

impl DataType {
    pub fn nullable(self) -> Self {
        match self {
            DataType::Nullable(_) => self,
            other => DataType::Nullable(Box::new(other)),
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, DataType::Nullable(_) | DataType::Null)
    }

    /// The underlying type with any nullable wrapper removed.
    pub fn non_null(&self) -> &DataType {
        match self {
            DataType::Nullable(inner) => inner.non_null(),
            other => other,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.non_null(),
            DataType::Int32 | DataType::Int64 | DataType::Float64
        )
    }

    pub fn is_string(&self) -> bool {
        matches!(self.non_null(), DataType::Utf8)
    }

    /// Arrow storage type for values that can live in a column, `None` otherwise.
    pub fn to_arrow(&self) -> Option<ArrowDataType> {
        match self.non_null() {
            DataType::Boolean => Some(ArrowDataType::Boolean),
            DataType::Int32 => Some(ArrowDataType::Int32),
            DataType::Int64 => Some(ArrowDataType::Int64),
            DataType::Float64 => Some(ArrowDataType::Float64),
            DataType::Utf8 => Some(ArrowDataType::Utf8),
            DataType::Binary => Some(ArrowDataType::Binary),
            DataType::Timestamp => Some(ArrowDataType::Timestamp(TimeUnit::Microsecond, None)),
            DataType::Null => Some(ArrowDataType::Null),
            DataType::Duration
            | DataType::Nullable(_)
            | DataType::List(_)
            | DataType::Entity(_)
            | DataType::Record => None,
        }
    }

    pub fn from_arrow(dt: &ArrowDataType) -> Self {
        match dt {
            ArrowDataType::Boolean => DataType::Boolean,
            ArrowDataType::Int32 => DataType::Int32,
            ArrowDataType::Int64 => DataType::Int64,
            ArrowDataType::Float64 => DataType::Float64,
            ArrowDataType::Utf8 | ArrowDataType::LargeUtf8 => DataType::Utf8,
            ArrowDataType::Binary | ArrowDataType::LargeBinary => DataType::Binary,
            ArrowDataType::Timestamp(_, _) => DataType::Timestamp,
            _ => DataType::Null,
        }
    }

    /// Value produced for this type when an outer join matched nothing.
    pub fn default_value(&self) -> Value {
        match self {
            DataType::Boolean => Value::Boolean(false),
            DataType::Int32 => Value::Int32(0),
            DataType::Int64 => Value::Int64(0),
            DataType::Float64 => Value::Float64(0.0),
            DataType::Duration => Value::Duration(Duration::ZERO),
            DataType::List(_) => Value::List(Vec::new()),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "bool"),
            DataType::Int32 => write!(f, "i32"),
            DataType::Int64 => write!(f, "i64"),
            DataType::Float64 => write!(f, "f64"),
            DataType::Utf8 => write!(f, "utf8"),
            DataType::Binary => write!(f, "binary"),
            DataType::Timestamp => write!(f, "timestamp"),
            DataType::Duration => write!(f, "duration"),
            DataType::Null => write!(f, "null"),
            DataType::Nullable(inner) => write!(f, "{}?", inner),
            DataType::List(inner) => write!(f, "list<{}>", inner),
            DataType::Entity(name) => write!(f, "entity<{}>", name),
            DataType::Record => write!(f, "record"),
        }
    }
}

/// Runtime value flowing through trees, parameters and materialized rows.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
    /// Microseconds since the unix epoch
    Timestamp(i64),
    Duration(Duration),
    List(Vec<Value>),
    Record(Vec<(String, Value)>),
    Entity(EntityRef),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Boolean(_) => DataType::Boolean,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float64(_) => DataType::Float64,
            Value::Utf8(_) => DataType::Utf8,
            Value::Binary(_) => DataType::Binary,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Duration(_) => DataType::Duration,
            Value::List(items) => DataType::List(Box::new(
                items.first().map(Value::data_type).unwrap_or(DataType::Null),
            )),
            Value::Record(_) => DataType::Record,
            Value::Entity(entity) => DataType::Entity(entity.entity_type()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for values a generated key may overwrite.
    pub fn is_empty_key(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Utf8(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(f64::from(*v)),
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Value::Entity(e) => Some(e),
            _ => None,
        }
    }

    /// Member lookup on records and entities.
    pub fn member(&self, name: &str) -> Option<Value> {
        match self {
            Value::Record(fields) => fields
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, v)| v.clone()),
            Value::Entity(entity) => entity.value(name),
            Value::Utf8(s) if name == "Length" => Some(Value::Int32(s.chars().count() as i32)),
            Value::List(items) if name == "Count" => Some(Value::Int32(items.len() as i32)),
            _ => None,
        }
    }

    /// Converts the value to the requested column type where a lossless or
    /// widening conversion exists.
    pub fn coerce(&self, target: &DataType) -> Result<Value> {
        let target = target.non_null();
        let coerced = match (self, target) {
            (Value::Null, _) => Value::Null,
            (Value::Int32(v), DataType::Int64) => Value::Int64(i64::from(*v)),
            (Value::Int32(v), DataType::Float64) => Value::Float64(f64::from(*v)),
            (Value::Int64(v), DataType::Float64) => Value::Float64(*v as f64),
            (Value::Int64(v), DataType::Int32) => {
                Value::Int32(i32::try_from(*v).map_err(|_| QueryError::TypeMismatch {
                    expected: target.to_string(),
                    found: format!("{} (out of range)", v),
                })?)
            }
            (v, t) if &v.data_type() == t => v.clone(),
            (v, t) => {
                return Err(QueryError::TypeMismatch {
                    expected: t.to_string(),
                    found: v.data_type().to_string(),
                })
            }
        };
        Ok(coerced)
    }

    /// Total, order-preserving literal encoding used for canonical forms and keys.
    ///
    /// Strings and binary payloads are length-prefixed so that no two distinct
    /// values share an encoding.
    pub fn encode(&self, out: &mut String) {
        match self {
            Value::Null => out.push('N'),
            Value::Boolean(b) => out.push_str(if *b { "T" } else { "F" }),
            Value::Int32(v) => {
                out.push_str("i");
                out.push_str(&v.to_string());
                out.push(';');
            }
            Value::Int64(v) => {
                out.push_str("l");
                out.push_str(&v.to_string());
                out.push(';');
            }
            Value::Float64(v) => {
                out.push_str("d");
                out.push_str(&format!("{:016x}", v.to_bits()));
            }
            Value::Utf8(s) => {
                out.push_str(&format!("s{}:", s.len()));
                out.push_str(s);
            }
            Value::Binary(b) => {
                out.push_str(&format!("b{}:", b.len()));
                for byte in b {
                    out.push_str(&format!("{:02x}", byte));
                }
            }
            Value::Timestamp(v) => {
                out.push_str("t");
                out.push_str(&v.to_string());
                out.push(';');
            }
            Value::Duration(d) => {
                out.push_str(&format!("u{}.{};", d.as_secs(), d.subsec_nanos()));
            }
            Value::List(items) => {
                out.push_str(&format!("[{}", items.len()));
                for item in items {
                    out.push(',');
                    item.encode(out);
                }
                out.push(']');
            }
            Value::Record(fields) => {
                out.push_str(&format!("{{{}", fields.len()));
                for (name, value) in fields {
                    out.push_str(&format!(",{}:{}=", name.len(), name));
                    value.encode(out);
                }
                out.push('}');
            }
            Value::Entity(entity) => {
                let entity_type = entity.entity_type();
                out.push_str(&format!("E{}:{}", entity_type.len(), entity_type));
                let mut props = entity.values();
                props.sort_by(|a, b| a.0.cmp(&b.0));
                Value::Record(props).encode(out);
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Utf8(a), Value::Utf8(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Duration(a), Value::Duration(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Entity(a), Value::Entity(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(b) => b.hash(state),
            Value::Int32(v) => v.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Utf8(s) => s.hash(state),
            Value::Binary(b) => b.hash(state),
            Value::Timestamp(v) => v.hash(state),
            Value::Duration(d) => d.hash(state),
            Value::List(items) => items.hash(state),
            Value::Record(fields) => fields.hash(state),
            Value::Entity(entity) => entity.addr().hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Utf8(v)
    }
}

impl From<Duration> for Value {
    fn from(v: Duration) -> Self {
        Value::Duration(v)
    }
}

/// Builds an Arrow column of `data_type` from row values, used for batch
/// parameter sets.
pub fn values_to_array(data_type: &DataType, values: &[Value]) -> Result<ArrayRef> {
    let mismatch = |v: &Value| QueryError::TypeMismatch {
        expected: data_type.to_string(),
        found: v.data_type().to_string(),
    };

    let array: ArrayRef = match data_type.non_null() {
        DataType::Boolean => {
            let items: Result<Vec<Option<bool>>> = values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Boolean(b) => Ok(Some(*b)),
                    other => Err(mismatch(other)),
                })
                .collect();
            Arc::new(BooleanArray::from(items?))
        }
        DataType::Int32 => {
            let items: Result<Vec<Option<i32>>> = values
                .iter()
                .map(|v| match v.coerce(&DataType::Int32)? {
                    Value::Null => Ok(None),
                    Value::Int32(i) => Ok(Some(i)),
                    other => Err(mismatch(&other)),
                })
                .collect();
            Arc::new(Int32Array::from(items?))
        }
        DataType::Int64 => {
            let items: Result<Vec<Option<i64>>> = values
                .iter()
                .map(|v| match v.coerce(&DataType::Int64)? {
                    Value::Null => Ok(None),
                    Value::Int64(i) => Ok(Some(i)),
                    other => Err(mismatch(&other)),
                })
                .collect();
            Arc::new(Int64Array::from(items?))
        }
        DataType::Float64 => {
            let items: Result<Vec<Option<f64>>> = values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    other => other.as_f64().map(Some).ok_or_else(|| mismatch(other)),
                })
                .collect();
            Arc::new(Float64Array::from(items?))
        }
        DataType::Utf8 => {
            let items: Result<Vec<Option<&str>>> = values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Utf8(s) => Ok(Some(s.as_str())),
                    other => Err(mismatch(other)),
                })
                .collect();
            Arc::new(StringArray::from(items?))
        }
        DataType::Binary => {
            let items: Result<Vec<Option<&[u8]>>> = values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Binary(b) => Ok(Some(b.as_slice())),
                    other => Err(mismatch(other)),
                })
                .collect();
            Arc::new(BinaryArray::from(items?))
        }
        DataType::Timestamp => {
            let items: Result<Vec<Option<i64>>> = values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Timestamp(t) => Ok(Some(*t)),
                    other => Err(mismatch(other)),
                })
                .collect();
            Arc::new(TimestampMicrosecondArray::from(items?))
        }
        DataType::Null => Arc::new(NullArray::new(values.len())),
        other => return Err(QueryError::TypeIncompatible(other.clone())),
    };

    debug_assert_eq!(array.len(), values.len());
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nullable_wrapping() {
        let dt = DataType::Int32.nullable();
        assert!(dt.is_nullable());
        assert_eq!(dt.non_null(), &DataType::Int32);
        assert_eq!(dt.clone().nullable(), dt);
    }

    #[test]
    fn test_encode_is_length_prefixed() {
        let mut a = String::new();
        Value::List(vec![Value::from("a,b"), Value::from("c")]).encode(&mut a);
        let mut b = String::new();
        Value::List(vec![Value::from("a"), Value::from("b,c")]).encode(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_float_equality_uses_bits() {
        assert_eq!(Value::Float64(1.5), Value::Float64(1.5));
        assert_ne!(Value::Float64(0.0), Value::Float64(-0.0));
    }

    #[test]
    fn test_coerce_widens_integers() {
        assert_eq!(
            Value::Int32(7).coerce(&DataType::Int64).unwrap(),
            Value::Int64(7)
        );
        assert!(Value::from("x").coerce(&DataType::Int64).is_err());
    }

    #[test]
    fn test_values_to_array() {
        let array = values_to_array(
            &DataType::Utf8.nullable(),
            &[Value::from("Ann"), Value::Null],
        )
        .unwrap();
        assert_eq!(array.len(), 2);
        assert!(array.is_null(1));

        let err = values_to_array(&DataType::Record, &[]).unwrap_err();
        assert!(matches!(err, QueryError::TypeIncompatible(_)));
    }
}
