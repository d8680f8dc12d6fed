//! Type descriptors and record values.
//!
//! K_i: Every record flowing through a collection conforms to its descriptor.
//! K_i: A descriptor is structural; two descriptors with the same shape are
//! the same type, and share a fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Name given to the single field of a non-struct descriptor.
pub const SCALAR_FIELD: &str = "value";

/// Logical type of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "of", rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    Float64,
    Utf8,
    Binary,
    Nullable(Box<DataType>),
    List(Box<DataType>),
    Struct(Vec<Field>),
    /// Engine-native type with no binary or structural mapping.
    Opaque(String),
}

/// Named field of a struct type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

impl DataType {
    pub fn nullable(inner: DataType) -> Self {
        match inner {
            DataType::Nullable(_) => inner,
            other => DataType::Nullable(Box::new(other)),
        }
    }

    pub fn list(element: DataType) -> Self {
        DataType::List(Box::new(element))
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, DataType::Nullable(_))
    }

    /// Strip one level of nullability.
    pub fn non_null(&self) -> &DataType {
        match self {
            DataType::Nullable(inner) => inner,
            other => other,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64 | DataType::Float64)
    }

    /// Find the first opaque type nested anywhere in this type.
    pub fn find_opaque(&self) -> Option<&str> {
        match self {
            DataType::Opaque(name) => Some(name),
            DataType::Nullable(inner) | DataType::List(inner) => inner.find_opaque(),
            DataType::Struct(fields) => fields.iter().find_map(|f| f.data_type.find_opaque()),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "bool"),
            DataType::Int32 => write!(f, "i32"),
            DataType::Int64 => write!(f, "i64"),
            DataType::Float64 => write!(f, "f64"),
            DataType::Utf8 => write!(f, "String"),
            DataType::Binary => write!(f, "Vec<u8>"),
            DataType::Nullable(inner) => write!(f, "Option<{inner}>"),
            DataType::List(inner) => write!(f, "Vec<{inner}>"),
            DataType::Struct(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.data_type)?;
                }
                write!(f, "}}")
            }
            DataType::Opaque(name) => write!(f, "opaque<{name}>"),
        }
    }
}

/// Structural description of the records in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    root: DataType,
}

impl TypeDescriptor {
    pub fn new(root: DataType) -> Self {
        Self { root }
    }

    /// Descriptor for records with named fields.
    pub fn record<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, DataType)>,
        S: Into<String>,
    {
        Self::new(DataType::Struct(
            fields
                .into_iter()
                .map(|(name, ty)| Field::new(name, ty))
                .collect(),
        ))
    }

    /// Descriptor for a collection of bare values.
    pub fn scalar(data_type: DataType) -> Self {
        Self::new(data_type)
    }

    pub fn root(&self) -> &DataType {
        &self.root
    }

    pub fn is_record(&self) -> bool {
        matches!(self.root, DataType::Struct(_))
    }

    /// Top-level fields; a non-struct root is exposed as one `value` field.
    pub fn fields(&self) -> Vec<Field> {
        match &self.root {
            DataType::Struct(fields) => fields.clone(),
            other => vec![Field::new(SCALAR_FIELD, other.clone())],
        }
    }

    pub fn field_count(&self) -> usize {
        match &self.root {
            DataType::Struct(fields) => fields.len(),
            _ => 1,
        }
    }

    /// Stable 64-bit identity of this descriptor's shape, hashed from its
    /// canonical JSON form.
    pub fn fingerprint(&self) -> u64 {
        let canonical = serde_json::to_vec(&self.root)
            .unwrap_or_else(|_| self.root.to_string().into_bytes());
        let digest = Sha256::digest(&canonical);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}

/// A single record value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Binary(Vec<u8>),
    List(Vec<Value>),
    Struct(Vec<Value>),
}

impl Value {
    /// Build a struct value from its field values in order.
    pub fn record(values: impl IntoIterator<Item = Value>) -> Self {
        Value::Struct(values.into_iter().collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
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

    /// Check that this value has exactly the shape of `data_type`.
    pub fn conforms_to(&self, data_type: &DataType) -> bool {
        match (self, data_type) {
            (Value::Null, DataType::Nullable(_)) => true,
            (value, DataType::Nullable(inner)) => value.conforms_to(inner),
            (Value::Bool(_), DataType::Bool)
            | (Value::Int32(_), DataType::Int32)
            | (Value::Int64(_), DataType::Int64)
            | (Value::Float64(_), DataType::Float64)
            | (Value::Utf8(_), DataType::Utf8)
            | (Value::Binary(_), DataType::Binary) => true,
            (Value::List(items), DataType::List(element)) => {
                items.iter().all(|item| item.conforms_to(element))
            }
            (Value::Struct(values), DataType::Struct(fields)) => {
                values.len() == fields.len()
                    && values
                        .iter()
                        .zip(fields)
                        .all(|(v, f)| v.conforms_to(&f.data_type))
            }
            _ => false,
        }
    }

    /// Render as JSON, using the descriptor to name struct fields.
    pub fn to_json(&self, data_type: &DataType) -> serde_json::Value {
        use serde_json::Value as Json;
        match (self, data_type.non_null()) {
            (Value::Null, _) => Json::Null,
            (Value::Bool(b), _) => Json::Bool(*b),
            (Value::Int32(v), _) => Json::from(*v),
            (Value::Int64(v), _) => Json::from(*v),
            (Value::Float64(v), _) => Json::from(*v),
            (Value::Utf8(s), _) => Json::String(s.clone()),
            (Value::Binary(bytes), _) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
            (Value::List(items), DataType::List(element)) => {
                Json::Array(items.iter().map(|item| item.to_json(element)).collect())
            }
            (Value::Struct(values), DataType::Struct(fields)) => Json::Object(
                values
                    .iter()
                    .zip(fields)
                    .map(|(v, f)| (f.name.clone(), v.to_json(&f.data_type)))
                    .collect(),
            ),
            // Shape disagrees with the descriptor; render positionally.
            (Value::List(items), other) | (Value::Struct(items), other) => {
                Json::Array(items.iter().map(|item| item.to_json(other)).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
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

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int32(v) => write!(f, "{v}i32"),
            Value::Int64(v) => write!(f, "{v}i64"),
            Value::Float64(v) => write!(f, "{v:?}f64"),
            Value::Utf8(s) => write!(f, "{s:?}"),
            Value::Binary(bytes) => write!(f, "{bytes:?}"),
            Value::List(items) | Value::Struct(items) => {
                let (open, close) = match self {
                    Value::List(_) => ("[", "]"),
                    _ => ("(", ")"),
                };
                write!(f, "{open}")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "{close}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> TypeDescriptor {
        TypeDescriptor::record([("x", DataType::Int64), ("y", DataType::Int64)])
    }

    #[test]
    fn test_fingerprint_is_structural() {
        assert_eq!(point().fingerprint(), point().fingerprint());
        let renamed = TypeDescriptor::record([("x", DataType::Int64), ("z", DataType::Int64)]);
        assert_ne!(point().fingerprint(), renamed.fingerprint());
    }

    #[test]
    fn test_fingerprint_separates_lookalike_field_names() {
        let two = TypeDescriptor::record([("a", DataType::Int64), ("b", DataType::Int64)]);
        let one = TypeDescriptor::record([("a: i64, b", DataType::Int64)]);
        assert_eq!(two.to_string(), one.to_string());
        assert_ne!(two.fingerprint(), one.fingerprint());
    }

    #[test]
    fn test_scalar_descriptor_exposes_value_field() {
        let desc = TypeDescriptor::scalar(DataType::Int64);
        let fields = desc.fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, SCALAR_FIELD);
        assert!(!desc.is_record());
    }

    #[test]
    fn test_conforms_to() {
        let desc = point();
        assert!(Value::record([Value::Int64(1), Value::Int64(2)]).conforms_to(desc.root()));
        assert!(!Value::record([Value::Int64(1)]).conforms_to(desc.root()));
        assert!(!Value::record([Value::Int32(1), Value::Int64(2)]).conforms_to(desc.root()));

        let nullable = DataType::nullable(DataType::Utf8);
        assert!(Value::Null.conforms_to(&nullable));
        assert!(Value::Utf8("a".into()).conforms_to(&nullable));
        assert!(!Value::Null.conforms_to(&DataType::Utf8));
    }

    #[test]
    fn test_find_opaque_nested() {
        let ty = DataType::Struct(vec![
            Field::new("a", DataType::Int32),
            Field::new("b", DataType::list(DataType::Opaque("Geometry".into()))),
        ]);
        assert_eq!(ty.find_opaque(), Some("Geometry"));
        assert_eq!(point().root().find_opaque(), None);
    }

    #[test]
    fn test_to_json_names_fields() {
        let json = Value::record([Value::Int64(3), Value::Int64(4)]).to_json(point().root());
        assert_eq!(json, serde_json::json!({"x": 3, "y": 4}));
    }

    #[test]
    fn test_descriptor_serde_roundtrip() {
        let desc = TypeDescriptor::record([
            ("id", DataType::Int64),
            ("tags", DataType::list(DataType::Utf8)),
            ("note", DataType::nullable(DataType::Utf8)),
        ]);
        let json = serde_json::to_string(&desc).unwrap();
        let back: TypeDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(desc, back);
    }
}
