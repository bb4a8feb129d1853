//! Dynamic entity values and primary keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dynamically-typed property value.
///
/// Entities store their scalar state as `Value`s, statements carry them as
/// parameters, and drivers return them inside [`Row`](crate::Row)s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Time (microseconds since midnight)
    Time(i64),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// Timestamp with timezone (microseconds since epoch, UTC)
    TimestampTz(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// Array of values
    Array(Vec<Value>),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::TimestampTz(_) => "TIMESTAMPTZ",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Array(_) => "ARRAY",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::TinyInt(v) => Some(*v != 0),
            Value::SmallInt(v) => Some(*v != 0),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::TinyInt(v) => Some(f64::from(*v)),
            Value::SmallInt(v) => Some(f64::from(*v)),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Append a canonical, type-tagged rendering of this value to `out`.
    ///
    /// Integers of every width render identically so that a key assigned as
    /// `Int(7)` and a key read back as `BigInt(7)` serialize to the same
    /// string. Strings are length-prefixed so composite keys cannot collide.
    pub fn write_key(&self, out: &mut String) {
        use std::fmt::Write;

        // Writing into a String cannot fail.
        let _ = match self {
            Value::Null => write!(out, "n"),
            Value::Bool(v) => write!(out, "b{}", u8::from(*v)),
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
                write!(out, "i{}", self.as_i64().unwrap_or_default())
            }
            Value::Float(v) => write!(out, "f{}", v),
            Value::Double(v) => write!(out, "f{}", v),
            Value::Decimal(s) => write!(out, "d{}:{}", s.len(), s),
            Value::Text(s) => write!(out, "s{}:{}", s.len(), s),
            Value::Bytes(b) => {
                let _ = write!(out, "x{}:", b.len());
                for byte in b {
                    let _ = write!(out, "{:02x}", byte);
                }
                Ok(())
            }
            Value::Date(v) => write!(out, "D{}", v),
            Value::Time(v) => write!(out, "T{}", v),
            Value::Timestamp(v) | Value::TimestampTz(v) => write!(out, "t{}", v),
            Value::Uuid(bytes) => {
                let _ = write!(out, "u");
                for byte in bytes {
                    let _ = write!(out, "{:02x}", byte);
                }
                Ok(())
            }
            Value::Json(v) => {
                let rendered = v.to_string();
                write!(out, "j{}:{}", rendered.len(), rendered)
            }
            Value::Array(items) => {
                let _ = write!(out, "a{}[", items.len());
                for item in items {
                    item.write_key(out);
                    out.push(',');
                }
                write!(out, "]")
            }
        };
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::TinyInt(v) => write!(f, "{}", v),
            Value::SmallInt(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Decimal(s) | Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(v) => write!(f, "date({})", v),
            Value::Time(v) => write!(f, "time({})", v),
            Value::Timestamp(v) | Value::TimestampTz(v) => write!(f, "timestamp({})", v),
            Value::Uuid(bytes) => {
                for byte in bytes {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Json(v) => write!(f, "{}", v),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

/// A possibly composite primary key.
///
/// Components are stored in the order of the entity's primary-key
/// properties. The serialized form is what identity maps key on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    /// Build a key from its components.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Build a single-column key.
    #[must_use]
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// Key components in primary-key order.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Consume the key, returning its components.
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the key has no components.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A key is complete when it has components and none of them is NULL.
    pub fn is_complete(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|v| !v.is_null())
    }

    /// Canonical string form used as the identity-map key.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                out.push('|');
            }
            value.write_key(&mut out);
        }
        out
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [single] = self.0.as_slice() {
            return write!(f, "{}", single);
        }
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

impl From<Value> for PrimaryKey {
    fn from(value: Value) -> Self {
        Self(vec![value])
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self::single(value)
    }
}

impl From<i32> for PrimaryKey {
    fn from(value: i32) -> Self {
        Self::single(value)
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self::single(value)
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}
