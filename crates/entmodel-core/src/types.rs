//! Semantic property types and value comparison.

use crate::Result;
use crate::value::Value;
use std::fmt;

/// Semantic type of an entity property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Decimal,
    Text,
    Bytes,
    Date,
    Time,
    Timestamp,
    Uuid,
    Json,
}

impl PropertyType {
    /// Get the type name.
    pub const fn name(self) -> &'static str {
        match self {
            PropertyType::Boolean => "boolean",
            PropertyType::Integer => "integer",
            PropertyType::BigInt => "bigint",
            PropertyType::Double => "double",
            PropertyType::Decimal => "decimal",
            PropertyType::Text => "text",
            PropertyType::Bytes => "bytes",
            PropertyType::Date => "date",
            PropertyType::Time => "time",
            PropertyType::Timestamp => "timestamp",
            PropertyType::Uuid => "uuid",
            PropertyType::Json => "json",
        }
    }

    /// Default equality used when diffing a property against its snapshot.
    ///
    /// Drivers normalize values on the way back from the database: integers
    /// widen, decimals lose or gain trailing zeros and JSON objects come back
    /// with arbitrary key order. Values that differ only in such ways are
    /// treated as equal.
    pub fn values_equal(self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => return true,
            (Value::Null, _) | (_, Value::Null) => return false,
            _ => {}
        }
        match self {
            PropertyType::Integer | PropertyType::BigInt => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            PropertyType::Double => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.to_bits() == y.to_bits() || x == y,
                _ => a == b,
            },
            PropertyType::Decimal => {
                match (
                    a.as_str().and_then(normalize_decimal),
                    b.as_str().and_then(normalize_decimal),
                ) {
                    (Some(x), Some(y)) => x == y,
                    _ => match (a.as_f64(), b.as_f64()) {
                        (Some(x), Some(y)) => x == y,
                        _ => a == b,
                    },
                }
            }
            PropertyType::Json => match (as_json(a), as_json(b)) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            PropertyType::Timestamp => match (a, b) {
                (
                    Value::Timestamp(x) | Value::TimestampTz(x),
                    Value::Timestamp(y) | Value::TimestampTz(y),
                ) => x == y,
                _ => a == b,
            },
            _ => a == b,
        }
    }
}

fn as_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Json(v) => Some(v.clone()),
        Value::Text(s) => serde_json::from_str(s).ok(),
        _ => None,
    }
}

/// Normalize a decimal literal: strip sign of zero, leading integer zeros and
/// trailing fraction zeros. Returns `None` for anything that is not a plain
/// decimal literal.
fn normalize_decimal(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let is_zero = int_part == "0" && frac_part.is_empty();
    let mut out = String::new();
    if negative && !is_zero {
        out.push('-');
    }
    out.push_str(int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    Some(out)
}

/// Pluggable value conversion and comparison for custom-typed properties.
///
/// The session treats implementations as a black box: `compare` decides
/// whether a property changed, `to_database` runs when a value is bound into
/// a statement, and `from_database` runs when a row is hydrated.
pub trait CustomType: Send + Sync + fmt::Debug {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Whether two in-memory values are equal for change detection.
    fn compare(&self, a: &Value, b: &Value) -> bool {
        a == b
    }

    /// Convert an in-memory value to its database representation.
    #[allow(clippy::result_large_err)]
    fn to_database(&self, value: &Value) -> Result<Value> {
        Ok(value.clone())
    }

    /// Convert a database value to its in-memory representation.
    #[allow(clippy::result_large_err)]
    fn from_database(&self, value: &Value) -> Result<Value> {
        Ok(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_equality_ignores_trailing_zeros() {
        let t = PropertyType::Decimal;
        assert!(t.values_equal(&Value::Decimal("10.50".into()), &Value::Decimal("10.5".into())));
        assert!(t.values_equal(&Value::Decimal("007".into()), &Value::Decimal("7.000".into())));
        assert!(t.values_equal(&Value::Decimal("-0.0".into()), &Value::Decimal("0".into())));
        assert!(!t.values_equal(&Value::Decimal("10.5".into()), &Value::Decimal("10.51".into())));
    }

    #[test]
    fn json_equality_ignores_key_order() {
        let t = PropertyType::Json;
        let a = Value::Json(serde_json::json!({"a": 1, "b": [1, 2]}));
        let b = Value::Text(r#"{"b":[1,2],"a":1}"#.to_string());
        assert!(t.values_equal(&a, &b));
        let c = Value::Json(serde_json::json!({"a": 2, "b": [1, 2]}));
        assert!(!t.values_equal(&a, &c));
    }

    #[test]
    fn integer_widths_compare_equal() {
        assert!(PropertyType::BigInt.values_equal(&Value::Int(4), &Value::BigInt(4)));
        assert!(!PropertyType::BigInt.values_equal(&Value::Int(4), &Value::Null));
        assert!(PropertyType::Text.values_equal(&Value::Null, &Value::Null));
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert_eq!(normalize_decimal("abc"), None);
        assert_eq!(normalize_decimal("."), None);
        assert_eq!(normalize_decimal("+1.20").as_deref(), Some("1.2"));
    }
}
