//! Conversions between JSON row values and bound SQL parameters.

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqliteValue, ValueRef};
use serde_json::{Number, Value};

use super::DriverError;
use crate::catalog::{ColumnDef, ColumnType};

/// A parameter ready to be bound to either engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL of the given column type (PostgreSQL binds typed NULLs).
    Null(ColumnType),
    Int(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl SqlValue {
    /// Coerce a JSON value into the column's type.
    pub fn coerce(value: &Value, column: &ColumnDef) -> Result<Self, DriverError> {
        let invalid = |reason: &str| DriverError::InvalidValue {
            column: column.name.to_string(),
            reason: reason.to_string(),
        };

        if value.is_null() {
            return Ok(SqlValue::Null(column.ty));
        }

        match column.ty {
            ColumnType::Text | ColumnType::Timestamp => Ok(SqlValue::Text(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            ColumnType::Integer => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(SqlValue::Int)
                    .ok_or_else(|| invalid("not an integer")),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(SqlValue::Int)
                    .map_err(|_| invalid("not an integer")),
                Value::Bool(b) => Ok(SqlValue::Int(i64::from(*b))),
                _ => Err(invalid("not an integer")),
            },
            ColumnType::Real => match value {
                Value::Number(n) => n
                    .as_f64()
                    .map(SqlValue::Real)
                    .ok_or_else(|| invalid("not a number")),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(SqlValue::Real)
                    .map_err(|_| invalid("not a number")),
                _ => Err(invalid("not a number")),
            },
            ColumnType::Boolean => match value {
                Value::Bool(b) => Ok(SqlValue::Bool(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(0) => Ok(SqlValue::Bool(false)),
                    Some(1) => Ok(SqlValue::Bool(true)),
                    _ => Err(invalid("not a boolean")),
                },
                Value::String(s) => match s.trim() {
                    "true" | "1" => Ok(SqlValue::Bool(true)),
                    "false" | "0" => Ok(SqlValue::Bool(false)),
                    _ => Err(invalid("not a boolean")),
                },
                _ => Err(invalid("not a boolean")),
            },
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null(_) => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Int(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Bool(b) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*b))),
        })
    }
}

/// Decode a SQLite value using the declared column type.
pub fn from_sqlite(value: ValueRef<'_>, ty: Option<ColumnType>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) if ty == Some(ColumnType::Boolean) => Value::Bool(i != 0),
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const AMOUNT: ColumnDef = ColumnDef::required("amount", ColumnType::Integer);
    const ACTIVE: ColumnDef = ColumnDef::required("is_active", ColumnType::Boolean);
    const NAME: ColumnDef = ColumnDef::optional("name", ColumnType::Text);

    #[test]
    fn test_integer_coercion() {
        assert_eq!(SqlValue::coerce(&json!(42), &AMOUNT).unwrap(), SqlValue::Int(42));
        assert_eq!(SqlValue::coerce(&json!("17"), &AMOUNT).unwrap(), SqlValue::Int(17));
        assert_eq!(SqlValue::coerce(&json!(5.0), &AMOUNT).unwrap(), SqlValue::Int(5));
        assert!(matches!(
            SqlValue::coerce(&json!("12abc"), &AMOUNT),
            Err(DriverError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_boolean_coercion() {
        assert_eq!(SqlValue::coerce(&json!(1), &ACTIVE).unwrap(), SqlValue::Bool(true));
        assert_eq!(SqlValue::coerce(&json!("false"), &ACTIVE).unwrap(), SqlValue::Bool(false));
        assert!(SqlValue::coerce(&json!(7), &ACTIVE).is_err());
    }

    #[test]
    fn test_null_keeps_type() {
        assert_eq!(
            SqlValue::coerce(&Value::Null, &NAME).unwrap(),
            SqlValue::Null(ColumnType::Text)
        );
    }

    #[test]
    fn test_text_accepts_scalars() {
        assert_eq!(
            SqlValue::coerce(&json!(3), &NAME).unwrap(),
            SqlValue::Text("3".to_string())
        );
    }

    #[test]
    fn test_decode_boolean() {
        assert_eq!(
            from_sqlite(ValueRef::Integer(1), Some(ColumnType::Boolean)),
            Value::Bool(true)
        );
        assert_eq!(from_sqlite(ValueRef::Integer(1), None), json!(1));
    }
}
