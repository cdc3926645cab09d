//! Dialect-neutral SQL parameter values.
//!
//! Extracted strings are coerced into [`SqlValue`]s before insertion; the
//! same representation is serialized into dead-letter payloads so a failed
//! row can be replayed byte-for-byte.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// A typed value bound as one SQL parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Json(serde_json::Value),
    Uuid(uuid::Uuid),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short type label used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::Date(_) => "date",
            Self::DateTime(_) => "datetime",
            Self::Json(_) => "json",
            Self::Uuid(_) => "uuid",
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Text(v) => f.write_str(v),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{v}"),
            Self::DateTime(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
            Self::Uuid(v) => write!(f, "{v}"),
        }
    }
}

/// One row to insert: column name -> value, ordered by column name.
pub type RowValues = BTreeMap<String, SqlValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let json = serde_json::to_value(SqlValue::Integer(42)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "integer", "value": 42}));

        let null = serde_json::to_value(SqlValue::Null).unwrap();
        assert_eq!(null, serde_json::json!({"type": "null"}));
    }

    #[test]
    fn date_survives_json() {
        let date = SqlValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        let json = serde_json::to_string(&date).unwrap();
        let back: SqlValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, date);
    }

    #[test]
    fn kind_labels() {
        assert_eq!(SqlValue::Text("a".into()).kind(), "text");
        assert!(SqlValue::Null.is_null());
        assert_eq!(SqlValue::Boolean(true).to_string(), "true");
    }
}
