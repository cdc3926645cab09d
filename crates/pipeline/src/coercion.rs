//! String-to-SQL value coercion.
//!
//! Extraction produces strings. Each is converted to the logical type of the
//! plugin field it maps to. Coercion is lenient: an unparseable date stays a
//! string and the database decides. Only values that can never bind to the
//! declared type (a non-numeric integer, a malformed UUID) are rejected, and
//! those reject just the field, never the row.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use formflow_core::plugin::{ColumnType, PluginField, PluginTable};
use formflow_core::value::{RowValues, SqlValue};
use serde::Serialize;

/// Date formats tried in order; the first that parses wins.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %B %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const TRUTHY: &[&str] = &["true", "yes", "1", "y"];

// ---------------------------------------------------------------------------
// Field errors
// ---------------------------------------------------------------------------

/// A field dropped from its row because its value cannot be the declared
/// type. The value itself is not kept; it may be PII.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub table: String,
    pub column: String,
    pub expected: ColumnType,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

/// Convert one extracted string to `column_type`.
///
/// Empty input is `Null` for every type except `string`. The error is a
/// short reason without the offending value.
pub fn coerce_value(raw: &str, column_type: ColumnType) -> Result<SqlValue, String> {
    if column_type == ColumnType::String {
        return Ok(SqlValue::Text(raw.to_string()));
    }

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(SqlValue::Null);
    }

    match column_type {
        ColumnType::String => Ok(SqlValue::Text(raw.to_string())),
        ColumnType::Integer => parse_integer(trimmed).map(SqlValue::Integer),
        ColumnType::Float => parse_float(trimmed).map(SqlValue::Float),
        ColumnType::Boolean => Ok(SqlValue::Boolean(parse_boolean(trimmed))),
        ColumnType::Date => Ok(parse_date(trimmed)
            .map(SqlValue::Date)
            .unwrap_or_else(|| SqlValue::Text(raw.to_string()))),
        ColumnType::Datetime => Ok(parse_datetime(trimmed)
            .map(SqlValue::DateTime)
            .unwrap_or_else(|| SqlValue::Text(raw.to_string()))),
        ColumnType::Json => Ok(SqlValue::Json(
            serde_json::from_str(trimmed)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
        )),
        ColumnType::Uuid => uuid::Uuid::parse_str(trimmed)
            .map(SqlValue::Uuid)
            .map_err(|_| "not a valid UUID".to_string()),
    }
}

/// Coerce the extracted values of one row of `table`.
///
/// `values` pairs a declared field with its raw string. Fields that fail are
/// left out of the row and reported.
pub fn coerce_row<'a>(
    table: &PluginTable,
    values: impl IntoIterator<Item = (&'a PluginField, &'a str)>,
) -> (RowValues, Vec<FieldError>) {
    let mut row = RowValues::new();
    let mut errors = Vec::new();

    for (field, raw) in values {
        match coerce_value(raw, field.column_type) {
            Ok(value) => {
                row.insert(field.column_name.clone(), value);
            }
            Err(message) => errors.push(FieldError {
                table: table.table_name.clone(),
                column: field.column_name.clone(),
                expected: field.column_type,
                message,
            }),
        }
    }

    (row, errors)
}

fn parse_integer(s: &str) -> Result<i64, String> {
    if let Ok(v) = s.parse::<i64>() {
        return Ok(v);
    }
    // Speech-to-text often yields "12.0" for whole numbers.
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
        _ => Err("not a valid integer".to_string()),
    }
}

fn parse_float(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(f),
        _ => Err("not a valid number".to_string()),
    }
}

fn parse_boolean(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    TRUTHY.contains(&lower.as_str())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
        .or_else(|| parse_timestamp(s).map(|dt| dt.date()))
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    parse_timestamp(s).or_else(|| {
        DATE_FORMATS
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    })
}

/// RFC 3339 (normalised to UTC) or one of the naive datetime formats.
fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.naive_utc())
        .ok()
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> SqlValue {
        SqlValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[test]
    fn strings_pass_through_untouched() {
        assert_eq!(
            coerce_value("  Ann ", ColumnType::String),
            Ok(SqlValue::Text("  Ann ".into()))
        );
        assert_eq!(coerce_value("", ColumnType::String), Ok(SqlValue::Text(String::new())));
    }

    #[test]
    fn empty_values_become_null_for_typed_columns() {
        for column_type in [
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::Boolean,
            ColumnType::Date,
            ColumnType::Uuid,
        ] {
            assert_eq!(coerce_value("  ", column_type), Ok(SqlValue::Null));
        }
    }

    #[test]
    fn integers_accept_whole_decimals() {
        assert_eq!(coerce_value(" 42 ", ColumnType::Integer), Ok(SqlValue::Integer(42)));
        assert_eq!(coerce_value("-7", ColumnType::Integer), Ok(SqlValue::Integer(-7)));
        assert_eq!(coerce_value("12.0", ColumnType::Integer), Ok(SqlValue::Integer(12)));
        assert!(coerce_value("12.5", ColumnType::Integer).is_err());
        assert!(coerce_value("twelve", ColumnType::Integer).is_err());
    }

    #[test]
    fn floats_reject_non_numbers() {
        assert_eq!(coerce_value("3.25", ColumnType::Float), Ok(SqlValue::Float(3.25)));
        assert!(coerce_value("NaN", ColumnType::Float).is_err());
        assert!(coerce_value("abc", ColumnType::Float).is_err());
    }

    #[test]
    fn booleans_are_truthy_set_case_insensitive() {
        for truthy in ["true", "YES", "1", "y", "Y", "True"] {
            assert_eq!(coerce_value(truthy, ColumnType::Boolean), Ok(SqlValue::Boolean(true)));
        }
        for falsy in ["false", "no", "0", "maybe"] {
            assert_eq!(coerce_value(falsy, ColumnType::Boolean), Ok(SqlValue::Boolean(false)));
        }
    }

    #[test]
    fn dates_try_formats_in_order() {
        assert_eq!(coerce_value("2024-03-04", ColumnType::Date), Ok(date(2024, 3, 4)));
        // US order wins when both readings are valid.
        assert_eq!(coerce_value("03/04/2024", ColumnType::Date), Ok(date(2024, 3, 4)));
        assert_eq!(coerce_value("25/12/2024", ColumnType::Date), Ok(date(2024, 12, 25)));
        assert_eq!(coerce_value("2024/01/31", ColumnType::Date), Ok(date(2024, 1, 31)));
        assert_eq!(coerce_value("March 4, 2024", ColumnType::Date), Ok(date(2024, 3, 4)));
        assert_eq!(coerce_value("Mar 4, 2024", ColumnType::Date), Ok(date(2024, 3, 4)));
        assert_eq!(coerce_value("4 March 2024", ColumnType::Date), Ok(date(2024, 3, 4)));
        assert_eq!(
            coerce_value("2024-03-04T10:30:00Z", ColumnType::Date),
            Ok(date(2024, 3, 4))
        );
    }

    #[test]
    fn unparseable_dates_stay_strings() {
        assert_eq!(
            coerce_value("next tuesday", ColumnType::Date),
            Ok(SqlValue::Text("next tuesday".into()))
        );
        assert_eq!(
            coerce_value("soon", ColumnType::Datetime),
            Ok(SqlValue::Text("soon".into()))
        );
    }

    #[test]
    fn datetimes_normalise_offsets_to_utc() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(
            coerce_value("2024-03-04T10:30:00+02:00", ColumnType::Datetime),
            Ok(SqlValue::DateTime(expected))
        );
        assert_eq!(
            coerce_value("2024-03-04 08:30:00", ColumnType::Datetime),
            Ok(SqlValue::DateTime(expected))
        );
    }

    #[test]
    fn date_only_datetime_is_midnight() {
        let midnight = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            coerce_value("2024-03-04", ColumnType::Datetime),
            Ok(SqlValue::DateTime(midnight))
        );
    }

    #[test]
    fn json_falls_back_to_string_value() {
        assert_eq!(
            coerce_value(r#"{"a": 1}"#, ColumnType::Json),
            Ok(SqlValue::Json(serde_json::json!({"a": 1})))
        );
        assert_eq!(
            coerce_value("plain words", ColumnType::Json),
            Ok(SqlValue::Json(serde_json::json!("plain words")))
        );
    }

    #[test]
    fn uuids_must_parse() {
        let id = "67e55044-10b1-426f-9247-bb680e5fe0c8";
        assert_matches!(coerce_value(id, ColumnType::Uuid), Ok(SqlValue::Uuid(u)) if u.to_string() == id);
        assert!(coerce_value("not-a-uuid", ColumnType::Uuid).is_err());
    }

    #[test]
    fn coerce_row_reports_failed_fields_and_keeps_the_rest() {
        let table = PluginTable::new(
            "leads",
            vec![
                PluginField::new("name", ColumnType::String),
                PluginField::new("age", ColumnType::Integer),
            ],
        );
        let values = vec![(&table.fields[0], "Ann"), (&table.fields[1], "about thirty")];

        let (row, errors) = coerce_row(&table, values);

        assert_eq!(row.len(), 1);
        assert_eq!(row["name"], SqlValue::Text("Ann".into()));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].column, "age");
        assert_eq!(errors[0].expected, ColumnType::Integer);
        assert!(!errors[0].message.contains("thirty"));
    }
}
