//! Dialect-aware SQL text generation.
//!
//! Identifiers can never be bound as parameters, so every table and column
//! name is validated against a strict pattern and then quoted for the
//! dialect. Values are always bound; `NULL` is written literally so a
//! typed-NULL parameter cannot clash with the column type.

use formflow_core::plugin::DatabaseType;
use formflow_core::value::{RowValues, SqlValue};

use crate::error::ConnectorError;

/// Longest identifier accepted (the Postgres limit).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Check a single identifier: `[A-Za-z_][A-Za-z0-9_$]*`, at most 63 bytes.
pub fn validate_identifier(ident: &str) -> Result<(), ConnectorError> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');

    if valid_start && valid_rest && ident.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(ConnectorError::InvalidIdentifier(ident.to_string()))
    }
}

/// Split `schema.table` into its parts, validating both.
pub fn split_table_name(name: &str) -> Result<(Option<&str>, &str), ConnectorError> {
    match name.split_once('.') {
        Some((schema, table)) => {
            validate_identifier(schema)?;
            validate_identifier(table)?;
            Ok((Some(schema), table))
        }
        None => {
            validate_identifier(name)?;
            Ok((None, name))
        }
    }
}

fn quote(db_type: DatabaseType, ident: &str) -> String {
    match db_type {
        DatabaseType::Postgres => format!("\"{ident}\""),
        DatabaseType::MySql => format!("`{ident}`"),
    }
}

/// Validate and quote a column name.
pub fn quote_identifier(db_type: DatabaseType, ident: &str) -> Result<String, ConnectorError> {
    validate_identifier(ident)?;
    Ok(quote(db_type, ident))
}

/// Validate and quote a possibly schema-qualified table name.
pub fn quote_table(db_type: DatabaseType, name: &str) -> Result<String, ConnectorError> {
    Ok(match split_table_name(name)? {
        (Some(schema), table) => format!("{}.{}", quote(db_type, schema), quote(db_type, table)),
        (None, table) => quote(db_type, table),
    })
}

fn placeholder(db_type: DatabaseType, index: usize) -> String {
    match db_type {
        DatabaseType::Postgres => format!("${index}"),
        DatabaseType::MySql => "?".to_string(),
    }
}

/// A parameterized statement ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    /// Values for the placeholders, in order. Never contains `Null`.
    pub params: Vec<SqlValue>,
}

/// Build one multi-row `INSERT` for `rows`.
///
/// All rows must have the same column set; the column order is that of the
/// first row. `suffix` is appended verbatim (e.g. `RETURNING *`).
pub fn build_insert(
    db_type: DatabaseType,
    table: &str,
    rows: &[RowValues],
    suffix: Option<&str>,
) -> Result<Statement, ConnectorError> {
    let first = rows
        .first()
        .ok_or_else(|| ConnectorError::InvalidRows("no rows to insert".into()))?;
    if first.is_empty() {
        return Err(ConnectorError::InvalidRows("row has no columns".into()));
    }

    let columns: Vec<&String> = first.keys().collect();
    for (i, row) in rows.iter().enumerate().skip(1) {
        if row.len() != columns.len() || !columns.iter().all(|c| row.contains_key(*c)) {
            return Err(ConnectorError::InvalidRows(format!(
                "row {i} has a different column set than row 0"
            )));
        }
    }

    let quoted_columns = columns
        .iter()
        .map(|c| quote_identifier(db_type, c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut params = Vec::new();
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut slots = Vec::with_capacity(columns.len());
        for column in &columns {
            match &row[*column] {
                SqlValue::Null => slots.push("NULL".to_string()),
                value => {
                    params.push(value.clone());
                    slots.push(placeholder(db_type, params.len()));
                }
            }
        }
        tuples.push(format!("({})", slots.join(", ")));
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_table(db_type, table)?,
        quoted_columns.join(", "),
        tuples.join(", ")
    );
    if let Some(suffix) = suffix {
        sql.push(' ');
        sql.push_str(suffix);
    }

    Ok(Statement { sql, params })
}
