//! Pre-flight schema validation for plugin configurations.
//!
//! Compares a plugin's declared tables and fields with the live external
//! schema. Missing tables or columns are errors and block activation; type
//! mismatches and nullability surprises are warnings. Population does not
//! re-validate, so this is the one place configuration drift is caught
//! before rows start failing.

use std::collections::HashSet;
use std::sync::Arc;

use formflow_connectors::{ConnectorError, ConnectorFactory, DatabaseConnector};
use formflow_core::plugin::{DatabaseType, Plugin, PluginTable};
use formflow_core::schema::TableInfo;
use formflow_core::types::DbId;
use serde::{Deserialize, Serialize};

/// Table name used for issues that concern the whole connection.
pub const CONNECTION_SCOPE: &str = "*";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Whether an issue blocks activation or is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Declared table name, or `"*"` for connection-level problems.
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    fn error(table: &str, column: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            column: column.map(str::to_string),
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(table: &str, column: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(table, column, message)
        }
    }
}

/// Aggregated outcome of validating one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// `true` when no issue has [`Severity::Error`].
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
    /// Tables that were introspected.
    pub tables_checked: usize,
}

impl ValidationResult {
    fn from_issues(issues: Vec<ValidationIssue>, tables_checked: usize) -> Self {
        Self {
            is_valid: !issues.iter().any(|i| i.severity == Severity::Error),
            issues,
            tables_checked,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }
}

/// What the configuration API submits for validation. The plugin may not
/// be saved yet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginSchemaInput {
    pub plugin_id: Option<DbId>,
    pub database_type: DatabaseType,
    pub connection_config_encrypted: String,
    pub tables: Vec<PluginTable>,
}

impl From<&Plugin> for PluginSchemaInput {
    fn from(plugin: &Plugin) -> Self {
        Self {
            plugin_id: Some(plugin.id),
            database_type: plugin.database_type,
            connection_config_encrypted: plugin.connection_config_encrypted.clone(),
            tables: plugin.tables.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct SchemaValidationService {
    factory: Arc<ConnectorFactory>,
}

impl SchemaValidationService {
    pub fn new(factory: Arc<ConnectorFactory>) -> Self {
        Self { factory }
    }

    /// Validate a configuration against the live database.
    ///
    /// Uses a throwaway connector that is disconnected before returning, so
    /// validating never leaves a pool behind or touches a live plugin's
    /// breaker.
    pub async fn validate(&self, input: &PluginSchemaInput) -> ValidationResult {
        let connector = self
            .factory
            .validation_connector(input.database_type, &input.connection_config_encrypted);

        let result = check_schema(&connector, &input.tables).await;
        connector.disconnect().await;

        tracing::info!(
            plugin_id = ?input.plugin_id,
            is_valid = result.is_valid,
            errors = result.errors().count(),
            warnings = result.warnings().count(),
            tables_checked = result.tables_checked,
            "Plugin schema validated"
        );
        result
    }

    /// Validate `plugin` and set `is_active` to the outcome.
    ///
    /// An invalid plugin is deactivated, so a previously active plugin whose
    /// external schema drifted stops receiving rows.
    pub async fn activate(&self, plugin: &mut Plugin) -> ValidationResult {
        let result = self.validate(&PluginSchemaInput::from(&*plugin)).await;
        if plugin.is_active && !result.is_valid {
            tracing::warn!(plugin_id = plugin.id, "Plugin deactivated after failed validation");
        }
        plugin.is_active = result.is_valid;
        result
    }
}

async fn check_schema<C>(connector: &C, tables: &[PluginTable]) -> ValidationResult
where
    C: DatabaseConnector + ?Sized,
{
    if let Err(e) = connector.connect().await {
        return ValidationResult::from_issues(vec![connection_issue(&e)], 0);
    }
    if !connector.test_connection().await {
        return ValidationResult::from_issues(
            vec![ValidationIssue::error(
                CONNECTION_SCOPE,
                None,
                "Could not connect to database",
            )],
            0,
        );
    }

    let mut issues = Vec::new();
    let mut tables_checked = 0;

    for table in tables {
        if table.fields.is_empty() {
            issues.push(ValidationIssue::warning(
                &table.table_name,
                None,
                "Table declares no fields; nothing will be inserted",
            ));
        }

        match connector.get_table_schema(&table.table_name).await {
            Ok(Some(info)) => {
                tables_checked += 1;
                check_table(table, &info, &mut issues);
            }
            Ok(None) => {
                tables_checked += 1;
                issues.push(ValidationIssue::error(
                    &table.table_name,
                    None,
                    format!("Table '{}' does not exist", table.table_name),
                ));
            }
            Err(e) => issues.push(ValidationIssue::error(
                &table.table_name,
                None,
                format!("Could not read table schema: {e}"),
            )),
        }
    }

    ValidationResult::from_issues(issues, tables_checked)
}

fn connection_issue(e: &ConnectorError) -> ValidationIssue {
    let message = match e {
        ConnectorError::Credentials(_) => {
            "Stored connection settings could not be decrypted".to_string()
        }
        ConnectorError::InvalidConfig(msg) => format!("Invalid connection settings: {msg}"),
        other => format!("Could not connect to database: {other}"),
    };
    ValidationIssue::error(CONNECTION_SCOPE, None, message)
}

fn check_table(table: &PluginTable, info: &TableInfo, issues: &mut Vec<ValidationIssue>) {
    let mut seen = HashSet::new();

    for field in &table.fields {
        let column = field.column_name.as_str();
        if !seen.insert(column) {
            issues.push(ValidationIssue::warning(
                &table.table_name,
                Some(column),
                format!("Column '{column}' is declared more than once"),
            ));
            continue;
        }

        let Some(live) = info.column(column) else {
            issues.push(ValidationIssue::error(
                &table.table_name,
                Some(column),
                format!("Column '{column}' does not exist in '{}'", table.table_name),
            ));
            continue;
        };

        if !field.column_type.accepts(&live.data_type) {
            issues.push(ValidationIssue::warning(
                &table.table_name,
                Some(column),
                format!(
                    "Declared type '{}' may not be compatible with column type '{}'",
                    field.column_type, live.data_type
                ),
            ));
        }

        if field.is_required && live.is_nullable {
            issues.push(ValidationIssue::warning(
                &table.table_name,
                Some(column),
                format!("Required field '{column}' maps to a nullable column"),
            ));
        }
    }
}
