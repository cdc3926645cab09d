//! Plugin data model.
//!
//! A [`Plugin`] maps fields extracted from a voice form-fill session onto
//! tables and columns of a user-owned external database. Plugins are created
//! and edited by the configuration API; this crate only reads them.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

/// Field values produced by the extraction pipeline for one session, keyed by
/// `"table.column"` or a bare column name.
pub type ExtractedFields = HashMap<String, String>;

// ---------------------------------------------------------------------------
// DatabaseType
// ---------------------------------------------------------------------------

/// SQL dialect of an external plugin database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatabaseType {
    #[serde(rename = "postgresql", alias = "postgres")]
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
}

impl DatabaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgresql",
            Self::MySql => "mysql",
        }
    }

    /// Port used when the connection config does not name one.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::MySql => 3306,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(Self::Postgres),
            "mysql" => Ok(Self::MySql),
            other => Err(format!(
                "Unsupported database type '{other}'. Must be 'postgresql' or 'mysql'"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// ColumnType
// ---------------------------------------------------------------------------

/// Logical column type declared on a plugin field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Datetime,
    Json,
    Uuid,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Datetime => "datetime",
            Self::Json => "json",
            Self::Uuid => "uuid",
        }
    }

    /// Physical type names (lowercase, as reported by `information_schema`)
    /// that can store values of this logical type.
    pub fn compatible_physical_types(&self) -> &'static [&'static str] {
        match self {
            Self::String => &[
                "varchar",
                "char",
                "text",
                "nvarchar",
                "nchar",
                "bpchar",
                "character varying",
                "character",
                "tinytext",
                "mediumtext",
                "longtext",
                "citext",
                "enum",
                "set",
            ],
            Self::Integer => &[
                "int",
                "integer",
                "int2",
                "int4",
                "int8",
                "smallint",
                "bigint",
                "tinyint",
                "mediumint",
                "serial",
                "bigserial",
                "numeric",
                "decimal",
            ],
            Self::Float => &[
                "float",
                "float4",
                "float8",
                "double",
                "double precision",
                "real",
                "decimal",
                "numeric",
            ],
            Self::Boolean => &["bool", "boolean", "tinyint", "bit"],
            Self::Date => &["date", "datetime", "timestamp", "timestamptz"],
            Self::Datetime => &[
                "datetime",
                "timestamp",
                "timestamptz",
                "timestamp without time zone",
                "timestamp with time zone",
            ],
            Self::Json => &["json", "jsonb", "text", "longtext", "mediumtext"],
            Self::Uuid => &["uuid", "char", "varchar", "bpchar", "character varying", "binary"],
        }
    }

    /// Whether a live column of `physical_type` can hold this logical type.
    ///
    /// Matching is case-insensitive and ignores length/precision suffixes,
    /// so `VARCHAR(255)` and `numeric(10,2)` compare by their base name.
    pub fn accepts(&self, physical_type: &str) -> bool {
        let normalized = normalize_physical_type(physical_type);
        self.compatible_physical_types()
            .iter()
            .any(|candidate| *candidate == normalized)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "text" => Ok(Self::String),
            "integer" | "int" => Ok(Self::Integer),
            "float" | "decimal" | "number" => Ok(Self::Float),
            "boolean" | "bool" => Ok(Self::Boolean),
            "date" => Ok(Self::Date),
            "datetime" | "timestamp" => Ok(Self::Datetime),
            "json" => Ok(Self::Json),
            "uuid" => Ok(Self::Uuid),
            other => Err(format!("Unknown column type '{other}'")),
        }
    }
}

/// Lowercase a physical type name and strip any `(n)` / `(p,s)` suffix and
/// trailing modifiers such as `unsigned`.
fn normalize_physical_type(physical_type: &str) -> String {
    let lower = physical_type.trim().to_ascii_lowercase();
    let base = match lower.find('(') {
        Some(idx) => &lower[..idx],
        None => lower.as_str(),
    };
    base.trim_end_matches(" unsigned").trim().to_string()
}

// ---------------------------------------------------------------------------
// Plugin
// ---------------------------------------------------------------------------

/// One declared column of a plugin table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginField {
    pub column_name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub is_pii: bool,
}

impl PluginField {
    pub fn new(column_name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            column_name: column_name.into(),
            column_type,
            is_required: false,
            is_pii: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn pii(mut self) -> Self {
        self.is_pii = true;
        self
    }
}

/// A target table and its ordered declared fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginTable {
    pub table_name: String,
    pub fields: Vec<PluginField>,
}

impl PluginTable {
    pub fn new(table_name: impl Into<String>, fields: Vec<PluginField>) -> Self {
        Self {
            table_name: table_name.into(),
            fields,
        }
    }

    /// Find a declared field by column name.
    pub fn field(&self, column_name: &str) -> Option<&PluginField> {
        self.fields.iter().find(|f| f.column_name == column_name)
    }
}

/// Outbound webhook endpoint configured on a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    /// Delivery attempts; `None` uses the service default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_webhook_enabled")]
    pub is_enabled: bool,
}

fn default_webhook_enabled() -> bool {
    true
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: secret.into(),
            max_retries: None,
            is_enabled: true,
        }
    }
}

/// A user-configured mapping from extracted fields to an external database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub id: DbId,
    pub user_id: DbId,
    pub name: String,
    pub database_type: DatabaseType,
    /// Opaque ciphertext produced by `EncryptionService::encrypt`.
    #[serde(skip_serializing)]
    pub connection_config_encrypted: String,
    pub tables: Vec<PluginTable>,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
    pub is_active: bool,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

impl Plugin {
    /// Find a declared table by name.
    pub fn table(&self, table_name: &str) -> Option<&PluginTable> {
        self.tables.iter().find(|t| t.table_name == table_name)
    }

    /// The table that bare (unprefixed) field names are routed to.
    pub fn default_table(&self) -> Option<&PluginTable> {
        self.tables.first()
    }

    /// Circuit breaker key for this plugin's database.
    pub fn breaker_key(&self) -> String {
        plugin_breaker_key(self.id)
    }
}

/// Circuit breaker key guarding a plugin's external database.
pub fn plugin_breaker_key(plugin_id: DbId) -> String {
    format!("plugin_{plugin_id}")
}

/// Circuit breaker key guarding a plugin's webhook endpoints.
pub fn webhook_breaker_key(plugin_id: DbId) -> String {
    format!("webhook_{plugin_id}")
}

// ---------------------------------------------------------------------------
// Lookup seam
// ---------------------------------------------------------------------------

/// Read access to plugin definitions owned by the main application.
#[async_trait]
pub trait PluginSource: Send + Sync {
    async fn find_plugin(&self, plugin_id: DbId) -> Result<Option<Plugin>, CoreError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_type_parses_aliases() {
        assert_eq!("postgres".parse::<DatabaseType>(), Ok(DatabaseType::Postgres));
        assert_eq!("PostgreSQL".parse::<DatabaseType>(), Ok(DatabaseType::Postgres));
        assert_eq!("mysql".parse::<DatabaseType>(), Ok(DatabaseType::MySql));
        assert!("oracle".parse::<DatabaseType>().is_err());
    }

    #[test]
    fn database_type_serde_names() {
        let json = serde_json::to_string(&DatabaseType::Postgres).unwrap();
        assert_eq!(json, "\"postgresql\"");
        let parsed: DatabaseType = serde_json::from_str("\"mysql\"").unwrap();
        assert_eq!(parsed, DatabaseType::MySql);
    }

    #[test]
    fn string_accepts_text_like_types() {
        for physical in ["varchar", "CHAR", "text", "nvarchar", "character varying"] {
            assert!(ColumnType::String.accepts(physical), "{physical}");
        }
        assert!(!ColumnType::String.accepts("integer"));
    }

    #[test]
    fn accepts_ignores_length_and_unsigned_suffix() {
        assert!(ColumnType::String.accepts("VARCHAR(255)"));
        assert!(ColumnType::Float.accepts("numeric(10,2)"));
        assert!(ColumnType::Integer.accepts("int unsigned"));
        assert!(ColumnType::Integer.accepts("bigint(20) unsigned"));
    }

    #[test]
    fn datetime_does_not_accept_plain_date() {
        assert!(ColumnType::Date.accepts("date"));
        assert!(!ColumnType::Datetime.accepts("date"));
        assert!(ColumnType::Datetime.accepts("timestamptz"));
    }

    #[test]
    fn uuid_accepts_native_and_char_storage() {
        assert!(ColumnType::Uuid.accepts("uuid"));
        assert!(ColumnType::Uuid.accepts("char(36)"));
        assert!(!ColumnType::Uuid.accepts("int4"));
    }

    #[test]
    fn breaker_keys() {
        assert_eq!(plugin_breaker_key(7), "plugin_7");
        assert_eq!(webhook_breaker_key(7), "webhook_7");
    }

    #[test]
    fn table_lookup_and_default_table() {
        let plugin = Plugin {
            id: 1,
            user_id: 2,
            name: "crm".into(),
            database_type: DatabaseType::Postgres,
            connection_config_encrypted: String::new(),
            tables: vec![
                PluginTable::new("leads", vec![PluginField::new("name", ColumnType::String)]),
                PluginTable::new("notes", vec![]),
            ],
            webhooks: vec![],
            is_active: true,
            updated_at: None,
        };
        assert_eq!(plugin.default_table().unwrap().table_name, "leads");
        assert!(plugin.table("notes").is_some());
        assert!(plugin.table("missing").is_none());
        assert!(plugin.tables[0].field("name").is_some());
    }

    #[test]
    fn webhook_secret_is_not_serialized() {
        let config = WebhookConfig::new("https://example.com/hook", "s3cret");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("s3cret"));
    }
}
