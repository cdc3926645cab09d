//! Decrypted connection settings for an external plugin database.
//!
//! A [`ConnectionConfig`] only ever exists in memory: it is parsed from the
//! output of `EncryptionService::decrypt`, handed to the connector while its
//! pool is being built, and dropped right after.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plugin::DatabaseType;

const DEFAULT_POOL_SIZE: u32 = 5;
const DEFAULT_POOL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POOL_RECYCLE_SECS: u64 = 3600;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection parameters for one external database.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    /// `None` falls back to the dialect default port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(alias = "user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(alias = "dbname")]
    pub database: String,
    /// Require TLS for the connection.
    #[serde(default)]
    pub ssl: bool,
    /// Verify the server certificate and host name when `ssl` is set.
    #[serde(default)]
    pub ssl_verify: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Seconds to wait for a pooled connection.
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout: u64,
    /// Seconds of inactivity after which an idle connection is recycled.
    #[serde(default = "default_pool_recycle")]
    pub pool_recycle: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Postgres schema holding the plugin tables (default `public`).
    #[serde(default)]
    pub schema: Option<String>,
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}
fn default_pool_timeout() -> u64 {
    DEFAULT_POOL_TIMEOUT_SECS
}
fn default_pool_recycle() -> u64 {
    DEFAULT_POOL_RECYCLE_SECS
}
fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl ConnectionConfig {
    /// Parse a config from the decrypted JSON object.
    pub fn from_map(map: serde_json::Map<String, serde_json::Value>) -> Result<Self, String> {
        let config: Self = serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| format!("Invalid connection config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs that cannot possibly produce a working pool.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("Connection config is missing 'host'".into());
        }
        if self.username.trim().is_empty() {
            return Err("Connection config is missing 'username'".into());
        }
        if self.database.trim().is_empty() {
            return Err("Connection config is missing 'database'".into());
        }
        if self.pool_size == 0 {
            return Err("'pool_size' must be at least 1".into());
        }
        Ok(())
    }

    pub fn port_for(&self, db_type: DatabaseType) -> u16 {
        self.port.unwrap_or_else(|| db_type.default_port())
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout)
    }

    pub fn pool_recycle(&self) -> Duration {
        Duration::from_secs(self.pool_recycle)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn schema_or_default(&self) -> &str {
        self.schema.as_deref().unwrap_or("public")
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("ssl", &self.ssl)
            .field("pool_size", &self.pool_size)
            .field("pool_timeout", &self.pool_timeout)
            .field("pool_recycle", &self.pool_recycle)
            .finish()
    }
}
