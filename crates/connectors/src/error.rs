use std::time::Duration;

use formflow_core::encryption::EncryptionError;
use formflow_core::resilience::{BreakerRejected, ResilienceError};

/// Errors raised by connectors and the connector factory.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Network, TLS, authentication or pool failure reaching the external
    /// database. Trips the plugin's circuit breaker.
    #[error("Database connection error: {0}")]
    Connection(String),

    /// The stored credential blob could not be decrypted. Reported apart
    /// from connection failures so bad credentials and unreachable hosts
    /// can be told apart.
    #[error("Connection credentials could not be decrypted: {0}")]
    Credentials(#[from] EncryptionError),

    #[error("Invalid connection config: {0}")]
    InvalidConfig(String),

    #[error("Invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("Invalid rows: {0}")]
    InvalidRows(String),

    /// The database rejected a statement (constraint violation, type
    /// mismatch, missing table).
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Circuit '{key}' is open; retry after {}ms", retry_after.as_millis())]
    CircuitOpen { key: String, retry_after: Duration },
}

impl ConnectorError {
    /// Whether the failure means the database could not be reached at all.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::CircuitOpen { .. }
        )
    }
}

impl From<BreakerRejected> for ConnectorError {
    fn from(rejected: BreakerRejected) -> Self {
        Self::CircuitOpen {
            key: rejected.key,
            retry_after: rejected.retry_after,
        }
    }
}

impl ResilienceError for ConnectorError {
    fn trips_breaker(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Undecryptable or malformed settings fail before any connection is
    /// attempted and say nothing about the host's health.
    fn bypasses_breaker(&self) -> bool {
        matches!(self, Self::Credentials(_) | Self::InvalidConfig(_))
    }

    /// Connector calls are never retried in-line; failed rows go to the
    /// dead-letter queue instead.
    fn is_retryable(&self) -> bool {
        false
    }
}

/// SQLSTATE classes (Postgres) and error numbers (MySQL) that mean the
/// session could not be established rather than that a statement failed.
fn is_connection_code(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("28")
        || code == "3D000"
        || code == "57P01"
        || matches!(code, "1044" | "1045" | "1049" | "2002" | "2003" | "2006" | "2013")
}

impl From<sqlx::Error> for ConnectorError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(e.to_string()),
            sqlx::Error::Configuration(_) => Self::InvalidConfig(e.to_string()),
            sqlx::Error::Database(ref db) => {
                let is_connection = db.code().is_some_and(|code| is_connection_code(&code));
                if is_connection {
                    Self::Connection(db.message().to_string())
                } else {
                    Self::Query(db.message().to_string())
                }
            }
            other => Self::Query(other.to_string()),
        }
    }
}
