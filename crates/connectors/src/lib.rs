//! Connectors to user-owned external databases.
//!
//! - [`DatabaseConnector`]: dialect-independent interface, implemented by
//!   [`PostgresConnector`] and [`MySqlConnector`] over lazily created sqlx
//!   pools.
//! - [`GuardedConnector`]: routes every call through the plugin's circuit
//!   breaker.
//! - [`ConnectorFactory`]: one cached guarded connector per plugin.

pub mod connector;
mod credentials;
pub mod error;
pub mod factory;
pub mod guarded;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod mysql;
pub mod postgres;
pub mod sql;

pub use connector::{run_in_transaction, ConnectorTransaction, DatabaseConnector};
pub use error::ConnectorError;
pub use factory::{
    ConnectorBuilder, ConnectorFactory, FactoryStats, SqlxConnectorBuilder, VALIDATION_PLUGIN_ID,
};
pub use guarded::GuardedConnector;
pub use mysql::MySqlConnector;
pub use postgres::PostgresConnector;
