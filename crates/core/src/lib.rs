pub mod connection;
pub mod dead_letter;
pub mod encryption;
pub mod error;
pub mod plugin;
pub mod resilience;
pub mod schema;
pub mod signing;
pub mod types;
pub mod value;
