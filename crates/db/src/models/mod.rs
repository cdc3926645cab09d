//! Row structs for the tables this crate reads and writes.
//!
//! Each submodule contains a `FromRow` struct matching the database row and
//! the conversion into the matching `formflow-core` domain type.

pub mod dead_letter;
pub mod plugin;
