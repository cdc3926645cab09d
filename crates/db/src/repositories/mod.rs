//! Repository layer: one zero-sized struct per table, each method taking the
//! pool explicitly.

pub mod dead_letter_repo;
pub mod plugin_repo;

pub use dead_letter_repo::DeadLetterRepo;
pub use plugin_repo::PluginRepo;
