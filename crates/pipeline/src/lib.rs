//! Getting extracted form data into plugin databases.
//!
//! - [`coercion`]: string values to typed SQL parameters.
//! - [`validation`]: pre-flight check of a plugin's tables against the live
//!   schema; gates activation.
//! - [`population`]: per-table transactional inserts, dead-lettering of
//!   failed rows, and outcome webhooks.
//! - [`dead_letter`]: the queue facade and the background retry scheduler.

pub mod coercion;
pub mod dead_letter;
pub mod error;
pub mod population;
pub mod validation;

pub use dead_letter::{CycleReport, DeadLetterQueue, RetryScheduler, SchedulerSettings};
pub use error::PopulationError;
pub use population::{
    PopulationResult, PopulationService, PopulationSettings, PopulationStatus, TableOutcome,
};
pub use validation::{
    PluginSchemaInput, SchemaValidationService, Severity, ValidationIssue, ValidationResult,
};
