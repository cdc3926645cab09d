use formflow_core::types::DbId;

/// Failures that stop a population call before any row is attempted.
///
/// Everything after that point (connection loss, bad credentials, constraint
/// violations, an open breaker) is reported per table in the
/// `PopulationResult`.
#[derive(Debug, thiserror::Error)]
pub enum PopulationError {
    #[error("Plugin {0} is not active")]
    PluginInactive(DbId),

    #[error("Plugin {0} declares no tables")]
    NoTables(DbId),
}
