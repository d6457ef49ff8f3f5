//! Policy agent error types.

use thiserror::Error;

/// A packet-filter command failed.
#[derive(Debug, Error)]
pub enum IptablesError {
    #[error("running {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },
}

/// Replacing a chain's contents failed. The previous contents are still
/// in place unless the failure happened during cleanup.
#[derive(Debug, Error)]
pub enum EnforceError {
    #[error("listing {chain} rules: {source}")]
    List {
        chain: String,
        #[source]
        source: IptablesError,
    },

    #[error("creating chain: {0}")]
    CreateChain(#[source] IptablesError),

    #[error("bulk appending: {0}")]
    Append(#[source] IptablesError),

    #[error("inserting chain: {0}")]
    Insert(#[source] IptablesError),

    #[error("cleanup old chain: {0}")]
    Cleanup(#[source] IptablesError),

    #[error("chain prefix pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// A planner could not produce its rules.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("{0}")]
    Failed(String),
}

/// A poll cycle was aborted.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("get-rules: {0}")]
    GetRules(#[source] PlannerError),

    #[error("enforce: {0}")]
    Enforce(#[source] EnforceError),
}
