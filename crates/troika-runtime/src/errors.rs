//! Runtime error type.

use thiserror::Error;

/// Errors surfaced by the orchestration layer. Agent-scope failures are
/// converted to inbox items instead; these are the run-scope ones.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The run context backing a weak reference is gone.
    #[error("run context dropped")]
    RunGone,

    /// A referenced profile could not be resolved.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// A referenced handover protocol could not be resolved.
    #[error("handover protocol not found: {0}")]
    ProtocolNotFound(String),

    /// A question is required to start this flow.
    #[error("no question on team state for run {0}")]
    MissingQuestion(String),

    /// A principal flow is already running.
    #[error("principal flow already running for run {0}")]
    PrincipalBusy(String),

    /// Serialization failure while snapshotting or updating state.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A flow terminated with an unrecoverable error.
    #[error("flow error: {0}")]
    Flow(String),
}
