//! Error types surfaced by the engine.

use rowpilot_util::StateStoreError;
use thiserror::Error;

/// Failure while flattening a workflow's subworkflow references.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpansionError {
    #[error("subworkflow '{subworkflow_id}' referenced by '{referenced_by}' was not found")]
    MissingWorkflow { subworkflow_id: String, referenced_by: String },

    #[error("cyclic subworkflow reference: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("subworkflow '{workflow}' contains loop steps, which are not allowed inside subworkflows")]
    LoopInSubworkflow { workflow: String },

    #[error("workflow '{workflow}' is missing parameter bindings: {}", .names.join(", "))]
    MissingParameters { workflow: String, names: Vec<String> },

    #[error("subworkflow nesting exceeds {max_depth} levels: {}", .path.join(" -> "))]
    DepthExceeded { max_depth: usize, path: Vec<String> },
}

/// Failure while handing a message to the execution surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no execution destination is available")]
    NoDestination,

    #[error("destination '{0}' cannot run workflows")]
    UnsupportedDestination(String),

    #[error("failed to send {message} to the execution surface: {reason}")]
    SendFailed { message: &'static str, reason: String },
}

/// Rejections and failures reported by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("a run is already in progress{}", .workflow_id.as_deref().map(|id| format!(" for '{id}'")).unwrap_or_default())]
    AlreadyRunning { workflow_id: Option<String> },

    #[error(transparent)]
    Expansion(#[from] ExpansionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("failed to resolve data rows: {0}")]
    RowResolution(String),

    #[error("workflow '{workflow_id}' has no steps to run")]
    EmptyWorkflow { workflow_id: String },

    #[error("workflow '{workflow_id}' has no rows inside the requested window")]
    EmptyRowWindow { workflow_id: String },

    #[error("no failed run is available to resume")]
    NoFailureContext,

    #[error("no rows remain to resume for workflow '{workflow_id}'")]
    NoMoreRows { workflow_id: String },

    #[error("workflow '{workflow_id}' is not in the library")]
    UnknownWorkflow { workflow_id: String },

    #[error("a configuration run needs at least one workflow")]
    EmptyConfiguration,

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_the_visited_path() {
        let error = ExpansionError::Cycle {
            path: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(error.to_string(), "cyclic subworkflow reference: A -> B -> A");
    }

    #[test]
    fn already_running_mentions_the_workflow_when_known() {
        let error = OrchestratorError::AlreadyRunning {
            workflow_id: Some("orders".into()),
        };
        assert_eq!(error.to_string(), "a run is already in progress for 'orders'");
        let anonymous = OrchestratorError::AlreadyRunning { workflow_id: None };
        assert_eq!(anonymous.to_string(), "a run is already in progress");
    }
}
