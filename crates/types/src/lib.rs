//! Shared type definitions for the rowpilot workspace.
//!
//! - [`workflow`]: authored workflows, steps, parameter bindings, and interruption handlers
//! - [`run`]: run options, surface messages/events, and the records persisted between restarts

pub mod run;
pub mod workflow;

pub use run::{
    CompletionEvent, ConfigurationRunState, DataRow, ErrorEvent, ExecutePayload, FailureContext, NavigationState, ProgressEvent,
    ProgressPhase, QueuedWorkflow, RowWindow, RunMeta, RunOptions, SurfaceEvent, SurfaceMessage,
};
pub use workflow::{
    ErrorDefaultMode, HandlerAction, HandlerMode, HandlerOutcome, InterruptionHandler, InterruptionTrigger, MatchMode, ParamBinding,
    ParamBindings, StepBody, SubworkflowCall, Workflow, WorkflowSettings, WorkflowStep, normalize_param_name,
};
