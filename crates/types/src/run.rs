//! Run-time value objects exchanged between the orchestrator and the execution surface.
//!
//! The two contexts share no memory, so everything the page side needs travels inside
//! [`ExecutePayload`] and everything the orchestrator learns comes back as a [`SurfaceEvent`].
//! The persisted records at the bottom of the module survive orchestrator restarts.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::workflow::{Workflow, WorkflowSettings};

/// A single data row the workflow iterates over.
pub type DataRow = JsonMap<String, JsonValue>;

/// Per-run options chosen by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    #[serde(default)]
    pub skip_rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_rows: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub show_logs: bool,
    #[serde(default)]
    pub learning_mode: bool,
    #[serde(default)]
    pub run_until_interception: bool,
}

impl RunOptions {
    pub fn window(&self) -> RowWindow {
        RowWindow {
            skip: self.skip_rows,
            limit: self.limit_rows,
        }
    }
}

/// Half-open row range `[skip, skip + limit)` of a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RowWindow {
    pub skip: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl RowWindow {
    /// Exclusive end of the window, clipped to `total_rows`.
    pub fn end(&self, total_rows: usize) -> usize {
        match self.limit {
            Some(limit) => self.skip.saturating_add(limit).min(total_rows),
            None => total_rows,
        }
    }

    /// Row indices covered by the window for a data set of `total_rows` rows.
    pub fn range(&self, total_rows: usize) -> Range<usize> {
        let start = self.skip.min(total_rows);
        start..self.end(total_rows).max(start)
    }
}

/// Correlation metadata carried by every dispatched run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_key: Option<String>,
    /// Row window of the run this one resumes, so repeated resumes stay inside it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_window: Option<RowWindow>,
}

impl RunMeta {
    /// Metadata for a run started from a configuration queue entry.
    pub fn queued(configuration_run_id: impl Into<String>, queue_key: impl Into<String>) -> Self {
        Self {
            configuration_run_id: Some(configuration_run_id.into()),
            queue_key: Some(queue_key.into()),
            resume_window: None,
        }
    }

    pub fn is_chained(&self) -> bool {
        self.queue_key.is_some()
    }
}

/// Everything the execution surface needs to run a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub run_id: String,
    /// Flattened workflow; truncated to the remaining steps after a navigation resume.
    pub workflow: Workflow,
    pub data: Vec<DataRow>,
    pub run_options: RunOptions,
    /// Workflow settings merged over the runner defaults.
    pub settings: WorkflowSettings,
    #[serde(default)]
    pub meta: RunMeta,
    /// Full step list used for the rows after the first when `workflow` was truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<Workflow>,
}

/// Messages sent to the execution surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SurfaceMessage {
    ExecuteWorkflow(ExecutePayload),
    PauseWorkflow,
    ResumeWorkflow,
    StopWorkflow,
}

impl SurfaceMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecuteWorkflow(_) => "executeWorkflow",
            Self::PauseWorkflow => "pauseWorkflow",
            Self::ResumeWorkflow => "resumeWorkflow",
            Self::StopWorkflow => "stopWorkflow",
        }
    }
}

/// Phase reported by a progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ProgressPhase {
    StepStart,
    StepDone,
    RowStart,
    LoopIteration,
}

/// Progress report from the execution surface.
///
/// Rows may be reported either as an absolute `row`/`totalRows` pair or as a
/// `processedRows`/`totalToProcess` count; the orchestrator accepts both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_to_process: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

impl ProgressEvent {
    fn empty(phase: ProgressPhase) -> Self {
        Self {
            phase,
            run_id: None,
            step_index: None,
            step_name: None,
            row: None,
            total_rows: None,
            processed_rows: None,
            total_to_process: None,
            iteration: None,
            total: None,
        }
    }

    pub fn step_start(step_index: usize, step_name: impl Into<String>) -> Self {
        Self {
            step_index: Some(step_index),
            step_name: Some(step_name.into()),
            ..Self::empty(ProgressPhase::StepStart)
        }
    }

    pub fn step_done(step_index: usize, step_name: impl Into<String>) -> Self {
        Self {
            step_index: Some(step_index),
            step_name: Some(step_name.into()),
            ..Self::empty(ProgressPhase::StepDone)
        }
    }

    pub fn row_start(row: usize, total_rows: usize) -> Self {
        Self {
            row: Some(row),
            total_rows: Some(total_rows),
            ..Self::empty(ProgressPhase::RowStart)
        }
    }

    /// Row start reported as a count of processed items.
    pub fn rows_processed(processed_rows: usize, total_to_process: usize) -> Self {
        Self {
            processed_rows: Some(processed_rows),
            total_to_process: Some(total_to_process),
            ..Self::empty(ProgressPhase::RowStart)
        }
    }

    pub fn loop_iteration(iteration: usize, total: usize) -> Self {
        Self {
            iteration: Some(iteration),
            total: Some(total),
            ..Self::empty(ProgressPhase::LoopIteration)
        }
    }

    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Completion report; the correlation fields echo the dispatched [`RunMeta`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_key: Option<String>,
}

/// Step failure report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Events flowing back from the execution surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SurfaceEvent {
    Progress(ProgressEvent),
    Complete(CompletionEvent),
    Error(ErrorEvent),
}

/// State persisted by the execution surface right before it navigates the target page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NavigationState {
    pub workflow: Workflow,
    pub next_step_index: usize,
    pub current_row_index: usize,
    #[serde(default)]
    pub data: Vec<DataRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_menu_item_name: Option<String>,
    #[serde(default)]
    pub wait_for_load: bool,
    #[serde(default)]
    pub run_options: RunOptions,
    #[serde(default)]
    pub meta: RunMeta,
}

/// Context captured when a run fails, used to offer a resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    pub workflow_id: String,
    pub row_index: usize,
    pub total_rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default)]
    pub message: String,
    /// Row window of the original run.
    pub window: RowWindow,
    #[serde(default)]
    pub run_options: RunOptions,
    #[serde(default)]
    pub meta: RunMeta,
}

/// Workflow snapshot queued as part of a configuration run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedWorkflow {
    pub key: String,
    pub workflow: Workflow,
}

/// A chained multi-workflow run in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationRunState {
    pub id: String,
    pub queue: Vec<QueuedWorkflow>,
    pub current_index: usize,
    #[serde(default)]
    pub run_options: RunOptions,
}

impl ConfigurationRunState {
    /// Queue key the next completion must carry.
    pub fn expected_key(&self) -> Option<&str> {
        self.queue.get(self.current_index).map(|entry| entry.key.as_str())
    }
}
