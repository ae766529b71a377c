//! In-memory execution state of the active run.
//!
//! The orchestrator owns exactly one [`ExecutionState`]. The accessors enforce the bookkeeping
//! invariants: a running run always has a step and row cursor inside its bounds, and every way out
//! of a run (completion, failure, stop, failed launch) clears the running flags.

use rowpilot_types::{RunMeta, RunOptions, Workflow};
use tracing::debug;

/// Lifecycle phase of the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunPhase {
    #[default]
    Idle,
    /// Rows are being resolved and the workflow expanded and dispatched.
    Launching,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

/// Per-step status marker shown while a run is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepRunStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

/// Everything known about a run at the moment it is dispatched.
#[derive(Debug, Clone)]
pub struct RunLaunch {
    pub run_id: String,
    pub workflow: Workflow,
    pub run_options: RunOptions,
    pub meta: RunMeta,
    pub first_row: usize,
    pub total_rows: usize,
    pub first_step: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    phase: RunPhase,
    run_id: Option<String>,
    current_workflow_id: Option<String>,
    current_step_index: usize,
    total_steps: usize,
    current_row: usize,
    total_rows: usize,
    loop_iteration: Option<(usize, usize)>,
    run_options: RunOptions,
    meta: RunMeta,
    running_workflow_snapshot: Option<Workflow>,
    step_statuses: Vec<StepRunStatus>,
}

impl ExecutionState {
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// True while a dispatched run is executing or paused.
    pub fn is_running(&self) -> bool {
        matches!(self.phase, RunPhase::Running | RunPhase::Paused)
    }

    pub fn is_launching(&self) -> bool {
        self.phase == RunPhase::Launching
    }

    pub fn is_paused(&self) -> bool {
        self.phase == RunPhase::Paused
    }

    /// True when neither a run nor a launch is in flight.
    pub fn is_idle(&self) -> bool {
        !self.is_running() && !self.is_launching()
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn current_workflow_id(&self) -> Option<&str> {
        self.current_workflow_id.as_deref()
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn current_row(&self) -> usize {
        self.current_row
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn loop_iteration(&self) -> Option<(usize, usize)> {
        self.loop_iteration
    }

    pub fn run_options(&self) -> &RunOptions {
        &self.run_options
    }

    pub fn meta(&self) -> &RunMeta {
        &self.meta
    }

    /// Full (flattened) workflow of the active run, kept for resumes.
    pub fn running_workflow_snapshot(&self) -> Option<&Workflow> {
        self.running_workflow_snapshot.as_ref()
    }

    pub fn step_statuses(&self) -> &[StepRunStatus] {
        &self.step_statuses
    }

    pub(crate) fn begin_launch(&mut self) {
        self.phase = RunPhase::Launching;
    }

    /// Returns to idle after a launch that never reached the surface.
    pub(crate) fn abort_launch(&mut self) {
        if self.phase == RunPhase::Launching {
            self.phase = RunPhase::Idle;
        }
    }

    pub(crate) fn mark_running(&mut self, launch: RunLaunch) {
        let total_steps = launch.workflow.steps.len();
        self.phase = RunPhase::Running;
        self.run_id = Some(launch.run_id);
        self.current_workflow_id = Some(launch.workflow.id.clone());
        self.total_steps = total_steps;
        self.current_step_index = launch.first_step.min(total_steps.saturating_sub(1));
        self.total_rows = launch.total_rows;
        self.current_row = launch.first_row.min(launch.total_rows.saturating_sub(1));
        self.loop_iteration = None;
        self.run_options = launch.run_options;
        self.meta = launch.meta;
        self.running_workflow_snapshot = Some(launch.workflow);
        self.step_statuses = vec![StepRunStatus::Pending; total_steps];
    }

    pub(crate) fn set_phase(&mut self, phase: RunPhase) {
        self.phase = phase;
    }

    /// Updates one step marker and moves the step cursor to it.
    pub(crate) fn mark_step(&mut self, step_index: usize, status: StepRunStatus) {
        let Some(slot) = self.step_statuses.get_mut(step_index) else {
            debug!(step_index, total_steps = self.total_steps, "ignoring out-of-range step index");
            return;
        };
        *slot = status;
        self.current_step_index = step_index;
    }

    /// Moves the row cursor and resets the step markers for the new row.
    pub(crate) fn start_row(&mut self, row: Option<usize>, total_rows: Option<usize>) {
        if let Some(total_rows) = total_rows.filter(|total| *total > 0) {
            self.total_rows = total_rows;
        }
        if let Some(row) = row {
            self.current_row = row.min(self.total_rows.saturating_sub(1));
        }
        self.current_step_index = 0;
        self.loop_iteration = None;
        self.step_statuses.iter_mut().for_each(|status| *status = StepRunStatus::Pending);
    }

    pub(crate) fn set_loop_iteration(&mut self, iteration: Option<usize>, total: Option<usize>) {
        if let (Some(iteration), Some(total)) = (iteration, total) {
            self.loop_iteration = Some((iteration, total));
        }
    }

    /// Ends the active run in `phase`, clearing the running flags.
    pub(crate) fn finish(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.loop_iteration = None;
    }

    pub(crate) fn reset_step_statuses(&mut self) {
        self.step_statuses.iter_mut().for_each(|status| *status = StepRunStatus::Pending);
    }
}
