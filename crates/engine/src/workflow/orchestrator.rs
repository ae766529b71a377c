//! Run orchestration.
//!
//! The [`Orchestrator`] owns the single active run. It expands and dispatches workflows to the
//! execution surface, folds the surface's progress/complete/error events into [`ExecutionState`],
//! chains configuration runs, and resumes interrupted runs after a page navigation or a failure.
//!
//! Everything needed to resume after a restart (resume offsets, the last failure, the queued
//! configuration run, the workflow library and its handler repository) is written to the
//! [`StateStore`] as it changes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rowpilot_types::{
    CompletionEvent, ConfigurationRunState, ErrorEvent, ExecutePayload, FailureContext, InterruptionHandler, NavigationState, ProgressEvent,
    ProgressPhase, QueuedWorkflow, RunMeta, RunOptions, SurfaceEvent, SurfaceMessage, Workflow, WorkflowSettings,
};
use rowpilot_util::{RunnerConfig, StateStore, read_value, write_value};
use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, ExpansionError, OrchestratorError};
use crate::interruption::build_handler_repository;
use crate::workflow::expand::{DEFAULT_MAX_DEPTH, WorkflowExpander};
use crate::workflow::state::{ExecutionState, RunLaunch, RunPhase, StepRunStatus};
use crate::workflow::surface::{Destination, ExecutionSurface, RowResolver};

pub const RESUME_SKIP_KEY: &str = "resumeSkipByWorkflow";
pub const LAST_FAILURE_KEY: &str = "lastFailure";
pub const HANDLER_REPOSITORY_KEY: &str = "interruptionHandlerRepository";
pub const CONFIGURATION_RUN_KEY: &str = "configurationRun";
pub const PENDING_NAVIGATION_KEY: &str = "pendingNavigation";
pub const WORKFLOWS_KEY: &str = "workflows";

const DEFAULT_RESUME_DEDUP_WINDOW: Duration = Duration::from_secs(2);

/// Tuning knobs of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Error defaults every workflow's own settings are merged over.
    pub default_settings: WorkflowSettings,
    /// Repeated navigation resumes for the same row and step inside this window are dropped.
    pub resume_dedup_window: Duration,
    pub max_expansion_depth: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_settings: WorkflowSettings::default(),
            resume_dedup_window: DEFAULT_RESUME_DEDUP_WINDOW,
            max_expansion_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl From<&RunnerConfig> for OrchestratorConfig {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            default_settings: config.default_error_settings.clone(),
            resume_dedup_window: Duration::from_millis(config.resume_dedup_window_ms),
            max_expansion_depth: config.max_expansion_depth,
        }
    }
}

/// Where a failed run picks up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Start after the failed row.
    Next,
    /// Run the failed row again.
    Retry,
}

/// User-facing notifications about run lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunNotice {
    Started { workflow_id: String, run_id: String },
    Paused { workflow_id: String },
    Resumed { workflow_id: String },
    Completed { workflow_id: String },
    Stopped { workflow_id: Option<String> },
    /// A run failed and can be resumed with [`Orchestrator::resume_from_failure`].
    ResumeAvailable(FailureContext),
    NoMoreRows { workflow_id: String },
    ConfigurationAdvanced { configuration_run_id: String, completed: usize, total: usize },
    ConfigurationFinished { configuration_run_id: String },
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    surface: Arc<dyn ExecutionSurface>,
    rows: Arc<dyn RowResolver>,
    store: Arc<dyn StateStore>,
    notice_tx: Option<UnboundedSender<RunNotice>>,
    state: ExecutionState,
    destination: Option<Destination>,
    configuration: Option<ConfigurationRunState>,
    workflows: Vec<Workflow>,
    handler_repository: Vec<InterruptionHandler>,
    resume_skip_by_workflow: BTreeMap<String, usize>,
    last_failure: Option<FailureContext>,
    recent_navigation_resume: Option<(String, Instant)>,
    run_serial: u64,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        surface: Arc<dyn ExecutionSurface>,
        rows: Arc<dyn RowResolver>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            surface,
            rows,
            store,
            notice_tx: None,
            state: ExecutionState::default(),
            destination: None,
            configuration: None,
            workflows: Vec::new(),
            handler_repository: Vec::new(),
            resume_skip_by_workflow: BTreeMap::new(),
            last_failure: None,
            recent_navigation_resume: None,
            run_serial: 0,
        }
    }

    /// Sends lifecycle notices to `notice_tx`.
    pub fn with_notices(mut self, notice_tx: UnboundedSender<RunNotice>) -> Self {
        self.notice_tx = Some(notice_tx);
        self
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn configuration(&self) -> Option<&ConfigurationRunState> {
        self.configuration.as_ref()
    }

    pub fn last_failure(&self) -> Option<&FailureContext> {
        self.last_failure.as_ref()
    }

    pub fn workflows(&self) -> &[Workflow] {
        &self.workflows
    }

    pub fn handler_repository(&self) -> &[InterruptionHandler] {
        &self.handler_repository
    }

    /// Row the next run of `workflow_id` should start from after a failure, if any.
    pub fn resume_skip_for(&self, workflow_id: &str) -> Option<usize> {
        self.resume_skip_by_workflow.get(workflow_id).copied()
    }

    /// Reloads persisted bookkeeping after a restart.
    ///
    /// A restored configuration run stays pending until [`Orchestrator::run_next`] is called.
    pub fn restore(&mut self) -> Result<(), OrchestratorError> {
        let store = self.store.as_ref();
        self.resume_skip_by_workflow = read_value(store, RESUME_SKIP_KEY)?.unwrap_or_default();
        self.last_failure = read_value(store, LAST_FAILURE_KEY)?;
        self.configuration = read_value(store, CONFIGURATION_RUN_KEY)?;
        if let Some(workflows) = read_value::<Vec<Workflow>>(store, WORKFLOWS_KEY)? {
            self.workflows = workflows;
        }
        self.handler_repository = match read_value(store, HANDLER_REPOSITORY_KEY)? {
            Some(repository) => repository,
            None => build_handler_repository(&self.workflows),
        };

        info!(
            workflows = self.workflows.len(),
            handlers = self.handler_repository.len(),
            pending_failure = self.last_failure.is_some(),
            pending_configuration = self.configuration.is_some(),
            "restored orchestrator state"
        );
        Ok(())
    }

    /// Replaces the workflow library.
    pub fn set_workflows(&mut self, workflows: Vec<Workflow>) -> Result<(), OrchestratorError> {
        self.workflows = workflows;
        self.persist_library()
    }

    /// Inserts or replaces one workflow in the library.
    pub fn save_workflow(&mut self, workflow: Workflow) -> Result<(), OrchestratorError> {
        match self.workflows.iter_mut().find(|existing| existing.id == workflow.id) {
            Some(existing) => *existing = workflow,
            None => self.workflows.push(workflow),
        }
        self.persist_library()
    }

    /// Removes a workflow from the library. Returns false when it was not present.
    pub fn delete_workflow(&mut self, workflow_id: &str) -> Result<bool, OrchestratorError> {
        let before = self.workflows.len();
        self.workflows.retain(|workflow| workflow.id != workflow_id);
        if self.workflows.len() == before {
            return Ok(false);
        }
        self.persist_library()?;
        Ok(true)
    }

    fn persist_library(&mut self) -> Result<(), OrchestratorError> {
        self.handler_repository = build_handler_repository(&self.workflows);
        self.persist(WORKFLOWS_KEY, &self.workflows)?;
        self.persist(HANDLER_REPOSITORY_KEY, &self.handler_repository)?;
        debug!(
            workflows = self.workflows.len(),
            handlers = self.handler_repository.len(),
            "persisted workflow library"
        );
        Ok(())
    }

    /// Starts a standalone run of `workflow`.
    ///
    /// Rejected while another run is active or launching. A configuration run left over from an
    /// earlier session is discarded first. Without an explicit row window the run starts at the row
    /// where the last failed run of the same workflow stopped.
    pub async fn start(&mut self, workflow: Workflow, options: RunOptions) -> Result<String, OrchestratorError> {
        let options = self.with_resume_skip(&workflow.id, options);
        self.start_run(workflow, options, RunMeta::default()).await
    }

    fn with_resume_skip(&self, workflow_id: &str, options: RunOptions) -> RunOptions {
        match self.resume_skip_for(workflow_id) {
            Some(skip_rows) if options.skip_rows == 0 && options.limit_rows.is_none() => {
                info!(workflow = %workflow_id, skip_rows, "starting at the row where the last failed run stopped");
                RunOptions { skip_rows, ..options }
            }
            _ => options,
        }
    }

    async fn start_run(&mut self, workflow: Workflow, options: RunOptions, meta: RunMeta) -> Result<String, OrchestratorError> {
        if !self.state.is_idle() {
            warn!(workflow = %workflow.id, active = ?self.state.current_workflow_id(), "rejecting start while a run is active");
            return Err(OrchestratorError::AlreadyRunning {
                workflow_id: self.state.current_workflow_id().map(str::to_string),
            });
        }

        if !meta.is_chained()
            && let Some(stale) = self.configuration.take()
        {
            info!(configuration_run_id = %stale.id, "discarding unfinished configuration run");
            self.forget(&[CONFIGURATION_RUN_KEY])?;
        }

        self.state.begin_launch();
        match self.launch(workflow, options, meta).await {
            Ok(run_id) => Ok(run_id),
            Err(error) => {
                self.state.abort_launch();
                warn!(error = %error, "workflow launch failed");
                Err(error)
            }
        }
    }

    async fn launch(&mut self, workflow: Workflow, options: RunOptions, meta: RunMeta) -> Result<String, OrchestratorError> {
        let rows = self
            .rows
            .resolve_rows(&workflow, &options)
            .await
            .map_err(|error| OrchestratorError::RowResolution(format!("{error:#}")))?;

        let flattened = self.flatten(&workflow)?;
        if flattened.steps.is_empty() {
            return Err(OrchestratorError::EmptyWorkflow {
                workflow_id: workflow.id,
            });
        }

        let row_range = options.window().range(rows.len());
        if row_range.is_empty() {
            return Err(OrchestratorError::EmptyRowWindow {
                workflow_id: workflow.id,
            });
        }

        let run_id = self.next_run_id();
        let total_rows = rows.len();
        let payload = ExecutePayload {
            run_id: run_id.clone(),
            workflow: flattened.clone(),
            data: rows,
            run_options: options.clone(),
            settings: flattened.settings.merged_over(&self.config.default_settings),
            meta: meta.clone(),
            continuation: None,
        };
        self.dispatch(payload).await?;

        info!(
            workflow = %flattened.id,
            run_id = %run_id,
            steps = flattened.steps.len(),
            rows = ?row_range,
            queue_key = ?meta.queue_key,
            "dispatched workflow run"
        );
        let workflow_id = flattened.id.clone();
        self.state.mark_running(RunLaunch {
            run_id: run_id.clone(),
            workflow: flattened,
            run_options: options,
            meta,
            first_row: row_range.start,
            total_rows,
            first_step: 0,
        });
        self.notify(RunNotice::Started {
            workflow_id,
            run_id: run_id.clone(),
        });
        Ok(run_id)
    }

    fn flatten(&self, workflow: &Workflow) -> Result<Workflow, ExpansionError> {
        let output = WorkflowExpander::new(&self.workflows)
            .with_max_depth(self.config.max_expansion_depth)
            .expand(workflow)?;
        for warning in &output.warnings {
            warn!(workflow = %workflow.id, "{warning}");
        }
        Ok(output.workflow)
    }

    async fn dispatch(&mut self, payload: ExecutePayload) -> Result<(), DispatchError> {
        let destination = self.surface.acquire().await?;
        self.surface
            .send(&destination, SurfaceMessage::ExecuteWorkflow(payload))
            .await?;
        self.destination = Some(destination);
        Ok(())
    }

    async fn send_control(&self, message: SurfaceMessage) -> Result<(), DispatchError> {
        let destination = self.destination.as_ref().ok_or(DispatchError::NoDestination)?;
        self.surface.send(destination, message).await
    }

    fn is_stale(&self, run_id: Option<&str>) -> bool {
        matches!((run_id, self.state.run_id()), (Some(reported), Some(active)) if reported != active)
    }

    /// Applies one surface event.
    pub async fn handle_event(&mut self, event: SurfaceEvent) -> Result<(), OrchestratorError> {
        match event {
            SurfaceEvent::Progress(progress) => {
                self.handle_progress(progress);
                Ok(())
            }
            SurfaceEvent::Complete(completion) => self.complete(completion).await,
            SurfaceEvent::Error(failure) => self.fail(failure).map(|_| ()),
        }
    }

    /// Applies surface events until the channel closes.
    pub async fn process_events(&mut self, event_rx: &mut UnboundedReceiver<SurfaceEvent>) {
        while let Some(event) = event_rx.recv().await {
            if let Err(error) = self.handle_event(event).await {
                warn!(error = %error, "failed to apply surface event");
            }
        }
    }

    /// Applies surface events until no run is active (including chained follow-up runs).
    pub async fn run_until_idle(&mut self, event_rx: &mut UnboundedReceiver<SurfaceEvent>) {
        while !self.state.is_idle() {
            let Some(event) = event_rx.recv().await else {
                warn!("surface event channel closed while a run was active");
                break;
            };
            if let Err(error) = self.handle_event(event).await {
                warn!(error = %error, "failed to apply surface event");
            }
        }
    }

    /// Folds a progress report into the execution state.
    pub fn handle_progress(&mut self, event: ProgressEvent) {
        if !self.state.is_running() {
            debug!(phase = ?event.phase, "ignoring progress without an active run");
            return;
        }
        if self.is_stale(event.run_id.as_deref()) {
            debug!(run_id = ?event.run_id, "ignoring progress from a previous run");
            return;
        }
        match event.phase {
            ProgressPhase::StepStart => {
                if let Some(step_index) = event.step_index {
                    self.state.mark_step(step_index, StepRunStatus::Running);
                }
            }
            ProgressPhase::StepDone => {
                if let Some(step_index) = event.step_index {
                    self.state.mark_step(step_index, StepRunStatus::Success);
                }
            }
            ProgressPhase::RowStart => {
                let row = event
                    .row
                    .or_else(|| event.processed_rows.map(|processed| processed.saturating_sub(1)));
                let total = event.total_rows.or(event.total_to_process);
                self.state.start_row(row, total);
            }
            ProgressPhase::LoopIteration => self.state.set_loop_iteration(event.iteration, event.total),
        }
    }

    /// Handles a completion report.
    ///
    /// Completions arriving while nothing runs are ignored, as are chained completions whose
    /// queue key is not the one the configuration run is waiting for.
    pub async fn complete(&mut self, event: CompletionEvent) -> Result<(), OrchestratorError> {
        if !self.state.is_running() {
            debug!(run_id = ?event.run_id, "ignoring completion without an active run");
            return Ok(());
        }
        if self.is_stale(event.run_id.as_deref()) {
            warn!(run_id = ?event.run_id, active = ?self.state.run_id(), "ignoring completion from a previous run");
            return Ok(());
        }

        let queue_key = event.queue_key.clone().or_else(|| self.state.meta().queue_key.clone());
        let chained = match (&self.configuration, queue_key.as_deref()) {
            (Some(configuration), Some(key)) => {
                let same_configuration = event
                    .configuration_run_id
                    .as_deref()
                    .is_none_or(|id| id == configuration.id);
                if !same_configuration || configuration.expected_key() != Some(key) {
                    warn!(
                        expected = ?configuration.expected_key(),
                        received = key,
                        "ignoring out-of-order configuration completion"
                    );
                    return Ok(());
                }
                true
            }
            _ => false,
        };

        let workflow_id = self.state.current_workflow_id().unwrap_or_default().to_string();
        self.state.finish(RunPhase::Completed);
        if self.resume_skip_by_workflow.remove(&workflow_id).is_some() {
            self.persist(RESUME_SKIP_KEY, &self.resume_skip_by_workflow)?;
        }
        info!(workflow = %workflow_id, "workflow run completed");
        self.notify(RunNotice::Completed { workflow_id });

        if chained {
            self.advance_configuration().await?;
        }
        Ok(())
    }

    /// Handles a step failure, recording where a resume should pick up.
    pub fn fail(&mut self, event: ErrorEvent) -> Result<Option<FailureContext>, OrchestratorError> {
        if !self.state.is_running() {
            debug!(message = %event.message, "ignoring error without an active run");
            return Ok(None);
        }
        if self.is_stale(event.run_id.as_deref()) {
            debug!(run_id = ?event.run_id, "ignoring error from a previous run");
            return Ok(None);
        }

        let step_index = event.step_index.unwrap_or(self.state.current_step_index());
        self.state.mark_step(step_index, StepRunStatus::Failed);
        let run_options = self.state.run_options().clone();
        let meta = self.state.meta().clone();
        let failure = FailureContext {
            workflow_id: self.state.current_workflow_id().unwrap_or_default().to_string(),
            row_index: self.state.current_row(),
            total_rows: self.state.total_rows(),
            step_index: Some(step_index),
            message: event.message,
            window: meta.resume_window.unwrap_or_else(|| run_options.window()),
            run_options,
            meta,
        };
        self.state.finish(RunPhase::Failed);

        error!(
            workflow = %failure.workflow_id,
            row = failure.row_index,
            step = step_index,
            step_name = ?event.step,
            message = %failure.message,
            "workflow run failed"
        );

        self.resume_skip_by_workflow
            .insert(failure.workflow_id.clone(), failure.row_index);
        self.last_failure = Some(failure.clone());
        self.persist(RESUME_SKIP_KEY, &self.resume_skip_by_workflow)?;
        self.persist(LAST_FAILURE_KEY, &failure)?;
        self.notify(RunNotice::ResumeAvailable(failure.clone()));
        Ok(Some(failure))
    }

    /// Pauses the running workflow. Returns false when nothing is running.
    pub async fn pause(&mut self) -> Result<bool, OrchestratorError> {
        if self.state.phase() != RunPhase::Running {
            debug!(phase = ?self.state.phase(), "pause ignored");
            return Ok(false);
        }
        self.send_control(SurfaceMessage::PauseWorkflow).await?;
        self.state.set_phase(RunPhase::Paused);
        let workflow_id = self.state.current_workflow_id().unwrap_or_default().to_string();
        info!(workflow = %workflow_id, "workflow run paused");
        self.notify(RunNotice::Paused { workflow_id });
        Ok(true)
    }

    /// Resumes a paused workflow. Returns false when nothing is paused.
    pub async fn resume(&mut self) -> Result<bool, OrchestratorError> {
        if !self.state.is_paused() {
            debug!(phase = ?self.state.phase(), "resume ignored");
            return Ok(false);
        }
        self.send_control(SurfaceMessage::ResumeWorkflow).await?;
        self.state.set_phase(RunPhase::Running);
        let workflow_id = self.state.current_workflow_id().unwrap_or_default().to_string();
        info!(workflow = %workflow_id, "workflow run resumed");
        self.notify(RunNotice::Resumed { workflow_id });
        Ok(true)
    }

    /// Stops the active run and abandons any configuration run.
    ///
    /// Nothing happens unless the caller confirmed the stop.
    pub async fn stop(&mut self, confirmed: bool) -> Result<bool, OrchestratorError> {
        if !confirmed {
            info!("stop not confirmed; run continues");
            return Ok(false);
        }

        if let Some(destination) = self.destination.as_ref()
            && let Err(error) = self.surface.send(destination, SurfaceMessage::StopWorkflow).await
        {
            warn!(error = %error, "failed to deliver stop to the execution surface");
        }

        let workflow_id = self.state.current_workflow_id().map(str::to_string);
        if self.state.is_running() {
            self.state.finish(RunPhase::Stopped);
        }
        self.state.reset_step_statuses();
        self.clear_configuration()?;
        info!(workflow = ?workflow_id, "workflow run stopped");
        self.notify(RunNotice::Stopped { workflow_id });
        Ok(true)
    }

    /// Records where a run was when the surface had to navigate away.
    pub fn persist_navigation_state(&self, navigation: &NavigationState) -> Result<(), OrchestratorError> {
        self.persist(PENDING_NAVIGATION_KEY, navigation)
    }

    /// Resumes from a navigation state persisted earlier, if one is pending.
    pub async fn resume_pending_navigation(&mut self) -> Result<Option<String>, OrchestratorError> {
        let Some(navigation) = read_value::<NavigationState>(self.store.as_ref(), PENDING_NAVIGATION_KEY)? else {
            return Ok(None);
        };
        self.forget(&[PENDING_NAVIGATION_KEY])?;
        self.resume_after_navigation(navigation).await
    }

    /// Re-dispatches the remaining steps of the current row after the page navigated.
    ///
    /// The first row runs only the steps from `next_step_index` on (tagged with their original
    /// index); the following rows of the original window run the full workflow. A repeat request
    /// for the same row and step within the dedup window is dropped and returns `Ok(None)`.
    pub async fn resume_after_navigation(&mut self, navigation: NavigationState) -> Result<Option<String>, OrchestratorError> {
        let dedup_key = format!(
            "{}#{}#{}",
            navigation.workflow.id, navigation.current_row_index, navigation.next_step_index
        );
        let now = Instant::now();
        if let Some((recent_key, at)) = &self.recent_navigation_resume
            && *recent_key == dedup_key
            && now.duration_since(*at) < self.config.resume_dedup_window
        {
            debug!(resume = %dedup_key, "suppressing duplicate navigation resume");
            return Ok(None);
        }
        if self.state.is_launching() {
            return Err(OrchestratorError::AlreadyRunning {
                workflow_id: self.state.current_workflow_id().map(str::to_string),
            });
        }

        let full = navigation.workflow;
        if full.steps.is_empty() {
            return Err(OrchestratorError::EmptyWorkflow { workflow_id: full.id });
        }
        let total_rows = navigation.data.len();
        let original_window = navigation
            .meta
            .resume_window
            .unwrap_or_else(|| navigation.run_options.window());
        let end = original_window.end(total_rows);
        let current_row = navigation.current_row_index;
        if current_row >= end {
            info!(workflow = %full.id, row = current_row, "navigation resume has no rows left");
            return Ok(None);
        }
        self.recent_navigation_resume = Some((dedup_key, now));

        let next_step = navigation.next_step_index.min(full.steps.len());
        let mut remaining = full.clone();
        remaining.steps = full
            .steps
            .iter()
            .enumerate()
            .skip(next_step)
            .map(|(index, step)| {
                let mut step = step.clone();
                step.body_mut().original_index.get_or_insert(index);
                step
            })
            .collect();

        let run_options = RunOptions {
            skip_rows: current_row,
            limit_rows: original_window.limit.map(|_| end - current_row),
            ..navigation.run_options
        };
        let meta = RunMeta {
            resume_window: Some(original_window),
            ..navigation.meta
        };
        let run_id = self.next_run_id();
        let payload = ExecutePayload {
            run_id: run_id.clone(),
            workflow: remaining,
            data: navigation.data,
            run_options: run_options.clone(),
            settings: full.settings.merged_over(&self.config.default_settings),
            meta: meta.clone(),
            continuation: Some(full.clone()),
        };

        self.state.begin_launch();
        if let Err(error) = self.dispatch(payload).await {
            self.state.abort_launch();
            warn!(error = %error, "navigation resume dispatch failed");
            return Err(error.into());
        }

        info!(
            workflow = %full.id,
            run_id = %run_id,
            row = current_row,
            step = next_step,
            "resumed workflow after navigation"
        );
        let workflow_id = full.id.clone();
        self.state.mark_running(RunLaunch {
            run_id: run_id.clone(),
            workflow: full,
            run_options,
            meta,
            first_row: current_row,
            total_rows,
            first_step: next_step,
        });
        self.notify(RunNotice::Started {
            workflow_id,
            run_id: run_id.clone(),
        });
        Ok(Some(run_id))
    }

    /// Restarts the last failed run inside its original row window.
    pub async fn resume_from_failure(&mut self, mode: ResumeMode) -> Result<String, OrchestratorError> {
        if !self.state.is_idle() {
            return Err(OrchestratorError::AlreadyRunning {
                workflow_id: self.state.current_workflow_id().map(str::to_string),
            });
        }
        let failure = self.last_failure.clone().ok_or(OrchestratorError::NoFailureContext)?;

        let start_row = match mode {
            ResumeMode::Next => failure.row_index + 1,
            ResumeMode::Retry => failure.row_index,
        };
        let end = failure.window.end(failure.total_rows);
        if start_row >= end {
            info!(workflow = %failure.workflow_id, row = failure.row_index, "no rows left to resume");
            self.notify(RunNotice::NoMoreRows {
                workflow_id: failure.workflow_id.clone(),
            });
            return Err(OrchestratorError::NoMoreRows {
                workflow_id: failure.workflow_id,
            });
        }

        let workflow = self
            .resume_target(&failure)
            .ok_or_else(|| OrchestratorError::UnknownWorkflow {
                workflow_id: failure.workflow_id.clone(),
            })?;
        let options = RunOptions {
            skip_rows: start_row,
            limit_rows: failure.window.limit.map(|_| end - start_row),
            ..failure.run_options.clone()
        };
        let meta = RunMeta {
            resume_window: Some(failure.window),
            ..failure.meta.clone()
        };

        info!(workflow = %failure.workflow_id, mode = ?mode, from_row = start_row, "resuming failed run");
        let run_id = self.start_run(workflow, options, meta).await?;
        self.last_failure = None;
        self.forget(&[LAST_FAILURE_KEY])?;
        Ok(run_id)
    }

    fn resume_target(&self, failure: &FailureContext) -> Option<Workflow> {
        let queued = self.configuration.as_ref().and_then(|configuration| {
            configuration
                .queue
                .iter()
                .find(|entry| Some(entry.key.as_str()) == failure.meta.queue_key.as_deref())
                .map(|entry| entry.workflow.clone())
        });
        queued
            .or_else(|| {
                self.workflows
                    .iter()
                    .find(|workflow| workflow.id == failure.workflow_id)
                    .cloned()
            })
            .or_else(|| {
                self.state
                    .running_workflow_snapshot()
                    .filter(|snapshot| snapshot.id == failure.workflow_id)
                    .cloned()
            })
    }

    /// Queues snapshots of `workflows` and runs them one after another.
    ///
    /// Returns the run id of the first queued workflow.
    pub async fn start_configuration_run(&mut self, workflows: &[Workflow], options: RunOptions) -> Result<String, OrchestratorError> {
        if !self.state.is_idle() {
            return Err(OrchestratorError::AlreadyRunning {
                workflow_id: self.state.current_workflow_id().map(str::to_string),
            });
        }
        if workflows.is_empty() {
            return Err(OrchestratorError::EmptyConfiguration);
        }

        let configuration = ConfigurationRunState {
            id: format!("cfg-{}", Utc::now().format("%Y%m%dT%H%M%S%3f")),
            queue: workflows
                .iter()
                .enumerate()
                .map(|(index, workflow)| QueuedWorkflow {
                    key: format!("{index}:{}", workflow.id),
                    workflow: workflow.clone(),
                })
                .collect(),
            current_index: 0,
            run_options: options,
        };
        info!(
            configuration_run_id = %configuration.id,
            workflows = configuration.queue.len(),
            "starting configuration run"
        );
        self.configuration = Some(configuration);
        self.persist_configuration()?;

        self.run_next().await?.ok_or(OrchestratorError::EmptyConfiguration)
    }

    /// Starts the configuration queue entry at the current index.
    ///
    /// Returns `Ok(None)` when no configuration run is pending or the queue is exhausted, in which
    /// case the configuration run is finished and cleared.
    pub async fn run_next(&mut self) -> Result<Option<String>, OrchestratorError> {
        let Some(configuration) = self.configuration.as_ref() else {
            return Ok(None);
        };
        let Some(entry) = configuration.queue.get(configuration.current_index).cloned() else {
            let configuration_run_id = configuration.id.clone();
            self.clear_configuration()?;
            info!(configuration_run_id = %configuration_run_id, "configuration run finished");
            self.notify(RunNotice::ConfigurationFinished { configuration_run_id });
            return Ok(None);
        };
        let meta = RunMeta::queued(configuration.id.clone(), entry.key.clone());
        let options = configuration.run_options.clone();

        match self.start_run(entry.workflow, options, meta).await {
            Ok(run_id) => Ok(Some(run_id)),
            Err(error @ OrchestratorError::AlreadyRunning { .. }) => Err(error),
            Err(error) => {
                error!(queue_key = %entry.key, error = %error, "queued workflow failed to start; abandoning configuration run");
                self.clear_configuration()?;
                Err(error)
            }
        }
    }

    async fn advance_configuration(&mut self) -> Result<(), OrchestratorError> {
        let Some(configuration) = self.configuration.as_mut() else {
            return Ok(());
        };
        configuration.current_index += 1;
        let notice = RunNotice::ConfigurationAdvanced {
            configuration_run_id: configuration.id.clone(),
            completed: configuration.current_index,
            total: configuration.queue.len(),
        };
        self.persist_configuration()?;
        self.notify(notice);
        self.run_next().await.map(|_| ())
    }

    fn persist_configuration(&self) -> Result<(), OrchestratorError> {
        match &self.configuration {
            Some(configuration) => self.persist(CONFIGURATION_RUN_KEY, configuration),
            None => self.forget(&[CONFIGURATION_RUN_KEY]),
        }
    }

    fn clear_configuration(&mut self) -> Result<(), OrchestratorError> {
        self.configuration = None;
        self.forget(&[CONFIGURATION_RUN_KEY])
    }

    fn persist<T: Serialize>(&self, key: &str, value: &T) -> Result<(), OrchestratorError> {
        write_value(self.store.as_ref(), key, value)?;
        Ok(())
    }

    fn forget(&self, keys: &[&str]) -> Result<(), OrchestratorError> {
        self.store.remove(keys)?;
        Ok(())
    }

    fn notify(&self, notice: RunNotice) {
        if let Some(notice_tx) = &self.notice_tx {
            let _ = notice_tx.send(notice);
        }
    }

    fn next_run_id(&mut self) -> String {
        self.run_serial += 1;
        format!("run-{}-{}", Utc::now().timestamp_millis(), self.run_serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rowpilot_types::{DataRow, RowWindow, StepBody, WorkflowStep};
    use rowpilot_util::InMemoryStateStore;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc::unbounded_channel;

    use crate::workflow::surface::InlineRowResolver;

    #[derive(Default)]
    struct RecordingSurface {
        sent: Mutex<Vec<SurfaceMessage>>,
        unavailable: bool,
    }

    impl RecordingSurface {
        fn unavailable() -> Self {
            Self {
                unavailable: true,
                ..Self::default()
            }
        }

        fn messages(&self) -> Vec<SurfaceMessage> {
            self.sent.lock().expect("sent lock").clone()
        }

        fn payloads(&self) -> Vec<ExecutePayload> {
            self.messages()
                .into_iter()
                .filter_map(|message| match message {
                    SurfaceMessage::ExecuteWorkflow(payload) => Some(payload),
                    _ => None,
                })
                .collect()
        }

        fn last_payload(&self) -> ExecutePayload {
            self.payloads().pop().expect("at least one dispatched payload")
        }
    }

    #[async_trait]
    impl ExecutionSurface for RecordingSurface {
        async fn acquire(&self) -> Result<Destination, DispatchError> {
            if self.unavailable {
                Err(DispatchError::NoDestination)
            } else {
                Ok(Destination::new("tab-1"))
            }
        }

        async fn send(&self, _destination: &Destination, message: SurfaceMessage) -> Result<(), DispatchError> {
            self.sent.lock().expect("sent lock").push(message);
            Ok(())
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        surface: Arc<RecordingSurface>,
        store: Arc<InMemoryStateStore>,
        notices: UnboundedReceiver<RunNotice>,
    }

    fn harness_with(surface: RecordingSurface, row_count: usize) -> Harness {
        let surface = Arc::new(surface);
        let store = Arc::new(InMemoryStateStore::new());
        let rows: Vec<DataRow> = (0..row_count)
            .map(|index| {
                let mut row = DataRow::new();
                row.insert("index".into(), json!(index));
                row
            })
            .collect();
        let (notice_tx, notices) = unbounded_channel();
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            surface.clone(),
            Arc::new(InlineRowResolver::new(rows)),
            store.clone(),
        )
        .with_notices(notice_tx);
        Harness {
            orchestrator,
            surface,
            store,
            notices,
        }
    }

    fn harness(row_count: usize) -> Harness {
        harness_with(RecordingSurface::default(), row_count)
    }

    fn workflow(id: &str, steps: usize) -> Workflow {
        Workflow {
            id: id.into(),
            name: id.to_uppercase(),
            steps: (0..steps).map(|_| WorkflowStep::Click(StepBody::default())).collect(),
            ..Workflow::default()
        }
    }

    fn drain(notices: &mut UnboundedReceiver<RunNotice>) -> Vec<RunNotice> {
        let mut drained = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            drained.push(notice);
        }
        drained
    }

    fn windowed(skip_rows: usize, limit_rows: Option<usize>) -> RunOptions {
        RunOptions {
            skip_rows,
            limit_rows,
            ..RunOptions::default()
        }
    }

    #[tokio::test]
    async fn start_is_single_flight() {
        let mut harness = harness(3);
        harness
            .orchestrator
            .start(workflow("orders", 2), RunOptions::default())
            .await
            .expect("first start");

        let rejected = harness.orchestrator.start(workflow("other", 1), RunOptions::default()).await;
        assert!(matches!(
            rejected,
            Err(OrchestratorError::AlreadyRunning { workflow_id: Some(ref id) }) if id == "orders"
        ));
        assert_eq!(harness.surface.payloads().len(), 1);
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_orchestrator_idle() {
        let mut harness = harness_with(RecordingSurface::unavailable(), 3);
        let result = harness.orchestrator.start(workflow("orders", 2), RunOptions::default()).await;

        assert!(matches!(result, Err(OrchestratorError::Dispatch(DispatchError::NoDestination))));
        assert!(harness.orchestrator.state().is_idle());
        assert_eq!(harness.orchestrator.state().phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn empty_window_is_rejected_before_dispatch() {
        let mut harness = harness(3);
        let result = harness.orchestrator.start(workflow("orders", 1), windowed(5, None)).await;
        assert!(matches!(result, Err(OrchestratorError::EmptyRowWindow { .. })));
        assert!(harness.surface.messages().is_empty());
        assert!(harness.orchestrator.state().is_idle());
    }

    #[tokio::test]
    async fn settings_are_merged_over_defaults() {
        let mut harness = harness(1);
        harness.orchestrator.config.default_settings.error_default_retry_count = Some(5);
        let mut authored = workflow("orders", 1);
        authored.settings.error_default_retry_delay = Some(250);

        harness.orchestrator.start(authored, RunOptions::default()).await.expect("start");
        let settings = harness.surface.last_payload().settings;
        assert_eq!(settings.error_default_retry_count, Some(5));
        assert_eq!(settings.error_default_retry_delay, Some(250));
    }

    #[tokio::test]
    async fn progress_updates_cursors_and_ignores_stale_runs() {
        let mut harness = harness(10);
        let run_id = harness
            .orchestrator
            .start(workflow("orders", 3), windowed(2, None))
            .await
            .expect("start");
        assert_eq!(harness.orchestrator.state().current_row(), 2);

        harness
            .orchestrator
            .handle_progress(ProgressEvent::row_start(4, 10).for_run(&run_id));
        harness
            .orchestrator
            .handle_progress(ProgressEvent::step_start(1, "click").for_run(&run_id));
        harness
            .orchestrator
            .handle_progress(ProgressEvent::row_start(8, 10).for_run("run-old"));

        let state = harness.orchestrator.state();
        assert_eq!(state.current_row(), 4);
        assert_eq!(state.current_step_index(), 1);
        assert_eq!(state.step_statuses()[1], StepRunStatus::Running);

        harness.orchestrator.handle_progress(ProgressEvent::rows_processed(3, 10));
        assert_eq!(harness.orchestrator.state().current_row(), 2);
    }

    #[tokio::test]
    async fn resume_next_stays_inside_the_original_window() {
        let mut harness = harness(20);
        let run_id = harness
            .orchestrator
            .start(workflow("orders", 2), windowed(2, Some(6)))
            .await
            .expect("start");
        harness
            .orchestrator
            .handle_progress(ProgressEvent::row_start(4, 20).for_run(&run_id));
        let failure = harness
            .orchestrator
            .fail(ErrorEvent {
                run_id: Some(run_id),
                step_index: Some(1),
                step: Some("click".into()),
                message: "element not found".into(),
            })
            .expect("fail")
            .expect("failure context");

        assert_eq!(failure.row_index, 4);
        assert_eq!(failure.window, RowWindow { skip: 2, limit: Some(6) });
        assert!(harness.orchestrator.state().is_idle());
        assert_eq!(harness.orchestrator.resume_skip_for("orders"), Some(4));
        let persisted: Option<BTreeMap<String, usize>> =
            read_value(harness.store.as_ref(), RESUME_SKIP_KEY).expect("read resume skips");
        assert_eq!(persisted.and_then(|skips| skips.get("orders").copied()), Some(4));
        assert!(drain(&mut harness.notices).contains(&RunNotice::ResumeAvailable(failure)));

        harness.orchestrator.save_workflow(workflow("orders", 2)).expect("save workflow");
        harness
            .orchestrator
            .resume_from_failure(ResumeMode::Next)
            .await
            .expect("resume");

        let payload = harness.surface.last_payload();
        assert_eq!(payload.run_options.skip_rows, 5);
        assert_eq!(payload.run_options.limit_rows, Some(3));
        assert_eq!(payload.meta.resume_window, Some(RowWindow { skip: 2, limit: Some(6) }));
        assert!(harness.orchestrator.last_failure().is_none());
    }

    #[tokio::test]
    async fn retry_reruns_the_failed_row() {
        let mut harness = harness(20);
        let run_id = harness
            .orchestrator
            .start(workflow("orders", 2), windowed(2, Some(6)))
            .await
            .expect("start");
        harness
            .orchestrator
            .handle_progress(ProgressEvent::row_start(4, 20).for_run(&run_id));
        harness
            .orchestrator
            .fail(ErrorEvent {
                message: "boom".into(),
                ..ErrorEvent::default()
            })
            .expect("fail");

        harness
            .orchestrator
            .resume_from_failure(ResumeMode::Retry)
            .await
            .expect("resume");
        let payload = harness.surface.last_payload();
        assert_eq!(payload.run_options.skip_rows, 4);
        assert_eq!(payload.run_options.limit_rows, Some(4));
    }

    #[tokio::test]
    async fn resume_after_last_row_reports_no_more_rows() {
        let mut harness = harness(20);
        let run_id = harness
            .orchestrator
            .start(workflow("orders", 1), windowed(2, Some(6)))
            .await
            .expect("start");
        harness
            .orchestrator
            .handle_progress(ProgressEvent::row_start(7, 20).for_run(&run_id));
        harness
            .orchestrator
            .fail(ErrorEvent {
                message: "boom".into(),
                ..ErrorEvent::default()
            })
            .expect("fail");

        let result = harness.orchestrator.resume_from_failure(ResumeMode::Next).await;
        assert!(matches!(result, Err(OrchestratorError::NoMoreRows { .. })));
        assert!(drain(&mut harness.notices).contains(&RunNotice::NoMoreRows {
            workflow_id: "orders".into()
        }));
        assert_eq!(harness.surface.payloads().len(), 1);
    }

    #[tokio::test]
    async fn resume_without_failure_is_rejected() {
        let mut harness = harness(2);
        assert!(matches!(
            harness.orchestrator.resume_from_failure(ResumeMode::Next).await,
            Err(OrchestratorError::NoFailureContext)
        ));
    }

    #[tokio::test]
    async fn completion_clears_resume_skip() {
        let mut harness = harness(5);
        harness.orchestrator.save_workflow(workflow("orders", 1)).expect("save");
        let run_id = harness
            .orchestrator
            .start(workflow("orders", 1), RunOptions::default())
            .await
            .expect("start");
        harness
            .orchestrator
            .fail(ErrorEvent {
                run_id: Some(run_id),
                message: "boom".into(),
                ..ErrorEvent::default()
            })
            .expect("fail");
        assert_eq!(harness.orchestrator.resume_skip_for("orders"), Some(0));

        let resumed = harness
            .orchestrator
            .resume_from_failure(ResumeMode::Next)
            .await
            .expect("resume");
        harness
            .orchestrator
            .complete(CompletionEvent {
                run_id: Some(resumed),
                ..CompletionEvent::default()
            })
            .await
            .expect("complete");

        assert_eq!(harness.orchestrator.resume_skip_for("orders"), None);
        assert_eq!(harness.orchestrator.state().phase(), RunPhase::Completed);
    }

    #[tokio::test]
    async fn completion_without_active_run_is_ignored() {
        let mut harness = harness(1);
        harness
            .orchestrator
            .complete(CompletionEvent::default())
            .await
            .expect("complete");
        assert!(drain(&mut harness.notices).is_empty());
        assert_eq!(harness.orchestrator.state().phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn configuration_run_ignores_out_of_order_completion() {
        let mut harness = harness(2);
        harness
            .orchestrator
            .start_configuration_run(&[workflow("a", 1), workflow("b", 1)], RunOptions::default())
            .await
            .expect("start configuration");
        assert_eq!(harness.surface.last_payload().meta.queue_key.as_deref(), Some("0:a"));

        harness
            .orchestrator
            .complete(CompletionEvent {
                queue_key: Some("1:b".into()),
                ..CompletionEvent::default()
            })
            .await
            .expect("stray completion");
        assert!(harness.orchestrator.state().is_running());
        assert_eq!(harness.orchestrator.configuration().map(|run| run.current_index), Some(0));
        assert_eq!(harness.surface.payloads().len(), 1);

        harness
            .orchestrator
            .complete(CompletionEvent {
                queue_key: Some("0:a".into()),
                ..CompletionEvent::default()
            })
            .await
            .expect("completion");
        let second = harness.surface.last_payload();
        assert_eq!(second.workflow.id, "b");
        assert_eq!(second.meta.queue_key.as_deref(), Some("1:b"));
        assert_eq!(harness.orchestrator.configuration().map(|run| run.current_index), Some(1));

        harness
            .orchestrator
            .complete(CompletionEvent {
                queue_key: Some("1:b".into()),
                ..CompletionEvent::default()
            })
            .await
            .expect("final completion");
        assert!(harness.orchestrator.configuration().is_none());
        let notices = drain(&mut harness.notices);
        assert!(
            notices
                .iter()
                .any(|notice| matches!(notice, RunNotice::ConfigurationFinished { .. }))
        );
        let persisted: Option<ConfigurationRunState> =
            read_value(harness.store.as_ref(), CONFIGURATION_RUN_KEY).expect("read configuration");
        assert!(persisted.is_none());
    }

    #[tokio::test]
    async fn configuration_queue_holds_snapshots() {
        let mut harness = harness(1);
        let mut library = vec![workflow("a", 1), workflow("b", 1)];
        harness
            .orchestrator
            .start_configuration_run(&library, RunOptions::default())
            .await
            .expect("start configuration");
        library[1].steps.clear();

        harness
            .orchestrator
            .complete(CompletionEvent::default())
            .await
            .expect("completion");
        assert_eq!(harness.surface.last_payload().workflow.steps.len(), 1);
    }

    #[tokio::test]
    async fn standalone_start_discards_stale_configuration() {
        let mut harness = harness(2);
        harness
            .orchestrator
            .start_configuration_run(&[workflow("a", 1), workflow("b", 1)], RunOptions::default())
            .await
            .expect("start configuration");
        harness
            .orchestrator
            .fail(ErrorEvent {
                message: "boom".into(),
                ..ErrorEvent::default()
            })
            .expect("fail");
        assert!(harness.orchestrator.configuration().is_some());

        harness
            .orchestrator
            .start(workflow("c", 1), RunOptions::default())
            .await
            .expect("standalone start");
        assert!(harness.orchestrator.configuration().is_none());
        let persisted: Option<ConfigurationRunState> =
            read_value(harness.store.as_ref(), CONFIGURATION_RUN_KEY).expect("read configuration");
        assert!(persisted.is_none());
    }

    #[tokio::test]
    async fn chained_failure_resumes_inside_the_chain() {
        let mut harness = harness(3);
        harness
            .orchestrator
            .start_configuration_run(&[workflow("a", 1), workflow("b", 1)], RunOptions::default())
            .await
            .expect("start configuration");
        harness
            .orchestrator
            .fail(ErrorEvent {
                message: "boom".into(),
                ..ErrorEvent::default()
            })
            .expect("fail");

        harness
            .orchestrator
            .resume_from_failure(ResumeMode::Next)
            .await
            .expect("resume");
        let resumed = harness.surface.last_payload();
        assert_eq!(resumed.workflow.id, "a");
        assert_eq!(resumed.meta.queue_key.as_deref(), Some("0:a"));

        harness
            .orchestrator
            .complete(CompletionEvent {
                queue_key: Some("0:a".into()),
                ..CompletionEvent::default()
            })
            .await
            .expect("completion");
        assert_eq!(harness.surface.last_payload().workflow.id, "b");
    }

    #[tokio::test]
    async fn empty_configuration_is_rejected() {
        let mut harness = harness(1);
        assert!(matches!(
            harness
                .orchestrator
                .start_configuration_run(&[], RunOptions::default())
                .await,
            Err(OrchestratorError::EmptyConfiguration)
        ));
    }

    #[tokio::test]
    async fn pause_and_resume_follow_the_run_phase() {
        let mut harness = harness(2);
        assert!(!harness.orchestrator.pause().await.expect("pause while idle"));

        harness
            .orchestrator
            .start(workflow("orders", 1), RunOptions::default())
            .await
            .expect("start");
        assert!(!harness.orchestrator.resume().await.expect("resume while running"));
        assert!(harness.orchestrator.pause().await.expect("pause"));
        assert!(!harness.orchestrator.pause().await.expect("second pause"));
        assert!(harness.orchestrator.state().is_paused());
        assert!(harness.orchestrator.resume().await.expect("resume"));

        let controls: Vec<&'static str> = harness
            .surface
            .messages()
            .iter()
            .map(SurfaceMessage::name)
            .collect();
        assert_eq!(controls, vec!["executeWorkflow", "pauseWorkflow", "resumeWorkflow"]);
    }

    #[tokio::test]
    async fn stop_requires_confirmation() {
        let mut harness = harness(2);
        harness
            .orchestrator
            .start_configuration_run(&[workflow("a", 1), workflow("b", 1)], RunOptions::default())
            .await
            .expect("start configuration");

        assert!(!harness.orchestrator.stop(false).await.expect("unconfirmed stop"));
        assert!(harness.orchestrator.state().is_running());

        assert!(harness.orchestrator.stop(true).await.expect("stop"));
        assert_eq!(harness.orchestrator.state().phase(), RunPhase::Stopped);
        assert!(harness.orchestrator.configuration().is_none());
        assert_eq!(
            harness.surface.messages().last().map(SurfaceMessage::name),
            Some("stopWorkflow")
        );
        assert!(drain(&mut harness.notices).contains(&RunNotice::Stopped {
            workflow_id: Some("a".into())
        }));

        harness
            .orchestrator
            .complete(CompletionEvent {
                queue_key: Some("0:a".into()),
                ..CompletionEvent::default()
            })
            .await
            .expect("late completion");
        assert_eq!(harness.surface.payloads().len(), 1);
    }

    fn navigation_state() -> NavigationState {
        NavigationState {
            workflow: workflow("orders", 4),
            next_step_index: 2,
            current_row_index: 3,
            data: vec![DataRow::new(); 10],
            target_menu_item_name: Some("Sales Orders".into()),
            wait_for_load: true,
            run_options: windowed(1, Some(5)),
            meta: RunMeta::default(),
        }
    }

    #[tokio::test]
    async fn navigation_resume_dispatches_remaining_steps() {
        let mut harness = harness(0);
        let run_id = harness
            .orchestrator
            .resume_after_navigation(navigation_state())
            .await
            .expect("resume")
            .expect("dispatched");

        let payload = harness.surface.last_payload();
        assert_eq!(payload.run_id, run_id);
        let indices: Vec<Option<usize>> = payload
            .workflow
            .steps
            .iter()
            .map(|step| step.body().original_index)
            .collect();
        assert_eq!(indices, vec![Some(2), Some(3)]);
        assert_eq!(payload.run_options.skip_rows, 3);
        assert_eq!(payload.run_options.limit_rows, Some(3));
        assert_eq!(payload.continuation.map(|full| full.steps.len()), Some(4));
        assert_eq!(payload.meta.resume_window, Some(RowWindow { skip: 1, limit: Some(5) }));

        let state = harness.orchestrator.state();
        assert!(state.is_running());
        assert_eq!(state.current_step_index(), 2);
        assert_eq!(state.current_row(), 3);
        assert_eq!(state.total_steps(), 4);
    }

    #[tokio::test]
    async fn duplicate_navigation_resume_is_suppressed() {
        let mut harness = harness(0);
        harness
            .orchestrator
            .resume_after_navigation(navigation_state())
            .await
            .expect("first resume");
        let duplicate = harness
            .orchestrator
            .resume_after_navigation(navigation_state())
            .await
            .expect("duplicate resume");

        assert!(duplicate.is_none());
        assert_eq!(harness.surface.payloads().len(), 1);
    }

    #[tokio::test]
    async fn pending_navigation_is_consumed_once() {
        let mut harness = harness(0);
        harness
            .orchestrator
            .persist_navigation_state(&navigation_state())
            .expect("persist navigation");

        assert!(
            harness
                .orchestrator
                .resume_pending_navigation()
                .await
                .expect("resume pending")
                .is_some()
        );
        let leftover: Option<NavigationState> =
            read_value(harness.store.as_ref(), PENDING_NAVIGATION_KEY).expect("read navigation");
        assert!(leftover.is_none());
        assert!(
            harness
                .orchestrator
                .resume_pending_navigation()
                .await
                .expect("nothing pending")
                .is_none()
        );
    }

    #[tokio::test]
    async fn subworkflows_are_expanded_before_dispatch() {
        let mut harness = harness(1);
        let child: Workflow = serde_json::from_value(json!({
            "id": "login",
            "steps": [{ "type": "input", "value": "${user}" }, { "type": "click" }]
        }))
        .expect("child workflow");
        harness.orchestrator.set_workflows(vec![child]).expect("library");
        let root: Workflow = serde_json::from_value(json!({
            "id": "root",
            "steps": [
                { "type": "subworkflow", "subworkflowId": "login", "paramBindings": {
                    "user": { "valueSource": "static", "value": "admin" }
                } },
                { "type": "wait" }
            ]
        }))
        .expect("root workflow");

        harness.orchestrator.start(root, RunOptions::default()).await.expect("start");
        let payload = harness.surface.last_payload();
        assert_eq!(payload.workflow.steps.len(), 3);
        assert_eq!(payload.workflow.steps[0].body().str_field("value"), Some("admin"));
        assert_eq!(harness.orchestrator.state().total_steps(), 3);
    }

    #[tokio::test]
    async fn expansion_errors_reset_the_launch() {
        let mut harness = harness(1);
        let root: Workflow = serde_json::from_value(json!({
            "id": "root",
            "steps": [{ "type": "subworkflow", "subworkflowId": "ghost" }]
        }))
        .expect("root workflow");

        let result = harness.orchestrator.start(root, RunOptions::default()).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::Expansion(ExpansionError::MissingWorkflow { .. }))
        ));
        assert!(harness.orchestrator.state().is_idle());
        assert!(harness.surface.messages().is_empty());
    }

    #[tokio::test]
    async fn flat_workflow_with_unbound_parameter_is_rejected() {
        let mut harness = harness(1);
        let root: Workflow = serde_json::from_value(json!({
            "id": "root",
            "steps": [{ "type": "navigate", "url": "https://${host}/orders" }, { "type": "click" }]
        }))
        .expect("root workflow");

        let result = harness.orchestrator.start(root, RunOptions::default()).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::Expansion(ExpansionError::MissingParameters { ref names, .. })) if names == &["host"]
        ));
        assert!(harness.orchestrator.state().is_idle());
        assert!(harness.surface.messages().is_empty());
    }

    #[tokio::test]
    async fn fresh_start_continues_from_the_failed_row() {
        let mut harness = harness(5);
        let run_id = harness
            .orchestrator
            .start(workflow("orders", 1), RunOptions::default())
            .await
            .expect("start");
        harness
            .orchestrator
            .handle_progress(ProgressEvent::row_start(3, 5).for_run(&run_id));
        harness
            .orchestrator
            .fail(ErrorEvent {
                run_id: Some(run_id),
                message: "boom".into(),
                ..ErrorEvent::default()
            })
            .expect("fail");

        harness
            .orchestrator
            .start(workflow("orders", 1), RunOptions::default())
            .await
            .expect("restart");
        assert_eq!(harness.surface.last_payload().run_options.skip_rows, 3);
        assert_eq!(harness.orchestrator.state().current_row(), 3);

        harness.orchestrator.stop(true).await.expect("stop");
        harness
            .orchestrator
            .start(workflow("orders", 1), windowed(1, Some(2)))
            .await
            .expect("explicit window");
        assert_eq!(harness.surface.last_payload().run_options.skip_rows, 1);
    }

    #[tokio::test]
    async fn restore_keeps_workflows_with_unknown_step_types() {
        let harness = harness(1);
        let recorded: Workflow = serde_json::from_value(json!({
            "id": "consent",
            "steps": [{ "type": "checkbox", "selector": "#terms" }, { "type": "click" }]
        }))
        .expect("workflow");
        write_value(harness.store.as_ref(), WORKFLOWS_KEY, &vec![recorded]).expect("persist library");

        let mut restarted = Orchestrator::new(
            OrchestratorConfig::default(),
            harness.surface.clone(),
            Arc::new(InlineRowResolver::single_pass()),
            harness.store.clone(),
        );
        restarted.restore().expect("restore");
        assert_eq!(restarted.workflows().len(), 1);

        let consent = restarted.workflows()[0].clone();
        restarted.start(consent, RunOptions::default()).await.expect("start");
        let payload = harness.surface.last_payload();
        assert_eq!(payload.workflow.steps[0].kind(), "checkbox");
        assert_eq!(payload.workflow.steps[0].body().str_field("selector"), Some("#terms"));
    }

    #[tokio::test]
    async fn restore_reloads_persisted_bookkeeping() {
        let mut harness = harness(5);
        harness
            .orchestrator
            .set_workflows(vec![workflow("orders", 1)])
            .expect("library");
        harness
            .orchestrator
            .start(workflow("orders", 1), RunOptions::default())
            .await
            .expect("start");
        harness
            .orchestrator
            .fail(ErrorEvent {
                message: "boom".into(),
                ..ErrorEvent::default()
            })
            .expect("fail");

        let mut restarted = Orchestrator::new(
            OrchestratorConfig::default(),
            harness.surface.clone(),
            Arc::new(InlineRowResolver::single_pass()),
            harness.store.clone(),
        );
        restarted.restore().expect("restore");
        assert_eq!(restarted.workflows().len(), 1);
        assert_eq!(restarted.resume_skip_for("orders"), Some(0));
        assert_eq!(restarted.last_failure().map(|failure| failure.message.as_str()), Some("boom"));
    }

    #[tokio::test]
    async fn library_changes_rebuild_the_handler_repository() {
        let mut harness = harness(1);
        let with_handler: Workflow = serde_json::from_value(json!({
            "id": "a",
            "unexpectedEventHandlers": [{ "trigger": { "kind": "dialog", "textTemplate": "Order 1 locked" } }]
        }))
        .expect("workflow");
        let duplicate: Workflow = serde_json::from_value(json!({
            "id": "b",
            "unexpectedEventHandlers": [{ "trigger": { "kind": "dialog", "textTemplate": "order 2 locked" } }]
        }))
        .expect("workflow");

        harness
            .orchestrator
            .set_workflows(vec![with_handler, duplicate])
            .expect("library");
        assert_eq!(harness.orchestrator.handler_repository().len(), 1);

        assert!(harness.orchestrator.delete_workflow("a").expect("delete"));
        assert!(!harness.orchestrator.delete_workflow("a").expect("delete again"));
        assert_eq!(
            harness.orchestrator.handler_repository()[0].trigger.text_template,
            "order 2 locked"
        );
        let persisted: Option<Vec<InterruptionHandler>> =
            read_value(harness.store.as_ref(), HANDLER_REPOSITORY_KEY).expect("read repository");
        assert_eq!(persisted.map(|handlers| handlers.len()), Some(1));
    }
}
