//! In-process execution surface that walks dispatched payloads and streams surface events.
//!
//! [`LoopbackSurface`] stands in for the page-side executor: every `executeWorkflow` message spawns
//! a Tokio task that iterates the payload's row window and steps, emitting the same progress,
//! completion, and error events a real surface would. Pause, resume, and stop messages are
//! forwarded to the active task over a control channel. It is used by the CLI's dry-run mode and
//! by the orchestrator's integration tests.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rowpilot_types::{CompletionEvent, ErrorEvent, ExecutePayload, ProgressEvent, SurfaceEvent, SurfaceMessage, WorkflowStep};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError, unbounded_channel};
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::workflow::surface::{Destination, ExecutionSurface};

const LOOPBACK_DESTINATION: &str = "loopback";

/// A step that should fail when reached, addressed by absolute row and step index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectedFailure {
    pub row: usize,
    pub step: usize,
}

/// Execution surface that runs payloads in-process.
pub struct LoopbackSurface {
    event_tx: UnboundedSender<SurfaceEvent>,
    control_tx: Mutex<Option<UnboundedSender<SurfaceMessage>>>,
    failure: Option<InjectedFailure>,
    step_delay: Duration,
}

impl LoopbackSurface {
    /// Creates a surface together with the receiver its events arrive on.
    pub fn new() -> (Self, UnboundedReceiver<SurfaceEvent>) {
        let (event_tx, event_rx) = unbounded_channel();
        let surface = Self {
            event_tx,
            control_tx: Mutex::new(None),
            failure: None,
            step_delay: Duration::ZERO,
        };
        (surface, event_rx)
    }

    /// Fails the given step whenever it runs on the given row.
    pub fn with_failure(mut self, failure: InjectedFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Sleeps between steps so pause and stop can land mid-run.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    fn forward_control(&self, message: SurfaceMessage) -> Result<(), DispatchError> {
        let name = message.name();
        let guard = self.control_tx.lock().map_err(|_| DispatchError::SendFailed {
            message: name,
            reason: "control channel lock poisoned".into(),
        })?;
        let Some(control_tx) = guard.as_ref() else {
            return Err(DispatchError::SendFailed {
                message: name,
                reason: "no workflow is executing".into(),
            });
        };
        control_tx.send(message).map_err(|error| DispatchError::SendFailed {
            message: name,
            reason: error.to_string(),
        })
    }
}

#[async_trait]
impl ExecutionSurface for LoopbackSurface {
    async fn acquire(&self) -> Result<Destination, DispatchError> {
        Ok(Destination::new(LOOPBACK_DESTINATION))
    }

    async fn send(&self, destination: &Destination, message: SurfaceMessage) -> Result<(), DispatchError> {
        if destination.id != LOOPBACK_DESTINATION {
            return Err(DispatchError::UnsupportedDestination(destination.id.clone()));
        }
        match message {
            SurfaceMessage::ExecuteWorkflow(payload) => {
                let (control_tx, control_rx) = unbounded_channel();
                {
                    let mut guard = self.control_tx.lock().map_err(|_| DispatchError::SendFailed {
                        message: "executeWorkflow",
                        reason: "control channel lock poisoned".into(),
                    })?;
                    *guard = Some(control_tx);
                }
                let event_tx = self.event_tx.clone();
                let failure = self.failure;
                let step_delay = self.step_delay;
                tokio::spawn(async move {
                    let run_id = payload.run_id.clone();
                    if let Err(error) = drive_payload(payload, failure, step_delay, control_rx, event_tx).await {
                        warn!(run_id = %run_id, error = %error, "loopback run ended early");
                    }
                });
                Ok(())
            }
            other => self.forward_control(other),
        }
    }
}

/// Walks one payload to completion, failure, or stop.
pub async fn drive_payload(
    payload: ExecutePayload,
    failure: Option<InjectedFailure>,
    step_delay: Duration,
    mut control_rx: UnboundedReceiver<SurfaceMessage>,
    event_tx: UnboundedSender<SurfaceEvent>,
) -> Result<()> {
    let run_id = payload.run_id.clone();
    let total_rows = payload.data.len();
    let rows = payload.run_options.window().range(total_rows);
    let mut control_state = ControlState::new();
    let mut first_row = true;

    debug!(run_id = %run_id, rows = ?rows, steps = payload.workflow.steps.len(), "loopback run started");

    'rows: for row in rows {
        if !control_state.checkpoint(&mut control_rx).await {
            break;
        }
        emit(&event_tx, SurfaceEvent::Progress(ProgressEvent::row_start(row, total_rows).for_run(&run_id)))?;

        let steps: &[WorkflowStep] = match (&payload.continuation, first_row) {
            (Some(full), false) => &full.steps,
            _ => &payload.workflow.steps,
        };
        first_row = false;

        for (position, step) in steps.iter().enumerate() {
            if !control_state.checkpoint(&mut control_rx).await {
                break 'rows;
            }
            let step_index = step.body().original_index.unwrap_or(position);
            let step_name = step.display_name();
            emit(&event_tx, SurfaceEvent::Progress(ProgressEvent::step_start(step_index, &step_name).for_run(&run_id)))?;

            if !step_delay.is_zero() {
                tokio::time::sleep(step_delay).await;
            }

            if failure == Some(InjectedFailure { row, step: step_index }) {
                emit(
                    &event_tx,
                    SurfaceEvent::Error(ErrorEvent {
                        run_id: Some(run_id.clone()),
                        step_index: Some(step_index),
                        step: Some(step_name),
                        message: format!("step {step_index} failed on row {row}"),
                    }),
                )?;
                return Ok(());
            }

            if matches!(step, WorkflowStep::LoopStart(_)) {
                emit(&event_tx, SurfaceEvent::Progress(ProgressEvent::loop_iteration(1, 1).for_run(&run_id)))?;
            }
            emit(&event_tx, SurfaceEvent::Progress(ProgressEvent::step_done(step_index, &step_name).for_run(&run_id)))?;
        }
    }

    if control_state.cancel_requested {
        debug!(run_id = %run_id, "loopback run stopped");
        return Ok(());
    }

    emit(
        &event_tx,
        SurfaceEvent::Complete(CompletionEvent {
            run_id: Some(run_id),
            configuration_run_id: payload.meta.configuration_run_id.clone(),
            queue_key: payload.meta.queue_key.clone(),
        }),
    )
}

fn emit(event_tx: &UnboundedSender<SurfaceEvent>, event: SurfaceEvent) -> Result<()> {
    event_tx
        .send(event)
        .map_err(|error| anyhow!("failed to emit surface event: {}", error))
}

struct ControlState {
    paused: bool,
    cancel_requested: bool,
}

impl ControlState {
    fn new() -> Self {
        Self {
            paused: false,
            cancel_requested: false,
        }
    }

    /// Applies queued control messages and waits out a pause. Returns false once a stop arrived.
    async fn checkpoint(&mut self, control_rx: &mut UnboundedReceiver<SurfaceMessage>) -> bool {
        self.drain_pending_commands(control_rx);
        while self.paused && !self.cancel_requested {
            match control_rx.recv().await {
                Some(message) => self.process_command(message),
                None => break,
            }
        }
        !self.cancel_requested
    }

    fn drain_pending_commands(&mut self, control_rx: &mut UnboundedReceiver<SurfaceMessage>) {
        loop {
            match control_rx.try_recv() {
                Ok(message) => self.process_command(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn process_command(&mut self, message: SurfaceMessage) {
        match message {
            SurfaceMessage::PauseWorkflow => {
                if !self.paused && !self.cancel_requested {
                    self.paused = true;
                }
            }
            SurfaceMessage::ResumeWorkflow => self.paused = false,
            SurfaceMessage::StopWorkflow => {
                self.cancel_requested = true;
                self.paused = false;
            }
            SurfaceMessage::ExecuteWorkflow(_) => debug!("ignoring nested execute request"),
        }
    }
}
