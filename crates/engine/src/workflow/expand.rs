//! Subworkflow flattening.
//!
//! Expansion inlines every `subworkflow` step depth-first, substituting the caller's parameter
//! bindings into the child's steps. The result is a flat list of primitive steps that the execution
//! surface can run without knowing subworkflows exist. Interruption handlers learned on a child are
//! merged into the parent so they stay active while the inlined steps run.

use std::collections::HashMap;

use rowpilot_types::{InterruptionHandler, ParamBinding, ParamBindings, SubworkflowCall, Workflow, WorkflowStep};
use tracing::debug;

use crate::error::ExpansionError;
use crate::interruption::merge_handlers;
use crate::templates::{SubstitutionScope, collect_required_params, single_token_reference, substitute, substitute_step};

/// Default limit on subworkflow nesting.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Flattened workflow plus the non-fatal diagnostics gathered while substituting.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpansionOutput {
    pub workflow: Workflow,
    pub warnings: Vec<String>,
}

/// Expands workflows against a library of referenceable workflows.
#[derive(Debug, Clone)]
pub struct WorkflowExpander<'a> {
    library: HashMap<&'a str, &'a Workflow>,
    max_depth: usize,
}

struct ExpansionFrame {
    steps: Vec<WorkflowStep>,
    handlers: Vec<InterruptionHandler>,
    warnings: Vec<String>,
    stack: Vec<String>,
}

impl<'a> WorkflowExpander<'a> {
    pub fn new(library: &'a [Workflow]) -> Self {
        Self {
            library: library.iter().map(|workflow| (workflow.id.as_str(), workflow)).collect(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Expands `root` with no caller-supplied bindings.
    pub fn expand(&self, root: &Workflow) -> Result<ExpansionOutput, ExpansionError> {
        self.expand_with_bindings(root, &ParamBindings::new())
    }

    /// Expands `root`, substituting `bindings` into its own steps as well as into its children.
    pub fn expand_with_bindings(&self, root: &Workflow, bindings: &ParamBindings) -> Result<ExpansionOutput, ExpansionError> {
        let mut frame = ExpansionFrame {
            steps: Vec::new(),
            handlers: root.unexpected_event_handlers.clone(),
            warnings: Vec::new(),
            stack: vec![root.id.clone()],
        };
        self.expand_into(root, bindings, &mut frame)?;

        debug!(
            workflow = %root.id,
            steps = frame.steps.len(),
            handlers = frame.handlers.len(),
            warnings = frame.warnings.len(),
            "expanded workflow"
        );

        let mut workflow = root.clone();
        workflow.steps = frame.steps;
        workflow.unexpected_event_handlers = frame.handlers;
        Ok(ExpansionOutput {
            workflow,
            warnings: frame.warnings,
        })
    }

    fn expand_into(&self, workflow: &Workflow, bindings: &ParamBindings, frame: &mut ExpansionFrame) -> Result<(), ExpansionError> {
        ensure_parameters_bound(workflow, bindings)?;

        for step in &workflow.steps {
            match step {
                WorkflowStep::Subworkflow(call) => self.inline_call(workflow, call, bindings, frame)?,
                other => {
                    let label = step_label(workflow, other);
                    let scope = SubstitutionScope::new(bindings, &label);
                    frame.steps.push(substitute_step(other, &scope, &mut frame.warnings));
                }
            }
        }
        Ok(())
    }

    fn inline_call(
        &self,
        parent: &Workflow,
        call: &SubworkflowCall,
        parent_bindings: &ParamBindings,
        frame: &mut ExpansionFrame,
    ) -> Result<(), ExpansionError> {
        let target = self
            .library
            .get(call.subworkflow_id.as_str())
            .copied()
            .ok_or_else(|| ExpansionError::MissingWorkflow {
                subworkflow_id: call.subworkflow_id.clone(),
                referenced_by: parent.label().to_string(),
            })?;

        if frame.stack.iter().any(|visited| visited == &target.id) {
            let mut path = frame.stack.clone();
            path.push(target.id.clone());
            return Err(ExpansionError::Cycle { path });
        }
        if frame.stack.len() >= self.max_depth {
            let mut path = frame.stack.clone();
            path.push(target.id.clone());
            return Err(ExpansionError::DepthExceeded {
                max_depth: self.max_depth,
                path,
            });
        }
        if target.has_loops() {
            return Err(ExpansionError::LoopInSubworkflow {
                workflow: target.label().to_string(),
            });
        }

        let label = format!("{} / {}", parent.label(), target.label());
        let child_bindings = resolve_child_bindings(&call.param_bindings, parent_bindings, &label, &mut frame.warnings);

        frame.stack.push(target.id.clone());
        self.expand_into(target, &child_bindings, frame)?;
        frame.stack.pop();

        merge_handlers(&mut frame.handlers, &target.unexpected_event_handlers);
        Ok(())
    }
}

/// Resolves a call's bindings against the caller's own bindings.
///
/// Static values are substituted with the caller's parameters. A static value that is exactly one
/// `${name}` token referring to a caller data or clipboard binding passes that binding through, so
/// value sources survive any number of nesting levels.
pub fn resolve_child_bindings(
    call_bindings: &ParamBindings,
    parent_bindings: &ParamBindings,
    context_label: &str,
    warnings: &mut Vec<String>,
) -> ParamBindings {
    let scope = SubstitutionScope::new(parent_bindings, context_label);
    call_bindings
        .iter()
        .map(|(name, binding)| {
            let resolved = match binding {
                ParamBinding::Static { value } => match single_token_reference(value)
                    .and_then(|reference| parent_bindings.get(&reference))
                {
                    Some(passed @ (ParamBinding::Data { .. } | ParamBinding::Clipboard)) => passed.clone(),
                    _ => ParamBinding::static_value(substitute(value, &scope, warnings)),
                },
                other => other.clone(),
            };
            (name.clone(), resolved)
        })
        .collect()
}

fn ensure_parameters_bound(workflow: &Workflow, bindings: &ParamBindings) -> Result<(), ExpansionError> {
    let mut missing: Vec<String> = Vec::new();
    for step in workflow.steps.iter().filter(|step| step.as_subworkflow().is_none()) {
        for name in collect_required_params(step) {
            if !bindings.contains(&name) && !missing.contains(&name) {
                missing.push(name);
            }
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ExpansionError::MissingParameters {
            workflow: workflow.label().to_string(),
            names: missing,
        })
    }
}

fn step_label(workflow: &Workflow, step: &WorkflowStep) -> String {
    format!("{} / {}", workflow.label(), step.display_name())
}
