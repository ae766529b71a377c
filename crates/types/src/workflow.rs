//! Strongly typed workflow schema definitions shared across the engine and CLI.
//!
//! Workflows are authored elsewhere and arrive as camelCase JSON. Steps stay opaque to the
//! engine except for the fields it substitutes into and the `subworkflow` control fields, so
//! every step variant carries its remaining keys in an insertion-ordered JSON map.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Authored, ordered list of automation steps plus error defaults and learned interruption handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Canonical workflow identifier used for lookups, resume bookkeeping, and cycle detection.
    pub id: String,
    /// Human-readable name surfaced in validation messages.
    #[serde(default)]
    pub name: String,
    /// Ordered execution steps.
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Default error-handling settings for the run.
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Handlers for unexpected dialogs or messages encountered during execution.
    #[serde(default)]
    pub unexpected_event_handlers: Vec<InterruptionHandler>,
}

impl Workflow {
    /// Returns the display label used in diagnostics (name, falling back to the identifier).
    pub fn label(&self) -> &str {
        if self.name.trim().is_empty() { &self.id } else { &self.name }
    }

    /// Returns true when at least one step references another workflow.
    pub fn has_subworkflows(&self) -> bool {
        self.steps.iter().any(|step| step.as_subworkflow().is_some())
    }

    /// Returns true when the workflow contains loop constructs.
    pub fn has_loops(&self) -> bool {
        self.steps.iter().any(WorkflowStep::is_loop_construct)
    }
}

/// Workflow-level defaults applied by the execution surface when a step fails.
///
/// Every field is optional so a workflow can override individual defaults; the orchestrator merges
/// the workflow values over the runner-wide defaults before dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_default_mode: Option<ErrorDefaultMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_default_retry_count: Option<u32>,
    /// Delay between retries in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_default_retry_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_default_goto_label: Option<String>,
}

impl WorkflowSettings {
    /// Overlays `self` on top of `defaults`, keeping any value the workflow sets explicitly.
    pub fn merged_over(&self, defaults: &WorkflowSettings) -> WorkflowSettings {
        WorkflowSettings {
            error_default_mode: self.error_default_mode.or(defaults.error_default_mode),
            error_default_retry_count: self.error_default_retry_count.or(defaults.error_default_retry_count),
            error_default_retry_delay: self.error_default_retry_delay.or(defaults.error_default_retry_delay),
            error_default_goto_label: self
                .error_default_goto_label
                .clone()
                .or_else(|| defaults.error_default_goto_label.clone()),
        }
    }
}

/// What the execution surface does by default when a step fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorDefaultMode {
    /// Stop the run and report the failure.
    Stop,
    /// Abandon the current row and continue with the next one.
    SkipRow,
    /// Retry the failing step `errorDefaultRetryCount` times.
    Retry,
    /// Jump to the step labelled `errorDefaultGotoLabel`.
    GotoLabel,
}

/// Opaque step payload shared by every non-subworkflow step variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepBody {
    /// Optional human-readable step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Absolute index in the full step list when the step was dispatched from a truncated list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_index: Option<usize>,
    /// Remaining step fields, opaque to the engine apart from parameter substitution.
    #[serde(flatten)]
    pub fields: JsonMap<String, JsonValue>,
}

impl StepBody {
    /// Convenience constructor used by tests and tooling.
    pub fn with_fields(fields: JsonMap<String, JsonValue>) -> Self {
        Self {
            name: None,
            original_index: None,
            fields,
        }
    }

    /// Returns the string value stored under `key`, if any.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(JsonValue::as_str)
    }
}

/// Control fields of a step that inlines another workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubworkflowCall {
    /// Identifier of the referenced workflow.
    pub subworkflow_id: String,
    /// Parameter bindings handed to the referenced workflow.
    #[serde(default)]
    pub param_bindings: ParamBindings,
    #[serde(flatten)]
    pub body: StepBody,
}

/// A single workflow step keyed by its `type`.
///
/// Step types the engine has no special handling for are kept as [`WorkflowStep::Other`] with
/// their wire name, so a workflow recorded by a newer recorder still loads and runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "JsonMap<String, JsonValue>", into = "JsonMap<String, JsonValue>")]
pub enum WorkflowStep {
    Click(StepBody),
    Input(StepBody),
    Select(StepBody),
    Navigate(StepBody),
    Wait(StepBody),
    Keypress(StepBody),
    Extract(StepBody),
    LoopStart(StepBody),
    LoopEnd(StepBody),
    Subworkflow(SubworkflowCall),
    Other { step_type: String, body: StepBody },
}

impl TryFrom<JsonMap<String, JsonValue>> for WorkflowStep {
    type Error = String;

    fn try_from(mut raw: JsonMap<String, JsonValue>) -> Result<Self, Self::Error> {
        let step_type = match raw.remove("type") {
            Some(JsonValue::String(step_type)) => step_type,
            Some(other) => return Err(format!("step `type` must be a string, got {other}")),
            None => return Err("missing field `type`".into()),
        };
        let raw = JsonValue::Object(raw);
        let body = |raw: JsonValue| {
            serde_json::from_value::<StepBody>(raw).map_err(|error| format!("invalid {step_type} step: {error}"))
        };

        Ok(match step_type.as_str() {
            "click" => Self::Click(body(raw)?),
            "input" => Self::Input(body(raw)?),
            "select" => Self::Select(body(raw)?),
            "navigate" => Self::Navigate(body(raw)?),
            "wait" => Self::Wait(body(raw)?),
            "keypress" => Self::Keypress(body(raw)?),
            "extract" => Self::Extract(body(raw)?),
            "loop-start" => Self::LoopStart(body(raw)?),
            "loop-end" => Self::LoopEnd(body(raw)?),
            "subworkflow" => {
                Self::Subworkflow(serde_json::from_value(raw).map_err(|error| format!("invalid subworkflow step: {error}"))?)
            }
            _ => Self::Other {
                step_type: step_type.clone(),
                body: body(raw)?,
            },
        })
    }
}

impl From<WorkflowStep> for JsonMap<String, JsonValue> {
    fn from(step: WorkflowStep) -> Self {
        let step_type = step.kind().to_string();
        let encoded = match step {
            WorkflowStep::Subworkflow(call) => serde_json::to_value(call),
            other => serde_json::to_value(other.into_body()),
        };
        let mut raw = match encoded {
            Ok(JsonValue::Object(raw)) => raw,
            _ => JsonMap::new(),
        };
        raw.insert("type".into(), JsonValue::String(step_type));
        raw
    }
}

impl WorkflowStep {
    /// Wire name of the step type.
    pub fn kind(&self) -> &str {
        match self {
            Self::Click(_) => "click",
            Self::Input(_) => "input",
            Self::Select(_) => "select",
            Self::Navigate(_) => "navigate",
            Self::Wait(_) => "wait",
            Self::Keypress(_) => "keypress",
            Self::Extract(_) => "extract",
            Self::LoopStart(_) => "loop-start",
            Self::LoopEnd(_) => "loop-end",
            Self::Subworkflow(_) => "subworkflow",
            Self::Other { step_type, .. } => step_type,
        }
    }

    pub fn body(&self) -> &StepBody {
        match self {
            Self::Click(body)
            | Self::Input(body)
            | Self::Select(body)
            | Self::Navigate(body)
            | Self::Wait(body)
            | Self::Keypress(body)
            | Self::Extract(body)
            | Self::LoopStart(body)
            | Self::LoopEnd(body)
            | Self::Other { body, .. } => body,
            Self::Subworkflow(call) => &call.body,
        }
    }

    pub fn body_mut(&mut self) -> &mut StepBody {
        match self {
            Self::Click(body)
            | Self::Input(body)
            | Self::Select(body)
            | Self::Navigate(body)
            | Self::Wait(body)
            | Self::Keypress(body)
            | Self::Extract(body)
            | Self::LoopStart(body)
            | Self::LoopEnd(body)
            | Self::Other { body, .. } => body,
            Self::Subworkflow(call) => &mut call.body,
        }
    }

    fn into_body(self) -> StepBody {
        match self {
            Self::Click(body)
            | Self::Input(body)
            | Self::Select(body)
            | Self::Navigate(body)
            | Self::Wait(body)
            | Self::Keypress(body)
            | Self::Extract(body)
            | Self::LoopStart(body)
            | Self::LoopEnd(body)
            | Self::Other { body, .. } => body,
            Self::Subworkflow(call) => call.body,
        }
    }

    /// Returns the subworkflow control fields when this step references another workflow.
    pub fn as_subworkflow(&self) -> Option<&SubworkflowCall> {
        match self {
            Self::Subworkflow(call) => Some(call),
            _ => None,
        }
    }

    pub fn is_loop_construct(&self) -> bool {
        matches!(self, Self::LoopStart(_) | Self::LoopEnd(_))
    }

    /// Returns true when the step type accepts `data`/`clipboard` value sources for its `value` field.
    pub fn supports_value_source(&self) -> bool {
        matches!(self, Self::Input(_) | Self::Select(_))
    }

    /// Name shown in progress reporting: the authored name, falling back to the step type.
    pub fn display_name(&self) -> String {
        self.body().name.clone().unwrap_or_else(|| self.kind().to_string())
    }
}

/// Normalizes a parameter name so `${Account}` and `${ account }` address the same binding.
pub fn normalize_param_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Resolved source of a parameter's value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "valueSource", rename_all = "camelCase")]
pub enum ParamBinding {
    /// Literal (possibly templated) text.
    Static {
        #[serde(default)]
        value: String,
    },
    /// Column of the current data row.
    #[serde(rename_all = "camelCase")]
    Data { field_mapping: String },
    /// Clipboard contents at execution time.
    Clipboard,
}

impl ParamBinding {
    pub fn static_value(value: impl Into<String>) -> Self {
        Self::Static { value: value.into() }
    }

    pub fn data(field_mapping: impl Into<String>) -> Self {
        Self::Data {
            field_mapping: field_mapping.into(),
        }
    }

    /// Wire name of the binding source.
    pub fn source_name(&self) -> &'static str {
        match self {
            Self::Static { .. } => "static",
            Self::Data { .. } => "data",
            Self::Clipboard => "clipboard",
        }
    }
}

/// Parameter bindings keyed by normalized parameter name, preserving authoring order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "IndexMap<String, ParamBinding>", into = "IndexMap<String, ParamBinding>")]
pub struct ParamBindings {
    entries: IndexMap<String, ParamBinding>,
}

impl ParamBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a binding, normalizing the parameter name.
    pub fn insert(&mut self, name: &str, binding: ParamBinding) -> Option<ParamBinding> {
        self.entries.insert(normalize_param_name(name), binding)
    }

    /// Looks up a binding by (unnormalized) parameter name.
    pub fn get(&self, name: &str) -> Option<&ParamBinding> {
        self.entries.get(&normalize_param_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamBinding)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<IndexMap<String, ParamBinding>> for ParamBindings {
    fn from(raw: IndexMap<String, ParamBinding>) -> Self {
        raw.into_iter().collect()
    }
}

impl From<ParamBindings> for IndexMap<String, ParamBinding> {
    fn from(bindings: ParamBindings) -> Self {
        bindings.entries
    }
}

impl<K: AsRef<str>> FromIterator<(K, ParamBinding)> for ParamBindings {
    fn from_iter<I: IntoIterator<Item = (K, ParamBinding)>>(iter: I) -> Self {
        let mut bindings = ParamBindings::new();
        for (name, binding) in iter {
            bindings.insert(name.as_ref(), binding);
        }
        bindings
    }
}

/// How a trigger's text is compared with the observed event text.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Contains,
    Regex,
}

impl MatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::Regex => "regex",
        }
    }
}

/// Describes the unexpected on-page event a handler reacts to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionTrigger {
    /// Event category (for example `dialog`, `message`, `toast`).
    #[serde(default)]
    pub kind: String,
    /// Observed or generalized text, optionally containing `{placeholder}` tokens.
    #[serde(default)]
    pub text_template: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    /// Explicit regular expression, when authored by hand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

/// Corrective action performed when a handler fires.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandlerAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// What the executor does after a handler's actions ran.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerOutcome {
    #[default]
    NextStep,
    RepeatLoop,
    RetryStep,
    SkipRow,
    StopRun,
}

impl HandlerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NextStep => "next-step",
            Self::RepeatLoop => "repeat-loop",
            Self::RetryStep => "retry-step",
            Self::SkipRow => "skip-row",
            Self::StopRun => "stop-run",
        }
    }
}

/// Whether a handler fires automatically or asks the operator every time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum HandlerMode {
    #[default]
    Auto,
    AlwaysAsk,
}

/// Rule matching an unexpected on-page event to corrective actions and an outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionHandler {
    pub trigger: InterruptionTrigger,
    /// Legacy single-action form kept for handlers recorded by older builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<HandlerAction>,
    #[serde(default)]
    pub actions: Vec<HandlerAction>,
    #[serde(default)]
    pub outcome: HandlerOutcome,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: HandlerMode,
}

impl Default for InterruptionHandler {
    fn default() -> Self {
        Self {
            trigger: InterruptionTrigger::default(),
            action: None,
            actions: Vec::new(),
            outcome: HandlerOutcome::default(),
            enabled: default_enabled(),
            mode: HandlerMode::default(),
        }
    }
}

impl InterruptionHandler {
    /// Returns the handler's actions regardless of whether it uses the legacy `action` field.
    pub fn effective_actions(&self) -> Vec<&HandlerAction> {
        if self.actions.is_empty() {
            self.action.iter().collect()
        } else {
            self.actions.iter().collect()
        }
    }
}

const fn default_enabled() -> bool {
    true
}
