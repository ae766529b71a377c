//! `${param}` substitution over step fields.
//!
//! Substitution is best-effort: an unknown parameter, an empty value, or a value source that cannot
//! be rendered as text records a warning and never aborts expansion. Required parameters are
//! validated separately (see [`collect_required_params`]) before any substitution happens.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rowpilot_types::{ParamBinding, ParamBindings, StepBody, WorkflowStep, normalize_param_name};
use serde_json::{Map as JsonMap, Value};

static PARAM_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\\)?\$\{([A-Za-z0-9_]+)\}").expect("parameter token regex should compile"));

static SINGLE_PARAM_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\$\{([A-Za-z0-9_]+)\}\s*$").expect("single token regex should compile"));

/// Nesting depth after which object walks stop substituting.
const MAX_VALUE_DEPTH: usize = 64;

const VALUE_FIELD: &str = "value";
const VALUE_SOURCE_FIELD: &str = "valueSource";
const FIELD_MAPPING_FIELD: &str = "fieldMapping";

/// Bindings and diagnostics label for one substitution pass.
#[derive(Debug, Clone, Copy)]
pub struct SubstitutionScope<'a> {
    pub bindings: &'a ParamBindings,
    /// Prefix of every warning, usually `workflow name / step name`.
    pub context_label: &'a str,
    /// Whether the enclosing step may take its `value` from a data column or the clipboard.
    pub allow_value_source: bool,
}

impl<'a> SubstitutionScope<'a> {
    pub fn new(bindings: &'a ParamBindings, context_label: &'a str) -> Self {
        Self {
            bindings,
            context_label,
            allow_value_source: false,
        }
    }

    pub fn with_value_source(mut self, allowed: bool) -> Self {
        self.allow_value_source = allowed;
        self
    }
}

/// Returns the normalized names of every unescaped `${name}` token in `text`, in order of appearance.
pub fn extract_param_names(text: &str) -> Vec<String> {
    PARAM_TOKEN
        .captures_iter(text)
        .filter(|captures| captures.get(1).is_none())
        .filter_map(|captures| captures.get(2).map(|name| normalize_param_name(name.as_str())))
        .collect()
}

/// Returns the parameter name when `text` consists of exactly one unescaped token.
pub fn single_token_reference(text: &str) -> Option<String> {
    SINGLE_PARAM_TOKEN
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|name| normalize_param_name(name.as_str()))
}

/// Replaces every `${name}` in `text` with its bound static value.
///
/// `\${name}` is emitted literally as `${name}`. Unknown names are left in place. Data and
/// clipboard bindings have no textual value, so their tokens render as the empty string.
pub fn substitute(text: &str, scope: &SubstitutionScope<'_>, warnings: &mut Vec<String>) -> String {
    PARAM_TOKEN
        .replace_all(text, |captures: &Captures<'_>| {
            let raw_name = captures.get(2).map(|name| name.as_str()).unwrap_or_default();
            if captures.get(1).is_some() {
                return format!("${{{raw_name}}}");
            }
            match scope.bindings.get(raw_name) {
                Some(ParamBinding::Static { value }) => {
                    if value.is_empty() {
                        warnings.push(format!("{}: parameter '{raw_name}' resolved to an empty value", scope.context_label));
                    }
                    value.clone()
                }
                Some(binding) => {
                    warnings.push(format!(
                        "{}: parameter '{raw_name}' uses a {} binding, which cannot be embedded in text",
                        scope.context_label,
                        binding.source_name()
                    ));
                    String::new()
                }
                None => {
                    warnings.push(format!("{}: unknown parameter '{raw_name}'", scope.context_label));
                    captures
                        .get(0)
                        .map(|token| token.as_str().to_string())
                        .unwrap_or_default()
                }
            }
        })
        .into_owned()
}

/// Substitutes parameters into every string leaf of `value`.
pub fn substitute_params_in_value(value: &Value, scope: &SubstitutionScope<'_>, warnings: &mut Vec<String>) -> Value {
    substitute_value_at_depth(value, scope, warnings, 0)
}

/// Substitutes parameters into every field of an object, applying value-source rewrites to `value`.
pub fn substitute_params_in_object(
    object: &JsonMap<String, Value>,
    scope: &SubstitutionScope<'_>,
    warnings: &mut Vec<String>,
) -> JsonMap<String, Value> {
    substitute_object_at_depth(object, scope, warnings, 0)
}

fn substitute_value_at_depth(value: &Value, scope: &SubstitutionScope<'_>, warnings: &mut Vec<String>, depth: usize) -> Value {
    if depth > MAX_VALUE_DEPTH {
        warnings.push(format!(
            "{}: value nesting exceeds {MAX_VALUE_DEPTH} levels; deeper fields were left unsubstituted",
            scope.context_label
        ));
        return value.clone();
    }
    match value {
        Value::String(text) => Value::String(substitute(text, scope, warnings)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value_at_depth(item, scope, warnings, depth + 1))
                .collect(),
        ),
        Value::Object(object) => Value::Object(substitute_object_at_depth(object, scope, warnings, depth + 1)),
        other => other.clone(),
    }
}

fn substitute_object_at_depth(
    object: &JsonMap<String, Value>,
    scope: &SubstitutionScope<'_>,
    warnings: &mut Vec<String>,
    depth: usize,
) -> JsonMap<String, Value> {
    let mut substituted = JsonMap::new();
    for (key, nested) in object {
        if key == VALUE_FIELD {
            substituted.insert(key.clone(), nested.clone());
        } else {
            substituted.insert(key.clone(), substitute_value_at_depth(nested, scope, warnings, depth + 1));
        }
    }
    if let Some(raw_value) = object.get(VALUE_FIELD) {
        apply_param_binding_to_value_field(&mut substituted, raw_value, scope, warnings);
    }
    substituted
}

/// Resolves the `value` field of `object`, rewriting `valueSource`/`fieldMapping` when the whole
/// field is a single token bound to a data column or the clipboard.
///
/// Value sources are only honored when `scope.allow_value_source` is set; otherwise the field is
/// emptied and a warning recorded.
pub fn apply_param_binding_to_value_field(
    object: &mut JsonMap<String, Value>,
    raw_value: &Value,
    scope: &SubstitutionScope<'_>,
    warnings: &mut Vec<String>,
) {
    let Some(name) = raw_value.as_str().and_then(single_token_reference) else {
        let resolved = substitute_params_in_value(raw_value, scope, warnings);
        object.insert(VALUE_FIELD.to_string(), resolved);
        return;
    };

    match scope.bindings.get(&name) {
        Some(ParamBinding::Static { value }) => {
            if value.is_empty() {
                warnings.push(format!("{}: parameter '{name}' resolved to an empty value", scope.context_label));
            }
            object.insert(VALUE_FIELD.to_string(), Value::String(value.clone()));
            if object.contains_key(VALUE_SOURCE_FIELD) {
                object.insert(VALUE_SOURCE_FIELD.to_string(), Value::String("static".into()));
            }
            object.remove(FIELD_MAPPING_FIELD);
        }
        Some(binding) if !scope.allow_value_source => {
            warnings.push(format!(
                "{}: parameter '{name}' uses a {} binding, but this step cannot read its value from that source",
                scope.context_label,
                binding.source_name()
            ));
            object.insert(VALUE_FIELD.to_string(), Value::String(String::new()));
        }
        Some(ParamBinding::Data { field_mapping }) => {
            object.insert(VALUE_FIELD.to_string(), Value::String(String::new()));
            object.insert(VALUE_SOURCE_FIELD.to_string(), Value::String("data".into()));
            object.insert(FIELD_MAPPING_FIELD.to_string(), Value::String(field_mapping.clone()));
        }
        Some(ParamBinding::Clipboard) => {
            object.insert(VALUE_FIELD.to_string(), Value::String(String::new()));
            object.insert(VALUE_SOURCE_FIELD.to_string(), Value::String("clipboard".into()));
            object.remove(FIELD_MAPPING_FIELD);
        }
        None => {
            warnings.push(format!("{}: unknown parameter '{name}'", scope.context_label));
            object.insert(VALUE_FIELD.to_string(), raw_value.clone());
        }
    }
}

/// Navigation fields that belong to the mode a navigate step is *not* using.
pub fn inactive_navigation_fields(body: &StepBody) -> &'static [&'static str] {
    match body.str_field("mode") {
        Some(mode) if mode.eq_ignore_ascii_case("menu") => &["url"],
        _ => &["menuItemName", "menuPath"],
    }
}

/// Parameter names a step needs bound before it can run, in order of first appearance.
///
/// Navigate steps only count the fields of their active mode, so a stale `url` left on a menu
/// navigation does not demand a binding.
pub fn collect_required_params(step: &WorkflowStep) -> Vec<String> {
    let body = step.body();
    let skipped: &[&str] = match step {
        WorkflowStep::Navigate(body) => inactive_navigation_fields(body),
        _ => &[],
    };

    let mut names = Vec::new();
    if let Some(name) = &body.name {
        push_unique(&mut names, extract_param_names(name));
    }
    for (key, value) in &body.fields {
        if skipped.contains(&key.as_str()) {
            continue;
        }
        collect_params_from_value(value, &mut names, 0);
    }
    names
}

fn collect_params_from_value(value: &Value, names: &mut Vec<String>, depth: usize) {
    if depth > MAX_VALUE_DEPTH {
        return;
    }
    match value {
        Value::String(text) => push_unique(names, extract_param_names(text)),
        Value::Array(items) => items.iter().for_each(|item| collect_params_from_value(item, names, depth + 1)),
        Value::Object(object) => object
            .values()
            .for_each(|nested| collect_params_from_value(nested, names, depth + 1)),
        _ => {}
    }
}

fn push_unique(names: &mut Vec<String>, found: Vec<String>) {
    for name in found {
        if !names.contains(&name) {
            names.push(name);
        }
    }
}

/// Returns a copy of `step` with every parameter substituted.
///
/// Inactive navigation fields are copied verbatim.
pub fn substitute_step(step: &WorkflowStep, scope: &SubstitutionScope<'_>, warnings: &mut Vec<String>) -> WorkflowStep {
    let scope = scope.with_value_source(step.supports_value_source());
    let skipped: &[&str] = match step {
        WorkflowStep::Navigate(body) => inactive_navigation_fields(body),
        _ => &[],
    };

    let mut substituted = step.clone();
    let body = substituted.body_mut();
    if let Some(name) = &body.name {
        body.name = Some(substitute(name, &scope, warnings));
    }

    let (kept, active): (JsonMap<String, Value>, JsonMap<String, Value>) = body
        .fields
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .partition(|(key, _)| skipped.contains(&key.as_str()));
    let mut fields = substitute_params_in_object(&active, &scope, warnings);
    fields.extend(kept);
    body.fields = fields;
    substituted
}
