//! Interruption handler normalization, deduplication, and generalization.
//!
//! - [`normalize`]: canonical text used for handler identity
//! - [`signature`]: handler identity and merge helpers
//! - [`unify`]: LCS-based pattern generalization and validation

pub mod normalize;
pub mod signature;
pub mod unify;

use rowpilot_types::{InterruptionHandler, InterruptionTrigger, MatchMode, Workflow};
use tracing::debug;

pub use normalize::{normalize_for_match, normalize_text};
pub use signature::{dedupe_handlers, handler_signature, merge_handlers};
pub use unify::{
    PatternValidation, TextMatch, compute_lcs, compute_unified_pattern, handler_regex, has_placeholders, pattern_to_regex,
    validate_pattern_against_texts,
};

use unify::PatternMatcher;

/// Returns true when `text` is an occurrence of the event `trigger` describes.
///
/// Regex triggers with an explicit `regex` use it verbatim; otherwise the text template is matched
/// the same way [`validate_pattern_against_texts`] does.
pub fn trigger_matches(trigger: &InterruptionTrigger, text: &str) -> bool {
    let explicit = trigger
        .regex
        .as_deref()
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty());
    let matcher = match (trigger.match_mode, explicit) {
        (MatchMode::Regex, Some(source)) => PatternMatcher::from_regex_source(source),
        (mode, _) => PatternMatcher::compile(&trigger.text_template, mode),
    };
    matcher.matches(text)
}

/// Finds the first enabled handler whose trigger matches the observed event.
pub fn find_matching_handler<'a>(handlers: &'a [InterruptionHandler], kind: &str, text: &str) -> Option<&'a InterruptionHandler> {
    handlers.iter().find(|handler| {
        handler.enabled
            && (handler.trigger.kind.is_empty() || handler.trigger.kind.eq_ignore_ascii_case(kind))
            && trigger_matches(&handler.trigger, text)
    })
}

/// Merges several recordings of the same interruption into one generalized handler.
///
/// The first handler supplies actions, outcome, and mode. When the unified text has placeholders
/// the trigger switches to regex mode with the generated expression.
pub fn unify_handlers(handlers: &[InterruptionHandler]) -> Option<InterruptionHandler> {
    let first = handlers.first()?;
    let texts: Vec<&str> = handlers
        .iter()
        .map(|handler| handler.trigger.text_template.as_str())
        .collect();
    let pattern = compute_unified_pattern(&texts);

    let mut unified = first.clone();
    if let Some(regex) = handler_regex(&pattern) {
        unified.trigger.match_mode = MatchMode::Regex;
        unified.trigger.regex = Some(regex);
    }
    unified.trigger.text_template = pattern;
    debug!(
        merged = handlers.len(),
        pattern = %unified.trigger.text_template,
        "unified interruption handlers"
    );
    Some(unified)
}

/// Builds the global handler repository from every workflow in the library.
///
/// Handlers are deduplicated by signature; the first workflow that recorded a handler wins.
pub fn build_handler_repository(workflows: &[Workflow]) -> Vec<InterruptionHandler> {
    dedupe_handlers(workflows.iter().flat_map(|workflow| workflow.unexpected_event_handlers.iter()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowpilot_types::{HandlerAction, HandlerOutcome};

    fn handler(kind: &str, text: &str) -> InterruptionHandler {
        InterruptionHandler {
            trigger: InterruptionTrigger {
                kind: kind.into(),
                text_template: text.into(),
                ..InterruptionTrigger::default()
            },
            actions: vec![HandlerAction {
                action_type: "click".into(),
                target: Some("OK".into()),
                value: None,
            }],
            outcome: HandlerOutcome::RetryStep,
            ..InterruptionHandler::default()
        }
    }

    #[test]
    fn unify_switches_to_regex_when_texts_differ() {
        let unified = unify_handlers(&[
            handler("dialog", "Order 100 is locked by Alice"),
            handler("dialog", "Order 200 is locked by Bob"),
        ])
        .expect("unified handler");

        assert_eq!(unified.trigger.text_template, "Order {variable} is locked by {variable2}");
        assert_eq!(unified.trigger.match_mode, MatchMode::Regex);
        assert_eq!(unified.outcome, HandlerOutcome::RetryStep);
        assert!(trigger_matches(&unified.trigger, "ORDER 300 is locked by Carol"));
        assert!(!trigger_matches(&unified.trigger, "Order 300 was deleted"));
    }

    #[test]
    fn unify_keeps_contains_mode_for_identical_texts() {
        let unified = unify_handlers(&[handler("dialog", "Session expired"), handler("dialog", "session EXPIRED")])
            .expect("unified handler");
        assert_eq!(unified.trigger.text_template, "Session expired");
        assert_eq!(unified.trigger.match_mode, MatchMode::Contains);
        assert!(unified.trigger.regex.is_none());
        assert!(unify_handlers(&[]).is_none());
    }

    #[test]
    fn explicit_regex_wins_in_regex_mode() {
        let mut trigger = handler("dialog", "ignored text").trigger;
        trigger.match_mode = MatchMode::Regex;
        trigger.regex = Some(r"^posting date \d+ is not allowed".into());
        assert!(trigger_matches(&trigger, "Posting date 2024 is not allowed"));
        assert!(!trigger_matches(&trigger, "ignored text"));
    }

    #[test]
    fn finds_first_enabled_handler_of_matching_kind() {
        let mut disabled = handler("dialog", "Session expired");
        disabled.enabled = false;
        let toast = handler("toast", "Session expired");
        let dialog = handler("dialog", "Session expired");
        let handlers = vec![disabled, toast, dialog.clone()];

        let found = find_matching_handler(&handlers, "Dialog", "Your session expired.").expect("handler");
        assert_eq!(found, &dialog);
        assert!(find_matching_handler(&handlers, "dialog", "Something else").is_none());
    }

    #[test]
    fn repository_deduplicates_across_workflows() {
        let first = Workflow {
            id: "a".into(),
            unexpected_event_handlers: vec![handler("dialog", "Order 1 locked")],
            ..Workflow::default()
        };
        let second = Workflow {
            id: "b".into(),
            unexpected_event_handlers: vec![handler("dialog", "order 2 LOCKED"), handler("dialog", "Session expired")],
            ..Workflow::default()
        };

        let repository = build_handler_repository(&[first, second]);
        assert_eq!(repository.len(), 2);
        assert_eq!(repository[0].trigger.text_template, "Order 1 locked");
    }
}
