//! Handler identity: the signature used to deduplicate handlers and the merge that relies on it.

use rowpilot_types::{InterruptionHandler, MatchMode};
use serde_json::{Value, json};

use super::normalize::normalize_text;

/// Canonical identity of a handler used for deduplication.
///
/// Two handlers share a signature when they react to the same normalized trigger in the same way:
/// same kind, normalized text, match mode, explicit regex (regex mode only), action types and
/// targets, and outcome. `enabled`, `mode`, and action values are not part of the identity.
pub fn handler_signature(handler: &InterruptionHandler) -> String {
    let trigger = &handler.trigger;
    let regex = match trigger.match_mode {
        MatchMode::Regex => trigger
            .regex
            .as_deref()
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| Value::String(pattern.to_string()))
            .unwrap_or(Value::Null),
        MatchMode::Contains => Value::Null,
    };
    let actions: Vec<Value> = handler
        .effective_actions()
        .into_iter()
        .map(|action| {
            json!({
                "type": action.action_type.trim().to_lowercase(),
                "target": action.target.as_deref().map(str::trim).unwrap_or_default(),
            })
        })
        .collect();

    // serde_json maps are key-sorted, so the rendered object is canonical.
    json!({
        "kind": trigger.kind.trim().to_lowercase(),
        "text": normalize_text(&trigger.text_template),
        "matchMode": trigger.match_mode.as_str(),
        "regex": regex,
        "actions": actions,
        "outcome": handler.outcome.as_str(),
    })
    .to_string()
}

/// Appends every handler from `incoming` whose signature is not yet present in `target`.
///
/// Earlier handlers win, so a parent's handler shadows an identical one learned on a child.
pub fn merge_handlers(target: &mut Vec<InterruptionHandler>, incoming: &[InterruptionHandler]) {
    let mut seen: Vec<String> = target.iter().map(handler_signature).collect();
    for handler in incoming {
        let signature = handler_signature(handler);
        if !seen.contains(&signature) {
            seen.push(signature);
            target.push(handler.clone());
        }
    }
}

/// Deduplicates a handler list by signature, keeping the first occurrence.
pub fn dedupe_handlers<'a>(handlers: impl IntoIterator<Item = &'a InterruptionHandler>) -> Vec<InterruptionHandler> {
    let incoming: Vec<InterruptionHandler> = handlers.into_iter().cloned().collect();
    let mut unique = Vec::with_capacity(incoming.len());
    merge_handlers(&mut unique, &incoming);
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowpilot_types::{HandlerAction, HandlerMode, HandlerOutcome, InterruptionTrigger};

    fn handler(text: &str, target: &str) -> InterruptionHandler {
        InterruptionHandler {
            trigger: InterruptionTrigger {
                kind: "dialog".into(),
                text_template: text.into(),
                ..InterruptionTrigger::default()
            },
            actions: vec![HandlerAction {
                action_type: "click".into(),
                target: Some(target.into()),
                value: None,
            }],
            ..InterruptionHandler::default()
        }
    }

    #[test]
    fn signature_ignores_volatile_text_and_legacy_shape() {
        let modern = handler("Order 12345 could not be posted", "OK");
        let mut legacy = handler("order   987 could NOT be posted", "OK");
        legacy.action = legacy.actions.pop();
        legacy.mode = HandlerMode::AlwaysAsk;
        legacy.enabled = false;

        assert_eq!(handler_signature(&modern), handler_signature(&legacy));
    }

    #[test]
    fn signature_distinguishes_outcomes_and_targets() {
        let base = handler("Session expired", "OK");
        let mut retry = base.clone();
        retry.outcome = HandlerOutcome::RetryStep;
        let other_target = handler("Session expired", "Cancel");

        assert_ne!(handler_signature(&base), handler_signature(&retry));
        assert_ne!(handler_signature(&base), handler_signature(&other_target));
    }

    #[test]
    fn regex_only_counts_in_regex_mode() {
        let mut contains = handler("Session expired", "OK");
        contains.trigger.regex = Some("session.*".into());
        let plain = handler("Session expired", "OK");
        assert_eq!(handler_signature(&contains), handler_signature(&plain));

        contains.trigger.match_mode = MatchMode::Regex;
        assert_ne!(handler_signature(&contains), handler_signature(&plain));
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let first = handler("Session expired", "OK");
        let mut second = handler("SESSION EXPIRED", "OK");
        second.enabled = false;
        let third = handler("Record locked", "OK");

        let unique = dedupe_handlers([&first, &second, &third]);
        assert_eq!(unique, vec![first, third]);
    }
}
