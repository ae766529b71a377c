//! Generalizing several observed texts into one placeholder pattern.
//!
//! When the operator records the same kind of dialog on different rows, the texts differ only in
//! their variable parts. [`compute_unified_pattern`] folds a longest-common-subsequence over the
//! word tokens of every text and turns each run of differing tokens into a `{variable}` gap.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use rowpilot_types::MatchMode;
use serde::Serialize;
use tracing::warn;

use super::normalize::normalize_for_match;

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^{}\s]*\}|\w+|[^\w\s]").expect("token regex should compile"));

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("placeholder regex should compile"));

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    Literal { text: String, folded: String, spaced: bool },
    Gap { spaced: bool },
}

impl PatternToken {
    fn spaced(&self) -> bool {
        match self {
            Self::Literal { spaced, .. } | Self::Gap { spaced } => *spaced,
        }
    }

    fn folded(&self) -> Option<&str> {
        match self {
            Self::Literal { folded, .. } => Some(folded.as_str()),
            Self::Gap { .. } => None,
        }
    }
}

/// Splits `text` into word, punctuation, and placeholder tokens, remembering preceding whitespace.
fn tokenize(text: &str) -> Vec<PatternToken> {
    let mut tokens = Vec::new();
    let mut last_end = 0;
    for found in TOKEN.find_iter(text) {
        let spaced = found.start() > last_end && text[last_end..found.start()].chars().any(char::is_whitespace);
        last_end = found.end();
        let token_text = found.as_str();
        if token_text.starts_with('{') && token_text.ends_with('}') && token_text.len() >= 2 {
            tokens.push(PatternToken::Gap { spaced });
        } else {
            tokens.push(PatternToken::Literal {
                text: token_text.to_string(),
                folded: token_text.to_lowercase(),
                spaced,
            });
        }
    }
    tokens
}

/// Index pairs `(i, j)` of one longest common subsequence of two sequences of lengths `left_len`
/// and `right_len`, in ascending order.
fn lcs_pairs(left_len: usize, right_len: usize, equal: impl Fn(usize, usize) -> bool) -> Vec<(usize, usize)> {
    let width = right_len + 1;
    let mut lengths = vec![0usize; (left_len + 1) * width];
    for i in 1..=left_len {
        for j in 1..=right_len {
            lengths[i * width + j] = if equal(i - 1, j - 1) {
                lengths[(i - 1) * width + (j - 1)] + 1
            } else {
                lengths[(i - 1) * width + j].max(lengths[i * width + (j - 1)])
            };
        }
    }

    let mut pairs = Vec::with_capacity(lengths[left_len * width + right_len]);
    let (mut i, mut j) = (left_len, right_len);
    while i > 0 && j > 0 {
        if equal(i - 1, j - 1) {
            pairs.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if lengths[(i - 1) * width + j] >= lengths[i * width + (j - 1)] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    pairs.reverse();
    pairs
}

/// Longest common subsequence of two token lists (classic dynamic programming).
pub fn compute_lcs<T: AsRef<str>>(left: &[T], right: &[T]) -> Vec<String> {
    lcs_pairs(left.len(), right.len(), |i, j| left[i].as_ref() == right[j].as_ref())
        .into_iter()
        .map(|(i, _)| left[i].as_ref().to_string())
        .collect()
}

fn push_gap(merged: &mut Vec<PatternToken>, spaced: bool) {
    if !matches!(merged.last(), Some(PatternToken::Gap { .. })) {
        merged.push(PatternToken::Gap { spaced });
    }
}

/// Folds `next` into the running pattern, keeping matched literals and collapsing the rest into gaps.
fn fold_pattern(running: &[PatternToken], next: &[PatternToken]) -> Vec<PatternToken> {
    let pairs = lcs_pairs(running.len(), next.len(), |i, j| match (running[i].folded(), next[j].folded()) {
        (Some(left), Some(right)) => left == right,
        _ => false,
    });

    let mut merged = Vec::with_capacity(running.len());
    let (mut running_index, mut next_index) = (0, 0);
    for (i, j) in pairs {
        if i > running_index || j > next_index {
            let spaced = if i > running_index {
                running[running_index].spaced()
            } else {
                next[next_index].spaced()
            };
            push_gap(&mut merged, spaced);
        }
        merged.push(running[i].clone());
        running_index = i + 1;
        next_index = j + 1;
    }
    if running_index < running.len() || next_index < next.len() {
        let spaced = running
            .get(running_index)
            .or_else(|| next.get(next_index))
            .is_some_and(PatternToken::spaced);
        push_gap(&mut merged, spaced);
    }
    merged
}

fn render(tokens: &[PatternToken]) -> String {
    let mut rendered = String::new();
    let mut gaps = 0;
    for (position, token) in tokens.iter().enumerate() {
        if position > 0 && token.spaced() {
            rendered.push(' ');
        }
        match token {
            PatternToken::Literal { text, .. } => rendered.push_str(text),
            PatternToken::Gap { .. } => {
                gaps += 1;
                if gaps == 1 {
                    rendered.push_str("{variable}");
                } else {
                    rendered.push_str(&format!("{{variable{gaps}}}"));
                }
            }
        }
    }
    rendered
}

/// Generalizes several texts into one pattern with `{variable}`, `{variable2}`, ... placeholders.
///
/// Tokens are compared case-insensitively; the first text's casing is kept. Adjacent gaps collapse
/// into one placeholder. A single text is returned unchanged and no texts yield an empty string.
pub fn compute_unified_pattern<T: AsRef<str>>(texts: &[T]) -> String {
    match texts {
        [] => String::new(),
        [only] => only.as_ref().to_string(),
        [first, rest @ ..] => {
            let mut pattern = tokenize(first.as_ref());
            for text in rest {
                pattern = fold_pattern(&pattern, &tokenize(text.as_ref()));
            }
            render(&pattern)
        }
    }
}

/// Returns true when `pattern` contains at least one `{placeholder}`.
pub fn has_placeholders(pattern: &str) -> bool {
    PLACEHOLDER.is_match(pattern)
}

/// Converts a placeholder pattern into regex source.
///
/// Fixed segments are escaped and each placeholder becomes a lazy `.*?`. Whitespace touching a
/// placeholder is relaxed to `\s*` so an empty variable still matches.
pub fn pattern_to_regex(pattern: &str) -> String {
    let mut source = String::new();
    let mut last_end = 0;
    for placeholder in PLACEHOLDER.find_iter(pattern) {
        source.push_str(&escape_segment(&pattern[last_end..placeholder.start()], last_end > 0, true));
        source.push_str(".*?");
        last_end = placeholder.end();
    }
    source.push_str(&escape_segment(&pattern[last_end..], last_end > 0, false));
    source
}

/// Regex a regex-mode trigger stores for `pattern`, or `None` when the pattern has no placeholders.
///
/// Built from the match-normalized pattern, so it is the expression the matcher itself compiles.
pub fn handler_regex(pattern: &str) -> Option<String> {
    let normalized = normalize_for_match(pattern);
    has_placeholders(&normalized).then(|| pattern_to_regex(&normalized))
}

fn escape_segment(segment: &str, after_placeholder: bool, before_placeholder: bool) -> String {
    let mut core = segment;
    let mut leading = "";
    let mut trailing = "";
    if after_placeholder && core.starts_with(char::is_whitespace) {
        core = core.trim_start();
        leading = r"\s*";
    }
    if before_placeholder && core.ends_with(char::is_whitespace) {
        core = core.trim_end();
        trailing = r"\s*";
    }
    format!("{leading}{}{trailing}", regex::escape(core))
}

/// Outcome of checking one text against a candidate pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMatch {
    pub text: String,
    pub matched: bool,
}

/// Result of [`validate_pattern_against_texts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternValidation {
    /// True when at least one text was checked and every text matched.
    pub all_match: bool,
    pub per_text: Vec<TextMatch>,
}

/// Compiled matcher for a placeholder pattern.
#[derive(Debug, Clone)]
pub(crate) enum PatternMatcher {
    Substring(String),
    Pattern(Regex),
    Invalid,
}

impl PatternMatcher {
    /// Compiles `pattern` for `mode`.
    ///
    /// Contains mode without placeholders is a plain substring test; everything else goes through
    /// [`pattern_to_regex`]. Both comparisons are case-insensitive and whitespace-normalized.
    pub(crate) fn compile(pattern: &str, mode: MatchMode) -> Self {
        let normalized = normalize_for_match(pattern);
        if mode == MatchMode::Contains && !has_placeholders(&normalized) {
            return Self::Substring(normalized);
        }
        Self::from_regex_source(&pattern_to_regex(&normalized))
    }

    pub(crate) fn from_regex_source(source: &str) -> Self {
        match RegexBuilder::new(source).case_insensitive(true).build() {
            Ok(regex) => Self::Pattern(regex),
            Err(error) => {
                warn!(pattern = source, error = %error, "Ignoring invalid interruption pattern");
                Self::Invalid
            }
        }
    }

    pub(crate) fn matches(&self, text: &str) -> bool {
        let normalized = normalize_for_match(text);
        match self {
            Self::Substring(needle) => normalized.contains(needle.as_str()),
            Self::Pattern(regex) => regex.is_match(&normalized),
            Self::Invalid => false,
        }
    }
}

/// Reports which of `texts` match `pattern` under `mode`.
pub fn validate_pattern_against_texts<T: AsRef<str>>(pattern: &str, texts: &[T], mode: MatchMode) -> PatternValidation {
    let matcher = PatternMatcher::compile(pattern, mode);
    let per_text: Vec<TextMatch> = texts
        .iter()
        .map(|text| TextMatch {
            text: text.as_ref().to_string(),
            matched: matcher.matches(text.as_ref()),
        })
        .collect();
    PatternValidation {
        all_match: !per_text.is_empty() && per_text.iter().all(|entry| entry.matched),
        per_text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcs_of_token_lists() {
        assert_eq!(compute_lcs(&["a", "b", "c", "d"], &["a", "x", "c", "d"]), vec!["a", "c", "d"]);
        assert!(compute_lcs::<&str>(&[], &["a"]).is_empty());
        assert_eq!(compute_lcs(&["x", "y"], &["x", "y"]), vec!["x", "y"]);
    }

    #[test]
    fn unifies_two_texts_into_one_placeholder() {
        let pattern = compute_unified_pattern(&["Error processing order 12345", "Error processing invoice 67890"]);
        assert_eq!(pattern, "Error processing {variable}");

        let validation = validate_pattern_against_texts(
            &pattern,
            &["Error processing order 12345", "Error processing invoice 67890"],
            MatchMode::Regex,
        );
        assert!(validation.all_match);
    }

    #[test]
    fn separate_differences_get_numbered_placeholders() {
        let pattern = compute_unified_pattern(&[
            "Customer 10 has overdue balance of 300 EUR.",
            "customer 22 has overdue balance of 15 USD.",
        ]);
        assert_eq!(pattern, "Customer {variable} has overdue balance of {variable2}.");
    }

    #[test]
    fn existing_placeholders_become_gaps() {
        let pattern = compute_unified_pattern(&["Order {number} failed at step 4", "Order 12 failed at step 9"]);
        assert_eq!(pattern, "Order {variable} failed at step {variable2}");
    }

    #[test]
    fn three_texts_fold_incrementally() {
        let pattern = compute_unified_pattern(&["Item A locked", "Item B locked", "Item C D locked"]);
        assert_eq!(pattern, "Item {variable} locked");
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(compute_unified_pattern::<&str>(&[]), "");
        assert_eq!(compute_unified_pattern(&["Only  one"]), "Only  one");
        assert_eq!(compute_unified_pattern(&["Same text", "same TEXT"]), "Same text");
    }

    #[test]
    fn pattern_to_regex_escapes_fixed_segments() {
        assert_eq!(pattern_to_regex("Total (net) {variable}."), r"Total \(net\)\s*.*?\.");
        assert_eq!(pattern_to_regex("plain"), "plain");
        let regex = Regex::new(&pattern_to_regex("Order {variable} failed")).expect("compile");
        assert!(regex.is_match("Order failed"));
        assert!(regex.is_match("Order 42 failed"));
    }

    #[test]
    fn handler_regex_uses_the_normalized_pattern() {
        assert_eq!(
            handler_regex("Order  {variable}\nFAILED").as_deref(),
            Some(r"order\s*.*?\s*failed")
        );
        assert_eq!(handler_regex("Session expired"), None);
    }

    #[test]
    fn contains_mode_without_placeholders_is_substring() {
        let validation = validate_pattern_against_texts(
            "session  EXPIRED",
            &["Your session expired. Log in again.", "Session timed out"],
            MatchMode::Contains,
        );
        assert!(!validation.all_match);
        assert!(validation.per_text[0].matched);
        assert!(!validation.per_text[1].matched);
    }

    #[test]
    fn contains_mode_with_placeholders_uses_regex() {
        let validation = validate_pattern_against_texts(
            "record {variable} is locked",
            &["Warning: Record 991 is locked by another user"],
            MatchMode::Contains,
        );
        assert!(validation.all_match);
    }

    #[test]
    fn no_texts_never_validate() {
        assert!(!validate_pattern_against_texts::<&str>("x", &[], MatchMode::Contains).all_match);
    }
}
