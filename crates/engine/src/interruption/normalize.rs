//! Canonical form of observed interruption text.
//!
//! Two dialogs that differ only in record numbers, casing, or spacing should produce the same
//! normalized text so their handlers deduplicate. The rewrites are applied until the text stops
//! changing, so [`normalize_text`] is idempotent even when one rewrite exposes a match for another.

use once_cell::sync::Lazy;
use regex::Regex;

const MAX_REWRITE_PASSES: usize = 8;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex should compile"));

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:[.,]\d+)*").expect("number regex should compile"));

static CUSTOMER_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bcustomer\s*(?:#|no\.?|number)?\s*\{number\}").expect("customer number regex should compile")
});

static DUPLICATE_RECORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\b(record|entry|item)s? with (?:the )?same (?:'[^']*'|"[^"]*"|(?:[\w-]+|\{number\})(?: (?:[\w-]+|\{number\}))?) already exists"#,
    )
    .expect("duplicate record regex should compile")
});

static REQUIRED_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(^|[\s:(])(?:'[^']*'|"[^"]*"|[\w-]+)(?: is (?:a )?(?:required|mandatory)(?: field)?)+"#)
        .expect("required field regex should compile")
});

static DEPENDENT_DELETE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\b(cannot|can't|unable to) delete (?:'[^']*'|"[^"]*"|(?:[\w-]+|\{number\})(?: (?:[\w-]+|\{number\})){0,3}?) (?:because|as|since) (?:it )?(?:is (?:still )?(?:referenced|used|linked)|has (?:dependent|related|linked))[^.]*"#,
    )
    .expect("dependent delete regex should compile")
});

/// Lowercases, collapses whitespace, and replaces volatile fragments with placeholders.
///
/// Recognized rewrites:
/// - numbers become `{number}`
/// - `customer #42` / `customer no. 42` become `customer {number}`
/// - `record with the same <field> already exists` becomes `record with the same {field} already exists`
/// - `<field> is required` becomes `{field} is required`
/// - `cannot delete <record> because it is referenced ...` becomes
///   `cannot delete {record} because it is referenced by other records`
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut current = WHITESPACE.replace_all(lowered.trim(), " ").into_owned();
    for _ in 0..MAX_REWRITE_PASSES {
        let next = rewrite_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn rewrite_once(text: &str) -> String {
    let numbered = NUMBER.replace_all(text, "{number}");
    let customers = CUSTOMER_NUMBER.replace_all(&numbered, "customer {number}");
    let duplicates = DUPLICATE_RECORD.replace_all(&customers, "${1} with the same {field} already exists");
    let required = REQUIRED_FIELD.replace_all(&duplicates, "${1}{field} is required");
    DEPENDENT_DELETE
        .replace_all(&required, "${1} delete {record} because it is referenced by other records")
        .into_owned()
}

/// Lowercases and collapses whitespace without placeholder rewrites.
///
/// Used when comparing observed text against an already generalized pattern.
pub fn normalize_for_match(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").to_lowercase()
}
