//! Completion sentinel detection.

use std::sync::LazyLock;

use regex::Regex;

static PROMISE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<promise>(.*?)</promise>").expect("promise regex"));

/// Collapse runs of whitespace to single spaces and trim.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Phrases wrapped in `<promise>` tags, normalized, in order of appearance.
pub fn extract_promises(text: &str) -> Vec<String> {
    PROMISE_RE
        .captures_iter(text)
        .map(|caps| normalize(&caps[1]))
        .collect()
}

/// True when `last_assistant_text` carries the exact configured phrase.
///
/// Comparison is exact after whitespace normalization on both sides; an empty
/// configured phrase never matches.
pub fn promise_fulfilled(last_assistant_text: Option<&str>, phrase: Option<&str>) -> bool {
    let Some(phrase) = phrase.map(normalize).filter(|p| !p.is_empty()) else {
        return false;
    };
    let Some(text) = last_assistant_text else {
        return false;
    };
    extract_promises(text).iter().any(|found| *found == phrase)
}
