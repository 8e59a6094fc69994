//! Artifact removal applied to an extracted body before it is rewritten.

use once_cell::sync::Lazy;
use regex::Regex;

static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s\]]+").unwrap());
static EMPTY_BRACKETS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\s*\]").unwrap());
static BLANK_LINE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n\s*\n").unwrap());

/// Strips URLs, the empty brackets they leave behind, and runs of blank lines.
///
/// Rules run in a fixed order: URLs, then `[]` pairs, then blank-line runs collapse
/// to a single blank line, then the result is trimmed. The sequence repeats until
/// nothing changes, so `clean(&clean(s)) == clean(s)` holds for every input.
pub fn clean(body: &str) -> String {
    let mut current = clean_pass(body);
    loop {
        let next = clean_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn clean_pass(body: &str) -> String {
    let body = URL.replace_all(body, "");
    let body = EMPTY_BRACKETS.replace_all(&body, "");
    let body = BLANK_LINE_RUN.replace_all(&body, "\n\n");
    body.trim().to_string()
}
