//! Shared utility functions
//! Common helpers used across the pipeline

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in seconds
#[inline]
#[must_use]
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Clean markdown code blocks from model responses
/// Handles ```json and ``` wrappers commonly returned by LLMs
#[inline]
#[must_use]
pub fn clean_json_response(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Locate the JSON payload inside a model response.
///
/// Models often wrap their answer in prose ("Here is the analysis: [...]").
/// Returns the slice from the first `open` bracket to the last `close`
/// bracket, or the cleaned text if either is missing. Nesting is not checked.
pub fn extract_json(text: &str, open: char, close: char) -> &str {
    let cleaned = clean_json_response(text);
    match (cleaned.find(open), cleaned.rfind(close)) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        _ => cleaned,
    }
}

/// Truncate to at most `max_chars` characters on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
