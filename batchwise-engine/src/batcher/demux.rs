//! Splitting a combined batch response back into per-request entries.
//!
//! The collaborator is asked for a JSON array with one entry per input, in
//! input order. Model output is not always clean, so the array is located
//! inside code fences or surrounding prose before parsing.

use serde_json::Value;

/// Errors raised while decomposing a combined response
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DemuxError {
    #[error("Response is empty")]
    Empty,

    #[error("Response does not contain a JSON array: {0}")]
    Malformed(String),
}

/// Per-position entries recovered from a response
#[derive(Debug, Clone, PartialEq)]
pub struct Demuxed {
    /// Entry `i` belongs to input `i`; may be shorter than the input
    pub entries: Vec<Value>,
    /// Entries beyond the expected count that were dropped
    pub surplus: usize,
}

/// Decompose `text` into at most `expected` positional entries.
pub fn split_response(text: &str, expected: usize) -> Result<Demuxed, DemuxError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DemuxError::Empty);
    }

    let array = parse_array(strip_code_fence(trimmed))
        .or_else(|| find_array(trimmed, expected))
        .ok_or_else(|| DemuxError::Malformed(preview(trimmed)))?;

    let surplus = array.len().saturating_sub(expected);
    let entries = array
        .into_iter()
        .take(expected)
        .enumerate()
        .map(|(position, entry)| unwrap_indexed(position, entry))
        .collect();

    Ok(Demuxed { entries, surplus })
}

/// `{"index": i, "result": x}` at position `i` becomes `x`; anything else is kept as-is.
fn unwrap_indexed(position: usize, entry: Value) -> Value {
    if let Value::Object(ref map) = entry {
        let index_matches = map.get("index").and_then(Value::as_u64) == Some(position as u64);
        if index_matches {
            if let Some(result) = map.get("result") {
                return result.clone();
            }
        }
    }
    entry
}

fn strip_code_fence(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    // Skip the language tag on the opening fence line
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

fn parse_array(candidate: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(candidate).ok()? {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

/// First top-level array embedded in prose.
///
/// Each `[` is tried as the start of a JSON value; arrays nested inside one
/// already parsed are skipped. Bracketed prose that is not JSON (or an array
/// too short to cover the batch, like a footnote `[1]`) does not stop the
/// scan. If no array covers `expected` entries, the longest one is returned.
fn find_array(text: &str, expected: usize) -> Option<Vec<Value>> {
    let mut longest: Option<Vec<Value>> = None;
    let mut resume = 0;

    for (start, _) in text.match_indices('[') {
        if start < resume {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(Value::Array(items))) = stream.next() {
            resume = start + stream.byte_offset();
            if items.len() >= expected {
                return Some(items);
            }
            if longest.as_ref().map_or(true, |l| items.len() > l.len()) {
                longest = Some(items);
            }
        }
    }

    longest
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut cut = MAX;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}
