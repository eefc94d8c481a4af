//! Tool surface
//!
//! One module per exposed tool. Each provides `schema()` for tools/list and
//! `execute()` returning the JSON payload or an error string the server
//! wraps as `{error, isError: true}`.

pub mod about;
pub mod buffer_turn;
pub mod consolidate;
pub mod end_session;
pub mod entity;
pub mod predictions;
pub mod recall;
pub mod relate;
pub mod remember;
pub mod search_entities;
pub mod trace;
pub mod upcoming;

use serde_json::Value;

/// Pull a string array out of arguments that may already be coerced.
pub(crate) fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}
