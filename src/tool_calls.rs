//! Recovery of structured function calls from free-form upstream text.
//!
//! The upstream has no native tool-call channel, so the model is prompted to
//! answer with a `{"tool_calls": [...]}` object. That object may arrive inside
//! a ```` ```json ```` fence, inline in prose, or (rarely) as a localized
//! "调用函数: name 参数: {...}" sentence. Detection tries those shapes in order.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Range;
use std::sync::LazyLock;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid fence regex")
});

static CALL_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"调用函数\s*[:：]\s*([A-Za-z_][\w.\-]*)\s*[,，]?\s*参数\s*[:：]\s*")
        .expect("valid call phrase regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ExtractedFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFunction {
    pub name: String,
    /// Always a JSON-encoded string, never a nested object.
    pub arguments: String,
}

/// Returns the tool calls found in `text`, or `None` when nothing usable is
/// present. Only the first `scan_limit` characters are inspected.
pub fn extract_tool_calls(text: &str, scan_limit: usize) -> Option<Vec<ExtractedToolCall>> {
    let text = truncate_chars(text, scan_limit);

    for caps in FENCED_JSON.captures_iter(text) {
        let Some(body) = caps.get(1) else { continue };
        if let Some(calls) = tool_calls_from_candidate(body.as_str()) {
            tracing::debug!(count = calls.len(), "tool calls found in fenced block");
            return Some(calls);
        }
    }

    for range in balanced_objects(text) {
        if let Some(calls) = tool_calls_from_candidate(&text[range]) {
            tracing::debug!(count = calls.len(), "tool calls found inline");
            return Some(calls);
        }
    }

    let calls = natural_language_call(text)?;
    tracing::debug!("tool call found in call phrase");
    Some(calls)
}

/// Removes every fenced or inline JSON object that extraction would accept.
/// Other text, including unrelated or unusable JSON, is kept verbatim.
pub fn strip_tool_json(text: &str) -> String {
    let without_fences = FENCED_JSON.replace_all(text, |caps: &regex::Captures<'_>| {
        let body = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if carries_tool_calls(body) {
            String::new()
        } else {
            caps.get(0).map(|m| m.as_str()).unwrap_or("").to_string()
        }
    });

    let source = without_fences.as_ref();
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for range in balanced_objects(source) {
        if !carries_tool_calls(&source[range.clone()]) {
            continue;
        }
        out.push_str(&source[cursor..range.start]);
        cursor = range.end;
    }
    out.push_str(&source[cursor..]);
    out.trim().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Outside,
    InString,
    InStringEscaped,
}

/// Byte ranges of top-level `{...}` spans. Braces inside JSON string literals
/// are not counted; string tracking only starts once a brace is open.
fn balanced_objects(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut state = ScanState::Outside;
    let mut depth = 0usize;
    let mut start = 0usize;

    for (idx, byte) in text.bytes().enumerate() {
        match state {
            ScanState::InStringEscaped => state = ScanState::InString,
            ScanState::InString => match byte {
                b'\\' => state = ScanState::InStringEscaped,
                b'"' => state = ScanState::Outside,
                _ => {}
            },
            ScanState::Outside => match byte {
                b'{' => {
                    if depth == 0 {
                        start = idx;
                    }
                    depth += 1;
                }
                b'}' if depth > 0 => {
                    depth -= 1;
                    if depth == 0 {
                        spans.push(start..idx + 1);
                    }
                }
                b'"' if depth > 0 => state = ScanState::InString,
                _ => {}
            },
        }
    }
    spans
}

/// Same acceptance rule as extraction, so strip never removes a rejected object.
fn carries_tool_calls(candidate: &str) -> bool {
    tool_calls_from_candidate(candidate).is_some()
}

fn tool_calls_from_candidate(candidate: &str) -> Option<Vec<ExtractedToolCall>> {
    let value: Value = serde_json::from_str(candidate.trim()).ok()?;
    let entries = value.get("tool_calls")?.as_array()?;
    let calls: Vec<ExtractedToolCall> = entries.iter().filter_map(normalize_entry).collect();
    if calls.is_empty() { None } else { Some(calls) }
}

fn normalize_entry(entry: &Value) -> Option<ExtractedToolCall> {
    let function = entry.get("function").unwrap_or(entry);
    let name = function.get("name").and_then(Value::as_str)?.trim();
    if name.is_empty() {
        return None;
    }
    let id = entry
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generated_call_id);
    Some(ExtractedToolCall {
        id,
        kind: "function".to_string(),
        function: ExtractedFunction {
            name: name.to_string(),
            arguments: arguments_to_string(function.get("arguments")),
        },
    })
}

fn arguments_to_string(arguments: Option<&Value>) -> String {
    match arguments {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(raw)) => raw.clone(),
        Some(other) => other.to_string(),
    }
}

fn natural_language_call(text: &str) -> Option<Vec<ExtractedToolCall>> {
    let caps = CALL_PHRASE.captures(text)?;
    let name = caps.get(1)?.as_str().to_string();
    let tail = &text[caps.get(0)?.end()..];
    let first = balanced_objects(tail).into_iter().next()?;
    if !tail[..first.start].trim().is_empty() {
        return None;
    }
    let arguments: Value = serde_json::from_str(&tail[first]).ok()?;
    Some(vec![ExtractedToolCall {
        id: format!("call_{}", chrono::Utc::now().timestamp_millis()),
        kind: "function".to_string(),
        function: ExtractedFunction {
            name,
            arguments: arguments.to_string(),
        },
    }])
}

fn generated_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 200_000;

    #[test]
    fn fenced_block_arguments_are_normalized_to_string() {
        let text = "Sure.\n```json\n{\"tool_calls\":[{\"function\":{\"name\":\"f\",\"arguments\":{\"a\":1}}}]}\n```\n";
        let calls = extract_tool_calls(text, LIMIT).expect("calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "f");
        assert_eq!(calls[0].function.arguments, "{\"a\":1}");
        assert_eq!(calls[0].kind, "function");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn inline_object_matches_fenced_result() {
        let payload = "{\"tool_calls\":[{\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"f\",\"arguments\":{\"a\":1}}}]}";
        let fenced = extract_tool_calls(&format!("```json\n{payload}\n```"), LIMIT);
        let inline = extract_tool_calls(&format!("I will call it now {payload} done"), LIMIT);
        assert_eq!(fenced, inline);
        assert!(inline.is_some());
    }

    #[test]
    fn string_arguments_are_kept_verbatim() {
        let text = r#"{"tool_calls":[{"id":"c","function":{"name":"g","arguments":"{\"q\":\"x\"}"}}]}"#;
        let calls = extract_tool_calls(text, LIMIT).expect("calls");
        assert_eq!(calls[0].id, "c");
        assert_eq!(calls[0].function.arguments, r#"{"q":"x"}"#);
    }

    #[test]
    fn braces_inside_strings_do_not_break_the_scan() {
        let text = r#"Result: {"tool_calls":[{"function":{"name":"echo","arguments":{"s":"a } \" { b"}}}]} end"#;
        let calls = extract_tool_calls(text, LIMIT).expect("calls");
        assert_eq!(calls[0].function.name, "echo");
        let args: Value = serde_json::from_str(&calls[0].function.arguments).expect("args json");
        assert_eq!(args["s"], "a } \" { b");
    }

    #[test]
    fn json_without_tool_calls_is_a_miss() {
        assert!(extract_tool_calls(r#"{"answer": 42}"#, LIMIT).is_none());
        assert!(extract_tool_calls("plain prose with { unbalanced", LIMIT).is_none());
        assert!(extract_tool_calls(r#"{"tool_calls": []}"#, LIMIT).is_none());
    }

    #[test]
    fn call_phrase_fallback_synthesizes_one_call() {
        let text = "好的。调用函数: get_weather 参数: {\"city\": \"北京\"} 请稍等";
        let calls = extract_tool_calls(text, LIMIT).expect("calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "get_weather");
        let args: Value = serde_json::from_str(&calls[0].function.arguments).expect("args json");
        assert_eq!(args["city"], "北京");
    }

    #[test]
    fn call_phrase_with_invalid_json_is_a_miss() {
        assert!(extract_tool_calls("调用函数: f 参数: {not json}", LIMIT).is_none());
    }

    #[test]
    fn scan_limit_truncates_input() {
        let text = format!(
            "{}{}",
            "x".repeat(50),
            r#"{"tool_calls":[{"function":{"name":"f","arguments":{}}}]}"#
        );
        assert!(extract_tool_calls(&text, 50).is_none());
        assert!(extract_tool_calls(&text, 500).is_some());
    }

    #[test]
    fn strip_removes_tool_json_and_keeps_other_json() {
        let text = r#"Calling now. {"tool_calls":[{"function":{"name":"f","arguments":{"a":1}}}]} Context: {"note":"keep me"}"#;
        let stripped = strip_tool_json(text);
        assert_eq!(stripped, r#"Calling now.  Context: {"note":"keep me"}"#);
        assert!(!stripped.contains("tool_calls"));
    }

    #[test]
    fn strip_keeps_objects_extraction_rejects() {
        let empty = r#"Nothing to do {"tool_calls": []} here"#;
        assert_eq!(strip_tool_json(empty), empty);
        let nameless = r#"{"tool_calls":[{"function":{"arguments":{}}}]}"#;
        assert!(extract_tool_calls(nameless, LIMIT).is_none());
        assert_eq!(strip_tool_json(nameless), nameless);
        let fenced = "```json\n{\"tool_calls\": []}\n```";
        assert_eq!(strip_tool_json(fenced), fenced);
    }

    #[test]
    fn strip_removes_whole_fence() {
        let text = "Let me check.\n```json\n{\"tool_calls\":[{\"function\":{\"name\":\"f\",\"arguments\":{}}}]}\n```\n";
        assert_eq!(strip_tool_json(text), "Let me check.");
        let untouched = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_tool_json(untouched), untouched);
    }
}
