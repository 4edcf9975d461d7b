//! Best-effort repair of streamed JSON tool arguments.
//!
//! Streams cut mid-argument leave unbalanced braces and unterminated
//! strings; models occasionally wrap arguments in code fences or leave a
//! trailing comma. Repair is conservative: parse as-is first, then apply
//! fixes and re-parse. Callers keep the original string when repair fails.

use serde_json::Value;

/// Try to parse `raw` as JSON, repairing common stream damage on failure.
pub fn repair_json(raw: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return Some(v);
    }

    let mut s = raw.trim().to_string();

    // Strip markdown code fences
    if s.starts_with("```") {
        s = s
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
    }

    // Cut to the outermost JSON container
    if let (Some(start), Some(end)) = (s.find(['{', '[']), s.rfind(['}', ']'])) {
        if end > start {
            s = s[start..=end].to_string();
        }
    }

    if let Ok(v) = serde_json::from_str::<Value>(&s) {
        return Some(v);
    }

    // Close an unterminated string
    if count_unescaped_quotes(&s) % 2 == 1 {
        s.push('"');
    }

    // Drop a trailing comma before closing
    let trimmed = s.trim_end();
    if trimmed.ends_with(',') {
        s = trimmed[..trimmed.len() - 1].to_string();
    }

    // Balance braces and brackets in nesting order
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                let _ = stack.pop();
            }
            _ => {}
        }
    }
    while let Some(closer) = stack.pop() {
        s.push(closer);
    }

    serde_json::from_str::<Value>(&s).ok()
}

fn count_unescaped_quotes(s: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => count += 1,
            _ => {}
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_json_passes_through() {
        assert_eq!(repair_json(r#"{"s": "hello"}"#).unwrap(), json!({"s": "hello"}));
        assert_eq!(repair_json("[]").unwrap(), json!([]));
    }

    #[test]
    fn truncated_object_is_closed() {
        assert_eq!(
            repair_json(r#"{"query": "rust async", "limit": 5"#).unwrap(),
            json!({"query": "rust async", "limit": 5})
        );
    }

    #[test]
    fn unterminated_string_is_closed() {
        assert_eq!(
            repair_json(r#"{"query": "rust asy"#).unwrap(),
            json!({"query": "rust asy"})
        );
    }

    #[test]
    fn code_fence_is_stripped() {
        assert_eq!(
            repair_json("```json\n{\"a\": 1}\n```").unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn trailing_comma_is_dropped() {
        assert_eq!(repair_json(r#"{"a": 1,"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn nested_containers_balance_in_order() {
        assert_eq!(
            repair_json(r#"{"a": [1, 2, {"b": 3"#).unwrap(),
            json!({"a": [1, 2, {"b": 3}]})
        );
    }

    #[test]
    fn surrounding_prose_is_cut() {
        assert_eq!(
            repair_json("Here are the arguments: {\"a\": 1} hope that helps").unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn hopeless_input_returns_none() {
        assert!(repair_json("not json at all").is_none());
        assert!(repair_json("").is_none());
    }
}
