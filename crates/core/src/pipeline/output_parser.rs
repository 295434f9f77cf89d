//! # Structured Output Parser
//!
//! Turns raw generated text into a structured value. Models routinely wrap
//! JSON in prose or code fences, so decoding falls back from a direct parse
//! to a balanced-brace scan and finally to the widest `{ ... }` span.
//!
//! Parsing never panics and never retries; a failure is reported inline on
//! the returned [`StageResult`](super::StageResult) fields.

use serde_json::Value;

use super::stage::OutputShape;

/// Upper bound on `error_detail`, in characters
pub const MAX_ERROR_DETAIL: usize = 200;

/// Outcome of parsing one stage's raw output
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    pub parsed: Option<Value>,
    pub ok: bool,
    pub error_detail: Option<String>,
}

impl ParsedOutput {
    fn success(parsed: Option<Value>) -> Self {
        Self {
            parsed,
            ok: true,
            error_detail: None,
        }
    }

    fn failure(raw: &str) -> Self {
        Self {
            parsed: None,
            ok: false,
            error_detail: Some(error_detail(raw)),
        }
    }
}

/// Parse `raw` according to the expected output shape
pub fn parse(raw: &str, shape: OutputShape) -> ParsedOutput {
    match shape {
        OutputShape::FreeText => ParsedOutput::success(None),
        OutputShape::Structured => match extract_structured(raw) {
            Some(value) => ParsedOutput::success(Some(value)),
            None => ParsedOutput::failure(raw),
        },
    }
}

/// Try every decoding strategy in order
pub fn extract_structured(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    if let Some(value) = decode_container(trimmed) {
        return Some(value);
    }

    let start = trimmed.find('{')?;

    if let Some(end) = balanced_end(trimmed, start) {
        if let Some(value) = decode_container(&trimmed[start..=end]) {
            return Some(value);
        }
    }

    let last = trimmed.rfind('}')?;
    if last > start {
        return decode_container(&trimmed[start..=last]);
    }

    None
}

/// Decode only objects and arrays; bare scalars do not count
fn decode_container(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

/// Byte index of the `}` closing the `{` at `start`, skipping braces inside
/// string literals
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }

    None
}

fn error_detail(raw: &str) -> String {
    const PREFIX: &str = "no JSON payload found; raw: ";
    let budget = MAX_ERROR_DETAIL - PREFIX.chars().count();
    let mut detail = String::from(PREFIX);
    detail.extend(raw.trim().chars().take(budget));
    detail
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_free_text_is_passed_through() {
        let result = parse("# 产品需求文档\n\n正文", OutputShape::FreeText);
        assert!(result.ok);
        assert_eq!(result.parsed, None);
        assert_eq!(result.error_detail, None);
    }

    #[test]
    fn test_direct_json() {
        let result = parse("  {\"project_scope\": \"K12\"}\n", OutputShape::Structured);
        assert!(result.ok);
        assert_eq!(result.parsed, Some(json!({"project_scope": "K12"})));
    }

    #[test]
    fn test_direct_array_is_accepted() {
        let result = parse("[1, 2]", OutputShape::Structured);
        assert_eq!(result.parsed, Some(json!([1, 2])));
    }

    #[test]
    fn test_scalar_is_not_structured() {
        let result = parse("42", OutputShape::Structured);
        assert!(!result.ok);
        assert_eq!(result.parsed, None);
    }

    #[test]
    fn test_embedded_payload_recovered_exactly() {
        let payload = json!({
            "goal": "在线教育",
            "phases": [{"name": "MVP", "tasks": [{"name": "登录", "description": "手机号 {验证码}"}]}]
        });
        let raw = format!(
            "好的，以下是任务规划：\n```json\n{}\n```\n如有问题请告诉我。",
            serde_json::to_string_pretty(&payload).unwrap()
        );

        let first = parse(&raw, OutputShape::Structured);
        assert!(first.ok);
        assert_eq!(first.parsed.as_ref(), Some(&payload));

        // idempotent on its own output
        let again = parse(&first.parsed.unwrap().to_string(), OutputShape::Structured);
        assert_eq!(again.parsed, Some(payload));
    }

    #[test]
    fn test_trailing_braces_after_payload() {
        let raw = r#"Result: {"a": {"b": "}"}} and a stray } here"#;
        let result = parse(raw, OutputShape::Structured);
        assert_eq!(result.parsed, Some(json!({"a": {"b": "}"}})));
    }

    #[test]
    fn test_escaped_quotes_inside_strings() {
        let raw = r#"note {"quote": "he said \"{hi}\""} end"#;
        let result = parse(raw, OutputShape::Structured);
        assert_eq!(result.parsed, Some(json!({"quote": "he said \"{hi}\""})));
    }

    #[test]
    fn test_invalid_span_yields_none() {
        let raw = "x {\"a\": {bad}, \"b\": 1} y";
        assert_eq!(extract_structured(raw), None);
    }

    #[test]
    fn test_dangling_open_brace_after_payload() {
        let raw = "x {\"outer\": {\"k\": 1}} trailing {";
        assert_eq!(extract_structured(raw), Some(json!({"outer": {"k": 1}})));
    }

    #[test]
    fn test_prose_fails_with_bounded_detail() {
        let raw = "抱歉，我无法提供市场调研结果。".repeat(40);
        let result = parse(&raw, OutputShape::Structured);

        assert!(!result.ok);
        assert_eq!(result.parsed, None);
        let detail = result.error_detail.unwrap();
        assert!(detail.chars().count() <= MAX_ERROR_DETAIL);
        assert!(detail.contains("抱歉"));
    }

    #[test]
    fn test_unbalanced_input_does_not_panic() {
        for raw in ["{", "}", "}{", "{\"a\": \"}", "{{{{", "\"{\"", ""] {
            let result = parse(raw, OutputShape::Structured);
            assert!(!result.ok, "{raw:?} should not parse");
        }
    }
}
