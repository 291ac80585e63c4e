// =============================================================================
// JSON guard — defensive parsing of structured LLM responses
// =============================================================================
//
// Models wrap JSON in code fences, prepend prose, and truncate mid-object.
// Extraction order:
//   1. Strip code fences.
//   2. Locate the outermost `{...}` via brace counting and parse it.
//   3. If that fails, parse the first syntactically balanced object.
// Callers decide whether an unparseable response means retry or defaults.
// =============================================================================

use serde_json::Value;

use crate::llm::LlmError;

/// Estimated output budget for a structured response with `field_count`
/// expected fields. The manager honors the larger of this and the caller's
/// requested maximum so complex JSON is not truncated.
pub fn scaled_max_tokens(field_count: usize, requested: u32) -> u32 {
    let scaled = (field_count as u32) * 50 + 500;
    scaled.max(requested)
}

/// Strip markdown code fences, keeping the fenced body.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip an optional language tag ("json\n...").
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
        return body.trim();
    }
    trimmed
}

/// Whether the braces in `text` are balanced (and at least one object
/// opens). A truncated response fails this check.
pub fn braces_balanced(text: &str) -> bool {
    let mut depth: i64 = 0;
    let mut seen_open = false;
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => {
                depth += 1;
                seen_open = true;
            }
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    seen_open && depth == 0
}

/// Extract and parse the JSON object embedded in a model response.
pub fn extract_json(text: &str) -> Result<Value, LlmError> {
    let cleaned = strip_code_fences(text);

    // Outermost {...}: first '{' to last '}'.
    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&cleaned[start..=end]) {
                return Ok(value);
            }
        }
    }

    // Fall back to the first balanced object (prose may follow the JSON and
    // contain stray braces).
    if let Some(candidate) = first_balanced_object(cleaned) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Ok(value);
        }
    }

    // Last resort: the whole cleaned text.
    serde_json::from_str::<Value>(cleaned)
        .map_err(|e| LlmError::Parse(format!("no JSON object found in response: {e}")))
}

/// Slice of the first syntactically balanced `{...}` in `text`, respecting
/// string literals.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        let ch = b as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Completeness gate for a structured response: the raw text must be
/// brace-balanced and the parsed object must carry at least `min_fraction`
/// of the expected keys.
pub fn is_complete(raw: &str, parsed: &Value, expected_keys: &[&str], min_fraction: f64) -> bool {
    if !braces_balanced(strip_code_fences(raw)) {
        return false;
    }
    if expected_keys.is_empty() {
        return true;
    }
    let obj = match parsed.as_object() {
        Some(o) => o,
        None => return false,
    };
    let present = expected_keys.iter().filter(|k| obj.contains_key(**k)).count();
    (present as f64) / (expected_keys.len() as f64) >= min_fraction
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_object_parses() {
        let v = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn fenced_object_parses() {
        let text = "Here you go:\n```json\n{\"decision\": \"EXECUTE\"}\n```\nGood luck!";
        let v = extract_json(text).unwrap();
        assert_eq!(v["decision"], "EXECUTE");
    }

    #[test]
    fn bare_fence_without_language_tag() {
        let text = "```\n{\"a\": true}\n```";
        let v = extract_json(text).unwrap();
        assert_eq!(v["a"], true);
    }

    #[test]
    fn object_surrounded_by_prose() {
        let text = "Sure! The analysis is {\"trend\": \"UP\", \"strength\": 80} as requested.";
        let v = extract_json(text).unwrap();
        assert_eq!(v["trend"], "UP");
    }

    /// Round-trip property: any response whose outermost balanced object is
    /// valid JSON comes back as that object, fences and prose regardless.
    #[test]
    fn balanced_object_recovered_despite_trailing_brace_noise() {
        let text = "{\"a\": {\"b\": 2}} and then an unmatched } in prose";
        let v = extract_json(text).unwrap();
        assert_eq!(v["a"]["b"], 2);
    }

    #[test]
    fn nested_object_with_braces_in_strings() {
        let text = r#"{"msg": "use {curly} braces", "n": 1}"#;
        let v = extract_json(text).unwrap();
        assert_eq!(v["n"], 1);
    }

    #[test]
    fn truncated_object_is_an_error() {
        let err = extract_json(r#"{"a": 1, "b": {"c":"#);
        assert!(err.is_err());
    }

    #[test]
    fn no_json_at_all_is_an_error() {
        assert!(extract_json("I cannot answer that.").is_err());
    }

    // ---- brace balance ----------------------------------------------------

    #[test]
    fn balance_checks() {
        assert!(braces_balanced(r#"{"a": {"b": 1}}"#));
        assert!(!braces_balanced(r#"{"a": {"b": 1}"#));
        assert!(!braces_balanced("no object here"));
        assert!(braces_balanced(r#"{"s": "ignore } this"}"#));
    }

    // ---- completeness gate ------------------------------------------------

    #[test]
    fn complete_response_passes_gate() {
        let raw = r#"{"a": 1, "b": 2, "c": 3}"#;
        let parsed = extract_json(raw).unwrap();
        assert!(is_complete(raw, &parsed, &["a", "b", "c"], 0.6));
    }

    #[test]
    fn sparse_response_fails_gate() {
        let raw = r#"{"a": 1}"#;
        let parsed = extract_json(raw).unwrap();
        assert!(!is_complete(raw, &parsed, &["a", "b", "c", "d"], 0.6));
    }

    #[test]
    fn truncated_raw_fails_gate_even_if_salvaged() {
        // The inner object can be salvaged, but unbalanced raw text means
        // the response was cut off.
        let raw = r#"{"a": {"x": 1}, "b""#;
        let parsed = serde_json::json!({"a": {"x": 1}});
        assert!(!is_complete(raw, &parsed, &["a"], 0.5));
    }

    // ---- token scaling ----------------------------------------------------

    #[test]
    fn max_tokens_scale_with_field_count() {
        // fields x 50 + 500
        assert_eq!(scaled_max_tokens(10, 800), 1000);
        // Never below the caller's request.
        assert_eq!(scaled_max_tokens(2, 2000), 2000);
    }
}
