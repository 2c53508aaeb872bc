//! Extraction of structured JSON from free-form reasoner output.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"))
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```[A-Za-z]*").expect("valid regex"))
}

/// Parse reasoner text into JSON.
///
/// `<think>` blocks and code fences are removed, then the whole text is
/// tried as JSON, then the first balanced `{...}` object. Strings spelling
/// `null`, `none`, `true` or `false` are converted to the JSON value.
pub fn parse_structured_output(text: &str) -> Result<Value, String> {
    let clean = think_re().replace_all(text, "");
    let clean = fence_re().replace_all(&clean, "");
    let clean = clean.trim();
    if clean.is_empty() {
        return Err("empty output".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(clean) {
        return Ok(sanitize(value));
    }

    match first_json_object(clean) {
        Some(candidate) => serde_json::from_str::<Value>(candidate)
            .map(sanitize)
            .map_err(|e| format!("malformed JSON object: {}", e)),
        None => Err(format!("no JSON object found in: {}", preview(clean))),
    }
}

/// Slice of the first balanced `{...}`, ignoring braces inside strings.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
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
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn sanitize(value: Value) -> Value {
    match value {
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "null" | "none" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(s),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, sanitize(v))).collect()),
        other => other,
    }
}

fn preview(text: &str) -> String {
    let mut p: String = text.chars().take(80).collect();
    if p.len() < text.len() {
        p.push_str("...");
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_json() {
        assert_eq!(
            parse_structured_output(r#"{"a": 1}"#).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(parse_structured_output("[1, 2]").unwrap(), json!([1, 2]));
    }

    #[test]
    fn strips_think_and_fences() {
        let text = "<think>\nlet me {think}\n</think>\n```json\n{\"ok\": \"true\"}\n```";
        assert_eq!(parse_structured_output(text).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn extracts_embedded_object() {
        let text = r#"Sure! Here you go: {"name": "a}b", "nested": {"x": "None"}} Hope that helps."#;
        assert_eq!(
            parse_structured_output(text).unwrap(),
            json!({"name": "a}b", "nested": {"x": null}})
        );
    }

    #[test]
    fn prose_is_an_error() {
        assert!(parse_structured_output("no structure here").is_err());
        assert!(parse_structured_output("<think>only thoughts</think>").is_err());
        assert!(parse_structured_output("{ unbalanced").is_err());
    }
}
