//! Lenient JSON extraction from model output.
//!
//! Models wrap JSON in markdown fences or surround it with prose. The
//! extractor tries, in order: the whole text, the body of the first code
//! fence, then the first balanced `{...}` object in the text.

use serde_json::Value;

/// Body of the first markdown code fence, without the language tag.
fn fenced_body(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip the info string ("json", "JSON", ...) up to the end of the line.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    Some(body[..end].trim())
}

/// First balanced top-level JSON object in `text`, honouring string
/// literals and escapes.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract a JSON object from model output.
pub fn extract_object(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("model output is empty".to_string());
    }

    let mut last_err = None;
    let candidates = [Some(trimmed), fenced_body(trimmed), balanced_object(trimmed)];
    for candidate in candidates.into_iter().flatten() {
        match serde_json::from_str::<Value>(candidate) {
            Ok(v @ Value::Object(_)) => return Ok(v),
            Ok(_) => last_err = Some("top-level JSON value is not an object".to_string()),
            Err(e) => last_err = Some(format!("invalid JSON: {e}")),
        }
    }
    Err(last_err.unwrap_or_else(|| "no JSON object found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_object() {
        let v = extract_object(r#" {"terms": []} "#).unwrap();
        assert!(v["terms"].is_array());
    }

    #[test]
    fn fenced_object() {
        let text = "Here is the plan:\n```json\n{\"terms\": [1]}\n```\nEnjoy!";
        assert_eq!(extract_object(text).unwrap()["terms"][0], 1);
    }

    #[test]
    fn fence_without_language_tag() {
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_object(text).unwrap()["a"], 1);
    }

    #[test]
    fn object_inside_prose_with_braces_in_strings() {
        let text = r#"Sure! {"theme": "Sets {and} \"braces\"", "n": 2} Hope that helps."#;
        let v = extract_object(text).unwrap();
        assert_eq!(v["n"], 2);
        assert_eq!(v["theme"], "Sets {and} \"braces\"");
    }

    #[test]
    fn failures_are_described() {
        assert!(extract_object("   ").unwrap_err().contains("empty"));
        assert!(extract_object("[1, 2]").unwrap_err().contains("not an object"));
        assert!(extract_object("no json here").is_err());
        assert!(extract_object("{\"unterminated\": ").is_err());
    }
}
