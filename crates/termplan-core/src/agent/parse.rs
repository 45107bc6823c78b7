//! Usability checks for per-step model output.
//!
//! These checks only decide whether a step's output can be carried into the
//! next step. Full structural validation and repair of the final plan is
//! done by [`crate::validate`].

use serde::Serialize;
use serde_json::{Map, Value};

use crate::validate::json::extract_object;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutlineTerm {
    pub term: u32,
    pub theme: String,
}

/// Output of the outline step, ordered by term number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outline {
    pub terms: Vec<OutlineTerm>,
}

fn number_of(obj: &Map<String, Value>) -> Option<u32> {
    ["term", "term_number", "number"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s
                .split(|c: char| !c.is_ascii_digit())
                .find(|p| !p.is_empty())
                .and_then(|p| p.parse().ok()),
            _ => None,
        })
}

fn theme_of(obj: &Map<String, Value>) -> Option<String> {
    ["theme", "title", "name"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse outline output. It must list exactly `n` terms numbered `1..=n`;
/// if no entry carries a number they are numbered by position.
pub fn parse_outline(text: &str, n: u32) -> Result<Outline, String> {
    let root = extract_object(text)?;
    let entries = root
        .get("terms")
        .and_then(Value::as_array)
        .ok_or("outline has no \"terms\" array")?;
    if entries.len() != n as usize {
        return Err(format!("outline lists {} terms, expected {n}", entries.len()));
    }

    let objects: Vec<&Map<String, Value>> = entries.iter().filter_map(Value::as_object).collect();
    if objects.len() != entries.len() {
        return Err("outline entries must be objects".to_string());
    }
    let numbers: Vec<Option<u32>> = objects.iter().map(|o| number_of(o)).collect();
    let by_position = numbers.iter().all(Option::is_none);

    let mut terms = Vec::with_capacity(objects.len());
    for (i, (obj, number)) in objects.iter().zip(numbers).enumerate() {
        let term = if by_position {
            i as u32 + 1
        } else {
            number.ok_or_else(|| format!("outline entry {} has no term number", i + 1))?
        };
        let theme = theme_of(obj).unwrap_or_else(|| format!("Term {term}"));
        terms.push(OutlineTerm { term, theme });
    }
    terms.sort_by_key(|t| t.term);
    let contiguous = terms.iter().enumerate().all(|(i, t)| t.term == i as u32 + 1);
    if !contiguous {
        return Err(format!("outline term numbers are not exactly 1..={n}"));
    }
    Ok(Outline { terms })
}

/// Parse one term's elaboration. Accepts the term object itself, or a
/// wrapper (`{"term": {...}}` or `{"terms": [{...}]}`). The term number is
/// forced to `term.term` and a missing theme is taken from the outline.
pub fn parse_term(text: &str, term: &OutlineTerm) -> Result<Value, String> {
    let root = extract_object(text)?;
    let mut obj = match root {
        Value::Object(mut o) if !o.contains_key("projects") => {
            let inner = match (o.remove("term"), o.remove("terms")) {
                (Some(Value::Object(inner)), _) => Some(inner),
                (_, Some(Value::Array(mut items))) if items.len() == 1 => match items.remove(0) {
                    Value::Object(inner) => Some(inner),
                    _ => None,
                },
                _ => None,
            };
            inner.ok_or("term output has no \"projects\"")?
        }
        Value::Object(o) => o,
        _ => return Err("term output is not an object".to_string()),
    };

    match obj.get("projects") {
        Some(Value::Array(p)) if !p.is_empty() => {}
        _ => return Err(format!("term {} output has no projects", term.term)),
    }

    for alias in ["term", "number"] {
        obj.remove(alias);
    }
    obj.insert("term_number".to_string(), Value::from(term.term));
    if theme_of(&obj).is_none() {
        obj.insert("theme".to_string(), Value::String(term.theme.clone()));
    }
    Ok(Value::Object(obj))
}

/// Parse consistency output: a `{"terms": [...]}` object with `n` terms.
pub fn parse_plan(text: &str, n: u32) -> Result<Value, String> {
    let root = extract_object(text)?;
    match root.get("terms").and_then(Value::as_array) {
        Some(terms) if terms.len() == n as usize => Ok(root),
        Some(terms) => Err(format!("revised plan has {} terms, expected {n}", terms.len())),
        None => Err("revised plan has no \"terms\" array".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(n: u32, theme: &str) -> OutlineTerm {
        OutlineTerm {
            term: n,
            theme: theme.into(),
        }
    }

    #[test]
    fn outline_sorted_by_number() {
        let o = parse_outline(
            r#"{"terms":[{"term":2,"theme":"B"},{"term":1,"theme":"A"}]}"#,
            2,
        )
        .unwrap();
        assert_eq!(o.terms, vec![term(1, "A"), term(2, "B")]);
    }

    #[test]
    fn outline_numbers_by_position_when_missing() {
        let o = parse_outline(r#"{"terms":[{"theme":"A"},{}]}"#, 2).unwrap();
        assert_eq!(o.terms, vec![term(1, "A"), term(2, "Term 2")]);
    }

    #[test]
    fn outline_with_wrong_count_or_gaps_is_unusable() {
        assert!(parse_outline(r#"{"terms":[{"term":1}]}"#, 2).is_err());
        assert!(parse_outline(r#"{"terms":[{"term":1},{"term":3}]}"#, 2).is_err());
        assert!(parse_outline("not json", 1).is_err());
    }

    #[test]
    fn term_output_is_normalised() {
        let v = parse_term(
            r#"{"term": 7, "projects": [{"name": "P"}]}"#,
            &term(2, "Decimals"),
        )
        .unwrap();
        assert_eq!(v["term_number"], 2);
        assert_eq!(v["theme"], "Decimals");
        assert!(v.get("term").is_none());
    }

    #[test]
    fn wrapped_term_output_is_unwrapped() {
        let v = parse_term(
            r#"{"term": {"theme": "X", "projects": [{"name": "P"}]}}"#,
            &term(1, "Y"),
        )
        .unwrap();
        assert_eq!(v["theme"], "X");
        let v = parse_term(r#"{"terms": [{"projects": [{"name": "P"}]}]}"#, &term(3, "Z")).unwrap();
        assert_eq!(v["term_number"], 3);
    }

    #[test]
    fn term_without_projects_is_unusable() {
        assert!(parse_term(r#"{"theme": "X", "projects": []}"#, &term(1, "X")).is_err());
        assert!(parse_term(r#"{"theme": "X"}"#, &term(1, "X")).is_err());
    }

    #[test]
    fn revised_plan_needs_all_terms() {
        assert!(parse_plan(r#"{"terms":[{},{}]}"#, 2).is_ok());
        assert!(parse_plan(r#"{"terms":[{}]}"#, 2).is_err());
    }
}
