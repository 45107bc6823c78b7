//! Output validation and repair.
//!
//! Parses the agent's raw plan JSON leniently, checks the structural rules
//! of a curriculum plan, and applies a fixed set of repairs. Anything the
//! repairs cannot fix is rejected with [`EngineError::PlanInvalid`]; the
//! engine decides whether to re-generate.
//!
//! Field aliases accepted on input:
//!
//! | field                 | aliases                                   |
//! |-----------------------|-------------------------------------------|
//! | term `term_number`    | `term`, `number`                          |
//! | term `theme`          | `title`, `name`                           |
//! | term criteria         | `assessment_criteria`, `criteria`         |
//! | project `name`        | `title`                                   |
//! | project `objectives`  | `learning_objectives`, `goals`            |
//! | project criteria refs | `criteria`, `criterion_ids`, `assessment_criteria` |
//! | criterion description | `criterion`, `name`, `text`               |
//! | criterion levels      | `rubric_levels`, `levels`, `rubric`       |

pub mod json;

use std::collections::{BTreeSet, HashSet};

use serde_json::{Map, Value};

use crate::agent::RawPlan;
use crate::error::EngineError;
use crate::model::{
    AssessmentCriterion, AttemptOutcome, PlanRequest, ProjectAssignment, RepairNote, TermPlan,
};
use crate::text::token_similarity;

/// Rubric levels used when a criterion names none.
pub const DEFAULT_RUBRIC_LEVELS: [&str; 4] = ["Beginning", "Developing", "Proficient", "Extending"];

/// A plan that passed validation, possibly after repairs.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPlan {
    pub terms: Vec<TermPlan>,
    pub notes: Vec<RepairNote>,
    /// `Accepted` when no repair was needed, else `Repaired`.
    pub outcome: AttemptOutcome,
}

/// Structural checks and repairs for model output.
#[derive(Debug, Clone, Copy)]
pub struct PlanValidator {
    match_threshold: f32,
}

impl Default for PlanValidator {
    fn default() -> Self {
        Self::new(0.5)
    }
}

// ---------------------------------------------------------------------------
// Lenient field access
// ---------------------------------------------------------------------------

fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match field(obj, keys)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A list of strings; a single string counts as a one-element list and
/// objects contribute their `id` or `description`.
fn string_list(obj: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    let item = |v: &Value| -> Option<String> {
        match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Object(o) => text_field(o, &["id", "description", "name"]),
            _ => None,
        }
    };
    match field(obj, keys) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(item)
            .filter(|s| !s.is_empty())
            .collect(),
        Some(v @ Value::String(_)) => item(v).into_iter().filter(|s| !s.is_empty()).collect(),
        _ => Vec::new(),
    }
}

/// Term number from a number, a numeric string, or text like "Term 2".
fn term_number(obj: &Map<String, Value>) -> Option<u32> {
    match field(obj, &["term_number", "term", "number"])? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s
            .split(|c: char| !c.is_ascii_digit())
            .find(|part| !part.is_empty())
            .and_then(|digits| digits.parse().ok()),
        _ => None,
    }
}

/// `{prefix}{n}` for the first `n >= start` not in `taken`.
fn fresh_id(prefix: &str, start: usize, taken: &HashSet<String>) -> String {
    (start..)
        .map(|n| format!("{prefix}{n}"))
        .find(|id| !taken.contains(id))
        .unwrap_or_else(|| format!("{prefix}{start}"))
}

fn invalid(raw: &RawPlan, reason: impl Into<String>) -> EngineError {
    EngineError::plan_invalid(reason).with_attempt(raw.attempt.clone())
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

impl PlanValidator {
    pub fn new(match_threshold: f32) -> Self {
        Self { match_threshold }
    }

    /// Check and repair `raw` against `request`.
    pub fn validate(&self, raw: &RawPlan, request: &PlanRequest) -> Result<ValidatedPlan, EngineError> {
        let root = json::extract_object(&raw.text).map_err(|e| invalid(raw, e))?;
        let terms = root
            .get("terms")
            .or_else(|| root.get("term_plans"))
            .and_then(Value::as_array)
            .ok_or_else(|| invalid(raw, "plan has no \"terms\" array"))?;

        let expected = request.term_count as usize;
        if terms.is_empty() {
            return Err(invalid(raw, "plan is empty"));
        }
        if terms.len() != expected {
            return Err(invalid(
                raw,
                format!("expected {expected} terms, got {}", terms.len()),
            ));
        }

        let mut objects = Vec::with_capacity(terms.len());
        for (i, t) in terms.iter().enumerate() {
            match t.as_object() {
                Some(o) => objects.push(o),
                None => return Err(invalid(raw, format!("term at position {} is not an object", i + 1))),
            }
        }

        let mut notes = Vec::new();
        let numbers = self
            .number_terms(&objects, expected, &mut notes)
            .map_err(|e| invalid(raw, e))?;

        let mut numbered: Vec<(u32, &Map<String, Value>)> = numbers.into_iter().zip(objects).collect();
        numbered.sort_by_key(|(n, _)| *n);

        let mut plan_terms = Vec::with_capacity(expected);
        for (number, obj) in numbered {
            let term = self
                .repair_term(number, obj, &mut notes)
                .map_err(|e| invalid(raw, e))?;
            plan_terms.push(term);
        }

        let outcome = if notes.is_empty() {
            AttemptOutcome::Accepted
        } else {
            AttemptOutcome::Repaired
        };
        Ok(ValidatedPlan {
            terms: plan_terms,
            notes,
            outcome,
        })
    }

    /// Term numbers must be exactly `1..=n`. When every number is missing
    /// they are assigned by position.
    fn number_terms(
        &self,
        terms: &[&Map<String, Value>],
        n: usize,
        notes: &mut Vec<RepairNote>,
    ) -> Result<Vec<u32>, String> {
        let found: Vec<Option<u32>> = terms.iter().map(|t| term_number(t)).collect();
        if found.iter().all(Option::is_none) {
            notes.push(RepairNote::plan("term numbers were missing and assigned by position"));
            return Ok((1..=n as u32).collect());
        }
        let mut numbers = Vec::with_capacity(n);
        for (i, number) in found.into_iter().enumerate() {
            match number {
                Some(num) => numbers.push(num),
                None => return Err(format!("term at position {} has no term number", i + 1)),
            }
        }
        let unique: BTreeSet<u32> = numbers.iter().copied().collect();
        let wanted: BTreeSet<u32> = (1..=n as u32).collect();
        if unique.len() != numbers.len() {
            return Err("duplicate term numbers".to_string());
        }
        if unique != wanted {
            return Err(format!(
                "term numbers {:?} are not exactly 1..={n}",
                unique.into_iter().collect::<Vec<_>>()
            ));
        }
        Ok(numbers)
    }

    fn repair_term(
        &self,
        number: u32,
        obj: &Map<String, Value>,
        notes: &mut Vec<RepairNote>,
    ) -> Result<TermPlan, String> {
        let theme = match text_field(obj, &["theme", "title", "name"]) {
            Some(t) => t,
            None => {
                notes.push(RepairNote::term(number, "missing theme replaced with default"));
                format!("Term {number}")
            }
        };

        let criteria = self.repair_criteria(number, obj, notes);

        let raw_projects = match field(obj, &["projects"]) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        };
        let mut projects: Vec<ProjectAssignment> = Vec::with_capacity(raw_projects.len());
        let mut project_ids = HashSet::new();
        for (i, p) in raw_projects.iter().enumerate() {
            let Some(p) = p.as_object() else {
                notes.push(RepairNote::term(number, format!("project {} is not an object; dropped", i + 1)));
                continue;
            };
            let Some(mut project) = self.repair_project(number, i + 1, p, &criteria, notes) else {
                continue;
            };
            if !project_ids.insert(project.id.clone()) {
                let fresh = fresh_id(&format!("t{number}-p"), i + 1, &project_ids);
                notes.push(RepairNote::term(
                    number,
                    format!("duplicate project id {:?} renamed to {fresh:?}", project.id),
                ));
                project.id = fresh.clone();
                project_ids.insert(fresh);
            }
            projects.push(project);
        }

        if projects.is_empty() {
            return Err(format!("term {number} has no usable projects"));
        }

        Ok(TermPlan {
            term_number: number,
            theme,
            projects,
            assessment_criteria: criteria,
        })
    }

    fn repair_criteria(
        &self,
        number: u32,
        obj: &Map<String, Value>,
        notes: &mut Vec<RepairNote>,
    ) -> Vec<AssessmentCriterion> {
        let items = match field(obj, &["assessment_criteria", "criteria"]) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        };
        // Generated ids must not collide with ids the model chose itself.
        let mut taken: HashSet<String> = items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|o| text_field(o, &["id"]))
            .collect();
        let prefix = format!("t{number}-c");
        let mut out: Vec<AssessmentCriterion> = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let mut default_id = || {
                let id = fresh_id(&prefix, i + 1, &taken);
                taken.insert(id.clone());
                id
            };
            let (id, description, levels) = match item {
                Value::String(s) if !s.trim().is_empty() => (default_id(), s.trim().to_string(), Vec::new()),
                Value::Object(o) => {
                    let Some(description) = text_field(o, &["description", "criterion", "name", "text"])
                    else {
                        notes.push(RepairNote::term(
                            number,
                            format!("criterion {} has no description; dropped", i + 1),
                        ));
                        continue;
                    };
                    let id = text_field(o, &["id"]).unwrap_or_else(default_id);
                    (id, description, string_list(o, &["rubric_levels", "levels", "rubric"]))
                }
                _ => {
                    notes.push(RepairNote::term(number, format!("criterion {} is empty; dropped", i + 1)));
                    continue;
                }
            };
            if out.iter().any(|c| c.id == id) {
                notes.push(RepairNote::term(
                    number,
                    format!("duplicate criterion id {id:?}; kept the first"),
                ));
                continue;
            }
            let rubric_levels = if levels.is_empty() {
                DEFAULT_RUBRIC_LEVELS.iter().map(|l| l.to_string()).collect()
            } else {
                levels
            };
            out.push(AssessmentCriterion {
                id,
                description,
                rubric_levels,
            });
        }
        out
    }

    fn repair_project(
        &self,
        number: u32,
        position: usize,
        obj: &Map<String, Value>,
        criteria: &[AssessmentCriterion],
        notes: &mut Vec<RepairNote>,
    ) -> Option<ProjectAssignment> {
        let Some(name) = text_field(obj, &["name", "title"]) else {
            notes.push(RepairNote::term(number, format!("project {position} has no name; dropped")));
            return None;
        };

        let mut seen = HashSet::new();
        let objectives: Vec<String> = string_list(obj, &["objectives", "learning_objectives", "goals"])
            .into_iter()
            .filter(|o| seen.insert(o.to_lowercase()))
            .collect();
        if objectives.is_empty() {
            notes.push(RepairNote::term(
                number,
                format!("project {name:?} has no objectives; dropped"),
            ));
            return None;
        }

        let id = text_field(obj, &["id"]).unwrap_or_else(|| format!("t{number}-p{position}"));
        let description = text_field(obj, &["description", "summary"]).unwrap_or_else(|| name.clone());

        let mut refs: Vec<String> = Vec::new();
        for reference in string_list(obj, &["criteria", "criterion_ids", "assessment_criteria"]) {
            let resolved = if criteria.iter().any(|c| c.id == reference) {
                Some(reference.clone())
            } else {
                match self.best_match(&reference, criteria) {
                    Some(target) => {
                        notes.push(RepairNote::term(
                            number,
                            format!("project {id:?}: criterion reference {reference:?} re-pointed to {target:?}"),
                        ));
                        Some(target)
                    }
                    None => {
                        notes.push(RepairNote::term(
                            number,
                            format!("project {id:?}: dangling criterion reference {reference:?} dropped"),
                        ));
                        None
                    }
                }
            };
            if let Some(r) = resolved {
                if !refs.contains(&r) {
                    refs.push(r);
                }
            }
        }

        Some(ProjectAssignment {
            id,
            name,
            description,
            objectives,
            criteria: refs,
        })
    }

    /// The criterion whose id or description is most similar to
    /// `reference`, if the similarity reaches the threshold.
    fn best_match(&self, reference: &str, criteria: &[AssessmentCriterion]) -> Option<String> {
        criteria
            .iter()
            .map(|c| {
                let score = token_similarity(reference, &c.id)
                    .max(token_similarity(reference, &c.description));
                (score, c)
            })
            .filter(|(score, _)| *score >= self.match_threshold)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, c)| c.id.clone())
    }
}
