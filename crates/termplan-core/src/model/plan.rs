//! Curriculum plan output types and the transient generation attempt record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::fragment::{RetrievedFragment, SourceType};

/// Maximum number of characters of raw model output kept on an attempt.
const RAW_OUTPUT_KEEP: usize = 2000;

/// Maximum number of characters of fragment text kept in a source summary.
const SNIPPET_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A validated, term-structured curriculum plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurriculumPlan {
    /// Correlates the plan to the request that produced it.
    pub request_id: Uuid,
    pub curriculum: String,
    pub subject: String,
    pub grade: String,
    /// Terms ordered by `term_number`, numbered `1..=N` without gaps.
    pub terms: Vec<TermPlan>,
    /// `false` when no reference fragment was available to ground generation.
    pub grounded: bool,
    /// The fragments the plan was grounded on.
    #[serde(default)]
    pub sources: Vec<SourceSummary>,
    /// Index collection the sources came from; absent for ungrounded plans
    /// and for backends without collections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_used: Option<String>,
    /// Repairs applied to the model output before it was accepted.
    #[serde(default)]
    pub repair_notes: Vec<RepairNote>,
    pub generated_at: DateTime<Utc>,
}

impl CurriculumPlan {
    /// Look up a term by its number.
    pub fn term(&self, number: u32) -> Option<&TermPlan> {
        self.terms.iter().find(|t| t.term_number == number)
    }
}

/// One term of a curriculum plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TermPlan {
    pub term_number: u32,
    pub theme: String,
    pub projects: Vec<ProjectAssignment>,
    pub assessment_criteria: Vec<AssessmentCriterion>,
}

impl TermPlan {
    pub fn criterion(&self, id: &str) -> Option<&AssessmentCriterion> {
        self.assessment_criteria.iter().find(|c| c.id == id)
    }
}

/// A project assigned within a term.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectAssignment {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Learning objectives; never empty in a validated plan.
    pub objectives: Vec<String>,
    /// Ids of the term's assessment criteria this project is assessed by.
    pub criteria: Vec<String>,
}

/// An assessment criterion with its rubric levels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssessmentCriterion {
    pub id: String,
    pub description: String,
    pub rubric_levels: Vec<String>,
}

/// A short record of one grounding fragment, returned alongside the plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSummary {
    pub id: String,
    pub source_type: SourceType,
    pub score: f32,
    pub snippet: String,
}

impl From<&RetrievedFragment> for SourceSummary {
    fn from(f: &RetrievedFragment) -> Self {
        let text = f.text.trim();
        let snippet = if text.chars().count() > SNIPPET_CHARS {
            let head: String = text.chars().take(SNIPPET_CHARS).collect();
            format!("{head}...")
        } else {
            text.to_string()
        };
        Self {
            id: f.id.clone(),
            source_type: f.source_type,
            score: f.score,
            snippet,
        }
    }
}

/// A repair applied by the output validator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairNote {
    /// Term the repair applies to, if it is term-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<u32>,
    pub message: String,
}

impl RepairNote {
    pub fn plan(message: impl Into<String>) -> Self {
        Self {
            term: None,
            message: message.into(),
        }
    }

    pub fn term(term: u32, message: impl Into<String>) -> Self {
        Self {
            term: Some(term),
            message: message.into(),
        }
    }
}

impl fmt::Display for RepairNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.term {
            Some(t) => write!(f, "term {t}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Generation attempts
// ---------------------------------------------------------------------------

/// Step of the multi-step generation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "step", content = "term")]
pub enum GenerationStep {
    Outline,
    Elaborate(u32),
    Consistency,
    Lesson,
}

impl fmt::Display for GenerationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outline => f.write_str("outline"),
            Self::Elaborate(n) => write!(f, "elaborate term {n}"),
            Self::Consistency => f.write_str("consistency"),
            Self::Lesson => f.write_str("lesson"),
        }
    }
}

/// Outcome of a single model call as seen by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Accepted,
    Repaired,
    Rejected,
    Failed,
}

/// Transient diagnostic record of one model call.
///
/// Holds a digest of the prompt, never the prompt itself, so attempts can be
/// logged or attached to errors without leaking grounding material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationAttempt {
    pub step: GenerationStep,
    /// 1-based attempt number within the step.
    pub attempt: u32,
    /// SHA-256 hex of the prompt.
    pub prompt_digest: String,
    pub prompt_chars: usize,
    /// Raw model output, truncated for diagnostics. Empty when the call failed.
    pub raw_output: String,
    pub outcome: AttemptOutcome,
    /// Short reason for `rejected`/`failed` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl GenerationAttempt {
    pub fn new(step: GenerationStep, attempt: u32, prompt: &str) -> Self {
        let digest = Sha256::digest(prompt.as_bytes());
        Self {
            step,
            attempt,
            prompt_digest: hex::encode(digest),
            prompt_chars: prompt.chars().count(),
            raw_output: String::new(),
            outcome: AttemptOutcome::Failed,
            detail: None,
        }
    }

    pub fn with_output(mut self, raw: &str, outcome: AttemptOutcome) -> Self {
        self.raw_output = raw.chars().take(RAW_OUTPUT_KEEP).collect();
        self.outcome = outcome;
        self
    }

    pub fn failed(mut self, detail: impl Into<String>) -> Self {
        self.outcome = AttemptOutcome::Failed;
        self.detail = Some(detail.into());
        self
    }

    pub fn rejected(mut self, detail: impl Into<String>) -> Self {
        self.outcome = AttemptOutcome::Rejected;
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FragmentMetadata;

    #[test]
    fn attempt_records_digest_not_prompt() {
        let attempt = GenerationAttempt::new(GenerationStep::Outline, 1, "secret grounding text");
        assert_eq!(attempt.prompt_digest.len(), 64);
        assert!(!attempt.prompt_digest.contains("secret"));
        assert_eq!(attempt.prompt_chars, "secret grounding text".len());
        assert_eq!(attempt.outcome, AttemptOutcome::Failed);
    }

    #[test]
    fn attempt_truncates_raw_output() {
        let raw = "x".repeat(RAW_OUTPUT_KEEP + 500);
        let attempt = GenerationAttempt::new(GenerationStep::Consistency, 2, "p")
            .with_output(&raw, AttemptOutcome::Rejected);
        assert_eq!(attempt.raw_output.len(), RAW_OUTPUT_KEEP);
        assert_eq!(attempt.outcome, AttemptOutcome::Rejected);
    }

    #[test]
    fn source_summary_snips_long_text() {
        let fragment = RetrievedFragment::new(
            "s1",
            SourceType::CurriculumStandard,
            "a".repeat(500),
            0.9,
            FragmentMetadata::default(),
        );
        let summary = SourceSummary::from(&fragment);
        assert_eq!(summary.snippet.len(), SNIPPET_CHARS + 3);
        assert!(summary.snippet.ends_with("..."));
    }

    #[test]
    fn repair_note_display() {
        assert_eq!(RepairNote::term(2, "dropped x").to_string(), "term 2: dropped x");
        assert_eq!(RepairNote::plan("renumbered").to_string(), "renumbered");
    }

    #[test]
    fn step_display() {
        assert_eq!(GenerationStep::Elaborate(3).to_string(), "elaborate term 3");
        assert_eq!(GenerationStep::Outline.to_string(), "outline");
    }
}
