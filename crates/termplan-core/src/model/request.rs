//! Plan request type and its validation.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A request for a term-structured curriculum plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanRequest {
    /// Curriculum name or id (e.g. "Ontario", "National").
    pub curriculum: String,
    /// Subject name (e.g. "Mathematics").
    pub subject: String,
    /// Grade level (e.g. "5").
    pub grade: String,
    /// Number of terms to plan.
    pub term_count: u32,
}

/// Inclusive bounds on `term_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermRange {
    pub min: u32,
    pub max: u32,
}

impl TermRange {
    pub fn as_range(&self) -> RangeInclusive<u32> {
        self.min..=self.max
    }

    pub fn contains(&self, n: u32) -> bool {
        self.as_range().contains(&n)
    }
}

impl Default for TermRange {
    fn default() -> Self {
        Self { min: 1, max: 12 }
    }
}

/// Reasons a request is rejected before any backend is contacted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("field {0:?} must not be empty")]
    EmptyField(&'static str),

    #[error("term count {value} is outside the allowed range {min}..={max}")]
    TermCountOutOfRange { value: u32, min: u32, max: u32 },
}

impl PlanRequest {
    pub fn new(
        curriculum: impl Into<String>,
        subject: impl Into<String>,
        grade: impl Into<String>,
        term_count: u32,
    ) -> Self {
        Self {
            curriculum: curriculum.into(),
            subject: subject.into(),
            grade: grade.into(),
            term_count,
        }
    }

    /// Check the request invariants: non-empty fields and a term count
    /// within `range`.
    pub fn validate(&self, range: &TermRange) -> Result<(), RequestError> {
        for (name, value) in [
            ("curriculum", &self.curriculum),
            ("subject", &self.subject),
            ("grade", &self.grade),
        ] {
            if value.trim().is_empty() {
                return Err(RequestError::EmptyField(name));
            }
        }
        if !range.contains(self.term_count) {
            return Err(RequestError::TermCountOutOfRange {
                value: self.term_count,
                min: range.min,
                max: range.max,
            });
        }
        Ok(())
    }

    /// Natural-language description of the request, used as the retrieval
    /// query text.
    pub fn query_text(&self) -> String {
        format!(
            "{curriculum} {subject} curriculum, grade {grade}: curriculum standards, \
             project templates and assessment criteria for a {terms}-term plan",
            curriculum = self.curriculum.trim(),
            subject = self.subject.trim(),
            grade = self.grade.trim(),
            terms = self.term_count,
        )
    }
}
