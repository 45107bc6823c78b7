//! Retrieved reference fragments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of reference material a fragment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    CurriculumStandard,
    ProjectTemplate,
    AssessmentCriterion,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [
        SourceType::CurriculumStandard,
        SourceType::ProjectTemplate,
        SourceType::AssessmentCriterion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CurriculumStandard => "curriculum_standard",
            Self::ProjectTemplate => "project_template",
            Self::AssessmentCriterion => "assessment_criterion",
        }
    }

    /// Heading used when the fragment is rendered into a prompt.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CurriculumStandard => "Curriculum standard",
            Self::ProjectTemplate => "Project template",
            Self::AssessmentCriterion => "Assessment criterion",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "curriculum_standard" | "standard" => Ok(Self::CurriculumStandard),
            "project_template" | "project" => Ok(Self::ProjectTemplate),
            "assessment_criterion" | "criterion" => Ok(Self::AssessmentCriterion),
            other => Err(format!("unknown source type {other:?}")),
        }
    }
}

/// Subject/grade tags attached to a fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A snippet of reference text returned by the vector retriever.
///
/// Fragments are never mutated after retrieval; stages that need a
/// different ordering or subset build new collections of clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedFragment {
    pub id: String,
    pub source_type: SourceType,
    pub text: String,
    /// Similarity to the query, clamped to `0.0..=1.0`.
    pub score: f32,
    #[serde(default)]
    pub metadata: FragmentMetadata,
}

impl RetrievedFragment {
    pub fn new(
        id: impl Into<String>,
        source_type: SourceType,
        text: impl Into<String>,
        score: f32,
        metadata: FragmentMetadata,
    ) -> Self {
        Self {
            id: id.into(),
            source_type,
            text: text.into(),
            score: score.clamp(0.0, 1.0),
            metadata,
        }
    }

    /// The block of text this fragment contributes to a generation context.
    pub fn render(&self) -> String {
        format!(
            "[{}] {} ({})\n{}\n",
            self.id,
            self.source_type.label(),
            self.tag_line(),
            self.text.trim()
        )
    }

    fn tag_line(&self) -> String {
        let mut parts = Vec::new();
        if let Some(s) = &self.metadata.subject {
            parts.push(format!("subject: {s}"));
        }
        if let Some(g) = &self.metadata.grade {
            parts.push(format!("grade: {g}"));
        }
        if parts.is_empty() {
            "untagged".to_string()
        } else {
            parts.join(", ")
        }
    }
}
