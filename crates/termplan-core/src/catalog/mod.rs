//! Built-in reference catalog.
//!
//! A small library of project templates, assessment criteria and
//! curriculum standards, defined in `catalog.toml` and embedded in the
//! binary at compile time. The catalog backs the static reference
//! endpoints and is the default corpus of the in-memory vector index.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::SourceType;
use crate::retrieval::CorpusEntry;

/// The embedded catalog TOML.
static CATALOG_TOML: &str = include_str!("catalog.toml");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate catalog id {0:?}")]
    DuplicateId(String),

    #[error("project {project:?} references unknown criterion {criterion:?}")]
    UnknownCriterion { project: String, criterion: String },
}

/// A reusable project idea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectTemplate {
    pub id: String,
    pub name: String,
    /// `None` for cross-curricular templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grades: Vec<String>,
    pub description: String,
    #[serde(default)]
    pub objectives: Vec<String>,
    /// Ids of the criteria this template is usually assessed against.
    #[serde(default)]
    pub criteria: Vec<String>,
}

/// A reusable assessment criterion with its rubric levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionTemplate {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub description: String,
    #[serde(default)]
    pub rubric_levels: Vec<String>,
}

/// A curriculum standard statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardEntry {
    pub id: String,
    pub subject: String,
    pub grade: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub projects: Vec<ProjectTemplate>,
    #[serde(default)]
    pub criteria: Vec<CriterionTemplate>,
    #[serde(default)]
    pub standards: Vec<StandardEntry>,
}

fn subject_matches(entry: Option<&str>, wanted: Option<&str>) -> bool {
    match (entry, wanted) {
        (_, None) | (None, _) => true,
        (Some(e), Some(w)) => e.trim().eq_ignore_ascii_case(w.trim()),
    }
}

impl Catalog {
    /// Load the catalog embedded in the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml_str(CATALOG_TOML)
    }

    /// Parse and check a catalog: ids are unique and every project's
    /// criteria exist.
    pub fn from_toml_str(s: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = toml::from_str(s)?;
        let mut seen = std::collections::HashSet::new();
        let ids = catalog
            .projects
            .iter()
            .map(|p| &p.id)
            .chain(catalog.criteria.iter().map(|c| &c.id))
            .chain(catalog.standards.iter().map(|s| &s.id));
        for id in ids {
            if !seen.insert(id.as_str()) {
                return Err(CatalogError::DuplicateId(id.clone()));
            }
        }
        for project in &catalog.projects {
            for criterion in &project.criteria {
                if catalog.criterion(criterion).is_none() {
                    return Err(CatalogError::UnknownCriterion {
                        project: project.id.clone(),
                        criterion: criterion.clone(),
                    });
                }
            }
        }
        Ok(catalog)
    }

    /// Project templates for a subject. Cross-curricular templates are
    /// always included; `None` returns everything.
    pub fn projects(&self, subject: Option<&str>) -> Vec<&ProjectTemplate> {
        self.projects
            .iter()
            .filter(|p| subject_matches(p.subject.as_deref(), subject))
            .collect()
    }

    /// Assessment criteria for a subject, same rules as [`Catalog::projects`].
    pub fn criteria(&self, subject: Option<&str>) -> Vec<&CriterionTemplate> {
        self.criteria
            .iter()
            .filter(|c| subject_matches(c.subject.as_deref(), subject))
            .collect()
    }

    pub fn criterion(&self, id: &str) -> Option<&CriterionTemplate> {
        self.criteria.iter().find(|c| c.id == id)
    }

    /// Flatten the catalog into indexable corpus entries.
    pub fn corpus(&self) -> Vec<CorpusEntry> {
        let mut entries = Vec::with_capacity(
            self.projects.len() + self.criteria.len() + self.standards.len(),
        );
        for s in &self.standards {
            entries.push(CorpusEntry {
                id: s.id.clone(),
                source_type: SourceType::CurriculumStandard,
                text: s.text.clone(),
                subject: Some(s.subject.clone()),
                grade: Some(s.grade.clone()),
                tags: Vec::new(),
            });
        }
        for p in &self.projects {
            let mut text = format!("{}: {}", p.name, p.description);
            if !p.objectives.is_empty() {
                text.push_str(" Objectives: ");
                text.push_str(&p.objectives.join("; "));
                text.push('.');
            }
            entries.push(CorpusEntry {
                id: p.id.clone(),
                source_type: SourceType::ProjectTemplate,
                text,
                subject: p.subject.clone(),
                grade: None,
                tags: p.grades.iter().map(|g| format!("grade-{g}")).collect(),
            });
        }
        for c in &self.criteria {
            let levels = if c.rubric_levels.is_empty() {
                String::new()
            } else {
                format!(" Levels: {}.", c.rubric_levels.join(", "))
            };
            entries.push(CorpusEntry {
                id: c.id.clone(),
                source_type: SourceType::AssessmentCriterion,
                text: format!("{}: {}{levels}", c.name, c.description),
                subject: c.subject.clone(),
                grade: None,
                tags: Vec::new(),
            });
        }
        entries
    }
}
