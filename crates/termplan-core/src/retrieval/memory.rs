//! In-process cosine index over a small corpus.
//!
//! Entries are embedded once at construction time. Used when no Qdrant URL
//! is configured, and in tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{IndexQuery, IndexResults, SearchFilters, VectorIndex, rank_fragments};
use crate::embedding::{Embedder, HashingEmbedder};
use crate::error::BackendError;
use crate::model::{FragmentMetadata, RetrievedFragment, SourceType};
use crate::text::cosine_similarity;

/// One document of an in-memory corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub id: String,
    pub source_type: SourceType,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl CorpusEntry {
    fn matches(&self, filters: &SearchFilters) -> bool {
        fn tag_ok(entry: Option<&str>, wanted: Option<&str>) -> bool {
            match (entry, wanted) {
                (Some(e), Some(w)) => e.trim().eq_ignore_ascii_case(w.trim()),
                _ => true,
            }
        }
        filters.allows(self.source_type)
            && tag_ok(self.subject.as_deref(), filters.subject.as_deref())
            && tag_ok(self.grade.as_deref(), filters.grade.as_deref())
    }

    fn to_fragment(&self, score: f32) -> RetrievedFragment {
        RetrievedFragment::new(
            self.id.clone(),
            self.source_type,
            self.text.clone(),
            score,
            FragmentMetadata {
                subject: self.subject.clone(),
                grade: self.grade.clone(),
                tags: self.tags.clone(),
            },
        )
    }
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("failed to read corpus file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corpus file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Deserialize)]
struct CorpusFile {
    #[serde(default)]
    fragments: Vec<CorpusEntry>,
}

/// Parse a TOML corpus made of `[[fragments]]` tables.
pub fn parse_corpus(s: &str) -> Result<Vec<CorpusEntry>, CorpusError> {
    let file: CorpusFile = toml::from_str(s)?;
    Ok(file.fragments)
}

/// Read and parse a TOML corpus file.
pub fn load_corpus(path: &Path) -> Result<Vec<CorpusEntry>, CorpusError> {
    let content = std::fs::read_to_string(path).map_err(|source| CorpusError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_corpus(&content)
}

/// [`VectorIndex`] holding every vector in memory.
#[derive(Debug, Clone)]
pub struct MemoryIndex {
    entries: Vec<(CorpusEntry, Vec<f32>)>,
    dimension: usize,
}

impl MemoryIndex {
    /// Build from pre-computed vectors. All vectors must share a dimension.
    pub fn with_vectors(entries: Vec<(CorpusEntry, Vec<f32>)>) -> Result<Self, BackendError> {
        let dimension = entries.first().map(|(_, v)| v.len()).unwrap_or(0);
        if let Some((entry, v)) = entries.iter().find(|(_, v)| v.len() != dimension) {
            return Err(BackendError::Configuration(format!(
                "corpus entry {} has {} dimensions, expected {dimension}",
                entry.id,
                v.len()
            )));
        }
        Ok(Self { entries, dimension })
    }

    /// Embed every entry with `embedder`. Queries must use the same embedder.
    pub fn hashed(entries: Vec<CorpusEntry>, embedder: &HashingEmbedder) -> Self {
        let dimension = embedder.dimension();
        let entries = entries
            .into_iter()
            .map(|e| {
                let v = embedder.embed_sync(&e.text);
                (e, v)
            })
            .collect();
        Self { entries, dimension }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn name(&self) -> &str {
        "memory"
    }

    async fn search(&self, query: IndexQuery<'_>) -> Result<IndexResults, BackendError> {
        if self.entries.is_empty() {
            return Ok(IndexResults::default());
        }
        if query.vector.len() != self.dimension {
            return Err(BackendError::Configuration(format!(
                "query has {} dimensions, index has {}",
                query.vector.len(),
                self.dimension
            )));
        }
        let mut hits: Vec<RetrievedFragment> = self
            .entries
            .iter()
            .filter(|(e, _)| e.matches(query.filters))
            .map(|(e, v)| e.to_fragment(cosine_similarity(query.vector, v)))
            .collect();
        rank_fragments(&mut hits);
        hits.truncate(query.limit);
        Ok(hits.into())
    }

    async fn list_collections(&self) -> Result<Vec<String>, BackendError> {
        Ok(vec!["memory".to_string()])
    }
}
