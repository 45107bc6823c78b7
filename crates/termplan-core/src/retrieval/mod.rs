//! Vector retriever: top-K reference fragments for a query vector.
//!
//! Backends implement [`VectorIndex`]. The [`VectorRetriever`] applies the
//! parts of the contract that must not depend on the backend: the bound on
//! `k`, the configured similarity threshold, deterministic ordering
//! (descending score, ties by ascending id), bounded retries, and the
//! mapping to [`EngineError::RetrievalUnavailable`].
//!
//! ```text
//! query vector + filters
//!        |
//!        v
//! VectorRetriever --search--> dyn VectorIndex (qdrant | memory)
//!        |
//!        v
//! threshold -> metadata -> sort -> truncate(k) -> SearchOutcome::{Hits, Empty}
//! ```
//!
//! Hits carry the collection the backend searched, when it has collections.

pub mod memory;
pub mod qdrant;

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::MAX_TOP_K;
use crate::error::{BackendError, EngineError, Stage};
use crate::model::{PlanRequest, RetrievedFragment, SourceType};
use crate::retry::{self, RetryError, RetryPolicy};

pub use memory::{CorpusEntry, MemoryIndex};
pub use qdrant::{QdrantConfig, QdrantIndex, resolve_collection};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Restrictions applied to a search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Curriculum name; backends with one collection per curriculum use it
    /// to pick the collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curriculum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    /// Allowed source types; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_types: Vec<SourceType>,
}

impl SearchFilters {
    /// Filters matching a plan request's curriculum, subject and grade.
    pub fn for_request(request: &PlanRequest) -> Self {
        Self {
            curriculum: Some(request.curriculum.trim().to_string()),
            subject: Some(request.subject.trim().to_string()),
            grade: Some(request.grade.trim().to_string()),
            source_types: Vec::new(),
        }
    }

    /// Whether a source type passes the filter.
    pub fn allows(&self, source_type: SourceType) -> bool {
        self.source_types.is_empty() || self.source_types.contains(&source_type)
    }

    /// Whether a fragment passes the source type filter and, where the
    /// fragment carries a subject or grade, the subject and grade filters.
    /// Fragments without that metadata pass.
    pub fn matches(&self, fragment: &RetrievedFragment) -> bool {
        self.allows(fragment.source_type)
            && same_or_unknown(self.subject.as_deref(), fragment.metadata.subject.as_deref())
            && same_or_unknown(self.grade.as_deref(), fragment.metadata.grade.as_deref())
    }
}

fn same_or_unknown(wanted: Option<&str>, found: Option<&str>) -> bool {
    match (wanted.map(str::trim), found.map(str::trim)) {
        (Some(w), Some(f)) if !w.is_empty() && !f.is_empty() => w.eq_ignore_ascii_case(f),
        _ => true,
    }
}

/// A search as seen by a backend.
#[derive(Debug, Clone, Copy)]
pub struct IndexQuery<'a> {
    pub vector: &'a [f32],
    pub filters: &'a SearchFilters,
    pub limit: usize,
}

/// Candidates returned by a backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexResults {
    pub fragments: Vec<RetrievedFragment>,
    /// Collection the candidates came from; `None` for backends without
    /// collections.
    pub collection: Option<String>,
}

impl IndexResults {
    pub fn in_collection(fragments: Vec<RetrievedFragment>, collection: impl Into<String>) -> Self {
        Self {
            fragments,
            collection: Some(collection.into()),
        }
    }
}

impl From<Vec<RetrievedFragment>> for IndexResults {
    fn from(fragments: Vec<RetrievedFragment>) -> Self {
        Self {
            fragments,
            collection: None,
        }
    }
}

/// Result of a successful search.
///
/// `Empty` is a valid outcome, not an error: nothing in the index cleared
/// the similarity threshold.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Hits {
        fragments: Vec<RetrievedFragment>,
        collection: Option<String>,
    },
    Empty,
}

impl SearchOutcome {
    pub fn into_fragments(self) -> Vec<RetrievedFragment> {
        match self {
            Self::Hits { fragments, .. } => fragments,
            Self::Empty => Vec::new(),
        }
    }

    /// The collection the hits came from.
    pub fn collection(&self) -> Option<&str> {
        match self {
            Self::Hits { collection, .. } => collection.as_deref(),
            Self::Empty => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Adapter interface for vector similarity indexes.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Return up to `query.limit` candidates with raw similarity scores.
    /// Ordering and thresholding are applied by the caller.
    async fn search(&self, query: IndexQuery<'_>) -> Result<IndexResults, BackendError>;

    /// Names of the collections the backend can search.
    async fn list_collections(&self) -> Result<Vec<String>, BackendError> {
        Ok(Vec::new())
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn VectorIndex) {}
};

/// Order fragments by descending score, ties by ascending id.
pub fn rank_fragments(fragments: &mut [RetrievedFragment]) {
    fragments.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ---------------------------------------------------------------------------
// Retriever
// ---------------------------------------------------------------------------

/// Retrieval stage wrapping a [`VectorIndex`].
#[derive(Clone)]
pub struct VectorRetriever {
    index: Arc<dyn VectorIndex>,
    threshold: f32,
    retry: RetryPolicy,
}

impl std::fmt::Debug for VectorRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorRetriever")
            .field("index", &self.index.name())
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl VectorRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, threshold: f32, retry: RetryPolicy) -> Self {
        Self {
            index,
            threshold,
            retry,
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Search for the `k` most similar fragments (k clamped to `1..=50`).
    pub async fn search(
        &self,
        vector: &[f32],
        filters: &SearchFilters,
        k: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome, EngineError> {
        let limit = k.clamp(1, MAX_TOP_K);
        let query = IndexQuery {
            vector,
            filters,
            limit,
        };
        let index = &self.index;
        let result = retry::with_backoff(&self.retry, cancel, BackendError::is_transient, |attempt| {
            let index = Arc::clone(index);
            async move {
                let r = index.search(query).await;
                if let Err(e) = &r {
                    tracing::warn!(backend = index.name(), attempt, error = %e, "vector search failed");
                }
                r
            }
        })
        .await;

        let IndexResults {
            fragments: candidates,
            collection,
        } = match result {
            Ok(c) => c,
            Err(RetryError::Cancelled) => return Err(EngineError::cancelled(Stage::Retrieval)),
            Err(RetryError::Exhausted { attempts, last }) => {
                return Err(EngineError::RetrievalUnavailable {
                    attempts,
                    source: last,
                });
            }
            Err(RetryError::Fatal { attempts, error }) => {
                return Err(EngineError::RetrievalUnavailable {
                    attempts,
                    source: error,
                });
            }
        };

        let total = candidates.len();
        let mut hits: Vec<RetrievedFragment> = candidates
            .into_iter()
            .filter(|f| f.score >= self.threshold && filters.matches(f))
            .collect();
        rank_fragments(&mut hits);
        hits.truncate(limit);

        tracing::debug!(
            backend = self.index.name(),
            collection = collection.as_deref().unwrap_or("-"),
            candidates = total,
            kept = hits.len(),
            threshold = self.threshold,
            "vector search complete"
        );

        if hits.is_empty() {
            Ok(SearchOutcome::Empty)
        } else {
            Ok(SearchOutcome::Hits {
                fragments: hits,
                collection,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    use super::*;
    use crate::model::FragmentMetadata;

    fn frag(id: &str, score: f32) -> RetrievedFragment {
        RetrievedFragment::new(
            id,
            SourceType::CurriculumStandard,
            format!("text of {id}"),
            score,
            FragmentMetadata::default(),
        )
    }

    struct FixedIndex {
        hits: Vec<RetrievedFragment>,
        collection: Option<String>,
        fail_first: u32,
        calls: AtomicU32,
        last_limit: AtomicU32,
    }

    impl FixedIndex {
        fn new(hits: Vec<RetrievedFragment>, fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                hits,
                collection: None,
                fail_first,
                calls: AtomicU32::new(0),
                last_limit: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl VectorIndex for FixedIndex {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn search(
            &self,
            query: IndexQuery<'_>,
        ) -> Result<IndexResults, BackendError> {
            self.last_limit.store(query.limit as u32, AtomicOrdering::SeqCst);
            let n = self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(BackendError::Connection("refused".into()));
            }
            Ok(IndexResults {
                fragments: self.hits.clone(),
                collection: self.collection.clone(),
            })
        }
    }

    #[tokio::test]
    async fn orders_by_score_then_id() {
        let index = FixedIndex::new(vec![frag("b", 0.7), frag("c", 0.9), frag("a", 0.7)], 0);
        let retriever = VectorRetriever::new(index, 0.1, RetryPolicy::immediate(1));
        let hits = retriever
            .search(&[1.0], &SearchFilters::default(), 10, &CancellationToken::new())
            .await
            .unwrap()
            .into_fragments();
        let ids: Vec<&str> = hits.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn below_threshold_is_empty_not_error() {
        let index = FixedIndex::new(vec![frag("a", 0.2), frag("b", 0.1)], 0);
        let retriever = VectorRetriever::new(index, 0.5, RetryPolicy::immediate(1));
        let outcome = retriever
            .search(&[1.0], &SearchFilters::default(), 5, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn k_is_clamped_and_applied() {
        let hits: Vec<_> = (0..60).map(|i| frag(&format!("f{i:02}"), 0.9)).collect();
        let index = FixedIndex::new(hits, 0);
        let retriever = VectorRetriever::new(index.clone(), 0.0, RetryPolicy::immediate(1));
        let found = retriever
            .search(&[1.0], &SearchFilters::default(), 500, &CancellationToken::new())
            .await
            .unwrap()
            .into_fragments();
        assert_eq!(found.len(), MAX_TOP_K);
        assert_eq!(index.last_limit.load(AtomicOrdering::SeqCst), MAX_TOP_K as u32);
    }

    #[tokio::test]
    async fn source_type_filter_applies() {
        let mut criterion = frag("crit", 0.9);
        criterion.source_type = SourceType::AssessmentCriterion;
        let index = FixedIndex::new(vec![frag("std", 0.9), criterion], 0);
        let retriever = VectorRetriever::new(index, 0.0, RetryPolicy::immediate(1));
        let filters = SearchFilters {
            source_types: vec![SourceType::AssessmentCriterion],
            ..Default::default()
        };
        let found = retriever
            .search(&[1.0], &filters, 5, &CancellationToken::new())
            .await
            .unwrap()
            .into_fragments();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "crit");
    }

    fn tagged(id: &str, subject: Option<&str>, grade: Option<&str>) -> RetrievedFragment {
        let mut f = frag(id, 0.9);
        f.metadata.subject = subject.map(str::to_string);
        f.metadata.grade = grade.map(str::to_string);
        f
    }

    #[tokio::test]
    async fn subject_and_grade_filter_uses_metadata_when_present() {
        let index = FixedIndex::new(
            vec![
                tagged("math-5", Some("Math"), Some("5")),
                tagged("math-lower", Some(" math "), None),
                tagged("math-8", Some("Math"), Some("8")),
                tagged("science-5", Some("Science"), Some("5")),
                tagged("untagged", None, None),
            ],
            0,
        );
        let retriever = VectorRetriever::new(index, 0.0, RetryPolicy::immediate(1));
        let request = PlanRequest::new("National", "Math", "5", 3);
        let mut ids: Vec<String> = retriever
            .search(&[1.0], &SearchFilters::for_request(&request), 10, &CancellationToken::new())
            .await
            .unwrap()
            .into_fragments()
            .into_iter()
            .map(|f| f.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["math-5", "math-lower", "untagged"]);
    }

    #[tokio::test]
    async fn metadata_filter_can_empty_the_outcome() {
        let index = FixedIndex::new(vec![tagged("science-5", Some("Science"), Some("5"))], 0);
        let retriever = VectorRetriever::new(index, 0.0, RetryPolicy::immediate(1));
        let filters = SearchFilters {
            subject: Some("Math".into()),
            ..Default::default()
        };
        let outcome = retriever
            .search(&[1.0], &filters, 5, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.is_empty());
    }

    #[tokio::test]
    async fn hits_report_the_backend_collection() {
        let index = Arc::new(FixedIndex {
            hits: vec![frag("a", 0.9)],
            collection: Some("national_math".into()),
            fail_first: 0,
            calls: AtomicU32::new(0),
            last_limit: AtomicU32::new(0),
        });
        let retriever = VectorRetriever::new(index, 0.0, RetryPolicy::immediate(1));
        let outcome = retriever
            .search(&[1.0], &SearchFilters::default(), 5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.collection(), Some("national_math"));

        let index = FixedIndex::new(vec![frag("a", 0.9)], 0);
        let retriever = VectorRetriever::new(index, 0.0, RetryPolicy::immediate(1));
        let outcome = retriever
            .search(&[1.0], &SearchFilters::default(), 5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.collection(), None);
    }

    #[tokio::test]
    async fn unreachable_index_maps_to_retrieval_unavailable() {
        let index = FixedIndex::new(vec![], 100);
        let retriever = VectorRetriever::new(index.clone(), 0.0, RetryPolicy::immediate(3));
        let err = retriever
            .search(&[1.0], &SearchFilters::default(), 5, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RetrievalUnavailable { attempts: 3, .. }));
        assert_eq!(index.calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let index = FixedIndex::new(vec![frag("a", 0.9)], 1);
        let retriever = VectorRetriever::new(index, 0.0, RetryPolicy::immediate(3));
        let outcome = retriever
            .search(&[1.0], &SearchFilters::default(), 5, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.into_fragments().len(), 1);
    }
}
