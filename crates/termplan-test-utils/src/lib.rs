//! Shared test utilities for termplan integration tests.
//!
//! Deterministic stand-ins for the three backends:
//!
//! - **Models**: [`StubModel`] answers every generation step with a valid
//!   payload derived from the prompt header; [`ScriptedModel`] replays a
//!   fixed list of replies; [`FnModel`] wraps a closure for one-off
//!   behaviour (refusals, malformed output).
//! - **Indexes**: [`StaticIndex`] returns a fixed fragment list;
//!   [`FailingIndex`] always errors.
//! - **Embedders**: [`FixedEmbedder`] and [`FailingEmbedder`].
//!
//! Every stub counts its calls so tests can assert on side effects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use termplan_core::agent::prompt::{draft_json, header_value};
use termplan_core::agent::{CompletionRequest, LanguageModel, ModelError};
use termplan_core::config::EngineConfig;
use termplan_core::embedding::Embedder;
use termplan_core::engine::PlanEngine;
use termplan_core::error::BackendError;
use termplan_core::model::{FragmentMetadata, GenerationStep, PlanRequest, RetrievedFragment, SourceType};
use termplan_core::retrieval::{IndexQuery, IndexResults, VectorIndex};
use termplan_core::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// The canonical healthy-path request.
pub fn math_request() -> PlanRequest {
    PlanRequest::new("National", "Math", "5", 3)
}

/// Engine config with no backoff sleeps and short waits.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::immediate(2),
        step_timeout_secs: 5,
        backpressure_wait_ms: 200,
        ..EngineConfig::default()
    }
}

fn fragment(id: &str, source_type: SourceType, text: &str, score: f32) -> RetrievedFragment {
    RetrievedFragment::new(
        id,
        source_type,
        text,
        score,
        FragmentMetadata {
            subject: Some("Math".to_string()),
            grade: Some("5".to_string()),
            tags: Vec::new(),
        },
    )
}

/// A small grade 5 math corpus with one fragment of each source type.
pub fn fixture_fragments() -> Vec<RetrievedFragment> {
    vec![
        fragment(
            "std-math-5-nf-1",
            SourceType::CurriculumStandard,
            "Add and subtract fractions with unlike denominators by replacing given fractions \
             with equivalent fractions.",
            0.91,
        ),
        fragment(
            "std-math-5-md-3",
            SourceType::CurriculumStandard,
            "Recognize volume as an attribute of solid figures and understand concepts of \
             volume measurement.",
            0.84,
        ),
        fragment(
            "proj-fraction-recipes",
            SourceType::ProjectTemplate,
            "Fraction Recipes: students scale a recipe up and down, adding and subtracting \
             fractional quantities.",
            0.77,
        ),
        fragment(
            "crit-math-reasoning",
            SourceType::AssessmentCriterion,
            "Mathematical reasoning: explains the strategy used and justifies each step.",
            0.72,
        ),
        fragment(
            "std-math-5-low",
            SourceType::CurriculumStandard,
            "Loosely related standard that should fall below the similarity threshold.",
            0.10,
        ),
    ]
}

/// Build an engine over the given backends with [`test_config`].
pub fn engine_with(model: Arc<dyn LanguageModel>, index: Arc<dyn VectorIndex>) -> PlanEngine {
    engine_with_config(test_config(), model, index)
}

pub fn engine_with_config(
    config: EngineConfig,
    model: Arc<dyn LanguageModel>,
    index: Arc<dyn VectorIndex>,
) -> PlanEngine {
    PlanEngine::new(config, Arc::new(FixedEmbedder::default()), index, model)
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Deterministic model that answers each step from the prompt header.
///
/// - outline: `Terms: N` themes named "`Subject` unit k"
/// - elaborate: two projects and two criteria for `Term: K`
/// - consistency: the embedded draft, unchanged
/// - lesson: as many lessons as the prompt asks for
#[derive(Debug, Default)]
pub struct StubModel {
    calls: AtomicU32,
    steps: Mutex<Vec<GenerationStep>>,
    latency: Option<Duration>,
    reverse_elaboration: bool,
}

impl StubModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make later terms finish elaboration first.
    pub fn reverse_elaboration(mut self) -> Self {
        self.reverse_elaboration = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Steps answered so far, in call order.
    pub fn steps(&self) -> Vec<GenerationStep> {
        self.steps.lock().unwrap().clone()
    }

    /// The reply for `request`, without counting it as a call.
    pub fn answer(request: &CompletionRequest) -> Result<String, ModelError> {
        let prompt = request.user_prompt();
        let value = match request.step {
            GenerationStep::Outline => {
                let subject = header_value(prompt, "Subject").unwrap_or("Subject");
                let n: u32 = header_value(prompt, "Terms").and_then(|v| v.parse().ok()).unwrap_or(1);
                let terms: Vec<Value> = (1..=n)
                    .map(|k| json!({ "term": k, "theme": format!("{subject} unit {k}") }))
                    .collect();
                json!({ "terms": terms })
            }
            GenerationStep::Elaborate(k) => {
                let theme = header_value(prompt, "Theme").unwrap_or("Theme");
                stub_term(k, theme)
            }
            GenerationStep::Consistency => {
                let draft = draft_json(prompt)
                    .ok_or_else(|| ModelError::Unavailable("consistency prompt has no draft".into()))?;
                return Ok(draft.to_string());
            }
            GenerationStep::Lesson => {
                let n = prompt
                    .split("Create ")
                    .skip(1)
                    .find_map(|rest| rest.split_whitespace().next()?.parse::<u32>().ok())
                    .unwrap_or(1);
                let lessons: Vec<Value> = (1..=n)
                    .map(|i| {
                        json!({
                            "title": format!("Lesson {i}: practice"),
                            "objectives": ["Explain the idea", "Apply it"],
                            "activities": ["Warm-up", "Group task"],
                            "resources": ["Worksheet"],
                            "homework": "Finish the worksheet",
                        })
                    })
                    .collect();
                json!({ "lesson_plans": lessons })
            }
        };
        Ok(value.to_string())
    }
}

/// A valid elaborated term.
pub fn stub_term(k: u32, theme: &str) -> Value {
    json!({
        "term_number": k,
        "theme": theme,
        "projects": [
            {
                "id": format!("t{k}-p1"),
                "name": format!("{theme} investigation"),
                "description": format!("Students investigate {theme}."),
                "objectives": ["Model the problem", "Explain the solution"],
                "criteria": [format!("t{k}-c1"), format!("t{k}-c2")],
            },
            {
                "id": format!("t{k}-p2"),
                "name": format!("{theme} showcase"),
                "description": format!("Students present their work on {theme}."),
                "objectives": ["Communicate findings"],
                "criteria": [format!("t{k}-c2")],
            }
        ],
        "assessment_criteria": [
            {
                "id": format!("t{k}-c1"),
                "description": "Mathematical reasoning",
                "rubric_levels": ["Beginning", "Developing", "Proficient", "Extending"],
            },
            {
                "id": format!("t{k}-c2"),
                "description": "Communication of results",
                "rubric_levels": ["Beginning", "Developing", "Proficient", "Extending"],
            }
        ]
    })
}

#[async_trait]
impl LanguageModel for StubModel {
    fn name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.steps.lock().unwrap().push(request.step);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.reverse_elaboration {
            if let GenerationStep::Elaborate(k) = request.step {
                let n: u64 = header_value(request.user_prompt(), "Terms")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1);
                tokio::time::sleep(Duration::from_millis((n + 1 - u64::from(k)) * 20)).await;
            }
        }
        Self::answer(request)
    }
}

/// Replays a fixed list of replies, then reports the model unavailable.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModelError>>>,
    calls: AtomicU32,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Unavailable("script exhausted".into())))
    }
}

type Reply = dyn Fn(&CompletionRequest) -> Result<String, ModelError> + Send + Sync;

/// A model backed by a closure.
pub struct FnModel {
    reply: Box<Reply>,
    calls: AtomicU32,
}

impl FnModel {
    pub fn new(reply: impl Fn(&CompletionRequest) -> Result<String, ModelError> + Send + Sync + 'static) -> Self {
        Self {
            reply: Box::new(reply),
            calls: AtomicU32::new(0),
        }
    }

    /// Refuses every request.
    pub fn refusing() -> Self {
        Self::new(|_| Err(ModelError::Refused("content policy".into())))
    }

    /// Answers every request with text that is not JSON.
    pub fn malformed() -> Self {
        Self::new(|_| Ok("Sure! Here is your plan: term one is about fractions.".into()))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for FnModel {
    fn name(&self) -> &str {
        "fn"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.reply)(request)
    }
}

// ---------------------------------------------------------------------------
// Indexes
// ---------------------------------------------------------------------------

/// Returns a fixed set of fragments for every query.
#[derive(Debug, Default)]
pub struct StaticIndex {
    fragments: Vec<RetrievedFragment>,
    collection: Option<String>,
    calls: AtomicU32,
}

impl StaticIndex {
    pub fn new(fragments: Vec<RetrievedFragment>) -> Self {
        Self {
            fragments,
            collection: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Report every search as coming from `collection`.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// An index with nothing in it.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for StaticIndex {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, query: IndexQuery<'_>) -> Result<IndexResults, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(IndexResults {
            fragments: self
                .fragments
                .iter()
                .filter(|f| query.filters.allows(f.source_type))
                .take(query.limit)
                .cloned()
                .collect(),
            collection: self.collection.clone(),
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>, BackendError> {
        let name = self.collection.as_deref().unwrap_or("static");
        Ok(vec![name.to_string()])
    }
}

/// Fails every search with the same error.
#[derive(Debug)]
pub struct FailingIndex {
    error: BackendError,
    calls: AtomicU32,
}

impl FailingIndex {
    pub fn new(error: BackendError) -> Self {
        Self {
            error,
            calls: AtomicU32::new(0),
        }
    }

    /// Connection refused, as from a store that is down.
    pub fn unreachable() -> Self {
        Self::new(BackendError::Connection("connection refused".into()))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for FailingIndex {
    fn name(&self) -> &str {
        "failing"
    }

    async fn search(&self, _query: IndexQuery<'_>) -> Result<IndexResults, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }

    async fn list_collections(&self) -> Result<Vec<String>, BackendError> {
        Err(self.error.clone())
    }
}

// ---------------------------------------------------------------------------
// Embedders
// ---------------------------------------------------------------------------

/// Returns the same unit vector for every input.
#[derive(Debug)]
pub struct FixedEmbedder {
    dimension: usize,
}

impl FixedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for FixedEmbedder {
    fn default() -> Self {
        Self::new(8)
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    fn name(&self) -> &str {
        "fixed"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, BackendError> {
        let v = 1.0 / (self.dimension as f32).sqrt();
        Ok(vec![v; self.dimension])
    }
}

/// Fails every call with the same error.
#[derive(Debug)]
pub struct FailingEmbedder {
    error: BackendError,
    calls: AtomicU32,
}

impl FailingEmbedder {
    pub fn new(error: BackendError) -> Self {
        Self {
            error,
            calls: AtomicU32::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self::new(BackendError::Status {
            status: 503,
            message: "service unavailable".into(),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FailingEmbedder {
    fn name(&self) -> &str {
        "failing"
    }

    fn dimension(&self) -> usize {
        8
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}
