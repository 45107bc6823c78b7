//! Plan generation engine: runs one request through the whole pipeline.
//!
//! ```text
//! Embedding ──► Retrieval ──► Assembly ──► Generation ──► Validation ──► Done
//!     │             │ Empty                    ▲               │
//!     │             └──► (ungrounded context)  └─ PlanInvalid ─┘ (rounds remain)
//!     └─ EmbeddingUnavailable ──► Generation (ungrounded, when enabled)
//! ```
//!
//! Stage failures that survive local retries are looked up in
//! [`policy::decide`]. Everything not degraded or regenerated is returned
//! to the caller unchanged.

pub mod policy;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::{AgentSettings, GenerationGate, LanguageModel, ModelCaller, PlanAgent, RawPlan};
use crate::config::EngineConfig;
use crate::context::{ContextAssembler, GenerationContext};
use crate::embedding::{Embedder, EmbeddingProvider};
use crate::error::{EngineError, Stage};
use crate::model::{CurriculumPlan, PlanRequest, RetrievedFragment, SourceSummary};
use crate::retrieval::{SearchFilters, SearchOutcome, VectorIndex, VectorRetriever};
use crate::validate::{PlanValidator, ValidatedPlan};

use policy::Action;

/// Where a request is in the pipeline.
#[derive(Debug)]
enum EngineState {
    Embedding,
    Retrieval { vector: Vec<f32> },
    Assembly {
        fragments: Vec<RetrievedFragment>,
        collection: Option<String>,
    },
    Generation {
        ctx: GenerationContext,
        collection: Option<String>,
        round: u32,
    },
    Validation {
        ctx: GenerationContext,
        collection: Option<String>,
        raw: RawPlan,
        round: u32,
    },
    Done(Box<CurriculumPlan>),
}

impl EngineState {
    fn stage(&self) -> Stage {
        match self {
            Self::Embedding => Stage::Embedding,
            Self::Retrieval { .. } => Stage::Retrieval,
            Self::Assembly { .. } => Stage::Assembly,
            Self::Generation { .. } => Stage::Generation,
            Self::Validation { .. } | Self::Done(_) => Stage::Validation,
        }
    }
}

/// Retrieval-augmented curriculum plan generator.
///
/// Holds only shared, read-only backends plus the generation gate, so one
/// engine serves any number of concurrent requests.
#[derive(Debug, Clone)]
pub struct PlanEngine {
    config: EngineConfig,
    embedder: EmbeddingProvider,
    retriever: VectorRetriever,
    assembler: ContextAssembler,
    agent: PlanAgent,
    validator: PlanValidator,
}

impl PlanEngine {
    /// Build an engine with its own generation gate sized from `config`.
    pub fn new(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let gate = GenerationGate::new(config.max_concurrent_generations, config.backpressure_wait());
        Self::with_gate(config, embedder, index, model, gate)
    }

    /// Build an engine whose model calls go through an existing gate, so
    /// the concurrency cap is shared with other users of the same model.
    pub fn with_gate(
        config: EngineConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        model: Arc<dyn LanguageModel>,
        gate: GenerationGate,
    ) -> Self {
        let caller = ModelCaller::new(model, gate, config.retry, config.step_timeout());
        let settings = AgentSettings {
            elaboration_concurrency: config.elaboration_concurrency,
            consistency_pass: config.consistency_pass,
            fragments_per_term: config.fragments_per_term,
        };
        Self {
            embedder: EmbeddingProvider::new(embedder, config.embed_max_chars, config.retry),
            retriever: VectorRetriever::new(index, config.similarity_threshold, config.retry),
            assembler: ContextAssembler::new(config.context_budget_chars),
            agent: PlanAgent::new(caller, settings),
            validator: PlanValidator::new(config.repair_match_threshold),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn retriever(&self) -> &VectorRetriever {
        &self.retriever
    }

    /// The guarded model caller, for other generation features that must
    /// share the engine's gate and retry policy.
    pub fn caller(&self) -> &ModelCaller {
        self.agent.caller()
    }

    /// Generate a validated plan for `request`.
    ///
    /// Every await point races `cancel`; a fired token yields
    /// [`EngineError::Cancelled`] tagged with the stage it interrupted.
    pub async fn generate_plan(
        &self,
        request: PlanRequest,
        cancel: &CancellationToken,
    ) -> Result<CurriculumPlan, EngineError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "generate_plan",
            %request_id,
            curriculum = %request.curriculum,
            subject = %request.subject,
            grade = %request.grade,
            terms = request.term_count,
        );
        self.run(request_id, request, cancel).instrument(span).await
    }

    async fn run(
        &self,
        request_id: Uuid,
        request: PlanRequest,
        cancel: &CancellationToken,
    ) -> Result<CurriculumPlan, EngineError> {
        request.validate(&self.config.term_range)?;
        let started = Instant::now();
        let mut state = EngineState::Embedding;
        loop {
            if let EngineState::Done(plan) = state {
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    grounded = plan.grounded,
                    repairs = plan.repair_notes.len(),
                    "plan generated"
                );
                return Ok(*plan);
            }
            let stage = state.stage();
            if cancel.is_cancelled() {
                tracing::info!(%stage, "request cancelled");
                return Err(EngineError::cancelled(stage));
            }
            tracing::info!(%stage, "entering stage");
            state = self.step(state, request_id, &request, cancel).await?;
        }
    }

    async fn step(
        &self,
        state: EngineState,
        request_id: Uuid,
        request: &PlanRequest,
        cancel: &CancellationToken,
    ) -> Result<EngineState, EngineError> {
        let next = match state {
            EngineState::Embedding => match self.embedder.embed(&request.query_text(), cancel).await {
                Ok(vector) => EngineState::Retrieval { vector },
                Err(e) => match policy::decide(Stage::Embedding, e.kind()) {
                    Action::Degrade if self.config.degrade_on_embedding_failure => {
                        tracing::warn!(error = %e, "embedding unavailable; generating ungrounded");
                        EngineState::Generation {
                            ctx: GenerationContext::ungrounded(request.clone(), self.assembler.budget()),
                            collection: None,
                            round: 1,
                        }
                    }
                    _ => return Err(e),
                },
            },
            EngineState::Retrieval { vector } => {
                let filters = SearchFilters::for_request(request);
                let outcome = self
                    .retriever
                    .search(&vector, &filters, self.config.effective_top_k(), cancel)
                    .await?;
                match outcome {
                    SearchOutcome::Hits { fragments, collection } => {
                        tracing::debug!(hits = fragments.len(), collection = ?collection, "fragments retrieved");
                        EngineState::Assembly { fragments, collection }
                    }
                    SearchOutcome::Empty => {
                        tracing::info!("no fragment cleared the similarity threshold; generating ungrounded");
                        EngineState::Generation {
                            ctx: GenerationContext::ungrounded(request.clone(), self.assembler.budget()),
                            collection: None,
                            round: 1,
                        }
                    }
                }
            }
            EngineState::Assembly { fragments, collection } => {
                let ctx = self.assembler.assemble(request, fragments);
                tracing::debug!(
                    fragments = ctx.fragments().len(),
                    size = ctx.size(),
                    budget = ctx.budget(),
                    skipped = ctx.skipped(),
                    "context assembled"
                );
                // A context with no fragment that fit is not grounded in any collection.
                let collection = collection.filter(|_| ctx.grounded());
                EngineState::Generation {
                    ctx,
                    collection,
                    round: 1,
                }
            }
            EngineState::Generation { ctx, collection, round } => {
                tracing::debug!(round, grounded = ctx.grounded(), "generation round");
                let raw = self.agent.generate(&ctx, cancel).await?;
                EngineState::Validation {
                    ctx,
                    collection,
                    raw,
                    round,
                }
            }
            EngineState::Validation {
                ctx,
                collection,
                raw,
                round,
            } => match self.validator.validate(&raw, request) {
                Ok(validated) => EngineState::Done(Box::new(build_plan(
                    request_id, request, &ctx, collection, raw, validated,
                ))),
                Err(e) => {
                    let rounds = self.config.max_generation_rounds.max(1);
                    match policy::decide(Stage::Validation, e.kind()) {
                        Action::Regenerate if round < rounds => {
                            tracing::warn!(round, max_rounds = rounds, error = %e, "plan invalid; regenerating");
                            EngineState::Generation {
                                ctx,
                                collection,
                                round: round + 1,
                            }
                        }
                        _ => {
                            tracing::warn!(round, error = %e, "plan invalid; giving up");
                            return Err(e);
                        }
                    }
                }
            },
            EngineState::Done(plan) => EngineState::Done(plan),
        };
        Ok(next)
    }
}

fn build_plan(
    request_id: Uuid,
    request: &PlanRequest,
    ctx: &GenerationContext,
    collection_used: Option<String>,
    raw: RawPlan,
    validated: ValidatedPlan,
) -> CurriculumPlan {
    let mut repair_notes = raw.notes;
    repair_notes.extend(validated.notes);
    CurriculumPlan {
        request_id,
        curriculum: request.curriculum.trim().to_string(),
        subject: request.subject.trim().to_string(),
        grade: request.grade.trim().to_string(),
        terms: validated.terms,
        grounded: ctx.grounded(),
        sources: ctx.fragments().iter().map(SourceSummary::from).collect(),
        collection_used,
        repair_notes,
        generated_at: Utc::now(),
    }
}
