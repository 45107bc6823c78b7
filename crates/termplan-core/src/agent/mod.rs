//! Plan generation agent.
//!
//! Drives the multi-step generation protocol over a [`LanguageModel`]:
//!
//! ```text
//! Outline ──► Elaborate (one task per term, JoinSet) ──► Consistency ──► Done
//!                                         │                    ▲
//!                                         └── term_count == 1 ─┘ (skipped)
//! ```
//!
//! Each step's output is checked for usability before the next step runs
//! (see [`parse`]); the final draft is handed to the validator as a
//! [`RawPlan`]. Elaboration tasks share nothing mutable: each returns its
//! own term, and the join barrier reassembles them by term number.

pub mod call;
pub mod gate;
pub mod model;
pub mod openai;
pub mod parse;
pub mod prompt;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::context::GenerationContext;
use crate::error::{EngineError, Stage};
use crate::model::{GenerationAttempt, GenerationStep, RepairNote, RetrievedFragment};

pub use call::ModelCaller;
pub use gate::GenerationGate;
pub use model::{ChatMessage, CompletionRequest, LanguageModel, ModelError, Role};
pub use openai::{OpenAiChatConfig, OpenAiChatModel};
pub use parse::{Outline, OutlineTerm};

/// The agent's final output, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPlan {
    /// Plan JSON text as produced (or assembled) by the agent.
    pub text: String,
    /// The model call whose output the text is based on.
    pub attempt: GenerationAttempt,
    /// Things the agent had to work around, e.g. a skipped consistency pass.
    pub notes: Vec<RepairNote>,
}

impl RawPlan {
    pub fn new(text: impl Into<String>, attempt: GenerationAttempt) -> Self {
        Self {
            text: text.into(),
            attempt,
            notes: Vec::new(),
        }
    }
}

/// Agent tunables, taken from the engine config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentSettings {
    /// Concurrent elaboration calls within one request.
    pub elaboration_concurrency: usize,
    pub consistency_pass: bool,
    pub fragments_per_term: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            elaboration_concurrency: 4,
            consistency_pass: true,
            fragments_per_term: 4,
        }
    }
}

/// Where the agent is in the protocol.
#[derive(Debug)]
enum GenerationState {
    Outline,
    Elaborate {
        outline: Outline,
    },
    Consistency {
        draft: Value,
        attempt: GenerationAttempt,
    },
    Done(RawPlan),
}

impl GenerationState {
    fn name(&self) -> &'static str {
        match self {
            Self::Outline => "outline",
            Self::Elaborate { .. } => "elaborate",
            Self::Consistency { .. } => "consistency",
            Self::Done(_) => "done",
        }
    }
}

/// Multi-step plan generator.
#[derive(Debug, Clone)]
pub struct PlanAgent {
    caller: ModelCaller,
    settings: AgentSettings,
}

impl PlanAgent {
    pub fn new(caller: ModelCaller, settings: AgentSettings) -> Self {
        Self { caller, settings }
    }

    pub fn caller(&self) -> &ModelCaller {
        &self.caller
    }

    /// Run outline, elaboration and (when enabled) consistency for `ctx`.
    pub async fn generate(
        &self,
        ctx: &GenerationContext,
        cancel: &CancellationToken,
    ) -> Result<RawPlan, EngineError> {
        let term_count = ctx.request().term_count;
        let mut notes = Vec::new();
        let mut state = GenerationState::Outline;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::cancelled(Stage::Generation));
            }
            tracing::debug!(state = state.name(), "agent step");
            state = match state {
                GenerationState::Outline => {
                    let request = prompt::outline_request(ctx);
                    let (outline, _) = self
                        .caller
                        .run_step(&request, cancel, |text| parse::parse_outline(text, term_count))
                        .await?;
                    GenerationState::Elaborate { outline }
                }
                GenerationState::Elaborate { outline } => {
                    let (terms, attempt) = self.elaborate(ctx, &outline, cancel).await?;
                    let draft = json!({ "terms": terms });
                    if self.settings.consistency_pass && term_count > 1 {
                        GenerationState::Consistency { draft, attempt }
                    } else {
                        GenerationState::Done(RawPlan::new(draft.to_string(), attempt))
                    }
                }
                GenerationState::Consistency { draft, attempt } => {
                    self.consistency(ctx, draft, attempt, &mut notes, cancel).await?
                }
                GenerationState::Done(mut raw) => {
                    raw.notes.append(&mut notes);
                    return Ok(raw);
                }
            };
        }
    }

    /// Fan out one elaboration call per term and join them in term order.
    async fn elaborate(
        &self,
        ctx: &GenerationContext,
        outline: &Outline,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Value>, GenerationAttempt), EngineError> {
        let fan_out = cancel.child_token();
        let limit = Arc::new(Semaphore::new(self.settings.elaboration_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for term in &outline.terms {
            let fragments: Vec<&RetrievedFragment> =
                ctx.relevant_to(&term.theme, self.settings.fragments_per_term);
            let request = prompt::elaborate_request(ctx, outline, term, &fragments);
            let caller = self.caller.clone();
            let token = fan_out.child_token();
            let limit = Arc::clone(&limit);
            let term = term.clone();
            tasks.spawn(async move {
                let _slot = tokio::select! {
                    _ = token.cancelled() => return (term.term, Err(EngineError::cancelled(Stage::Generation))),
                    slot = limit.acquire_owned() => slot,
                };
                let result = caller
                    .run_step(&request, &token, |text| parse::parse_term(text, &term))
                    .await;
                (term.term, result)
            });
        }

        let mut done: BTreeMap<u32, (Value, GenerationAttempt)> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (number, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    fan_out.cancel();
                    tasks.abort_all();
                    return Err(EngineError::GenerationFailed {
                        step: GenerationStep::Elaborate(0),
                        attempts: 1,
                        reason: format!("elaboration task failed: {e}"),
                        last_attempt: None,
                    });
                }
            };
            match result {
                Ok(term) => {
                    tracing::debug!(term = number, "term elaborated");
                    done.insert(number, term);
                }
                Err(e) => {
                    // First failure wins; siblings are cancelled.
                    fan_out.cancel();
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        let mut last_attempt = None;
        let mut terms = Vec::with_capacity(done.len());
        for (_, (value, attempt)) in done {
            terms.push(value);
            last_attempt = Some(attempt);
        }
        let attempt = last_attempt.ok_or_else(|| EngineError::GenerationFailed {
            step: GenerationStep::Elaborate(0),
            attempts: 0,
            reason: "outline produced no terms".to_string(),
            last_attempt: None,
        })?;
        Ok((terms, attempt))
    }

    /// Cross-term consistency pass. Unusable output, or a pass that runs
    /// out of attempts, keeps the elaborated draft and records a note.
    async fn consistency(
        &self,
        ctx: &GenerationContext,
        draft: Value,
        attempt: GenerationAttempt,
        notes: &mut Vec<RepairNote>,
        cancel: &CancellationToken,
    ) -> Result<GenerationState, EngineError> {
        let term_count = ctx.request().term_count;
        let draft_text = draft.to_string();
        let request = prompt::consistency_request(ctx, &draft_text);
        match self
            .caller
            .run_step(&request, cancel, |text| parse::parse_plan(text, term_count))
            .await
        {
            Ok((revised, attempt)) => Ok(GenerationState::Done(RawPlan::new(revised.to_string(), attempt))),
            Err(e @ (EngineError::GenerationFailed { .. } | EngineError::GenerationTimeout { .. })) => {
                tracing::warn!(error = %e, "consistency pass failed; keeping elaborated draft");
                notes.push(RepairNote::plan(
                    "consistency pass produced no usable output; elaborated draft kept",
                ));
                Ok(GenerationState::Done(RawPlan::new(draft_text, attempt)))
            }
            Err(e) => Err(e),
        }
    }
}
