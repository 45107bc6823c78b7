//! Engine configuration.
//!
//! Every option has a default so a config file only needs to name the
//! values it overrides. All settings are process-wide and fixed once the
//! engine is built; requests cannot override them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::TermRange;
use crate::retry::RetryPolicy;

/// Upper bound on the number of fragments a single search may return.
pub const MAX_TOP_K: usize = 50;

/// Tunables for the retrieval, assembly, generation and repair stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Allowed `term_count` values.
    pub term_range: TermRange,
    /// Fragments requested from the vector store (clamped to `1..=50`).
    pub top_k: usize,
    /// Minimum similarity for a fragment to count as relevant.
    pub similarity_threshold: f32,
    /// Character budget for the grounding fragments of a context.
    pub context_budget_chars: usize,
    /// Longer embedding input is head-truncated to this many characters.
    pub embed_max_chars: usize,
    /// Bounded retry policy for embedding, retrieval and model calls.
    pub retry: RetryPolicy,
    /// Per model call deadline, in seconds.
    pub step_timeout_secs: u64,
    /// Total generation rounds, including re-generation after an invalid plan.
    pub max_generation_rounds: u32,
    /// Global cap on in-flight model calls.
    pub max_concurrent_generations: usize,
    /// How long a call may wait for a free generation slot, in milliseconds.
    pub backpressure_wait_ms: u64,
    /// Concurrent per-term elaboration calls within one request.
    pub elaboration_concurrency: usize,
    /// Run the cross-term consistency pass for multi-term plans.
    pub consistency_pass: bool,
    /// Minimum token overlap for re-pointing a dangling criterion reference.
    pub repair_match_threshold: f32,
    /// Fragments attached to each term's elaboration prompt.
    pub fragments_per_term: usize,
    /// Continue ungrounded when the embedding backend stays unavailable.
    pub degrade_on_embedding_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            term_range: TermRange::default(),
            top_k: 8,
            similarity_threshold: 0.35,
            context_budget_chars: 6000,
            embed_max_chars: 2000,
            retry: RetryPolicy::default(),
            step_timeout_secs: 60,
            max_generation_rounds: 2,
            max_concurrent_generations: 4,
            backpressure_wait_ms: 2000,
            elaboration_concurrency: 4,
            consistency_pass: true,
            repair_match_threshold: 0.5,
            fragments_per_term: 4,
            degrade_on_embedding_failure: true,
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.max(1))
    }

    pub fn backpressure_wait(&self) -> Duration {
        Duration::from_millis(self.backpressure_wait_ms)
    }

    /// `top_k` clamped to the supported range.
    pub fn effective_top_k(&self) -> usize {
        self.top_k.clamp(1, MAX_TOP_K)
    }
}
