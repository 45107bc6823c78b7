//! Context assembly: turns retrieved fragments into a bounded, ranked
//! grounding context for the generation agent.
//!
//! Steps, in order:
//!
//! 1. de-duplicate by fragment id, keeping the highest-scoring copy;
//! 2. rank by descending score, ties by ascending id;
//! 3. greedily include whole fragments while the running size stays within
//!    the budget. A fragment that does not fit is skipped, and smaller ones
//!    after it are still considered.
//!
//! The size of a fragment is the character count of its rendered block
//! ([`RetrievedFragment::render`]) plus the separator that follows it, so
//! the rendered grounding text is exactly `size` characters. Fragments are
//! never cut.

use std::collections::HashMap;

use serde::Serialize;

use crate::model::{PlanRequest, RetrievedFragment};
use crate::retrieval::rank_fragments;
use crate::text;

/// Blank line between rendered blocks.
const BLOCK_SEPARATOR: char = '\n';

/// Character count of a fragment's rendered block and its separator.
pub fn fragment_size(fragment: &RetrievedFragment) -> usize {
    fragment.render().chars().count() + 1
}

/// Grounding material for one plan request.
///
/// Invariants: `size <= budget`, fragment ids are unique, fragments are in
/// rank order.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationContext {
    request: PlanRequest,
    fragments: Vec<RetrievedFragment>,
    budget: usize,
    size: usize,
    /// Fragments left out because they did not fit.
    skipped: usize,
}

impl GenerationContext {
    /// A context with no grounding material.
    pub fn ungrounded(request: PlanRequest, budget: usize) -> Self {
        Self {
            request,
            fragments: Vec::new(),
            budget,
            size: 0,
            skipped: 0,
        }
    }

    pub fn request(&self) -> &PlanRequest {
        &self.request
    }

    pub fn fragments(&self) -> &[RetrievedFragment] {
        &self.fragments
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// False when no fragment was included (degraded mode).
    pub fn grounded(&self) -> bool {
        !self.fragments.is_empty()
    }

    /// The grounding text handed to the model.
    pub fn render(&self) -> String {
        render_blocks(self.fragments.iter())
    }

    /// Up to `limit` fragments most relevant to `theme`, by token overlap
    /// with the theme. Falls back to the top-ranked fragments when nothing
    /// overlaps. Result keeps rank order for equal overlap.
    pub fn relevant_to(&self, theme: &str, limit: usize) -> Vec<&RetrievedFragment> {
        let mut scored: Vec<(f32, usize, &RetrievedFragment)> = self
            .fragments
            .iter()
            .enumerate()
            .map(|(rank, f)| (text::token_coverage(theme, &f.text), rank, f))
            .filter(|(overlap, _, _)| *overlap > 0.0)
            .collect();
        if scored.is_empty() {
            return self.fragments.iter().take(limit).collect();
        }
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        scored.into_iter().take(limit).map(|(_, _, f)| f).collect()
    }
}

/// Render fragment blocks, or a note that no reference material is
/// available.
pub fn render_blocks<'a>(fragments: impl Iterator<Item = &'a RetrievedFragment>) -> String {
    let mut out = String::new();
    for f in fragments {
        out.push_str(&f.render());
        out.push(BLOCK_SEPARATOR);
    }
    if out.is_empty() {
        out.push_str(
            "(no reference material available; rely on general knowledge of the curriculum)\n",
        );
    }
    out
}

/// Builds [`GenerationContext`]s under a fixed character budget.
#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    budget: usize,
}

impl ContextAssembler {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn assemble(
        &self,
        request: &PlanRequest,
        fragments: Vec<RetrievedFragment>,
    ) -> GenerationContext {
        let received = fragments.len();

        let mut best: HashMap<String, RetrievedFragment> = HashMap::with_capacity(received);
        for f in fragments {
            match best.get(&f.id) {
                Some(existing) if existing.score >= f.score => {}
                _ => {
                    best.insert(f.id.clone(), f);
                }
            }
        }
        let mut ranked: Vec<RetrievedFragment> = best.into_values().collect();
        rank_fragments(&mut ranked);
        let unique = ranked.len();

        let mut included = Vec::new();
        let mut size = 0usize;
        let mut skipped = 0usize;
        for f in ranked {
            let cost = fragment_size(&f);
            if size + cost <= self.budget {
                size += cost;
                included.push(f);
            } else {
                skipped += 1;
            }
        }

        tracing::debug!(
            received,
            unique,
            included = included.len(),
            skipped,
            size,
            budget = self.budget,
            "context assembled"
        );

        GenerationContext {
            request: request.clone(),
            fragments: included,
            budget: self.budget,
            size,
            skipped,
        }
    }
}
