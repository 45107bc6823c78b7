//! Orchestrator decision table.
//!
//! Stage wrappers retry transient failures locally. Whatever reaches the
//! engine is looked up here to decide the next transition.

use crate::error::{ErrorKind, Stage};

/// What the engine does with a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Continue without grounding material.
    Degrade,
    /// Discard the draft and run generation again, if rounds remain.
    Regenerate,
    /// Surface the error to the caller.
    Fail,
}

/// Look up the action for an error `kind` raised at `stage`.
///
/// `Degrade` is only honoured when the engine is configured to fall back;
/// `Regenerate` only while generation rounds remain. Both become `Fail`
/// otherwise.
pub fn decide(stage: Stage, kind: ErrorKind) -> Action {
    match (stage, kind) {
        (Stage::Embedding, ErrorKind::EmbeddingUnavailable) => Action::Degrade,
        (Stage::Validation, ErrorKind::PlanInvalid) => Action::Regenerate,
        _ => Action::Fail,
    }
}
