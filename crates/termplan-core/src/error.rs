//! Error taxonomy for the plan generation pipeline.
//!
//! Backend adapters report [`BackendError`]; the stage wrappers turn those
//! into [`EngineError`] once local retries are exhausted. Every engine error
//! carries a stable [`ErrorKind`] code, the [`Stage`] that failed, and a
//! summary that is safe to show to an end user.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::model::{GenerationAttempt, GenerationStep, RequestError};

// ---------------------------------------------------------------------------
// Backend errors
// ---------------------------------------------------------------------------

/// Failure reported by an embedding or vector-store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend request timed out")]
    Timeout,

    #[error("backend unreachable: {0}")]
    Connection(String),

    #[error("backend returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("backend response could not be decoded: {0}")]
    Decode(String),

    #[error("backend misconfigured: {0}")]
    Configuration(String),
}

impl BackendError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connection(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::Configuration(_) => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() || err.is_request() {
            Self::Connection(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::Connection(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Stages and kinds
// ---------------------------------------------------------------------------

/// Pipeline stage, used for diagnostics and the engine decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Request,
    Embedding,
    Retrieval,
    Assembly,
    Generation,
    Validation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Embedding => "embedding",
            Self::Retrieval => "retrieval",
            Self::Assembly => "assembly",
            Self::Generation => "generation",
            Self::Validation => "validation",
        };
        f.write_str(s)
    }
}

/// Stable, payload-free classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    EmbeddingUnavailable,
    RetrievalUnavailable,
    GenerationTimeout,
    GenerationRefused,
    GenerationFailed,
    PlanInvalid,
    Backpressure,
    Cancelled,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::EmbeddingUnavailable => "embedding_unavailable",
            Self::RetrievalUnavailable => "retrieval_unavailable",
            Self::GenerationTimeout => "generation_timeout",
            Self::GenerationRefused => "generation_refused",
            Self::GenerationFailed => "generation_failed",
            Self::PlanInvalid => "plan_invalid",
            Self::Backpressure => "backpressure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// Engine error
// ---------------------------------------------------------------------------

/// Terminal failure of a pipeline stage or of the whole engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("invalid plan request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("embedding backend unavailable after {attempts} attempt(s): {source}")]
    EmbeddingUnavailable { attempts: u32, source: BackendError },

    #[error("vector store unavailable after {attempts} attempt(s): {source}")]
    RetrievalUnavailable { attempts: u32, source: BackendError },

    #[error("model timed out during {step} after {attempts} attempt(s)")]
    GenerationTimeout {
        step: GenerationStep,
        attempts: u32,
        last_attempt: Option<Box<GenerationAttempt>>,
    },

    #[error("model refused during {step}: {reason}")]
    GenerationRefused {
        step: GenerationStep,
        reason: String,
        last_attempt: Option<Box<GenerationAttempt>>,
    },

    #[error("generation failed during {step} after {attempts} attempt(s): {reason}")]
    GenerationFailed {
        step: GenerationStep,
        attempts: u32,
        reason: String,
        last_attempt: Option<Box<GenerationAttempt>>,
    },

    #[error("model output is not a valid plan: {reason}")]
    PlanInvalid {
        reason: String,
        last_attempt: Option<Box<GenerationAttempt>>,
    },

    #[error("generation capacity exhausted ({capacity} concurrent calls, waited {waited:?})")]
    Backpressure { capacity: usize, waited: Duration },

    #[error("request cancelled during {stage}")]
    Cancelled { stage: Stage },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::EmbeddingUnavailable { .. } => ErrorKind::EmbeddingUnavailable,
            Self::RetrievalUnavailable { .. } => ErrorKind::RetrievalUnavailable,
            Self::GenerationTimeout { .. } => ErrorKind::GenerationTimeout,
            Self::GenerationRefused { .. } => ErrorKind::GenerationRefused,
            Self::GenerationFailed { .. } => ErrorKind::GenerationFailed,
            Self::PlanInvalid { .. } => ErrorKind::PlanInvalid,
            Self::Backpressure { .. } => ErrorKind::Backpressure,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// The stage the error surfaced from.
    pub fn stage(&self) -> Stage {
        match self {
            Self::InvalidRequest(_) => Stage::Request,
            Self::EmbeddingUnavailable { .. } => Stage::Embedding,
            Self::RetrievalUnavailable { .. } => Stage::Retrieval,
            Self::GenerationTimeout { .. }
            | Self::GenerationRefused { .. }
            | Self::GenerationFailed { .. }
            | Self::Backpressure { .. } => Stage::Generation,
            Self::PlanInvalid { .. } => Stage::Validation,
            Self::Cancelled { stage } => *stage,
        }
    }

    /// The last model call made before the failure, if any.
    pub fn last_attempt(&self) -> Option<&GenerationAttempt> {
        match self {
            Self::GenerationTimeout { last_attempt, .. }
            | Self::GenerationRefused { last_attempt, .. }
            | Self::GenerationFailed { last_attempt, .. }
            | Self::PlanInvalid { last_attempt, .. } => last_attempt.as_deref(),
            _ => None,
        }
    }

    /// Whether the error should be retried where it was raised. Only
    /// transient backend conditions qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::EmbeddingUnavailable { source, .. } | Self::RetrievalUnavailable { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// Human-readable summary safe to return to an end user: no prompts,
    /// no raw model output, no backend credentials.
    pub fn summary(&self) -> String {
        match self {
            Self::InvalidRequest(e) => format!("The plan request is invalid: {e}."),
            Self::EmbeddingUnavailable { .. } => {
                "The embedding service is unavailable. Please try again later.".to_string()
            }
            Self::RetrievalUnavailable { .. } => {
                "The curriculum reference store is unavailable. Please try again later."
                    .to_string()
            }
            Self::GenerationTimeout { step, .. } => {
                format!("The language model did not respond in time ({step}).")
            }
            Self::GenerationRefused { step, .. } => {
                format!("The language model declined to produce the plan ({step}).")
            }
            Self::GenerationFailed { step, .. } => {
                format!("Plan generation failed ({step}). Please try again.")
            }
            Self::PlanInvalid { .. } => {
                "The generated plan did not pass validation. Please try again.".to_string()
            }
            Self::Backpressure { .. } => {
                "The service is at capacity. Please retry shortly.".to_string()
            }
            Self::Cancelled { .. } => "The request was cancelled.".to_string(),
        }
    }

    pub(crate) fn cancelled(stage: Stage) -> Self {
        Self::Cancelled { stage }
    }

    pub(crate) fn plan_invalid(reason: impl Into<String>) -> Self {
        Self::PlanInvalid {
            reason: reason.into(),
            last_attempt: None,
        }
    }

    /// Attach the model call that produced the rejected output.
    pub(crate) fn with_attempt(self, attempt: GenerationAttempt) -> Self {
        match self {
            Self::PlanInvalid { reason, .. } => Self::PlanInvalid {
                reason,
                last_attempt: Some(Box::new(attempt)),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_are_snake_case() {
        let err = EngineError::RetrievalUnavailable {
            attempts: 3,
            source: BackendError::Timeout,
        };
        assert_eq!(err.kind().code(), "retrieval_unavailable");
        assert_eq!(err.stage(), Stage::Retrieval);
    }

    #[test]
    fn summary_hides_backend_detail() {
        let err = EngineError::EmbeddingUnavailable {
            attempts: 3,
            source: BackendError::Status {
                status: 401,
                message: "invalid api key sk-secret".to_string(),
            },
        };
        assert!(!err.summary().contains("sk-secret"));
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn transient_backend_errors() {
        assert!(BackendError::Timeout.is_transient());
        assert!(BackendError::Connection("refused".into()).is_transient());
        assert!(
            BackendError::Status {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !BackendError::Status {
                status: 404,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!BackendError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn plan_invalid_carries_attempt() {
        let attempt = GenerationAttempt::new(GenerationStep::Consistency, 1, "prompt");
        let err = EngineError::plan_invalid("wrong term count").with_attempt(attempt);
        assert_eq!(err.kind(), ErrorKind::PlanInvalid);
        assert_eq!(err.stage(), Stage::Validation);
        assert!(err.last_attempt().is_some());
    }

    #[test]
    fn cancelled_reports_its_stage() {
        let err = EngineError::cancelled(Stage::Embedding);
        assert_eq!(err.stage(), Stage::Embedding);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
