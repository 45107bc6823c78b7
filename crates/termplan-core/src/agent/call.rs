//! Guarded model calls: permit, deadline, retries, and per-step output
//! checks.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::gate::GenerationGate;
use super::model::{CompletionRequest, LanguageModel, ModelError};
use crate::error::{EngineError, Stage};
use crate::model::{AttemptOutcome, GenerationAttempt, GenerationStep};
use crate::retry::{self, RetryError, RetryPolicy};

/// Failure of a single guarded call, before mapping to [`EngineError`].
enum CallError {
    Model(ModelError),
    /// Backpressure or cancellation; never retried.
    Engine(EngineError),
}

impl CallError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Model(e) if e.is_transient())
    }
}

/// Runs model calls through the generation gate with a per-call deadline
/// and bounded retries. Cheap to clone; clones share the gate.
#[derive(Clone)]
pub struct ModelCaller {
    model: Arc<dyn LanguageModel>,
    gate: GenerationGate,
    retry: RetryPolicy,
    step_timeout: Duration,
}

impl std::fmt::Debug for ModelCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCaller")
            .field("model", &self.model.name())
            .field("gate", &self.gate)
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

impl ModelCaller {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        gate: GenerationGate,
        retry: RetryPolicy,
        step_timeout: Duration,
    ) -> Self {
        Self {
            model,
            gate,
            retry,
            step_timeout,
        }
    }

    pub fn gate(&self) -> &GenerationGate {
        &self.gate
    }

    /// One guarded call with transport-level retries.
    ///
    /// `Timeout`, `RateLimited` and `Unavailable` are retried with backoff.
    /// `Refused` surfaces at once as `GenerationRefused`. Running out of
    /// attempts gives `GenerationTimeout` when the last failure was a
    /// timeout, else `GenerationFailed`. The returned attempt record has
    /// no outcome yet.
    pub async fn call(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<(String, GenerationAttempt), EngineError> {
        self.call_from(request, cancel, 1).await
    }

    /// [`call`](Self::call) with attempts numbered from `first`, spending
    /// only what is left of the policy's attempt budget.
    async fn call_from(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        first: u32,
    ) -> Result<(String, GenerationAttempt), EngineError> {
        let step = request.step;
        let prompt = request.prompt_text();
        let offset = first.saturating_sub(1);
        let budget = RetryPolicy {
            max_attempts: self.retry.attempts().saturating_sub(offset).max(1),
            ..self.retry
        };
        let result = retry::with_backoff(&budget, cancel, CallError::is_transient, |attempt| async move {
            let attempt = offset + attempt;
            let _permit = self.gate.acquire(cancel).await.map_err(CallError::Engine)?;
            let outcome = tokio::time::timeout(self.step_timeout, self.model.complete(request)).await;
            match outcome {
                Ok(Ok(text)) => Ok((text, attempt)),
                Ok(Err(e)) => {
                    tracing::warn!(%step, attempt, model = self.model.name(), error = %e, "model call failed");
                    Err(CallError::Model(e))
                }
                Err(_) => {
                    tracing::warn!(%step, attempt, timeout_secs = self.step_timeout.as_secs(), "model call timed out");
                    Err(CallError::Model(ModelError::Timeout))
                }
            }
        })
        .await;

        match result {
            Ok((text, attempt)) => Ok((text, GenerationAttempt::new(step, attempt, &prompt))),
            Err(RetryError::Cancelled) => Err(EngineError::cancelled(Stage::Generation)),
            Err(RetryError::Fatal { error: CallError::Engine(e), .. })
            | Err(RetryError::Exhausted { last: CallError::Engine(e), .. }) => Err(e),
            Err(RetryError::Fatal {
                attempts,
                error: CallError::Model(e),
            }) => {
                let attempts = offset + attempts;
                let record = GenerationAttempt::new(step, attempts, &prompt).failed(e.to_string());
                Err(match e {
                    ModelError::Refused(reason) => EngineError::GenerationRefused {
                        step,
                        reason,
                        last_attempt: Some(Box::new(record)),
                    },
                    other => EngineError::GenerationFailed {
                        step,
                        attempts,
                        reason: other.to_string(),
                        last_attempt: Some(Box::new(record)),
                    },
                })
            }
            Err(RetryError::Exhausted {
                attempts,
                last: CallError::Model(e),
            }) => {
                let attempts = offset + attempts;
                let record = GenerationAttempt::new(step, attempts, &prompt).failed(e.to_string());
                Err(match e {
                    ModelError::Timeout => EngineError::GenerationTimeout {
                        step,
                        attempts,
                        last_attempt: Some(Box::new(record)),
                    },
                    other => EngineError::GenerationFailed {
                        step,
                        attempts,
                        reason: other.to_string(),
                        last_attempt: Some(Box::new(record)),
                    },
                })
            }
        }
    }

    /// Run a step until its output passes `accept`.
    ///
    /// Transport retries and retries for unusable output draw on one
    /// budget: a step makes at most `max_attempts` model calls in total.
    /// The last rejected output is attached to the resulting
    /// `GenerationFailed`.
    pub async fn run_step<T>(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
        accept: impl Fn(&str) -> Result<T, String>,
    ) -> Result<(T, GenerationAttempt), EngineError> {
        let step: GenerationStep = request.step;
        let budget = self.retry.attempts();
        let mut used = 0;
        let mut last: Option<(String, GenerationAttempt)> = None;
        while used < budget {
            let (text, attempt) = self.call_from(request, cancel, used + 1).await?;
            used = attempt.attempt;
            match accept(&text) {
                Ok(value) => {
                    tracing::debug!(%step, attempt = used, output_chars = text.chars().count(), "step output accepted");
                    return Ok((value, attempt.with_output(&text, AttemptOutcome::Accepted)));
                }
                Err(reason) => {
                    tracing::warn!(%step, attempt = used, %reason, "unusable step output");
                    let record = attempt
                        .with_output(&text, AttemptOutcome::Rejected)
                        .rejected(reason.clone());
                    last = Some((reason, record));
                }
            }
        }
        let (reason, record) = last.unwrap_or_else(|| {
            (
                "no attempts were made".to_string(),
                GenerationAttempt::new(step, 0, &request.prompt_text()),
            )
        });
        Err(EngineError::GenerationFailed {
            step,
            attempts: used,
            reason: format!("unusable output: {reason}"),
            last_attempt: Some(Box::new(record)),
        })
    }
}
