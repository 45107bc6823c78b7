//! Embedding provider: turns text into fixed-dimension vectors.
//!
//! Backends implement [`Embedder`]; the [`EmbeddingProvider`] wrapper owns
//! the truncation policy and the bounded retry loop, and maps exhausted
//! retries to [`EngineError::EmbeddingUnavailable`].
//!
//! Truncation policy: input longer than the configured limit is
//! head-truncated, keeping the first `max_chars` characters and cutting on
//! a char boundary. The tail of a long query is dropped, never the head.

pub mod hashing;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, EngineError, Stage};
use crate::retry::{self, RetryError, RetryPolicy};

pub use hashing::HashingEmbedder;
pub use openai::{OpenAiEmbedder, OpenAiEmbedderConfig};

/// Adapter interface for embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Short backend name for logs (e.g. "openai", "hashing").
    fn name(&self) -> &str;

    /// Length of every vector this backend returns.
    fn dimension(&self) -> usize;

    /// Embed a single, non-empty piece of text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Embedder) {}
};

/// Keep the first `max_chars` characters of `text`.
pub fn truncate_head(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Embedding stage: truncation, retries and error mapping around an
/// [`Embedder`] backend.
#[derive(Clone)]
pub struct EmbeddingProvider {
    backend: Arc<dyn Embedder>,
    max_chars: usize,
    retry: RetryPolicy,
}

impl std::fmt::Debug for EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingProvider")
            .field("backend", &self.backend.name())
            .field("max_chars", &self.max_chars)
            .finish()
    }
}

impl EmbeddingProvider {
    pub fn new(backend: Arc<dyn Embedder>, max_chars: usize, retry: RetryPolicy) -> Self {
        Self {
            backend,
            max_chars: max_chars.max(1),
            retry,
        }
    }

    pub fn dimension(&self) -> usize {
        self.backend.dimension()
    }

    /// Embed `text` after truncation, retrying transient backend failures.
    ///
    /// Empty input is rejected as a configuration error rather than sent to
    /// the backend.
    pub async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, EngineError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(EngineError::EmbeddingUnavailable {
                attempts: 0,
                source: BackendError::Configuration("cannot embed empty text".to_string()),
            });
        }
        let input = truncate_head(trimmed, self.max_chars);
        if input.len() < trimmed.len() {
            tracing::debug!(
                original_chars = trimmed.chars().count(),
                kept_chars = self.max_chars,
                "embedding input head-truncated"
            );
        }

        let backend = &self.backend;
        let result = retry::with_backoff(&self.retry, cancel, BackendError::is_transient, |attempt| {
            let backend = Arc::clone(backend);
            async move {
                let r = backend.embed(input).await;
                if let Err(e) = &r {
                    tracing::warn!(backend = backend.name(), attempt, error = %e, "embedding call failed");
                }
                r
            }
        })
        .await;

        match result {
            Ok(vector) => {
                if vector.len() != self.backend.dimension() {
                    return Err(EngineError::EmbeddingUnavailable {
                        attempts: 1,
                        source: BackendError::Decode(format!(
                            "expected {} dimensions, got {}",
                            self.backend.dimension(),
                            vector.len()
                        )),
                    });
                }
                Ok(vector)
            }
            Err(RetryError::Cancelled) => Err(EngineError::cancelled(Stage::Embedding)),
            Err(RetryError::Exhausted { attempts, last }) => Err(EngineError::EmbeddingUnavailable {
                attempts,
                source: last,
            }),
            Err(RetryError::Fatal { attempts, error }) => Err(EngineError::EmbeddingUnavailable {
                attempts,
                source: error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FlakyEmbedder {
        failures: u32,
        calls: AtomicU32,
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn name(&self) -> &str {
            "flaky"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
            self.seen.lock().unwrap().push(text.to_string());
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(BackendError::Timeout)
            } else {
                Ok(vec![1.0, 0.0])
            }
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyEmbedder> {
        Arc::new(FlakyEmbedder {
            failures,
            calls: AtomicU32::new(0),
            seen: std::sync::Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn truncate_head_keeps_prefix_on_char_boundary() {
        assert_eq!(truncate_head("héllo wörld", 4), "héll");
        assert_eq!(truncate_head("short", 10), "short");
        assert_eq!(truncate_head("", 3), "");
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let backend = flaky(2);
        let provider = EmbeddingProvider::new(backend.clone(), 100, RetryPolicy::immediate(3));
        let v = provider.embed("fractions", &CancellationToken::new()).await.unwrap();
        assert_eq!(v, vec![1.0, 0.0]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_map_to_embedding_unavailable() {
        let provider = EmbeddingProvider::new(flaky(10), 100, RetryPolicy::immediate(3));
        let err = provider.embed("fractions", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::EmbeddingUnavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn long_input_is_head_truncated() {
        let backend = flaky(0);
        let provider = EmbeddingProvider::new(backend.clone(), 5, RetryPolicy::immediate(1));
        provider.embed("abcdefghij", &CancellationToken::new()).await.unwrap();
        assert_eq!(backend.seen.lock().unwrap()[0], "abcde");
    }

    #[tokio::test]
    async fn empty_input_is_rejected_without_calling_backend() {
        let backend = flaky(0);
        let provider = EmbeddingProvider::new(backend.clone(), 5, RetryPolicy::immediate(1));
        assert!(provider.embed("   ", &CancellationToken::new()).await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
