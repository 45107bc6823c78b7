//! The language model seam.
//!
//! The agent only needs one operation from a model backend: turn a list of
//! chat messages into a completion. Backends classify their failures into
//! [`ModelError`] so the agent can decide what to retry.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::model::GenerationStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One model call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Step this call belongs to; used for diagnostics only.
    pub step: GenerationStep,
    pub messages: Vec<ChatMessage>,
    /// Ask the backend for a JSON object response.
    pub json: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(step: GenerationStep, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            step,
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            json: true,
            temperature: 0.4,
            max_tokens: 4000,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// All message contents joined, as digested into a `GenerationAttempt`.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Content of the last user message.
    pub fn user_prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

/// Failure reported by a model backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("model call timed out")]
    Timeout,

    #[error("model rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("model unavailable: {0}")]
    Unavailable(String),

    /// Explicit refusal, content filter, or empty content. Never retried.
    #[error("model refused: {0}")]
    Refused(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Refused(_))
    }
}

/// Adapter interface for generative model backends.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Run one completion and return the raw text content.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn LanguageModel) {}
};
