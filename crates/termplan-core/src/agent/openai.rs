//! OpenAI-compatible chat completions backend.
//!
//! Works against any server exposing `POST {base_url}/chat/completions`
//! with bearer auth. The default base URL is Groq's OpenAI-compatible
//! endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::model::{ChatMessage, CompletionRequest, LanguageModel, ModelError};

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

#[derive(Clone)]
pub struct OpenAiChatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// HTTP-level timeout. The agent applies its own per-step deadline too.
    pub timeout: Duration,
}

impl std::fmt::Debug for OpenAiChatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for OpenAiChatConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Chat completions client.
#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    config: OpenAiChatConfig,
    client: Client,
}

impl OpenAiChatModel {
    pub fn new(config: OpenAiChatConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ModelError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ModelError {
    let body: String = body.chars().take(300).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        ModelError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ModelError::Unavailable(format!("status {}: {body}", status.as_u16()))
    } else {
        // Remaining 4xx: bad key, unknown model, policy rejection. Retrying
        // the same request cannot succeed.
        ModelError::Refused(format!("status {}: {body}", status.as_u16()))
    }
}

fn extract_content(response: ChatResponse) -> Result<String, ModelError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::Unavailable("response contained no choices".to_string()))?;
    if let Some(refusal) = choice.message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(ModelError::Refused(refusal));
    }
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(ModelError::Refused("content filter triggered".to_string()));
    }
    match choice.message.content {
        Some(c) if !c.trim().is_empty() => Ok(c),
        _ => Err(ModelError::Refused("empty content".to_string())),
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ModelError::Refused("model API key not set".to_string()))?;

        let body = ChatRequest {
            model: &self.config.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout
                } else {
                    ModelError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &text));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout
            } else {
                ModelError::Unavailable(format!("undecodable response: {e}"))
            }
        })?;
        extract_content(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> ChatResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(2)), ""),
            ModelError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, "upstream"),
            ModelError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "bad key"),
            ModelError::Refused(_)
        ));
    }

    #[test]
    fn content_is_extracted() {
        let r = response(r#"{"choices":[{"message":{"content":"{\"terms\":[]}"},"finish_reason":"stop"}]}"#);
        assert_eq!(extract_content(r).unwrap(), r#"{"terms":[]}"#);
    }

    #[test]
    fn refusals_are_detected() {
        let filtered = response(r#"{"choices":[{"message":{"content":"x"},"finish_reason":"content_filter"}]}"#);
        assert!(matches!(extract_content(filtered), Err(ModelError::Refused(_))));

        let refused = response(r#"{"choices":[{"message":{"content":null,"refusal":"I can't help"}}]}"#);
        assert_eq!(
            extract_content(refused),
            Err(ModelError::Refused("I can't help".to_string()))
        );

        let empty = response(r#"{"choices":[{"message":{"content":"  "}}]}"#);
        assert!(matches!(extract_content(empty), Err(ModelError::Refused(_))));
    }

    #[test]
    fn no_choices_is_transient() {
        let r = response(r#"{"choices":[]}"#);
        assert!(extract_content(r).unwrap_err().is_transient());
    }

    #[test]
    fn request_serialises_json_mode() {
        let req = CompletionRequest::new(crate::model::GenerationStep::Outline, "s", "u");
        let body = ChatRequest {
            model: "m",
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["response_format"]["type"], "json_object");
        assert_eq!(v["messages"][0]["role"], "system");
    }
}
