//! OpenAI-compatible chat-completions backend for generation and reasoning.
//!
//! Failure mapping:
//!
//! | Response                       | `GenerationError` | Retried |
//! |--------------------------------|-------------------|---------|
//! | 408, client timeout            | `Timeout`         | yes     |
//! | 429                            | `RateLimited`     | yes     |
//! | 5xx, connection failure        | `Transport`       | yes     |
//! | other 4xx                      | `Refused`         | no      |
//! | `finish_reason: content_filter`| `Refused`         | no      |
//! | no message content             | `Malformed`       | yes     |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::collaborators::{
    ContextSnapshot, GenerationError, GenerationRequest, Generator, Reasoner, ReasoningError,
};
use crate::config::ProviderConfig;
use crate::prompts;

/// HTTP client for one OpenAI-compatible endpoint.
pub struct OpenAiCompatProvider {
    config: ProviderConfig,
    client: reqwest::Client,
    timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            config,
            client,
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: String,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let request_body = serde_json::json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": temperature
        });

        let mut request = self.client.post(self.endpoint()).json(&request_body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout(self.timeout)
            } else {
                GenerationError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let resp_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        extract_content(&resp_json)
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> GenerationError {
    let detail = format!("HTTP {status}: {}", body.chars().take(300).collect::<String>());
    match status {
        StatusCode::REQUEST_TIMEOUT => GenerationError::Timeout(Duration::ZERO),
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited(detail),
        s if s.is_server_error() => GenerationError::Transport(detail),
        _ => GenerationError::Refused(detail),
    }
}

/// Pull the first choice's text out of a chat-completions response.
pub fn extract_content(resp_json: &serde_json::Value) -> Result<String, GenerationError> {
    let choice = &resp_json["choices"][0];
    if choice["finish_reason"].as_str() == Some("content_filter") {
        return Err(GenerationError::Refused(
            "response blocked by content filter".into(),
        ));
    }
    match choice["message"]["content"].as_str() {
        Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
        _ => Err(GenerationError::Malformed(
            "response has no message content".into(),
        )),
    }
}

#[async_trait]
impl Generator for OpenAiCompatProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        debug!(stage = %request.stage, attempt = request.attempt, model = %self.config.model, "chat completion");
        let (system, temperature) = if request.stage.ends_with(prompts::REVIEW_SUFFIX) {
            (prompts::REVIEW_PREAMBLE.to_string(), 0.2)
        } else {
            (
                format!(
                    "{}\n\n{}",
                    prompts::WRITER_PREAMBLE,
                    prompts::preamble_for(&request.stage)
                ),
                self.config.temperature,
            )
        };
        self.complete(
            &self.config.model,
            &system,
            prompts::stage_prompt(request),
            temperature,
        )
        .await
    }
}

#[async_trait]
impl Reasoner for OpenAiCompatProvider {
    async fn reason(
        &self,
        snapshot: &ContextSnapshot,
        legal_actions: &[String],
    ) -> Result<String, ReasoningError> {
        let model = self.config.reasoning_model();
        debug!(from = %snapshot.current_stage, model, "planner completion");
        Ok(self
            .complete(
                model,
                prompts::PLANNER_PREAMBLE,
                prompts::planner_prompt(snapshot, legal_actions),
                0.0,
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            GenerationError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, ""),
            GenerationError::Timeout(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "upstream"),
            GenerationError::Transport(_)
        ));
        let refused = classify_status(StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(refused, GenerationError::Refused(_)));
        assert!(!refused.is_transient());
    }

    #[test]
    fn test_extract_content() {
        let ok = json!({"choices": [{"message": {"content": "Once"}, "finish_reason": "stop"}]});
        assert_eq!(extract_content(&ok).unwrap(), "Once");

        let filtered = json!({"choices": [{"message": {"content": ""}, "finish_reason": "content_filter"}]});
        assert!(matches!(
            extract_content(&filtered),
            Err(GenerationError::Refused(_))
        ));

        let empty = json!({"choices": []});
        assert!(matches!(
            extract_content(&empty),
            Err(GenerationError::Malformed(_))
        ));
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let config = ProviderConfig {
            base_url: "http://llm:8080/v1/".into(),
            ..Default::default()
        };
        let provider = OpenAiCompatProvider::new(config, Duration::from_secs(5)).unwrap();
        assert_eq!(provider.endpoint(), "http://llm:8080/v1/chat/completions");
    }
}
