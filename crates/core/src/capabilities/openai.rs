//! OpenAI-compatible capability provider
//!
//! Speaks the Chat Completions protocol, which every supported provider
//! exposes. Endpoint, key and models come from the injected `ModelConfig`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CapabilityError, CapabilityProvider, CapabilityRole};
use crate::models::ModelConfig;

/// Maximum number of retries for transient errors
const MAX_RETRIES: u32 = 2;

/// Initial backoff delay for retries
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Capability provider backed by an OpenAI-compatible HTTP API
pub struct OpenAiProvider {
    config: ModelConfig,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    /// Create a provider from an explicit configuration
    pub fn new(config: ModelConfig) -> Result<Self, CapabilityError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| CapabilityError::Network(e.to_string()))?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Build the request body for one role
    fn build_request_body(&self, role: CapabilityRole, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model_for(role),
            "messages": [
                { "role": "user", "content": prompt }
            ],
        })
    }

    /// Pull the first choice's text out of a completion response
    fn extract_content(response: ChatCompletionResponse) -> Result<String, CapabilityError> {
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| CapabilityError::InvalidResponse("completion has no content".to_string()))
    }

    async fn send_once(&self, role: CapabilityRole, prompt: &str) -> Result<String, CapabilityError> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            CapabilityError::MissingCredentials(self.config.provider.display_name().to_string())
        })?;

        let response = self
            .http
            .post(self.config.completions_url())
            .bearer_auth(api_key)
            .json(&self.build_request_body(role, prompt))
            .send()
            .await
            .map_err(|e| CapabilityError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CapabilityError::Api {
                status: status.as_u16(),
                message: message.chars().take(500).collect(),
            });
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::InvalidResponse(e.to_string()))?;

        Self::extract_content(body)
    }
}

#[async_trait]
impl CapabilityProvider for OpenAiProvider {
    async fn invoke(&self, role: CapabilityRole, prompt: &str) -> Result<String, CapabilityError> {
        debug!(%role, model = %self.config.model_for(role), prompt_len = prompt.len(), "invoke: called");

        let mut attempt = 0;
        loop {
            match self.send_once(role, prompt).await {
                Ok(text) => return Ok(text),
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                    let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt));
                    warn!(%role, %err, ?backoff, "invoke: transient failure, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LlmProvider;

    #[test]
    fn test_request_body_uses_role_model() {
        let config = ModelConfig::new("gpt-4o-mini")
            .with_role_model(CapabilityRole::Evaluator, "gpt-4o");
        let provider = OpenAiProvider::new(config).unwrap();

        let body = provider.build_request_body(CapabilityRole::Evaluator, "评估一下");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "评估一下");

        let body = provider.build_request_body(CapabilityRole::Researcher, "x");
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn test_extract_content() {
        let response: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"{\"ok\":true}"}}]}"#,
        )
        .unwrap();
        assert_eq!(
            OpenAiProvider::extract_content(response).unwrap(),
            "{\"ok\":true}"
        );

        let empty: ChatCompletionResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(
            OpenAiProvider::extract_content(empty),
            Err(CapabilityError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_retried() {
        let config = ModelConfig::with_provider(LlmProvider::DeepSeek, "deepseek-chat");
        let provider = OpenAiProvider::new(config).unwrap();

        let err = provider
            .invoke(CapabilityRole::TaskPlanner, "plan")
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::MissingCredentials("DeepSeek".to_string()));
    }
}
