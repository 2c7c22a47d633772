//! OpenAI-Compatible Chat Completions Adapter
//!
//! Works against OpenAI and any gateway that speaks the Chat Completions
//! wire format. Returns plain text plus token usage.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{GenerationParams, GenerationResult, ProviderAdapter, TokenUsage};
use crate::config::ModelEndpointConfig;
use crate::constants::network as net_constants;
use crate::types::{
    ConcordError, ErrorClassifier, ProviderError, Result, truncate_chars,
};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Chat Completions adapter with secure API key handling
pub struct OpenAiCompatibleAdapter {
    provider: String,
    model: String,
    /// API key stored securely - never exposed in logs or debug output
    api_key: Option<SecretString>,
    api_base: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiCompatibleAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleAdapter")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl OpenAiCompatibleAdapter {
    pub fn new(endpoint: &ModelEndpointConfig) -> Result<Self> {
        let api_key = endpoint.resolved_api_key().map(SecretString::from);
        if api_key.is_none() {
            warn!(
                provider = %endpoint.provider,
                model = %endpoint.model,
                "No API key configured; requests will be sent unauthenticated"
            );
        }

        let api_base = endpoint
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .map_err(|e| ConcordError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            provider: endpoint.provider.clone(),
            model: endpoint.model.clone(),
            api_key,
            api_base,
            client,
        })
    }

    fn build_request(&self, prompt: &str, params: &GenerationParams) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: params.temperature,
            max_tokens: Some(params.max_tokens),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(
                "Authorization",
                format!("Bearer {}", key.expose_secret()),
            ),
            None => request,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        timeout: Duration,
    ) -> std::result::Result<GenerationResult, ProviderError> {
        let request = self.build_request(prompt, params);
        let url = format!("{}/chat/completions", self.api_base);

        debug!(provider = %self.provider, model = %self.model, "Sending chat completion request");

        let response = self
            .authorize(self.client.post(&url))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| ErrorClassifier::classify_reqwest(&e, &self.provider))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ErrorClassifier::classify_http_status(
                status.as_u16(),
                &format!(
                    "API error ({}): {}",
                    status,
                    truncate_chars(&body, net_constants::MAX_ERROR_BODY_CHARS)
                ),
                &self.provider,
            ));
        }

        let response_body: ChatCompletionResponse = response.json().await.map_err(|e| {
            ProviderError::malformed(&self.provider, format!("Failed to parse response: {}", e))
        })?;

        let usage = response_body
            .usage
            .map(|u| TokenUsage::from_openai(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        let text = response_body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ProviderError::malformed(&self.provider, "empty response content"))?;

        Ok(GenerationResult::new(text, usage))
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn probe(&self) -> std::result::Result<(), ProviderError> {
        let url = format!("{}/models", self.api_base);

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ErrorClassifier::classify_reqwest(&e, &self.provider))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ErrorClassifier::classify_http_status(
                status.as_u16(),
                &format!("probe failed ({})", status),
                &self.provider,
            ))
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ModelEndpointConfig {
        let mut endpoint = ModelEndpointConfig::new("openai", "gpt-4o");
        endpoint.api_key = Some("sk-test".to_string());
        endpoint.api_base = Some("https://gateway.example.com/v1/".to_string());
        endpoint
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let adapter = OpenAiCompatibleAdapter::new(&endpoint()).unwrap();
        assert_eq!(adapter.api_base, "https://gateway.example.com/v1");
    }

    #[test]
    fn test_debug_redacts_key() {
        let adapter = OpenAiCompatibleAdapter::new(&endpoint()).unwrap();
        let debug = format!("{:?}", adapter);
        assert!(!debug.contains("sk-test"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_request_body_shape() {
        let adapter = OpenAiCompatibleAdapter::new(&endpoint()).unwrap();
        let params = GenerationParams {
            temperature: 0.1,
            max_tokens: 32,
        };
        let body = serde_json::to_value(adapter.build_request("hi", &params)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["max_tokens"], 32);
    }

    #[test]
    fn test_parse_response_with_usage() {
        let body: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"2"}}],"usage":{"prompt_tokens":7,"completion_tokens":1}}"#,
        )
        .unwrap();
        assert_eq!(body.choices[0].message.content.as_deref(), Some("2"));
        assert_eq!(body.usage.unwrap().prompt_tokens, 7);
    }
}
