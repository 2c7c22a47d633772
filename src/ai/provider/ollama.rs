//! Ollama Local Model Adapter
//!
//! Adapter for locally-running Ollama models using the non-streaming
//! `/api/generate` endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{GenerationParams, GenerationResult, ProviderAdapter, TokenUsage};
use crate::config::ModelEndpointConfig;
use crate::constants::network as net_constants;
use crate::types::{
    ConcordError, ErrorCategory, ErrorClassifier, ProviderError, Result, truncate_chars,
};

const DEFAULT_API_BASE: &str = "http://localhost:11434";

/// Ollama local model adapter
#[derive(Debug)]
pub struct OllamaAdapter {
    provider: String,
    model: String,
    api_base: String,
    client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(endpoint: &ModelEndpointConfig) -> Result<Self> {
        let api_base = endpoint
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        // Validate endpoint URL for security (SSRF prevention)
        let api_base = Self::validate_endpoint(&api_base)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()
            .map_err(|e| ConcordError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            provider: endpoint.provider.clone(),
            model: endpoint.model.clone(),
            api_base,
            client,
        })
    }

    /// Only allows http/https schemes and warns for non-localhost endpoints.
    fn validate_endpoint(endpoint: &str) -> Result<String> {
        let url = url::Url::parse(endpoint).map_err(|e| {
            ConcordError::Config(format!("Invalid Ollama endpoint URL '{}': {}", endpoint, e))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConcordError::Config(format!(
                "Ollama endpoint must use http or https scheme, got: {}",
                url.scheme()
            )));
        }

        if let Some(host) = url.host_str()
            && !matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
        {
            warn!(
                "Ollama endpoint is not localhost: {}. Ensure this is intentional.",
                host
            );
        }

        let mut result = url.to_string();
        if result.ends_with('/') {
            result.pop();
        }
        Ok(result)
    }

    fn build_request(&self, prompt: &str, params: &GenerationParams) -> OllamaRequest {
        OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: OllamaOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
            },
        }
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        timeout: Duration,
    ) -> std::result::Result<GenerationResult, ProviderError> {
        let request = self.build_request(prompt, params);
        let url = format!("{}/api/generate", self.api_base);

        debug!(provider = %self.provider, model = %self.model, "Sending generate request");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ProviderError::with_provider(
                        ErrorCategory::Network,
                        format!(
                            "Failed to connect to Ollama at {}. Is Ollama running?",
                            self.api_base
                        ),
                        &self.provider,
                    )
                } else {
                    ErrorClassifier::classify_reqwest(&e, &self.provider)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ErrorClassifier::classify_http_status(
                status.as_u16(),
                &format!(
                    "Ollama API error ({}): {}",
                    status,
                    truncate_chars(&body, net_constants::MAX_ERROR_BODY_CHARS)
                ),
                &self.provider,
            ));
        }

        let response_body: OllamaResponse = response.json().await.map_err(|e| {
            ProviderError::malformed(
                &self.provider,
                format!("Failed to parse Ollama response: {}", e),
            )
        })?;

        if response_body.response.trim().is_empty() {
            return Err(ProviderError::malformed(&self.provider, "empty response"));
        }

        let usage = TokenUsage::from_ollama(
            response_body.prompt_eval_count.unwrap_or(0),
            response_body.eval_count.unwrap_or(0),
        );

        Ok(GenerationResult::new(response_body.response, usage))
    }

    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    /// Passes when the server answers and the configured model is pulled.
    async fn probe(&self) -> std::result::Result<(), ProviderError> {
        let url = format!("{}/api/tags", self.api_base);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ErrorClassifier::classify_reqwest(&e, &self.provider))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ErrorClassifier::classify_http_status(
                status.as_u16(),
                &format!("Ollama API check failed ({})", status),
                &self.provider,
            ));
        }

        let tags: OllamaTagsResponse = response.json().await.map_err(|e| {
            ProviderError::malformed(&self.provider, format!("Failed to parse tags: {}", e))
        })?;

        if tags.has_model(&self.model) {
            Ok(())
        } else {
            Err(ProviderError::with_provider(
                ErrorCategory::Unavailable,
                format!("model '{}' not found. Pull with: ollama pull {}", self.model, self.model),
                &self.provider,
            ))
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: usize,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

impl OllamaTagsResponse {
    fn has_model(&self, model: &str) -> bool {
        let base = model.trim_end_matches(":latest");
        self.models
            .iter()
            .any(|m| m.name == model || m.name.trim_end_matches(":latest") == base)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint() {
        let endpoint = ModelEndpointConfig::new("local", "llama3:latest");
        let adapter = OllamaAdapter::new(&endpoint).expect("Failed to create adapter");
        assert_eq!(adapter.api_base, DEFAULT_API_BASE);
        assert_eq!(adapter.model, "llama3:latest");
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let mut endpoint = ModelEndpointConfig::new("local", "llama3");
        endpoint.api_base = Some("file:///etc/passwd".to_string());
        assert!(matches!(
            OllamaAdapter::new(&endpoint),
            Err(ConcordError::Config(_))
        ));
    }

    #[test]
    fn test_tags_match_latest_suffix() {
        let tags: OllamaTagsResponse =
            serde_json::from_str(r#"{"models":[{"name":"llama3:latest"},{"name":"qwen2:7b"}]}"#)
                .unwrap();
        assert!(tags.has_model("llama3"));
        assert!(tags.has_model("llama3:latest"));
        assert!(tags.has_model("qwen2:7b"));
        assert!(!tags.has_model("mistral"));
    }

    #[test]
    fn test_request_is_non_streaming() {
        let adapter = OllamaAdapter::new(&ModelEndpointConfig::new("local", "llama3")).unwrap();
        let body = serde_json::to_value(adapter.build_request("hi", &GenerationParams::default()))
            .unwrap();
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 2048);
    }
}
