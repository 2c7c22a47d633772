//! Provider Adapter Abstraction
//!
//! Defines the `ProviderAdapter` trait: one instance per (provider, model)
//! pair, returning plain text plus usage metrics.
//!
//! ## Modules
//!
//! - `circuit_breaker`: Circuit breaker pattern for provider resilience
//! - `registry`: Model id → adapter map built from configuration
//! - `openai`, `ollama`: Concrete HTTP adapters

mod circuit_breaker;
mod ollama;
mod openai;
mod registry;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState,
    CircuitBreakerStats, CircuitState,
};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiCompatibleAdapter;
pub use registry::{AdapterRegistry, RegisteredModel};

// Re-export error types from centralized location
pub use crate::types::{ErrorCategory, ErrorClassifier, ProviderError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AdapterKind, ModelEndpointConfig, PipelineSettings};
use crate::constants::pipeline as pipeline_constants;
use crate::types::Result;

// =============================================================================
// Generation Parameters and Result
// =============================================================================

/// Sampling parameters passed to every adapter call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: pipeline_constants::TEMPERATURE,
            max_tokens: pipeline_constants::MAX_TOKENS,
        }
    }
}

impl From<&PipelineSettings> for GenerationParams {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        }
    }
}

/// Text returned by a successful adapter call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub usage: TokenUsage,
}

impl GenerationResult {
    pub fn new(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }
}

/// Token usage metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens (prompt)
    pub input_tokens: u32,
    /// Output tokens (response)
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Total tokens used (input + output)
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Create from OpenAI-style usage response
    pub fn from_openai(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            input_tokens: prompt_tokens,
            output_tokens: completion_tokens,
        }
    }

    /// Create from Ollama-style usage response
    pub fn from_ollama(prompt_eval_count: u32, eval_count: u32) -> Self {
        Self {
            input_tokens: prompt_eval_count,
            output_tokens: eval_count,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

// =============================================================================
// Provider Adapter Trait
// =============================================================================

/// Uniform contract over a remote text generator.
///
/// Implementations must be safe to call concurrently and must enforce the
/// supplied `timeout` themselves. The stage executor applies its own
/// timeout on top.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        timeout: Duration,
    ) -> std::result::Result<GenerationResult, ProviderError>;

    /// Provider organisation name, used as the breaker and health key
    fn provider(&self) -> &str;

    /// Provider-side model name
    fn model(&self) -> &str;

    /// Cheap liveness check. Adapters without a metadata endpoint pass.
    async fn probe(&self) -> std::result::Result<(), ProviderError> {
        Ok(())
    }
}

/// Shared adapter type for concurrent access across pipeline stages.
pub type SharedAdapter = Arc<dyn ProviderAdapter>;

/// Create a shared adapter from a model endpoint entry
pub fn create_adapter(endpoint: &ModelEndpointConfig) -> Result<SharedAdapter> {
    match endpoint.kind {
        AdapterKind::Openai => Ok(Arc::new(OpenAiCompatibleAdapter::new(endpoint)?)),
        AdapterKind::Ollama => Ok(Arc::new(OllamaAdapter::new(endpoint)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_accumulates() {
        let mut usage = TokenUsage::from_openai(100, 50);
        usage += TokenUsage::from_ollama(10, 5);
        assert_eq!(usage.input_tokens, 110);
        assert_eq!(usage.total(), 165);
    }

    #[test]
    fn test_params_from_settings() {
        let settings = PipelineSettings {
            temperature: 0.2,
            max_tokens: 64,
            ..Default::default()
        };
        let params = GenerationParams::from(&settings);
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.max_tokens, 64);
    }

    #[test]
    fn test_create_ollama_adapter() {
        let mut endpoint = ModelEndpointConfig::new("local", "llama3");
        endpoint.kind = AdapterKind::Ollama;
        let adapter = create_adapter(&endpoint).unwrap();
        assert_eq!(adapter.provider(), "local");
        assert_eq!(adapter.model(), "llama3");
    }
}
