//! Provider Integration Layer
//!
//! Adapters over remote text generators, per-provider circuit breakers
//! and the call timeout helper.

pub mod provider;
pub mod timeout;

pub use provider::{
    AdapterRegistry, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitBreakerStats, CircuitState, ErrorCategory, ErrorClassifier,
    GenerationParams, GenerationResult, OllamaAdapter, OpenAiCompatibleAdapter, ProviderAdapter,
    ProviderError, RegisteredModel, SharedAdapter, TokenUsage, create_adapter,
};
pub use timeout::with_call_timeout;
