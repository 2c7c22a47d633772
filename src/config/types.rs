//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global (~/.config/concord/) and project (.concord/) level configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    circuit_breaker as cb_constants, dedup as dedup_constants, health as health_constants,
    network as net_constants, pipeline as pipeline_constants, stage as stage_constants,
};
use crate::types::{ConcordError, ModelRole, Result};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Pipeline controller and stage executor settings
    pub pipeline: PipelineSettings,

    /// Circuit breaker settings (applied to every provider)
    pub breaker: BreakerSettings,

    /// Provider health manager settings
    pub health: HealthSettings,

    /// In-flight dedup and result cache settings
    pub dedup: DedupSettings,

    /// Gating policy source
    pub policy: PolicySettings,

    /// Registered model endpoints
    pub models: Vec<ModelEndpointConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            pipeline: PipelineSettings::default(),
            breaker: BreakerSettings::default(),
            health: HealthSettings::default(),
            dedup: DedupSettings::default(),
            policy: PolicySettings::default(),
            models: Vec::new(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `ConcordError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.timeout_per_call_secs == 0 {
            return Err(ConcordError::Config(
                "pipeline.timeout_per_call_secs must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.max_concurrency == 0 {
            return Err(ConcordError::Config(
                "pipeline.max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.request_deadline_secs == 0 {
            return Err(ConcordError::Config(
                "pipeline.request_deadline_secs must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.pipeline.temperature) {
            return Err(ConcordError::Config(format!(
                "pipeline.temperature must be between 0.0 and 2.0, got {}",
                self.pipeline.temperature
            )));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConcordError::Config(
                "breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.health.refresh_interval_secs == 0 {
            return Err(ConcordError::Config(
                "health.refresh_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.health.probe_timeout_secs == 0 {
            return Err(ConcordError::Config(
                "health.probe_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.dedup.enabled && self.dedup.ttl_secs == 0 {
            return Err(ConcordError::Config(
                "dedup.ttl_secs must be greater than 0 when dedup is enabled".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.provider.trim().is_empty() || model.model.trim().is_empty() {
                return Err(ConcordError::Config(
                    "models entries need non-empty provider and model".to_string(),
                ));
            }
            if !seen.insert(model.resolved_id()) {
                return Err(ConcordError::Config(format!(
                    "duplicate model id: {}",
                    model.resolved_id()
                )));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Pipeline Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Minimum Initial successes required to run PeerReview
    pub peer_review_min_successes: usize,
    /// Per-call timeout in seconds
    pub timeout_per_call_secs: u64,
    /// Maximum concurrent calls within a stage
    pub max_concurrency: usize,
    /// Overall request deadline in seconds
    pub request_deadline_secs: u64,
    /// Delay before the single transient-error retry (milliseconds)
    pub retry_delay_ms: u64,
    /// Sampling temperature passed to every adapter
    pub temperature: f32,
    /// Maximum tokens per generation
    pub max_tokens: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            peer_review_min_successes: pipeline_constants::PEER_REVIEW_MIN_SUCCESSES,
            timeout_per_call_secs: stage_constants::TIMEOUT_PER_CALL_SECS,
            max_concurrency: stage_constants::MAX_CONCURRENCY,
            request_deadline_secs: pipeline_constants::REQUEST_DEADLINE_SECS,
            retry_delay_ms: stage_constants::RETRY_DELAY_MS,
            temperature: pipeline_constants::TEMPERATURE,
            max_tokens: pipeline_constants::MAX_TOKENS,
        }
    }
}

impl PipelineSettings {
    pub fn timeout_per_call(&self) -> Duration {
        Duration::from_secs(self.timeout_per_call_secs)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// =============================================================================
// Breaker / Health / Dedup Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before a provider's breaker opens
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before allowing a probe
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: cb_constants::FAILURE_THRESHOLD,
            recovery_timeout_secs: cb_constants::RECOVERY_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Seconds between background probe rounds
    pub refresh_interval_secs: u64,
    /// Whether to run active probes at all
    pub probe_enabled: bool,
    /// Timeout for one probe in seconds
    pub probe_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: health_constants::REFRESH_INTERVAL_SECS,
            probe_enabled: true,
            probe_timeout_secs: health_constants::PROBE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    /// Share in-flight executions and cache completed results
    pub enabled: bool,
    /// Seconds a completed result stays cached; also bounds an in-flight entry
    pub ttl_secs: u64,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: dedup_constants::RESULT_TTL_SECS,
        }
    }
}

// =============================================================================
// Policy Settings
// =============================================================================

/// Where the gating policy comes from.
///
/// With `path` unset, the inline fields below are the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// External policy document (TOML or YAML)
    pub path: Option<PathBuf>,
    pub min_healthy_providers: usize,
    pub required_providers: Vec<String>,
    pub exclude_used_models_from_synthesis: bool,
    pub model_priority: Vec<String>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            path: None,
            min_healthy_providers: 1,
            required_providers: Vec::new(),
            exclude_used_models_from_synthesis: true,
            model_priority: Vec::new(),
        }
    }
}

// =============================================================================
// Model Endpoints
// =============================================================================

/// Adapter implementation for a model endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// OpenAI Chat Completions or any compatible gateway
    #[default]
    Openai,
    /// Local Ollama server
    Ollama,
}

/// Configuration for one (provider, model) pair
///
/// API keys are never serialized. `api_key_env` names an environment
/// variable to read the key from when `api_key` is absent.
#[derive(Clone, Serialize, Deserialize)]
pub struct ModelEndpointConfig {
    /// Model id used by the pipeline (defaults to "provider/model")
    #[serde(default)]
    pub id: Option<String>,
    /// Provider organisation name ("openai", "anthropic", ...)
    pub provider: String,
    /// Adapter implementation
    #[serde(default)]
    pub kind: AdapterKind,
    /// Provider-side model name
    pub model: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// HTTP client timeout in seconds
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub role: ModelRole,
}

fn default_endpoint_timeout() -> u64 {
    net_constants::DEFAULT_TIMEOUT_SECS
}

impl ModelEndpointConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: None,
            provider: provider.into(),
            kind: AdapterKind::default(),
            model: model.into(),
            api_base: None,
            api_key: None,
            api_key_env: None,
            timeout_secs: default_endpoint_timeout(),
            role: ModelRole::default(),
        }
    }

    /// Pipeline model id
    pub fn resolved_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.provider, self.model))
    }

    /// API key from config or from the named environment variable
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_ref()
                .and_then(|name| std::env::var(name).ok())
        })
    }
}

impl std::fmt::Debug for ModelEndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEndpointConfig")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .field("timeout_secs", &self.timeout_secs)
            .field("role", &self.role)
            .finish()
    }
}
