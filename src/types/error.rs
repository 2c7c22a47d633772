//! Unified Error Type System
//!
//! Centralized error types for the entire application.
//! Provides error classification for retry and circuit breaker decisions.
//!
//! ## Error Categories
//!
//! - **Timeout**: Call exceeded its timeout (never retried)
//! - **Network / Transient**: Connectivity or 5xx issues (retried once)
//! - **Auth / BadRequest / Malformed**: Provider rejected or garbled the call
//! - **CircuitOpen / Cancelled**: Call never reached the provider
//!
//! ## Taxonomy
//!
//! - `ProviderError`: per-model failure, recorded inside a stage result
//! - `GatingError`: pipeline refuses to run (required providers missing)
//! - `ValidationError`: request rejected before any network call
//! - `ConcordError`: application-level validation, config and system errors

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{ModelId, StageKind};

// =============================================================================
// Error Categories
// =============================================================================

/// Error categories for retry and breaker decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Call exceeded its timeout or the request deadline
    Timeout,
    /// Rate limited by the provider
    RateLimit,
    /// Authentication failed
    Auth,
    /// Network/connectivity issues
    Network,
    /// Temporary server issues (5xx, overloaded)
    Transient,
    /// Provider rejected the request
    BadRequest,
    /// Response could not be parsed or was empty
    Malformed,
    /// Provider or model not available
    Unavailable,
    /// Circuit breaker blocked the call
    CircuitOpen,
    /// Call was cancelled before dispatch
    Cancelled,
    /// Unknown error
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::RateLimit => write!(f, "RATE_LIMIT"),
            Self::Auth => write!(f, "AUTH"),
            Self::Network => write!(f, "NETWORK"),
            Self::Transient => write!(f, "TRANSIENT"),
            Self::BadRequest => write!(f, "BAD_REQUEST"),
            Self::Malformed => write!(f, "MALFORMED"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::CircuitOpen => write!(f, "CIRCUIT_OPEN"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl ErrorCategory {
    /// Transient network errors get a single retry. Timeouts never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Transient)
    }

    /// Whether a failure of this category counts against the provider's breaker.
    ///
    /// Calls that never reached the provider are not its fault.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, Self::CircuitOpen | Self::Cancelled)
    }
}

// =============================================================================
// Provider Error
// =============================================================================

/// Per-model provider call failure with category and provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    /// Error category for routing decisions
    pub category: ErrorCategory,
    /// Detailed error message
    pub message: String,
    /// Provider that produced the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(provider) = &self.provider {
            write!(f, "[{}:{}] {}", provider, self.category, self.message)
        } else {
            write!(f, "[{}] {}", self.category, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            provider: None,
        }
    }

    pub fn with_provider(
        category: ErrorCategory,
        message: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            provider: Some(provider.into()),
        }
    }

    /// Add provider context to existing error
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn timeout(provider: impl Into<String>, after: Duration) -> Self {
        Self::with_provider(
            ErrorCategory::Timeout,
            format!("call timed out after {:?}", after),
            provider,
        )
    }

    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_provider(ErrorCategory::Malformed, message, provider)
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    pub fn counts_against_breaker(&self) -> bool {
        self.category.counts_against_breaker()
    }
}

// =============================================================================
// Error Classifier
// =============================================================================

/// Maps transport failures, HTTP statuses and free text onto `ProviderError`
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify an error message from any provider
    pub fn classify(message: &str, provider: &str) -> ProviderError {
        let lower = message.to_lowercase();

        if lower.contains("timed out") || lower.contains("timeout") {
            return ProviderError::with_provider(ErrorCategory::Timeout, message, provider);
        }

        if lower.contains("rate limit")
            || lower.contains("429")
            || lower.contains("too many requests")
            || lower.contains("quota exceeded")
        {
            return ProviderError::with_provider(ErrorCategory::RateLimit, message, provider);
        }

        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("api key")
            || lower.contains("unauthorized")
            || lower.contains("permission denied")
        {
            return ProviderError::with_provider(ErrorCategory::Auth, message, provider);
        }

        if lower.contains("connection")
            || lower.contains("dns")
            || lower.contains("unreachable")
            || lower.contains("reset by peer")
        {
            return ProviderError::with_provider(ErrorCategory::Network, message, provider);
        }

        if lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
            || lower.contains("overloaded")
            || lower.contains("temporar")
        {
            return ProviderError::with_provider(ErrorCategory::Transient, message, provider);
        }

        if lower.contains("500") || lower.contains("internal error") {
            return ProviderError::with_provider(ErrorCategory::Transient, message, provider);
        }

        if lower.contains("not found") || lower.contains("unavailable") {
            return ProviderError::with_provider(ErrorCategory::Unavailable, message, provider);
        }

        if lower.contains("parse")
            || lower.contains("json")
            || lower.contains("malformed")
            || lower.contains("empty response")
        {
            return ProviderError::with_provider(ErrorCategory::Malformed, message, provider);
        }

        if lower.contains("400") || lower.contains("bad request") || lower.contains("invalid") {
            return ProviderError::with_provider(ErrorCategory::BadRequest, message, provider);
        }

        ProviderError::with_provider(ErrorCategory::Unknown, message, provider)
    }

    /// Classify HTTP status code directly (more accurate than string matching)
    pub fn classify_http_status(status: u16, message: &str, provider: &str) -> ProviderError {
        match status {
            429 => ProviderError::with_provider(ErrorCategory::RateLimit, message, provider),
            401 | 403 => ProviderError::with_provider(ErrorCategory::Auth, message, provider),
            400 | 422 => ProviderError::with_provider(ErrorCategory::BadRequest, message, provider),
            404 => ProviderError::with_provider(ErrorCategory::Unavailable, message, provider),
            408 => ProviderError::with_provider(ErrorCategory::Timeout, message, provider),
            500..=599 => ProviderError::with_provider(ErrorCategory::Transient, message, provider),
            _ => ProviderError::with_provider(ErrorCategory::Unknown, message, provider),
        }
    }

    /// Classify a transport-level `reqwest` error
    pub fn classify_reqwest(err: &reqwest::Error, provider: &str) -> ProviderError {
        let message = err.to_string();
        if err.is_timeout() {
            ProviderError::with_provider(ErrorCategory::Timeout, message, provider)
        } else if err.is_connect() || err.is_request() {
            ProviderError::with_provider(ErrorCategory::Network, message, provider)
        } else if err.is_decode() || err.is_body() {
            ProviderError::with_provider(ErrorCategory::Malformed, message, provider)
        } else if let Some(status) = err.status() {
            Self::classify_http_status(status.as_u16(), &message, provider)
        } else {
            Self::classify(&message, provider)
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Request rejected before any network call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// What validation failed
    pub kind: ValidationErrorKind,
    /// Field or component that failed validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Detailed message
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(field) = &self.field {
            write!(f, "Validation failed for '{}': {}", field, self.message)
        } else {
            write!(f, "Validation failed: {}", self.message)
        }
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: None,
            message: message.into(),
        }
    }

    /// Add field context
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn empty_prompt() -> Self {
        Self::new(ValidationErrorKind::EmptyPrompt, "prompt must not be empty")
            .with_field("prompt")
    }

    pub fn no_candidates() -> Self {
        Self::new(
            ValidationErrorKind::NoCandidates,
            "no candidate models are available for this request",
        )
        .with_field("models")
    }

    pub fn unknown_model(model: &ModelId) -> Self {
        Self::new(
            ValidationErrorKind::UnknownModel,
            format!("model '{}' is not registered", model),
        )
        .with_field("models")
    }

    pub fn not_panel_model(model: &ModelId) -> Self {
        Self::new(
            ValidationErrorKind::NotPanelModel,
            format!("model '{}' is registered for synthesis only", model),
        )
        .with_field("models")
    }
}

/// Validation error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    /// Prompt empty or whitespace only
    EmptyPrompt,
    /// No candidate models at all
    NoCandidates,
    /// Model hint names an unregistered model
    UnknownModel,
    /// Model hint names a synthesizer-only model
    NotPanelModel,
    /// Value out of range
    Range,
}

// =============================================================================
// Gating Error
// =============================================================================

/// Why the gating check refused to run a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatingReason {
    /// A required provider has no eligible model
    RequiredProvidersMissing,
    /// Fewer healthy providers than the policy minimum
    InsufficientHealthyProviders { required: usize, available: usize },
    /// No model is left to run the stage
    NoEligibleModel,
}

/// Pipeline-fatal gating failure
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("gating refused stage {stage}: {} (missing providers: [{}])", describe_reason(.reason), .missing_providers.join(", "))]
pub struct GatingError {
    pub stage: StageKind,
    pub reason: GatingReason,
    /// Required providers with no eligible model (sorted)
    pub missing_providers: Vec<String>,
}

fn describe_reason(reason: &GatingReason) -> String {
    match reason {
        GatingReason::RequiredProvidersMissing => "required providers unavailable".to_string(),
        GatingReason::InsufficientHealthyProviders {
            required,
            available,
        } => format!(
            "{} healthy providers available, policy requires {}",
            available, required
        ),
        GatingReason::NoEligibleModel => "no eligible model".to_string(),
    }
}

impl GatingError {
    pub fn missing(stage: StageKind, mut missing_providers: Vec<String>) -> Self {
        missing_providers.sort();
        missing_providers.dedup();
        Self {
            stage,
            reason: GatingReason::RequiredProvidersMissing,
            missing_providers,
        }
    }

    pub fn insufficient(stage: StageKind, required: usize, available: usize) -> Self {
        Self {
            stage,
            reason: GatingReason::InsufficientHealthyProviders {
                required,
                available,
            },
            missing_providers: Vec::new(),
        }
    }

    pub fn no_eligible_model(stage: StageKind) -> Self {
        Self {
            stage,
            reason: GatingReason::NoEligibleModel,
            missing_providers: Vec::new(),
        }
    }
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum ConcordError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    // -------------------------------------------------------------------------
    // Pipeline Errors
    // -------------------------------------------------------------------------
    #[error("{0}")]
    Validation(ValidationError),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Config error: {0}")]
    Config(String),

    #[error("Policy error: {0}")]
    Policy(String),
}

impl From<ValidationError> for ConcordError {
    fn from(err: ValidationError) -> Self {
        ConcordError::Validation(err)
    }
}

pub type Result<T> = std::result::Result<T, ConcordError>;

// =============================================================================
// Tests
// =============================================================================
