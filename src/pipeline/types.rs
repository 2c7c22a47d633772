//! Pipeline Data Model
//!
//! Stage requests and results, the final pipeline result and its failure
//! detail. Everything here is plain data: immutable once produced and
//! safe to share behind `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::stage as stage_constants;
use crate::types::{
    ErrorCategory, GatingError, ModelId, ProviderError, StageKind, ValidationError,
    ValidationErrorKind, duration_ms,
};

// =============================================================================
// Stage Request
// =============================================================================

/// Input for one stage. Created fresh per stage, never mutated after dispatch.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub original_prompt: String,
    pub stage: StageKind,
    /// Ordered, duplicate-free
    pub candidates: Vec<ModelId>,
    /// Outputs of the previous stage keyed by source model (empty for Initial)
    pub prior_outputs: BTreeMap<ModelId, String>,
    pub timeout_per_call: Duration,
    pub max_concurrency: usize,
}

impl StageRequest {
    pub fn new(
        stage: StageKind,
        original_prompt: impl Into<String>,
        candidates: impl IntoIterator<Item = ModelId>,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let candidates = candidates
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        Self {
            original_prompt: original_prompt.into(),
            stage,
            candidates,
            prior_outputs: BTreeMap::new(),
            timeout_per_call: Duration::from_secs(stage_constants::TIMEOUT_PER_CALL_SECS),
            max_concurrency: stage_constants::MAX_CONCURRENCY,
        }
    }

    pub fn with_prior_outputs(mut self, outputs: BTreeMap<ModelId, String>) -> Self {
        self.prior_outputs = outputs;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_call = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }
}

// =============================================================================
// Stage Result
// =============================================================================

/// What one model call produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    Succeeded { text: String },
    Failed { error: ProviderError },
}

/// Per-model record inside a stage result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutcome {
    #[serde(flatten)]
    pub outcome: CallOutcome,
    #[serde(with = "duration_ms", rename = "latency_ms")]
    pub latency: Duration,
    pub tokens_used: u32,
    /// Provider calls made, including the retry
    pub attempts: u32,
}

impl ModelOutcome {
    pub fn succeeded(text: impl Into<String>, latency: Duration, tokens_used: u32) -> Self {
        Self {
            outcome: CallOutcome::Succeeded { text: text.into() },
            latency,
            tokens_used,
            attempts: 1,
        }
    }

    pub fn failed(error: ProviderError, latency: Duration) -> Self {
        Self {
            outcome: CallOutcome::Failed { error },
            latency,
            tokens_used: 0,
            attempts: 1,
        }
    }

    /// Call that never reached the provider
    pub fn skipped(category: ErrorCategory, message: &str, provider: &str) -> Self {
        Self {
            outcome: CallOutcome::Failed {
                error: ProviderError::with_provider(category, message, provider),
            },
            latency: Duration::ZERO,
            tokens_used: 0,
            attempts: 0,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn text(&self) -> Option<&str> {
        match &self.outcome {
            CallOutcome::Succeeded { text } => Some(text),
            CallOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ProviderError> {
        match &self.outcome {
            CallOutcome::Succeeded { .. } => None,
            CallOutcome::Failed { error } => Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CallOutcome::Succeeded { .. })
    }
}

/// Output of one stage.
///
/// `succeeded ⊆ attempted ⊆ candidates`. Calls blocked by a breaker or
/// cancelled before dispatch appear in `per_model` but not in `attempted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub per_model: BTreeMap<ModelId, ModelOutcome>,
    pub succeeded: BTreeSet<ModelId>,
    pub attempted: BTreeSet<ModelId>,
    #[serde(with = "duration_ms", rename = "elapsed_ms")]
    pub elapsed: Duration,
}

impl StageResult {
    pub fn empty(stage: StageKind) -> Self {
        Self {
            stage,
            per_model: BTreeMap::new(),
            succeeded: BTreeSet::new(),
            attempted: BTreeSet::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Successful texts keyed by model
    pub fn outputs(&self) -> BTreeMap<ModelId, String> {
        self.per_model
            .iter()
            .filter_map(|(id, outcome)| outcome.text().map(|text| (id.clone(), text.to_string())))
            .collect()
    }

    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn has_success(&self) -> bool {
        !self.succeeded.is_empty()
    }

    pub fn tokens_used(&self) -> u64 {
        self.per_model.values().map(|o| u64::from(o.tokens_used)).sum()
    }

    /// Failures keyed by model
    pub fn failures(&self) -> impl Iterator<Item = (&ModelId, &ProviderError)> {
        self.per_model
            .iter()
            .filter_map(|(id, outcome)| outcome.error().map(|e| (id, e)))
    }
}

// =============================================================================
// Pipeline Result
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    PartialSuccess,
    Error,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::PartialSuccess => write!(f, "PARTIAL_SUCCESS"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Why a pipeline did not reach `Success`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineFailure {
    /// The selector refused a stage
    Gating { error: GatingError },
    /// Every Initial call failed
    NoInitialSuccess,
    /// The request deadline expired during `stage`
    DeadlineExceeded { stage: StageKind },
    /// The synthesis model failed
    SynthesisFailed {
        model: ModelId,
        error: ProviderError,
    },
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gating { error } => write!(f, "{}", error),
            Self::NoInitialSuccess => write!(f, "no model produced an initial answer"),
            Self::DeadlineExceeded { stage } => {
                write!(f, "request deadline exceeded during {} stage", stage)
            }
            Self::SynthesisFailed { model, error } => {
                write!(f, "synthesis by {} failed: {}", model, error)
            }
        }
    }
}

impl PipelineFailure {
    /// Required providers the failure names, if any
    pub fn missing_providers(&self) -> &[String] {
        match self {
            Self::Gating { error } => &error.missing_providers,
            _ => &[],
        }
    }
}

/// Aggregated result of one pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub request_id: String,
    pub status: PipelineStatus,
    /// Stages in execution order
    pub stages: Vec<StageResult>,
    pub synthesis: Option<String>,
    pub synthesis_model: Option<ModelId>,
    /// Union of every stage's attempted models
    pub models_used: BTreeSet<ModelId>,
    #[serde(with = "duration_ms", rename = "total_elapsed_ms")]
    pub total_elapsed: Duration,
    pub policy_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PipelineFailure>,
}

impl PipelineResult {
    pub fn stage(&self, kind: StageKind) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == kind)
    }

    pub fn peer_review_ran(&self) -> bool {
        self.stage(StageKind::PeerReview).is_some()
    }

    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Success
    }

    /// Whether the result may be reused for duplicate submissions
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self.status,
            PipelineStatus::Success | PipelineStatus::PartialSuccess
        )
    }

    pub fn tokens_used(&self) -> u64 {
        self.stages.iter().map(StageResult::tokens_used).sum()
    }

    /// Status code an HTTP layer would answer with
    pub fn http_status(&self) -> u16 {
        match self.status {
            PipelineStatus::Success | PipelineStatus::PartialSuccess => 200,
            PipelineStatus::Error => 503,
        }
    }
}

// =============================================================================
// Submit Options
// =============================================================================

/// Per-request overrides of the configured pipeline settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitOptions {
    /// Overall request deadline
    #[serde(skip)]
    pub deadline: Option<Duration>,
    #[serde(skip)]
    pub timeout_per_call: Option<Duration>,
    pub max_concurrency: Option<usize>,
    pub peer_review_min_successes: Option<usize>,
    /// Skip the dedup layer for this request
    pub bypass_cache: bool,
}

impl SubmitOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout_per_call(mut self, timeout: Duration) -> Self {
        self.timeout_per_call = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_peer_review_min_successes(mut self, min: usize) -> Self {
        self.peer_review_min_successes = Some(min);
        self
    }

    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.deadline.is_some_and(|d| d.is_zero()) {
            return Err(range_error("deadline", "must be greater than zero"));
        }
        if self.timeout_per_call.is_some_and(|d| d.is_zero()) {
            return Err(range_error("timeout_per_call", "must be greater than zero"));
        }
        if self.max_concurrency == Some(0) {
            return Err(range_error("max_concurrency", "must be at least 1"));
        }
        Ok(())
    }
}

fn range_error(field: &str, message: &str) -> ValidationError {
    ValidationError::new(ValidationErrorKind::Range, message).with_field(field)
}

/// A prompt submission with optional model hints
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub prompt: String,
    /// Restricts the Initial pool. Empty means every panel model.
    pub model_hints: Vec<ModelId>,
    pub options: SubmitOptions,
}

impl PipelineRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_models<I, M>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<ModelId>,
    {
        self.model_hints = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_options(mut self, options: SubmitOptions) -> Self {
        self.options = options;
        self
    }
}
