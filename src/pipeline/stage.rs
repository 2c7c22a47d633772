//! Stage Executor
//!
//! Dispatches one call per candidate concurrently (bounded by
//! `max_concurrency`), wraps each call in a timeout plus a single retry
//! for transient network errors, and feeds every settled call into the
//! provider's circuit breaker.
//!
//! ## Cancellation
//!
//! When the request token fires, calls not yet dispatched are recorded as
//! `Cancelled` (not attempted) and in-flight calls are dropped and
//! recorded as `Timeout` failures. Neither counts against the breaker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use backon::{ExponentialBuilder, Retryable};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::prompts::build_stage_prompt;
use super::types::{ModelOutcome, StageRequest, StageResult};
use crate::ai::provider::{
    AdapterRegistry, CircuitBreakerRegistry, GenerationParams, GenerationResult, SharedAdapter,
};
use crate::ai::timeout::with_call_timeout;
use crate::constants::stage as stage_constants;
use crate::types::{ErrorCategory, ModelId, ProviderError};

/// How one candidate settled
struct Settled {
    model: ModelId,
    outcome: ModelOutcome,
    attempted: bool,
}

pub struct StageExecutor {
    adapters: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    params: GenerationParams,
    retry_delay: Duration,
}

impl StageExecutor {
    pub fn new(adapters: Arc<AdapterRegistry>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            adapters,
            breakers,
            params: GenerationParams::default(),
            retry_delay: Duration::from_millis(stage_constants::RETRY_DELAY_MS),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Run every candidate once and settle. Never fails; all per-model
    /// failures are recorded in the result.
    #[instrument(skip_all, fields(stage = %request.stage, candidates = request.candidates.len()))]
    pub async fn run(&self, request: &StageRequest, cancel: &CancellationToken) -> StageResult {
        let started = Instant::now();
        let mut result = StageResult::empty(request.stage);

        let mut calls = futures::stream::iter(request.candidates.iter().cloned())
            .map(|model| self.call_model(request, model, cancel))
            .buffer_unordered(request.max_concurrency.max(1));

        while let Some(settled) = calls.next().await {
            if settled.attempted {
                result.attempted.insert(settled.model.clone());
            }
            if settled.outcome.is_success() {
                result.succeeded.insert(settled.model.clone());
            }
            result.per_model.insert(settled.model, settled.outcome);
        }

        result.elapsed = started.elapsed();

        info!(
            stage = %request.stage,
            attempted = result.attempted.len(),
            succeeded = result.succeeded.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Stage settled"
        );

        result
    }

    async fn call_model(
        &self,
        request: &StageRequest,
        model: ModelId,
        cancel: &CancellationToken,
    ) -> Settled {
        let Some(registered) = self.adapters.get(&model) else {
            return Settled {
                outcome: ModelOutcome::skipped(
                    ErrorCategory::Unavailable,
                    "model is not registered",
                    "unknown",
                ),
                model,
                attempted: false,
            };
        };
        let provider = registered.provider.as_str();

        if cancel.is_cancelled() {
            return Settled {
                outcome: ModelOutcome::skipped(
                    ErrorCategory::Cancelled,
                    "request deadline reached before dispatch",
                    provider,
                ),
                model,
                attempted: false,
            };
        }

        let breaker = self.breakers.breaker(provider);
        let Some(permit) = breaker.try_acquire() else {
            debug!(model = %model, provider = %provider, "Skipped, circuit open");
            return Settled {
                outcome: ModelOutcome::skipped(ErrorCategory::CircuitOpen, "circuit open", provider),
                model,
                attempted: false,
            };
        };
        if permit.is_probe() {
            debug!(model = %model, provider = %provider, "Dispatching half-open probe");
        }

        let prompt = build_stage_prompt(request, &model);
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let call = self.generate_with_retry(
            &registered.adapter,
            &prompt,
            request.timeout_per_call,
            &attempts,
        );

        // None when the request token fired first
        let settled = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = call => Some(result),
        };

        // Dropping the permit unsettled releases a held probe slot
        let outcome = match settled {
            None => {
                drop(permit);
                debug!(model = %model, provider = %provider, "In-flight call cancelled by deadline");
                ModelOutcome::failed(
                    ProviderError::with_provider(
                        ErrorCategory::Timeout,
                        "cancelled by request deadline",
                        provider,
                    ),
                    started.elapsed(),
                )
            }
            Some(Ok(generation)) => {
                permit.record_success();
                debug!(model = %model, provider = %provider, "Call succeeded");
                ModelOutcome::succeeded(
                    generation.text,
                    started.elapsed(),
                    generation.usage.total(),
                )
            }
            Some(Err(error)) => {
                if !error.counts_against_breaker() {
                    drop(permit);
                } else if permit.record_failure() {
                    warn!(provider = %provider, "Circuit opened after call failure");
                }
                warn!(model = %model, provider = %provider, "Call failed: {}", error);
                ModelOutcome::failed(error, started.elapsed())
            }
        };

        Settled {
            outcome: outcome.with_attempts(attempts.load(Ordering::SeqCst)),
            model,
            attempted: true,
        }
    }

    /// One call plus a single retry for Network/Transient errors
    async fn generate_with_retry(
        &self,
        adapter: &SharedAdapter,
        prompt: &str,
        timeout: Duration,
        attempts: &AtomicU32,
    ) -> Result<GenerationResult, ProviderError> {
        let provider = adapter.provider();
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry_delay)
            .with_max_times(stage_constants::MAX_RETRIES);

        let attempt = || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            with_call_timeout(timeout, adapter.generate(prompt, &self.params, timeout), provider)
                .await
        };

        attempt
            .retry(backoff)
            .when(|e: &ProviderError| e.is_retryable())
            .notify(|e: &ProviderError, delay: Duration| {
                debug!(provider = %provider, "Retrying after {:?}: {}", delay, e);
            })
            .await
    }
}
