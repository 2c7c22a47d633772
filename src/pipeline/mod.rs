//! Multi-Stage Consensus Pipeline
//!
//! Sequences one request through three stages:
//!
//! ```text
//! Init → Initial → (PeerReview | SkipPeerReview) → Synthesis → Done
//! ```
//!
//! - **Initial**: every selected panel model answers the prompt
//! - **PeerReview**: runs when enough Initial calls succeeded; each model
//!   revises its answer after reading the other models' answers
//! - **Synthesis**: one model, not used in Initial when the policy says
//!   so, combines the latest answers into the final text
//!
//! ## Components
//!
//! - `selector`: health- and breaker-aware model choice per stage
//! - `stage`: bounded parallel dispatch with timeout and retry
//! - `health`: provider health snapshot and background probes
//! - `policy`: hot-reloadable gating policy
//! - `dedup`: single execution per request fingerprint

pub mod dedup;
pub mod health;
pub mod policy;
pub mod prompts;
pub mod selector;
pub mod stage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use dedup::{DedupCache, DedupStats, fingerprint};
pub use health::{HealthSnapshot, ProbeStatus, ProviderHealthManager, ProviderHealthRecord};
pub use policy::{FilePolicySource, GatingPolicy, PolicyService, PolicySource, StaticPolicySource};
pub use selector::{ModelCandidate, ModelSelector};
pub use stage::StageExecutor;
pub use types::{
    CallOutcome, ModelOutcome, PipelineFailure, PipelineRequest, PipelineResult, PipelineStatus,
    StageRequest, StageResult, SubmitOptions,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::ai::provider::{
    AdapterRegistry, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    GenerationParams,
};
use crate::config::{Config, HealthSettings, PipelineSettings};
use crate::types::{
    ErrorCategory, GatingError, GatingReason, ModelId, ProviderError, Result, StageKind,
    ValidationError,
};

// =============================================================================
// Controller
// =============================================================================

struct ControllerInner {
    settings: PipelineSettings,
    adapters: Arc<AdapterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<ProviderHealthManager>,
    policy: Arc<PolicyService>,
    selector: ModelSelector,
    executor: StageExecutor,
    dedup: Option<DedupCache>,
    shutdown: CancellationToken,
}

/// Entry point for prompt submissions. Cheap to clone.
#[derive(Clone)]
pub struct PipelineController {
    inner: Arc<ControllerInner>,
}

/// Validated, fully resolved request
struct RunPlan {
    prompt: String,
    pool: Vec<ModelId>,
    policy: Arc<GatingPolicy>,
    deadline: Duration,
    timeout_per_call: Duration,
    max_concurrency: usize,
    peer_review_min_successes: usize,
    bypass_cache: bool,
}

impl PipelineController {
    pub fn builder(adapters: AdapterRegistry) -> PipelineControllerBuilder {
        PipelineControllerBuilder::new(adapters)
    }

    /// Build adapters, breakers, health, policy and dedup from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let adapters = AdapterRegistry::from_config(config)?;
        let mut builder = Self::builder(adapters)
            .with_settings(config.pipeline.clone())
            .with_breaker_config(CircuitBreakerConfig::from(&config.breaker))
            .with_health_settings(config.health.clone())
            .with_policy(PolicyService::from_settings(&config.policy));
        builder = if config.dedup.enabled {
            builder.with_dedup_ttl(Duration::from_secs(config.dedup.ttl_secs))
        } else {
            builder.without_dedup()
        };
        Ok(builder.build())
    }

    /// Run the pipeline for one request.
    ///
    /// `Err` is reserved for requests rejected before any network call
    /// (`ConcordError::Validation`). Gating refusals and model failures come
    /// back as a `PipelineResult` with status `Error` or `PartialSuccess`.
    #[instrument(skip(self, request), fields(hints = request.model_hints.len()))]
    pub async fn submit(&self, request: PipelineRequest) -> Result<Arc<PipelineResult>> {
        let plan = self.inner.plan(request)?;

        match &self.inner.dedup {
            Some(cache) if !plan.bypass_cache => {
                let key = fingerprint(&plan.prompt, &plan.pool, plan.policy.version);
                let inner = Arc::clone(&self.inner);
                Ok(cache
                    .get_or_create(&key, move || async move { inner.execute(plan).await })
                    .await)
            }
            _ => Ok(Arc::new(self.inner.execute(plan).await)),
        }
    }

    /// Convenience wrapper for a prompt with optional model hints
    pub async fn ask(&self, prompt: &str, models: &[ModelId]) -> Result<Arc<PipelineResult>> {
        self.submit(PipelineRequest::new(prompt).with_models(models.iter().cloned()))
            .await
    }

    /// Current per-provider health, without network I/O
    pub fn health_summary(&self) -> BTreeMap<String, ProviderHealthRecord> {
        self.inner.health.snapshot().records
    }

    /// Probe every provider now
    pub async fn refresh_health(&self) -> BTreeMap<String, ProviderHealthRecord> {
        self.inner.health.force_refresh().await.records
    }

    /// Reload the gating policy. Returns the active version.
    pub fn reload_policy(&self) -> Result<u64> {
        self.inner.policy.reload()
    }

    pub fn policy(&self) -> Arc<GatingPolicy> {
        self.inner.policy.current()
    }

    pub fn policy_source(&self) -> String {
        self.inner.policy.source()
    }

    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        self.inner.breakers.all_stats()
    }

    pub fn dedup_stats(&self) -> Option<DedupStats> {
        self.inner.dedup.as_ref().map(DedupCache::stats)
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.inner.adapters
    }

    /// Start background health refresh
    pub fn start(&self) {
        self.inner.health.start();
    }

    /// Stop background work and cancel in-flight requests
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.health.close();
        info!("Pipeline controller closed");
    }
}

impl ControllerInner {
    fn plan(&self, request: PipelineRequest) -> Result<RunPlan> {
        if request.prompt.trim().is_empty() {
            return Err(ValidationError::empty_prompt().into());
        }
        request.options.validate()?;

        let pool: Vec<ModelId> = if request.model_hints.is_empty() {
            self.adapters.panel_ids().into_iter().collect()
        } else {
            let mut seen = BTreeSet::new();
            let mut pool = Vec::with_capacity(request.model_hints.len());
            for hint in request.model_hints {
                let Some(registered) = self.adapters.get(&hint) else {
                    return Err(ValidationError::unknown_model(&hint).into());
                };
                if !registered.role.serves_panel() {
                    return Err(ValidationError::not_panel_model(&hint).into());
                }
                if seen.insert(hint.clone()) {
                    pool.push(hint);
                }
            }
            pool
        };

        if pool.is_empty() {
            return Err(ValidationError::no_candidates().into());
        }

        let options = request.options;
        Ok(RunPlan {
            prompt: request.prompt,
            pool,
            policy: self.policy.current(),
            deadline: options
                .deadline
                .unwrap_or_else(|| self.settings.request_deadline()),
            timeout_per_call: options
                .timeout_per_call
                .unwrap_or_else(|| self.settings.timeout_per_call()),
            max_concurrency: options
                .max_concurrency
                .unwrap_or(self.settings.max_concurrency),
            peer_review_min_successes: options
                .peer_review_min_successes
                .unwrap_or(self.settings.peer_review_min_successes),
            bypass_cache: options.bypass_cache,
        })
    }

    fn candidates<'a>(&self, ids: impl IntoIterator<Item = &'a ModelId>) -> Vec<ModelCandidate> {
        ids.into_iter()
            .filter_map(|id| {
                self.adapters
                    .provider_of(id)
                    .map(|provider| ModelCandidate::new(id.clone(), provider))
            })
            .collect()
    }

    fn stage_request(&self, plan: &RunPlan, stage: StageKind, models: Vec<ModelId>) -> StageRequest {
        StageRequest::new(stage, plan.prompt.clone(), models)
            .with_timeout(plan.timeout_per_call)
            .with_max_concurrency(plan.max_concurrency)
    }

    async fn execute(&self, plan: RunPlan) -> PipelineResult {
        let mut run = RunState::new(plan.policy.version);
        info!(
            request_id = %run.request_id,
            candidates = plan.pool.len(),
            policy_version = plan.policy.version,
            "Pipeline started"
        );

        let deadline = self.shutdown.child_token();
        let _deadline_guard = deadline.clone().drop_guard();
        spawn_deadline(deadline.clone(), plan.deadline);

        let no_models = BTreeSet::new();

        // ---------------------------------------------------------------------
        // Initial
        // ---------------------------------------------------------------------
        let snapshot = self.health.snapshot();
        let initial_models = match self.selector.select_for_stage(
            StageKind::Initial,
            &self.candidates(&plan.pool),
            &snapshot,
            &plan.policy,
            &no_models,
        ) {
            Ok(models) => models,
            Err(error) => return run.refused(error),
        };

        // Refuse before spending calls if Synthesis could never run
        let planned: BTreeSet<ModelId> = initial_models.iter().cloned().collect();
        let synthesis_pool = self.candidates(&self.adapters.synthesis_ids());
        if let Err(error) = self.selector.select_for_stage(
            StageKind::Synthesis,
            &synthesis_pool,
            &snapshot,
            &plan.policy,
            &planned,
        ) {
            return run.refused(error);
        }

        let initial = self
            .executor
            .run(
                &self.stage_request(&plan, StageKind::Initial, initial_models),
                &deadline,
            )
            .await;
        let initial_outputs = initial.outputs();
        let already_used = initial.attempted.clone();
        let initial_successes = initial.success_count();
        run.push(initial);

        if deadline.is_cancelled() {
            return run.deadline_exceeded(StageKind::Initial);
        }
        if initial_successes == 0 {
            return run.finish(
                PipelineStatus::Error,
                None,
                Some(PipelineFailure::NoInitialSuccess),
            );
        }

        // ---------------------------------------------------------------------
        // Peer Review
        // ---------------------------------------------------------------------
        let mut synthesis_inputs = initial_outputs.clone();

        if initial_successes >= plan.peer_review_min_successes {
            let reviewers = self.selector.select_for_stage(
                StageKind::PeerReview,
                &self.candidates(initial_outputs.keys()),
                &self.health.snapshot(),
                &plan.policy,
                &no_models,
            );

            match reviewers {
                Ok(reviewers) => {
                    let request = self
                        .stage_request(&plan, StageKind::PeerReview, reviewers)
                        .with_prior_outputs(initial_outputs);
                    let review = self.executor.run(&request, &deadline).await;
                    if review.has_success() {
                        synthesis_inputs = review.outputs();
                    } else {
                        warn!(
                            request_id = %run.request_id,
                            "Peer review produced no answers, synthesizing initial outputs"
                        );
                    }
                    run.push(review);

                    if deadline.is_cancelled() {
                        return run.deadline_exceeded(StageKind::PeerReview);
                    }
                }
                Err(error) if error.reason == GatingReason::NoEligibleModel => {
                    info!(
                        request_id = %run.request_id,
                        "Peer review skipped, no eligible reviewers"
                    );
                }
                Err(error) => return run.refused(error),
            }
        } else {
            info!(
                request_id = %run.request_id,
                successes = initial_successes,
                required = plan.peer_review_min_successes,
                "Peer review skipped"
            );
        }

        // ---------------------------------------------------------------------
        // Synthesis
        // ---------------------------------------------------------------------
        let synthesizer = match self.selector.select_for_stage(
            StageKind::Synthesis,
            &synthesis_pool,
            &self.health.snapshot(),
            &plan.policy,
            &already_used,
        ) {
            Ok(mut models) => match models.pop() {
                Some(model) => model,
                None => return run.refused(GatingError::no_eligible_model(StageKind::Synthesis)),
            },
            Err(error) => return run.refused(error),
        };

        let request = self
            .stage_request(&plan, StageKind::Synthesis, vec![synthesizer.clone()])
            .with_prior_outputs(synthesis_inputs);
        let synthesis = self.executor.run(&request, &deadline).await;
        let outcome = synthesis.per_model.get(&synthesizer).cloned();
        run.push(synthesis);

        if deadline.is_cancelled() {
            return run.deadline_exceeded(StageKind::Synthesis);
        }

        match outcome {
            Some(ModelOutcome {
                outcome: CallOutcome::Succeeded { text },
                ..
            }) => run.finish(PipelineStatus::Success, Some((synthesizer, text)), None),
            Some(ModelOutcome {
                outcome: CallOutcome::Failed { error },
                ..
            }) => run.finish(
                PipelineStatus::PartialSuccess,
                None,
                Some(PipelineFailure::SynthesisFailed {
                    model: synthesizer,
                    error,
                }),
            ),
            None => run.finish(
                PipelineStatus::PartialSuccess,
                None,
                Some(PipelineFailure::SynthesisFailed {
                    model: synthesizer,
                    error: ProviderError::new(ErrorCategory::Unknown, "no synthesis outcome"),
                }),
            ),
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        // The refresh task holds its own Arc to the health manager
        self.shutdown.cancel();
        self.health.close();
    }
}

/// Cancel `token` once `deadline` elapses, unless it is cancelled first
fn spawn_deadline(token: CancellationToken, deadline: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "Request deadline reached");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}

/// Accumulates stage results for one execution
struct RunState {
    request_id: String,
    started: Instant,
    policy_version: u64,
    stages: Vec<StageResult>,
}

impl RunState {
    fn new(policy_version: u64) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            policy_version,
            stages: Vec::new(),
        }
    }

    fn push(&mut self, stage: StageResult) {
        self.stages.push(stage);
    }

    fn refused(self, error: GatingError) -> PipelineResult {
        warn!(
            request_id = %self.request_id,
            stage = %error.stage,
            missing = ?error.missing_providers,
            "Pipeline refused: {}",
            error
        );
        self.finish(
            PipelineStatus::Error,
            None,
            Some(PipelineFailure::Gating { error }),
        )
    }

    fn deadline_exceeded(self, stage: StageKind) -> PipelineResult {
        let status = if self.stages.iter().any(StageResult::has_success) {
            PipelineStatus::PartialSuccess
        } else {
            PipelineStatus::Error
        };
        self.finish(status, None, Some(PipelineFailure::DeadlineExceeded { stage }))
    }

    fn finish(
        self,
        status: PipelineStatus,
        synthesis: Option<(ModelId, String)>,
        failure: Option<PipelineFailure>,
    ) -> PipelineResult {
        let models_used = self
            .stages
            .iter()
            .flat_map(|stage| stage.attempted.iter().cloned())
            .collect();
        let (synthesis_model, synthesis) = match synthesis {
            Some((model, text)) => (Some(model), Some(text)),
            None => (None, None),
        };

        let result = PipelineResult {
            request_id: self.request_id,
            status,
            stages: self.stages,
            synthesis,
            synthesis_model,
            models_used,
            total_elapsed: self.started.elapsed(),
            policy_version: self.policy_version,
            failure,
        };

        info!(
            request_id = %result.request_id,
            status = %result.status,
            stages = result.stages.len(),
            models_used = result.models_used.len(),
            elapsed_ms = result.total_elapsed.as_millis() as u64,
            "Pipeline finished"
        );

        result
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct PipelineControllerBuilder {
    adapters: AdapterRegistry,
    settings: PipelineSettings,
    breaker: CircuitBreakerConfig,
    health: HealthSettings,
    policy: Option<PolicyService>,
    dedup_ttl: Option<Duration>,
}

impl PipelineControllerBuilder {
    fn new(adapters: AdapterRegistry) -> Self {
        Self {
            adapters,
            settings: PipelineSettings::default(),
            breaker: CircuitBreakerConfig::default(),
            health: HealthSettings::default(),
            policy: None,
            dedup_ttl: Some(Duration::from_secs(
                crate::constants::dedup::RESULT_TTL_SECS,
            )),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    pub fn with_health_settings(mut self, settings: HealthSettings) -> Self {
        self.health = settings;
        self
    }

    pub fn with_policy(mut self, policy: PolicyService) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = Some(ttl);
        self
    }

    pub fn without_dedup(mut self) -> Self {
        self.dedup_ttl = None;
        self
    }

    pub fn build(self) -> PipelineController {
        let adapters = Arc::new(self.adapters);
        let breakers = Arc::new(CircuitBreakerRegistry::new(self.breaker));
        let health = Arc::new(ProviderHealthManager::new(
            Arc::clone(&breakers),
            adapters.probe_targets(),
            &self.health,
        ));
        let policy = Arc::new(
            self.policy
                .unwrap_or_else(|| PolicyService::fixed(GatingPolicy::default())),
        );
        let executor = StageExecutor::new(Arc::clone(&adapters), Arc::clone(&breakers))
            .with_params(GenerationParams::from(&self.settings))
            .with_retry_delay(self.settings.retry_delay());

        PipelineController {
            inner: Arc::new(ControllerInner {
                selector: ModelSelector::new(Arc::clone(&breakers)),
                executor,
                settings: self.settings,
                adapters,
                breakers,
                health,
                policy,
                dedup: self.dedup_ttl.map(DedupCache::new),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::ScriptedAdapter;
    use crate::types::{ConcordError, ErrorCategory, ModelRole, ValidationErrorKind};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        controller: PipelineController,
        calls: BTreeMap<String, Arc<AtomicUsize>>,
        prompts: BTreeMap<String, Arc<Mutex<Vec<String>>>>,
    }

    impl Harness {
        fn calls(&self, id: &str) -> usize {
            self.calls[id].load(Ordering::SeqCst)
        }

        fn total_calls(&self) -> usize {
            self.calls.values().map(|c| c.load(Ordering::SeqCst)).sum()
        }

        fn prompts(&self, id: &str) -> Vec<String> {
            self.prompts[id].lock().unwrap().clone()
        }
    }

    fn build(
        models: Vec<(&str, ModelRole, ScriptedAdapter)>,
        policy: PolicyService,
        configure: impl FnOnce(PipelineControllerBuilder) -> PipelineControllerBuilder,
    ) -> Harness {
        let mut registry = AdapterRegistry::new();
        let mut calls = BTreeMap::new();
        let mut prompts = BTreeMap::new();
        for (id, role, adapter) in models {
            calls.insert(id.to_string(), adapter.call_counter());
            prompts.insert(id.to_string(), adapter.prompt_log());
            registry
                .register(ModelId::from(id), role, Arc::new(adapter))
                .unwrap();
        }

        let builder = PipelineController::builder(registry)
            .with_settings(PipelineSettings {
                retry_delay_ms: 1,
                ..Default::default()
            })
            .with_health_settings(HealthSettings {
                probe_enabled: false,
                ..Default::default()
            })
            .with_policy(policy);

        Harness {
            controller: configure(builder).build(),
            calls,
            prompts,
        }
    }

    /// A, B, C panel models on three providers plus synthesizer D
    fn panel_of_four() -> Vec<(&'static str, ModelRole, ScriptedAdapter)> {
        vec![
            ("A", ModelRole::Any, ScriptedAdapter::replying("openai", "a", "A says 2")),
            ("B", ModelRole::Any, ScriptedAdapter::replying("anthropic", "b", "B says 2")),
            ("C", ModelRole::Any, ScriptedAdapter::replying("google", "c", "C says 2")),
            (
                "D",
                ModelRole::Synthesizer,
                ScriptedAdapter::replying("mistral", "d", "1+1 = 2"),
            ),
        ]
    }

    fn default_policy() -> PolicyService {
        PolicyService::fixed(GatingPolicy::default())
    }

    fn ids(models: &[&str]) -> BTreeSet<ModelId> {
        models.iter().map(|m| ModelId::from(*m)).collect()
    }

    #[tokio::test]
    async fn test_end_to_end_with_peer_review() {
        let harness = build(panel_of_four(), default_policy(), |b| b);

        let result = harness
            .controller
            .submit(PipelineRequest::new("What is 1+1?").with_models(["A", "B", "C"]))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Success);
        assert_eq!(result.synthesis.as_deref(), Some("1+1 = 2"));
        assert_eq!(result.synthesis_model, Some(ModelId::from("D")));
        assert_eq!(result.models_used, ids(&["A", "B", "C", "D"]));
        assert!(result.failure.is_none());

        let kinds: Vec<_> = result.stages.iter().map(|s| s.stage).collect();
        assert_eq!(
            kinds,
            vec![StageKind::Initial, StageKind::PeerReview, StageKind::Synthesis]
        );

        let review_prompt = &harness.prompts("A")[1];
        let (own, peers) = review_prompt.split_once("# Peer Responses").unwrap();
        assert!(own.contains("A says 2"));
        assert!(peers.contains("## Response from B\n\nB says 2"));
        assert!(peers.contains("## Response from C\n\nC says 2"));
        assert!(!peers.contains("A says 2"));

        let synthesis_prompt = &harness.prompts("D")[0];
        for model in ["A", "B", "C"] {
            assert!(synthesis_prompt.contains(&format!("## Response from {}", model)));
        }
        assert_eq!(harness.calls("D"), 1);
    }

    #[tokio::test]
    async fn test_peer_review_skipped_below_threshold() {
        let mut models = panel_of_four();
        models[2].2 = ScriptedAdapter::failing("google", "c", ErrorCategory::Auth);
        let harness = build(models, default_policy(), |b| b);

        let result = harness
            .controller
            .submit(PipelineRequest::new("What is 1+1?").with_models(["A", "B", "C"]))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Success);
        assert!(!result.peer_review_ran());
        assert_eq!(result.stages.len(), 2);
        assert_eq!(harness.calls("A"), 1);

        let synthesis_prompt = &harness.prompts("D")[0];
        assert!(synthesis_prompt.contains("## Response from A\n\nA says 2"));
        assert!(synthesis_prompt.contains("## Response from B\n\nB says 2"));
        assert!(!synthesis_prompt.contains("Response from C"));
        assert_eq!(result.models_used, ids(&["A", "B", "C", "D"]));
    }

    #[tokio::test]
    async fn test_synthesis_uses_initial_outputs_when_review_fails() {
        let mut models = panel_of_four();
        for (i, (_, _, adapter)) in models.iter_mut().take(3).enumerate() {
            let provider = ["openai", "anthropic", "google"][i];
            *adapter = ScriptedAdapter::failing(provider, "m", ErrorCategory::Malformed)
                .with_script(vec![Ok("initial answer")]);
        }
        let harness = build(models, default_policy(), |b| b);

        let result = harness
            .controller
            .submit(PipelineRequest::new("q").with_models(["A", "B", "C"]))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Success);
        let review = result.stage(StageKind::PeerReview).unwrap();
        assert!(review.succeeded.is_empty());
        assert!(harness.prompts("D")[0].contains("initial answer"));
    }

    #[tokio::test]
    async fn test_gating_refuses_without_network_calls() {
        let mut models = panel_of_four();
        models[2].2 = ScriptedAdapter::replying("google", "c", "C says 2").with_failing_probe();
        let policy = GatingPolicy::default().with_required_providers(["openai", "anthropic", "google"]);
        let harness = build(models, PolicyService::fixed(policy), |b| {
            b.with_health_settings(HealthSettings {
                probe_enabled: true,
                ..Default::default()
            })
        });

        let health = harness.controller.refresh_health().await;
        assert!(!health["google"].healthy);

        let result = harness
            .controller
            .submit(PipelineRequest::new("What is 1+1?").with_models(["A", "B", "C"]))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::Error);
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.missing_providers(), ["google".to_string()]);
        assert!(matches!(failure, PipelineFailure::Gating { .. }));
        assert!(result.stages.is_empty());
        assert!(result.models_used.is_empty());
        assert_eq!(harness.total_calls(), 0);
        assert_eq!(result.http_status(), 503);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_share_one_execution() {
        let models = panel_of_four()
            .into_iter()
            .map(|(id, role, adapter)| (id, role, adapter.with_delay(Duration::from_millis(20))))
            .collect();
        let harness = build(models, default_policy(), |b| b);

        let request = || PipelineRequest::new("What is 1+1?").with_models(["A", "B", "C"]);
        let (first, second) = tokio::join!(
            harness.controller.submit(request()),
            harness.controller.submit(request()),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.request_id, second.request_id);
        assert_eq!(harness.calls("A"), 2);
        assert_eq!(harness.calls("D"), 1);

        let stats = harness.controller.dedup_stats().unwrap();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_abandoned_submit_completes_and_serves_later_duplicate() {
        let models = panel_of_four()
            .into_iter()
            .map(|(id, role, adapter)| (id, role, adapter.with_delay(Duration::from_millis(40))))
            .collect();
        let harness = build(models, default_policy(), |b| b);

        let request = || {
            PipelineRequest::new("What is 1+1?")
                .with_models(["A", "B", "C"])
                .with_options(SubmitOptions::default().with_deadline(Duration::from_secs(2)))
        };
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), harness.controller.submit(request()))
                .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let stats = harness.controller.dedup_stats().unwrap();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.cached, 1);

        let later = harness.controller.submit(request()).await.unwrap();
        assert_eq!(later.status, PipelineStatus::Success);
        assert!(later.failure.is_none());
        assert_eq!(harness.calls("D"), 1);

        let stats = harness.controller.dedup_stats().unwrap();
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_bypass_cache_executes_again() {
        let harness = build(panel_of_four(), default_policy(), |b| b);
        let request = || {
            PipelineRequest::new("What is 1+1?")
                .with_models(["A", "B", "C"])
                .with_options(SubmitOptions::default().bypass_cache())
        };

        let first = harness.controller.submit(request()).await.unwrap();
        let second = harness.controller.submit(request()).await.unwrap();
        assert_ne!(first.request_id, second.request_id);
        assert_eq!(harness.calls("D"), 2);
    }

    #[tokio::test]
    async fn test_policy_reload_invalidates_cached_result() {
        let source = Arc::new(StaticPolicySource::new(GatingPolicy::default()));
        let harness = build(panel_of_four(), PolicyService::new(source.clone()), |b| b);

        let first = harness.controller.ask("What is 1+1?", &[]).await.unwrap();
        let cached = harness.controller.ask("What is 1+1?", &[]).await.unwrap();
        assert_eq!(first.request_id, cached.request_id);

        source.set(GatingPolicy::default().with_label("v2"));
        assert_eq!(harness.controller.reload_policy().unwrap(), 2);

        let fresh = harness.controller.ask("What is 1+1?", &[]).await.unwrap();
        assert_ne!(first.request_id, fresh.request_id);
        assert_eq!(fresh.policy_version, 2);
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_partial_success() {
        let mut models = panel_of_four();
        models[3].2 = ScriptedAdapter::failing("mistral", "d", ErrorCategory::Auth);
        let harness = build(models, default_policy(), |b| b);

        let result = harness.controller.ask("What is 1+1?", &[]).await.unwrap();

        assert_eq!(result.status, PipelineStatus::PartialSuccess);
        assert!(result.synthesis.is_none());
        match result.failure.as_ref().unwrap() {
            PipelineFailure::SynthesisFailed { model, error } => {
                assert_eq!(model, &ModelId::from("D"));
                assert_eq!(error.category, ErrorCategory::Auth);
            }
            other => panic!("unexpected failure: {:?}", other),
        }
        assert_eq!(result.http_status(), 200);
    }

    #[tokio::test]
    async fn test_no_initial_success_is_error() {
        let models = vec![
            ("A", ModelRole::Panel, ScriptedAdapter::failing("openai", "a", ErrorCategory::Auth)),
            ("D", ModelRole::Synthesizer, ScriptedAdapter::replying("mistral", "d", "x")),
        ];
        let harness = build(models, default_policy(), |b| b);

        let result = harness.controller.ask("q", &[]).await.unwrap();
        assert_eq!(result.status, PipelineStatus::Error);
        assert_eq!(result.failure, Some(PipelineFailure::NoInitialSuccess));
        assert!(result.synthesis.is_none());
        assert_eq!(harness.calls("D"), 0);
        assert_eq!(result.models_used, ids(&["A"]));
    }

    #[tokio::test]
    async fn test_synthesis_refused_before_calls_when_every_model_is_used() {
        let models = vec![
            ("A", ModelRole::Any, ScriptedAdapter::replying("openai", "a", "2")),
            ("B", ModelRole::Any, ScriptedAdapter::replying("anthropic", "b", "2")),
        ];
        let harness = build(models, default_policy(), |b| b);

        let result = harness.controller.ask("q", &[]).await.unwrap();
        assert_eq!(result.status, PipelineStatus::Error);
        match result.failure.as_ref().unwrap() {
            PipelineFailure::Gating { error } => {
                assert_eq!(error.stage, StageKind::Synthesis);
                assert_eq!(error.reason, GatingReason::NoEligibleModel);
            }
            other => panic!("unexpected failure: {:?}", other),
        }
        assert_eq!(harness.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_reuse_allowed_when_policy_permits() {
        let models = vec![
            ("A", ModelRole::Any, ScriptedAdapter::replying("openai", "a", "2")),
            ("B", ModelRole::Any, ScriptedAdapter::replying("anthropic", "b", "2")),
        ];
        let policy = GatingPolicy::default().with_exclude_used(false);
        let harness = build(models, PolicyService::fixed(policy), |b| b);

        let result = harness.controller.ask("q", &[]).await.unwrap();
        assert_eq!(result.status, PipelineStatus::Success);
        assert_eq!(result.synthesis_model, Some(ModelId::from("A")));
        assert_eq!(harness.calls("A"), 2);
    }

    #[tokio::test]
    async fn test_deadline_settles_quickly() {
        let models = panel_of_four()
            .into_iter()
            .map(|(id, role, adapter)| (id, role, adapter.with_delay(Duration::from_secs(5))))
            .collect();
        let harness = build(models, default_policy(), |b| b);

        let started = Instant::now();
        let result = harness
            .controller
            .submit(
                PipelineRequest::new("q").with_options(
                    SubmitOptions::default()
                        .with_deadline(Duration::from_millis(50))
                        .with_timeout_per_call(Duration::from_secs(10)),
                ),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status, PipelineStatus::Error);
        assert_eq!(
            result.failure,
            Some(PipelineFailure::DeadlineExceeded {
                stage: StageKind::Initial
            })
        );
        let initial = result.stage(StageKind::Initial).unwrap();
        assert_eq!(initial.attempted, ids(&["A", "B", "C"]));
        for (_, error) in initial.failures() {
            assert_eq!(error.category, ErrorCategory::Timeout);
        }
        assert!(harness
            .controller
            .breaker_stats()
            .iter()
            .all(|s| s.failure_count == 0));
    }

    #[tokio::test]
    async fn test_deadline_after_initial_is_partial_success() {
        let mut models = panel_of_four();
        models[3].2 = ScriptedAdapter::replying("mistral", "d", "late").with_delay(Duration::from_secs(5));
        let harness = build(models, default_policy(), |b| b);

        let result = harness
            .controller
            .submit(PipelineRequest::new("q").with_options(
                SubmitOptions::default().with_deadline(Duration::from_millis(100)),
            ))
            .await
            .unwrap();

        assert_eq!(result.status, PipelineStatus::PartialSuccess);
        assert_eq!(
            result.failure,
            Some(PipelineFailure::DeadlineExceeded {
                stage: StageKind::Synthesis
            })
        );
    }

    #[tokio::test]
    async fn test_validation_errors_are_returned_as_err() {
        let harness = build(panel_of_four(), default_policy(), |b| b);

        let err = harness.controller.ask("   ", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            ConcordError::Validation(ref v) if v.kind == ValidationErrorKind::EmptyPrompt
        ));

        let err = harness
            .controller
            .ask("q", &[ModelId::from("missing")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConcordError::Validation(ref v) if v.kind == ValidationErrorKind::UnknownModel
        ));

        let err = harness
            .controller
            .ask("q", &[ModelId::from("A"), ModelId::from("D")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConcordError::Validation(ref v) if v.kind == ValidationErrorKind::NotPanelModel
        ));
        assert_eq!(harness.total_calls(), 0);

        let empty = build(Vec::new(), default_policy(), |b| b);
        let err = empty.controller.ask("q", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            ConcordError::Validation(ref v) if v.kind == ValidationErrorKind::NoCandidates
        ));
    }

    #[tokio::test]
    async fn test_repeated_failures_open_breaker_across_requests() {
        let mut models = panel_of_four();
        models[0].2 = ScriptedAdapter::failing("openai", "a", ErrorCategory::Auth);
        let harness = build(models, default_policy(), |b| {
            b.with_breaker_config(CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            })
            .without_dedup()
        });

        for _ in 0..2 {
            harness.controller.ask("q", &[]).await.unwrap();
        }
        assert_eq!(harness.calls("A"), 2);
        assert!(!harness.controller.health_summary()["openai"].healthy);

        let result = harness.controller.ask("q", &[]).await.unwrap();
        assert_eq!(harness.calls("A"), 2);
        assert!(!result.stage(StageKind::Initial).unwrap().attempted.contains(&ModelId::from("A")));
        assert_eq!(result.status, PipelineStatus::Success);
    }

    #[tokio::test]
    async fn test_subset_invariant_for_every_stage() {
        let mut models = panel_of_four();
        models[1].2 = ScriptedAdapter::replying("anthropic", "b", "2")
            .with_script(vec![Ok("2"), Err(ErrorCategory::Malformed)]);
        let harness = build(models, default_policy(), |b| b);

        let result = harness.controller.ask("q", &[]).await.unwrap();
        let pool = ids(&["A", "B", "C", "D"]);
        for stage in &result.stages {
            let candidates: BTreeSet<_> = stage.per_model.keys().cloned().collect();
            assert!(stage.succeeded.is_subset(&stage.attempted));
            assert!(stage.attempted.is_subset(&candidates));
            assert!(candidates.is_subset(&pool));
        }
    }
}
