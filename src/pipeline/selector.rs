//! Model Selector
//!
//! Chooses the models for a stage from a candidate pool under the active
//! gating policy. Selection is deterministic: declared priority order,
//! then lexical model id.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use super::health::HealthSnapshot;
use super::policy::GatingPolicy;
use crate::ai::provider::CircuitBreakerRegistry;
use crate::types::{GatingError, ModelId, StageKind};

/// A model and the provider that serves it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidate {
    pub id: ModelId,
    pub provider: String,
}

impl ModelCandidate {
    pub fn new(id: impl Into<ModelId>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
        }
    }
}

pub struct ModelSelector {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl ModelSelector {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { breakers }
    }

    /// Ordered models for `stage`, or the gating failure that stops it.
    ///
    /// - Keeps models whose provider is healthy and whose breaker would
    ///   admit a request. The breaker is only peeked, never reserved.
    /// - Synthesis drops `already_used` when the policy excludes them and
    ///   returns a single model.
    /// - Initial enforces `required_providers` and `min_healthy_providers`.
    /// - An empty result is `NoEligibleModel` for every stage.
    pub fn select_for_stage(
        &self,
        stage: StageKind,
        pool: &[ModelCandidate],
        health: &HealthSnapshot,
        policy: &GatingPolicy,
        already_used: &BTreeSet<ModelId>,
    ) -> Result<Vec<ModelId>, GatingError> {
        let mut eligible: Vec<&ModelCandidate> = pool
            .iter()
            .filter(|c| health.is_healthy(&c.provider) && self.breakers.would_allow(&c.provider))
            .collect();

        if stage == StageKind::Synthesis && policy.exclude_used_models_from_synthesis {
            eligible.retain(|c| !already_used.contains(&c.id));
        }

        eligible.sort_by(|a, b| {
            policy
                .priority_rank(&a.id)
                .cmp(&policy.priority_rank(&b.id))
                .then_with(|| a.id.cmp(&b.id))
        });
        eligible.dedup_by(|a, b| a.id == b.id);

        if stage == StageKind::Initial {
            let available: BTreeSet<&str> = eligible.iter().map(|c| c.provider.as_str()).collect();

            let missing: Vec<String> = policy
                .required_providers
                .iter()
                .filter(|p| !available.contains(p.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(GatingError::missing(stage, missing));
            }

            if available.len() < policy.min_healthy_providers {
                return Err(GatingError::insufficient(
                    stage,
                    policy.min_healthy_providers,
                    available.len(),
                ));
            }
        }

        if eligible.is_empty() {
            return Err(GatingError::no_eligible_model(stage));
        }

        let mut selected: Vec<ModelId> = eligible.into_iter().map(|c| c.id.clone()).collect();
        if stage == StageKind::Synthesis {
            selected.truncate(1);
        }

        debug!(
            stage = %stage,
            pool = pool.len(),
            selected = selected.len(),
            "Models selected"
        );

        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::CircuitBreakerConfig;
    use crate::types::GatingReason;
    use proptest::prelude::*;

    fn pool() -> Vec<ModelCandidate> {
        vec![
            ModelCandidate::new("openai/gpt-4o", "openai"),
            ModelCandidate::new("anthropic/claude", "anthropic"),
            ModelCandidate::new("google/gemini", "google"),
            ModelCandidate::new("openai/gpt-4o-mini", "openai"),
        ]
    }

    fn selector() -> ModelSelector {
        ModelSelector::new(Arc::new(CircuitBreakerRegistry::default()))
    }

    fn ids(models: &[&str]) -> Vec<ModelId> {
        models.iter().map(|m| ModelId::from(*m)).collect()
    }

    #[test]
    fn test_initial_selects_all_healthy_in_lexical_order() {
        let health = HealthSnapshot::all_healthy(["openai", "anthropic", "google"]);
        let selected = selector()
            .select_for_stage(
                StageKind::Initial,
                &pool(),
                &health,
                &GatingPolicy::default(),
                &BTreeSet::new(),
            )
            .unwrap();
        assert_eq!(
            selected,
            ids(&["anthropic/claude", "google/gemini", "openai/gpt-4o", "openai/gpt-4o-mini"])
        );
    }

    #[test]
    fn test_priority_order_wins_over_lexical() {
        let health = HealthSnapshot::all_healthy(["openai", "anthropic", "google"]);
        let policy = GatingPolicy::default().with_priority(["openai/gpt-4o-mini", "google/gemini"]);
        let selected = selector()
            .select_for_stage(StageKind::Initial, &pool(), &health, &policy, &BTreeSet::new())
            .unwrap();
        assert_eq!(
            selected,
            ids(&["openai/gpt-4o-mini", "google/gemini", "anthropic/claude", "openai/gpt-4o"])
        );
    }

    #[test]
    fn test_unhealthy_and_open_providers_filtered() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        }));
        breakers.record_failure("anthropic");
        let selector = ModelSelector::new(breakers);

        let health = HealthSnapshot::all_healthy(["openai", "anthropic"]);
        let selected = selector
            .select_for_stage(
                StageKind::Initial,
                &pool(),
                &health,
                &GatingPolicy::default(),
                &BTreeSet::new(),
            )
            .unwrap();
        assert_eq!(selected, ids(&["openai/gpt-4o", "openai/gpt-4o-mini"]));
    }

    #[test]
    fn test_missing_required_provider_fails_fast() {
        let health = HealthSnapshot::all_healthy(["openai", "anthropic"]);
        let policy = GatingPolicy::default().with_required_providers(["openai", "anthropic", "google"]);
        let err = selector()
            .select_for_stage(StageKind::Initial, &pool(), &health, &policy, &BTreeSet::new())
            .unwrap_err();
        assert_eq!(err.reason, GatingReason::RequiredProvidersMissing);
        assert_eq!(err.missing_providers, vec!["google"]);
    }

    #[test]
    fn test_min_healthy_providers() {
        let health = HealthSnapshot::all_healthy(["openai"]);
        let policy = GatingPolicy::default().with_min_healthy_providers(2);
        let err = selector()
            .select_for_stage(StageKind::Initial, &pool(), &health, &policy, &BTreeSet::new())
            .unwrap_err();
        assert_eq!(
            err.reason,
            GatingReason::InsufficientHealthyProviders {
                required: 2,
                available: 1
            }
        );
    }

    #[test]
    fn test_required_providers_not_enforced_after_initial() {
        let health = HealthSnapshot::all_healthy(["openai"]);
        let policy = GatingPolicy::default().with_required_providers(["google"]);
        let selected = selector()
            .select_for_stage(StageKind::PeerReview, &pool(), &health, &policy, &BTreeSet::new())
            .unwrap();
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_synthesis_picks_single_best_unused() {
        let health = HealthSnapshot::all_healthy(["openai", "anthropic", "google"]);
        let used: BTreeSet<_> = ids(&["anthropic/claude"]).into_iter().collect();
        let selected = selector()
            .select_for_stage(
                StageKind::Synthesis,
                &pool(),
                &health,
                &GatingPolicy::default(),
                &used,
            )
            .unwrap();
        assert_eq!(selected, ids(&["google/gemini"]));

        let reuse = GatingPolicy::default().with_exclude_used(false);
        let selected = selector()
            .select_for_stage(StageKind::Synthesis, &pool(), &health, &reuse, &used)
            .unwrap();
        assert_eq!(selected, ids(&["anthropic/claude"]));
    }

    #[test]
    fn test_synthesis_with_everything_used() {
        let health = HealthSnapshot::all_healthy(["openai", "anthropic", "google"]);
        let used: BTreeSet<_> = pool().into_iter().map(|c| c.id).collect();
        let err = selector()
            .select_for_stage(
                StageKind::Synthesis,
                &pool(),
                &health,
                &GatingPolicy::default(),
                &used,
            )
            .unwrap_err();
        assert_eq!(err.reason, GatingReason::NoEligibleModel);
        assert_eq!(err.stage, StageKind::Synthesis);
    }

    #[test]
    fn test_selection_does_not_consume_half_open_probe() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: std::time::Duration::from_millis(5),
        }));
        breakers.record_failure("openai");
        std::thread::sleep(std::time::Duration::from_millis(15));

        let selector = ModelSelector::new(Arc::clone(&breakers));
        let health = HealthSnapshot::all_healthy(["openai"]);
        let openai_only = vec![ModelCandidate::new("openai/gpt-4o", "openai")];
        for _ in 0..3 {
            let selected = selector
                .select_for_stage(
                    StageKind::Initial,
                    &openai_only,
                    &health,
                    &GatingPolicy::default(),
                    &BTreeSet::new(),
                )
                .unwrap();
            assert_eq!(selected.len(), 1);
        }
        assert!(breakers.allow_request("openai"));
    }

    proptest! {
        #[test]
        fn prop_synthesis_never_reuses_models(
            pool_mask in proptest::collection::vec(any::<bool>(), 8),
            used_mask in proptest::collection::vec(any::<bool>(), 8),
        ) {
            let providers = ["openai", "anthropic", "google", "mistral"];
            let pool: Vec<ModelCandidate> = (0..8)
                .filter(|i| pool_mask[*i])
                .map(|i| ModelCandidate::new(format!("m{}", i), providers[i % 4]))
                .collect();
            let used: BTreeSet<ModelId> = (0..8)
                .filter(|i| used_mask[*i])
                .map(|i| ModelId::new(format!("m{}", i)))
                .collect();

            let health = HealthSnapshot::all_healthy(providers);
            let result = selector().select_for_stage(
                StageKind::Synthesis,
                &pool,
                &health,
                &GatingPolicy::default(),
                &used,
            );

            let unused = pool.iter().filter(|c| !used.contains(&c.id)).count();
            match result {
                Ok(selected) => {
                    prop_assert_eq!(selected.len(), 1);
                    prop_assert!(!used.contains(&selected[0]));
                    prop_assert!(pool.iter().any(|c| c.id == selected[0]));
                }
                Err(err) => {
                    prop_assert_eq!(unused, 0);
                    prop_assert_eq!(err.reason, GatingReason::NoEligibleModel);
                }
            }
        }
    }
}
