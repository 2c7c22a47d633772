//! Adapter Registry
//!
//! Owns one adapter per registered model id. Built once from
//! configuration and shared read-only by the pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::info;

use super::{SharedAdapter, create_adapter};
use crate::config::Config;
use crate::types::{ConcordError, ModelId, ModelRole, Result};

/// A model the pipeline may call
#[derive(Clone)]
pub struct RegisteredModel {
    pub id: ModelId,
    pub provider: String,
    pub role: ModelRole,
    pub adapter: SharedAdapter,
}

impl std::fmt::Debug for RegisteredModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredModel")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("role", &self.role)
            .field("model", &self.adapter.model())
            .finish()
    }
}

/// Model id → adapter map
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    models: BTreeMap<ModelId, RegisteredModel>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every configured model endpoint
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for endpoint in &config.models {
            let adapter = create_adapter(endpoint)?;
            registry.register(ModelId::new(endpoint.resolved_id()), endpoint.role, adapter)?;
        }
        info!(models = registry.len(), "Adapter registry built");
        Ok(registry)
    }

    /// Register an adapter. The provider name comes from the adapter.
    pub fn register(
        &mut self,
        id: ModelId,
        role: ModelRole,
        adapter: SharedAdapter,
    ) -> Result<()> {
        if self.models.contains_key(&id) {
            return Err(ConcordError::Config(format!("duplicate model id: {}", id)));
        }
        let provider = adapter.provider().to_string();
        self.models.insert(
            id.clone(),
            RegisteredModel {
                id,
                provider,
                role,
                adapter,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &ModelId) -> Option<&RegisteredModel> {
        self.models.get(id)
    }

    pub fn provider_of(&self, id: &ModelId) -> Option<&str> {
        self.models.get(id).map(|m| m.provider.as_str())
    }

    /// Model ids whose role includes Initial/PeerReview work
    pub fn panel_ids(&self) -> BTreeSet<ModelId> {
        self.models
            .values()
            .filter(|m| m.role.serves_panel())
            .map(|m| m.id.clone())
            .collect()
    }

    /// Model ids whose role includes Synthesis
    pub fn synthesis_ids(&self) -> BTreeSet<ModelId> {
        self.models
            .values()
            .filter(|m| m.role.serves_synthesis())
            .map(|m| m.id.clone())
            .collect()
    }

    /// One adapter per provider, for health probes
    pub fn probe_targets(&self) -> BTreeMap<String, SharedAdapter> {
        let mut targets = BTreeMap::new();
        for model in self.models.values() {
            targets
                .entry(model.provider.clone())
                .or_insert_with(|| Arc::clone(&model.adapter));
        }
        targets
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
