//! Gating Policy Service
//!
//! Holds the active `GatingPolicy` behind an atomic `Arc` swap. Readers
//! always see a complete policy; `reload()` either swaps in a fully
//! validated replacement or keeps the previous one.
//!
//! ## Sources
//!
//! - `FilePolicySource`: TOML or YAML document chosen by file extension
//! - `StaticPolicySource`: in-memory policy (inline config, embedding, tests)

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PolicySettings;
use crate::types::{ConcordError, ModelId, Result};

// =============================================================================
// Gating Policy
// =============================================================================

/// Rules the selector enforces at each stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatingPolicy {
    /// Assigned by the policy service, never read from documents
    #[serde(skip_deserializing)]
    pub version: u64,
    /// Free-form document label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub min_healthy_providers: usize,
    pub required_providers: BTreeSet<String>,
    pub exclude_used_models_from_synthesis: bool,
    /// Declared priority order, highest first
    pub model_priority: Vec<ModelId>,
}

impl Default for GatingPolicy {
    fn default() -> Self {
        Self {
            version: 0,
            label: None,
            min_healthy_providers: 1,
            required_providers: BTreeSet::new(),
            exclude_used_models_from_synthesis: true,
            model_priority: Vec::new(),
        }
    }
}

impl From<&PolicySettings> for GatingPolicy {
    fn from(settings: &PolicySettings) -> Self {
        Self {
            version: 0,
            label: None,
            min_healthy_providers: settings.min_healthy_providers,
            required_providers: settings.required_providers.iter().cloned().collect(),
            exclude_used_models_from_synthesis: settings.exclude_used_models_from_synthesis,
            model_priority: settings
                .model_priority
                .iter()
                .map(|id| ModelId::new(id.as_str()))
                .collect(),
        }
    }
}

impl GatingPolicy {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_required_providers<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_providers = providers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_healthy_providers(mut self, min: usize) -> Self {
        self.min_healthy_providers = min;
        self
    }

    pub fn with_exclude_used(mut self, exclude: bool) -> Self {
        self.exclude_used_models_from_synthesis = exclude;
        self
    }

    pub fn with_priority<I, M>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<ModelId>,
    {
        self.model_priority = models.into_iter().map(Into::into).collect();
        self
    }

    /// Position in the declared priority list; unlisted models rank last
    pub fn priority_rank(&self, model: &ModelId) -> usize {
        self.model_priority
            .iter()
            .position(|m| m == model)
            .unwrap_or(usize::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(empty) = self.required_providers.iter().find(|p| p.trim().is_empty()) {
            return Err(ConcordError::Policy(format!(
                "required_providers contains an empty name: {:?}",
                empty
            )));
        }

        let mut seen = HashSet::new();
        for model in &self.model_priority {
            if model.as_str().trim().is_empty() {
                return Err(ConcordError::Policy(
                    "model_priority contains an empty model id".to_string(),
                ));
            }
            if !seen.insert(model) {
                return Err(ConcordError::Policy(format!(
                    "model_priority lists '{}' more than once",
                    model
                )));
            }
        }

        Ok(())
    }

    /// Equality ignoring the assigned version
    fn same_rules(&self, other: &GatingPolicy) -> bool {
        self.label == other.label
            && self.min_healthy_providers == other.min_healthy_providers
            && self.required_providers == other.required_providers
            && self.exclude_used_models_from_synthesis == other.exclude_used_models_from_synthesis
            && self.model_priority == other.model_priority
    }
}

// =============================================================================
// Policy Sources
// =============================================================================

/// Declarative, reloadable policy document
pub trait PolicySource: Send + Sync {
    fn load(&self) -> Result<GatingPolicy>;

    /// Human-readable origin for logs
    fn describe(&self) -> String;
}

/// Policy document on disk (`.yaml`/`.yml` or TOML)
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse and validate a document without installing it
    pub fn parse(path: &Path, content: &str) -> Result<GatingPolicy> {
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "yaml" | "yml"));

        let policy: GatingPolicy = if is_yaml {
            serde_yaml::from_str(content)?
        } else {
            toml::from_str(content)?
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl PolicySource for FilePolicySource {
    fn load(&self) -> Result<GatingPolicy> {
        let content = fs::read_to_string(&self.path)?;
        Self::parse(&self.path, &content)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory policy. `set` replaces what the next `load` returns.
#[derive(Debug, Default)]
pub struct StaticPolicySource {
    policy: RwLock<GatingPolicy>,
}

impl StaticPolicySource {
    pub fn new(policy: GatingPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
        }
    }

    pub fn set(&self, policy: GatingPolicy) {
        *self
            .policy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = policy;
    }
}

impl PolicySource for StaticPolicySource {
    fn load(&self) -> Result<GatingPolicy> {
        let policy = self
            .policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        policy.validate()?;
        Ok(policy)
    }

    fn describe(&self) -> String {
        "inline".to_string()
    }
}

// =============================================================================
// Policy Service
// =============================================================================

/// Owner of the active gating policy
pub struct PolicyService {
    source: Arc<dyn PolicySource>,
    active: RwLock<Arc<GatingPolicy>>,
}

impl PolicyService {
    /// Load from `source`. A failed startup load falls back to defaults.
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        let mut initial = match source.load() {
            Ok(policy) => policy,
            Err(e) => {
                warn!(
                    source = %source.describe(),
                    "Failed to load gating policy, using defaults: {}",
                    e
                );
                GatingPolicy::default()
            }
        };
        initial.version = 1;

        info!(
            source = %source.describe(),
            version = initial.version,
            "Gating policy loaded"
        );

        Self {
            source,
            active: RwLock::new(Arc::new(initial)),
        }
    }

    /// Service for an in-memory policy
    pub fn fixed(policy: GatingPolicy) -> Self {
        Self::new(Arc::new(StaticPolicySource::new(policy)))
    }

    /// File source when a path is configured, otherwise the inline fields
    pub fn from_settings(settings: &PolicySettings) -> Self {
        match &settings.path {
            Some(path) => Self::new(Arc::new(FilePolicySource::new(path.clone()))),
            None => Self::fixed(GatingPolicy::from(settings)),
        }
    }

    /// Active policy snapshot
    pub fn current(&self) -> Arc<GatingPolicy> {
        Arc::clone(
            &self
                .active
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn version(&self) -> u64 {
        self.current().version
    }

    /// Where the rules come from: a file path or `inline`
    pub fn source(&self) -> String {
        self.source.describe()
    }

    /// Re-read the source and swap atomically. Returns the active version.
    ///
    /// On failure the previous policy stays active. The version only moves
    /// when the rules actually changed.
    pub fn reload(&self) -> Result<u64> {
        let mut loaded = match self.source.load() {
            Ok(policy) => policy,
            Err(e) => {
                warn!(
                    source = %self.source.describe(),
                    "Policy reload failed, keeping version {}: {}",
                    self.version(),
                    e
                );
                return Err(e);
            }
        };

        let mut active = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if active.same_rules(&loaded) {
            return Ok(active.version);
        }

        loaded.version = active.version + 1;
        info!(
            source = %self.source.describe(),
            from = active.version,
            to = loaded.version,
            "Gating policy reloaded"
        );
        *active = Arc::new(loaded);
        Ok(active.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_toml_document() {
        let policy = FilePolicySource::parse(
            Path::new("policy.toml"),
            r#"
            label = "prod"
            min_healthy_providers = 2
            required_providers = ["openai", "anthropic"]
            model_priority = ["openai/gpt-4o", "anthropic/claude"]
            "#,
        )
        .unwrap();
        assert_eq!(policy.label.as_deref(), Some("prod"));
        assert_eq!(policy.min_healthy_providers, 2);
        assert!(policy.required_providers.contains("anthropic"));
        assert!(policy.exclude_used_models_from_synthesis);
        assert_eq!(policy.priority_rank(&ModelId::from("anthropic/claude")), 1);
        assert_eq!(policy.priority_rank(&ModelId::from("other")), usize::MAX);
    }

    #[test]
    fn test_parse_yaml_document() {
        let policy = FilePolicySource::parse(
            Path::new("policy.yaml"),
            "min_healthy_providers: 3\nexclude_used_models_from_synthesis: false\n",
        )
        .unwrap();
        assert_eq!(policy.min_healthy_providers, 3);
        assert!(!policy.exclude_used_models_from_synthesis);
    }

    #[test]
    fn test_rejects_duplicate_priority() {
        let err = FilePolicySource::parse(
            Path::new("policy.toml"),
            r#"model_priority = ["a", "a"]"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConcordError::Policy(_)));
    }

    #[test]
    fn test_reload_bumps_version_only_on_change() {
        let source = Arc::new(StaticPolicySource::new(GatingPolicy::default()));
        let service = PolicyService::new(source.clone());
        assert_eq!(service.version(), 1);

        assert_eq!(service.reload().unwrap(), 1);

        source.set(GatingPolicy::default().with_min_healthy_providers(3));
        assert_eq!(service.reload().unwrap(), 2);
        assert_eq!(service.current().min_healthy_providers, 3);
    }

    #[test]
    fn test_failed_reload_keeps_previous_policy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("policy.toml");
        fs::write(&path, "min_healthy_providers = 2\n").unwrap();

        let service = PolicyService::new(Arc::new(FilePolicySource::new(&path)));
        assert_eq!(service.current().min_healthy_providers, 2);

        fs::write(&path, "min_healthy_providers = \"many\"\n").unwrap();
        assert!(service.reload().is_err());
        assert_eq!(service.current().min_healthy_providers, 2);
        assert_eq!(service.version(), 1);

        fs::write(&path, "min_healthy_providers = 4\n").unwrap();
        assert_eq!(service.reload().unwrap(), 2);
        assert_eq!(service.current().min_healthy_providers, 4);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let service = PolicyService::new(Arc::new(FilePolicySource::new("/nonexistent/policy.toml")));
        assert_eq!(*service.current(), GatingPolicy { version: 1, ..Default::default() });
        assert_eq!(service.source(), "/nonexistent/policy.toml");
    }

    #[test]
    fn test_inline_source_is_described() {
        let service = PolicyService::fixed(GatingPolicy::default());
        assert_eq!(service.source(), "inline");
    }

    #[test]
    fn test_readers_keep_old_snapshot_across_reload() {
        let source = Arc::new(StaticPolicySource::new(GatingPolicy::default()));
        let service = PolicyService::new(source.clone());
        let before = service.current();

        source.set(GatingPolicy::default().with_required_providers(["openai"]));
        service.reload().unwrap();

        assert!(before.required_providers.is_empty());
        assert!(service.current().required_providers.contains("openai"));
    }
}
