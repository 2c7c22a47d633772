//! Configuration Loader (Figment-based)
//!
//! Loads and merges configuration from multiple sources using Figment:
//! 1. Built-in defaults (Serialized)
//! 2. Global config (~/.config/concord/config.toml)
//! 3. Project config (.concord/config.toml)
//! 4. Environment variables (CONCORD_* prefix, `__` separates nested keys)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::types::{ConcordError, Result};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with full resolution chain using Figment:
    /// defaults → global → project → env vars
    pub fn load() -> Result<Config> {
        Self::load_with(Self::global_config_path(), Self::project_config_path())
    }

    /// Load with explicit global/project paths (missing files are skipped)
    pub fn load_with(global: Option<PathBuf>, project: PathBuf) -> Result<Config> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(global_path) = global
            && global_path.exists()
        {
            debug!("Loading global config from: {}", global_path.display());
            figment = figment.merge(Toml::file(&global_path));
        }

        if project.exists() {
            debug!("Loading project config from: {}", project.display());
            figment = figment.merge(Toml::file(&project));
        }

        // e.g. CONCORD_PIPELINE__MAX_CONCURRENCY -> pipeline.max_concurrency
        figment = figment.merge(Env::prefixed("CONCORD_").split("__").lowercase(true));

        let config: Config = figment
            .extract()
            .map_err(|e| ConcordError::Config(format!("Configuration error: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file only
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| ConcordError::Config(format!("Configuration error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    // =========================================================================
    // Path Management
    // =========================================================================

    /// Get path to global config directory (~/.config/concord/)
    pub fn global_dir() -> Option<PathBuf> {
        env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                env::var("HOME")
                    .ok()
                    .map(|home| PathBuf::from(home).join(".config"))
            })
            .map(|p| p.join("concord"))
    }

    /// Get path to global config file
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join("config.toml"))
    }

    /// Get path to project config file
    pub fn project_config_path() -> PathBuf {
        Self::project_dir().join("config.toml")
    }

    /// Get project data directory
    pub fn project_dir() -> PathBuf {
        PathBuf::from(".concord")
    }

    // =========================================================================
    // Config Commands
    // =========================================================================

    /// Render the effective configuration as TOML or JSON
    pub fn render(config: &Config, as_json: bool) -> Result<String> {
        if as_json {
            Ok(serde_json::to_string_pretty(config)?)
        } else {
            toml::to_string_pretty(config).map_err(|e| ConcordError::Config(e.to_string()))
        }
    }

    /// Write a starter project config. Existing files are kept unless `force`.
    pub fn init_project(dir: &Path, force: bool) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;

        let config_path = dir.join("config.toml");
        if !config_path.exists() || force {
            fs::write(&config_path, Self::default_project_config())?;
            info!("Created project config: {}", config_path.display());
        } else {
            info!("Project config exists: {}", config_path.display());
        }

        Ok(config_path)
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn default_project_config() -> String {
        r#"# Concord Project Configuration
# Project settings override ~/.config/concord/config.toml.

version = "1.0"

[pipeline]
peer_review_min_successes = 3
timeout_per_call_secs = 30
max_concurrency = 8
request_deadline_secs = 180

[breaker]
failure_threshold = 5
recovery_timeout_secs = 60

[health]
refresh_interval_secs = 300
probe_enabled = true

[dedup]
enabled = true
ttl_secs = 180

[policy]
min_healthy_providers = 2
required_providers = []
exclude_used_models_from_synthesis = true
# path = ".concord/policy.toml"

[[models]]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
role = "panel"

[[models]]
provider = "local"
kind = "ollama"
model = "llama3:latest"
role = "panel"

[[models]]
provider = "openai"
model = "gpt-4o"
api_key_env = "OPENAI_API_KEY"
role = "synthesizer"
"#
        .to_string()
    }
}
