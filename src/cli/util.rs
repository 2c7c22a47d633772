//! CLI Common Utilities
//!
//! Configuration loading and controller construction shared by commands.

use std::path::Path;

use tracing::debug;

use crate::config::{Config, ConfigLoader};
use crate::pipeline::PipelineController;
use crate::types::{ConcordError, Result};

/// Command execution context
pub struct CommandContext {
    pub config: Config,
    pub controller: PipelineController,
}

impl CommandContext {
    /// Load configuration and build the pipeline.
    ///
    /// Fails with a config error when no models are configured.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = load_config(config_path)?;
        if config.models.is_empty() {
            return Err(ConcordError::Config(format!(
                "No models configured. Add [[models]] entries to {} or run 'concord config init'.",
                ConfigLoader::project_config_path().display()
            )));
        }

        let controller = PipelineController::from_config(&config)?;
        debug!(models = controller.adapters().len(), "Command context ready");

        Ok(Self { config, controller })
    }
}

/// Explicit file when given, otherwise the full resolution chain
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(ConcordError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            ConfigLoader::load_from_file(path)
        }
        None => ConfigLoader::load(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_explicit_config_is_error() {
        let err = load_config(Some(Path::new("/nonexistent/concord.toml"))).unwrap_err();
        assert!(matches!(err, ConcordError::Config(_)));
    }

    #[test]
    fn test_context_requires_models() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "version = \"1.0\"\n").unwrap();

        let err = CommandContext::load(Some(path.as_path())).err().unwrap();
        assert!(err.to_string().contains("No models configured"));
    }

    #[test]
    fn test_context_builds_controller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[[models]]
provider = "ollama"
kind = "ollama"
model = "llama3"
api_base = "http://localhost:11434"
"#,
        )
        .unwrap();

        let ctx = CommandContext::load(Some(path.as_path())).unwrap();
        assert_eq!(ctx.config.models.len(), 1);
        assert_eq!(ctx.controller.adapters().len(), 1);
    }
}
