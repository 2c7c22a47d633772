//! Config Command
//!
//! Manage Concord configuration.
//!
//! Usage:
//!   concord config show [-f toml|json]
//!   concord config path
//!   concord config init [--force]

use std::path::Path;

use clap::ValueEnum;

use crate::cli::ui::Output;
use crate::cli::util::load_config;
use crate::config::ConfigLoader;
use crate::types::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Json,
}

/// Show the merged effective configuration
pub fn show(config_path: Option<&Path>, format: ConfigFormat) -> Result<()> {
    let config = load_config(config_path)?;
    let rendered = ConfigLoader::render(&config, format == ConfigFormat::Json)?;
    println!("{}", rendered);
    Ok(())
}

/// Show configuration file paths and whether they exist
pub fn path() -> Result<()> {
    let out = Output::new();
    out.header("Configuration Paths");

    let describe = |path: &Path| {
        let state = if path.exists() { "exists" } else { "missing" };
        format!("{} ({})", path.display(), state)
    };

    match ConfigLoader::global_config_path() {
        Some(global) => out.field("global", describe(&global)),
        None => out.field("global", "(no home directory)"),
    }
    out.field("project", describe(&ConfigLoader::project_config_path()));
    out.field("env prefix", "CONCORD_ (nested keys use __)");
    Ok(())
}

/// Write a starter project configuration
pub fn init(force: bool) -> Result<()> {
    let config_path = ConfigLoader::init_project(&ConfigLoader::project_dir(), force)?;
    Output::new().success(&format!(
        "Project configuration ready: {}",
        config_path.display()
    ));
    Ok(())
}
