//! Policy Command
//!
//! Inspect and validate gating policies.
//!
//! Usage:
//!   concord policy show [-f json]
//!   concord policy validate <path>

use std::path::Path;

use crate::cli::ui::{Output, OutputFormat};
use crate::cli::util::CommandContext;
use crate::pipeline::{FilePolicySource, GatingPolicy};
use crate::types::{ConcordError, Result};

/// Show the active policy
pub fn show(ctx: &CommandContext, format: OutputFormat) -> Result<()> {
    let policy = ctx.controller.policy();

    if format.is_json() {
        println!("{}", serde_json::to_string_pretty(&*policy)?);
        return Ok(());
    }

    let out = Output::new();
    out.header("Gating Policy");
    out.field("source", ctx.controller.policy_source());
    print_policy(&out, &policy);
    Ok(())
}

/// Parse and validate a policy document without installing it
pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ConcordError::Policy(format!("Cannot read {}: {}", path.display(), e))
    })?;
    let policy = FilePolicySource::parse(path, &content)?;

    let out = Output::new();
    out.success(&format!("{} is a valid policy", path.display()));
    print_policy(&out, &policy);
    Ok(())
}

fn print_policy(out: &Output, policy: &GatingPolicy) {
    if policy.version > 0 {
        out.field("version", policy.version);
    }
    if let Some(label) = &policy.label {
        out.field("label", label);
    }
    out.field("min healthy", policy.min_healthy_providers);
    out.field("required", join_or_none(policy.required_providers.iter()));
    out.field("exclude used", policy.exclude_used_models_from_synthesis);
    out.field("priority", join_or_none(policy.model_priority.iter()));
}

fn join_or_none<T: std::fmt::Display>(items: impl Iterator<Item = T>) -> String {
    let joined = items.map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "(none)".to_string()
    } else {
        joined
    }
}
