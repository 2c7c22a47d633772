use console::style;

use crate::ai::provider::CircuitState;
use crate::pipeline::{ModelOutcome, PipelineStatus, ProbeStatus};

/// Terminal formatting for command output.
///
/// Diagnostics go to stderr so stdout stays clean for answers and JSON.
pub struct Output;

impl Output {
    pub fn new() -> Self {
        Self
    }

    pub fn success(&self, message: &str) {
        eprintln!("{} {}", style("✓").green(), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red(), message);
    }

    pub fn warning(&self, message: &str) {
        eprintln!("{} {}", style("⚠").yellow(), message);
    }

    pub fn info(&self, message: &str) {
        eprintln!("{} {}", style("ℹ").blue(), message);
    }

    pub fn header(&self, message: &str) {
        println!("\n{}", style(message).bold().underlined());
    }

    pub fn section(&self, message: &str) {
        println!("\n{}", style(message).bold());
        println!("{}", "─".repeat(40));
    }

    /// Aligned `key: value` line
    pub fn field(&self, key: &str, value: impl std::fmt::Display) {
        println!("  {:<18} {}", style(format!("{}:", key)).dim(), value);
    }

    pub fn status(&self, status: PipelineStatus) -> String {
        let label = status.to_string();
        match status {
            PipelineStatus::Success => style(label).green().bold().to_string(),
            PipelineStatus::PartialSuccess => style(label).yellow().bold().to_string(),
            PipelineStatus::Error => style(label).red().bold().to_string(),
        }
    }

    pub fn circuit(&self, state: CircuitState) -> String {
        let label = state.to_string();
        match state {
            CircuitState::Closed => style(label).green().to_string(),
            CircuitState::HalfOpen => style(label).yellow().to_string(),
            CircuitState::Open => style(label).red().to_string(),
        }
    }

    pub fn probe(&self, probe: &ProbeStatus) -> String {
        match probe {
            ProbeStatus::Unknown => style("unknown").dim().to_string(),
            ProbeStatus::Passed => style("passed").green().to_string(),
            ProbeStatus::Failed { reason } => {
                format!("{} ({})", style("failed").red(), reason)
            }
        }
    }

    pub fn healthy(&self, healthy: bool) -> String {
        if healthy {
            style("healthy").green().to_string()
        } else {
            style("unhealthy").red().to_string()
        }
    }

    /// One row per model call within a stage
    pub fn model_outcome(&self, model: &str, outcome: &ModelOutcome) {
        let latency = format!("{}ms", outcome.latency.as_millis());
        match outcome.error() {
            None => println!(
                "  {} {:<28} {:>8}  {} tokens",
                style("✓").green(),
                model,
                style(latency).dim(),
                outcome.tokens_used
            ),
            Some(error) => println!(
                "  {} {:<28} {:>8}  {} {}",
                style("✗").red(),
                model,
                style(latency).dim(),
                style(error.category).red(),
                error.message
            ),
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}
