//! Ask Command
//!
//! Run one prompt through the consensus pipeline.
//!
//! Usage:
//!   concord ask "What is 1+1?" [--model openai/gpt-4o]... [--deadline 60] [-f json]

use std::time::Duration;

use crate::cli::ui::{Output, OutputFormat};
use crate::cli::util::CommandContext;
use crate::pipeline::{PipelineRequest, PipelineResult, PipelineStatus, SubmitOptions};
use crate::types::{ModelId, Result};

#[derive(Debug, Clone, Default)]
pub struct AskArgs {
    pub prompt: String,
    pub models: Vec<String>,
    pub deadline_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub show_stages: bool,
    pub format: OutputFormat,
}

impl AskArgs {
    fn to_request(&self) -> PipelineRequest {
        let mut options = SubmitOptions::default();
        if let Some(secs) = self.deadline_secs {
            options = options.with_deadline(Duration::from_secs(secs));
        }
        if let Some(secs) = self.timeout_secs {
            options = options.with_timeout_per_call(Duration::from_secs(secs));
        }
        if let Some(max) = self.max_concurrency {
            options = options.with_max_concurrency(max);
        }

        PipelineRequest::new(self.prompt.clone())
            .with_models(self.models.iter().map(|m| ModelId::new(m.as_str())))
            .with_options(options)
    }
}

/// Returns the pipeline status so the caller can pick an exit code
pub async fn run(ctx: &CommandContext, args: AskArgs) -> Result<PipelineStatus> {
    let result = ctx.controller.submit(args.to_request()).await?;

    if args.format.is_json() {
        println!("{}", serde_json::to_string_pretty(&*result)?);
    } else {
        render_text(&result, args.show_stages);
    }

    Ok(result.status)
}

fn render_text(result: &PipelineResult, show_stages: bool) {
    let out = Output::new();

    if show_stages {
        for stage in &result.stages {
            out.section(&format!(
                "{} ({}/{} succeeded, {}ms)",
                stage.stage,
                stage.succeeded.len(),
                stage.attempted.len(),
                stage.elapsed.as_millis()
            ));
            for (model, outcome) in &stage.per_model {
                out.model_outcome(model.as_str(), outcome);
            }
        }
        println!();
    }

    if let Some(text) = &result.synthesis {
        println!("{}", text.trim());
    } else if let Some(failure) = &result.failure {
        out.error(&failure.to_string());
    }

    out.header("Summary");
    out.field("status", out.status(result.status));
    out.field("request", &result.request_id);
    if let Some(model) = &result.synthesis_model {
        out.field("synthesized by", model);
    }
    out.field(
        "models used",
        result
            .models_used
            .iter()
            .map(ModelId::as_str)
            .collect::<Vec<_>>()
            .join(", "),
    );
    out.field("tokens", result.tokens_used());
    out.field("elapsed", format!("{}ms", result.total_elapsed.as_millis()));
    if result.status == PipelineStatus::PartialSuccess
        && let Some(failure) = &result.failure
    {
        out.warning(&failure.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_build_request_options() {
        let args = AskArgs {
            prompt: "What is 1+1?".to_string(),
            models: vec!["openai/gpt-4o".to_string(), "anthropic/claude".to_string()],
            deadline_secs: Some(30),
            timeout_secs: Some(5),
            ..Default::default()
        };

        let request = args.to_request();
        assert_eq!(request.prompt, "What is 1+1?");
        assert_eq!(
            request.model_hints,
            vec![ModelId::from("openai/gpt-4o"), ModelId::from("anthropic/claude")]
        );
        assert_eq!(request.options.deadline, Some(Duration::from_secs(30)));
        assert_eq!(request.options.timeout_per_call, Some(Duration::from_secs(5)));
        assert_eq!(request.options.max_concurrency, None);
    }
}
