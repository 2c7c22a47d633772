//! Health Command
//!
//! Show per-provider health and circuit breaker state.
//!
//! Usage:
//!   concord health [--probe] [-f json]

use serde_json::json;

use crate::cli::ui::{Output, OutputFormat};
use crate::cli::util::CommandContext;
use crate::types::Result;

pub async fn run(ctx: &CommandContext, probe: bool, format: OutputFormat) -> Result<()> {
    let records = if probe {
        ctx.controller.refresh_health().await
    } else {
        ctx.controller.health_summary()
    };
    let breakers = ctx.controller.breaker_stats();

    if format.is_json() {
        let report = json!({
            "providers": records,
            "breakers": breakers,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let out = Output::new();
    out.header("Provider Health");

    if records.is_empty() {
        out.info("No providers configured.");
        return Ok(());
    }

    for record in records.values() {
        out.section(&record.provider);
        out.field("status", out.healthy(record.healthy));
        out.field("circuit", out.circuit(record.breaker_state));
        out.field("failures", record.consecutive_failures);
        out.field("probe", out.probe(&record.probe));
        if let Some(checked) = record.last_checked_at {
            out.field("last checked", checked.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }

    let healthy = records.values().filter(|r| r.healthy).count();
    println!();
    if healthy == records.len() {
        out.success(&format!("{}/{} providers healthy", healthy, records.len()));
    } else {
        out.warning(&format!("{}/{} providers healthy", healthy, records.len()));
    }
    if !probe {
        out.info("Run with --probe to check provider endpoints now.");
    }

    Ok(())
}
