use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::runtime::Runtime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use concord::cli::CommandContext;
use concord::cli::OutputFormat;
use concord::cli::commands::{self, ask::AskArgs, config::ConfigFormat};
use concord::pipeline::PipelineStatus;

#[derive(Parser)]
#[command(name = "concord")]
#[command(
    version,
    about = "Ask several LLM providers, let them review each other, and synthesize one answer"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (skips the global/project resolution chain)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, short, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a prompt through Initial, PeerReview and Synthesis
    Ask {
        #[arg(help = "Prompt text")]
        prompt: String,
        #[arg(
            long = "model",
            short = 'm',
            help = "Restrict the panel to these model ids (repeatable)"
        )]
        models: Vec<String>,
        #[arg(long, help = "Overall request deadline in seconds")]
        deadline: Option<u64>,
        #[arg(long, help = "Per-call timeout in seconds")]
        timeout: Option<u64>,
        #[arg(long, help = "Maximum concurrent calls per stage")]
        concurrency: Option<usize>,
        #[arg(long, short = 's', help = "Show per-stage model outcomes")]
        stages: bool,
        #[arg(short = 'f', long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show provider health and circuit breaker state
    Health {
        #[arg(long, help = "Probe every provider before reporting")]
        probe: bool,
        #[arg(short = 'f', long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Inspect gating policies
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Show the active gating policy
    Show {
        #[arg(short = 'f', long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Validate a policy document (YAML or TOML)
    Validate {
        #[arg(help = "Policy file path")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(short = 'f', long, value_enum, default_value = "toml")]
        format: ConfigFormat,
    },
    /// Show configuration file paths
    Path,
    /// Write a starter project configuration
    Init {
        #[arg(long, help = "Overwrite existing config")]
        force: bool,
    },
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("\n{}", style("━━━ PANIC ━━━").red().bold());
        eprintln!("{}", style("concord encountered an unexpected error:").red());
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "{}",
                style(format!(
                    "Location: {}:{}:{}",
                    location.file(),
                    location.line(),
                    location.column()
                ))
                .dim()
            );
        }
        eprintln!();

        // Backtrace when RUST_BACKTRACE=1
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red(), e);
            ExitCode::FAILURE
        }
    }
}

fn run_cli() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };

    // Logs on stderr; stdout carries answers and JSON
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Ask {
            prompt,
            models,
            deadline,
            timeout,
            concurrency,
            stages,
            format,
        } => {
            let ctx = CommandContext::load(config_path)?;
            let args = AskArgs {
                prompt,
                models,
                deadline_secs: deadline,
                timeout_secs: timeout,
                max_concurrency: concurrency,
                show_stages: stages,
                format,
            };
            let rt = Runtime::new()?;
            let status = rt.block_on(async {
                let status = commands::ask::run(&ctx, args).await;
                ctx.controller.close();
                status
            })?;
            if status == PipelineStatus::Error {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Health { probe, format } => {
            let ctx = CommandContext::load(config_path)?;
            let rt = Runtime::new()?;
            rt.block_on(commands::health::run(&ctx, probe, format))?;
        }
        Commands::Policy { action } => match action {
            PolicyAction::Show { format } => {
                let ctx = CommandContext::load(config_path)?;
                commands::policy::show(&ctx, format)?;
            }
            PolicyAction::Validate { path } => {
                commands::policy::validate(&path)?;
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Show { format } => {
                commands::config::show(config_path, format)?;
            }
            ConfigAction::Path => {
                commands::config::path()?;
            }
            ConfigAction::Init { force } => {
                commands::config::init(force)?;
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}
