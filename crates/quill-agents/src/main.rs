use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quill_agents::pipeline::PREMISE_KEY;
use quill_agents::{
    telemetry, Collaborators, DirProfileStore, EngineConfig, GeneratorEvaluator,
    InMemoryProfileStore, OpenAiCompatProvider, ProfileStore, RunRequest, WorkflowEngine,
};

/// Quill: orchestrates a multi-stage creative-writing pipeline against an
/// OpenAI-compatible model endpoint.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline once
    Run {
        /// Story premise (seed key `premise`)
        #[arg(long)]
        premise: String,

        /// Extra seed inputs as key=value
        #[arg(long = "seed", value_parser = parse_seed)]
        seeds: Vec<(String, String)>,

        /// User id for profile lookup and persistence
        #[arg(long)]
        user: Option<String>,

        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory for per-user profile files (in-memory when omitted)
        #[arg(long)]
        profile_dir: Option<PathBuf>,

        /// Write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,

        /// Append the run report to a JSONL log
        #[arg(long)]
        telemetry_log: Option<PathBuf>,
    },

    /// Print the stage graph
    Stages {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a config file and its stage graph
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Summarize past runs from a JSONL telemetry log
    History {
        #[arg(long)]
        telemetry_log: PathBuf,

        /// Only the most recent N runs
        #[arg(long)]
        last: Option<usize>,
    },
}

fn parse_seed(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Command::Run {
            premise,
            seeds,
            user,
            config,
            profile_dir,
            report,
            telemetry_log,
        } => {
            let mut seed_inputs: BTreeMap<String, String> = seeds.into_iter().collect();
            seed_inputs.insert(PREMISE_KEY.to_string(), premise);
            let request = RunRequest {
                seed_inputs,
                user_id: user,
            };
            run(
                request,
                config,
                profile_dir,
                report,
                telemetry_log,
            )
            .await
        }
        Command::Stages { config } => {
            let config = EngineConfig::load(config.as_deref()).context("loading config")?;
            let graph = config.build_graph().context("building stage graph")?;
            println!("{graph}");
            Ok(())
        }
        Command::CheckConfig { config } => {
            let config = EngineConfig::load(config.as_deref()).context("loading config")?;
            let graph = config.build_graph().context("building stage graph")?;
            println!(
                "config ok: {} stages, start '{}', final '{}', threshold {}, {} attempts, run cap {}",
                graph.stages().len(),
                graph.start(),
                graph.final_stage(),
                config.gate.quality_threshold,
                config.gate.max_revision_attempts,
                config.max_total_executions
            );
            let seeds: Vec<String> = graph.seed_keys().into_iter().collect();
            println!("seed keys: {}", seeds.join(", "));
            Ok(())
        }
        Command::History {
            telemetry_log,
            last,
        } => {
            let reports = telemetry::read_reports(&telemetry_log);
            let skip = last.map_or(0, |n| reports.len().saturating_sub(n));
            for report in reports.iter().skip(skip) {
                println!("{} {}", report.started_at.to_rfc3339(), report.summary());
            }
            let errors = reports.iter().filter(|r| r.is_error()).count();
            println!("{} runs, {} ended in error", reports.len(), errors);
            Ok(())
        }
    }
}

async fn run(
    request: RunRequest,
    config_path: Option<PathBuf>,
    profile_dir: Option<PathBuf>,
    report_path: Option<PathBuf>,
    telemetry_log: Option<PathBuf>,
) -> Result<()> {
    let config = EngineConfig::load(config_path.as_deref()).context("loading config")?;
    let graph = config.build_graph().context("building stage graph")?;

    let missing: Vec<String> = graph
        .seed_keys()
        .into_iter()
        .filter(|k| !request.seed_inputs.contains_key(k))
        .collect();
    if !missing.is_empty() {
        bail!("missing seed inputs: {}", missing.join(", "));
    }

    let provider = Arc::new(
        OpenAiCompatProvider::new(config.provider.clone(), config.call_timeout())
            .context("building HTTP client")?,
    );
    let profiles: Arc<dyn ProfileStore> = match profile_dir {
        Some(dir) => Arc::new(DirProfileStore::new(dir)),
        None => Arc::new(InMemoryProfileStore::new()),
    };
    info!(
        base_url = %config.provider.base_url,
        model = %config.provider.model,
        reasoning_model = %config.provider.reasoning_model(),
        "Quill starting"
    );

    let engine = WorkflowEngine::new(
        Arc::new(graph),
        Arc::new(config),
        Collaborators {
            generator: provider.clone(),
            evaluator: Arc::new(GeneratorEvaluator::new(provider.clone())),
            reasoner: provider,
            profiles: Some(profiles),
        },
    );

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling after the current stage");
            on_ctrl_c.cancel();
        }
    });

    let report = engine.run_with_cancel(request, cancel).await;

    if let Some(path) = &report_path {
        telemetry::write_report(&report, path);
    }
    if let Some(path) = &telemetry_log {
        telemetry::append_report(&report, path);
    }

    println!("{}", report.summary());
    if let Some(artifact) = &report.final_artifact {
        println!("\n── {} (attempt {}) ──\n\n{}", artifact.stage, artifact.attempt, artifact.content);
    }

    if report.is_error() {
        std::process::exit(1);
    }
    Ok(())
}
