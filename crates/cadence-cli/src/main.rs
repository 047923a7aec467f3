//! CLI binary for running and inspecting Cadence pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use cadence_llm::AnthropicAdapter;
use cadence_pipeline::{
    presets, validate, CancellationToken, EchoInvoker, ModelInvoker,
    ModelInvokerConfig, PhaseStatus, Pipeline, PipelineConfig, PipelineOrchestrator,
    PipelineResult, RunFailure, Severity, StageInvoker,
};
use cadence_tools::ToolRegistry;
use cadence_types::SharedState;

#[derive(Parser)]
#[command(name = "cadence", version, about = "Quality-gated content pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline on an input
    ///
    /// The binary registers no tools. Stages that list tools (such as
    /// `web_search` in the built-in pipeline) run without them; tool access
    /// needs a caller that embeds cadence-pipeline with its own ToolRegistry.
    Run {
        /// Pipeline JSON file (default: the built-in content pipeline)
        pipeline: Option<PathBuf>,

        /// Initial input stored under the pipeline's seed key
        #[arg(short, long)]
        input: String,

        /// Write the final state here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Don't call the model; echo each stage's prompt instead
        #[arg(long)]
        dry_run: bool,

        /// Model identifier (default: the provider's default model)
        #[arg(long)]
        model: Option<String>,

        /// Maximum tokens per model response
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Print pipeline events to stderr as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Validate a pipeline file
    Validate {
        /// Pipeline JSON file (default: the built-in content pipeline)
        pipeline: Option<PathBuf>,
    },

    /// Show information about a pipeline
    Info {
        /// Pipeline JSON file (default: the built-in content pipeline)
        pipeline: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            pipeline,
            input,
            output,
            dry_run,
            model,
            max_tokens,
            events,
        } => {
            let options = RunOptions {
                dry_run,
                model,
                max_tokens,
                events,
            };
            cmd_run(pipeline.as_deref(), &input, output.as_deref(), options).await?;
        }
        Commands::Validate { pipeline } => {
            cmd_validate(pipeline.as_deref())?;
        }
        Commands::Info { pipeline } => {
            cmd_info(pipeline.as_deref())?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    Ok(match path {
        Some(path) => PipelineConfig::from_path(path)?,
        None => presets::content_pipeline_config()?,
    })
}

fn load_pipeline(path: Option<&Path>) -> anyhow::Result<Pipeline> {
    Ok(load_config(path)?.into_pipeline()?)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunOptions {
    dry_run: bool,
    model: Option<String>,
    max_tokens: Option<u32>,
    events: bool,
}

fn build_invoker(options: &RunOptions, tools: ToolRegistry) -> anyhow::Result<Arc<dyn StageInvoker>> {
    if options.dry_run {
        tracing::info!("Dry run: stages will echo their prompts");
        return Ok(Arc::new(EchoInvoker));
    }
    let provider = AnthropicAdapter::from_env()?;
    let mut config = ModelInvokerConfig {
        model: options.model.clone(),
        ..ModelInvokerConfig::default()
    };
    if options.max_tokens.is_some() {
        config.max_tokens = options.max_tokens;
    }
    Ok(Arc::new(
        ModelInvoker::new(Arc::new(provider))
            .with_tools(tools)
            .with_config(config),
    ))
}

async fn cmd_run(
    path: Option<&Path>,
    input: &str,
    output: Option<&Path>,
    options: RunOptions,
) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    let tools = ToolRegistry::new();
    let missing = missing_tools(&pipeline, &tools);
    if !missing.is_empty() && !options.dry_run {
        tracing::info!(
            tools = %missing.join(", "),
            "The CLI provides no tools; stages will run without them"
        );
    }

    let invoker = build_invoker(&options, tools)?;
    let orchestrator = PipelineOrchestrator::with_shared_invoker(pipeline, invoker);

    if options.events {
        let mut rx = orchestrator.events().subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
            }
        });
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current stage");
            on_interrupt.cancel();
        }
    });

    match orchestrator.run_with_cancellation(input, cancel).await {
        Ok(result) => {
            write_state(&result.state, output)?;
            print_summary(&result);
            Ok(())
        }
        Err(failure) => {
            write_state(&failure.state, output)?;
            print_failure(&failure);
            std::process::exit(1);
        }
    }
}

/// Tool names the pipeline asks for that `tools` cannot provide, deduplicated.
fn missing_tools(pipeline: &Pipeline, tools: &ToolRegistry) -> Vec<String> {
    let mut names: Vec<String> = pipeline
        .phases()
        .iter()
        .flat_map(|guarded| guarded.phase.stages())
        .flat_map(|stage| stage.tools())
        .filter(|name| !tools.contains(name))
        .cloned()
        .collect();
    names.sort();
    names.dedup();
    names
}

fn write_state(state: &SharedState, output: Option<&Path>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    match output {
        Some(path) => {
            std::fs::write(path, format!("{json}\n"))?;
            eprintln!("State written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn print_summary(result: &PipelineResult) {
    eprintln!(
        "\nRun {} started {} finished in {}ms",
        result.run_id,
        result
            .started_at
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        result.duration_ms
    );
    for phase in &result.phases {
        let status = match phase.status {
            PhaseStatus::Completed => "completed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Failed => "failed",
        };
        eprintln!("  {} [{}]", phase.name, status);
        for stage in &phase.stages {
            eprintln!(
                "    {} -> {} score={:.2} attempts={}{}",
                stage.stage,
                stage.output_key,
                stage.score,
                stage.attempts,
                if stage.passed { "" } else { " (below threshold)" }
            );
        }
    }
}

fn print_failure(failure: &RunFailure) {
    let location = match (&failure.phase, &failure.stage) {
        (Some(phase), Some(stage)) => format!(" in phase '{phase}', stage '{stage}'"),
        (Some(phase), None) => format!(" before phase '{phase}'"),
        _ => String::new(),
    };
    if failure.is_cancelled() {
        eprintln!("Run {} cancelled{location}; partial state kept", failure.run_id);
        return;
    }
    eprintln!(
        "Run {} failed{location}: [{:?}] {}{}",
        failure.run_id,
        failure.kind(),
        failure.error,
        failure
            .subject()
            .map(|s| format!(" (subject: {s})"))
            .unwrap_or_default()
    );
}

// ---------------------------------------------------------------------------
// validate / info
// ---------------------------------------------------------------------------

fn cmd_validate(path: Option<&Path>) -> anyhow::Result<()> {
    // Lint the unchecked build so every issue is listed, not just the first.
    let pipeline = match load_config(path)?
        .into_builder()
        .and_then(|builder| builder.build_unchecked())
    {
        Ok(pipeline) => pipeline,
        Err(e) => {
            println!("[ERROR] {e}");
            std::process::exit(1);
        }
    };
    let diagnostics = validate(&pipeline);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        let location = diag
            .stage
            .as_deref()
            .or(diag.phase.as_deref())
            .map(|l| format!(" ({l})"))
            .unwrap_or_default();
        println!("[{}] {}{}: {}", severity, diag.rule, location, diag.message);
        if let Some(fix) = &diag.fix {
            println!("        fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: Option<&Path>) -> anyhow::Result<()> {
    let pipeline = load_pipeline(path)?;
    let thresholds = pipeline.router().thresholds();

    println!("Pipeline: {}", pipeline.name());
    println!("Seed key: {}", pipeline.seed_key());
    println!(
        "Thresholds: low={} medium={} high={}",
        thresholds.low, thresholds.medium, thresholds.high
    );
    println!("Predicates: {}", pipeline.router().names().join(", "));
    println!("Phases: {}", pipeline.phases().len());
    println!("Stages: {}", pipeline.stage_count());

    for guarded in pipeline.phases() {
        let phase = &guarded.phase;
        match &guarded.guard {
            Some(guard) => println!("\n{} (when {})", phase.name(), guard),
            None => println!("\n{}", phase.name()),
        }
        if !phase.description().is_empty() {
            println!("  {}", phase.description());
        }
        for stage in phase.stages() {
            println!(
                "  - {} -> {} threshold={} max_retries={}",
                stage.name(),
                stage.output_key(),
                stage.quality_threshold(),
                stage.max_retries()
            );
            if !stage.required_inputs().is_empty() {
                println!("      requires: {}", stage.required_inputs().join(", "));
            }
            if !stage.tools().is_empty() {
                println!("      tools: {}", stage.tools().join(", "));
            }
        }
    }

    Ok(())
}
