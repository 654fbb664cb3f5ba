//! CLI command definitions for icafix.
//!
//! `run` executes ICA-FIX over an HCP analysis tree; `plan` shows which mode
//! and task units a run would use without invoking any tool.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::config::{FixConfig, ToolPaths};
use crate::pipeline::{Pipeline, RunPlan, RunRequest};
use crate::runner::ProcessRunner;
use crate::sink::JsonFileSink;
use crate::volume::FslTools;

/// Default output directory for summaries and metadata.
const DEFAULT_OUTPUT_DIR: &str = "./output";

/// ICA-based denoising of HCP functional runs with FIX.
#[derive(Parser)]
#[command(name = "icafix")]
#[command(about = "Run ICA-FIX denoising over an HCP analysis tree")]
#[command(version)]
#[command(
    long_about = "icafix runs hcp_fix or FIX over every task run of an HCP analysis tree.\n\nNon-steady-state frames are removed before ICA and restored on every output.\n\nExample usage:\n  icafix run --preprocessed ./hcp --config fix.yaml --output ./output\n  icafix run --previous-results ./hcp --hand-labels labels.json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run ICA-FIX over every task unit.
    Run(RunArgs),

    /// Select the mode and list task units without running anything.
    Plan(PlanArgs),
}

/// Inputs shared by `run` and `plan`.
#[derive(clap::Args, Debug, Clone)]
pub struct InputArgs {
    /// Root of a preprocessed HCP tree (runs the full hcp_fix pipeline).
    #[arg(long, conflicts_with = "previous_results")]
    pub preprocessed: Option<PathBuf>,

    /// Root of a tree holding earlier ICA-FIX results (classify and clean).
    #[arg(long)]
    pub previous_results: Option<PathBuf>,

    /// JSON table of hand-labeled noise components.
    #[arg(long, requires = "previous_results")]
    pub hand_labels: Option<PathBuf>,

    /// Configuration file (YAML or JSON).
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Override the fixed number of dummy frames.
    #[arg(long)]
    pub dummy_volumes: Option<usize>,

    /// Custom training file (requires training_file "User Defined").
    #[arg(long)]
    pub training_file: Option<PathBuf>,
}

impl InputArgs {
    fn load_config(&self) -> anyhow::Result<FixConfig> {
        let mut config = match &self.config {
            Some(path) => FixConfig::from_path(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?,
            None => FixConfig::new(),
        };
        if let Some(count) = self.dummy_volumes {
            config = config.with_dummy_volumes(count);
        }
        if let Some(path) = &self.training_file {
            config = config.with_custom_training_file(path);
        }
        Ok(config)
    }
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub inputs: InputArgs,

    /// Identifier stored with the classification metadata (defaults to the run id).
    #[arg(long)]
    pub job_id: Option<String>,

    /// Output directory for the run summary, metadata and report inputs.
    #[arg(short = 'o', long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Log every command without executing it.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Parser, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub inputs: InputArgs,

    /// Print the plan as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments without executing the command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Plan(args) => plan_command(args),
    }
}

fn prepare(
    inputs: &InputArgs,
    config: FixConfig,
    job_id: Option<String>,
    output: PathBuf,
) -> anyhow::Result<Pipeline> {
    let tools = ToolPaths::from_env();
    let runner = Arc::new(ProcessRunner::new().with_dry_run(config.dry_run));
    let volumes = Arc::new(FslTools::new(runner.clone(), tools.clone()));
    let sink = Arc::new(JsonFileSink::new(&output));
    let request = RunRequest {
        preprocessed: inputs.preprocessed.clone(),
        previous_results: inputs.previous_results.clone(),
        hand_labels: inputs.hand_labels.clone(),
        config,
        job_id,
        output_dir: output,
    };
    Ok(Pipeline::prepare(request, tools, runner, volumes, sink)?)
}

async fn run_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.inputs.load_config()?.with_dry_run(args.dry_run);
    let pipeline = prepare(&args.inputs, config, args.job_id, args.output)?;

    let summary = pipeline.run().await?;
    info!(
        "Processed {} task unit(s) in {} mode, {} tool failure(s); summary at {}",
        summary.units.len(),
        summary.mode,
        summary.tool_failures(),
        pipeline.summary_path().display()
    );
    Ok(())
}

fn plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let config = args.inputs.load_config()?.with_dry_run(true);
    let pipeline = prepare(&args.inputs, config, None, PathBuf::from(DEFAULT_OUTPUT_DIR))?;
    let plan = pipeline.plan()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
    }
    Ok(())
}

fn print_plan(plan: &RunPlan) {
    println!("Mode:     {}", plan.mode);
    println!("Root:     {}", plan.root.display());
    println!(
        "Subject:  {}  Session: {}",
        plan.identity.subject, plan.identity.session
    );
    if !plan.derivative_suffix.is_empty() {
        println!("Suffix:   {}", plan.derivative_suffix);
    }
    println!();
    for planned in &plan.units {
        let dummy = match (&planned.dummy_frames, &planned.dummy_frames_error) {
            (Some(count), _) => count.to_string(),
            (None, Some(err)) => format!("unresolved ({})", err),
            (None, None) => "-".to_string(),
        };
        let stages: Vec<String> = planned
            .stages
            .iter()
            .map(|s| s.role().to_string())
            .collect();
        println!("  {}", planned.unit.task_label);
        println!("    volume:       {}", planned.unit.volume.display());
        println!("    dummy frames: {}", dummy);
        println!("    stages:       {}", stages.join(" -> "));
    }
}
