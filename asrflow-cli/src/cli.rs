//! Command definitions for the `asrflow` binary.

use anyhow::{anyhow, Context};
use asrflow::config::PipelineConfig;
use asrflow::core::StageKind;
use asrflow::pipeline::{Orchestrator, PipelineChain};
use asrflow::report::build_report;
use asrflow::runner::StageRunner;
use asrflow::stages::StageInvocation;
use asrflow::store::{CalcDirectory, CalcStore};
use clap::Parser;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Runs ancestral sequence reconstruction stages in calculation directories.
#[derive(Parser, Debug)]
#[command(name = "asrflow")]
#[command(about = "Run ancestral sequence reconstruction stages in calculation directories")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// JSON configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Calculation store root (overrides the configuration).
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Execute a chain file (`{"stages": [...]}`) in order.
    Run(RunArgs),

    /// Execute a single stage.
    Stage(StageArgs),

    /// List calculation directories and their status.
    #[command(alias = "ls")]
    Status(StatusArgs),

    /// Commit the outputs an interrupted stage left behind.
    Resume(NameArgs),

    /// Delete an interrupted stage's directory.
    Discard(NameArgs),

    /// Build the HTML report over a tree and an ancestor directory.
    Report(ReportArgs),
}

/// Arguments for `asrflow run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Chain file.
    #[arg(long)]
    pub chain: PathBuf,
}

/// Arguments for `asrflow stage`.
#[derive(Parser, Debug)]
pub struct StageArgs {
    /// Stage kind (model_selection, gene_tree, ancestors, reconcile, bootstrap).
    #[arg(short, long)]
    pub kind: StageKind,

    /// Calculation directory to create.
    #[arg(long)]
    pub calc_dir: String,

    /// Predecessor calculation directory.
    #[arg(long)]
    pub prev: Option<String>,

    /// Stage parameter as `name=value`; values are read as JSON when they parse.
    #[arg(short, long = "param", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,

    /// Replace an existing directory.
    #[arg(long)]
    pub overwrite: bool,
}

/// Arguments for `asrflow status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Show only this directory.
    pub name: Option<String>,

    /// Print manifests as JSON.
    #[arg(long)]
    pub json: bool,
}

/// A single calculation directory name.
#[derive(Parser, Debug)]
pub struct NameArgs {
    /// Calculation directory name.
    pub name: String,
}

/// Arguments for `asrflow report`.
#[derive(Parser, Debug)]
pub struct ReportArgs {
    /// Directory holding the final tree (gene tree or reconciliation).
    #[arg(long)]
    pub tree_dir: String,

    /// Directory holding the reconstructed ancestors.
    #[arg(long)]
    pub ancestor_dir: String,

    /// Output directory for the bundle.
    #[arg(short, long, default_value = "report")]
    pub output: PathBuf,

    /// Replace an existing bundle.
    #[arg(long)]
    pub overwrite: bool,
}

impl StageArgs {
    fn into_invocation(self) -> StageInvocation {
        let mut invocation = StageInvocation::new(self.kind, self.calc_dir).overwrite(self.overwrite);
        if let Some(prev) = self.prev {
            invocation = invocation.after(prev);
        }
        for (name, value) in self.params {
            invocation = invocation.with_param(name, value);
        }
        invocation
    }
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing parameter name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Loads the configuration file, then applies environment and flag overrides.
pub fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    config.apply_env().context("invalid environment override")?;
    if let Some(root) = &cli.root {
        config.store_root.clone_from(root);
    }
    Ok(config)
}

/// Run the CLI with parsed arguments and a loaded configuration.
pub async fn run_with_cli(cli: Cli, config: PipelineConfig) -> anyhow::Result<()> {
    let store = Arc::new(
        CalcStore::open(&config.store_root)
            .with_context(|| format!("failed to open store at {}", config.store_root.display()))?,
    );

    match cli.command {
        Commands::Run(args) => run_chain_command(store, &config, args).await,
        Commands::Stage(args) => run_stage_command(store, &config, args).await,
        Commands::Status(args) => run_status_command(&store, &args),
        Commands::Resume(args) => {
            let dir = store
                .resume_stale(&args.name)
                .with_context(|| format!("failed to resume {}", args.name))?;
            println!("{}", describe(&store, &dir));
            Ok(())
        }
        Commands::Discard(args) => {
            store
                .discard_stale(&args.name)
                .with_context(|| format!("failed to discard {}", args.name))?;
            println!("discarded {}", args.name);
            Ok(())
        }
        Commands::Report(args) => {
            let bundle = build_report(&store, &args.tree_dir, &args.ancestor_dir, &args.output, args.overwrite)
                .context("failed to build report")?;
            println!("{}", bundle.index_url());
            Ok(())
        }
    }
}

fn build_runner(store: Arc<CalcStore>, config: &PipelineConfig) -> anyhow::Result<StageRunner> {
    let engines = config.engine_set().context("engine configuration is incomplete")?;
    Ok(StageRunner::new(store, engines))
}

async fn run_chain_command(store: Arc<CalcStore>, config: &PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    let mut chain = PipelineChain::from_json_file(&args.chain)
        .with_context(|| format!("failed to load chain {}", args.chain.display()))?;
    let runner = build_runner(store, config)?;
    for invocation in &mut chain.stages {
        config.apply_defaults(runner.catalog(), invocation);
    }

    let orchestrator = Orchestrator::new(runner);
    let result = orchestrator.execute(&chain).await.context("chain rejected")?;
    info!(stages = result.directories.len(), duration_ms = result.duration_ms, "Chain finished");

    let failed_stage = result.failed_stage().map(str::to_string);
    let directories = result
        .into_result()
        .with_context(|| format!("stage {} failed", failed_stage.as_deref().unwrap_or("?")))?;
    for dir in &directories {
        println!("{}", describe(orchestrator.store(), dir));
    }
    Ok(())
}

async fn run_stage_command(store: Arc<CalcStore>, config: &PipelineConfig, args: StageArgs) -> anyhow::Result<()> {
    let mut invocation = args.into_invocation();
    let runner = build_runner(Arc::clone(&store), config)?;
    config.apply_defaults(runner.catalog(), &mut invocation);

    let dir = runner
        .run(&invocation)
        .await
        .with_context(|| format!("stage {} failed", invocation.calc_dir))?;
    println!("{}", describe(&store, &dir));
    Ok(())
}

fn run_status_command(store: &CalcStore, args: &StatusArgs) -> anyhow::Result<()> {
    let dirs = match &args.name {
        Some(name) => vec![store
            .lookup(name)?
            .ok_or_else(|| anyhow!("no calculation directory named {name}"))?],
        None => store.list()?,
    };

    for dir in &dirs {
        if args.json {
            println!("{}", serde_json::to_string(dir.manifest())?);
        } else {
            println!("{}", describe(store, dir));
        }
    }
    Ok(())
}

fn describe(store: &CalcStore, dir: &CalcDirectory) -> String {
    let stale = if store.is_stale(dir) { " (stale)" } else { "" };
    format!(
        "{:<24} {:<16} {:<20} {}{stale}",
        dir.name(),
        dir.kind().as_str(),
        dir.variant(),
        dir.status()
    )
}
