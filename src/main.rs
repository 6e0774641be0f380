//! shardline CLI - sharded parallel test orchestration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shardline::artifact::{ArtifactStore, LocalArtifactStore, NullArtifactStore};
use shardline::config::{self, Config};
use shardline::executor::command::CommandExecutor;
use shardline::fixture::FixtureGraph;
use shardline::fixture::command::graph_from_config;
use shardline::history::DurationHistory;
use shardline::orchestrator::{Engine, ShardPlan};
use shardline::registry::{SuiteDeclaration, TestCase, TestRegistry};
use shardline::report::{
    Aggregator, ConsoleReporter, NullReporter, Reporter, RunReport, ShardReport, print_summary,
    write_junit,
};

/// Environment variable holding the log filter, e.g. `shardline=debug`.
const LOG_ENV: &str = "SHARDLINE_LOG";

#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Sharded parallel test orchestration", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "shardline.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides of the `[run]` and `[suite]` sections.
#[derive(Args, Default)]
struct RunOverrides {
    /// Override the shard count
    #[arg(long)]
    shards: Option<usize>,

    /// Override the workers per shard
    #[arg(short, long)]
    workers: Option<usize>,

    /// Override the retry budget
    #[arg(long)]
    retries: Option<u32>,

    /// Override the attempt timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Fix the shuffle seed
    #[arg(long)]
    seed: Option<u64>,

    /// Stop a shard after its first definitive failure
    #[arg(long)]
    stop_on_first_failure: bool,

    /// Tag expression selecting tests, e.g. "@smoke and not @slow"
    #[arg(short, long)]
    tags: Option<String>,

    /// Regular expression matched against test ids
    #[arg(short, long)]
    grep: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan, run every shard and merge the results
    Run {
        #[command(flatten)]
        overrides: RunOverrides,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Partition the suite into shards and write the plan
    Plan {
        #[command(flatten)]
        overrides: RunOverrides,

        /// Plan output path (default: <output_dir>/plan.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run one shard of a plan and write its shard report
    RunShard {
        /// Plan written by `shardline plan`
        #[arg(long)]
        plan: PathBuf,

        /// Zero-based shard index
        #[arg(long)]
        index: usize,

        #[command(flatten)]
        overrides: RunOverrides,

        /// Shard report output path (default: <output_dir>/shard-<index>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Merge shard reports into the run report
    Merge {
        /// Plan the shard reports were cut from
        #[arg(long)]
        plan: PathBuf,

        /// Shard report files
        #[arg(required = true)]
        reports: Vec<PathBuf>,

        /// Run report output path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Discover tests without running them
    Collect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Tag expression selecting tests
        #[arg(short, long)]
        tags: Option<String>,

        /// Regular expression matched against test ids
        #[arg(short, long)]
        grep: Option<String>,
    },

    /// Validate configuration, suite and fixtures
    Validate,

    /// Initialize a new configuration file and an example suite
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { overrides, junit } => run_all(&cli.config, overrides, junit, cli.verbose).await,
        Commands::Plan { overrides, output } => write_plan(&cli.config, overrides, output),
        Commands::RunShard {
            plan,
            index,
            overrides,
            output,
        } => run_shard(&cli.config, &plan, index, overrides, output, cli.verbose).await,
        Commands::Merge {
            plan,
            reports,
            output,
            junit,
        } => merge_reports(&cli.config, &plan, &reports, output, junit),
        Commands::Collect { format, tags, grep } => {
            let overrides = RunOverrides {
                tags,
                grep,
                ..Default::default()
            };
            collect_tests(&cli.config, overrides, &format)
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

fn load(config_path: &Path, overrides: &RunOverrides) -> Result<Config> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(shards) = overrides.shards {
        config.run.shard_count = shards;
    }
    if let Some(workers) = overrides.workers {
        config.run.workers_per_shard = workers;
    }
    if let Some(retries) = overrides.retries {
        config.run.retry_budget = retries;
    }
    if let Some(timeout_ms) = overrides.timeout_ms {
        config.run.attempt_timeout_ms = timeout_ms;
    }
    if overrides.seed.is_some() {
        config.run.seed = overrides.seed;
    }
    if overrides.stop_on_first_failure {
        config.run.stop_on_first_failure = true;
    }
    if overrides.tags.is_some() {
        config.suite.tags = overrides.tags.clone();
    }
    if overrides.grep.is_some() {
        config.suite.grep = overrides.grep.clone();
    }
    config.run.validate()?;

    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

/// Discovers the suite and applies the configured selection.
fn discover(config: &Config) -> Result<Vec<TestCase>> {
    let suite_path = config::expand_path(&config.suite.path);
    let suite = SuiteDeclaration::load(&suite_path)?;
    let history = DurationHistory::load(&config.report.history_path());
    let registry = TestRegistry::discover(&suite, &history)?;

    let selected = registry.selection(config.suite.tags.as_deref(), config.suite.grep.as_deref())?;
    info!(
        "Selected {} of {} tests from {}",
        selected.len(),
        registry.len(),
        suite_path.display()
    );
    Ok(selected)
}

fn fixture_graph(config: &Config) -> Result<FixtureGraph> {
    let executor = config.executor.command_config();
    let graph = graph_from_config(&config.fixtures, &executor.shell, executor.working_dir.clone())?;
    Ok(graph)
}

fn engine<R: Reporter>(config: &Config, reporter: R) -> Result<Engine<CommandExecutor, R>> {
    let executor = CommandExecutor::from_config(config.executor.command_config());
    let artifacts: Arc<dyn ArtifactStore> = match config.report.artifacts_path() {
        Some(dir) => Arc::new(LocalArtifactStore::new(dir)),
        None => Arc::new(NullArtifactStore),
    };
    Ok(Engine::new(config.run.clone(), fixture_graph(config)?, executor, reporter)
        .with_artifact_store(artifacts))
}

async fn run_all(
    config_path: &Path,
    overrides: RunOverrides,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let config = load(config_path, &overrides)?;
    let cases = discover(&config)?;

    let engine = engine(&config, ConsoleReporter::new(verbose))?;
    let report = engine.run(&cases).await?;

    finish_run(&config, &report, junit_path)?;
    std::process::exit(report.exit_code());
}

fn write_plan(config_path: &Path, overrides: RunOverrides, output: Option<PathBuf>) -> Result<()> {
    let config = load(config_path, &overrides)?;
    let cases = discover(&config)?;
    let plan = engine(&config, NullReporter)?.plan(&cases)?;

    let path = output.unwrap_or_else(|| config::expand_path(&config.report.output_dir).join("plan.json"));
    plan.save(&path)?;

    for shard in &plan.shards {
        println!(
            "Shard {}: {} tests (~{:.1}s)",
            shard.index,
            shard.len(),
            shard.estimated_ms() as f64 / 1000.0
        );
    }
    println!("Plan {} written to {}", plan.run_id, path.display());
    Ok(())
}

async fn run_shard(
    config_path: &Path,
    plan_path: &Path,
    index: usize,
    overrides: RunOverrides,
    output: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let config = load(config_path, &overrides)?;
    let plan = ShardPlan::load(plan_path)?;

    // Selection already happened at plan time; the plan decides what runs.
    let suite = SuiteDeclaration::load(&config::expand_path(&config.suite.path))?;
    let registry = TestRegistry::discover(&suite, &DurationHistory::default())?;

    let reporter = ConsoleReporter::new(verbose);
    if let Some(shard) = plan.shard(index) {
        reporter.expect_tests(shard.len());
    }
    let engine = engine(&config, reporter)?;
    let report = engine.run_shard(&plan, index, registry.cases()).await?;
    engine.reporter().finish();

    let path = output.unwrap_or_else(|| {
        config::expand_path(&config.report.output_dir).join(format!("shard-{}.json", index))
    });
    report.save(&path)?;

    let failed = report
        .results
        .iter()
        .filter(|r| r.status == shardline::FinalStatus::Failed)
        .count();
    println!(
        "Shard {} finished: {} tests, {} failed. Report written to {}",
        index,
        report.results.len(),
        failed,
        path.display()
    );
    Ok(())
}

fn merge_reports(
    config_path: &Path,
    plan_path: &Path,
    report_paths: &[PathBuf],
    output: Option<PathBuf>,
    junit_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = load(config_path, &RunOverrides::default())?;
    let plan = ShardPlan::load(plan_path)?;
    let reports = report_paths
        .iter()
        .map(|path| ShardReport::load(path))
        .collect::<Result<Vec<_>>>()?;

    let report = Aggregator::for_plan(&plan)
        .merge(&reports)
        .context("Shard reports do not form a complete run")?;

    if let Some(output) = output {
        if let (Some(dir), Some(name)) = (output.parent(), output.file_name()) {
            config.report.output_dir = dir.to_path_buf();
            config.report.report_file = name.to_string_lossy().into_owned();
        }
    }
    finish_run(&config, &report, junit_path)?;
    std::process::exit(report.exit_code());
}

/// Writes the run report, JUnit XML and duration history, then prints the
/// summary.
fn finish_run(config: &Config, report: &RunReport, junit_override: Option<PathBuf>) -> Result<()> {
    let report_path = config.report.report_path();
    report.save(&report_path)?;
    info!("Run report written to {}", report_path.display());

    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override.unwrap_or_else(|| config.report.junit_path());
        write_junit(report, &junit_path)?;
        info!("JUnit XML written to {}", junit_path.display());
    }

    let history_path = config.report.history_path();
    let mut history = DurationHistory::load(&history_path);
    history.record_report(report);
    history
        .save(&history_path)
        .with_context(|| format!("Failed to update duration history {}", history_path.display()))?;

    print_summary(report);
    Ok(())
}

fn collect_tests(config_path: &Path, overrides: RunOverrides, format: &str) -> Result<()> {
    let config = load(config_path, &overrides)?;
    let cases = discover(&config)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&cases)?;
            println!("{}", json);
        }
        _ => {
            println!("Discovered {} tests:", cases.len());
            for case in &cases {
                let tags = if case.tags.is_empty() {
                    String::new()
                } else {
                    let tags: Vec<&str> = case.tags.iter().map(String::as_str).collect();
                    format!(" [{}]", tags.join(", "))
                };
                let annotation = match case.annotation {
                    Some(annotation) => format!(" ({:?})", annotation).to_lowercase(),
                    None => String::new(),
                };
                println!("  {}{}{}", case.id, tags, annotation);
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    let checks = discover(&config).and_then(|cases| {
        let graph = fixture_graph(&config)?;
        graph.check_requirements(&cases)?;
        Ok((cases, graph))
    });
    let (cases, graph) = match checks {
        Ok(checked) => checked,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Shards: {}", config.run.shard_count);
    println!("  Workers per shard: {}", config.run.workers_per_shard);
    println!("  Retry budget: {}", config.run.retry_budget);
    println!("  Attempt timeout: {}ms", config.run.attempt_timeout_ms);
    println!("  Stop on first failure: {}", config.run.stop_on_first_failure);
    println!("  Tests: {}", cases.len());
    println!("  Fixtures: {}", graph.len());

    Ok(())
}

fn init_config() -> Result<()> {
    let config = r#"# shardline configuration file

[run]
shard_count = 2
workers_per_shard = 4
retry_budget = 1
stop_on_first_failure = false
attempt_timeout_ms = 30000

[suite]
path = "shardline-suite.toml"

[executor]
type = "command"
# Placeholders: {id} {file} {title} {attempt} {shard}
command = "echo running {id}"

[[fixtures]]
name = "server"
scope = "session"
setup = "echo http://localhost:3000"

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#;

    let suite = r#"[[file]]
path = "tests/smoke.spec"
tags = ["@smoke"]
fixtures = ["server"]

[[file.test]]
title = "home page loads"

[[file.group]]
title = "login"

[[file.group.test]]
title = "accepts valid credentials"

[[file.group.test]]
title = "shows the dashboard"
must_follow = "accepts valid credentials"
"#;

    let config_path = PathBuf::from("shardline.toml");
    let suite_path = PathBuf::from("shardline-suite.toml");
    for path in [&config_path, &suite_path] {
        if path.exists() {
            eprintln!(
                "{} already exists. Remove it first or edit manually.",
                path.display()
            );
            std::process::exit(1);
        }
    }

    std::fs::write(&config_path, config)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    std::fs::write(&suite_path, suite)
        .with_context(|| format!("Failed to write {}", suite_path.display()))?;
    println!("Created shardline.toml and shardline-suite.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  shardline run");

    Ok(())
}
