//! shardline: sharded parallel test orchestration.
//!
//! This crate partitions a suite of test cases across shards, runs each
//! shard with a bounded pool of workers, manages the lifecycle of the
//! fixtures those tests depend on, retries failing attempts to separate
//! flaky tests from broken ones, and merges every shard's results into a
//! single deterministic report.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Registry**: Discovers test cases from a suite declaration file
//! - **Planner**: Balances cases across shards (longest-processing-time first)
//! - **Fixtures**: Scoped, lazily constructed resources with guaranteed teardown
//! - **Worker Pool**: Executes one shard with `M` concurrent workers
//! - **Retry**: Classifies final outcomes as passed, failed, flaky or skipped
//! - **Report**: Merges shard reports into the final run report
//!
//! # Example
//!
//! ```no_run
//! use shardline::config::load_config;
//! use shardline::executor::command::CommandExecutor;
//! use shardline::fixture::FixtureGraph;
//! use shardline::orchestrator::Engine;
//! use shardline::registry::{SuiteDeclaration, TestRegistry};
//! use shardline::report::NullReporter;
//! use shardline::history::DurationHistory;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("shardline.toml"))?;
//!     let suite = SuiteDeclaration::load(&config.suite.path)?;
//!     let registry = TestRegistry::discover(&suite, &DurationHistory::default())?;
//!
//!     let executor = CommandExecutor::from_config(config.executor.command_config());
//!     let engine = Engine::new(config.run.clone(), FixtureGraph::empty(), executor, NullReporter);
//!     let report = engine.run(registry.cases()).await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod artifact;
pub mod config;
pub mod error;
pub mod executor;
pub mod fixture;
pub mod history;
pub mod orchestrator;
pub mod record;
pub mod registry;
pub mod report;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use error::EngineError;
pub use orchestrator::{Engine, ShardPlan, ShardPlanner};
pub use record::{Attempt, AttemptOutcome, FinalStatus, TestResult};
pub use registry::{TestCase, TestRegistry};
pub use report::{Reporter, RunReport, ShardReport};
