//! Configuration schema definitions for shardline.
//!
//! This module defines all configuration types that can be deserialized from
//! the TOML configuration file.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig              - Shard count, workers, retries, timeouts
//! ├── SuiteConfig            - Suite declaration file and selection
//! ├── ExecutorConfig         - Tagged enum selecting the execution collaborator
//! │   └── Command            - Shell command per test attempt
//! ├── FixtureConfig[]        - Shell-command fixtures
//! └── ReportConfig           - Output, artifacts and duration history
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::fixture::FixtureScope;

/// Root configuration structure for shardline.
///
/// # TOML Structure
///
/// ```toml
/// [run]
/// shard_count = 2
/// workers_per_shard = 4
/// retry_budget = 1
///
/// [suite]
/// path = "suite.toml"
/// tags = "@smoke"
///
/// [executor]
/// type = "command"
/// command = "npx playwright test {file} -g {title}"
///
/// [[fixtures]]
/// name = "auth"
/// scope = "session"
/// setup = "./scripts/login.sh"
///
/// [report]
/// output_dir = "test-results"
/// ```
///
/// # Example
///
/// ```
/// use shardline::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [run]
///     shardCount = 3
///
///     [executor]
///     type = "command"
///     command = "true"
/// "#).unwrap();
/// assert_eq!(config.run.shard_count, 3);
/// assert_eq!(config.run.workers_per_shard, 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Run options (optional, has defaults).
    #[serde(default)]
    pub run: RunConfig,

    /// Where test declarations come from (optional, has defaults).
    #[serde(default)]
    pub suite: SuiteConfig,

    /// Execution collaborator configuration.
    pub executor: ExecutorConfig,

    /// Fixtures available to tests.
    #[serde(default)]
    pub fixtures: Vec<FixtureConfig>,

    /// Report configuration (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// The recognized run options.
///
/// Keys are accepted in snake_case or camelCase; anything else is rejected.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `shard_count` | 1 |
/// | `workers_per_shard` | 1 |
/// | `retry_budget` | 0 |
/// | `stop_on_first_failure` | false |
/// | `attempt_timeout_ms` | 30000 |
/// | `seed` | random per run |
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Number of shards the suite is partitioned into. Must be at least 1.
    #[serde(default = "default_one", alias = "shardCount")]
    pub shard_count: usize,

    /// Concurrent workers inside each shard. Must be at least 1.
    #[serde(default = "default_one", alias = "workersPerShard")]
    pub workers_per_shard: usize,

    /// Extra attempts granted to a failing test.
    ///
    /// A test gets at most `retry_budget + 1` attempts. A pass after a
    /// failure makes it flaky.
    #[serde(default, alias = "retryBudget")]
    pub retry_budget: u32,

    /// Stop starting new tests in a shard once one has definitively failed.
    #[serde(default, alias = "stopOnFirstFailure")]
    pub stop_on_first_failure: bool,

    /// Timeout of a single attempt in milliseconds. Must be positive.
    #[serde(default = "default_attempt_timeout_ms", alias = "attemptTimeoutMs")]
    pub attempt_timeout_ms: u64,

    /// Seed for the per-shard unit shuffle. Drawn randomly when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_one() -> usize {
    1
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            shard_count: default_one(),
            workers_per_shard: default_one(),
            retry_budget: 0,
            stop_on_first_failure: false,
            attempt_timeout_ms: default_attempt_timeout_ms(),
            seed: None,
        }
    }
}

impl RunConfig {
    /// Checks the value constraints of every option.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint as a [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 {
            return Err(ConfigError::InvalidShardCount(self.shard_count));
        }
        if self.workers_per_shard == 0 {
            return Err(ConfigError::InvalidWorkerCount(self.workers_per_shard));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(ConfigError::InvalidAttemptTimeout);
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Suite declaration source and default selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuiteConfig {
    /// Suite declaration file.
    ///
    /// Default: `"shardline-suite.toml"`
    #[serde(default = "default_suite_path")]
    pub path: PathBuf,

    /// Tag expression selecting tests, e.g. `"@smoke and not @slow"`.
    pub tags: Option<String>,

    /// Regular expression matched against test ids.
    pub grep: Option<String>,
}

fn default_suite_path() -> PathBuf {
    PathBuf::from("shardline-suite.toml")
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            path: default_suite_path(),
            tags: None,
            grep: None,
        }
    }
}

/// Execution collaborator configuration.
///
/// A tagged enum selecting the executor by its `type` field.
///
/// ```toml
/// [executor]
/// type = "command"
/// command = "npx playwright test {file} -g {title}"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutorConfig {
    /// Run each attempt as a shell command.
    Command(CommandExecutorConfig),
}

impl ExecutorConfig {
    pub fn command_config(&self) -> &CommandExecutorConfig {
        match self {
            ExecutorConfig::Command(config) => config,
        }
    }
}

/// Configuration for the shell-command executor.
///
/// The command template may use `{id}`, `{file}`, `{title}`, `{attempt}`
/// and `{shard}`; values are shell-quoted on substitution. Exit code 0 is a
/// pass.
///
/// # Example
///
/// ```toml
/// [executor]
/// type = "command"
/// command = "npx playwright test {file} -g {title}"
/// shell = "/bin/bash"
/// working_dir = "e2e"
///
/// [executor.env]
/// CI = "1"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CommandExecutorConfig {
    /// Command template run for every attempt.
    pub command: String,

    /// Shell used as `{shell} -c "{command}"`.
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory for spawned processes.
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for every process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub(crate) fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// A fixture backed by shell commands.
///
/// The trimmed stdout of `setup` is the fixture handle. `teardown` receives
/// it through the `{handle}` placeholder. Handles of dependencies are exported
/// as `SHARDLINE_FIXTURE_<NAME>` environment variables.
///
/// ```toml
/// [[fixtures]]
/// name = "auth"
/// scope = "session"
/// setup = "./scripts/login.sh"
/// teardown = "rm -f {handle}"
///
/// [[fixtures]]
/// name = "page"
/// scope = "test"
/// depends_on = ["auth"]
/// setup = "./scripts/open-page.sh"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureConfig {
    pub name: String,

    pub scope: FixtureScope,

    #[serde(default)]
    pub depends_on: Vec<String>,

    pub setup: String,

    pub teardown: Option<String>,
}

/// Configuration for run outputs.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `report_file` | `"report.json"` |
/// | `junit` | `true` |
/// | `junit_file` | `"junit.xml"` |
/// | `artifacts_dir` | none (payloads discarded) |
/// | `history_file` | `".shardline/durations.json"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files are written.
    ///
    /// Created automatically if it doesn't exist.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// File name of the JSON run report inside `output_dir`.
    #[serde(default = "default_report_file")]
    pub report_file: String,

    /// Whether to generate a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// File name of the JUnit report inside `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Directory receiving diagnostic payloads.
    pub artifacts_dir: Option<PathBuf>,

    /// Duration history used to balance shards.
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_report_file() -> String {
    "report.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

fn default_history_file() -> PathBuf {
    PathBuf::from(".shardline/durations.json")
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            report_file: default_report_file(),
            junit: true,
            junit_file: default_junit_file(),
            artifacts_dir: None,
            history_file: default_history_file(),
        }
    }
}

impl ReportConfig {
    pub fn report_path(&self) -> PathBuf {
        super::expand_path(&self.output_dir).join(&self.report_file)
    }

    pub fn junit_path(&self) -> PathBuf {
        super::expand_path(&self.output_dir).join(&self.junit_file)
    }

    pub fn history_path(&self) -> PathBuf {
        super::expand_path(&self.history_file)
    }

    pub fn artifacts_path(&self) -> Option<PathBuf> {
        self.artifacts_dir.as_deref().map(super::expand_path)
    }
}
