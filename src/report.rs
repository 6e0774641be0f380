//! Test reporting and output generation.
//!
//! Each shard produces one immutable [`ShardReport`]. Only the
//! [`Aggregator`] reads across shards; it merges them into the terminal
//! [`RunReport`]. Live progress goes through the [`Reporter`] trait.

pub mod aggregate;
pub mod junit;

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::orchestrator::{Shard, ShardPlan};
use crate::record::{FinalStatus, TestResult};
use crate::registry::TestCase;

pub use aggregate::{Aggregator, IncompleteRunError};
pub use junit::write_junit;

/// Version of the persisted shard and run report layout.
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Results of one shard, in planned order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardReport {
    pub schema_version: u32,
    pub run_id: String,
    /// Fingerprint of the plan this shard was cut from.
    pub fingerprint: String,
    pub shard_index: usize,
    pub shard_count: usize,
    /// Base shuffle seed of the run.
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

impl ShardReport {
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

/// Aggregate counts over a merged result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub flaky: usize,
    pub skipped: usize,
    /// Attempts beyond the first, over all cases.
    pub retries: usize,
    /// Sum of all attempt durations.
    pub duration_ms: u64,
    /// Longest shard duration.
    pub wall_clock_ms: u64,
}

impl RunCounts {
    /// Number of results with the given final status.
    pub fn count(&self, status: FinalStatus) -> usize {
        match status {
            FinalStatus::Passed => self.passed,
            FinalStatus::Failed => self.failed,
            FinalStatus::Flaky => self.flaky,
            FinalStatus::Skipped => self.skipped,
        }
    }
}

/// Timing of one shard as recorded in the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSummary {
    pub index: usize,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// The merged result of a run. Never mutated after the aggregator builds it.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | All tests passed |
/// | 1 | Some tests failed |
/// | 2 | All tests passed but some were flaky |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub schema_version: u32,
    pub run_id: String,
    /// Latest shard finish time, so merging the same inputs twice yields the
    /// same report.
    pub generated_at: DateTime<Utc>,
    pub counts: RunCounts,
    pub shards: Vec<ShardSummary>,
    /// Every result, sorted by test id.
    pub results: Vec<TestResult>,
}

impl RunReport {
    /// Returns `true` if no test failed. Flaky tests count as success.
    pub fn success(&self) -> bool {
        self.counts.failed == 0
    }

    /// Returns an appropriate process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        if self.counts.failed > 0 {
            1
        } else if self.counts.flaky > 0 {
            2
        } else {
            0
        }
    }

    pub fn get(&self, id: &str) -> Option<&TestResult> {
        self.results
            .binary_search_by(|r| r.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.results[i])
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// Writes the report as pretty JSON, atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

/// Writes `value` as pretty JSON to a temporary file next to `path`, then
/// renames it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut file, value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    file.persist(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// A test reporter receives events during a run.
///
/// Every hook has an empty default, so reporters implement only what they
/// need.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the plan exists, before any shard starts.
    async fn on_plan_complete(&self, _plan: &ShardPlan) {}

    async fn on_shard_start(&self, _shard: &Shard) {}

    /// Called before the first attempt of a case.
    async fn on_test_start(&self, _test: &TestCase) {}

    /// Called once per case, with its final result.
    async fn on_test_complete(&self, _result: &TestResult) {}

    async fn on_shard_complete(&self, _report: &ShardReport) {}

    /// Called after the shard reports merged.
    async fn on_run_complete(&self, _report: &RunReport) {}
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_plan_complete(&self, plan: &ShardPlan) {
        for reporter in &self.reporters {
            reporter.on_plan_complete(plan).await;
        }
    }

    async fn on_shard_start(&self, shard: &Shard) {
        for reporter in &self.reporters {
            reporter.on_shard_start(shard).await;
        }
    }

    async fn on_test_start(&self, test: &TestCase) {
        for reporter in &self.reporters {
            reporter.on_test_start(test).await;
        }
    }

    async fn on_test_complete(&self, result: &TestResult) {
        for reporter in &self.reporters {
            reporter.on_test_complete(result).await;
        }
    }

    async fn on_shard_complete(&self, report: &ShardReport) {
        for reporter in &self.reporters {
            reporter.on_shard_complete(report).await;
        }
    }

    async fn on_run_complete(&self, report: &RunReport) {
        for reporter in &self.reporters {
            reporter.on_run_complete(report).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: OnceLock<indicatif::ProgressBar>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: OnceLock::new(),
            verbose,
        }
    }

    /// Sizes the progress bar for a single shard run, where no plan event
    /// fires.
    pub fn expect_tests(&self, count: usize) {
        self.bar(count);
    }

    fn bar(&self, len: usize) -> &indicatif::ProgressBar {
        self.progress.get_or_init(|| {
            let pb = indicatif::ProgressBar::new(len as u64);
            if let Ok(style) = indicatif::ProgressStyle::default_bar().template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            ) {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        })
    }

    /// Clears the progress bar.
    pub fn finish(&self) {
        if let Some(pb) = self.progress.get() {
            pb.finish_and_clear();
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_plan_complete(&self, plan: &ShardPlan) {
        println!(
            "Planned {} tests across {} shards",
            plan.case_ids.len(),
            plan.shard_count
        );
        self.bar(plan.case_ids.len());
    }

    async fn on_test_start(&self, test: &TestCase) {
        if self.verbose {
            match self.progress.get() {
                Some(pb) => pb.println(format!("Running: {}", test.id)),
                None => println!("Running: {}", test.id),
            }
        }
    }

    async fn on_test_complete(&self, result: &TestResult) {
        let status = match result.status {
            FinalStatus::Passed => console::style(result.status.label()).green(),
            FinalStatus::Failed => console::style(result.status.label()).red(),
            FinalStatus::Flaky => console::style(result.status.label()).yellow().bold(),
            FinalStatus::Skipped => console::style(result.status.label()).yellow(),
        };
        let line = format!("{} {}", status, result.id);
        let show = self.verbose || matches!(result.status, FinalStatus::Failed | FinalStatus::Flaky);

        match self.progress.get() {
            Some(pb) => {
                pb.inc(1);
                if show {
                    pb.println(line);
                }
            }
            None if show => println!("{}", line),
            None => {}
        }
    }

    async fn on_run_complete(&self, _report: &RunReport) {
        self.finish();
    }
}

/// Prints a summary of test results to the console.
///
/// Displays counts with colored output, then every failed and flaky test
/// with its first recorded error.
pub fn print_summary(report: &RunReport) {
    let counts = &report.counts;
    println!();
    println!("Test Results:");
    println!("  Total:   {}", counts.total);
    println!("  Passed:  {}", console::style(counts.passed).green());
    println!("  Failed:  {}", console::style(counts.failed).red());
    println!("  Skipped: {}", console::style(counts.skipped).yellow());

    if counts.flaky > 0 {
        println!("  Flaky:   {}", console::style(counts.flaky).yellow());
    }
    if counts.retries > 0 {
        println!("  Retries: {}", counts.retries);
    }

    println!(
        "  Duration: {:.3}s (wall clock {:.3}s)",
        counts.duration_ms as f64 / 1000.0,
        counts.wall_clock_ms as f64 / 1000.0
    );

    for status in [FinalStatus::Failed, FinalStatus::Flaky] {
        if counts.count(status) == 0 {
            continue;
        }
        println!();
        println!(
            "{} tests:",
            if status == FinalStatus::Failed { "Failed" } else { "Flaky" }
        );
        for result in report.results.iter().filter(|r| r.status == status) {
            println!("  - {} ({} attempts)", result.id, result.attempts.len());
            if let Some(error) = result.first_error() {
                println!("    {}", console::style(&error.message).dim());
            }
        }
    }

    println!();
    if report.success() && counts.flaky == 0 {
        println!("{}", console::style("All tests passed!").green().bold());
    } else if report.success() {
        println!(
            "{}",
            console::style("All tests passed, some only on retry.")
                .yellow()
                .bold()
        );
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SkipReason;
    use tempfile::TempDir;

    fn report(failed: usize, flaky: usize) -> RunReport {
        RunReport {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id: "run".to_string(),
            generated_at: DateTime::<Utc>::default(),
            counts: RunCounts {
                total: 3,
                passed: 3 - failed - flaky,
                failed,
                flaky,
                ..Default::default()
            },
            shards: Vec::new(),
            results: Vec::new(),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(0, 0).exit_code(), 0);
        assert_eq!(report(1, 0).exit_code(), 1);
        assert_eq!(report(1, 1).exit_code(), 1);
        assert_eq!(report(0, 1).exit_code(), 2);
        assert!(report(0, 1).success());
    }

    #[test]
    fn test_save_and_load_preserve_report() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/report.json");
        let mut original = report(0, 0);
        original.results = vec![
            TestResult::skipped("a", SkipReason::Annotation),
            TestResult::skipped("b", SkipReason::UpstreamFailure),
        ];

        original.save(&path).unwrap();
        let loaded = RunReport::load(&path).unwrap();
        assert_eq!(loaded, original);
        assert!(loaded.get("b").is_some());
        assert!(loaded.get("c").is_none());
    }

    #[test]
    fn test_persisted_form_uses_camel_case() {
        let json = serde_json::to_value(report(0, 0)).unwrap();
        assert_eq!(json["schemaVersion"], 1);
        assert!(json.get("runId").is_some());
        assert!(json.get("generatedAt").is_some());
        assert!(json["counts"].get("wallClockMs").is_some());
    }

    #[test]
    fn test_load_missing_file_fails_with_path() {
        let err = RunReport::load(Path::new("/nonexistent/report.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/report.json"));
    }

    #[tokio::test]
    async fn test_multi_reporter_forwards() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting(Arc<AtomicUsize>);

        #[async_trait]
        impl Reporter for Counting {
            async fn on_test_complete(&self, _result: &TestResult) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let multi = MultiReporter::new()
            .with_reporter(Counting(Arc::clone(&count)))
            .with_reporter(Counting(Arc::clone(&count)))
            .with_reporter(NullReporter);
        multi
            .on_test_complete(&TestResult::skipped("a", SkipReason::Annotation))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
