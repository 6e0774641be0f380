//! Report Aggregator.
//!
//! Merges shard reports into one [`RunReport`]. The merge is idempotent and
//! independent of input order: the same set of shard reports, in any order
//! and with exact duplicates, always yields an identical report.
//!
//! The aggregator is also the run's final correctness check. The union of
//! result ids must equal the id set planned for the run, exactly. Anything
//! else (a shard missing, a case dropped or reported twice, a report from
//! another run) is an [`IncompleteRunError`]; no partial report is produced.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{REPORT_SCHEMA_VERSION, RunCounts, RunReport, ShardReport, ShardSummary};
use crate::orchestrator::ShardPlan;
use crate::orchestrator::retry::RetryStats;
use crate::record::{FinalStatus, TestResult};

/// Shard reports do not add up to the planned run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IncompleteRunError {
    #[error("shard {shard} belongs to run `{found}`, expected `{expected}`")]
    RunMismatch {
        shard: usize,
        expected: String,
        found: String,
    },

    #[error("shard {shard} was cut from a different plan (fingerprint {found})")]
    PlanMismatch { shard: usize, found: String },

    #[error("shard {shard} reports {found} shards in the run, expected {expected}")]
    ShardCountMismatch {
        shard: usize,
        expected: usize,
        found: usize,
    },

    #[error("two different reports for shard {0}")]
    ConflictingShardReports(usize),

    #[error("missing reports for shards {0:?}")]
    MissingShards(Vec<usize>),

    #[error("shard index {index} is outside a run of {count} shards")]
    UnexpectedShard { index: usize, count: usize },

    #[error("test `{id}` reported by shards {first} and {second}")]
    DuplicateResult {
        id: String,
        first: usize,
        second: usize,
    },

    #[error("{} planned tests have no result: {}", .0.len(), .0.join(", "))]
    MissingResults(Vec<String>),

    #[error("{} results for tests that were never planned: {}", .0.len(), .0.join(", "))]
    UnexpectedResults(Vec<String>),
}

/// Merges shard reports against the id set planned for a run.
#[derive(Debug, Clone)]
pub struct Aggregator {
    run_id: String,
    fingerprint: Option<String>,
    shard_count: Option<usize>,
    expected: BTreeSet<String>,
}

impl Aggregator {
    /// An aggregator for `run_id` expecting exactly `expected_ids`.
    ///
    /// The shard count and plan fingerprint are taken from the reports
    /// themselves and must agree between them.
    pub fn new(run_id: impl Into<String>, expected_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            run_id: run_id.into(),
            fingerprint: None,
            shard_count: None,
            expected: expected_ids.into_iter().collect(),
        }
    }

    /// An aggregator checking reports against a persisted plan.
    pub fn for_plan(plan: &ShardPlan) -> Self {
        Self {
            run_id: plan.run_id.clone(),
            fingerprint: Some(plan.fingerprint.clone()),
            shard_count: Some(plan.shard_count),
            expected: plan.case_ids.iter().cloned().collect(),
        }
    }

    /// Merges `reports` into the run report.
    ///
    /// # Errors
    ///
    /// Returns an [`IncompleteRunError`] if a report belongs to another run
    /// or plan, two reports for one shard differ, a shard is missing, or the
    /// result ids differ from the planned ids in any way.
    ///
    /// # Example
    ///
    /// ```
    /// use shardline::report::Aggregator;
    ///
    /// let aggregator = Aggregator::new("run-1", vec!["a::t".to_string()]);
    /// // No shard reports at all cannot cover a planned test.
    /// assert!(aggregator.merge(&[]).is_err());
    /// ```
    pub fn merge(&self, reports: &[ShardReport]) -> Result<RunReport, IncompleteRunError> {
        let shards = self.collect_shards(reports)?;

        let mut results: BTreeMap<&str, (usize, &TestResult)> = BTreeMap::new();
        for (index, report) in &shards {
            for result in &report.results {
                if let Some((first, _)) = results.insert(result.id.as_str(), (*index, result)) {
                    return Err(IncompleteRunError::DuplicateResult {
                        id: result.id.clone(),
                        first: first.min(*index),
                        second: first.max(*index),
                    });
                }
            }
        }

        let missing: Vec<String> = self
            .expected
            .iter()
            .filter(|id| !results.contains_key(id.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(IncompleteRunError::MissingResults(missing));
        }
        let unexpected: Vec<String> = results
            .keys()
            .filter(|id| !self.expected.contains(**id))
            .map(|id| id.to_string())
            .collect();
        if !unexpected.is_empty() {
            return Err(IncompleteRunError::UnexpectedResults(unexpected));
        }

        let results: Vec<TestResult> = results.into_values().map(|(_, r)| r.clone()).collect();
        let summaries: Vec<ShardSummary> = shards
            .values()
            .map(|report| ShardSummary {
                index: report.shard_index,
                seed: report.seed,
                started_at: report.started_at,
                finished_at: report.finished_at,
                duration_ms: report.duration_ms,
            })
            .collect();
        let counts = count(&results, &summaries);
        let generated_at = summaries
            .iter()
            .map(|s| s.finished_at)
            .max()
            .unwrap_or_else(DateTime::<Utc>::default);

        info!(
            "Merged {} shard reports: {} passed, {} failed, {} flaky, {} skipped",
            summaries.len(),
            counts.passed,
            counts.failed,
            counts.flaky,
            counts.skipped
        );

        Ok(RunReport {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id: self.run_id.clone(),
            generated_at,
            counts,
            shards: summaries,
            results,
        })
    }

    /// Checks run identity and shard coverage, dropping exact duplicates.
    fn collect_shards<'r>(
        &self,
        reports: &'r [ShardReport],
    ) -> Result<BTreeMap<usize, &'r ShardReport>, IncompleteRunError> {
        let mut fingerprint = self.fingerprint.as_deref();
        let mut shard_count = self.shard_count;
        let mut shards: BTreeMap<usize, &ShardReport> = BTreeMap::new();

        // Sorted first, so a conflict is reported the same way whatever the
        // input order.
        let mut ordered: Vec<&ShardReport> = reports.iter().collect();
        ordered.sort_by(|a, b| {
            (a.shard_index, &a.run_id, &a.fingerprint, a.shard_count)
                .cmp(&(b.shard_index, &b.run_id, &b.fingerprint, b.shard_count))
        });

        for report in ordered {
            let shard = report.shard_index;
            if report.run_id != self.run_id {
                return Err(IncompleteRunError::RunMismatch {
                    shard,
                    expected: self.run_id.clone(),
                    found: report.run_id.clone(),
                });
            }
            match fingerprint {
                Some(expected) if expected != report.fingerprint => {
                    return Err(IncompleteRunError::PlanMismatch {
                        shard,
                        found: report.fingerprint.clone(),
                    });
                }
                Some(_) => {}
                None => fingerprint = Some(&report.fingerprint),
            }
            let expected_count = *shard_count.get_or_insert(report.shard_count);
            if report.shard_count != expected_count {
                return Err(IncompleteRunError::ShardCountMismatch {
                    shard,
                    expected: expected_count,
                    found: report.shard_count,
                });
            }
            if shard >= expected_count {
                return Err(IncompleteRunError::UnexpectedShard {
                    index: shard,
                    count: expected_count,
                });
            }

            match shards.get(&shard) {
                Some(existing) if *existing == report => {
                    debug!("Ignoring duplicate report for shard {}", shard);
                }
                Some(_) => return Err(IncompleteRunError::ConflictingShardReports(shard)),
                None => {
                    shards.insert(shard, report);
                }
            }
        }

        let missing: Vec<usize> = (0..shard_count.unwrap_or(0))
            .filter(|index| !shards.contains_key(index))
            .collect();
        if !missing.is_empty() {
            return Err(IncompleteRunError::MissingShards(missing));
        }

        Ok(shards)
    }
}

/// Computes every aggregate count in one pass over the merged results.
fn count(results: &[TestResult], shards: &[ShardSummary]) -> RunCounts {
    let mut counts = RunCounts {
        total: results.len(),
        retries: RetryStats::from_results(results).total_retries,
        wall_clock_ms: shards.iter().map(|s| s.duration_ms).max().unwrap_or(0),
        ..Default::default()
    };
    for result in results {
        match result.status {
            FinalStatus::Passed => counts.passed += 1,
            FinalStatus::Failed => counts.failed += 1,
            FinalStatus::Flaky => counts.flaky += 1,
            FinalStatus::Skipped => counts.skipped += 1,
        }
        counts.duration_ms += result.total_duration().as_millis() as u64;
    }
    counts
}
