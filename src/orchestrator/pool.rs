//! Worker pool executing one shard.
//!
//! A shard is run by exactly `M` concurrent workers pulling execution units
//! from a shared queue. A worker runs a unit's cases one after another, in
//! dependency order, each case end to end (attempts and retries included)
//! before taking the next. Units are shuffled with a seeded RNG first, so
//! hidden ordering dependencies between independent tests surface, while a
//! recorded seed makes any order reproducible.
//!
//! Workers share only the shard scope (through the fixture manager). Each
//! worker returns its own results; nothing else is shared mutably.
//!
//! # Stop on first failure
//!
//! When enabled, the first case that resolves `failed` (retries exhausted)
//! cancels a [`CancellationToken`]. Workers check it between cases, so
//! in-flight cases finish and tear down normally. Every case that never
//! started is recorded `skipped` with reason `UpstreamFailure`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::planner::Shard;
use super::retry::{RetryDecision, RetryPolicy};
use super::runner::AttemptRunner;
use crate::artifact::ArtifactStore;
use crate::config::RunConfig;
use crate::error::EngineError;
use crate::executor::TestExecutor;
use crate::fixture::{FixtureManager, Scope};
use crate::record::{FinalStatus, SkipReason, TestResult};
use crate::registry::TestCase;
use crate::report::{REPORT_SCHEMA_VERSION, Reporter, ShardReport};

/// Per-shard execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Concurrent workers (`M`).
    pub workers: usize,
    pub retry: RetryPolicy,
    pub stop_on_first_failure: bool,
    pub attempt_timeout: Duration,
    /// Base seed of the unit shuffle.
    pub seed: u64,
}

impl PoolSettings {
    pub fn from_config(run: &RunConfig, seed: u64) -> Self {
        Self {
            workers: run.workers_per_shard.max(1),
            retry: RetryPolicy::new(run.retry_budget),
            stop_on_first_failure: run.stop_on_first_failure,
            attempt_timeout: run.attempt_timeout(),
            seed,
        }
    }

    /// Seed used for one shard's shuffle.
    pub fn shard_seed(&self, shard_index: usize) -> u64 {
        self.seed.wrapping_add(shard_index as u64)
    }
}

/// Identifies the plan a shard belongs to.
#[derive(Debug, Clone, Copy)]
pub struct PlanIdentity<'a> {
    pub run_id: &'a str,
    pub fingerprint: &'a str,
}

/// The shard scope currently handed to new attempts, plus any retired ones.
///
/// A degraded shard scope (a teardown failed in it or below it) is retired
/// and replaced by a fresh one before the next attempt starts. Retired scopes
/// stay alive for attempts still using them and are released with the shard.
struct ShardScopes<'a> {
    fixtures: &'a FixtureManager,
    session: &'a Scope,
    index: usize,
    current: Mutex<Scope>,
    retired: Mutex<Vec<Scope>>,
}

impl<'a> ShardScopes<'a> {
    fn open(fixtures: &'a FixtureManager, session: &'a Scope, index: usize) -> Self {
        Self {
            fixtures,
            session,
            index,
            current: Mutex::new(fixtures.open_shard(session, index)),
            retired: Mutex::new(Vec::new()),
        }
    }

    async fn current(&self) -> Scope {
        let mut current = self.current.lock().await;
        if current.is_degraded() {
            warn!(
                "Shard scope {} (id {}) is degraded, opening a fresh one",
                current.label(),
                current.id()
            );
            let fresh = self.fixtures.open_shard(self.session, self.index);
            let old = std::mem::replace(&mut *current, fresh);
            self.retired.lock().await.push(old);
        }
        current.clone()
    }

    /// Releases every shard scope opened for this shard, oldest first.
    async fn release_all(self) {
        let mut scopes = self.retired.into_inner();
        scopes.push(self.current.into_inner());
        for scope in scopes {
            let report = self.fixtures.release(&scope).await;
            debug!(
                "Released shard scope {} (id {}): {} fixtures, {} errors",
                scope.label(),
                scope.id(),
                report.released.len(),
                report.errors.len()
            );
        }
    }
}

/// Executes the cases of one shard with bounded concurrency.
pub struct WorkerPool<'a, E, R> {
    fixtures: &'a FixtureManager,
    executor: &'a E,
    reporter: &'a R,
    artifacts: &'a dyn ArtifactStore,
    settings: PoolSettings,
}

impl<'a, E, R> WorkerPool<'a, E, R>
where
    E: TestExecutor,
    R: Reporter,
{
    pub fn new(
        fixtures: &'a FixtureManager,
        executor: &'a E,
        reporter: &'a R,
        artifacts: &'a dyn ArtifactStore,
        settings: PoolSettings,
    ) -> Self {
        Self {
            fixtures,
            executor,
            reporter,
            artifacts,
            settings,
        }
    }

    /// Runs every case of `shard` and returns its report.
    ///
    /// `catalog` maps case ids to cases; `session` is the enclosing session
    /// scope, which the caller owns and releases. All shard scopes opened
    /// here are released before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownCase`] if the shard names a case that
    /// is not in `catalog`. Nothing runs in that case.
    pub async fn run(
        &self,
        plan: PlanIdentity<'_>,
        shard: &Shard,
        catalog: &HashMap<&str, &TestCase>,
        session: &Scope,
    ) -> Result<ShardReport, EngineError> {
        let mut units: Vec<Vec<&TestCase>> = shard
            .units
            .iter()
            .map(|unit| {
                unit.case_ids
                    .iter()
                    .map(|id| {
                        catalog
                            .get(id.as_str())
                            .copied()
                            .ok_or_else(|| EngineError::UnknownCase(id.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<_, _>>()?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let seed = self.settings.shard_seed(shard.index);
        units.shuffle(&mut StdRng::seed_from_u64(seed));

        info!(
            "Shard {}/{}: {} cases in {} units, {} workers, seed {}",
            shard.index + 1,
            shard.total,
            shard.len(),
            units.len(),
            self.settings.workers,
            self.settings.seed
        );
        self.reporter.on_shard_start(shard).await;

        let queue = Mutex::new(VecDeque::from(units));
        let scopes = ShardScopes::open(self.fixtures, session, shard.index);
        let cancel = CancellationToken::new();
        let runner = AttemptRunner {
            fixtures: self.fixtures,
            executor: self.executor,
            artifacts: self.artifacts,
            timeout: self.settings.attempt_timeout,
            shard: shard.index,
        };

        let per_worker = join_all(
            (0..self.settings.workers)
                .map(|worker| self.worker(worker, &runner, &queue, &scopes, &cancel)),
        )
        .await;
        scopes.release_all().await;

        let mut results: Vec<TestResult> = per_worker.into_iter().flatten().collect();
        let finished: HashSet<String> = results.iter().map(|r| r.id.clone()).collect();
        for id in shard.case_ids().filter(|id| !finished.contains(*id)) {
            let skipped = TestResult::skipped(id, SkipReason::UpstreamFailure);
            self.reporter.on_test_complete(&skipped).await;
            results.push(skipped);
        }

        let planned: HashMap<&str, usize> = shard
            .case_ids()
            .enumerate()
            .map(|(position, id)| (id, position))
            .collect();
        results.sort_by_key(|r| planned.get(r.id.as_str()).copied().unwrap_or(usize::MAX));

        let report = ShardReport {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id: plan.run_id.to_string(),
            fingerprint: plan.fingerprint.to_string(),
            shard_index: shard.index,
            shard_count: shard.total,
            seed: self.settings.seed,
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            results,
        };
        info!(
            "Shard {}/{} finished in {:?}",
            shard.index + 1,
            shard.total,
            clock.elapsed()
        );
        self.reporter.on_shard_complete(&report).await;

        Ok(report)
    }

    async fn worker(
        &self,
        worker: usize,
        runner: &AttemptRunner<'_, E>,
        queue: &Mutex<VecDeque<Vec<&TestCase>>>,
        scopes: &ShardScopes<'_>,
        cancel: &CancellationToken,
    ) -> Vec<TestResult> {
        let mut results = Vec::new();
        'units: loop {
            let Some(unit) = queue.lock().await.pop_front() else {
                break;
            };
            for case in unit {
                if cancel.is_cancelled() {
                    debug!("Worker {} stopping: shard cancelled", worker);
                    break 'units;
                }
                let result = self.run_case(case, runner, scopes).await;
                self.reporter.on_test_complete(&result).await;

                if result.status == FinalStatus::Failed
                    && self.settings.stop_on_first_failure
                    && !cancel.is_cancelled()
                {
                    warn!(
                        "{} failed, skipping the rest of shard {}",
                        case.id, runner.shard
                    );
                    cancel.cancel();
                }
                results.push(result);
            }
        }
        results
    }

    async fn run_case(
        &self,
        case: &TestCase,
        runner: &AttemptRunner<'_, E>,
        scopes: &ShardScopes<'_>,
    ) -> TestResult {
        if case.is_annotated_skip() {
            debug!("{} is annotated {:?}, not running", case.id, case.annotation);
            return TestResult::skipped(&case.id, SkipReason::Annotation);
        }

        self.reporter.on_test_start(case).await;
        let mut tracker = self.settings.retry.tracker();
        let mut attempts = Vec::new();
        let mut index = 0;
        let status = loop {
            let shard_scope = scopes.current().await;
            let attempt = runner.run(case, index, &shard_scope).await;
            let decision = tracker.record(attempt.outcome);
            attempts.push(attempt);
            match decision {
                RetryDecision::Retry { next_attempt } => {
                    debug!("Retrying {} (attempt {})", case.id, next_attempt);
                    index = next_attempt;
                }
                RetryDecision::Finish(status) => break status,
            }
        };

        TestResult::new(&case.id, status, attempts)
    }
}
