//! Test execution engine and orchestration.
//!
//! The [`Engine`] ties together the planner, the fixture manager, the
//! worker pool and the report aggregator.
//!
//! # Architecture
//!
//! ```text
//!   TestRegistry            ShardPlanner              FixtureManager
//!       │                        │                          │
//!       │ cases()                │                          │
//!       ▼                        │                          │
//!  &[TestCase] ─────────────────►│ plan_run()               │
//!                                ▼                          │
//!                           ShardPlan                       │
//!                                │                          │
//!                  ┌─────────────┼─────────────┐            │
//!                  ▼             ▼             ▼            │
//!             WorkerPool    WorkerPool    WorkerPool ◄──────┤ session/shard/test
//!             (shard 0)     (shard 1)     (shard N-1)       │ scopes
//!                  │             │             │
//!                  │   AttemptRunner + RetryTracker
//!                  ▼             ▼             ▼
//!             ShardReport   ShardReport   ShardReport
//!                  └─────────────┼─────────────┘
//!                                ▼
//!                           Aggregator::merge()
//!                                │
//!                                ▼
//!                           RunReport ──► Reporter
//! ```
//!
//! Shards can also run as separate processes: `plan` once, persist the
//! [`ShardPlan`], run each index with [`Engine::run_shard`], then merge the
//! persisted shard reports with [`Aggregator`](crate::report::Aggregator).

pub mod planner;
pub mod pool;
pub mod retry;
pub(crate) mod runner;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::artifact::{ArtifactStore, NullArtifactStore};
use crate::config::RunConfig;
use crate::error::EngineError;
use crate::executor::TestExecutor;
use crate::fixture::{FixtureGraph, FixtureManager, Scope};
use crate::registry::TestCase;
use crate::report::{Aggregator, Reporter, RunReport, ShardReport};

pub use planner::{ExecutionUnit, PlanningError, Shard, ShardPlan, ShardPlanner};
pub use pool::{PlanIdentity, PoolSettings, WorkerPool};
pub use retry::{RetryDecision, RetryPolicy, RetryStats};

/// The orchestration engine.
///
/// # Type Parameters
///
/// - `E`: The execution collaborator
/// - `R`: The reporter type
///
/// # Example
///
/// ```no_run
/// use shardline::config::RunConfig;
/// use shardline::executor::command::CommandExecutor;
/// use shardline::fixture::FixtureGraph;
/// use shardline::orchestrator::Engine;
/// use shardline::registry::TestCase;
/// use shardline::report::ConsoleReporter;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let cases = vec![TestCase::new("smoke.spec", vec![], "boots")];
///     let executor = CommandExecutor::new(Default::default());
///     let run = RunConfig {
///         shard_count: 2,
///         workers_per_shard: 4,
///         retry_budget: 1,
///         ..Default::default()
///     };
///
///     let engine = Engine::new(run, FixtureGraph::empty(), executor, ConsoleReporter::new(true));
///     let report = engine.run(&cases).await?;
///     std::process::exit(report.exit_code());
/// }
/// ```
pub struct Engine<E, R> {
    settings: RunConfig,
    fixtures: FixtureManager,
    executor: E,
    reporter: R,
    artifacts: Arc<dyn ArtifactStore>,
}

impl<E, R> Engine<E, R>
where
    E: TestExecutor,
    R: Reporter,
{
    /// Creates an engine that discards diagnostic payloads.
    ///
    /// # Arguments
    ///
    /// * `settings` - Shard count, workers, retry budget and timeouts
    /// * `graph` - Validated fixture graph
    /// * `executor` - Runs one attempt of one case
    /// * `reporter` - Receives progress events
    pub fn new(settings: RunConfig, graph: FixtureGraph, executor: E, reporter: R) -> Self {
        Self {
            settings,
            fixtures: FixtureManager::new(graph),
            executor,
            reporter,
            artifacts: Arc::new(NullArtifactStore),
        }
    }

    /// Replaces the artifact store diagnostic payloads are written to.
    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = store;
        self
    }

    pub fn settings(&self) -> &RunConfig {
        &self.settings
    }

    pub fn fixtures(&self) -> &FixtureManager {
        &self.fixtures
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Validates settings and fixture requirements, then plans `cases`.
    ///
    /// # Errors
    ///
    /// Fails before anything runs if the run settings are out of range, a
    /// case requires an unregistered fixture, or the cases cannot be
    /// partitioned (see [`ShardPlanner::plan`]).
    pub fn plan(&self, cases: &[TestCase]) -> Result<ShardPlan, EngineError> {
        self.settings.validate()?;
        self.fixtures.graph().check_requirements(cases)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let plan = ShardPlanner::new(self.settings.shard_count).plan_run(run_id, cases)?;
        info!(
            "Run {}: {} cases across {} shards",
            plan.run_id,
            plan.case_ids.len(),
            plan.shard_count
        );
        Ok(plan)
    }

    /// Plans and runs every shard in this process, then merges the results.
    ///
    /// Shards run concurrently and share one session scope, so a
    /// session-scoped fixture is constructed at most once per run.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails, or if the shard reports do not
    /// merge into a complete report.
    pub async fn run(&self, cases: &[TestCase]) -> Result<RunReport, EngineError> {
        let plan = self.plan(cases)?;
        self.reporter.on_plan_complete(&plan).await;

        let settings = PoolSettings::from_config(&self.settings, self.draw_seed());
        let catalog = catalog(cases);
        let session = self.fixtures.open_session();

        let outcomes = join_all(
            plan.shards
                .iter()
                .map(|shard| self.execute_shard(&plan, shard, &catalog, &session, settings)),
        )
        .await;
        self.release_session(&session).await;

        let reports = outcomes.into_iter().collect::<Result<Vec<_>, _>>()?;
        let report = Aggregator::for_plan(&plan).merge(&reports)?;
        self.reporter.on_run_complete(&report).await;

        Ok(report)
    }

    /// Runs one shard of a persisted plan.
    ///
    /// The shard gets its own session scope, released before this returns.
    /// `cases` must contain every case the shard names.
    ///
    /// # Errors
    ///
    /// - [`EngineError::UnknownShard`] if `index` is outside the plan
    /// - [`EngineError::UnknownCase`] if a planned case is missing from `cases`
    pub async fn run_shard(
        &self,
        plan: &ShardPlan,
        index: usize,
        cases: &[TestCase],
    ) -> Result<ShardReport, EngineError> {
        self.settings.validate()?;
        let shard = plan.shard(index).ok_or(EngineError::UnknownShard {
            index,
            count: plan.shard_count,
        })?;
        self.fixtures.graph().check_requirements(cases)?;

        let settings = PoolSettings::from_config(&self.settings, self.draw_seed());
        let session = self.fixtures.open_session();
        let report = self
            .execute_shard(plan, shard, &catalog(cases), &session, settings)
            .await;
        self.release_session(&session).await;

        report
    }

    async fn execute_shard(
        &self,
        plan: &ShardPlan,
        shard: &Shard,
        catalog: &HashMap<&str, &TestCase>,
        session: &Scope,
        settings: PoolSettings,
    ) -> Result<ShardReport, EngineError> {
        let pool = WorkerPool::new(
            &self.fixtures,
            &self.executor,
            &self.reporter,
            self.artifacts.as_ref(),
            settings,
        );
        let identity = PlanIdentity {
            run_id: &plan.run_id,
            fingerprint: &plan.fingerprint,
        };
        pool.run(identity, shard, catalog, session).await
    }

    async fn release_session(&self, session: &Scope) {
        let report = self.fixtures.release(session).await;
        for error in &report.errors {
            warn!("Session teardown: {}", error);
        }
    }

    fn draw_seed(&self) -> u64 {
        let seed = self.settings.seed.unwrap_or_else(rand::random);
        info!("Shuffle seed: {}", seed);
        seed
    }
}

fn catalog(cases: &[TestCase]) -> HashMap<&str, &TestCase> {
    cases.iter().map(|c| (c.id.as_str(), c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionContext, ExecutionOutcome};
    use crate::fixture::{FixtureDescriptor, FixtureProvider, FixtureScope, FixtureSet, FixtureValue};
    use crate::record::FinalStatus;
    use crate::report::NullReporter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysPass;

    #[async_trait]
    impl TestExecutor for AlwaysPass {
        async fn execute(&self, _ctx: ExecutionContext<'_>) -> anyhow::Result<ExecutionOutcome> {
            Ok(ExecutionOutcome::passed())
        }
    }

    fn run_config(shards: usize) -> RunConfig {
        RunConfig {
            shard_count: shards,
            workers_per_shard: 2,
            seed: Some(42),
            ..Default::default()
        }
    }

    fn cases(n: usize) -> Vec<TestCase> {
        (0..n)
            .map(|i| TestCase::new("suite.spec", vec![], format!("case {}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_run_reports_every_case() {
        let engine = Engine::new(run_config(3), FixtureGraph::empty(), AlwaysPass, NullReporter);
        let cases = cases(7);

        let report = engine.run(&cases).await.unwrap();
        assert_eq!(report.counts.total, 7);
        assert_eq!(report.counts.passed, 7);
        assert_eq!(report.shards.len(), 3);
        assert_eq!(report.exit_code(), 0);
        assert!(report.results.iter().all(|r| r.status == FinalStatus::Passed));
    }

    #[tokio::test]
    async fn test_plan_rejects_unknown_fixture() {
        let engine = Engine::new(run_config(1), FixtureGraph::empty(), AlwaysPass, NullReporter);
        let cases = vec![TestCase::new("a.spec", vec![], "t").with_fixture("db")];
        let err = engine.plan(&cases).unwrap_err();
        assert!(matches!(err, EngineError::Fixtures(_)));
    }

    #[tokio::test]
    async fn test_plan_rejects_zero_shards() {
        let engine = Engine::new(run_config(0), FixtureGraph::empty(), AlwaysPass, NullReporter);
        assert!(matches!(
            engine.plan(&cases(2)).unwrap_err(),
            EngineError::Config(_)
        ));
    }

    #[tokio::test]
    async fn test_run_shard_out_of_range() {
        let engine = Engine::new(run_config(2), FixtureGraph::empty(), AlwaysPass, NullReporter);
        let cases = cases(4);
        let plan = engine.plan(&cases).unwrap();
        let err = engine.run_shard(&plan, 2, &cases).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownShard { index: 2, count: 2 }));
    }

    #[tokio::test]
    async fn test_shards_run_separately_merge_like_in_process() {
        let engine = Engine::new(run_config(2), FixtureGraph::empty(), AlwaysPass, NullReporter);
        let cases = cases(5);
        let plan = engine.plan(&cases).unwrap();

        let mut reports = Vec::new();
        for index in (0..2).rev() {
            reports.push(engine.run_shard(&plan, index, &cases).await.unwrap());
        }
        let merged = Aggregator::for_plan(&plan).merge(&reports).unwrap();
        assert_eq!(merged.run_id, plan.run_id);
        assert_eq!(merged.counts.passed, 5);
    }

    #[derive(Default)]
    struct Counting {
        setups: AtomicUsize,
        teardowns: AtomicUsize,
    }

    #[async_trait]
    impl FixtureProvider for Arc<Counting> {
        async fn setup(&self, _deps: &FixtureSet) -> anyhow::Result<FixtureValue> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(()))
        }

        async fn teardown(&self, _value: FixtureValue) -> anyhow::Result<()> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_session_scope_released_after_run() {
        let counting = Arc::new(Counting::default());
        let graph = FixtureGraph::builder()
            .register(
                FixtureDescriptor::new("server", FixtureScope::Session),
                Arc::clone(&counting),
            )
            .build()
            .unwrap();
        let engine = Engine::new(run_config(2), graph, AlwaysPass, NullReporter);
        let cases: Vec<TestCase> = cases(4).into_iter().map(|c| c.with_fixture("server")).collect();

        let report = engine.run(&cases).await.unwrap();
        assert_eq!(report.counts.passed, 4);
        // One instance shared by both shards, torn down once the run is over.
        assert_eq!(counting.setups.load(Ordering::SeqCst), 1);
        assert_eq!(counting.teardowns.load(Ordering::SeqCst), 1);
    }
}
