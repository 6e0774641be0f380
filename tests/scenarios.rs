//! End-to-end engine scenarios with scripted collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use shardline::config::RunConfig;
use shardline::executor::{ExecutionContext, ExecutionOutcome, TestExecutor};
use shardline::fixture::{
    FixtureDescriptor, FixtureGraph, FixtureProvider, FixtureScope, FixtureSet, FixtureValue,
};
use shardline::orchestrator::{Engine, PlanningError, ShardPlanner};
use shardline::record::{AttemptErrorKind, AttemptOutcome, FinalStatus, SkipReason};
use shardline::registry::TestCase;
use shardline::report::{Aggregator, IncompleteRunError, NullReporter};
use shardline::EngineError;

type Log = Arc<Mutex<Vec<String>>>;

/// Scripted execution collaborator.
///
/// `script` decides the outcome from the case title and attempt index; every
/// call is logged as `title#attempt@shard`.
struct Scripted {
    script: fn(&str, u32) -> ExecutionOutcome,
    calls: Log,
}

impl Scripted {
    fn new(script: fn(&str, u32) -> ExecutionOutcome) -> Self {
        Self {
            script,
            calls: Log::default(),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TestExecutor for Scripted {
    async fn execute(&self, ctx: ExecutionContext<'_>) -> anyhow::Result<ExecutionOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}#{}@{}", ctx.case.title, ctx.attempt, ctx.shard));
        tokio::task::yield_now().await;
        if ctx.case.title.starts_with("hang") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if ctx.case.title.starts_with("panic") {
            panic!("injected panic in {}", ctx.case.title);
        }
        Ok((self.script)(&ctx.case.title, ctx.attempt))
    }
}

fn pass(_title: &str, _attempt: u32) -> ExecutionOutcome {
    ExecutionOutcome::passed()
}

/// Fixture provider logging `setup <name>` / `teardown <name>`.
struct Probe {
    name: String,
    log: Log,
    fail_setup: bool,
    fail_next_teardown: AtomicBool,
    setup_delay: Duration,
    setups: Arc<AtomicUsize>,
}

impl Probe {
    fn new(name: &str, log: &Log) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::clone(log),
            fail_setup: false,
            fail_next_teardown: AtomicBool::new(false),
            setup_delay: Duration::ZERO,
            setups: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    fn slow_setup(mut self, delay: Duration) -> Self {
        self.setup_delay = delay;
        self
    }

    fn failing_first_teardown(self) -> Self {
        self.fail_next_teardown.store(true, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl FixtureProvider for Probe {
    async fn setup(&self, _dependencies: &FixtureSet) -> anyhow::Result<FixtureValue> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("setup {}", self.name));
        tokio::task::yield_now().await;
        if !self.setup_delay.is_zero() {
            tokio::time::sleep(self.setup_delay).await;
        }
        if self.fail_setup {
            anyhow::bail!("{} is unreachable", self.name);
        }
        Ok(Arc::new(self.name.clone()))
    }

    async fn teardown(&self, _value: FixtureValue) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("teardown {}", self.name));
        if self.fail_next_teardown.swap(false, Ordering::SeqCst) {
            anyhow::bail!("{} refused to close", self.name);
        }
        Ok(())
    }
}

fn settings(shards: usize, workers: usize, retries: u32) -> RunConfig {
    RunConfig {
        shard_count: shards,
        workers_per_shard: workers,
        retry_budget: retries,
        seed: Some(2024),
        ..Default::default()
    }
}

fn independent(n: usize) -> Vec<TestCase> {
    (1..=n)
        .map(|i| TestCase::new("suite.spec", vec![], format!("case {}", i)))
        .collect()
}

fn count(log: &[String], entry: &str) -> usize {
    log.iter().filter(|e| *e == entry).count()
}

#[tokio::test]
async fn test_flaky_case_among_ten() {
    fn seventh_fails_once(title: &str, attempt: u32) -> ExecutionOutcome {
        if title == "case 7" && attempt == 0 {
            ExecutionOutcome::failed("element not visible")
        } else {
            ExecutionOutcome::passed()
        }
    }

    let engine = Engine::new(
        settings(2, 2, 1),
        FixtureGraph::empty(),
        Scripted::new(seventh_fails_once),
        NullReporter,
    );
    let report = engine.run(&independent(10)).await.unwrap();

    assert_eq!(report.counts.total, 10);
    assert_eq!(report.counts.passed, 9);
    assert_eq!(report.counts.flaky, 1);
    assert_eq!(report.counts.failed, 0);
    assert_eq!(report.counts.retries, 1);
    assert_eq!(report.exit_code(), 2);

    let flaky = report.get("suite.spec::case 7").unwrap();
    assert_eq!(flaky.status, FinalStatus::Flaky);
    let outcomes: Vec<AttemptOutcome> = flaky.attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(outcomes, vec![AttemptOutcome::Failed, AttemptOutcome::Passed]);
}

#[tokio::test]
async fn test_must_follow_chain_stays_on_one_shard_in_order() {
    let cases = vec![
        TestCase::new("flow.spec", vec![], "a"),
        TestCase::new("flow.spec", vec![], "x"),
        TestCase::new("flow.spec", vec![], "b").must_follow("flow.spec::a"),
        TestCase::new("flow.spec", vec![], "y"),
        TestCase::new("flow.spec", vec![], "c").must_follow("flow.spec::b"),
    ];
    let executor = Scripted::new(pass);
    let engine = Engine::new(settings(4, 2, 0), FixtureGraph::empty(), executor, NullReporter);

    let plan = engine.plan(&cases).unwrap();
    let holder: Vec<usize> = plan
        .shards
        .iter()
        .filter(|s| s.case_ids().any(|id| id == "flow.spec::a"))
        .map(|s| s.index)
        .collect();
    assert_eq!(holder.len(), 1);
    let chain: Vec<&str> = plan.shards[holder[0]]
        .case_ids()
        .filter(|id| ["flow.spec::a", "flow.spec::b", "flow.spec::c"].contains(id))
        .collect();
    assert_eq!(chain, vec!["flow.spec::a", "flow.spec::b", "flow.spec::c"]);

    let report = engine.run(&cases).await.unwrap();
    assert_eq!(report.counts.passed, 5);
}

#[tokio::test]
async fn test_chain_executes_in_dependency_order() {
    let cases = vec![
        TestCase::new("flow.spec", vec![], "third").must_follow("flow.spec::second"),
        TestCase::new("flow.spec", vec![], "second").must_follow("flow.spec::first"),
        TestCase::new("flow.spec", vec![], "first"),
    ];
    let engine = Engine::new(settings(4, 3, 0), FixtureGraph::empty(), Scripted::new(pass), NullReporter);
    engine.run(&cases).await.unwrap();

    let calls = engine.executor().calls();
    let titles: Vec<&str> = calls.iter().map(|c| c.split('#').next().unwrap()).collect();
    assert_eq!(titles, vec!["first", "second", "third"]);
    let shards: HashSet<&str> = calls.iter().map(|c| c.split('@').nth(1).unwrap()).collect();
    assert_eq!(shards.len(), 1);
}

#[tokio::test]
async fn test_cyclic_constraints_abort_before_any_shard() {
    let cases = vec![
        TestCase::new("loop.spec", vec![], "a").must_follow("loop.spec::b"),
        TestCase::new("loop.spec", vec![], "b").must_follow("loop.spec::a"),
    ];
    let engine = Engine::new(settings(2, 1, 0), FixtureGraph::empty(), Scripted::new(pass), NullReporter);
    let err = engine.run(&cases).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Planning(PlanningError::CyclicConstraint(_))
    ));
    assert!(engine.executor().calls().is_empty());
}

#[tokio::test]
async fn test_session_fixture_failure_fails_dependents_only() {
    let log = Log::default();
    let server = Probe::new("server", &log).failing_setup();
    let setups = Arc::clone(&server.setups);
    let graph = FixtureGraph::builder()
        .register(FixtureDescriptor::new("server", FixtureScope::Session), server)
        .build()
        .unwrap();

    let mut cases = independent(3);
    cases.extend((1..=4).map(|i| {
        TestCase::new("server.spec", vec![], format!("needs server {}", i)).with_fixture("server")
    }));

    let executor = Scripted::new(pass);
    let engine = Engine::new(settings(2, 2, 0), graph, executor, NullReporter);
    let report = engine.run(&cases).await.unwrap();

    assert_eq!(report.counts.passed, 3);
    assert_eq!(report.counts.failed, 4);
    assert_eq!(setups.load(Ordering::SeqCst), 1);
    for result in report.results.iter().filter(|r| r.id.starts_with("server.spec")) {
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(
            result.attempts[0].error_kind(),
            Some(AttemptErrorKind::FixtureSetupError)
        );
    }
    // Dependent cases never reached the collaborator.
    assert!(engine.executor().calls().iter().all(|c| c.starts_with("case")));
}

#[tokio::test]
async fn test_stop_on_first_failure_skips_the_rest() {
    fn only_broken_fails(title: &str, _attempt: u32) -> ExecutionOutcome {
        if title == "broken" {
            ExecutionOutcome::failed("assertion failed")
        } else {
            ExecutionOutcome::passed()
        }
    }

    let mut cases = independent(8);
    cases.push(TestCase::new("suite.spec", vec![], "broken"));
    let run = RunConfig {
        stop_on_first_failure: true,
        ..settings(1, 1, 0)
    };
    let engine = Engine::new(run, FixtureGraph::empty(), Scripted::new(only_broken_fails), NullReporter);
    let report = engine.run(&cases).await.unwrap();

    assert_eq!(report.counts.total, 9);
    assert_eq!(report.counts.failed, 1);
    let executed = engine.executor().calls().len();
    assert_eq!(report.counts.passed + report.counts.failed, executed);
    assert_eq!(report.counts.skipped, 9 - executed);
    for skipped in report.results.iter().filter(|r| r.status == FinalStatus::Skipped) {
        assert_eq!(skipped.skip_reason, Some(SkipReason::UpstreamFailure));
        assert!(skipped.attempts.is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_retries_and_tears_down_each_attempt() {
    let log = Log::default();
    let graph = FixtureGraph::builder()
        .register(
            FixtureDescriptor::new("page", FixtureScope::Test),
            Probe::new("page", &log),
        )
        .build()
        .unwrap();
    let cases = vec![
        TestCase::new("slow.spec", vec![], "hangs forever").with_fixture("page"),
        TestCase::new("slow.spec", vec![], "quick").with_fixture("page"),
    ];
    let run = RunConfig {
        attempt_timeout_ms: 50,
        ..settings(1, 2, 1)
    };
    let engine = Engine::new(run, graph, Scripted::new(pass), NullReporter);
    let report = engine.run(&cases).await.unwrap();

    let hung = report.get("slow.spec::hangs forever").unwrap();
    assert_eq!(hung.status, FinalStatus::Failed);
    assert_eq!(hung.attempts.len(), 2);
    assert!(hung.attempts.iter().all(|a| a.outcome == AttemptOutcome::TimedOut));
    assert!(
        hung.attempts
            .iter()
            .all(|a| a.error_kind() == Some(AttemptErrorKind::ExecutionTimeout))
    );
    assert_eq!(report.get("slow.spec::quick").unwrap().status, FinalStatus::Passed);

    // Two attempts of the hung case plus one of the quick case.
    let log = log.lock().unwrap();
    assert_eq!(count(&log, "setup page"), 3);
    assert_eq!(count(&log, "teardown page"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_session_setup_is_not_cut_by_attempt_timeout() {
    let log = Log::default();
    let server = Probe::new("server", &log).slow_setup(Duration::from_millis(150));
    let setups = Arc::clone(&server.setups);
    let graph = FixtureGraph::builder()
        .register(FixtureDescriptor::new("server", FixtureScope::Session), server)
        .build()
        .unwrap();
    let cases: Vec<TestCase> = independent(4)
        .into_iter()
        .map(|c| c.with_fixture("server"))
        .collect();
    let run = RunConfig {
        attempt_timeout_ms: 100,
        ..settings(1, 2, 1)
    };
    let engine = Engine::new(run, graph, Scripted::new(pass), NullReporter);
    let report = engine.run(&cases).await.unwrap();

    assert_eq!(report.counts.passed, 4);
    assert!(report.results.iter().all(|r| r.attempts.len() == 1));
    assert_eq!(setups.load(Ordering::SeqCst), 1);
    let log = log.lock().unwrap();
    assert_eq!(count(&log, "teardown server"), 1);
}

#[tokio::test]
async fn test_teardown_runs_in_reverse_order_despite_panic() {
    let log = Log::default();
    let graph = FixtureGraph::builder()
        .register(
            FixtureDescriptor::new("browser", FixtureScope::Session),
            Probe::new("browser", &log),
        )
        .register(
            FixtureDescriptor::new("context", FixtureScope::Shard).depends_on("browser"),
            Probe::new("context", &log),
        )
        .register(
            FixtureDescriptor::new("page", FixtureScope::Test).depends_on("context"),
            Probe::new("page", &log),
        )
        .build()
        .unwrap();
    let cases = vec![
        TestCase::new("ui.spec", vec![], "renders").with_fixture("page"),
        TestCase::new("ui.spec", vec![], "panics").with_fixture("page"),
        TestCase::new("ui.spec", vec![], "scrolls").with_fixture("page"),
    ];
    let engine = Engine::new(settings(1, 1, 0), graph, Scripted::new(pass), NullReporter);
    let report = engine.run(&cases).await.unwrap();

    let panicked = report.get("ui.spec::panics").unwrap();
    assert_eq!(panicked.status, FinalStatus::Failed);
    assert_eq!(
        panicked.attempts[0].error_kind(),
        Some(AttemptErrorKind::ExecutionPanicked)
    );
    assert_eq!(report.counts.passed, 2);

    let log = log.lock().unwrap();
    assert_eq!(log[0..3], ["setup browser", "setup context", "setup page"]);
    assert_eq!(log[log.len() - 2..], ["teardown context", "teardown browser"]);
    for name in ["browser", "context", "page"] {
        assert_eq!(
            count(&log, &format!("setup {}", name)),
            count(&log, &format!("teardown {}", name)),
            "{} set up and torn down a different number of times",
            name
        );
    }
    assert_eq!(count(&log, "setup page"), 3);
    assert_eq!(count(&log, "setup browser"), 1);
}

#[tokio::test]
async fn test_degraded_shard_scope_is_recycled() {
    let log = Log::default();
    let context = Probe::new("context", &log);
    let context_setups = Arc::clone(&context.setups);
    let graph = FixtureGraph::builder()
        .register(FixtureDescriptor::new("context", FixtureScope::Shard), context)
        .register(
            FixtureDescriptor::new("page", FixtureScope::Test).depends_on("context"),
            Probe::new("page", &log).failing_first_teardown(),
        )
        .build()
        .unwrap();
    let cases = vec![
        TestCase::new("ui.spec", vec![], "first").with_fixture("page"),
        TestCase::new("ui.spec", vec![], "second").with_fixture("page").must_follow("ui.spec::first"),
    ];
    let engine = Engine::new(settings(1, 1, 0), graph, Scripted::new(pass), NullReporter);
    let report = engine.run(&cases).await.unwrap();

    // A teardown failure never fails the test that owned the fixture.
    assert_eq!(report.counts.passed, 2);
    assert_eq!(context_setups.load(Ordering::SeqCst), 2);
    let log = log.lock().unwrap();
    assert_eq!(count(&log, "teardown context"), 2);
}

#[tokio::test]
async fn test_session_fixture_shared_across_in_process_shards() {
    let log = Log::default();
    let graph = FixtureGraph::builder()
        .register(
            FixtureDescriptor::new("server", FixtureScope::Session),
            Probe::new("server", &log),
        )
        .build()
        .unwrap();
    let cases: Vec<TestCase> = independent(12)
        .into_iter()
        .map(|c| c.with_fixture("server"))
        .collect();
    let engine = Engine::new(settings(3, 4, 0), graph, Scripted::new(pass), NullReporter);
    let report = engine.run(&cases).await.unwrap();

    assert_eq!(report.counts.passed, 12);
    let log = log.lock().unwrap();
    assert_eq!(*log, vec!["setup server", "teardown server"]);
}

#[tokio::test]
async fn test_merge_of_separate_shards_is_order_independent() {
    fn flaky_fourth(title: &str, attempt: u32) -> ExecutionOutcome {
        if title == "case 4" && attempt == 0 {
            ExecutionOutcome::failed("timing")
        } else {
            ExecutionOutcome::passed()
        }
    }

    let cases = independent(9);
    let engine = Engine::new(settings(3, 2, 1), FixtureGraph::empty(), Scripted::new(flaky_fourth), NullReporter);
    let plan = engine.plan(&cases).unwrap();

    let mut reports = Vec::new();
    for index in 0..plan.shard_count {
        reports.push(engine.run_shard(&plan, index, &cases).await.unwrap());
    }

    let aggregator = Aggregator::for_plan(&plan);
    let baseline = aggregator.merge(&reports).unwrap();
    let baseline_json = serde_json::to_string(&baseline).unwrap();
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..10 {
        let mut shuffled = reports.clone();
        shuffled.shuffle(&mut rng);
        if rng.gen_bool(0.5) {
            shuffled.push(shuffled[0].clone());
        }
        let merged = aggregator.merge(&shuffled).unwrap();
        assert_eq!(serde_json::to_string(&merged).unwrap(), baseline_json);
    }
    assert_eq!(baseline.counts.flaky, 1);
    assert_eq!(baseline.counts.passed, 8);

    // Dropping a shard that holds cases is fatal.
    let holding = reports.iter().position(|r| !r.results.is_empty()).unwrap();
    let mut partial = reports.clone();
    partial.remove(holding);
    assert!(matches!(
        aggregator.merge(&partial),
        Err(IncompleteRunError::MissingShards(_))
    ));
}

/// Smallest achievable maximum shard load, by exhaustive search.
fn optimal_makespan(weights: &[u64], shards: usize) -> u64 {
    fn search(weights: &[u64], loads: &mut Vec<u64>, best: &mut u64) {
        let Some((&first, rest)) = weights.split_first() else {
            *best = (*best).min(loads.iter().copied().max().unwrap_or(0));
            return;
        };
        let mut seen = HashSet::new();
        for i in 0..loads.len() {
            if !seen.insert(loads[i]) || loads[i] + first >= *best {
                continue;
            }
            loads[i] += first;
            search(rest, loads, best);
            loads[i] -= first;
        }
    }

    let mut best = u64::MAX;
    search(weights, &mut vec![0; shards], &mut best);
    best
}

#[test]
fn test_lpt_within_four_thirds_of_optimal() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let n = rng.gen_range(1..=9);
        let shards = rng.gen_range(2..=4);
        let weights: Vec<u64> = (0..n).map(|_| rng.gen_range(1..=50) * 100).collect();
        let cases: Vec<TestCase> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                TestCase::new("w.spec", vec![], format!("t{}", i))
                    .with_estimate(Duration::from_millis(*w))
            })
            .collect();

        let plan = ShardPlanner::new(shards).plan(&cases).unwrap();
        let lpt = plan.iter().map(|s| s.estimated_ms()).max().unwrap();
        let optimal = optimal_makespan(&weights, shards);
        assert!(
            3 * lpt <= 4 * optimal,
            "LPT {} exceeds 4/3 of optimal {} for {:?} on {} shards",
            lpt,
            optimal,
            weights,
            shards
        );
    }
}

#[test]
fn test_plan_is_a_strict_partition() {
    let mut rng = StdRng::seed_from_u64(99);
    for _ in 0..100 {
        let n = rng.gen_range(0..40);
        let mut cases: Vec<TestCase> = Vec::with_capacity(n);
        for i in 0..n {
            let mut case = TestCase::new("p.spec", vec![], format!("t{}", i));
            if rng.gen_bool(0.5) {
                case = case.with_estimate(Duration::from_millis(rng.gen_range(1..5000)));
            }
            // Must-follow only points backwards, so constraints stay acyclic.
            if i > 0 && rng.gen_bool(0.3) {
                let target = rng.gen_range(0..i);
                case = case.must_follow(format!("p.spec::t{}", target));
            }
            cases.push(case);
        }
        let shards = rng.gen_range(1..=6);

        let plan = ShardPlanner::new(shards).plan(&cases).unwrap();
        assert_eq!(plan.len(), shards);

        let mut shard_of: HashMap<&str, (usize, usize)> = HashMap::new();
        for shard in &plan {
            for (position, id) in shard.case_ids().enumerate() {
                assert!(shard_of.insert(id, (shard.index, position)).is_none());
            }
        }
        assert_eq!(shard_of.len(), n);

        for case in &cases {
            if let Some(predecessor) = case.predecessor() {
                let (shard, position) = shard_of[case.id.as_str()];
                let (p_shard, p_position) = shard_of[predecessor];
                assert_eq!(shard, p_shard);
                assert!(p_position < position);
            }
        }
    }
}
