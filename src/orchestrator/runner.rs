//! Single-attempt execution.
//!
//! An attempt opens a fresh test scope, acquires the case's fixtures,
//! invokes the execution collaborator under the attempt timeout, and then
//! releases the test scope on every exit path (success, failure, setup
//! error, timeout, panic). Test-scoped fixtures are never reused across
//! attempts: a retry after a timeout starts from a clean scope.
//!
//! Session- and shard-scoped fixtures are acquired before the timeout starts.
//! Their construction is shared with other tests and is never cancelled by
//! one attempt's deadline.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::artifact::{ArtifactKey, ArtifactStore};
use crate::executor::{DiagnosticPayload, ExecutionContext, ExecutionSignal, TestExecutor};
use crate::fixture::{FixtureError, FixtureManager, Scope, panic_message};
use crate::record::{Attempt, AttemptError, AttemptErrorKind, AttemptOutcome};
use crate::registry::TestCase;

/// How the attempt body ended, before timeout handling.
enum Body {
    Executed {
        signal: ExecutionSignal,
        diagnostics: Vec<DiagnosticPayload>,
    },
    FixtureFailed(FixtureError),
    Errored(String),
    Panicked(String),
}

/// Runs attempts of test cases for one shard.
pub(crate) struct AttemptRunner<'a, E> {
    pub fixtures: &'a FixtureManager,
    pub executor: &'a E,
    pub artifacts: &'a dyn ArtifactStore,
    pub timeout: Duration,
    pub shard: usize,
}

impl<E: TestExecutor> AttemptRunner<'_, E> {
    /// Runs attempt `index` of `case` inside a new test scope under
    /// `shard_scope`.
    pub async fn run(&self, case: &TestCase, index: u32, shard_scope: &Scope) -> Attempt {
        let started_at = Utc::now();
        let clock = Instant::now();
        let scope = self.fixtures.open_test(shard_scope, &case.id, index);

        let body = async {
            let fixtures = match self.fixtures.acquire_all(&scope, &case.fixtures).await {
                Ok(fixtures) => fixtures,
                Err(e) => return Body::FixtureFailed(e),
            };
            let ctx = ExecutionContext {
                case,
                attempt: index,
                shard: self.shard,
                fixtures: &fixtures,
            };
            match AssertUnwindSafe(self.executor.execute(ctx))
                .catch_unwind()
                .await
            {
                Ok(Ok(outcome)) => Body::Executed {
                    signal: outcome.signal,
                    diagnostics: outcome.diagnostics,
                },
                Ok(Err(e)) => Body::Errored(format!("{:#}", e)),
                Err(payload) => Body::Panicked(panic_message(payload.as_ref())),
            }
        };
        let shared = self.fixtures.graph().shared_closure(&case.fixtures);
        let body = match self.fixtures.acquire_all(&scope, &shared).await {
            Ok(_) => tokio::time::timeout(self.timeout, body).await,
            Err(e) => Ok(Body::FixtureFailed(e)),
        };

        // Always runs, whatever the body did.
        let release = self.fixtures.release(&scope).await;
        if !release.is_clean() {
            debug!(
                "[{}#{}] {} fixture teardown error(s); outcome unchanged",
                case.id,
                index,
                release.errors.len()
            );
        }

        let (outcome, error, payloads) = match body {
            Err(_) => (
                AttemptOutcome::TimedOut,
                Some(AttemptError::new(
                    AttemptErrorKind::ExecutionTimeout,
                    format!("attempt exceeded {} ms", self.timeout.as_millis()),
                )),
                Vec::new(),
            ),
            Ok(Body::FixtureFailed(e)) => (
                AttemptOutcome::Failed,
                Some(AttemptError::new(AttemptErrorKind::FixtureSetupError, e.to_string())),
                Vec::new(),
            ),
            Ok(Body::Errored(message)) => (
                AttemptOutcome::Failed,
                Some(AttemptError::new(AttemptErrorKind::ExecutionFailed, message)),
                Vec::new(),
            ),
            Ok(Body::Panicked(message)) => (
                AttemptOutcome::Failed,
                Some(AttemptError::new(
                    AttemptErrorKind::ExecutionPanicked,
                    format!("execution panicked: {}", message),
                )),
                Vec::new(),
            ),
            Ok(Body::Executed {
                signal,
                diagnostics,
            }) => {
                let (outcome, error) = match signal {
                    ExecutionSignal::Passed => (AttemptOutcome::Passed, None),
                    ExecutionSignal::Failed { message } => (
                        AttemptOutcome::Failed,
                        Some(AttemptError::new(AttemptErrorKind::ExecutionFailed, message)),
                    ),
                    ExecutionSignal::TimedOut => (
                        AttemptOutcome::TimedOut,
                        Some(AttemptError::new(
                            AttemptErrorKind::ExecutionTimeout,
                            "execution collaborator reported a timeout",
                        )),
                    ),
                    ExecutionSignal::Skipped { reason } => {
                        debug!("[{}#{}] skipped at run time: {}", case.id, index, reason);
                        (AttemptOutcome::Skipped, None)
                    }
                };
                (outcome, error, diagnostics)
            }
        };

        let diagnostics = self.store_diagnostics(&case.id, index, &payloads).await;
        let duration = clock.elapsed();
        debug!(
            "[{}#{}] {:?} in {:?}",
            case.id, index, outcome, duration
        );

        Attempt {
            index,
            started_at,
            finished_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            outcome,
            error,
            diagnostics,
        }
    }

    async fn store_diagnostics(
        &self,
        test_id: &str,
        attempt: u32,
        payloads: &[DiagnosticPayload],
    ) -> Vec<String> {
        let mut references = Vec::new();
        for payload in payloads {
            let key = ArtifactKey { test_id, attempt };
            match self.artifacts.store(key, payload).await {
                Ok(Some(reference)) => references.push(reference),
                Ok(None) => {}
                Err(e) => warn!(
                    "[{}#{}] failed to store artifact {}: {:#}",
                    test_id, attempt, payload.name, e
                ),
            }
        }
        references
    }
}
