//! Retry policy and flakiness classification.
//!
//! Each test case runs through a small state machine:
//!
//! ```text
//!            ┌──────── fail/timeout, attempts left ────────┐
//!            ▼                                             │
//!   ──► attempt n ── pass ──► passed (n = 0) / flaky (n > 0)
//!            │
//!            ├── fail/timeout, budget spent ──► failed
//!            └── runtime skip ──► skipped (failed if an earlier attempt failed)
//! ```
//!
//! Cases annotated `skip`/`fixme` never reach the state machine; they are
//! skipped with zero attempts.

use crate::record::{AttemptOutcome, FinalStatus, TestResult};

/// Pass-through retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    budget: u32,
}

impl RetryPolicy {
    /// A policy allowing `budget` extra attempts after the first.
    pub fn new(budget: u32) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Upper bound on attempts per case (`budget + 1`).
    pub fn max_attempts(&self) -> u32 {
        self.budget.saturating_add(1)
    }

    /// Starts tracking a new case.
    pub fn tracker(&self) -> RetryTracker {
        RetryTracker {
            budget: self.budget,
            outcomes: Vec::new(),
        }
    }
}

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another attempt with this index.
    Retry { next_attempt: u32 },
    /// The case is resolved.
    Finish(FinalStatus),
}

/// Per-case retry state.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    budget: u32,
    outcomes: Vec<AttemptOutcome>,
}

impl RetryTracker {
    /// Records the outcome of the next attempt and decides what follows.
    ///
    /// # Example
    ///
    /// ```
    /// use shardline::orchestrator::retry::{RetryDecision, RetryPolicy};
    /// use shardline::record::{AttemptOutcome, FinalStatus};
    ///
    /// let mut tracker = RetryPolicy::new(1).tracker();
    /// assert_eq!(
    ///     tracker.record(AttemptOutcome::Failed),
    ///     RetryDecision::Retry { next_attempt: 1 }
    /// );
    /// assert_eq!(
    ///     tracker.record(AttemptOutcome::Passed),
    ///     RetryDecision::Finish(FinalStatus::Flaky)
    /// );
    /// ```
    pub fn record(&mut self, outcome: AttemptOutcome) -> RetryDecision {
        let index = self.outcomes.len() as u32;
        self.outcomes.push(outcome);

        if outcome.is_failure() && index < self.budget {
            RetryDecision::Retry {
                next_attempt: index + 1,
            }
        } else {
            RetryDecision::Finish(classify(&self.outcomes))
        }
    }

    /// Outcomes recorded so far, in attempt order.
    pub fn outcomes(&self) -> &[AttemptOutcome] {
        &self.outcomes
    }
}

/// Derives the final status from a complete attempt history.
///
/// A pass after any failure is `flaky`, never `passed`. No attempts means
/// the case was skipped.
pub fn classify(outcomes: &[AttemptOutcome]) -> FinalStatus {
    let failed_before = outcomes.iter().any(AttemptOutcome::is_failure);
    match outcomes.last() {
        None => FinalStatus::Skipped,
        Some(AttemptOutcome::Passed) if failed_before => FinalStatus::Flaky,
        Some(AttemptOutcome::Passed) => FinalStatus::Passed,
        Some(AttemptOutcome::Skipped) if failed_before => FinalStatus::Failed,
        Some(AttemptOutcome::Skipped) => FinalStatus::Skipped,
        Some(AttemptOutcome::Failed | AttemptOutcome::TimedOut) => FinalStatus::Failed,
    }
}

/// Statistics about retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryStats {
    /// Cases that ran at least once.
    pub executed_tests: usize,
    /// Attempts beyond the first, over all cases.
    pub total_retries: usize,
    /// Cases classified flaky.
    pub flaky_tests: usize,
}

impl RetryStats {
    pub fn from_results(results: &[TestResult]) -> Self {
        results.iter().fold(Self::default(), |mut stats, result| {
            if !result.attempts.is_empty() {
                stats.executed_tests += 1;
            }
            stats.total_retries += result.retries();
            if result.status == FinalStatus::Flaky {
                stats.flaky_tests += 1;
            }
            stats
        })
    }
}
