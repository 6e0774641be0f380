//! Attempt and result records.
//!
//! An [`Attempt`] is one execution of a test case; a [`TestResult`] is the
//! ordered list of attempts for one case together with the final status
//! derived by the retry classifier. Both are serialized verbatim into shard
//! and run reports, so field names here are part of the persisted format.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    /// The attempt passed.
    Passed,
    /// The attempt failed (assertion, collaborator error or fixture setup).
    Failed,
    /// The attempt exceeded its timeout.
    TimedOut,
    /// The execution collaborator skipped the test at runtime.
    Skipped,
}

impl AttemptOutcome {
    /// Returns `true` for outcomes that count as a failure for retry purposes.
    ///
    /// Timeouts are classified exactly like failures; they are only tagged
    /// differently in the attempt record.
    pub fn is_failure(&self) -> bool {
        matches!(self, AttemptOutcome::Failed | AttemptOutcome::TimedOut)
    }
}

/// Diagnostic tag attached to a failing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptErrorKind {
    /// A fixture (or one of its dependencies) failed to set up.
    FixtureSetupError,
    /// The execution collaborator reported a failure.
    ExecutionFailed,
    /// The attempt timed out.
    ExecutionTimeout,
    /// The execution collaborator panicked.
    ExecutionPanicked,
}

/// Error details recorded in an [`Attempt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptError {
    /// Error category.
    pub kind: AttemptErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: AttemptErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One execution of a test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    /// Attempt index, starting at 0.
    pub index: u32,

    /// Wall-clock start of the attempt.
    pub started_at: DateTime<Utc>,

    /// Wall-clock end of the attempt (after test-scoped fixture teardown).
    pub finished_at: DateTime<Utc>,

    /// Measured duration in milliseconds.
    pub duration_ms: u64,

    /// Outcome of the attempt.
    pub outcome: AttemptOutcome,

    /// Error details for failed or timed out attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AttemptError>,

    /// References returned by the artifact store for diagnostic payloads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl Attempt {
    /// Returns the measured duration.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Returns the error kind, if any.
    pub fn error_kind(&self) -> Option<AttemptErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Final classification of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinalStatus {
    Passed,
    Failed,
    /// Failed at least once but passed within the retry budget.
    Flaky,
    Skipped,
}

impl FinalStatus {
    /// Short label used in console output.
    pub fn label(&self) -> &'static str {
        match self {
            FinalStatus::Passed => "PASS",
            FinalStatus::Failed => "FAIL",
            FinalStatus::Flaky => "FLAKY",
            FinalStatus::Skipped => "SKIP",
        }
    }
}

/// Why a test case was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    /// Declared `skip` or `fixme` in its metadata; never executed.
    Annotation,
    /// Not started because the shard stopped after a confirmed failure.
    UpstreamFailure,
    /// The execution collaborator skipped the test while running it.
    Runtime,
}

/// Result of a test case: its attempts and final status.
///
/// Built once, when the last permitted attempt completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    /// Test case id.
    pub id: String,

    /// Final status from the retry classifier.
    pub status: FinalStatus,

    /// Skip reason when `status` is `skipped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,

    /// Attempts in execution order.
    #[serde(default)]
    pub attempts: Vec<Attempt>,
}

impl TestResult {
    /// Creates a result from completed attempts.
    pub fn new(id: impl Into<String>, status: FinalStatus, attempts: Vec<Attempt>) -> Self {
        let skip_reason = (status == FinalStatus::Skipped).then_some(SkipReason::Runtime);
        Self {
            id: id.into(),
            status,
            skip_reason,
            attempts,
        }
    }

    /// Creates a skipped result with zero attempts.
    pub fn skipped(id: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            id: id.into(),
            status: FinalStatus::Skipped,
            skip_reason: Some(reason),
            attempts: Vec::new(),
        }
    }

    /// Sum of all attempt durations.
    pub fn total_duration(&self) -> Duration {
        self.attempts.iter().map(Attempt::duration).sum()
    }

    /// Number of attempts beyond the first.
    pub fn retries(&self) -> usize {
        self.attempts.len().saturating_sub(1)
    }

    /// The last attempt, if the case was executed.
    pub fn final_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// The first recorded error message, if any attempt failed.
    pub fn first_error(&self) -> Option<&AttemptError> {
        self.attempts.iter().find_map(|a| a.error.as_ref())
    }
}
