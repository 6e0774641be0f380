//! Execution collaborator interface.
//!
//! The engine never drives a browser or inspects page state itself. For each
//! attempt it hands the test case and its live fixtures to a
//! [`TestExecutor`] and gets back a signal (passed, failed, timed out,
//! skipped) plus diagnostic payloads (traces, screenshots, logs) that the
//! engine forwards to the artifact store.
//!
//! [`command::CommandExecutor`] runs each attempt as a shell command.

pub mod command;

use async_trait::async_trait;

use crate::fixture::FixtureSet;
use crate::registry::TestCase;

/// What the collaborator observed for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionSignal {
    Passed,
    Failed { message: String },
    /// The collaborator gave up on its own deadline.
    TimedOut,
    /// The test skipped itself at run time.
    Skipped { reason: String },
}

/// Raw diagnostic bytes produced by an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticPayload {
    /// File-like name, e.g. `trace.zip` or `output.log`.
    pub name: String,
    pub content: Vec<u8>,
}

/// Result of one call to the execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub signal: ExecutionSignal,
    pub diagnostics: Vec<DiagnosticPayload>,
}

impl ExecutionOutcome {
    pub fn passed() -> Self {
        Self::from_signal(ExecutionSignal::Passed)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::from_signal(ExecutionSignal::Failed {
            message: message.into(),
        })
    }

    pub fn timed_out() -> Self {
        Self::from_signal(ExecutionSignal::TimedOut)
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::from_signal(ExecutionSignal::Skipped {
            reason: reason.into(),
        })
    }

    fn from_signal(signal: ExecutionSignal) -> Self {
        Self {
            signal,
            diagnostics: Vec::new(),
        }
    }

    /// Attaches a diagnostic payload.
    pub fn with_diagnostic(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.diagnostics.push(DiagnosticPayload {
            name: name.into(),
            content: content.into(),
        });
        self
    }
}

/// Everything the collaborator gets to see for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub case: &'a TestCase,
    /// Attempt index, starting at 0.
    pub attempt: u32,
    pub shard: usize,
    /// Live instances of the fixtures the case declared.
    pub fixtures: &'a FixtureSet,
}

/// The execution collaborator.
///
/// An `Err` is recorded as a failed attempt; so is a panic. The call is
/// dropped when the attempt timeout expires, so implementations must not
/// rely on running to completion.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext<'_>) -> anyhow::Result<ExecutionOutcome>;
}
