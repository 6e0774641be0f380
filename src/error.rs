//! Fatal errors surfaced to callers of the engine.
//!
//! Anything scoped to a single test is recorded in its attempts and never
//! shows up here. These errors are the ones that threaten the run's
//! invariants: the engine refuses to produce a report rather than produce
//! a wrong one.

use crate::config::ConfigError;
use crate::fixture::FixtureGraphError;
use crate::orchestrator::PlanningError;
use crate::registry::DiscoveryError;
use crate::report::IncompleteRunError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Fixtures(#[from] FixtureGraphError),

    #[error(transparent)]
    IncompleteRun(#[from] IncompleteRunError),

    #[error("shard index {index} is out of range for a plan with {count} shards")]
    UnknownShard { index: usize, count: usize },

    #[error("test `{0}` is not part of the plan's registry")]
    UnknownCase(String),
}
