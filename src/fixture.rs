//! Fixture lifecycle management.
//!
//! Fixtures are managed resources (a browser context, a logged-in session,
//! a seeded database) with a scope and a setup/teardown contract:
//!
//! - [`FixtureScope::Session`]: one instance for the whole run
//! - [`FixtureScope::Shard`]: one instance per shard worker pool
//! - [`FixtureScope::Test`]: one instance per test attempt
//!
//! Scopes nest (`session ⊇ shard ⊇ test`). Instances are created lazily on
//! first request inside the scope that owns them and cached for the rest of
//! that scope's lifetime. Concurrent requests for the same instance wait on a
//! single in-flight construction. When a scope is released, every instance it
//! created is torn down exactly once, in reverse acquisition order.
//!
//! The dependency graph between fixtures is validated up front by
//! [`FixtureGraph`]; at run time the [`FixtureManager`] only walks it.

pub mod command;
pub mod graph;
pub mod scope;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use graph::{FixtureGraph, FixtureGraphBuilder, FixtureGraphError};
pub use scope::Scope;

/// Lifetime of a fixture instance.
///
/// Ordered from narrowest to widest, so `Test < Shard < Session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureScope {
    Test,
    Shard,
    Session,
}

impl fmt::Display for FixtureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixtureScope::Test => write!(f, "test"),
            FixtureScope::Shard => write!(f, "shard"),
            FixtureScope::Session => write!(f, "session"),
        }
    }
}

/// Static description of a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureDescriptor {
    pub name: String,
    pub scope: FixtureScope,
    /// Fixtures that must be set up before this one.
    pub dependencies: Vec<String>,
}

impl FixtureDescriptor {
    pub fn new(name: impl Into<String>, scope: FixtureScope) -> Self {
        Self {
            name: name.into(),
            scope,
            dependencies: Vec::new(),
        }
    }

    /// Adds a dependency on another fixture.
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }
}

/// An opaque live fixture instance.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// Named live fixture instances handed to a provider or a test.
#[derive(Clone, Default)]
pub struct FixtureSet {
    values: BTreeMap<String, FixtureValue>,
}

impl FixtureSet {
    pub fn insert(&mut self, name: impl Into<String>, value: FixtureValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FixtureValue> {
        self.values.get(name)
    }

    /// Returns the instance downcast to a concrete type.
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.values
            .get(name)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for FixtureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Setup/teardown contract of one fixture.
///
/// `setup` receives the fixture's declared dependencies, already live. The
/// returned value is cached by the owning scope and handed back to
/// `teardown` exactly once when that scope is released.
#[async_trait]
pub trait FixtureProvider: Send + Sync {
    async fn setup(&self, dependencies: &FixtureSet) -> anyhow::Result<FixtureValue>;

    async fn teardown(&self, value: FixtureValue) -> anyhow::Result<()>;
}

/// Runtime fixture failures.
///
/// These are scoped to the request that hit them: a setup failure fails the
/// dependent attempt only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FixtureError {
    #[error("setup of fixture `{fixture}` failed: {message}")]
    SetupFailed { fixture: String, message: String },

    #[error("teardown of fixture `{fixture}` failed: {message}")]
    TeardownFailed { fixture: String, message: String },

    /// No enclosing scope of the fixture's kind is open.
    #[error("no {scope} scope is open for fixture `{fixture}`")]
    ScopeUnavailable {
        fixture: String,
        scope: FixtureScope,
    },

    #[error("unknown fixture `{0}`")]
    Unknown(String),

    /// The owning scope was released before the fixture could be handed out.
    #[error("fixture `{fixture}` was cancelled: scope `{scope}` already released")]
    Cancelled { fixture: String, scope: String },
}

/// Outcome of releasing one scope.
#[derive(Debug, Clone, Default)]
pub struct ReleaseReport {
    /// Fixtures torn down cleanly, in teardown order.
    pub released: Vec<String>,
    /// Teardown failures, in teardown order.
    pub errors: Vec<FixtureError>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Creates scopes, constructs fixtures inside them and releases them.
pub struct FixtureManager {
    graph: Arc<FixtureGraph>,
    next_scope: AtomicU64,
}

impl FixtureManager {
    pub fn new(graph: FixtureGraph) -> Self {
        Self {
            graph: Arc::new(graph),
            next_scope: AtomicU64::new(0),
        }
    }

    pub fn graph(&self) -> &FixtureGraph {
        &self.graph
    }

    fn next_id(&self) -> u64 {
        self.next_scope.fetch_add(1, Ordering::Relaxed)
    }

    /// Opens the run-wide session scope.
    pub fn open_session(&self) -> Scope {
        Scope::new(self.next_id(), FixtureScope::Session, "session".into(), None)
    }

    /// Opens a shard scope nested in `session`.
    pub fn open_shard(&self, session: &Scope, shard_index: usize) -> Scope {
        Scope::new(
            self.next_id(),
            FixtureScope::Shard,
            format!("shard-{}", shard_index),
            Some(session.clone()),
        )
    }

    /// Opens a test scope for one attempt, nested in `shard`.
    pub fn open_test(&self, shard: &Scope, test_id: &str, attempt: u32) -> Scope {
        Scope::new(
            self.next_id(),
            FixtureScope::Test,
            format!("{}#{}", test_id, attempt),
            Some(shard.clone()),
        )
    }

    /// Acquires a fixture on behalf of `scope`.
    ///
    /// The instance lives in the nearest enclosing scope of the fixture's own
    /// kind: a shard fixture requested from a test scope is owned by that
    /// test's shard scope and shared with every other test of the shard.
    ///
    /// # Errors
    ///
    /// - [`FixtureError::SetupFailed`] if the fixture or any dependency failed
    ///   to set up (the failure is cached for the owning scope's lifetime)
    /// - [`FixtureError::ScopeUnavailable`] if no scope of the right kind
    ///   encloses `scope`
    /// - [`FixtureError::Cancelled`] if the owning scope was already released
    pub fn acquire<'a>(
        &'a self,
        scope: &'a Scope,
        name: &'a str,
    ) -> BoxFuture<'a, Result<FixtureValue, FixtureError>> {
        async move {
            let descriptor = self
                .graph
                .descriptor(name)
                .ok_or_else(|| FixtureError::Unknown(name.to_string()))?;
            let owner = scope
                .find(descriptor.scope)
                .ok_or_else(|| FixtureError::ScopeUnavailable {
                    fixture: name.to_string(),
                    scope: descriptor.scope,
                })?;
            if owner.is_released() {
                return Err(FixtureError::Cancelled {
                    fixture: name.to_string(),
                    scope: owner.label().to_string(),
                });
            }

            let cell = owner.cell(name).await;
            cell.get_or_init(|| self.construct(&owner, descriptor))
                .await
                .clone()
        }
        .boxed()
    }

    async fn construct(
        &self,
        owner: &Scope,
        descriptor: &FixtureDescriptor,
    ) -> Result<FixtureValue, FixtureError> {
        let name = descriptor.name.as_str();
        let mut dependencies = FixtureSet::default();
        for dependency in &descriptor.dependencies {
            match self.acquire(owner, dependency).await {
                Ok(value) => dependencies.insert(dependency.clone(), value),
                Err(e) => {
                    return Err(FixtureError::SetupFailed {
                        fixture: name.to_string(),
                        message: format!("dependency `{}` unavailable: {}", dependency, e),
                    });
                }
            }
        }

        let provider = self
            .graph
            .provider(name)
            .ok_or_else(|| FixtureError::Unknown(name.to_string()))?;

        debug!("Setting up fixture `{}` in scope {}", name, owner.label());
        let value = match AssertUnwindSafe(provider.setup(&dependencies))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                return Err(FixtureError::SetupFailed {
                    fixture: name.to_string(),
                    message: format!("{:#}", e),
                });
            }
            Err(payload) => {
                return Err(FixtureError::SetupFailed {
                    fixture: name.to_string(),
                    message: format!("setup panicked: {}", panic_message(payload.as_ref())),
                });
            }
        };

        if owner.push_acquired(name, Arc::clone(&value)).await {
            return Ok(value);
        }

        // The scope was released while setup was in flight: nobody else will
        // ever tear this instance down.
        warn!(
            "Scope {} released during setup of `{}`, tearing it down",
            owner.label(),
            name
        );
        if let Err(e) = provider.teardown(value).await {
            warn!("Teardown of orphaned fixture `{}` failed: {:#}", name, e);
        }
        Err(FixtureError::Cancelled {
            fixture: name.to_string(),
            scope: owner.label().to_string(),
        })
    }

    /// Acquires every named fixture for `scope`, in order.
    ///
    /// Stops at the first failure; instances acquired before it stay cached
    /// in their scopes and are released with them.
    pub async fn acquire_all(
        &self,
        scope: &Scope,
        names: &[String],
    ) -> Result<FixtureSet, FixtureError> {
        let mut set = FixtureSet::default();
        for name in names {
            let value = self.acquire(scope, name).await?;
            set.insert(name.clone(), value);
        }
        Ok(set)
    }

    /// Releases a scope, tearing down its instances in reverse acquisition
    /// order.
    ///
    /// Only the first call does any work. Teardown errors and panics are
    /// logged and collected rather than propagated; they mark the scope, and
    /// the shard scope enclosing it, as degraded.
    pub async fn release(&self, scope: &Scope) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        let Some(acquired) = scope.begin_release().await else {
            debug!("Scope {} already released", scope.label());
            return report;
        };

        for (name, value) in acquired.into_iter().rev() {
            let Some(provider) = self.graph.provider(&name) else {
                continue;
            };
            debug!("Tearing down fixture `{}` in scope {}", name, scope.label());
            let message = match AssertUnwindSafe(provider.teardown(value))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {
                    report.released.push(name);
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => format!("teardown panicked: {}", panic_message(payload.as_ref())),
            };
            warn!(
                "Teardown of fixture `{}` in scope {} failed: {}",
                name,
                scope.label(),
                message
            );
            report.errors.push(FixtureError::TeardownFailed {
                fixture: name,
                message,
            });
        }

        if !report.is_clean() {
            scope.mark_degraded();
            if let Some(shard) = scope.find(FixtureScope::Shard)
                && !shard.is_degraded()
            {
                warn!("Marking scope {} degraded", shard.label());
                shard.mark_degraded();
            }
        }

        report
    }
}

impl fmt::Debug for FixtureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureManager")
            .field("graph", &self.graph)
            .finish()
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
