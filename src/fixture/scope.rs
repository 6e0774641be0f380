//! Scope instances.
//!
//! A [`Scope`] is one live instance of a [`FixtureScope`]: the session, one
//! shard's pool, or one test attempt. It owns the fixture instances created
//! in it and records their acquisition order so they can be released in
//! reverse.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OnceCell};

use super::{FixtureError, FixtureScope, FixtureValue};

pub(crate) type FixtureCell = Arc<OnceCell<Result<FixtureValue, FixtureError>>>;

#[derive(Default)]
struct ScopeState {
    acquired: Vec<(String, FixtureValue)>,
    released: bool,
}

struct ScopeInner {
    id: u64,
    kind: FixtureScope,
    label: String,
    parent: Option<Scope>,
    cells: Mutex<HashMap<String, FixtureCell>>,
    state: Mutex<ScopeState>,
    released: AtomicBool,
    degraded: AtomicBool,
}

/// A live scope instance. Cloning yields another handle to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    pub(crate) fn new(id: u64, kind: FixtureScope, label: String, parent: Option<Scope>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id,
                kind,
                label,
                parent,
                cells: Mutex::new(HashMap::new()),
                state: Mutex::new(ScopeState::default()),
                released: AtomicBool::new(false),
                degraded: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> FixtureScope {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.inner.parent.as_ref()
    }

    /// Returns the nearest scope of `kind`, starting with this one.
    pub fn find(&self, kind: FixtureScope) -> Option<Scope> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if scope.kind() == kind {
                return Some(scope.clone());
            }
            current = scope.parent();
        }
        None
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// A degraded scope had a teardown failure; the worker pool stops
    /// issuing new work from it.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_degraded(&self) {
        self.inner.degraded.store(true, Ordering::Release);
    }

    /// Returns the construction cell for a fixture, creating it on first use.
    pub(crate) async fn cell(&self, name: &str) -> FixtureCell {
        let mut cells = self.inner.cells.lock().await;
        Arc::clone(cells.entry(name.to_string()).or_default())
    }

    /// Records a constructed instance. Returns `false` if the scope was
    /// released in the meantime, in which case the caller still owns it.
    pub(crate) async fn push_acquired(&self, name: &str, value: FixtureValue) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.released {
            return false;
        }
        state.acquired.push((name.to_string(), value));
        true
    }

    /// Marks the scope released and takes its instances, in acquisition
    /// order. Returns `None` if it was already released.
    pub(crate) async fn begin_release(&self) -> Option<Vec<(String, FixtureValue)>> {
        let mut state = self.inner.state.lock().await;
        if state.released {
            return None;
        }
        state.released = true;
        self.inner.released.store(true, Ordering::Release);
        Some(std::mem::take(&mut state.acquired))
    }

    /// Names of the live instances, in acquisition order.
    pub async fn acquired_names(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state.acquired.iter().map(|(name, _)| name.clone()).collect()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("released", &self.is_released())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}
