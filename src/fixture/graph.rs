//! Validated fixture dependency graph.
//!
//! Fixture dependencies form a directed graph that must be acyclic and must
//! respect scope nesting (`session ⊇ shard ⊇ test`): a fixture may depend on
//! fixtures of the same or a wider scope, never a narrower one. Both rules
//! are checked once, when the graph is built, before any test runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use super::{FixtureDescriptor, FixtureProvider, FixtureScope};
use crate::registry::TestCase;

/// Errors detected while validating the fixture graph.
#[derive(Debug, thiserror::Error)]
pub enum FixtureGraphError {
    #[error("fixture `{0}` is declared more than once")]
    Duplicate(String),

    #[error("fixture `{fixture}` depends on unknown fixture `{dependency}`")]
    UnknownDependency { fixture: String, dependency: String },

    #[error("fixture dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// A fixture depends on a fixture with a narrower scope.
    #[error(
        "scope violation: {fixture_scope}-scoped fixture `{fixture}` cannot depend on \
         {dependency_scope}-scoped fixture `{dependency}`"
    )]
    ScopeViolation {
        fixture: String,
        fixture_scope: FixtureScope,
        dependency: String,
        dependency_scope: FixtureScope,
    },

    #[error("test `{test}` requires unknown fixture `{fixture}`")]
    UnknownRequirement { test: String, fixture: String },
}

struct FixtureEntry {
    descriptor: FixtureDescriptor,
    provider: Arc<dyn FixtureProvider>,
}

/// An acyclic, scope-consistent set of fixtures and their providers.
///
/// Built with [`FixtureGraph::builder`].
///
/// # Example
///
/// ```
/// use shardline::fixture::{FixtureDescriptor, FixtureGraph, FixtureGraphError, FixtureScope};
/// # use shardline::fixture::{FixtureProvider, FixtureSet, FixtureValue};
/// # use std::sync::Arc;
/// # struct Unit;
/// # #[async_trait::async_trait]
/// # impl FixtureProvider for Unit {
/// #     async fn setup(&self, _: &FixtureSet) -> anyhow::Result<FixtureValue> { Ok(Arc::new(())) }
/// #     async fn teardown(&self, _: FixtureValue) -> anyhow::Result<()> { Ok(()) }
/// # }
///
/// // A session fixture cannot depend on a test fixture.
/// let err = FixtureGraph::builder()
///     .register(FixtureDescriptor::new("page", FixtureScope::Test), Unit)
///     .register(
///         FixtureDescriptor::new("auth", FixtureScope::Session).depends_on("page"),
///         Unit,
///     )
///     .build()
///     .err()
///     .unwrap();
/// assert!(matches!(err, FixtureGraphError::ScopeViolation { .. }));
/// ```
#[derive(Default)]
pub struct FixtureGraph {
    entries: BTreeMap<String, FixtureEntry>,
    /// Fixture names in dependency order (dependencies first).
    order: Vec<String>,
}

impl std::fmt::Debug for FixtureGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureGraph")
            .field("order", &self.order)
            .finish()
    }
}

/// Collects fixture registrations before validation.
#[derive(Default)]
pub struct FixtureGraphBuilder {
    entries: Vec<FixtureEntry>,
}

impl FixtureGraphBuilder {
    /// Registers a fixture and its provider.
    pub fn register<P>(self, descriptor: FixtureDescriptor, provider: P) -> Self
    where
        P: FixtureProvider + 'static,
    {
        self.register_shared(descriptor, Arc::new(provider))
    }

    /// Registers a fixture with an already shared provider.
    pub fn register_shared(
        mut self,
        descriptor: FixtureDescriptor,
        provider: Arc<dyn FixtureProvider>,
    ) -> Self {
        self.entries.push(FixtureEntry {
            descriptor,
            provider,
        });
        self
    }

    /// Validates the registrations and builds the graph.
    ///
    /// # Errors
    ///
    /// - [`FixtureGraphError::Duplicate`] for repeated names
    /// - [`FixtureGraphError::UnknownDependency`] for dangling dependencies
    /// - [`FixtureGraphError::ScopeViolation`] when a wider fixture depends
    ///   on a narrower one
    /// - [`FixtureGraphError::Cycle`] for cyclic dependencies
    pub fn build(self) -> Result<FixtureGraph, FixtureGraphError> {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
        let mut entries: BTreeMap<String, FixtureEntry> = BTreeMap::new();

        for entry in self.entries {
            let name = entry.descriptor.name.clone();
            if entries.contains_key(&name) {
                return Err(FixtureGraphError::Duplicate(name));
            }
            nodes.insert(name.clone(), graph.add_node(name.clone()));
            entries.insert(name, entry);
        }

        for (name, entry) in &entries {
            for dependency in &entry.descriptor.dependencies {
                let Some(dep_entry) = entries.get(dependency) else {
                    return Err(FixtureGraphError::UnknownDependency {
                        fixture: name.clone(),
                        dependency: dependency.clone(),
                    });
                };
                if dep_entry.descriptor.scope < entry.descriptor.scope {
                    return Err(FixtureGraphError::ScopeViolation {
                        fixture: name.clone(),
                        fixture_scope: entry.descriptor.scope,
                        dependency: dependency.clone(),
                        dependency_scope: dep_entry.descriptor.scope,
                    });
                }
                graph.add_edge(nodes[dependency], nodes[name], ());
            }
        }

        let order = match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(|n| graph[n].clone()).collect(),
            Err(_) => {
                let mut cycle: Vec<String> = tarjan_scc(&graph)
                    .into_iter()
                    .find(|component| {
                        component.len() > 1 || graph.contains_edge(component[0], component[0])
                    })
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| graph[n].clone())
                    .collect();
                cycle.sort();
                return Err(FixtureGraphError::Cycle(cycle));
            }
        };

        Ok(FixtureGraph { entries, order })
    }
}

impl FixtureGraph {
    /// Starts building a graph.
    pub fn builder() -> FixtureGraphBuilder {
        FixtureGraphBuilder::default()
    }

    /// A graph with no fixtures.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn descriptor(&self, name: &str) -> Option<&FixtureDescriptor> {
        self.entries.get(name).map(|e| &e.descriptor)
    }

    pub(crate) fn provider(&self, name: &str) -> Option<Arc<dyn FixtureProvider>> {
        self.entries.get(name).map(|e| Arc::clone(&e.provider))
    }

    /// Fixture names in dependency order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `names` plus all transitive dependencies, dependencies first.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureGraphError::UnknownDependency`] if a name is not
    /// registered.
    pub fn closure(&self, names: &[String]) -> Result<Vec<String>, FixtureGraphError> {
        let mut needed: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = Vec::new();
        for name in names {
            if !self.entries.contains_key(name) {
                return Err(FixtureGraphError::UnknownDependency {
                    fixture: "<request>".to_string(),
                    dependency: name.clone(),
                });
            }
            stack.push(name);
        }
        while let Some(name) = stack.pop() {
            if needed.insert(name)
                && let Some(entry) = self.entries.get(name)
            {
                stack.extend(entry.descriptor.dependencies.iter().map(String::as_str));
            }
        }
        Ok(self
            .order
            .iter()
            .filter(|n| needed.contains(n.as_str()))
            .cloned()
            .collect())
    }

    /// Session- and shard-scoped fixtures in the closure of `names`,
    /// dependencies first. Unregistered names are ignored.
    pub fn shared_closure(&self, names: &[String]) -> Vec<String> {
        let known: Vec<String> = names
            .iter()
            .filter(|name| self.entries.contains_key(name.as_str()))
            .cloned()
            .collect();
        self.closure(&known)
            .unwrap_or_default()
            .into_iter()
            .filter(|name| {
                self.entries
                    .get(name)
                    .is_some_and(|e| e.descriptor.scope != FixtureScope::Test)
            })
            .collect()
    }

    /// Checks that every fixture required by `cases` is registered.
    pub fn check_requirements(&self, cases: &[TestCase]) -> Result<(), FixtureGraphError> {
        for case in cases {
            for fixture in &case.fixtures {
                if !self.entries.contains_key(fixture) {
                    return Err(FixtureGraphError::UnknownRequirement {
                        test: case.id.clone(),
                        fixture: fixture.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
