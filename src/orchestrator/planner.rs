//! Shard planning.
//!
//! Partitions test cases into `N` shards balanced by estimated duration,
//! using longest-processing-time-first (LPT) bin balancing:
//!
//! 1. Cases linked by `must-follow` constraints are grouped into execution
//!    units that always land on one shard, ordered by their dependencies.
//! 2. Every case gets a weight: its historical estimate, else the median of
//!    the known estimates, else a fixed default. Annotated (`skip`/`fixme`)
//!    cases never run and weigh nothing.
//! 3. Units are sorted by weight, heaviest first, and each is assigned to
//!    the shard with the lowest cumulative weight (lowest ordinal on ties).
//!
//! LPT keeps the heaviest shard within 4/3 of the optimal split.
//!
//! The output is always a strict partition of the input: no case is dropped
//! or duplicated. Anything that would break that (cyclic or dangling
//! constraints) fails with a [`PlanningError`] before any shard exists.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::registry::TestCase;
use crate::report::{read_json, write_json_atomic};

/// Weight of a case when no history exists anywhere in the suite.
pub const DEFAULT_ESTIMATE: Duration = Duration::from_secs(1);

/// Errors that prevent a valid plan.
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("shard count must be at least 1")]
    InvalidShardCount,

    /// The `must-follow` constraints form a cycle.
    #[error("cyclic must-follow constraints: {}", .0.join(" -> "))]
    CyclicConstraint(Vec<String>),

    #[error("test `{case}` must follow `{predecessor}`, which is not in the plan")]
    UnknownPredecessor { case: String, predecessor: String },

    #[error("test `{0}` appears more than once")]
    DuplicateCase(String),
}

/// Cases that must run on the same shard, in this order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionUnit {
    pub case_ids: Vec<String>,
    pub estimated_ms: u64,
}

/// One shard of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shard {
    /// Ordinal, starting at 0.
    pub index: usize,
    /// Total shard count of the plan.
    pub total: usize,
    /// Units in declaration order of their first case.
    pub units: Vec<ExecutionUnit>,
}

impl Shard {
    /// Assigned case ids in planned order.
    pub fn case_ids(&self) -> impl Iterator<Item = &str> {
        self.units
            .iter()
            .flat_map(|u| u.case_ids.iter().map(String::as_str))
    }

    pub fn estimated_ms(&self) -> u64 {
        self.units.iter().map(|u| u.estimated_ms).sum()
    }

    pub fn len(&self) -> usize {
        self.units.iter().map(|u| u.case_ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// A persisted plan: what every shard runs, and what the merged report must
/// contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardPlan {
    pub run_id: String,
    pub shard_count: usize,
    /// Digest of the shard layout; shard reports must carry the same one.
    pub fingerprint: String,
    /// Every planned case id, in declaration order.
    pub case_ids: Vec<String>,
    pub shards: Vec<Shard>,
}

impl ShardPlan {
    pub fn shard(&self, index: usize) -> Option<&Shard> {
        self.shards.get(index)
    }

    /// Loads a plan written by [`ShardPlan::save`].
    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// Writes the plan as JSON, atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

/// Computes the layout digest of a set of shards.
pub fn fingerprint(shards: &[Shard]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("shards={}\n", shards.len()).as_bytes());
    for shard in shards {
        hasher.update(format!("#{}\n", shard.index).as_bytes());
        for id in shard.case_ids() {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// LPT shard planner.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use shardline::orchestrator::ShardPlanner;
/// use shardline::registry::TestCase;
///
/// let cases: Vec<TestCase> = [5, 4, 3, 3]
///     .iter()
///     .enumerate()
///     .map(|(i, s)| {
///         TestCase::new("a.spec", vec![], format!("t{}", i))
///             .with_estimate(Duration::from_secs(*s))
///     })
///     .collect();
///
/// let shards = ShardPlanner::new(2).plan(&cases).unwrap();
/// let loads: Vec<u64> = shards.iter().map(|s| s.estimated_ms()).collect();
/// assert_eq!(loads, vec![8000, 7000]);
/// ```
#[derive(Debug, Clone)]
pub struct ShardPlanner {
    shard_count: usize,
    default_estimate: Duration,
}

impl ShardPlanner {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count,
            default_estimate: DEFAULT_ESTIMATE,
        }
    }

    /// Overrides the weight used when no case has any history.
    pub fn with_default_estimate(mut self, estimate: Duration) -> Self {
        self.default_estimate = estimate;
        self
    }

    /// Builds a complete plan with run id and fingerprint.
    pub fn plan_run(
        &self,
        run_id: impl Into<String>,
        cases: &[TestCase],
    ) -> Result<ShardPlan, PlanningError> {
        let shards = self.plan(cases)?;
        Ok(ShardPlan {
            run_id: run_id.into(),
            shard_count: self.shard_count,
            fingerprint: fingerprint(&shards),
            case_ids: cases.iter().map(|c| c.id.clone()).collect(),
            shards,
        })
    }

    /// Partitions `cases` (in declaration order) into shards.
    ///
    /// # Errors
    ///
    /// - [`PlanningError::InvalidShardCount`] if the shard count is 0
    /// - [`PlanningError::DuplicateCase`] if an id repeats
    /// - [`PlanningError::UnknownPredecessor`] if a case must follow an id
    ///   that is not in `cases`
    /// - [`PlanningError::CyclicConstraint`] if constraints form a cycle
    pub fn plan(&self, cases: &[TestCase]) -> Result<Vec<Shard>, PlanningError> {
        if self.shard_count == 0 {
            return Err(PlanningError::InvalidShardCount);
        }

        let mut positions: HashMap<&str, usize> = HashMap::with_capacity(cases.len());
        for (position, case) in cases.iter().enumerate() {
            if positions.insert(case.id.as_str(), position).is_some() {
                return Err(PlanningError::DuplicateCase(case.id.clone()));
            }
        }

        let order = constraint_order(cases, &positions)?;
        let weights = self.weights(cases);

        // Weakly connected components of the constraint graph are the units.
        let mut components = UnionFind::<usize>::new(cases.len());
        for (position, case) in cases.iter().enumerate() {
            if let Some(predecessor) = case.predecessor() {
                components.union(positions[predecessor], position);
            }
        }
        let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for position in order {
            grouped
                .entry(components.find(position))
                .or_default()
                .push(position);
        }

        // (weight, first declared position, positions in dependency order)
        let mut units: Vec<(u64, usize, Vec<usize>)> = grouped
            .into_values()
            .map(|members| {
                let weight = members.iter().map(|&p| weights[p]).sum();
                let first = members.iter().copied().min().unwrap_or_default();
                (weight, first, members)
            })
            .collect();
        units.sort_by_key(|(weight, first, _)| (Reverse(*weight), *first));

        let mut loads: BinaryHeap<Reverse<(u64, usize)>> =
            (0..self.shard_count).map(|i| Reverse((0, i))).collect();
        let mut assigned: Vec<Vec<(usize, ExecutionUnit)>> = vec![Vec::new(); self.shard_count];

        for (weight, first, members) in units {
            let Some(Reverse((load, index))) = loads.pop() else {
                break;
            };
            assigned[index].push((
                first,
                ExecutionUnit {
                    case_ids: members.iter().map(|&p| cases[p].id.clone()).collect(),
                    estimated_ms: weight,
                },
            ));
            loads.push(Reverse((load + weight, index)));
        }

        let shards: Vec<Shard> = assigned
            .into_iter()
            .enumerate()
            .map(|(index, mut units)| {
                units.sort_by_key(|(first, _)| *first);
                Shard {
                    index,
                    total: self.shard_count,
                    units: units.into_iter().map(|(_, unit)| unit).collect(),
                }
            })
            .collect();

        for shard in &shards {
            debug!(
                "Shard {}/{}: {} cases, ~{} ms",
                shard.index + 1,
                shard.total,
                shard.len(),
                shard.estimated_ms()
            );
        }
        info!(
            "Planned {} cases into {} shards",
            cases.len(),
            self.shard_count
        );

        Ok(shards)
    }

    fn weights(&self, cases: &[TestCase]) -> Vec<u64> {
        let mut known: Vec<u64> = cases
            .iter()
            .filter(|c| !c.is_annotated_skip())
            .filter_map(|c| c.estimated_duration_ms)
            .collect();
        known.sort_unstable();

        let fallback = match known.len() {
            0 => self.default_estimate.as_millis() as u64,
            n if n % 2 == 1 => known[n / 2],
            n => (known[n / 2 - 1] + known[n / 2]) / 2,
        };

        cases
            .iter()
            .map(|c| {
                if c.is_annotated_skip() {
                    0
                } else {
                    c.estimated_duration_ms.unwrap_or(fallback)
                }
            })
            .collect()
    }
}

/// Orders positions so every case comes after the case it must follow,
/// otherwise by declaration order.
fn constraint_order(
    cases: &[TestCase],
    positions: &HashMap<&str, usize>,
) -> Result<Vec<usize>, PlanningError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(cases.len(), cases.len());
    let nodes: Vec<NodeIndex> = (0..cases.len()).map(|p| graph.add_node(p)).collect();
    let mut in_degree = vec![0usize; cases.len()];

    for (position, case) in cases.iter().enumerate() {
        let Some(predecessor) = case.predecessor() else {
            continue;
        };
        let Some(&from) = positions.get(predecessor) else {
            return Err(PlanningError::UnknownPredecessor {
                case: case.id.clone(),
                predecessor: predecessor.to_string(),
            });
        };
        graph.add_edge(nodes[from], nodes[position], ());
        in_degree[position] += 1;
    }

    // Kahn's algorithm, always releasing the earliest-declared ready case.
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(p, _)| Reverse(p))
        .collect();
    let mut order = Vec::with_capacity(cases.len());
    while let Some(Reverse(position)) = ready.pop() {
        order.push(position);
        for next in graph.neighbors(nodes[position]) {
            let next = graph[next];
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() < cases.len() {
        let mut cycle: Vec<usize> = tarjan_scc(&graph)
            .into_iter()
            .find(|component| {
                component.len() > 1 || graph.contains_edge(component[0], component[0])
            })
            .unwrap_or_default()
            .into_iter()
            .map(|n| graph[n])
            .collect();
        cycle.sort_unstable();
        return Err(PlanningError::CyclicConstraint(
            cycle.into_iter().map(|p| cases[p].id.clone()).collect(),
        ));
    }

    Ok(order)
}
