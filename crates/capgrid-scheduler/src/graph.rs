//! Dependency graph — "must complete before" edges between deployments.
//!
//! Nodes live in an arena indexed by position; adjacency is stored as
//! index lists in both directions. Cycles are refused at insertion by a
//! reachability check, and every traversal uses an explicit worklist so
//! long chains never deepen the stack.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;

use capgrid_state::{DeploymentId, DeploymentState};
use tracing::debug;

use crate::error::GraphError;

#[derive(Debug, Default)]
struct Arena {
    index: HashMap<DeploymentId, usize>,
    ids: Vec<DeploymentId>,
    /// `dependencies[i]`: nodes that must complete before `i`.
    dependencies: Vec<Vec<usize>>,
    /// `dependents[i]`: nodes waiting on `i`.
    dependents: Vec<Vec<usize>>,
}

impl Arena {
    fn node(&mut self, id: DeploymentId) -> usize {
        if let Some(&idx) = self.index.get(&id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(id);
        self.dependencies.push(Vec::new());
        self.dependents.push(Vec::new());
        self.index.insert(id, idx);
        idx
    }

    /// Whether `to` is reachable from `from` along dependent edges.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut seen = vec![false; self.ids.len()];
        let mut stack = vec![from];
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            if std::mem::replace(&mut seen[n], true) {
                continue;
            }
            stack.extend(self.dependents[n].iter().copied().filter(|&m| !seen[m]));
        }
        false
    }

    fn ids_of(&self, nodes: &[usize]) -> Vec<DeploymentId> {
        nodes.iter().map(|&n| self.ids[n]).collect()
    }
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    arena: RwLock<Arena>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `id` has a node. Idempotent.
    pub fn add_node(&self, id: DeploymentId) {
        self.arena.write().expect("graph lock").node(id);
    }

    /// Record that `dependency` must complete before `dependent` may run.
    ///
    /// Returns `Ok(false)` if the edge already existed. Fails without
    /// modifying the graph if the edge would close a cycle.
    pub fn add_edge(&self, dependency: DeploymentId, dependent: DeploymentId) -> Result<bool, GraphError> {
        let mut arena = self.arena.write().expect("graph lock");
        let from = arena.node(dependency);
        let to = arena.node(dependent);

        if arena.dependencies[to].contains(&from) {
            return Ok(false);
        }
        // A path dependent → … → dependency plus the new edge is a cycle.
        if arena.reaches(to, from) {
            return Err(GraphError::CycleDetected { dependency, dependent });
        }

        arena.dependencies[to].push(from);
        arena.dependents[from].push(to);
        debug!(dependency, dependent, "dependency edge added");
        Ok(true)
    }

    pub fn dependencies(&self, id: DeploymentId) -> Vec<DeploymentId> {
        let arena = self.arena.read().expect("graph lock");
        match arena.index.get(&id) {
            Some(&n) => arena.ids_of(&arena.dependencies[n]),
            None => Vec::new(),
        }
    }

    pub fn dependents(&self, id: DeploymentId) -> Vec<DeploymentId> {
        let arena = self.arena.read().expect("graph lock");
        match arena.index.get(&id) {
            Some(&n) => arena.ids_of(&arena.dependents[n]),
            None => Vec::new(),
        }
    }

    /// True iff every dependency of `id` is `Completed`.
    ///
    /// `state_of` is consulted after the graph lock is released.
    pub fn is_ready(&self, id: DeploymentId, state_of: impl Fn(DeploymentId) -> Option<DeploymentState>) -> bool {
        self.dependencies(id)
            .into_iter()
            .all(|dep| state_of(dep) == Some(DeploymentState::Completed))
    }

    /// Every transitive dependent of `root`, breadth-first, each once.
    pub fn transitive_dependents(&self, root: DeploymentId) -> Vec<DeploymentId> {
        let arena = self.arena.read().expect("graph lock");
        let Some(&start) = arena.index.get(&root) else {
            return Vec::new();
        };

        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut order = Vec::new();
        while let Some(n) = queue.pop_front() {
            for &m in &arena.dependents[n] {
                if seen.insert(m) {
                    order.push(arena.ids[m]);
                    queue.push_back(m);
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_self_edge() {
        let graph = DependencyGraph::new();
        assert_eq!(
            graph.add_edge(1, 1),
            Err(GraphError::CycleDetected { dependency: 1, dependent: 1 })
        );
    }

    #[test]
    fn rejects_transitive_cycle_and_leaves_graph_untouched() {
        let graph = DependencyGraph::new();
        graph.add_edge(1, 2).unwrap();
        graph.add_edge(2, 3).unwrap();

        assert_eq!(
            graph.add_edge(3, 1),
            Err(GraphError::CycleDetected { dependency: 3, dependent: 1 })
        );
        assert!(graph.dependencies(1).is_empty());
        assert!(graph.dependents(3).is_empty());
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let graph = DependencyGraph::new();
        graph.add_edge(1, 2).unwrap();
        graph.add_edge(1, 3).unwrap();
        graph.add_edge(2, 4).unwrap();
        assert!(graph.add_edge(3, 4).unwrap());
        assert_eq!(graph.dependencies(4), vec![2, 3]);
    }

    #[test]
    fn duplicate_edge_reports_false() {
        let graph = DependencyGraph::new();
        assert!(graph.add_edge(1, 2).unwrap());
        assert!(!graph.add_edge(1, 2).unwrap());
        assert_eq!(graph.dependents(1), vec![2]);
    }

    #[test]
    fn readiness_requires_all_completed() {
        let graph = DependencyGraph::new();
        graph.add_edge(1, 3).unwrap();
        graph.add_edge(2, 3).unwrap();

        let states = |done: &'static [DeploymentId]| {
            move |id: DeploymentId| {
                Some(if done.contains(&id) {
                    DeploymentState::Completed
                } else {
                    DeploymentState::Running
                })
            }
        };
        assert!(!graph.is_ready(3, states(&[1])));
        assert!(graph.is_ready(3, states(&[1, 2])));
        // No dependencies at all.
        graph.add_node(9);
        assert!(graph.is_ready(9, states(&[])));
    }

    #[test]
    fn transitive_dependents_breadth_first() {
        let graph = DependencyGraph::new();
        graph.add_edge(1, 2).unwrap();
        graph.add_edge(1, 3).unwrap();
        graph.add_edge(2, 4).unwrap();
        graph.add_edge(3, 4).unwrap();
        graph.add_edge(4, 5).unwrap();

        assert_eq!(graph.transitive_dependents(1), vec![2, 3, 4, 5]);
        assert!(graph.transitive_dependents(5).is_empty());
        assert!(graph.transitive_dependents(42).is_empty());
    }

    #[test]
    fn long_chain_does_not_recurse() {
        let graph = DependencyGraph::new();
        for id in 1..10_000 {
            graph.add_edge(id, id + 1).unwrap();
        }
        assert_eq!(graph.transitive_dependents(1).len(), 9_999);
        assert!(graph.add_edge(10_000, 1).is_err());
    }
}
