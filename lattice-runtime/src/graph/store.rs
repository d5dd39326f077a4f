//! Dependency Graph Store
//!
//! Holds every live node of the current thread's reactive graph and the
//! edges between them. Edges are kept in both directions so a write can walk
//! forward to dependents and a read can walk back to dependencies.
//!
//! # Propagation
//!
//! When a source changes:
//!
//! 1. Its epoch is bumped.
//! 2. Direct dependents are marked `Dirty`.
//! 3. Everything further downstream is marked `MaybeDirty`.
//! 4. Effects reached by the walk are returned, in breadth-first order, so
//!    the caller can queue them.
//!
//! Derived nodes are never recomputed here. They are pulled on read, and a
//! `MaybeDirty` node only re-runs once one of its dependencies is found to
//! carry a newer epoch than the one it observed.

use std::collections::{HashMap, HashSet, VecDeque};

use smallvec::SmallVec;

use super::node::{DirtyState, Node, NodeId, NodeKind, Observed};

/// All nodes of one reactive graph, indexed by ID.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<NodeId, Node>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node and every edge that touches it.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&node_id)?;

        for (dep_id, _) in node.dependencies() {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_dependent(node_id);
            }
        }

        for dependent_id in node.dependents() {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                let kept: SmallVec<[Observed; 4]> = dependent
                    .dependencies()
                    .iter()
                    .filter(|(id, _)| *id != node_id)
                    .copied()
                    .collect();
                dependent.replace_dependencies(kept);
            }
        }

        Some(node)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    pub fn epoch(&self, node_id: NodeId) -> Option<u64> {
        self.nodes.get(&node_id).map(Node::epoch)
    }

    pub fn kind(&self, node_id: NodeId) -> Option<NodeKind> {
        self.nodes.get(&node_id).map(Node::kind)
    }

    /// Replace the dependency set of `reader` with `sources`, recording the
    /// epoch each source carries right now. Edges to sources that are no
    /// longer read are dropped.
    pub fn set_dependencies(&mut self, reader: NodeId, sources: &[NodeId]) {
        let observed: SmallVec<[Observed; 4]> = sources
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|n| (*id, n.epoch())))
            .collect();

        let Some(node) = self.nodes.get_mut(&reader) else {
            return;
        };
        let previous = node.replace_dependencies(observed);

        for (old, _) in &previous {
            if !sources.contains(old) {
                if let Some(dep) = self.nodes.get_mut(old) {
                    dep.remove_dependent(reader);
                }
            }
        }
        for source in sources {
            if let Some(dep) = self.nodes.get_mut(source) {
                dep.add_dependent(reader);
            }
        }
    }

    /// Mark a source node as changed and propagate dirty flags.
    ///
    /// Returns the effects reached by the walk, in the order they were found.
    pub fn mark_changed(&mut self, source_id: NodeId) -> Vec<NodeId> {
        let mut effects = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        match self.nodes.get_mut(&source_id) {
            Some(source) => {
                source.bump_epoch();
                for dependent_id in source.dependents() {
                    queue.push_back((*dependent_id, true));
                }
            }
            None => return effects,
        }

        // BFS: direct readers first, so they are the ones marked Dirty
        while let Some((node_id, direct)) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }

            let Some(node) = self.nodes.get_mut(&node_id) else {
                continue;
            };
            if direct {
                node.mark_dirty();
            } else {
                node.mark_maybe_dirty();
            }

            match node.kind() {
                NodeKind::Effect => effects.push(node_id),
                NodeKind::Derived => {
                    for dependent_id in node.dependents() {
                        queue.push_back((*dependent_id, false));
                    }
                }
                NodeKind::Source => {}
            }
        }

        effects
    }

    pub fn set_dirty_state(&mut self, node_id: NodeId, state: DirtyState) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            match state {
                DirtyState::Clean => node.mark_clean(),
                DirtyState::MaybeDirty => node.mark_maybe_dirty(),
                DirtyState::Dirty => node.mark_dirty(),
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
