//! Dependency Graph
//!
//! This module implements the bookkeeping behind the reactive primitives.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph where:
//!
//! - Nodes represent sources (signals), derived values (computeds) or
//!   effects
//! - Edges represent reads: if A read B during its last run, there is an
//!   edge from B to A
//!
//! Each node carries an epoch that advances whenever its observable value
//! changes, and every reader remembers the epoch it saw. Comparing the two is
//! how a computed decides, on read, whether it is actually stale.
//!
//! # Design Decisions
//!
//! 1. One centralized graph per thread rather than per-signal subscriber
//!    lists, so propagation, disposal and edge rewiring share one owner.
//!
//! 2. The graph is indexed by node ID for O(1) lookups.
//!
//! 3. Both forward (dependencies) and reverse (dependents) edges are kept so
//!    writes and reads can both walk the graph cheaply.

mod node;
mod scheduler;
mod store;

pub use node::{DirtyState, Node, NodeId, NodeKind, Observed};
pub use scheduler::EffectQueue;
pub use store::DependencyGraph;
