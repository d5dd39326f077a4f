//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, computeds
//! and effects. It owns the dependency graph and the effect queue for the
//! current thread and decides when computations re-run.
//!
//! # How It Works
//!
//! 1. When a signal, computed or effect is created, it registers a node with
//!    the runtime.
//!
//! 2. When a computed or effect reads a node, the read is recorded by the
//!    reactive context, and the full dependency set replaces the previous
//!    one when the computation finishes.
//!
//! 3. When a signal's value changes, the runtime:
//!    a. Bumps the signal's epoch
//!    b. Marks direct dependents dirty and everything downstream maybe-dirty
//!    c. Queues the effects it reached
//!    d. Flushes the queue, unless a batch or flush is already open
//!
//! 4. Computeds are lazy: they only re-run when read (or when an effect
//!    that depends on them is flushed) and a dependency's epoch moved.
//!
//! # Threading
//!
//! All state is thread-local. Each thread (and therefore each server render
//! running on a current-thread executor) has its own graph, so concurrent
//! render roots never share an observer or a queue.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::Location;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use super::context::{ObserverKind, ReactiveContext};
use crate::error::ReactiveError;
use crate::graph::{DependencyGraph, DirtyState, EffectQueue, Node, NodeId, NodeKind, Observed};

/// Upper bound on effect runs in one flush before it is treated as a loop.
const MAX_FLUSH_RUNS: usize = 100_000;

/// A computation the runtime can re-run.
pub(crate) trait Computation {
    /// Re-run the computation. Derived nodes return whether their value
    /// changed; effects always return `false`.
    fn run(&self) -> bool;

    /// Called once when the node leaves the graph.
    fn dispose(&self) {}
}

/// How the runtime holds on to a computation.
///
/// Effects are owned by the runtime until disposed. Computeds are owned by
/// their handles, so the runtime only keeps a weak reference.
pub(crate) enum Slot {
    Owned(Rc<dyn Computation>),
    Shared(Weak<dyn Computation>),
}

impl Slot {
    fn get(&self) -> Option<Rc<dyn Computation>> {
        match self {
            Slot::Owned(rc) => Some(Rc::clone(rc)),
            Slot::Shared(weak) => weak.upgrade(),
        }
    }
}

#[derive(Default)]
struct RuntimeState {
    graph: RefCell<DependencyGraph>,
    computations: RefCell<HashMap<NodeId, Slot>>,
    queue: RefCell<EffectQueue>,
    deferred: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

thread_local! {
    static RUNTIME: RuntimeState = RuntimeState::default();
}

fn with_graph<R>(f: impl FnOnce(&mut DependencyGraph) -> R) -> R {
    RUNTIME.with(|rt| f(&mut rt.graph.borrow_mut()))
}

fn with_queue<R>(f: impl FnOnce(&mut EffectQueue) -> R) -> R {
    RUNTIME.with(|rt| f(&mut rt.queue.borrow_mut()))
}

/// The thread-local reactive runtime.
pub struct Runtime;

impl Runtime {
    /// Register a new source node and return its ID.
    pub(crate) fn register_source() -> NodeId {
        with_graph(|graph| graph.add_node(Node::source()))
    }

    /// Register a derived or effect node together with its computation.
    pub(crate) fn register(node: Node, slot: Slot) -> NodeId {
        let id = node.id();
        RUNTIME.with(|rt| {
            rt.graph.borrow_mut().add_node(node);
            rt.computations.borrow_mut().insert(id, slot);
        });
        id
    }

    /// Remove a node from the graph, drop it from the queue and dispose its
    /// computation. Unknown IDs are ignored, so this is safe to call twice.
    pub(crate) fn unregister(id: NodeId) {
        let slot = RUNTIME
            .try_with(|rt| {
                rt.queue.borrow_mut().remove(id);
                rt.graph.borrow_mut().remove_node(id);
                rt.computations.borrow_mut().remove(&id)
            })
            .ok()
            .flatten();

        if let Some(computation) = slot.as_ref().and_then(Slot::get) {
            computation.dispose();
        }
    }

    /// Whether the node is still part of the graph.
    pub fn contains(id: NodeId) -> bool {
        with_graph(|graph| graph.contains(id))
    }

    /// Record a read of `id` by the running computation, if there is one.
    pub(crate) fn track(id: NodeId) {
        ReactiveContext::track_dependency(id);
    }

    /// Fail if a signal write happens while a computed is evaluating.
    pub(crate) fn ensure_writable(
        location: &'static Location<'static>,
    ) -> Result<(), ReactiveError> {
        if ReactiveContext::in_derived() {
            return Err(ReactiveError::WriteInComputed { location });
        }
        Ok(())
    }

    /// Propagate a change of the source `id` and flush if allowed.
    pub(crate) fn notify_signal_change(id: NodeId) {
        let effects = with_graph(|graph| graph.mark_changed(id));
        if !effects.is_empty() {
            tracing::trace!(source = %id, effects = effects.len(), "signal changed");
            with_queue(|queue| queue.schedule_all(effects));
        }
        Self::settle();
    }

    /// Bring `id` up to date, re-running it if a dependency really changed.
    ///
    /// For a `MaybeDirty` node, derived dependencies are refreshed first and
    /// their epochs compared with the ones observed on the last run; the node
    /// only re-runs if one of them moved.
    pub(crate) fn refresh(id: NodeId) {
        let Some((state, kind)) =
            with_graph(|graph| graph.get_node(id).map(|n| (n.dirty_state(), n.kind())))
        else {
            return;
        };

        match state {
            DirtyState::Clean => return,
            DirtyState::MaybeDirty => {
                if !Self::dependencies_changed(id) {
                    with_graph(|graph| graph.set_dirty_state(id, DirtyState::Clean));
                    return;
                }
            }
            DirtyState::Dirty => {}
        }

        if ReactiveContext::is_running(id) {
            panic!("reactive cycle detected: {id} read itself while computing");
        }

        let computation =
            RUNTIME.with(|rt| rt.computations.borrow().get(&id).and_then(Slot::get));
        let Some(computation) = computation else {
            return;
        };

        // Cleared before running so a write made by the run re-dirties it
        with_graph(|graph| graph.set_dirty_state(id, DirtyState::Clean));
        let changed = computation.run();

        if changed && kind == NodeKind::Derived {
            with_graph(|graph| {
                if let Some(node) = graph.get_node_mut(id) {
                    node.bump_epoch();
                }
            });
        }
    }

    fn dependencies_changed(id: NodeId) -> bool {
        let observed: SmallVec<[Observed; 4]> = with_graph(|graph| {
            graph
                .get_node(id)
                .map(|n| n.dependencies().iter().copied().collect())
                .unwrap_or_default()
        });

        for (dep, seen) in observed {
            if with_graph(|graph| graph.kind(dep)) == Some(NodeKind::Derived) {
                Self::refresh(dep);
            }
            if with_graph(|graph| graph.epoch(dep)) != Some(seen) {
                return true;
            }
        }
        false
    }

    /// Run `f` as computation `id`, then replace its dependency set with the
    /// nodes it read.
    pub(crate) fn run_tracked<R>(id: NodeId, kind: ObserverKind, f: impl FnOnce() -> R) -> R {
        let ctx = ReactiveContext::enter(id, kind);
        let result = f();
        let dependencies = ctx.finish();
        with_graph(|graph| graph.set_dependencies(id, &dependencies));
        result
    }

    /// Queue an effect for the next flush.
    pub(crate) fn schedule(id: NodeId) {
        let known = with_graph(|graph| {
            if graph.contains(id) {
                graph.set_dirty_state(id, DirtyState::Dirty);
                true
            } else {
                false
            }
        });
        if known {
            with_queue(|queue| queue.schedule(id));
        }
    }

    /// Flush pending effects unless a batch or a flush is open.
    pub(crate) fn settle() {
        if with_queue(|queue| queue.can_flush()) {
            Self::flush();
        }
    }

    fn flush() {
        if !with_queue(EffectQueue::begin_flush) {
            return;
        }

        struct FlushGuard;
        impl Drop for FlushGuard {
            fn drop(&mut self) {
                let _ = RUNTIME.try_with(|rt| rt.queue.borrow_mut().end_flush());
            }
        }

        let guard = FlushGuard;
        let mut runs = 0;
        while let Some(id) = with_queue(EffectQueue::pop_next) {
            runs += 1;
            if runs > MAX_FLUSH_RUNS {
                let dropped = with_queue(|queue| {
                    let n = queue.len();
                    while queue.pop_next().is_some() {}
                    n
                });
                tracing::error!(
                    runs,
                    dropped,
                    "effect flush did not settle; an effect keeps writing a signal it reads"
                );
                break;
            }
            Self::refresh(id);
        }
        drop(guard);

        tracing::trace!(runs, "flush complete");
        Self::run_deferred();
    }

    /// Run `task` once the current flush has finished.
    pub(crate) fn defer(task: impl FnOnce() + 'static) {
        RUNTIME.with(|rt| rt.deferred.borrow_mut().push_back(Box::new(task)));
    }

    fn run_deferred() {
        loop {
            let task = RUNTIME.with(|rt| rt.deferred.borrow_mut().pop_front());
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Number of live nodes in this thread's graph.
    pub fn node_count() -> usize {
        with_graph(|graph| graph.node_count())
    }

    /// Number of effects waiting for the next flush.
    pub fn pending_effects() -> usize {
        with_queue(|queue| queue.len())
    }

    pub fn is_batching() -> bool {
        with_queue(|queue| queue.is_batching())
    }

    pub fn dependent_count(id: NodeId) -> usize {
        with_graph(|graph| graph.get_node(id).map_or(0, |n| n.dependents().len()))
    }

    pub fn dependency_count(id: NodeId) -> usize {
        with_graph(|graph| graph.get_node(id).map_or(0, |n| n.dependencies().len()))
    }

    pub fn dirty_state(id: NodeId) -> Option<DirtyState> {
        with_graph(|graph| graph.get_node(id).map(|n| n.dirty_state()))
    }

    pub fn epoch(id: NodeId) -> Option<u64> {
        with_graph(|graph| graph.epoch(id))
    }
}

struct BatchGuard;

impl Drop for BatchGuard {
    fn drop(&mut self) {
        let outermost = RUNTIME
            .try_with(|rt| rt.queue.borrow_mut().exit_batch())
            .unwrap_or(false);
        if outermost && !std::thread::panicking() {
            Runtime::settle();
        }
    }
}

/// Run `f` with effect re-runs suppressed, then flush every distinct pending
/// effect once, in the order it was first scheduled.
///
/// Batches nest; only the outermost one flushes.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    with_queue(EffectQueue::enter_batch);
    let guard = BatchGuard;
    let result = f();
    drop(guard);
    result
}

/// Run `f` without registering any of its reads as dependencies.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _ctx = ReactiveContext::untracked();
    f()
}
