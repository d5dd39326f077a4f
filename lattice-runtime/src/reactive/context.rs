//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a signal is read,
//! we can register the current computation as a dependent.
//!
//! # Implementation
//!
//! We use a thread-local stack to track the currently executing computation.
//! When entering a reactive context (running a computed or effect), we push
//! an entry onto the stack. When the computation completes, we pop it and
//! hand the collected dependencies to the runtime.
//!
//! `untrack` pushes an entry with no observer, which hides every enclosing
//! computation from reads made inside it.
//!
//! Keeping the stack thread-local means two render roots on different
//! threads never see each other's observer.

use std::cell::RefCell;

use smallvec::SmallVec;

use crate::graph::NodeId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// What kind of computation owns a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverKind {
    Derived,
    Effect,
    Untracked,
}

#[derive(Debug)]
struct ContextEntry {
    observer: Option<NodeId>,
    kind: ObserverKind,
    /// Nodes read during this computation, in first-read order.
    dependencies: SmallVec<[NodeId; 8]>,
}

/// Guard that pops the context when dropped.
///
/// This keeps the stack balanced even if the computation panics.
#[must_use = "the context is exited as soon as the guard is dropped"]
pub struct ReactiveContext {
    observer: Option<NodeId>,
    finished: bool,
}

impl ReactiveContext {
    /// Enter a new reactive context for the given computation.
    ///
    /// While this context is active, any signals that are read will be
    /// recorded as dependencies of `observer`.
    pub fn enter(observer: NodeId, kind: ObserverKind) -> Self {
        Self::push(Some(observer), kind)
    }

    /// Enter a context in which reads are not tracked.
    pub fn untracked() -> Self {
        Self::push(None, ObserverKind::Untracked)
    }

    fn push(observer: Option<NodeId>, kind: ObserverKind) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                observer,
                kind,
                dependencies: SmallVec::new(),
            });
        });

        Self {
            observer,
            finished: false,
        }
    }

    /// Check if there is an active tracking context.
    pub fn is_active() -> bool {
        Self::current_observer().is_some()
    }

    /// Get the computation that reads are currently attributed to, if any.
    pub fn current_observer() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|entry| entry.observer))
    }

    /// Record a dependency on the given node.
    ///
    /// This is called by signals and computeds when they are read.
    pub fn track_dependency(node_id: NodeId) {
        CONTEXT_STACK.with(|stack| {
            if let Some(entry) = stack.borrow_mut().last_mut() {
                if entry.observer.is_some() && !entry.dependencies.contains(&node_id) {
                    entry.dependencies.push(node_id);
                }
            }
        });
    }

    /// Get the dependencies collected in the current context.
    pub fn get_dependencies() -> SmallVec<[NodeId; 8]> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|entry| entry.dependencies.clone())
                .unwrap_or_default()
        })
    }

    /// Whether the innermost tracked computation is a computed.
    ///
    /// `untrack` inside a computed does not make writes legal, so untracked
    /// entries are looked through.
    pub fn in_derived() -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .find(|entry| entry.kind != ObserverKind::Untracked)
                .is_some_and(|entry| entry.kind == ObserverKind::Derived)
        })
    }

    /// Whether `node_id` is somewhere on the stack, i.e. currently running.
    pub fn is_running(node_id: NodeId) -> bool {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .iter()
                .any(|entry| entry.observer == Some(node_id))
        })
    }

    /// Exit the context and return the dependencies it collected.
    pub fn finish(mut self) -> SmallVec<[NodeId; 8]> {
        self.finished = true;
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            match popped {
                Some(entry) => {
                    debug_assert_eq!(
                        entry.observer, self.observer,
                        "ReactiveContext mismatch: expected {:?}, got {:?}",
                        self.observer, entry.observer
                    );
                    entry.dependencies
                }
                None => SmallVec::new(),
            }
        })
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // try_with: the guard may outlive the thread-local during teardown
        let _ = CONTEXT_STACK.try_with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_observer() {
        let id = NodeId::new();

        assert!(!ReactiveContext::is_active());
        assert!(ReactiveContext::current_observer().is_none());

        {
            let _ctx = ReactiveContext::enter(id, ObserverKind::Effect);

            assert!(ReactiveContext::is_active());
            assert_eq!(ReactiveContext::current_observer(), Some(id));
            assert!(ReactiveContext::is_running(id));
        }

        // Context should be cleaned up after drop
        assert!(!ReactiveContext::is_active());
        assert!(!ReactiveContext::is_running(id));
    }

    #[test]
    fn context_tracks_dependencies_once_each() {
        let ctx = ReactiveContext::enter(NodeId::new(), ObserverKind::Derived);
        let (a, b) = (NodeId::new(), NodeId::new());

        ReactiveContext::track_dependency(a);
        ReactiveContext::track_dependency(b);
        ReactiveContext::track_dependency(a);

        assert_eq!(ReactiveContext::get_dependencies().as_slice(), &[a, b]);
        assert_eq!(ctx.finish().as_slice(), &[a, b]);
        assert!(!ReactiveContext::is_active());
    }

    #[test]
    fn untracked_hides_the_enclosing_observer() {
        let outer = NodeId::new();
        let ctx = ReactiveContext::enter(outer, ObserverKind::Derived);

        {
            let _untracked = ReactiveContext::untracked();
            assert!(ReactiveContext::current_observer().is_none());
            ReactiveContext::track_dependency(NodeId::new());
            // Writes are still illegal under a computed
            assert!(ReactiveContext::in_derived());
        }

        assert_eq!(ReactiveContext::current_observer(), Some(outer));
        assert!(ctx.finish().is_empty());
    }

    #[test]
    fn nested_contexts() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        {
            let _ctx1 = ReactiveContext::enter(id1, ObserverKind::Effect);
            assert!(!ReactiveContext::in_derived());

            {
                let _ctx2 = ReactiveContext::enter(id2, ObserverKind::Derived);
                assert_eq!(ReactiveContext::current_observer(), Some(id2));
                assert!(ReactiveContext::in_derived());
            }

            // After inner context drops, outer should be current
            assert_eq!(ReactiveContext::current_observer(), Some(id1));
        }

        assert!(ReactiveContext::current_observer().is_none());
    }
}
