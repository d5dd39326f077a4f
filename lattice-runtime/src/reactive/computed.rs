//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computeds Work
//!
//! 1. On first access, the computed runs its function and caches the result.
//!
//! 2. When a dependency changes, the computed is marked dirty (direct
//!    dependency) or maybe-dirty (something further upstream) without
//!    recomputing.
//!
//! 3. On next access, a maybe-dirty computed first brings its own derived
//!    dependencies up to date and compares their epochs with the ones it saw
//!    last time. Only if one moved does it recompute.
//!
//! 4. If the recomputed value equals the cached one, the computed's epoch
//!    does not advance, so its own dependents stay clean.
//!
//! The function must not write to signals. A write made while a computed is
//! evaluating fails with [`ReactiveError::WriteInComputed`](crate::ReactiveError).

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};

use super::context::ObserverKind;
use super::runtime::{untrack, Computation, Runtime, Slot};
use super::scope;
use crate::graph::{DirtyState, Node, NodeId};

struct ComputedInner<T> {
    id: NodeId,
    compute: Box<dyn Fn() -> T>,
    value: RefCell<Option<T>>,
}

impl<T: PartialEq + 'static> Computation for ComputedInner<T> {
    fn run(&self) -> bool {
        let next = Runtime::run_tracked(self.id, ObserverKind::Derived, || (self.compute)());
        let mut value = self.value.borrow_mut();
        if value.as_ref() == Some(&next) {
            return false;
        }
        *value = Some(next);
        true
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        Runtime::unregister(self.id);
    }
}

/// A memoized derivation of signals and other computeds.
///
/// # Example
///
/// ```rust
/// use lattice_runtime::{computed, Signal};
///
/// let count = Signal::new(2);
/// let c = count.clone();
/// let doubled = computed(move || c.get() * 2);
///
/// assert_eq!(doubled.get(), 4);
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
pub struct Computed<T: 'static> {
    inner: Rc<ComputedInner<T>>,
}

impl<T: PartialEq + 'static> Computed<T> {
    /// Create a new computed with the given function.
    ///
    /// The function is not run until the first read. The node is owned by the
    /// current disposal scope, if there is one.
    pub fn new(compute: impl Fn() -> T + 'static) -> Self {
        let node = Node::derived();
        let id = node.id();
        let inner = Rc::new(ComputedInner {
            id,
            compute: Box::new(compute),
            value: RefCell::new(None),
        });

        let weak: Weak<dyn Computation> = Rc::downgrade(&inner) as Weak<dyn Computation>;
        Runtime::register(node, Slot::Shared(weak));
        if let Some(owner) = scope::current_scope() {
            scope::adopt_computation(owner, id);
        }

        Self { inner }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get a clone of the current value, recomputing if necessary.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Get the current value without tracking the read.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        untrack(|| self.get())
    }

    /// Borrow the current value, recomputing if necessary.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        Runtime::track(self.inner.id);
        self.ensure_fresh();
        let value = self.inner.value.borrow();
        f(value
            .as_ref()
            .expect("computed value is populated after a refresh"))
    }

    fn ensure_fresh(&self) {
        if Runtime::contains(self.inner.id) {
            Runtime::refresh(self.inner.id);
            return;
        }

        // Detached by scope disposal: keep the last value, compute once if
        // there never was one
        if self.inner.value.borrow().is_none() {
            let value = untrack(|| (self.inner.compute)());
            *self.inner.value.borrow_mut() = Some(value);
        }
    }

    /// Dirty state of the node, or `None` once detached.
    pub fn state(&self) -> Option<DirtyState> {
        Runtime::dirty_state(self.inner.id)
    }

    pub fn has_value(&self) -> bool {
        self.inner.value.borrow().is_some()
    }

    /// Number of computations currently depending on this computed.
    pub fn dependent_count(&self) -> usize {
        Runtime::dependent_count(self.inner.id)
    }
}

impl<T: 'static> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Debug + 'static> Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Computed");
        s.field("id", &self.inner.id);
        match self.inner.value.try_borrow() {
            Ok(value) => s.field("value", &*value),
            Err(_) => s.field("value", &"<borrowed>"),
        };
        s.field("state", &Runtime::dirty_state(self.inner.id)).finish()
    }
}

/// Create a computed value.
pub fn computed<T: PartialEq + 'static>(compute: impl Fn() -> T + 'static) -> Computed<T> {
    Computed::new(compute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{dispose_scope, push_scope, Signal};
    use std::cell::Cell;

    fn counted<T: PartialEq + 'static>(
        f: impl Fn() -> T + 'static,
    ) -> (Computed<T>, Rc<Cell<usize>>) {
        let runs = Rc::new(Cell::new(0));
        let r = runs.clone();
        let c = computed(move || {
            r.set(r.get() + 1);
            f()
        });
        (c, runs)
    }

    #[test]
    fn computed_is_lazy() {
        let (c, runs) = counted(|| 42);
        assert_eq!(runs.get(), 0);
        assert!(!c.has_value());

        assert_eq!(c.get(), 42);
        assert_eq!(runs.get(), 1);
        assert_eq!(c.state(), Some(DirtyState::Clean));
    }

    #[test]
    fn computed_caches_value_when_clean() {
        let source = Signal::new(3);
        let s = source.clone();
        let (c, runs) = counted(move || s.get() + 1);

        assert_eq!(c.get(), 4);
        assert_eq!(c.get(), 4);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn computed_never_stale_across_layers() {
        let source = Signal::new(1);
        let s = source.clone();
        let doubled = computed(move || s.get() * 2);
        let d = doubled.clone();
        let quadrupled = computed(move || d.get() * 2);
        let q = quadrupled.clone();
        let label = computed(move || format!("q={}", q.get()));

        assert_eq!(label.get(), "q=4");
        for n in 2..6 {
            source.set(n);
            assert_eq!(label.get(), format!("q={}", n * 4));
            assert_eq!(doubled.get(), n * 2);
        }
    }

    #[test]
    fn unchanged_intermediate_stops_recomputation() {
        let source = Signal::new(2);
        let s = source.clone();
        let parity = computed(move || s.get() % 2);
        let p = parity.clone();
        let (label, runs) = counted(move || if p.get() == 0 { "even" } else { "odd" });

        assert_eq!(label.get(), "even");
        source.set(4);
        assert_eq!(label.get(), "even");
        assert_eq!(runs.get(), 1);

        source.set(5);
        assert_eq!(label.get(), "odd");
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn computed_clone_shares_state() {
        let (c1, runs) = counted(|| String::from("shared"));
        let c2 = c1.clone();

        assert_eq!(c1.get(), "shared");
        assert_eq!(c2.get(), "shared");
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn computed_state_transitions() {
        let source = Signal::new(0);
        let s = source.clone();
        let c = computed(move || s.get());

        assert_eq!(c.state(), Some(DirtyState::Dirty));
        c.get();
        assert_eq!(c.state(), Some(DirtyState::Clean));
        source.set(1);
        assert_eq!(c.state(), Some(DirtyState::Dirty));
        c.get();
        assert_eq!(c.state(), Some(DirtyState::Clean));
    }

    #[test]
    fn disposed_computed_returns_last_value() {
        let source = Signal::new(10);
        let guard = push_scope();
        let s = source.clone();
        let c = computed(move || s.get());
        assert_eq!(c.get(), 10);
        dispose_scope(guard.pop());

        assert_eq!(c.state(), None);
        source.set(11);
        assert_eq!(c.get(), 10);
        assert_eq!(source.subscriber_count(), 0);
    }
}
