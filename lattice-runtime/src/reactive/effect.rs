//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately and
//!    synchronously to establish initial dependencies. Nothing else runs
//!    in between, so first-paint content is correct before any scheduling.
//!
//! 2. When any dependency changes, the effect is queued and re-runs at the
//!    next flush point: right after the write, or when the outermost batch
//!    closes.
//!
//! 3. Before re-running, the effect tears down its run scope: cleanups
//!    registered by the previous run fire, and computeds or effects created
//!    by it are disposed.
//!
//! # Ownership
//!
//! An effect belongs to the disposal scope that was current when it was
//! created and is detached when that scope is disposed. An effect created
//! outside any scope lives until [`Effect::dispose`] is called.
//!
//! # Errors
//!
//! Effects created with [`Effect::new_fallible`] may return an error. It is
//! routed to the nearest error boundary; without one it is surfaced through
//! the uncaught error handler after the flush.

use std::cell::Cell;
use std::rc::Rc;

use super::context::ObserverKind;
use super::runtime::{Computation, Runtime, Slot};
use super::scope::{self, ScopeGuard, ScopeId};
use crate::error::{BoxError, CaughtError};
use crate::graph::{Node, NodeId};

type EffectFn = Box<dyn Fn() -> Result<(), CaughtError>>;

struct EffectInner {
    id: NodeId,
    run: EffectFn,
    /// Scope that is current while the body runs.
    scope: ScopeId,
    disposed: Cell<bool>,
    run_count: Cell<usize>,
}

impl Computation for EffectInner {
    fn run(&self) -> bool {
        if self.disposed.get() {
            return false;
        }

        scope::reset_scope(self.scope);
        let result = {
            let _scope = ScopeGuard::enter(self.scope);
            Runtime::run_tracked(self.id, ObserverKind::Effect, || (self.run)())
        };
        self.run_count.set(self.run_count.get() + 1);

        if let Err(err) = result {
            tracing::debug!(effect = %self.id, error = %err, "effect returned an error");
            scope::report_error(Some(self.scope), err);
        }
        false
    }

    fn dispose(&self) {
        self.disposed.set(true);
        scope::dispose_scope(self.scope);
    }
}

/// A side-effecting computation that re-runs when its dependencies change.
///
/// # Example
///
/// ```rust
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use lattice_runtime::{Effect, Signal};
///
/// let count = Signal::new(0);
/// let seen = Rc::new(RefCell::new(Vec::new()));
///
/// let (c, s) = (count.clone(), seen.clone());
/// let _effect = Effect::new(move || s.borrow_mut().push(c.get()));
///
/// count.set(5);
/// assert_eq!(*seen.borrow(), vec![0, 5]);
/// ```
#[derive(Clone)]
pub struct Effect {
    inner: Rc<EffectInner>,
}

impl Effect {
    /// Create an effect and run it once, synchronously.
    pub fn new(run: impl Fn() + 'static) -> Self {
        Self::create(Box::new(move || {
            run();
            Ok(())
        }))
    }

    /// Create an effect whose body may fail.
    pub fn new_fallible(run: impl Fn() -> Result<(), BoxError> + 'static) -> Self {
        Self::create(Box::new(move || run().map_err(CaughtError::from_boxed)))
    }

    fn create(run: EffectFn) -> Self {
        let owner = scope::current_scope();
        let run_scope = match owner {
            Some(owner) => scope::create_child(owner),
            None => scope::create_root(),
        };

        let node = Node::effect();
        let id = node.id();
        let inner = Rc::new(EffectInner {
            id,
            run,
            scope: run_scope,
            disposed: Cell::new(false),
            run_count: Cell::new(0),
        });

        Runtime::register(node, Slot::Owned(inner.clone()));
        if let Some(owner) = owner {
            scope::adopt_computation(owner, id);
        }

        // First run is synchronous, even inside a batch or a flush
        Runtime::refresh(id);
        Runtime::settle();

        Self { inner }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// The scope current while the effect body runs.
    pub fn scope(&self) -> ScopeId {
        self.inner.scope
    }

    /// Detach the effect. It will not run again.
    pub fn dispose(&self) {
        Runtime::unregister(self.inner.id);
        // Unregister already disposed it unless the node was gone
        if !self.inner.disposed.get() {
            self.inner.dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Number of times the body has run.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.get()
    }

    /// Number of nodes read during the last run.
    pub fn dependency_count(&self) -> usize {
        Runtime::dependency_count(self.inner.id)
    }

    /// Force a re-run at the next flush point.
    pub fn schedule(&self) {
        if self.is_disposed() {
            return;
        }
        Runtime::schedule(self.inner.id);
        Runtime::settle();
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Create an effect. See [`Effect::new`].
pub fn effect(run: impl Fn() + 'static) -> Effect {
    Effect::new(run)
}
