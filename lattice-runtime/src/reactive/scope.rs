//! Disposal Scopes
//!
//! A disposal scope owns cleanup callbacks, child scopes and the computed
//! and effect nodes created while it was current. Scopes form a strict tree:
//! a scope owns its children, and children only know their parent by ID.
//!
//! ```text
//! root
//!  ├── cleanups: [close socket]
//!  ├── effect e1 ──► run scope of e1
//!  │                   └── cleanups registered by e1's last run
//!  └── child (error boundary)
//!       └── ...
//! ```
//!
//! Disposing a scope disposes its children depth-first, runs its own
//! cleanups in registration order and then detaches the computations it
//! owns. All of that happens inside a batch, so a cleanup that writes a
//! signal never re-runs an effect that is about to be detached.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;

use super::runtime::{batch, Runtime};
use crate::error::{CaughtError, DisposalScopeError};
use crate::graph::NodeId;

/// Identifier of a disposal scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

type ErrorHandler = Rc<dyn Fn(CaughtError)>;
type UncaughtHandler = Rc<dyn Fn(&CaughtError)>;

#[derive(Default)]
struct ScopeNode {
    parent: Option<ScopeId>,
    children: IndexSet<ScopeId>,
    cleanups: Vec<Box<dyn FnOnce()>>,
    computations: Vec<NodeId>,
    error_handler: Option<ErrorHandler>,
}

#[derive(Default)]
struct ScopeTree {
    scopes: HashMap<ScopeId, ScopeNode>,
    stack: Vec<ScopeId>,
}

impl ScopeTree {
    fn insert(&mut self, parent: Option<ScopeId>) -> ScopeId {
        let id = ScopeId::next();
        let parent = parent.filter(|p| self.scopes.contains_key(p));
        if let Some(p) = parent.and_then(|p| self.scopes.get_mut(&p)) {
            p.children.insert(id);
        }
        self.scopes.insert(
            id,
            ScopeNode {
                parent,
                ..ScopeNode::default()
            },
        );
        id
    }
}

thread_local! {
    static SCOPES: RefCell<ScopeTree> = RefCell::new(ScopeTree::default());
    static UNCAUGHT: RefCell<Option<UncaughtHandler>> = const { RefCell::new(None) };
}

/// Create a scope as a child of the current one, or a root if none is active.
pub fn create_scope() -> ScopeId {
    SCOPES.with(|s| {
        let mut tree = s.borrow_mut();
        let parent = tree.stack.last().copied();
        tree.insert(parent)
    })
}

/// Create a scope with no parent.
pub fn create_root() -> ScopeId {
    SCOPES.with(|s| s.borrow_mut().insert(None))
}

/// Create a scope under `parent`. A disposed parent yields a root scope.
pub fn create_child(parent: ScopeId) -> ScopeId {
    SCOPES.with(|s| s.borrow_mut().insert(Some(parent)))
}

/// The scope that cleanups and new computations currently attach to.
pub fn current_scope() -> Option<ScopeId> {
    SCOPES.with(|s| s.borrow().stack.last().copied())
}

/// Keeps a scope current until popped or dropped.
#[must_use = "the scope stops being current as soon as the guard is dropped"]
pub struct ScopeGuard {
    id: ScopeId,
    popped: bool,
}

impl ScopeGuard {
    /// Make an existing scope current.
    pub fn enter(id: ScopeId) -> Self {
        SCOPES.with(|s| s.borrow_mut().stack.push(id));
        Self { id, popped: false }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Stop making the scope current without disposing it.
    pub fn pop(mut self) -> ScopeId {
        self.exit();
        self.id
    }

    fn exit(&mut self) {
        if self.popped {
            return;
        }
        self.popped = true;
        let _ = SCOPES.try_with(|s| {
            let mut tree = s.borrow_mut();
            if let Some(pos) = tree.stack.iter().rposition(|id| *id == self.id) {
                tree.stack.remove(pos);
            }
        });
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.exit();
    }
}

/// Create a child of the current scope and make it current.
pub fn push_scope() -> ScopeGuard {
    ScopeGuard::enter(create_scope())
}

/// Stop making `guard`'s scope current. The scope stays alive until
/// [`dispose_scope`] is called on it.
pub fn pop_scope(guard: ScopeGuard) -> ScopeId {
    guard.pop()
}

/// Run `f` with `id` as the current scope.
pub fn with_scope<R>(id: ScopeId, f: impl FnOnce() -> R) -> R {
    let _guard = ScopeGuard::enter(id);
    f()
}

/// Register `cleanup` on the current scope.
///
/// # Errors
///
/// Returns [`DisposalScopeError`] with the caller's location when no live
/// scope is current. The cleanup is dropped without running.
#[track_caller]
pub fn on_cleanup(cleanup: impl FnOnce() + 'static) -> Result<(), DisposalScopeError> {
    let location = Location::caller();
    SCOPES.with(|s| {
        let mut tree = s.borrow_mut();
        let current = tree.stack.last().copied();
        match current.and_then(|id| tree.scopes.get_mut(&id)) {
            Some(node) => {
                node.cleanups.push(Box::new(cleanup));
                Ok(())
            }
            None => Err(DisposalScopeError { location }),
        }
    })
}

/// Attach a computed or effect node to `scope`.
pub(crate) fn adopt_computation(scope: ScopeId, node: NodeId) {
    SCOPES.with(|s| {
        if let Some(scope) = s.borrow_mut().scopes.get_mut(&scope) {
            scope.computations.push(node);
        }
    });
}

/// Dispose `id` and everything it owns. Disposing twice is a no-op.
pub fn dispose_scope(id: ScopeId) {
    batch(|| {
        let node = SCOPES.with(|s| {
            let mut tree = s.borrow_mut();
            let node = tree.scopes.remove(&id)?;
            if let Some(parent) = node.parent.and_then(|p| tree.scopes.get_mut(&p)) {
                parent.children.shift_remove(&id);
            }
            Some(node)
        });

        if let Some(node) = node {
            tracing::trace!(scope = %id, children = node.children.len(), "disposing scope");
            teardown(node);
        }
    });
}

/// Tear down everything a scope owns but keep the scope itself alive.
///
/// Effects call this before each re-run so cleanups and children from the
/// previous run do not accumulate.
pub(crate) fn reset_scope(id: ScopeId) {
    let owned = SCOPES.with(|s| {
        let mut tree = s.borrow_mut();
        tree.scopes.get_mut(&id).map(|node| ScopeNode {
            parent: None,
            children: std::mem::take(&mut node.children),
            cleanups: std::mem::take(&mut node.cleanups),
            computations: std::mem::take(&mut node.computations),
            error_handler: None,
        })
    });

    if let Some(owned) = owned {
        teardown(owned);
    }
}

fn teardown(node: ScopeNode) {
    let ScopeNode {
        children,
        cleanups,
        computations,
        ..
    } = node;

    for child in children {
        dispose_scope(child);
    }
    for cleanup in cleanups {
        cleanup();
    }
    for computation in computations {
        Runtime::unregister(computation);
    }
}

/// Whether `id` has been disposed (or never existed).
pub fn is_disposed(id: ScopeId) -> bool {
    SCOPES.with(|s| !s.borrow().scopes.contains_key(&id))
}

/// Number of live scopes on this thread.
pub fn scope_count() -> usize {
    SCOPES.with(|s| s.borrow().scopes.len())
}

/// Make `scope` an error boundary: errors reported from it or any
/// descendant are handed to `handler`.
pub fn set_error_handler(scope: ScopeId, handler: impl Fn(CaughtError) + 'static) {
    SCOPES.with(|s| {
        if let Some(node) = s.borrow_mut().scopes.get_mut(&scope) {
            node.error_handler = Some(Rc::new(handler));
        }
    });
}

fn find_handler(scope: ScopeId) -> Option<ErrorHandler> {
    SCOPES.with(|s| {
        let tree = s.borrow();
        let mut current = Some(scope);
        while let Some(id) = current {
            let node = tree.scopes.get(&id)?;
            if let Some(handler) = &node.error_handler {
                return Some(Rc::clone(handler));
            }
            current = node.parent;
        }
        None
    })
}

/// Whether `scope` or one of its ancestors is an error boundary.
pub fn has_error_boundary(scope: ScopeId) -> bool {
    find_handler(scope).is_some()
}

/// Route `error` to the nearest error boundary above `scope`.
///
/// With no boundary the error is surfaced through the uncaught handler once
/// the current flush completes.
pub fn report_error(scope: Option<ScopeId>, error: CaughtError) {
    match scope.and_then(find_handler) {
        Some(handler) => handler(error),
        None => Runtime::defer(move || surface_uncaught(error)),
    }
}

/// Replace the handler used for errors no boundary caught.
///
/// Without one, uncaught errors panic.
pub fn set_uncaught_error_handler(handler: impl Fn(&CaughtError) + 'static) {
    UNCAUGHT.with(|h| *h.borrow_mut() = Some(Rc::new(handler)));
}

pub fn clear_uncaught_error_handler() {
    UNCAUGHT.with(|h| *h.borrow_mut() = None);
}

fn surface_uncaught(error: CaughtError) {
    tracing::error!(%error, "uncaught error in reactive computation");
    let handler = UNCAUGHT.with(|h| h.borrow().clone());
    match handler {
        Some(handler) => handler(&error),
        None => panic!("uncaught error in reactive computation: {error}"),
    }
}
