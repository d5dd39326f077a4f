//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computeds,
//! effects, batching and disposal scopes. These primitives form the
//! foundation of Lattice's fine-grained reactivity.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (such as a computed or effect), the read is
//! recorded as a dependency. When the signal's value changes, dependents are
//! invalidated.
//!
//! ## Computeds
//!
//! A Computed is a derived value that caches its result. It re-evaluates only
//! when read and one of its dependencies actually changed.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects synchronize reactive state with the outside
//! world, such as updating the DOM.
//!
//! ## Scopes
//!
//! A disposal scope owns cleanups and the computations created inside it.
//! Disposing it tears all of that down, children first.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to automatically
//! detect dependencies. When a signal is read, we check if there is an active
//! tracking context and, if so, record the dependency.
//!
//! This approach (sometimes called "automatic dependency tracking" or
//! "transparent reactivity") is used by SolidJS, Vue 3, and Leptos.

mod computed;
mod context;
mod effect;
mod runtime;
mod scope;
mod signal;

pub use computed::{computed, Computed};
pub use context::{ObserverKind, ReactiveContext};
pub use effect::{effect, Effect};
pub use runtime::{batch, untrack, Runtime};
pub use scope::{
    clear_uncaught_error_handler, create_child, create_root, create_scope, current_scope,
    dispose_scope, has_error_boundary, is_disposed, on_cleanup, pop_scope, push_scope,
    report_error, scope_count, set_error_handler, set_uncaught_error_handler, with_scope,
    ScopeGuard, ScopeId,
};
pub use signal::{signal, ReadSignal, Signal, WriteSignal};
