//! Lattice Runtime
//!
//! This crate provides the runtime for the Lattice UI framework.
//! It implements:
//!
//! - Fine-grained reactive primitives (signals, computeds, effects, batching)
//! - Disposal scopes and error boundaries
//! - Two-pass server rendering with per-query timeouts
//! - Tolerant hydration of server-rendered markup
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: dependency graph and effect queue
//! - `reactive`: signals, computeds, effects, scopes and the runtime that
//!   schedules them
//! - `dom`: the in-memory document templates render into
//! - `hydration`: the cursor templates drive, and mounting onto a document
//! - `ssr`: server rendering, queries, the render payload and prefetching
//! - `config`: render options
//!
//! Templates are plain functions over a [`Cursor`]. The same function renders
//! on the server and hydrates on the client.
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use lattice_runtime::{batch, computed, effect, signal};
//!
//! let (count, set_count) = signal(0);
//! let doubled = {
//!     let count = count.clone();
//!     computed(move || count.get() * 2)
//! };
//!
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let l = log.clone();
//! effect(move || l.borrow_mut().push(doubled.get()));
//!
//! set_count.set(3);
//! batch(|| {
//!     set_count.set(1);
//!     set_count.set(2);
//! });
//! assert_eq!(*log.borrow(), vec![0, 6, 4]);
//! ```

pub mod config;
pub mod dom;
pub mod error;
pub mod graph;
pub mod hydration;
pub mod reactive;
pub mod ssr;

pub use config::RenderOptions;
pub use dom::{Document, DomId, Fragment};
pub use error::{CaughtError, DisposalScopeError, PayloadError, QueryError, ReactiveError};
pub use hydration::{mount, Cursor, HydrationMode, HydrationState, MountHandle, MountOptions};
pub use reactive::{
    batch, computed, dispose_scope, effect, on_cleanup, pop_scope, push_scope, signal, untrack,
    Computed, Effect, ReadSignal, Signal, WriteSignal,
};
pub use ssr::{query, Query, QueryState, RenderCoordinator, RenderOutput, RenderPayload, Route};
