//! Hydration
//!
//! Server markup is made interactive by replaying the template against it.
//! The same template code drives a [`Cursor`] on both sides: on the server
//! the cursor creates every node, on the client it claims the nodes the
//! server produced and binds effects and listeners to them.
//!
//! [`mount`] runs one root through the state machine in [`HydrationState`]
//! and records what happened in a [`HydrationReport`].

mod cursor;
mod mount;
mod report;

pub use cursor::{Cursor, CursorMode, Expected};
pub use mount::{mount, HydrationMode, MountHandle, MountOptions};
pub use report::{HydrationReport, HydrationState, Mismatch, Resolution};
