//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! is a source node in the dependency graph.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context (computed/effect), the
//!    read is recorded as a dependency of that computation.
//!
//! 2. When a write changes the value, the signal's epoch advances and its
//!    dependents are invalidated.
//!
//! 3. Invalidated effects re-run at the next flush point; computeds re-run
//!    lazily on their next read.
//!
//! # Equality
//!
//! [`Signal::set`] compares with `PartialEq` and does nothing when the new
//! value equals the current one. [`Signal::update`] mutates in place and
//! always notifies. Types that want identity semantics (for example a large
//! shared structure) should implement `PartialEq` with `Rc::ptr_eq`.
//!
//! # Lifetime
//!
//! A signal lives as long as any handle to it. Disposing the scope that
//! created it does not invalidate it: reads keep returning the last value and
//! writes still succeed, they just have no live dependents left to notify.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::panic::Location;
use std::rc::Rc;

use super::runtime::Runtime;
use crate::error::ReactiveError;
use crate::graph::NodeId;

struct SignalInner<T> {
    id: NodeId,
    value: RefCell<T>,
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        Runtime::unregister(self.id);
    }
}

/// A reactive cell holding a value of type `T`.
///
/// # Example
///
/// ```rust
/// use lattice_runtime::Signal;
///
/// let count = Signal::new(0);
///
/// // Read the value
/// assert_eq!(count.get(), 0);
///
/// // Update the value (notifies dependents)
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
pub struct Signal<T: 'static> {
    inner: Rc<SignalInner<T>>,
}

impl<T: 'static> Signal<T> {
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(SignalInner {
                id: Runtime::register_source(),
                value: RefCell::new(value),
            }),
        }
    }

    /// Get the signal's node ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get a clone of the current value, tracking the read.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.with_untracked(T::clone)
    }

    /// Borrow the current value, tracking the read.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        Runtime::track(self.inner.id);
        self.with_untracked(f)
    }

    pub fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.borrow())
    }

    /// Set a new value and notify dependents if it differs from the current
    /// one.
    ///
    /// # Panics
    ///
    /// Panics when called while a computed is evaluating. Use
    /// [`Signal::try_set`] to get the error instead.
    #[track_caller]
    pub fn set(&self, value: T)
    where
        T: PartialEq,
    {
        if let Err(err) = self.try_set(value) {
            panic!("{err}");
        }
    }

    /// Set a new value. Returns whether the value changed.
    #[track_caller]
    pub fn try_set(&self, value: T) -> Result<bool, ReactiveError>
    where
        T: PartialEq,
    {
        Runtime::ensure_writable(Location::caller())?;
        {
            let mut current = self.inner.value.borrow_mut();
            if *current == value {
                return Ok(false);
            }
            *current = value;
        }
        Runtime::notify_signal_change(self.inner.id);
        Ok(true)
    }

    /// Mutate the value in place and notify dependents unconditionally.
    ///
    /// # Panics
    ///
    /// Panics when called while a computed is evaluating.
    #[track_caller]
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        if let Err(err) = self.try_update(f) {
            panic!("{err}");
        }
    }

    #[track_caller]
    pub fn try_update(&self, f: impl FnOnce(&mut T)) -> Result<(), ReactiveError> {
        Runtime::ensure_writable(Location::caller())?;
        f(&mut self.inner.value.borrow_mut());
        Runtime::notify_signal_change(self.inner.id);
        Ok(())
    }

    /// Split into read-only and write-only handles sharing this signal.
    pub fn split(self) -> (ReadSignal<T>, WriteSignal<T>) {
        (ReadSignal(self.clone()), WriteSignal(self))
    }

    /// Number of computations currently depending on this signal.
    pub fn subscriber_count(&self) -> usize {
        Runtime::dependent_count(self.inner.id)
    }
}

impl<T: 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Debug + 'static> Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Signal");
        s.field("id", &self.inner.id);
        match self.inner.value.try_borrow() {
            Ok(value) => s.field("value", &*value),
            Err(_) => s.field("value", &"<borrowed>"),
        };
        s.field("subscriber_count", &self.subscriber_count()).finish()
    }
}

/// Read half of a signal.
pub struct ReadSignal<T: 'static>(Signal<T>);

impl<T: 'static> ReadSignal<T> {
    pub fn id(&self) -> NodeId {
        self.0.id()
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.0.get()
    }

    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.0.get_untracked()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.0.with(f)
    }
}

impl<T: 'static> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Write half of a signal.
pub struct WriteSignal<T: 'static>(Signal<T>);

impl<T: 'static> WriteSignal<T> {
    #[track_caller]
    pub fn set(&self, value: T)
    where
        T: PartialEq,
    {
        self.0.set(value);
    }

    #[track_caller]
    pub fn try_set(&self, value: T) -> Result<bool, ReactiveError>
    where
        T: PartialEq,
    {
        self.0.try_set(value)
    }

    #[track_caller]
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.0.update(f);
    }
}

impl<T: 'static> Clone for WriteSignal<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Create a signal and return its read accessor and write handle.
pub fn signal<T: 'static>(initial: T) -> (ReadSignal<T>, WriteSignal<T>) {
    Signal::new(initial).split()
}
