//! Error types shared across the runtime.

use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;
use std::rc::Rc;

use thiserror::Error;

/// Boxed error returned by fallible effect bodies.
pub type BoxError = Box<dyn StdError + 'static>;

/// A cleanup was registered while no disposal scope was active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("on_cleanup called outside of any disposal scope at {location}")]
pub struct DisposalScopeError {
    pub location: &'static Location<'static>,
}

/// Usage errors raised by the reactive primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReactiveError {
    #[error("signal written while evaluating a computed at {location}")]
    WriteInComputed {
        location: &'static Location<'static>,
    },

    #[error(transparent)]
    Scope(#[from] DisposalScopeError),
}

/// Failures of a single render query.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query fetch failed: {0}")]
    Fetch(String),

    #[error("query value could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("query task was cancelled")]
    Cancelled,
}

impl QueryError {
    pub fn fetch(message: impl fmt::Display) -> Self {
        Self::Fetch(message.to_string())
    }
}

/// Encoding and decoding failures for the render payload and prefetch stream.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload MessagePack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("payload MessagePack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("malformed prefetch frame: {0}")]
    Frame(String),

    #[error("payload variable {0:?} is not a JavaScript identifier")]
    InvalidVar(String),
}

/// Markup could not be parsed into a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("markup parse error at byte {offset}: {message}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// An error raised inside an effect or query and routed to an error boundary.
///
/// Cheap to clone so a boundary can both store it and hand it to its fallback.
#[derive(Clone)]
pub struct CaughtError(Rc<dyn StdError + 'static>);

impl CaughtError {
    pub fn new(error: impl StdError + 'static) -> Self {
        Self(Rc::new(error))
    }

    pub fn from_boxed(error: BoxError) -> Self {
        Self(Rc::from(error))
    }

    pub fn inner(&self) -> &(dyn StdError + 'static) {
        &*self.0
    }
}

impl fmt::Debug for CaughtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CaughtError").field(&self.0.to_string()).finish()
    }
}

impl fmt::Display for CaughtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<BoxError> for CaughtError {
    fn from(error: BoxError) -> Self {
        Self::from_boxed(error)
    }
}

impl From<QueryError> for CaughtError {
    fn from(error: QueryError) -> Self {
        Self::new(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposal_scope_error_names_call_site() {
        let err = DisposalScopeError {
            location: Location::caller(),
        };
        let message = err.to_string();
        assert!(message.contains("outside of any disposal scope"));
        assert!(message.contains("error.rs"));
    }

    #[test]
    fn caught_error_is_shared_on_clone() {
        let err = CaughtError::new(QueryError::fetch("boom"));
        let copy = err.clone();
        assert_eq!(copy.to_string(), "query fetch failed: boom");
        assert_eq!(format!("{err:?}"), "CaughtError(\"query fetch failed: boom\")");
    }
}
