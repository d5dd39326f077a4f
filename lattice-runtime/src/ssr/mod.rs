//! Server Rendering
//!
//! This module renders templates on the server and hands their data to the
//! client:
//!
//! - `coordinator`: two-pass rendering with per-query timeouts
//! - `query`: async data dependencies exposed to templates as signals
//! - `payload`: the serialized `{key, value}` list embedded in the page
//! - `cache`: late query results shared across renders
//! - `prefetch`: the event-stream channel used on client navigation

mod cache;
mod coordinator;
pub(crate) mod data;
mod payload;
mod prefetch;
mod query;

pub use cache::QueryCache;
pub use coordinator::{RenderCoordinator, RenderOutput, Route};
pub use data::{ClientData, QueryOutcome};
pub use payload::{PayloadEntry, RenderPayload};
pub use prefetch::{
    is_prefetch_request, PrefetchDecoder, PrefetchEvent, PREFETCH_CONTENT_TYPE, PREFETCH_HEADER,
};
pub use query::{query, Query, QueryState};
