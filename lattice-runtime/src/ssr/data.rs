//! Render data contexts.
//!
//! Queries look up the innermost render data context to decide what to do:
//!
//! - `Discovery` (server, first pass): record the query and its fetch.
//! - `Final` (server, second pass): read the outcome decided between passes.
//! - `Client`: reuse a value from the server payload, or queue a fetch that
//!   runs after hydration has finished claiming.
//!
//! The stack is thread-local, like the reactive context, so concurrent
//! render roots on different threads never see each other's data.

use std::cell::RefCell;
use std::rc::Rc;

use futures_util::future::{join_all, BoxFuture};
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

use super::payload::RenderPayload;
use crate::error::QueryError;
use crate::reactive::batch;

pub(crate) type QueryFuture = BoxFuture<'static, Result<Value, QueryError>>;
type Apply = Box<dyn FnOnce(&Result<Value, QueryError>)>;

thread_local! {
    static DATA_STACK: RefCell<Vec<RenderData>> = const { RefCell::new(Vec::new()) };
}

/// What the second pass knows about a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Resolved(Value),
    Pending,
    Failed(String),
}

/// Queries recorded by the discovery pass, in discovery order.
#[derive(Default)]
pub(crate) struct Discovery {
    queries: RefCell<IndexMap<String, QueryFuture>>,
}

impl Discovery {
    /// Record a query. The first fetch registered for a key wins.
    pub(crate) fn record(&self, key: &str, fetch: impl FnOnce() -> QueryFuture) {
        let mut queries = self.queries.borrow_mut();
        if !queries.contains_key(key) {
            queries.insert(key.to_string(), fetch());
        }
    }

    /// Take every recorded query, leaving the discovery empty.
    pub(crate) fn take_queries(&self) -> IndexMap<String, QueryFuture> {
        std::mem::take(&mut *self.queries.borrow_mut())
    }
}

/// Outcomes available to the second pass.
#[derive(Default)]
pub(crate) struct Final {
    outcomes: IndexMap<String, QueryOutcome>,
    requested: RefCell<IndexSet<String>>,
}

impl Final {
    pub(crate) fn new(outcomes: IndexMap<String, QueryOutcome>) -> Self {
        Self {
            outcomes,
            requested: RefCell::default(),
        }
    }

    pub(crate) fn outcome(&self, key: &str) -> Option<&QueryOutcome> {
        self.requested.borrow_mut().insert(key.to_string());
        self.outcomes.get(key)
    }

    /// Keys read by the pass, in first-read order.
    pub(crate) fn requested(&self) -> IndexSet<String> {
        self.requested.borrow().clone()
    }
}

struct PendingFetch {
    key: String,
    future: QueryFuture,
    applies: Vec<Apply>,
}

/// Client-side data: the server payload plus fetches queued for after
/// hydration.
#[derive(Default)]
pub struct ClientData {
    payload: RenderPayload,
    pending: RefCell<Vec<PendingFetch>>,
}

impl ClientData {
    pub fn new(payload: RenderPayload) -> Self {
        Self {
            payload,
            pending: RefCell::default(),
        }
    }

    pub fn payload(&self) -> &RenderPayload {
        &self.payload
    }

    /// Queue a fetch for `key`. A key already queued only gains another
    /// consumer, so each key is fetched once.
    pub(crate) fn push_pending(
        &self,
        key: &str,
        fetch: impl FnOnce() -> QueryFuture,
        apply: impl FnOnce(&Result<Value, QueryError>) + 'static,
    ) {
        let mut pending = self.pending.borrow_mut();
        match pending.iter_mut().find(|p| p.key == key) {
            Some(existing) => existing.applies.push(Box::new(apply)),
            None => pending.push(PendingFetch {
                key: key.to_string(),
                future: fetch(),
                applies: vec![Box::new(apply)],
            }),
        }
    }

    pub fn pending_keys(&self) -> Vec<String> {
        self.pending.borrow().iter().map(|p| p.key.clone()).collect()
    }

    pub(crate) fn clear_pending(&self) {
        self.pending.borrow_mut().clear();
    }

    /// Run every queued fetch concurrently and apply the results in one
    /// batch. Returns how many fetches ran.
    pub async fn resolve_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        if pending.is_empty() {
            return 0;
        }

        let (futures, consumers): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .map(|p| (p.future, (p.key, p.applies)))
            .unzip();
        let results = join_all(futures).await;
        let count = results.len();

        batch(|| {
            for (result, (key, applies)) in results.into_iter().zip(consumers) {
                if let Err(err) = &result {
                    tracing::warn!(%key, error = %err, "client query failed");
                }
                for apply in applies {
                    apply(&result);
                }
            }
        });
        count
    }
}

/// The render data context a query sees.
#[derive(Clone)]
pub(crate) enum RenderData {
    Discovery(Rc<Discovery>),
    Final(Rc<Final>),
    Client(Rc<ClientData>),
}

impl RenderData {
    /// Make this the current context until the guard is dropped.
    pub(crate) fn enter(&self) -> DataGuard {
        DATA_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        DataGuard
    }

    pub(crate) fn current() -> Option<RenderData> {
        DATA_STACK.with(|stack| stack.borrow().last().cloned())
    }
}

pub(crate) struct DataGuard;

impl Drop for DataGuard {
    fn drop(&mut self) {
        let _ = DATA_STACK.try_with(|stack| stack.borrow_mut().pop());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;
    use std::cell::Cell;

    fn ready(value: Value) -> QueryFuture {
        async move { Ok(value) }.boxed()
    }

    #[test]
    fn data_contexts_nest() {
        assert!(RenderData::current().is_none());
        let outer = RenderData::Final(Rc::new(Final::default()));
        let _outer = outer.enter();
        {
            let _inner = RenderData::Discovery(Rc::default()).enter();
            assert!(matches!(RenderData::current(), Some(RenderData::Discovery(_))));
        }
        assert!(matches!(RenderData::current(), Some(RenderData::Final(_))));
    }

    #[test]
    fn discovery_keeps_first_fetch_per_key() {
        let discovery = Discovery::default();
        let calls = Cell::new(0);
        for _ in 0..3 {
            discovery.record("a", || {
                calls.set(calls.get() + 1);
                ready(json!(1))
            });
        }
        discovery.record("b", || ready(json!(2)));

        assert_eq!(calls.get(), 1);
        let keys: Vec<_> = discovery.take_queries().into_keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn final_records_requested_keys() {
        let mut outcomes = IndexMap::new();
        outcomes.insert("a".to_string(), QueryOutcome::Resolved(json!(1)));
        let pass = Final::new(outcomes);

        assert_eq!(pass.outcome("b"), None);
        assert_eq!(pass.outcome("a"), Some(&QueryOutcome::Resolved(json!(1))));
        assert_eq!(pass.requested().into_iter().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn client_fetches_each_key_once() {
        let client = ClientData::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let s = seen.clone();
            client.push_pending(
                "user",
                || ready(json!("ada")),
                move |result| s.borrow_mut().push(result.as_ref().ok().cloned()),
            );
        }

        assert_eq!(client.pending_keys(), vec!["user"]);
        assert_eq!(client.resolve_pending().await, 1);
        assert_eq!(*seen.borrow(), vec![Some(json!("ada")), Some(json!("ada"))]);
        assert!(client.pending_keys().is_empty());
    }
}
