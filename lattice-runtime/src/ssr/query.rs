//! Render queries.
//!
//! A query is an async data dependency bound to a signal. What creating one
//! does depends on the render data context it is created in; see
//! [`data`](super::data). The query's state is always a signal, so template
//! code reads it like any other reactive value.

use std::future::Future;

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::data::{QueryFuture, QueryOutcome, RenderData};
use crate::error::{CaughtError, QueryError};
use crate::reactive::{current_scope, has_error_boundary, report_error, Signal};

/// Loading state of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
    Loading,
    Ready(T),
}

/// A keyed async value exposed as a signal.
pub struct Query<T: 'static> {
    key: String,
    state: Signal<QueryState<T>>,
}

impl<T: Clone + PartialEq + 'static> Query<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state, tracking the read.
    pub fn get(&self) -> QueryState<T> {
        self.state.get()
    }

    /// The value if the query has resolved, tracking the read.
    pub fn value(&self) -> Option<T> {
        self.state.with(|state| match state {
            QueryState::Ready(value) => Some(value.clone()),
            QueryState::Loading => None,
        })
    }

    pub fn is_loading(&self) -> bool {
        self.state.with(|state| matches!(state, QueryState::Loading))
    }

    /// The underlying signal.
    pub fn signal(&self) -> Signal<QueryState<T>> {
        self.state.clone()
    }
}

impl<T: 'static> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            state: self.state.clone(),
        }
    }
}

fn erase<T, Fut>(fetch: impl FnOnce() -> Fut) -> QueryFuture
where
    T: Serialize,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
{
    let fut = fetch();
    async move {
        let value = fut.await?;
        Ok(serde_json::to_value(value)?)
    }
    .boxed()
}

/// Create a query for `key`.
///
/// - During server discovery the fetch is recorded (first one per key wins)
///   and the query stays loading.
/// - During the server's final pass the query starts ready if it resolved in
///   time. A failed query stays loading, unless an error boundary encloses
///   it, in which case the boundary shows its fallback.
/// - On the client a value from the server payload is used directly;
///   otherwise the fetch is queued and runs once hydration has claimed the
///   tree.
/// - Outside any render the query stays loading.
pub fn query<T, F, Fut>(key: impl Into<String>, fetch: F) -> Query<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
{
    let key = key.into();
    let state = Signal::new(QueryState::Loading);

    match RenderData::current() {
        None => {
            tracing::warn!(%key, "query created outside of a render; it stays loading");
        }
        Some(RenderData::Discovery(discovery)) => {
            discovery.record(&key, || erase(fetch));
        }
        Some(RenderData::Final(pass)) => match pass.outcome(&key).cloned() {
            Some(QueryOutcome::Resolved(value)) => match serde_json::from_value::<T>(value) {
                Ok(value) => state.set(QueryState::Ready(value)),
                Err(err) => fail_on_server(&key, QueryError::from(err)),
            },
            Some(QueryOutcome::Failed(message)) => {
                fail_on_server(&key, QueryError::Fetch(message));
            }
            Some(QueryOutcome::Pending) | None => {}
        },
        Some(RenderData::Client(client)) => match client.payload().get(&key) {
            Some(value) => match serde_json::from_value::<T>(value.clone()) {
                Ok(value) => state.set(QueryState::Ready(value)),
                Err(err) => {
                    tracing::warn!(%key, error = %err, "payload value does not decode; refetching");
                    queue_client_fetch(&client, &key, fetch, &state);
                }
            },
            None => queue_client_fetch(&client, &key, fetch, &state),
        },
    }

    Query { key, state }
}

fn fail_on_server(key: &str, err: QueryError) {
    match current_scope().filter(|scope| has_error_boundary(*scope)) {
        Some(scope) => report_error(Some(scope), CaughtError::new(err)),
        None => tracing::debug!(%key, error = %err, "query failed; left pending"),
    }
}

fn queue_client_fetch<T, F, Fut>(
    client: &super::data::ClientData,
    key: &str,
    fetch: F,
    state: &Signal<QueryState<T>>,
) where
    T: Serialize + DeserializeOwned + Clone + PartialEq + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
{
    let scope = current_scope();
    let state = state.clone();
    let key_owned = key.to_string();
    client.push_pending(
        key,
        || erase(fetch),
        move |result| {
            let decoded = match result {
                Ok(value) => serde_json::from_value::<T>(value.clone()).map_err(QueryError::from),
                Err(err) => Err(QueryError::fetch(err)),
            };
            match decoded {
                Ok(value) => state.set(QueryState::Ready(value)),
                Err(err) => {
                    tracing::debug!(key = %key_owned, error = %err, "reporting client query failure");
                    report_error(scope, CaughtError::new(err));
                }
            }
        },
    );
}
