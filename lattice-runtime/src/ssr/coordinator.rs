//! Two-pass server rendering.
//!
//! A render runs the template twice:
//!
//! 1. **Discovery**: every `query` records its fetch; nothing is awaited.
//! 2. Each discovered query races its fetch against the per-query timeout.
//!    Fetches keep running after a timeout and land in the [`QueryCache`],
//!    where the prefetch channel picks each one up once. Renders always
//!    fetch.
//! 3. **Final**: the template runs again. Queries that resolved in time
//!    start ready; the rest stay loading. Resolved values are serialized
//!    into the payload in discovery order.
//!
//! A timeout of zero skips discovery: one pass, every query loading, no
//! fetch started.

use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures_util::future::join_all;
use indexmap::IndexMap;
use tracing::{debug, warn, Instrument};

use super::cache::QueryCache;
use super::data::{Discovery, Final, QueryFuture, QueryOutcome, RenderData};
use super::payload::RenderPayload;
use crate::config::RenderOptions;
use crate::dom::Document;
use crate::error::PayloadError;
use crate::hydration::Cursor;
use crate::reactive::{create_root, dispose_scope, ScopeGuard};

/// The route being rendered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route(String);

impl Route {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Route {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Result of a server render.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub html: String,
    pub payload: RenderPayload,
    /// Queries the final pass left loading, in first-read order.
    pub pending: Vec<String>,
    /// The payload as a script tag, unless disabled in the options.
    pub script: Option<String>,
}

impl RenderOutput {
    /// Markup followed by the payload script.
    pub fn to_document_body(&self) -> String {
        match &self.script {
            Some(script) => format!("{}{}", self.html, script),
            None => self.html.clone(),
        }
    }
}

/// Runs server renders and owns the cache late query results go to.
#[derive(Debug, Clone, Default)]
pub struct RenderCoordinator {
    options: RenderOptions,
    cache: QueryCache,
}

impl RenderCoordinator {
    pub fn new(options: RenderOptions) -> Self {
        Self::with_cache(options, QueryCache::new())
    }

    /// Share `cache` with other coordinators.
    pub fn with_cache(options: RenderOptions, cache: QueryCache) -> Self {
        Self { options, cache }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Keys of every query the template creates for `route`, in discovery
    /// order. No fetch is awaited.
    pub fn discover_queries<T>(&self, template: &T, route: &Route) -> Vec<String>
    where
        T: Fn(&mut Cursor, &Route),
    {
        discover(template, route).into_keys().collect()
    }

    /// Render with the configured timeout.
    pub async fn render<T>(&self, template: &T, route: &Route) -> Result<RenderOutput, PayloadError>
    where
        T: Fn(&mut Cursor, &Route),
    {
        self.render_with_timeout(template, route, self.options.ssr_timeout)
            .await
    }

    /// Render, giving each query at most `timeout` to resolve.
    pub async fn render_with_timeout<T>(
        &self,
        template: &T,
        route: &Route,
        timeout: Duration,
    ) -> Result<RenderOutput, PayloadError>
    where
        T: Fn(&mut Cursor, &Route),
    {
        let span = tracing::info_span!(
            "render",
            route = %route,
            timeout_ms = timeout.as_millis() as u64
        );

        async move {
            let outcomes = if timeout.is_zero() {
                debug!("server data loading disabled; rendering once");
                IndexMap::new()
            } else {
                let queries = discover(template, route);
                debug!(queries = queries.len(), "discovery pass complete");
                self.resolve_all(queries, timeout).await
            };

            let mut payload = RenderPayload::new();
            for (key, outcome) in &outcomes {
                if let QueryOutcome::Resolved(value) = outcome {
                    payload.push(key.clone(), value.clone());
                }
            }

            let pass = Rc::new(Final::new(outcomes));
            let html = run_pass(template, route, RenderData::Final(Rc::clone(&pass)));
            let pending: Vec<String> = pass
                .requested()
                .into_iter()
                .filter(|key| !payload.contains(key))
                .collect();
            debug!(
                resolved = payload.len(),
                pending = pending.len(),
                "final pass complete"
            );

            let script = if self.options.include_payload {
                Some(payload.to_script_tag(&self.options.payload_var)?)
            } else {
                None
            };

            Ok(RenderOutput {
                html,
                payload,
                pending,
                script,
            })
        }
        .instrument(span)
        .await
    }

    async fn resolve_all(
        &self,
        queries: IndexMap<String, QueryFuture>,
        timeout: Duration,
    ) -> IndexMap<String, QueryOutcome> {
        let races = queries
            .into_iter()
            .map(|(key, fetch)| self.resolve_one(key, fetch, timeout, false));
        join_all(races).await.into_iter().collect()
    }

    /// Race one query against `timeout`. The fetch always starts; if it
    /// outlives the timeout it keeps running and its value goes to the
    /// cache. With `take_late`, a value already waiting there is consumed
    /// instead of fetching.
    pub(super) fn resolve_one(
        &self,
        key: String,
        fetch: QueryFuture,
        timeout: Duration,
        take_late: bool,
    ) -> impl Future<Output = (String, QueryOutcome)> + Send + 'static {
        let cache = self.cache.clone();
        async move {
            if take_late {
                if let Some(value) = cache.remove(&key) {
                    debug!(%key, "late result taken from cache");
                    return (key, QueryOutcome::Resolved(value));
                }
            }

            let mut task = tokio::spawn(fetch);
            let outcome = match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(Ok(value))) => QueryOutcome::Resolved(value),
                Ok(Ok(Err(err))) => {
                    warn!(%key, error = %err, "query failed during server render");
                    QueryOutcome::Failed(err.to_string())
                }
                Ok(Err(err)) => {
                    warn!(%key, error = %err, "query task did not complete");
                    QueryOutcome::Failed(err.to_string())
                }
                Err(_) => {
                    debug!(%key, ?timeout, "query timed out; leaving it pending");
                    let key = key.clone();
                    tokio::spawn(async move {
                        if let Ok(Ok(value)) = task.await {
                            debug!(%key, "late query result cached");
                            cache.insert(key, value);
                        }
                    });
                    QueryOutcome::Pending
                }
            };
            (key, outcome)
        }
    }
}

/// Run the discovery pass and return the recorded fetches.
pub(super) fn discover<T>(template: &T, route: &Route) -> IndexMap<String, QueryFuture>
where
    T: Fn(&mut Cursor, &Route),
{
    let discovery = Rc::new(Discovery::default());
    run_pass(template, route, RenderData::Discovery(Rc::clone(&discovery)));
    discovery.take_queries()
}

/// Render `template` into a fresh document under `data` and tear it down.
fn run_pass<T>(template: &T, route: &Route, data: RenderData) -> String
where
    T: Fn(&mut Cursor, &Route),
{
    let doc = Document::new();
    let root = doc.root();
    let scope = create_root();
    {
        let _scope = ScopeGuard::enter(scope);
        let _data = data.enter();
        let mut cursor = Cursor::create(doc.clone(), root);
        template(&mut cursor, route);
        cursor.finish();
    }
    let html = doc.inner_html(root);
    dispose_scope(scope);
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::ssr::query::{query, QueryState};
    use serde_json::json;

    async fn after(ms: u64, value: &'static str) -> Result<String, QueryError> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(value.to_string())
    }

    fn user_page(c: &mut Cursor, route: &Route) {
        let user = query("user", || after(10, "ada"));
        c.element("main", &[("data-route", route.path())]);
        c.enter_children();
        let text = match user.get() {
            QueryState::Ready(name) => name,
            QueryState::Loading => "loading".to_string(),
        };
        c.static_text(&text);
        c.exit_children();
    }

    #[test]
    fn discovery_lists_queries_without_fetching() {
        let coordinator = RenderCoordinator::default();
        let keys = coordinator.discover_queries(&user_page, &Route::new("/u"));
        assert_eq!(keys, vec!["user"]);
        assert!(coordinator.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_queries_render_and_serialize() {
        let coordinator = RenderCoordinator::default();
        let output = coordinator
            .render(&user_page, &Route::new("/u"))
            .await
            .unwrap();

        assert_eq!(
            output.html,
            r#"<main data-lk data-route="/u">ada</main>"#
        );
        assert_eq!(output.payload.get("user"), Some(&json!("ada")));
        assert!(output.pending.is_empty());
        assert!(output.script.unwrap().contains("window.__LATTICE_DATA__"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_renders_once_with_everything_pending() {
        let coordinator = RenderCoordinator::new(RenderOptions::new().no_data());
        let output = coordinator
            .render(&user_page, &Route::new("/u"))
            .await
            .unwrap();

        assert!(output.html.contains(">loading<"));
        assert!(output.payload.is_empty());
        assert_eq!(output.pending, vec!["user"]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(coordinator.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn renders_fetch_even_when_the_cache_has_a_value() {
        let coordinator = RenderCoordinator::new(RenderOptions::new().without_payload());
        coordinator.cache().insert("user", json!("grace"));

        let output = coordinator
            .render(&user_page, &Route::new("/u"))
            .await
            .unwrap();

        assert!(output.html.contains(">ada<"));
        assert!(output.script.is_none());
        assert!(coordinator.cache().contains("user"));
    }

    #[tokio::test(start_paused = true)]
    async fn only_late_results_are_cached() {
        let coordinator = RenderCoordinator::default();

        coordinator
            .render_with_timeout(&user_page, &Route::new("/u"), Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coordinator.cache().is_empty());

        coordinator
            .render_with_timeout(&user_page, &Route::new("/u"), Duration::from_millis(1))
            .await
            .unwrap();
        assert!(coordinator.cache().is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coordinator.cache().get("user"), Some(json!("ada")));
    }
}
