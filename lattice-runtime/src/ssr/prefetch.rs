//! Navigation prefetch channel.
//!
//! When a client navigates, it can ask the server for a route's data instead
//! of its markup by sending [`PREFETCH_HEADER`]. The response is an
//! event stream with one `query` event per query resolved within the
//! timeout, in completion order, and a final `done` event:
//!
//! ```text
//! event: query
//! data: {"key":"user","value":"ada"}
//!
//! event: done
//! data:
//!
//! ```

use std::time::Duration;

use futures_util::stream::{self, FuturesUnordered, Stream, StreamExt};

use super::coordinator::{discover, RenderCoordinator, Route};
use super::data::QueryOutcome;
use super::payload::PayloadEntry;
use crate::error::PayloadError;
use crate::hydration::Cursor;

/// Request header selecting the prefetch channel.
pub const PREFETCH_HEADER: &str = "x-lattice-prefetch";

/// Content type of a prefetch response.
pub const PREFETCH_CONTENT_TYPE: &str = "text/event-stream";

/// Whether a request asked for the prefetch channel. Header names compare
/// case-insensitively; the value must be `1` or `true`.
pub fn is_prefetch_request<I, K, V>(headers: I) -> bool
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    headers.into_iter().any(|(name, value)| {
        name.as_ref().eq_ignore_ascii_case(PREFETCH_HEADER)
            && matches!(value.as_ref().trim(), "1" | "true")
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrefetchEvent {
    Query(PayloadEntry),
    Done,
}

impl PrefetchEvent {
    /// Encode as one event-stream frame.
    pub fn to_sse(&self) -> Result<String, PayloadError> {
        match self {
            PrefetchEvent::Query(entry) => Ok(format!(
                "event: query\ndata: {}\n\n",
                serde_json::to_string(entry)?
            )),
            PrefetchEvent::Done => Ok("event: done\ndata: \n\n".to_string()),
        }
    }
}

/// Incremental decoder for a prefetch response body.
#[derive(Debug, Default)]
pub struct PrefetchDecoder {
    buffer: String,
    done: bool,
}

impl PrefetchDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `done` event has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a chunk of the body and return every event it completed.
    /// A frame split across chunks is kept until its blank line arrives.
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<PrefetchEvent>, PayloadError> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_frame(&frame)? {
                if event == PrefetchEvent::Done {
                    self.done = true;
                }
                events.push(event);
            }
        }
        Ok(events)
    }
}

fn parse_frame(frame: &str) -> Result<Option<PrefetchEvent>, PayloadError> {
    let mut name = None;
    let mut data = String::new();

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            name = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
        } else {
            return Err(PayloadError::Frame(format!("unexpected line {line:?}")));
        }
    }

    match name {
        Some("query") => Ok(Some(PrefetchEvent::Query(serde_json::from_str(&data)?))),
        Some("done") => Ok(Some(PrefetchEvent::Done)),
        Some(other) => Err(PayloadError::Frame(format!("unknown event {other:?}"))),
        None if data.is_empty() => Ok(None),
        None => Err(PayloadError::Frame("data without an event name".to_string())),
    }
}

impl RenderCoordinator {
    /// Discover the queries of `route` and stream each one that resolves
    /// within `timeout`, ending with [`PrefetchEvent::Done`]. A late result
    /// from an earlier server render is sent without fetching again, and
    /// removed from the cache.
    ///
    /// Discovery runs before this returns; the stream itself only awaits
    /// the fetches.
    pub fn prefetch<T>(
        &self,
        template: &T,
        route: &Route,
        timeout: Duration,
    ) -> impl Stream<Item = PrefetchEvent> + Send + 'static
    where
        T: Fn(&mut Cursor, &Route),
    {
        let races: FuturesUnordered<_> = if timeout.is_zero() {
            FuturesUnordered::new()
        } else {
            discover(template, route)
                .into_iter()
                .map(|(key, fetch)| self.resolve_one(key, fetch, timeout, true))
                .collect()
        };
        tracing::debug!(%route, queries = races.len(), "prefetch started");

        races
            .filter_map(|(key, outcome)| async move {
                match outcome {
                    QueryOutcome::Resolved(value) => {
                        Some(PrefetchEvent::Query(PayloadEntry { key, value }))
                    }
                    QueryOutcome::Pending | QueryOutcome::Failed(_) => None,
                }
            })
            .chain(stream::once(async { PrefetchEvent::Done }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::ssr::query::query;
    use serde_json::json;

    async fn after(ms: u64, value: u32) -> Result<u32, QueryError> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(value)
    }

    fn dashboard(_: &mut Cursor, _: &Route) {
        query("slow", || after(500, 1));
        query("fast", || after(5, 2));
        query("medium", || after(50, 3));
    }

    #[test]
    fn detects_the_prefetch_header() {
        assert!(is_prefetch_request([("X-Lattice-Prefetch", "1")]));
        assert!(is_prefetch_request(vec![(
            "accept".to_string(),
            "text/html".to_string()
        ), (
            "x-lattice-prefetch".to_string(),
            "true".to_string()
        )]));
        assert!(!is_prefetch_request([("x-lattice-prefetch", "0")]));
        assert!(!is_prefetch_request(Vec::<(&str, &str)>::new()));
    }

    #[test]
    fn frames_decode_across_chunk_splits() {
        let events = [
            PrefetchEvent::Query(PayloadEntry {
                key: "user".into(),
                value: json!({"name": "ada"}),
            }),
            PrefetchEvent::Done,
        ];
        let body: String = events.iter().map(|e| e.to_sse().unwrap()).collect();
        let (head, tail) = body.split_at(body.len() / 2);

        let mut decoder = PrefetchDecoder::new();
        let mut decoded = decoder.feed(head).unwrap();
        assert!(!decoder.is_done());
        decoded.extend(decoder.feed(tail).unwrap());

        assert_eq!(decoded, events);
        assert!(decoder.is_done());
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let mut decoder = PrefetchDecoder::new();
        assert!(matches!(
            decoder.feed("event: nope\ndata: 1\n\n"),
            Err(PayloadError::Frame(_))
        ));
        assert!(decoder.feed("event: query\ndata: {oops\n\n").is_err());
        assert!(decoder.feed(": keep-alive\n\n").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn streams_resolved_queries_in_completion_order() {
        let coordinator = RenderCoordinator::default();
        let events: Vec<_> = coordinator
            .prefetch(&dashboard, &Route::new("/"), Duration::from_millis(100))
            .collect()
            .await;

        let keys: Vec<_> = events
            .iter()
            .map(|event| match event {
                PrefetchEvent::Query(entry) => entry.key.as_str(),
                PrefetchEvent::Done => "done",
            })
            .collect();
        assert_eq!(keys, vec!["fast", "medium", "done"]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_server_results_are_sent_once() {
        let coordinator = RenderCoordinator::default();
        coordinator.cache().insert("slow", serde_json::json!(7));

        let first: Vec<_> = coordinator
            .prefetch(&dashboard, &Route::new("/"), Duration::from_millis(100))
            .collect()
            .await;
        assert!(first.contains(&PrefetchEvent::Query(PayloadEntry {
            key: "slow".into(),
            value: json!(7),
        })));
        assert!(!coordinator.cache().contains("slow"));

        let second: Vec<_> = coordinator
            .prefetch(&dashboard, &Route::new("/"), Duration::from_millis(100))
            .collect()
            .await;
        assert!(second
            .iter()
            .all(|event| !matches!(event, PrefetchEvent::Query(entry) if entry.key == "slow")));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_streams_only_done() {
        let coordinator = RenderCoordinator::default();
        let events: Vec<_> = coordinator
            .prefetch(&dashboard, &Route::new("/"), Duration::ZERO)
            .collect()
            .await;
        assert_eq!(events, vec![PrefetchEvent::Done]);
    }
}
