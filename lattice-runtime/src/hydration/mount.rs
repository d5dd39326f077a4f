//! Mounting an application onto a document.

use std::cell::RefCell;
use std::rc::Rc;

use super::cursor::Cursor;
use super::report::{HydrationReport, HydrationState};
use crate::dom::{Document, DomId, DomNodeKind};
use crate::reactive::{create_root, dispose_scope, ScopeGuard, ScopeId};
use crate::ssr::data::{ClientData, RenderData};
use crate::ssr::RenderPayload;

/// How [`mount`] treats markup already inside the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationMode {
    /// Claim the existing markup, repairing what does not match.
    Tolerant,
    /// Throw the existing markup away and render on the client.
    Replace,
}

/// Options for [`mount`].
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// `None` picks [`HydrationMode::Tolerant`] when the target holds
    /// runtime-rendered markup and [`HydrationMode::Replace`] otherwise.
    pub hydration: Option<HydrationMode>,
    /// Query values serialized by the server render.
    pub payload: RenderPayload,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hydration(mut self, mode: HydrationMode) -> Self {
        self.hydration = Some(mode);
        self
    }

    pub fn payload(mut self, payload: RenderPayload) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug)]
struct StateLog {
    history: Vec<HydrationState>,
}

impl StateLog {
    fn new() -> Self {
        Self {
            history: vec![HydrationState::Idle],
        }
    }

    fn current(&self) -> HydrationState {
        self.history
            .last()
            .copied()
            .unwrap_or(HydrationState::Idle)
    }

    fn advance(&mut self, next: HydrationState) {
        let current = self.current();
        debug_assert!(
            current.can_transition_to(next),
            "invalid hydration transition {current:?} -> {next:?}"
        );
        tracing::debug!(from = ?current, to = ?next, "hydration state");
        self.history.push(next);
    }
}

/// A mounted application.
pub struct MountHandle {
    doc: Document,
    target: DomId,
    scope: ScopeId,
    data: Rc<ClientData>,
    report: Rc<RefCell<HydrationReport>>,
    states: StateLog,
}

impl MountHandle {
    pub fn state(&self) -> HydrationState {
        self.states.current()
    }

    /// Every state the root went through, starting with `Idle`.
    pub fn transitions(&self) -> &[HydrationState] {
        &self.states.history
    }

    pub fn report(&self) -> HydrationReport {
        self.report.borrow().clone()
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Keys of queries waiting to be fetched on the client.
    pub fn pending_queries(&self) -> Vec<String> {
        self.data.pending_keys()
    }

    /// Fetch every query the server could not resolve and apply the
    /// results. Returns how many fetches ran.
    pub async fn resolve_pending(&self) -> usize {
        self.data.resolve_pending().await
    }

    /// Dispose the application and empty the target.
    pub fn unmount(self) {
        dispose_scope(self.scope);
        self.data.clear_pending();
        self.doc.borrow_mut().clear_children(self.target);
    }
}

fn has_rendered_markup(doc: &Document, target: DomId) -> bool {
    let dom = doc.borrow();
    dom.children(target).iter().any(|child| {
        let kind = dom.kind(*child);
        !kind.is_foreign() && !matches!(kind, DomNodeKind::Text(_))
    })
}

fn render(app: &dyn Fn(&mut Cursor), mut cursor: Cursor, scope: ScopeId) -> Cursor {
    let _scope = ScopeGuard::enter(scope);
    app(&mut cursor);
    cursor.finish();
    cursor
}

/// Mount `app` into `target`.
///
/// In tolerant mode the existing markup is claimed. Mismatches that no
/// boundary absorbs abort the claim: everything built so far is disposed
/// and the app renders again on the client. Queries missing from the
/// payload are only fetched through [`MountHandle::resolve_pending`], after
/// claiming has finished.
pub fn mount(
    app: impl Fn(&mut Cursor),
    doc: &Document,
    target: DomId,
    options: MountOptions,
) -> MountHandle {
    let MountOptions { hydration, payload } = options;
    let mode = hydration.unwrap_or_else(|| {
        if has_rendered_markup(doc, target) {
            HydrationMode::Tolerant
        } else {
            HydrationMode::Replace
        }
    });

    let span = tracing::debug_span!("mount", ?mode, %target);
    let _span = span.enter();

    let data = Rc::new(ClientData::new(payload));
    let _data = RenderData::Client(Rc::clone(&data)).enter();
    let mut states = StateLog::new();

    let (scope, report) = match mode {
        HydrationMode::Tolerant => {
            states.advance(HydrationState::Claiming);
            let scope = create_root();
            let cursor = render(&app, Cursor::hydrate(doc.clone(), target), scope);
            let report = cursor.shared_report();

            if cursor.unresolved() {
                states.advance(HydrationState::Aborted);
                tracing::warn!(
                    mismatches = report.borrow().mismatches.len(),
                    "hydration could not be resolved; rendering on the client"
                );
                dispose_scope(scope);
                data.clear_pending();
                let removed = doc.borrow_mut().clear_children(target);

                let scope = create_root();
                let rebuilt = render(&app, Cursor::create(doc.clone(), target), scope).report();
                {
                    let mut report = report.borrow_mut();
                    report.discarded += removed;
                    report.created += rebuilt.created;
                }
                (scope, report)
            } else {
                let exact = {
                    let report = report.borrow();
                    report.mismatches.is_empty() && report.fallbacks == 0
                };
                states.advance(if exact {
                    HydrationState::Claimed
                } else {
                    HydrationState::PartiallyClaimed
                });
                (scope, report)
            }
        }
        HydrationMode::Replace => {
            let removed = doc.borrow_mut().clear_children(target);
            let scope = create_root();
            let cursor = render(&app, Cursor::create(doc.clone(), target), scope);
            let report = cursor.shared_report();
            report.borrow_mut().discarded += removed;
            (scope, report)
        }
    };

    states.advance(HydrationState::Interactive);
    tracing::debug!(
        state = ?states.history,
        pending = data.pending_keys().len(),
        "mounted"
    );

    MountHandle {
        doc: doc.clone(),
        target,
        scope,
        data,
        report,
        states,
    }
}
