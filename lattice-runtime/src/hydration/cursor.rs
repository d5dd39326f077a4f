//! The hydration cursor.
//!
//! Compiled templates drive a [`Cursor`] in document order: claim a node,
//! step into its children, bind reactivity to what was claimed, step back
//! out. In create mode every claim makes a new node. In hydrate mode a claim
//! consumes the next compatible node that is already in the document, and
//! only creates one when the markup does not match.
//!
//! Mismatches are resolved as locally as possible:
//!
//! 1. Unexpected nodes ahead of a compatible one are removed and the
//!    compatible one is claimed. Failing that, the incompatible node is
//!    replaced in place.
//! 2. Structure the cursor cannot patch (reactive wrappers, boundary markers,
//!    unexpected leftover nodes) marks the walk unresolved. The nearest
//!    enclosing [`boundary`](Cursor::boundary) then discards its markup and
//!    renders its content from scratch.
//! 3. Without a boundary, the unresolved flag reaches the root and
//!    [`mount`](super::mount) falls back to a full client render.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::report::{HydrationReport, Mismatch, Resolution};
use crate::dom::{
    BoundaryEdge, Document, Dom, DomId, DomNodeKind, Event, Fragment, ListenerId, WrapperKind,
};
use crate::error::{CaughtError, DisposalScopeError};
use crate::reactive::{self, Effect, Runtime, ScopeGuard, ScopeId};
use crate::ssr::data::RenderData;

/// What a template expects at the cursor position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected<'a> {
    Element(&'a str),
    Text(&'a str),
    Wrapper(WrapperKind),
}

impl Expected<'_> {
    fn describe(self) -> String {
        match self {
            Expected::Element(tag) => format!("<{tag}>"),
            Expected::Text(text) => format!("text {text:?}"),
            Expected::Wrapper(kind) => format!("<{}>", kind.tag()),
        }
    }

    fn matches(self, found: &DomNodeKind) -> bool {
        match (self, found) {
            (Expected::Element(want), DomNodeKind::Element { tag, .. }) => {
                tag.eq_ignore_ascii_case(want)
            }
            (Expected::Text(_), DomNodeKind::Text(_)) => true,
            (Expected::Wrapper(want), DomNodeKind::Wrapper { kind, .. }) => *kind == want,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    /// Every claim creates a node.
    Create,
    /// Claims consume existing nodes.
    Hydrate,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    parent: DomId,
    /// Next candidate when hydrating.
    next: Option<DomId>,
    /// Node the frame stops at (a boundary's close marker).
    end: Option<DomId>,
    mode: CursorMode,
}

impl Frame {
    fn open(dom: &Dom, parent: DomId, mode: CursorMode) -> Self {
        let next = match mode {
            CursorMode::Hydrate => dom.first_child(parent),
            CursorMode::Create => None,
        };
        Self {
            parent,
            next,
            end: None,
            mode,
        }
    }

    fn anchor(&self) -> Option<DomId> {
        self.next.or(self.end)
    }
}

type Shared<T> = Rc<RefCell<T>>;

/// Traversal pointer over a [`Document`].
pub struct Cursor {
    doc: Document,
    report: Shared<HydrationReport>,
    unresolved: Rc<Cell<bool>>,
    frames: Vec<Frame>,
    /// Last claimed node and whether the cursor created it.
    last: Option<(DomId, bool)>,
}

impl Cursor {
    /// A cursor that builds new nodes under `parent`.
    pub fn create(doc: Document, parent: DomId) -> Self {
        Self::new(doc, parent, CursorMode::Create)
    }

    /// A cursor that claims the existing children of `parent`.
    pub fn hydrate(doc: Document, parent: DomId) -> Self {
        Self::new(doc, parent, CursorMode::Hydrate)
    }

    fn new(doc: Document, parent: DomId, mode: CursorMode) -> Self {
        let frame = Frame::open(&doc.borrow(), parent, mode);
        Self::with_frame(doc, Rc::default(), Rc::default(), frame)
    }

    fn with_frame(
        doc: Document,
        report: Shared<HydrationReport>,
        unresolved: Rc<Cell<bool>>,
        frame: Frame,
    ) -> Self {
        Self {
            doc,
            report,
            unresolved,
            frames: vec![frame],
            last: None,
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn mode(&self) -> CursorMode {
        self.frame().mode
    }

    pub fn is_hydrating(&self) -> bool {
        self.mode() == CursorMode::Hydrate
    }

    /// Whether a mismatch escaped every boundary so far.
    pub fn unresolved(&self) -> bool {
        self.unresolved.get()
    }

    /// Snapshot of what the walk has done.
    pub fn report(&self) -> HydrationReport {
        self.report.borrow().clone()
    }

    pub(crate) fn shared_report(&self) -> Shared<HydrationReport> {
        Rc::clone(&self.report)
    }

    fn frame(&self) -> &Frame {
        self.frames
            .last()
            .expect("cursor used after its walk finished")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames
            .last_mut()
            .expect("cursor used after its walk finished")
    }

    /// Next claimable node of the current frame, stepping over foreign ones.
    /// Text counts as foreign unless `wants_text`: nothing but a text claim
    /// could ever consume it.
    fn candidate(&mut self, wants_text: bool) -> Option<DomId> {
        let dom = self.doc.borrow();
        let frame = self.frames.last_mut()?;
        while let Some(next) = frame.next {
            if Some(next) == frame.end {
                return None;
            }
            let kind = dom.kind(next);
            if !kind.is_foreign() && (wants_text || !matches!(kind, DomNodeKind::Text(_))) {
                return Some(next);
            }
            tracing::trace!(node = %next, "skipping foreign node");
            frame.next = dom.next_sibling(next);
            self.report.borrow_mut().skipped_foreign += 1;
        }
        None
    }

    fn escalate(&self) {
        self.unresolved.set(true);
    }

    fn create_at_anchor(&mut self, expected: Expected<'_>, attrs: &[(&str, &str)]) -> DomId {
        let frame = *self.frame();
        let id = {
            let mut dom = self.doc.borrow_mut();
            let id = match expected {
                Expected::Element(tag) => dom.create_element(tag),
                Expected::Text(text) => dom.create_text(text),
                Expected::Wrapper(kind) => dom.create_wrapper(kind),
            };
            for (name, value) in attrs {
                dom.set_attr(id, name, *value);
            }
            dom.insert_before(frame.parent, id, frame.anchor());
            id
        };
        self.report.borrow_mut().created += 1;
        self.last = Some((id, true));
        id
    }

    fn advance_past(&mut self, id: DomId) {
        let next = self.doc.borrow().next_sibling(id);
        self.frame_mut().next = next;
    }

    fn claim_node(
        &mut self,
        expected: Expected<'_>,
        attrs: &[(&str, &str)],
        patch_text: bool,
    ) -> DomId {
        if self.mode() == CursorMode::Create {
            return self.create_at_anchor(expected, attrs);
        }

        let Some(found) = self.candidate(matches!(expected, Expected::Text(_))) else {
            let id = self.create_at_anchor(expected, attrs);
            self.report.borrow_mut().record(Mismatch {
                expected: expected.describe(),
                found: None,
                resolution: Resolution::Inserted,
            });
            return id;
        };

        let found_kind = self.doc.borrow().kind(found).clone();
        if expected.matches(&found_kind) {
            return self.adopt(found, expected, attrs, patch_text);
        }
        if let Some(matched) = self.matching_sibling(expected, found) {
            self.discard_before(found, matched, expected);
            return self.adopt(matched, expected, attrs, patch_text);
        }

        let structural = matches!(expected, Expected::Wrapper(_))
            || matches!(
                found_kind,
                DomNodeKind::Wrapper { .. } | DomNodeKind::Boundary(_)
            );
        let id = self.create_at_anchor(expected, attrs);
        self.doc.borrow_mut().remove(found);
        self.advance_past(id);

        let resolution = if structural {
            self.escalate();
            Resolution::Escalated
        } else {
            Resolution::Replaced
        };
        let mut report = self.report.borrow_mut();
        report.discarded += 1;
        report.record(Mismatch {
            expected: expected.describe(),
            found: Some(found_kind.describe()),
            resolution,
        });
        id
    }

    fn adopt(
        &mut self,
        found: DomId,
        expected: Expected<'_>,
        attrs: &[(&str, &str)],
        patch_text: bool,
    ) -> DomId {
        {
            let mut dom = self.doc.borrow_mut();
            for (name, value) in attrs {
                if dom.attr(found, name) != Some(*value) {
                    dom.set_attr(found, name, *value);
                }
            }
            if let (true, Expected::Text(text)) = (patch_text, expected) {
                if dom.text(found) != Some(text) {
                    dom.set_text(found, text);
                }
            }
        }
        self.advance_past(found);
        self.report.borrow_mut().claimed += 1;
        self.last = Some((found, false));
        found
    }

    /// A later sibling of `found` that `expected` can claim. The scan stops
    /// at the frame end and at boundary markers; text is never searched for.
    fn matching_sibling(&self, expected: Expected<'_>, found: DomId) -> Option<DomId> {
        if matches!(expected, Expected::Text(_)) {
            return None;
        }
        let dom = self.doc.borrow();
        if matches!(dom.kind(found), DomNodeKind::Boundary(_)) {
            return None;
        }
        let end = self.frame().end;
        let mut current = dom.next_sibling(found);
        while let Some(id) = current {
            if Some(id) == end {
                return None;
            }
            let kind = dom.kind(id);
            if matches!(kind, DomNodeKind::Boundary(_)) {
                return None;
            }
            if !kind.is_foreign() && expected.matches(kind) {
                return Some(id);
            }
            current = dom.next_sibling(id);
        }
        None
    }

    /// Remove the unexpected nodes from `first` up to `matched`. Foreign
    /// nodes and stray text in between stay where they are.
    fn discard_before(&mut self, first: DomId, matched: DomId, expected: Expected<'_>) {
        let mut current = Some(first);
        while let Some(id) = current {
            if id == matched {
                break;
            }
            let (next, kind) = {
                let dom = self.doc.borrow();
                (dom.next_sibling(id), dom.kind(id).clone())
            };
            if kind.is_foreign() || matches!(kind, DomNodeKind::Text(_)) {
                self.report.borrow_mut().skipped_foreign += 1;
            } else {
                self.doc.borrow_mut().remove(id);
                let mut report = self.report.borrow_mut();
                report.discarded += 1;
                report.record(Mismatch {
                    expected: expected.describe(),
                    found: Some(kind.describe()),
                    resolution: Resolution::Discarded,
                });
            }
            current = next;
        }
    }

    /// Claim the next node, patching attributes (and text content) that
    /// differ from what the template expects.
    pub fn claim(&mut self, expected: Expected<'_>, attrs: &[(&str, &str)]) -> DomId {
        self.claim_node(expected, attrs, true)
    }

    pub fn element(&mut self, tag: &str, attrs: &[(&str, &str)]) -> DomId {
        self.claim(Expected::Element(tag), attrs)
    }

    /// Step into the children of the last claimed node.
    ///
    /// # Panics
    ///
    /// Panics if nothing has been claimed at this level yet.
    pub fn enter_children(&mut self) {
        let Some((parent, fresh)) = self.last else {
            panic!("enter_children called before any node was claimed");
        };
        let mode = if fresh { CursorMode::Create } else { self.mode() };
        let frame = Frame::open(&self.doc.borrow(), parent, mode);
        self.frames.push(frame);
        self.last = None;
    }

    /// Step back out to the parent level.
    ///
    /// Keyed nodes the template never claimed are left in place and mark the
    /// walk unresolved. Stray text is stepped over.
    ///
    /// # Panics
    ///
    /// Panics when called without a matching [`enter_children`](Self::enter_children).
    pub fn exit_children(&mut self) {
        assert!(
            self.frames.len() > 1,
            "exit_children called without a matching enter_children"
        );
        self.close_frame();
    }

    fn close_frame(&mut self) {
        if self.mode() == CursorMode::Hydrate {
            while let Some(leftover) = self.candidate(false) {
                let found = self.doc.borrow().kind(leftover).describe();
                self.escalate();
                self.report.borrow_mut().record(Mismatch {
                    expected: "end of children".to_string(),
                    found: Some(found),
                    resolution: Resolution::Escalated,
                });
                self.advance_past(leftover);
            }
        }
        if let Some(frame) = self.frames.pop() {
            self.last = Some((frame.parent, frame.mode == CursorMode::Create));
        }
    }

    /// Close every open level, the root included.
    pub fn finish(&mut self) {
        while !self.frames.is_empty() {
            self.close_frame();
        }
    }

    /// Position an inert tree. A node of the same kind and tag is claimed
    /// whole without looking inside it; anything else is replaced.
    pub fn append(&mut self, fragment: &Fragment) -> DomId {
        let expected = match fragment {
            Fragment::Element(el) => Expected::Element(el.tag_name()),
            Fragment::Text(text) => Expected::Text(text),
        };

        let found = match self.mode() {
            CursorMode::Hydrate => self.candidate(matches!(expected, Expected::Text(_))),
            CursorMode::Create => None,
        };
        if let Some(found) = found {
            if expected.matches(self.doc.borrow().kind(found)) {
                self.advance_past(found);
                self.report.borrow_mut().claimed += 1;
                self.last = Some((found, false));
                return found;
            }
        }

        let frame = *self.frame();
        let id = {
            let mut dom = self.doc.borrow_mut();
            let id = dom.build(fragment);
            dom.insert_before(frame.parent, id, frame.anchor());
            id
        };
        self.report.borrow_mut().created += fragment.node_count();
        self.last = Some((id, true));

        if let Some(found) = found {
            let found_kind = self.doc.borrow().kind(found).describe();
            self.doc.borrow_mut().remove(found);
            self.advance_past(id);
            let mut report = self.report.borrow_mut();
            report.discarded += 1;
            report.record(Mismatch {
                expected: expected.describe(),
                found: Some(found_kind),
                resolution: Resolution::Replaced,
            });
        }
        id
    }

    /// Position a static text node without comparing its content.
    pub fn static_text(&mut self, content: &str) -> DomId {
        self.claim_node(Expected::Text(content), &[], false)
    }

    /// A text node kept in sync with `text`.
    pub fn dyn_text(&mut self, text: impl Fn() -> String + 'static) -> DomId {
        let id = self.claim_node(Expected::Text(""), &[], false);
        let doc = self.doc.clone();
        Effect::new(move || {
            let value = text();
            let mut dom = doc.borrow_mut();
            if dom.text(id) != Some(value.as_str()) {
                dom.set_text(id, value);
            }
        });
        id
    }

    /// Keep attribute `name` of `el` in sync with `value`; `None` removes it.
    pub fn bind_attr(
        &mut self,
        el: DomId,
        name: &str,
        value: impl Fn() -> Option<String> + 'static,
    ) {
        let doc = self.doc.clone();
        let name = name.to_string();
        Effect::new(move || {
            let value = value();
            let mut dom = doc.borrow_mut();
            match value {
                Some(value) if dom.attr(el, &name) != Some(value.as_str()) => {
                    dom.set_attr(el, &name, value)
                }
                Some(_) => {}
                None => dom.remove_attr(el, &name),
            }
        });
    }

    /// Attach a listener that is removed when the current scope is disposed.
    ///
    /// # Errors
    ///
    /// Returns [`DisposalScopeError`] when no scope is current; the listener
    /// is not attached.
    #[track_caller]
    pub fn on(
        &mut self,
        el: DomId,
        event: &str,
        handler: impl Fn(&Event) + 'static,
    ) -> Result<ListenerId, DisposalScopeError> {
        let listener = self
            .doc
            .borrow_mut()
            .add_listener(el, event, Rc::new(handler));
        let doc = self.doc.clone();
        match reactive::on_cleanup(move || doc.borrow_mut().remove_listener(el, listener)) {
            Ok(()) => Ok(listener),
            Err(err) => {
                self.doc.borrow_mut().remove_listener(el, listener);
                Err(err)
            }
        }
    }

    /// A reactive region: `render` drives a cursor over the region wrapper
    /// and re-runs from scratch whenever something it read changes.
    ///
    /// The first run hydrates the server markup. Escalations inside it are
    /// not absorbed by the region.
    pub fn region(&mut self, render: impl Fn(&mut Cursor) + 'static) -> DomId {
        let wrapper = self.claim_node(Expected::Wrapper(WrapperKind::Region), &[], false);
        let mode = self.child_mode();
        let first = Cell::new(Some((
            mode,
            Rc::clone(&self.report),
            Rc::clone(&self.unresolved),
        )));
        let doc = self.doc.clone();
        let data = RenderData::current();

        Effect::new(move || {
            let _data = data.as_ref().map(RenderData::enter);
            let mut cursor = match first.take() {
                Some((mode, report, unresolved)) => {
                    let frame = Frame::open(&doc.borrow(), wrapper, mode);
                    Cursor::with_frame(doc.clone(), report, unresolved, frame)
                }
                None => {
                    doc.borrow_mut().clear_children(wrapper);
                    Cursor::create(doc.clone(), wrapper)
                }
            };
            render(&mut cursor);
            cursor.finish();
        });
        wrapper
    }

    /// An opaque reactive insert: the wrapper is claimed, any server
    /// children are dropped, and `render`'s fragments are rebuilt inside it
    /// on every change.
    pub fn insert(&mut self, render: impl Fn() -> Vec<Fragment> + 'static) -> DomId {
        let wrapper = self.claim_node(Expected::Wrapper(WrapperKind::Insert), &[], false);
        if self.child_mode() == CursorMode::Hydrate {
            let removed = self.doc.borrow_mut().clear_children(wrapper);
            self.report.borrow_mut().discarded += removed;
        }

        let doc = self.doc.clone();
        let first = Cell::new(Some(Rc::clone(&self.report)));
        Effect::new(move || {
            let fragments = render();
            {
                let mut dom = doc.borrow_mut();
                dom.clear_children(wrapper);
                for fragment in &fragments {
                    let node = dom.build(fragment);
                    dom.append_child(wrapper, node);
                }
            }
            if let Some(report) = first.take() {
                report.borrow_mut().created +=
                    fragments.iter().map(Fragment::node_count).sum::<usize>();
            }
        });
        wrapper
    }

    /// A fragment boundary. If hydrating its content cannot be resolved,
    /// the server markup between the markers is discarded and the content
    /// renders from scratch; the rest of the page stays claimed.
    pub fn boundary(&mut self, content: impl Fn(&mut Cursor) + 'static) {
        self.open_boundary(Box::new(content), None);
    }

    /// A fragment boundary that also catches errors raised beneath it and
    /// renders `fallback` in place of its content.
    pub fn error_boundary(
        &mut self,
        fallback: impl Fn(&mut Cursor, &CaughtError) + 'static,
        content: impl Fn(&mut Cursor) + 'static,
    ) {
        self.open_boundary(Box::new(content), Some(Box::new(fallback)));
    }

    fn child_mode(&self) -> CursorMode {
        match self.last {
            Some((_, true)) => CursorMode::Create,
            _ => self.mode(),
        }
    }

    fn open_boundary(&mut self, content: ContentFn, fallback: Option<FallbackFn>) {
        let (open, close, mode) = self.claim_markers();
        let parent = self.frame().parent;

        let boundary = Rc::new(Boundary {
            doc: self.doc.clone(),
            report: Rc::clone(&self.report),
            parent,
            open,
            close,
            owner: reactive::current_scope(),
            data: RenderData::current(),
            content,
            fallback,
            scope: Cell::new(None),
            armed: Cell::new(false),
            showing_fallback: Cell::new(false),
            errors: RefCell::default(),
        });
        boundary.mount(mode);
        self.last = Some((close, mode == CursorMode::Create));
    }

    /// Claim or create the open/close markers of a boundary. Returns the
    /// mode its content renders in.
    fn claim_markers(&mut self) -> (DomId, DomId, CursorMode) {
        let found = match self.mode() {
            CursorMode::Hydrate => self.candidate(false),
            CursorMode::Create => None,
        };

        if let Some(found) = found {
            let close = {
                let dom = self.doc.borrow();
                match dom.kind(found) {
                    DomNodeKind::Boundary(BoundaryEdge::Open) => matching_close(&dom, found),
                    _ => None,
                }
            };
            if let Some(close) = close {
                self.advance_past(close);
                self.report.borrow_mut().claimed += 2;
                return (found, close, CursorMode::Hydrate);
            }

            let found_kind = self.doc.borrow().kind(found).describe();
            self.escalate();
            self.report.borrow_mut().record(Mismatch {
                expected: "boundary open".to_string(),
                found: Some(found_kind),
                resolution: Resolution::Escalated,
            });
        } else if self.mode() == CursorMode::Hydrate {
            self.report.borrow_mut().record(Mismatch {
                expected: "boundary open".to_string(),
                found: None,
                resolution: Resolution::Inserted,
            });
        }

        let frame = *self.frame();
        let (open, close) = {
            let mut dom = self.doc.borrow_mut();
            let open = dom.create_boundary(BoundaryEdge::Open);
            let close = dom.create_boundary(BoundaryEdge::Close);
            dom.insert_before(frame.parent, open, frame.anchor());
            dom.insert_before(frame.parent, close, frame.anchor());
            (open, close)
        };
        self.report.borrow_mut().created += 2;
        (open, close, CursorMode::Create)
    }
}

fn matching_close(dom: &Dom, open: DomId) -> Option<DomId> {
    let mut depth = 0usize;
    let mut current = dom.next_sibling(open);
    while let Some(id) = current {
        match dom.kind(id) {
            DomNodeKind::Boundary(BoundaryEdge::Open) => depth += 1,
            DomNodeKind::Boundary(BoundaryEdge::Close) if depth == 0 => return Some(id),
            DomNodeKind::Boundary(BoundaryEdge::Close) => depth -= 1,
            _ => {}
        }
        current = dom.next_sibling(id);
    }
    None
}

type ContentFn = Box<dyn Fn(&mut Cursor)>;
type FallbackFn = Box<dyn Fn(&mut Cursor, &CaughtError)>;

struct Boundary {
    doc: Document,
    report: Shared<HydrationReport>,
    parent: DomId,
    open: DomId,
    close: DomId,
    owner: Option<ScopeId>,
    data: Option<RenderData>,
    content: ContentFn,
    fallback: Option<FallbackFn>,
    /// Scope of whatever is currently rendered between the markers.
    scope: Cell<Option<ScopeId>>,
    /// Set once the first render is done; errors before that are collected.
    armed: Cell<bool>,
    showing_fallback: Cell<bool>,
    errors: RefCell<Vec<CaughtError>>,
}

impl Boundary {
    fn open_scope(self: &Rc<Self>, catch: bool) -> ScopeId {
        let scope = match self.owner {
            Some(owner) => reactive::create_child(owner),
            None => reactive::create_root(),
        };
        if catch && self.fallback.is_some() {
            let boundary = Rc::clone(self);
            reactive::set_error_handler(scope, move |err| boundary.catch(err));
        }
        self.scope.set(Some(scope));
        scope
    }

    fn catch(self: &Rc<Self>, error: CaughtError) {
        if !self.armed.get() {
            self.errors.borrow_mut().push(error);
            return;
        }
        let boundary = Rc::clone(self);
        Runtime::defer(move || boundary.show_fallback(&error));
    }

    fn render(
        &self,
        scope: ScopeId,
        mode: CursorMode,
        unresolved: Rc<Cell<bool>>,
        draw: impl FnOnce(&mut Cursor),
    ) {
        let _scope = ScopeGuard::enter(scope);
        let _data = self.data.as_ref().map(RenderData::enter);
        let next = match mode {
            CursorMode::Hydrate => self.doc.borrow().next_sibling(self.open),
            CursorMode::Create => None,
        };
        let frame = Frame {
            parent: self.parent,
            next,
            end: Some(self.close),
            mode,
        };
        let mut cursor =
            Cursor::with_frame(self.doc.clone(), Rc::clone(&self.report), unresolved, frame);
        draw(&mut cursor);
        cursor.finish();
    }

    /// Remove everything between the markers.
    fn clear(&self) -> usize {
        let mut dom = self.doc.borrow_mut();
        let mut removed = 0;
        while let Some(next) = dom.next_sibling(self.open) {
            if next == self.close {
                break;
            }
            dom.remove(next);
            removed += 1;
        }
        removed
    }

    fn mount(self: &Rc<Self>, mode: CursorMode) {
        let scope = self.open_scope(true);
        let unresolved = Rc::new(Cell::new(false));
        self.render(scope, mode, Rc::clone(&unresolved), |c| (self.content)(c));

        if mode == CursorMode::Hydrate && unresolved.get() {
            tracing::warn!(
                open = %self.open,
                "boundary content did not hydrate; rendering it on the client"
            );
            reactive::dispose_scope(scope);
            self.errors.borrow_mut().clear();
            let removed = self.clear();
            {
                let mut report = self.report.borrow_mut();
                report.fallbacks += 1;
                report.discarded += removed;
            }
            let scope = self.open_scope(true);
            self.render(scope, CursorMode::Create, Rc::default(), |c| {
                (self.content)(c)
            });
        }

        self.armed.set(true);
        let first_error = self.errors.borrow_mut().drain(..).next();
        if let Some(error) = first_error {
            self.show_fallback(&error);
        }
    }

    fn show_fallback(self: &Rc<Self>, error: &CaughtError) {
        let Some(fallback) = &self.fallback else {
            return;
        };
        let Some(current) = self.scope.get() else {
            return;
        };
        if self.showing_fallback.get() || reactive::is_disposed(current) {
            tracing::debug!(%error, "boundary already showing its fallback or gone");
            return;
        }

        tracing::debug!(%error, "error boundary rendering its fallback");
        self.showing_fallback.set(true);
        reactive::dispose_scope(current);
        self.clear();
        let scope = self.open_scope(false);
        self.render(scope, CursorMode::Create, Rc::default(), |c| fallback(c, error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::HYDRATION_KEY_ATTR;
    use crate::reactive::{dispose_scope, push_scope, Signal};
    use std::fmt;

    fn counter(cursor: &mut Cursor, count: &Signal<i32>) -> DomId {
        let button = cursor.element("button", &[("class", "counter")]);
        cursor.enter_children();
        let c = count.clone();
        cursor.dyn_text(move || c.get().to_string());
        cursor.exit_children();
        button
    }

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn create_mode_builds_markup() {
        let doc = Document::new();
        let count = Signal::new(3);
        let _scope = push_scope();

        let mut cursor = Cursor::create(doc.clone(), doc.root());
        counter(&mut cursor, &count);
        cursor.finish();

        assert_eq!(
            doc.inner_html(doc.root()),
            r#"<button data-lk class="counter">3</button>"#
        );
        assert_eq!(cursor.report().created, 2);

        count.set(4);
        assert_eq!(
            doc.inner_html(doc.root()),
            r#"<button data-lk class="counter">4</button>"#
        );
    }

    #[test]
    fn exact_markup_is_claimed_without_creating() {
        let doc = Document::parse(r#"<button data-lk class="counter">3</button>"#).unwrap();
        let count = Signal::new(3);
        let _scope = push_scope();

        let mut cursor = Cursor::hydrate(doc.clone(), doc.root());
        let button = counter(&mut cursor, &count);
        cursor.finish();

        let report = cursor.report();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.created, 0);
        assert!(report.is_exact());
        assert!(!cursor.unresolved());
        assert_eq!(doc.borrow().created(), 0);
        assert_eq!(doc.borrow().tag(button), Some("button"));

        count.set(9);
        assert_eq!(doc.borrow().text_content(button), "9");
    }

    #[test]
    fn differing_attributes_are_patched() {
        let doc = Document::parse(r#"<button data-lk class="stale">3</button>"#).unwrap();
        let count = Signal::new(3);
        let _scope = push_scope();

        let mut cursor = Cursor::hydrate(doc.clone(), doc.root());
        let button = counter(&mut cursor, &count);
        cursor.finish();

        assert_eq!(doc.borrow().attr(button, "class"), Some("counter"));
        assert!(cursor.report().mismatches.is_empty());
    }

    #[test]
    fn incompatible_node_is_replaced_locally() {
        let doc = Document::parse(r#"<div data-lk><span data-lk>x</span></div>"#).unwrap();
        let _scope = push_scope();

        let mut cursor = Cursor::hydrate(doc.clone(), doc.root());
        cursor.element("div", &[]);
        cursor.enter_children();
        cursor.element("p", &[]);
        cursor.enter_children();
        cursor.static_text("y");
        cursor.exit_children();
        cursor.exit_children();
        cursor.finish();

        assert_eq!(doc.inner_html(doc.root()), "<div data-lk><p data-lk>y</p></div>");
        let report = cursor.report();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].resolution, Resolution::Replaced);
        assert!(!cursor.unresolved());
    }

    #[test]
    fn foreign_nodes_are_skipped() {
        let doc =
            Document::parse(r#"<div class="ad">x</div><!-- note --><p data-lk>hi</p>"#).unwrap();
        let _scope = push_scope();

        let mut cursor = Cursor::hydrate(doc.clone(), doc.root());
        cursor.element("p", &[]);
        cursor.enter_children();
        cursor.static_text("hi");
        cursor.exit_children();
        cursor.finish();

        let report = cursor.report();
        assert_eq!(report.skipped_foreign, 2);
        assert_eq!(report.claimed, 2);
        assert!(report.is_exact());
        assert!(doc.inner_html(doc.root()).starts_with(r#"<div class="ad">x</div>"#));
    }

    #[test]
    fn leftover_nodes_escalate() {
        let doc = Document::parse(r#"<p data-lk>a</p><p data-lk>b</p>"#).unwrap();
        let _scope = push_scope();

        let mut cursor = Cursor::hydrate(doc.clone(), doc.root());
        cursor.element("p", &[]);
        cursor.enter_children();
        cursor.static_text("a");
        cursor.exit_children();
        cursor.finish();

        assert!(cursor.unresolved());
        let report = cursor.report();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].resolution, Resolution::Escalated);
    }

    #[test]
    fn boundary_absorbs_escalation() {
        let doc = Document::parse(
            r#"<h1 data-lk>title</h1><!--[--><l-region><ul data-lk></ul></l-region><!--]-->"#,
        )
        .unwrap();
        let _scope = push_scope();

        let mut cursor = Cursor::hydrate(doc.clone(), doc.root());
        let title = cursor.element("h1", &[]);
        cursor.enter_children();
        cursor.static_text("title");
        cursor.exit_children();
        cursor.boundary(|c| {
            c.element("ol", &[]);
        });
        cursor.finish();

        assert!(!cursor.unresolved());
        let report = cursor.report();
        assert_eq!(report.fallbacks, 1);
        assert_eq!(
            doc.inner_html(doc.root()),
            "<h1 data-lk>title</h1><!--[--><ol data-lk></ol><!--]-->"
        );
        // The heading outside the boundary stayed claimed
        assert_eq!(doc.borrow().first_child(doc.root()), Some(title));
    }

    #[test]
    fn region_rerenders_when_its_inputs_change() {
        let doc = Document::parse(r#"<l-region><b data-lk>on</b></l-region>"#).unwrap();
        let flag = Signal::new(true);
        let _scope = push_scope();

        let mut cursor = Cursor::hydrate(doc.clone(), doc.root());
        let f = flag.clone();
        cursor.region(move |c| {
            let tag = if f.get() { "b" } else { "i" };
            let label = if f.get() { "on" } else { "off" };
            c.element(tag, &[]);
            c.enter_children();
            c.static_text(label);
            c.exit_children();
        });
        cursor.finish();
        assert!(cursor.report().is_exact());

        flag.set(false);
        assert_eq!(
            doc.inner_html(doc.root()),
            "<l-region><i data-lk>off</i></l-region>"
        );
    }

    #[test]
    fn insert_discards_server_children() {
        let doc = Document::parse(r#"<l-insert><li data-lk>old</li></l-insert>"#).unwrap();
        let items = Signal::new(vec!["a".to_string()]);
        let _scope = push_scope();

        let mut cursor = Cursor::hydrate(doc.clone(), doc.root());
        let i = items.clone();
        cursor.insert(move || {
            i.get()
                .into_iter()
                .map(|item| Fragment::element("li").text(item).into())
                .collect()
        });
        cursor.finish();

        assert_eq!(cursor.report().discarded, 1);
        assert_eq!(
            doc.inner_html(doc.root()),
            "<l-insert><li data-lk>a</li></l-insert>"
        );

        items.update(|v| v.push("b".to_string()));
        assert_eq!(
            doc.inner_html(doc.root()),
            "<l-insert><li data-lk>a</li><li data-lk>b</li></l-insert>"
        );
    }

    #[test]
    fn listeners_are_removed_with_their_scope() {
        let doc = Document::new();
        let clicks = Signal::new(0);
        let scope = push_scope();

        let mut cursor = Cursor::create(doc.clone(), doc.root());
        let button = cursor.element("button", &[]);
        let c = clicks.clone();
        cursor
            .on(button, "click", move |_| c.update(|n| *n += 1))
            .unwrap();
        cursor.finish();

        assert_eq!(doc.dispatch(button, "click"), 1);
        assert_eq!(clicks.get(), 1);

        dispose_scope(scope.pop());
        assert_eq!(doc.borrow().listener_count(button), 0);
        assert_eq!(doc.dispatch(button, "click"), 0);
    }

    #[test]
    fn on_without_scope_is_an_error() {
        let doc = Document::new();
        let mut cursor = Cursor::create(doc.clone(), doc.root());
        let button = cursor.element("button", &[]);

        assert!(cursor.on(button, "click", |_| {}).is_err());
        assert_eq!(doc.borrow().listener_count(button), 0);
    }

    #[test]
    fn error_boundary_shows_fallback_for_errors_during_render() {
        let doc = Document::new();
        let _scope = push_scope();

        let mut cursor = Cursor::create(doc.clone(), doc.root());
        cursor.error_boundary(
            |c, err| {
                c.element("p", &[("class", "error")]);
                c.enter_children();
                c.static_text(&err.to_string());
                c.exit_children();
            },
            |c| {
                c.element("ul", &[]);
                Effect::new_fallible(|| Err(Boom.into()));
            },
        );
        cursor.finish();

        assert_eq!(
            doc.inner_html(doc.root()),
            r#"<!--[--><p data-lk class="error">boom</p><!--]-->"#
        );
    }

    #[test]
    fn error_boundary_catches_later_effect_errors() {
        let doc = Document::new();
        let fail = Signal::new(false);
        let _scope = push_scope();

        let mut cursor = Cursor::create(doc.clone(), doc.root());
        let f = fail.clone();
        cursor.error_boundary(
            |c, _| {
                c.static_text("failed");
            },
            move |c| {
                c.static_text("ok");
                let f = f.clone();
                Effect::new_fallible(move || if f.get() { Err(Boom.into()) } else { Ok(()) });
            },
        );
        cursor.finish();
        assert_eq!(doc.inner_html(doc.root()), "<!--[-->ok<!--]-->");

        fail.set(true);
        assert_eq!(doc.inner_html(doc.root()), "<!--[-->failed<!--]-->");
    }

    #[test]
    fn bound_attributes_follow_their_signal() {
        let doc = Document::parse(r#"<a data-lk href="/old">x</a>"#).unwrap();
        let href = Signal::new(Some("/home".to_string()));
        let _scope = push_scope();

        let mut cursor = Cursor::hydrate(doc.clone(), doc.root());
        assert!(cursor.is_hydrating());
        let link = cursor.element("a", &[]);
        let h = href.clone();
        cursor.bind_attr(link, "href", move || h.get());
        cursor.enter_children();
        cursor.static_text("x");
        cursor.exit_children();
        cursor.finish();

        assert_eq!(doc.borrow().attr(link, "href"), Some("/home"));

        href.set(None);
        assert_eq!(doc.borrow().attr(link, "href"), None);
    }

    #[test]
    fn runtime_elements_carry_the_hydration_key() {
        let doc = Document::new();
        let mut cursor = Cursor::create(doc.clone(), doc.root());
        let el = cursor.element("div", &[]);
        assert_eq!(doc.borrow().attr(el, HYDRATION_KEY_ATTR), Some(""));
    }
}
