//! In-memory Document Model
//!
//! The runtime renders into a small arena-backed document instead of a
//! browser DOM. The same model serves both sides of the handshake: the
//! server renders into it and serializes the result, and the client parses
//! that markup back and hydrates it.
//!
//! # Node kinds
//!
//! The set of node kinds is closed so the hydration cursor can match on it
//! exhaustively:
//!
//! - `Element`: an ordinary element. Elements created by the runtime carry
//!   the [`HYDRATION_KEY_ATTR`] attribute; elements without it are treated as
//!   foreign (injected by something else) and skipped during hydration.
//! - `Text`
//! - `Wrapper`: a reactive region or reactive insert, serialized as an
//!   `l-region` / `l-insert` element.
//! - `Boundary`: the open or close marker of a fragment boundary, serialized
//!   as `<!--[-->` / `<!--]-->`.
//! - `Comment`: any other comment. Always foreign.

mod fragment;
mod html;

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::ParseError;

pub use fragment::{ElementFragment, Fragment};

/// Attribute marking elements rendered by the runtime.
pub const HYDRATION_KEY_ATTR: &str = "data-lk";

/// Tag of a cursor-aware reactive region wrapper.
pub const REGION_TAG: &str = "l-region";

/// Tag of an opaque reactive insert wrapper.
pub const INSERT_TAG: &str = "l-insert";

/// Index of a node in a [`Dom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomId(usize);

impl fmt::Display for DomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a registered event listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperKind {
    Region,
    Insert,
}

impl WrapperKind {
    pub fn tag(self) -> &'static str {
        match self {
            WrapperKind::Region => REGION_TAG,
            WrapperKind::Insert => INSERT_TAG,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            REGION_TAG => Some(WrapperKind::Region),
            INSERT_TAG => Some(WrapperKind::Insert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundaryEdge {
    Open,
    Close,
}

pub type Attrs = IndexMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomNodeKind {
    Element { tag: String, attrs: Attrs },
    Text(String),
    Wrapper { kind: WrapperKind, attrs: Attrs },
    Boundary(BoundaryEdge),
    Comment(String),
}

impl DomNodeKind {
    /// Whether hydration should step over this node without claiming it.
    pub fn is_foreign(&self) -> bool {
        match self {
            DomNodeKind::Element { attrs, .. } => !attrs.contains_key(HYDRATION_KEY_ATTR),
            DomNodeKind::Comment(_) => true,
            DomNodeKind::Text(_) | DomNodeKind::Wrapper { .. } | DomNodeKind::Boundary(_) => false,
        }
    }

    /// Short human-readable description used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            DomNodeKind::Element { tag, .. } => format!("<{tag}>"),
            DomNodeKind::Text(text) => format!("text {text:?}"),
            DomNodeKind::Wrapper { kind, .. } => format!("<{}>", kind.tag()),
            DomNodeKind::Boundary(BoundaryEdge::Open) => "boundary open".to_string(),
            DomNodeKind::Boundary(BoundaryEdge::Close) => "boundary close".to_string(),
            DomNodeKind::Comment(_) => "comment".to_string(),
        }
    }
}

/// Event passed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub target: DomId,
}

pub type Listener = Rc<dyn Fn(&Event)>;

struct DomNode {
    kind: DomNodeKind,
    parent: Option<DomId>,
    children: Vec<DomId>,
    listeners: Vec<(ListenerId, String, Listener)>,
}

/// Arena of nodes with a single root container.
pub struct Dom {
    nodes: Vec<DomNode>,
    root: DomId,
    created: usize,
    next_listener: u64,
}

impl Default for Dom {
    fn default() -> Self {
        Self::new()
    }
}

impl Dom {
    pub fn new() -> Self {
        let root = DomNode {
            kind: DomNodeKind::Element {
                tag: "body".to_string(),
                attrs: Attrs::new(),
            },
            parent: None,
            children: Vec::new(),
            listeners: Vec::new(),
        };
        Self {
            nodes: vec![root],
            root: DomId(0),
            created: 0,
            next_listener: 0,
        }
    }

    pub fn root(&self) -> DomId {
        self.root
    }

    fn node(&self, id: DomId) -> &DomNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: DomId) -> &mut DomNode {
        &mut self.nodes[id.0]
    }

    /// Create a detached node.
    pub fn create(&mut self, kind: DomNodeKind) -> DomId {
        let id = DomId(self.nodes.len());
        self.nodes.push(DomNode {
            kind,
            parent: None,
            children: Vec::new(),
            listeners: Vec::new(),
        });
        self.created += 1;
        id
    }

    /// Create an element owned by the runtime (carries the hydration key).
    pub fn create_element(&mut self, tag: &str) -> DomId {
        let mut attrs = Attrs::new();
        attrs.insert(HYDRATION_KEY_ATTR.to_string(), String::new());
        self.create(DomNodeKind::Element {
            tag: tag.to_string(),
            attrs,
        })
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> DomId {
        self.create(DomNodeKind::Text(text.into()))
    }

    pub fn create_wrapper(&mut self, kind: WrapperKind) -> DomId {
        self.create(DomNodeKind::Wrapper {
            kind,
            attrs: Attrs::new(),
        })
    }

    pub fn create_boundary(&mut self, edge: BoundaryEdge) -> DomId {
        self.create(DomNodeKind::Boundary(edge))
    }

    /// Number of nodes created since construction or the last reset.
    pub fn created(&self) -> usize {
        self.created
    }

    pub fn reset_created(&mut self) {
        self.created = 0;
    }

    fn detach(&mut self, id: DomId) {
        if let Some(parent) = self.node_mut(id).parent.take() {
            self.node_mut(parent).children.retain(|c| *c != id);
        }
    }

    pub fn append_child(&mut self, parent: DomId, child: DomId) {
        self.insert_before(parent, child, None);
    }

    /// Insert `child` under `parent` before `anchor`, or at the end when the
    /// anchor is `None` or not a child of `parent`.
    pub fn insert_before(&mut self, parent: DomId, child: DomId, anchor: Option<DomId>) {
        self.detach(child);
        let children = &mut self.nodes[parent.0].children;
        let pos = anchor
            .and_then(|a| children.iter().position(|c| *c == a))
            .unwrap_or(children.len());
        children.insert(pos, child);
        self.node_mut(child).parent = Some(parent);
    }

    /// Detach `id` from its parent and drop every listener in its subtree.
    pub fn remove(&mut self, id: DomId) {
        self.detach(id);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node_mut(current);
            node.listeners.clear();
            stack.extend(node.children.iter().copied());
        }
    }

    /// Remove every child of `id`. Returns how many were removed.
    pub fn clear_children(&mut self, id: DomId) -> usize {
        let children = self.node(id).children.clone();
        for child in &children {
            self.remove(*child);
        }
        children.len()
    }

    pub fn parent(&self, id: DomId) -> Option<DomId> {
        self.node(id).parent
    }

    pub fn children(&self, id: DomId) -> &[DomId] {
        &self.node(id).children
    }

    pub fn first_child(&self, id: DomId) -> Option<DomId> {
        self.node(id).children.first().copied()
    }

    pub fn next_sibling(&self, id: DomId) -> Option<DomId> {
        let parent = self.node(id).parent?;
        let siblings = &self.node(parent).children;
        let pos = siblings.iter().position(|c| *c == id)?;
        siblings.get(pos + 1).copied()
    }

    pub fn kind(&self, id: DomId) -> &DomNodeKind {
        &self.node(id).kind
    }

    pub fn tag(&self, id: DomId) -> Option<&str> {
        match &self.node(id).kind {
            DomNodeKind::Element { tag, .. } => Some(tag),
            DomNodeKind::Wrapper { kind, .. } => Some(kind.tag()),
            _ => None,
        }
    }

    fn attrs_mut(&mut self, id: DomId) -> Option<&mut Attrs> {
        match &mut self.node_mut(id).kind {
            DomNodeKind::Element { attrs, .. } | DomNodeKind::Wrapper { attrs, .. } => Some(attrs),
            _ => None,
        }
    }

    pub fn attr(&self, id: DomId, name: &str) -> Option<&str> {
        match &self.node(id).kind {
            DomNodeKind::Element { attrs, .. } | DomNodeKind::Wrapper { attrs, .. } => {
                attrs.get(name).map(String::as_str)
            }
            _ => None,
        }
    }

    pub fn set_attr(&mut self, id: DomId, name: &str, value: impl Into<String>) {
        if let Some(attrs) = self.attrs_mut(id) {
            attrs.insert(name.to_string(), value.into());
        }
    }

    pub fn remove_attr(&mut self, id: DomId, name: &str) {
        if let Some(attrs) = self.attrs_mut(id) {
            attrs.shift_remove(name);
        }
    }

    pub fn text(&self, id: DomId) -> Option<&str> {
        match &self.node(id).kind {
            DomNodeKind::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn set_text(&mut self, id: DomId, text: impl Into<String>) {
        if let DomNodeKind::Text(current) = &mut self.node_mut(id).kind {
            *current = text.into();
        }
    }

    pub fn add_listener(&mut self, id: DomId, event: &str, listener: Listener) -> ListenerId {
        let listener_id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.node_mut(id)
            .listeners
            .push((listener_id, event.to_string(), listener));
        listener_id
    }

    pub fn remove_listener(&mut self, id: DomId, listener: ListenerId) {
        self.node_mut(id).listeners.retain(|(l, _, _)| *l != listener);
    }

    pub fn listener_count(&self, id: DomId) -> usize {
        self.node(id).listeners.len()
    }

    fn listeners_for(&self, id: DomId, event: &str) -> Vec<Listener> {
        self.node(id)
            .listeners
            .iter()
            .filter(|(_, name, _)| name == event)
            .map(|(_, _, listener)| Rc::clone(listener))
            .collect()
    }

    /// Build a fragment into detached nodes and return the top node.
    pub fn build(&mut self, fragment: &Fragment) -> DomId {
        match fragment {
            Fragment::Text(text) => self.create_text(text.clone()),
            Fragment::Element(el) => {
                let id = self.create_element(el.tag_name());
                for (name, value) in el.attrs() {
                    self.set_attr(id, name, value.clone());
                }
                for child in el.child_fragments() {
                    let child_id = self.build(child);
                    self.append_child(id, child_id);
                }
                id
            }
        }
    }

    /// Concatenated text of the subtree.
    pub fn text_content(&self, id: DomId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: DomId, out: &mut String) {
        match &self.node(id).kind {
            DomNodeKind::Text(text) => out.push_str(text),
            _ => {
                for child in &self.node(id).children {
                    self.collect_text(*child, out);
                }
            }
        }
    }

    /// Elements with the given tag under `id`, in document order.
    pub fn find_all(&self, id: DomId, tag: &str) -> Vec<DomId> {
        let mut found = Vec::new();
        let mut stack: Vec<DomId> = self.node(id).children.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            if self.tag(current) == Some(tag) {
                found.push(current);
            }
            stack.extend(self.node(current).children.iter().rev().copied());
        }
        found
    }

    pub fn find_first(&self, id: DomId, tag: &str) -> Option<DomId> {
        self.find_all(id, tag).into_iter().next()
    }

    /// Serialize the children of `id`.
    pub fn inner_html(&self, id: DomId) -> String {
        html::serialize_children(self, id)
    }

    /// Serialize `id` itself.
    pub fn outer_html(&self, id: DomId) -> String {
        html::serialize_node(self, id)
    }
}

/// Shared handle to a [`Dom`].
///
/// Bindings hold clones of this handle; dispatching clones the matching
/// listeners out before calling them so listeners may mutate the document.
#[derive(Clone, Default)]
pub struct Document(Rc<RefCell<Dom>>);

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse markup into the children of a new document's root.
    ///
    /// The creation counter starts at zero afterwards.
    pub fn parse(markup: &str) -> Result<Self, ParseError> {
        let doc = Self::new();
        {
            let mut dom = doc.borrow_mut();
            let root = dom.root();
            html::parse_into(&mut dom, root, markup)?;
            dom.reset_created();
        }
        Ok(doc)
    }

    /// Replace the children of `id` with parsed markup.
    pub fn set_inner_html(&self, id: DomId, markup: &str) -> Result<(), ParseError> {
        let mut dom = self.borrow_mut();
        dom.clear_children(id);
        html::parse_into(&mut dom, id, markup)
    }

    pub fn root(&self) -> DomId {
        self.0.borrow().root()
    }

    pub fn borrow(&self) -> Ref<'_, Dom> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Dom> {
        self.0.borrow_mut()
    }

    pub fn inner_html(&self, id: DomId) -> String {
        self.borrow().inner_html(id)
    }

    /// Call every `event` listener registered on `target`. Returns how many
    /// ran.
    pub fn dispatch(&self, target: DomId, event: &str) -> usize {
        let listeners = self.borrow().listeners_for(target, event);
        let payload = Event {
            name: event.to_string(),
            target,
        };
        for listener in &listeners {
            listener(&payload);
        }
        listeners.len()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(dom) => f
                .debug_struct("Document")
                .field("nodes", &dom.nodes.len())
                .field("html", &dom.inner_html(dom.root()))
                .finish(),
            Err(_) => f.write_str("Document { <borrowed> }"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_before_and_siblings() {
        let mut dom = Dom::new();
        let root = dom.root();
        let a = dom.create_element("a");
        let c = dom.create_element("c");
        dom.append_child(root, a);
        dom.append_child(root, c);
        let b = dom.create_element("b");
        dom.insert_before(root, b, Some(c));

        assert_eq!(dom.children(root), &[a, b, c]);
        assert_eq!(dom.next_sibling(a), Some(b));
        assert_eq!(dom.next_sibling(c), None);
        assert_eq!(dom.created(), 3);
    }

    #[test]
    fn runtime_elements_are_not_foreign() {
        let mut dom = Dom::new();
        let owned = dom.create_element("div");
        let injected = dom.create(DomNodeKind::Element {
            tag: "div".into(),
            attrs: Attrs::new(),
        });

        assert!(!dom.kind(owned).is_foreign());
        assert!(dom.kind(injected).is_foreign());
        assert!(DomNodeKind::Comment("x".into()).is_foreign());
    }

    #[test]
    fn remove_drops_subtree_listeners() {
        let mut dom = Dom::new();
        let root = dom.root();
        let outer = dom.create_element("div");
        let button = dom.create_element("button");
        dom.append_child(root, outer);
        dom.append_child(outer, button);
        dom.add_listener(button, "click", Rc::new(|_| {}));

        assert_eq!(dom.clear_children(root), 1);
        assert_eq!(dom.listener_count(button), 0);
        assert!(dom.parent(outer).is_none());
    }

    #[test]
    fn dispatch_runs_matching_listeners() {
        let doc = Document::new();
        let root = doc.root();
        let button = {
            let mut dom = doc.borrow_mut();
            let b = dom.create_element("button");
            dom.append_child(root, b);
            b
        };

        let clicks = Rc::new(RefCell::new(Vec::new()));
        let c = clicks.clone();
        let d = doc.clone();
        doc.borrow_mut().add_listener(
            button,
            "click",
            Rc::new(move |event: &Event| {
                // Listeners may touch the document
                let text = d.borrow_mut().create_text("clicked");
                d.borrow_mut().append_child(event.target, text);
                c.borrow_mut().push(event.name.clone());
            }),
        );

        assert_eq!(doc.dispatch(button, "click"), 1);
        assert_eq!(doc.dispatch(button, "input"), 0);
        assert_eq!(*clicks.borrow(), vec!["click"]);
        assert_eq!(doc.borrow().text_content(button), "clicked");
    }

    #[test]
    fn build_creates_keyed_elements() {
        let mut dom = Dom::new();
        let frag: Fragment = Fragment::element("p")
            .attr("class", "note")
            .text("hi")
            .into();
        let id = dom.build(&frag);

        assert_eq!(dom.attr(id, "class"), Some("note"));
        assert_eq!(dom.attr(id, HYDRATION_KEY_ATTR), Some(""));
        assert_eq!(dom.text_content(id), "hi");
        assert_eq!(dom.created(), 2);
    }
}
