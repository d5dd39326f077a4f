//! Inert markup trees.
//!
//! A [`Fragment`] describes nodes built without a hydration cursor: static
//! content positioned by [`Cursor::append`](crate::hydration::Cursor::append)
//! and the children of reactive-insert wrappers.

/// A detached tree of elements and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Element(ElementFragment),
    Text(String),
}

/// An element with attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementFragment {
    tag: String,
    attrs: Vec<(String, String)>,
    children: Vec<Fragment>,
}

impl ElementFragment {
    /// Adds an attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    /// Adds a child.
    pub fn child(mut self, child: impl Into<Fragment>) -> Self {
        self.children.push(child.into());
        self
    }

    /// Adds multiple children.
    pub fn children(mut self, children: impl IntoIterator<Item = impl Into<Fragment>>) -> Self {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }

    /// Adds a text child.
    pub fn text(self, content: impl Into<String>) -> Self {
        self.child(Fragment::Text(content.into()))
    }

    pub fn tag_name(&self) -> &str {
        &self.tag
    }

    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }

    pub fn child_fragments(&self) -> &[Fragment] {
        &self.children
    }
}

impl Fragment {
    /// Creates an element fragment.
    pub fn element(tag: impl Into<String>) -> ElementFragment {
        ElementFragment {
            tag: tag.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Creates a text fragment.
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    /// Number of nodes in the tree, this one included.
    pub fn node_count(&self) -> usize {
        match self {
            Fragment::Element(el) => 1 + el.children.iter().map(Fragment::node_count).sum::<usize>(),
            Fragment::Text(_) => 1,
        }
    }
}

impl From<ElementFragment> for Fragment {
    fn from(element: ElementFragment) -> Self {
        Fragment::Element(element)
    }
}

impl From<&str> for Fragment {
    fn from(text: &str) -> Self {
        Fragment::Text(text.to_string())
    }
}

impl From<String> for Fragment {
    fn from(text: String) -> Self {
        Fragment::Text(text)
    }
}
