//! Markup serialization and parsing.
//!
//! The serializer writes just enough structure for the parser to rebuild an
//! identical tree:
//!
//! - empty text nodes become `<!--t-->` (they would otherwise vanish),
//! - adjacent text nodes are separated by `<!---->` (they would otherwise
//!   merge),
//! - fragment boundaries become `<!--[-->` and `<!--]-->`.
//!
//! The parser is tolerant: unknown closing tags are ignored and unclosed
//! elements are closed at the end of input.

use super::{Attrs, BoundaryEdge, Dom, DomId, DomNodeKind, WrapperKind};
use crate::error::ParseError;

const EMPTY_TEXT_MARKER: &str = "t";
const OPEN_MARKER: &str = "[";
const CLOSE_MARKER: &str = "]";

fn is_void(tag: &str) -> bool {
    matches!(
        tag,
        "area"
            | "base" | "br"
            | "col" | "embed"
            | "hr" | "img"
            | "input" | "link"
            | "meta" | "source"
            | "track" | "wbr"
    )
}

fn is_raw_text(tag: &str) -> bool {
    matches!(tag, "script" | "style")
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", "\u{a0}")
        .replace("&amp;", "&")
}

pub(super) fn serialize_children(dom: &Dom, id: DomId) -> String {
    let mut out = String::new();
    write_children(dom, id, &mut out);
    out
}

pub(super) fn serialize_node(dom: &Dom, id: DomId) -> String {
    let mut out = String::new();
    write_node(dom, id, &mut out);
    out
}

fn write_children(dom: &Dom, id: DomId, out: &mut String) {
    let raw = dom.tag(id).is_some_and(is_raw_text);
    let mut previous_text = false;
    for child in dom.children(id) {
        let is_text = matches!(dom.kind(*child), DomNodeKind::Text(_));
        if raw {
            if let Some(text) = dom.text(*child) {
                out.push_str(text);
            }
            continue;
        }
        if is_text && previous_text {
            out.push_str("<!---->");
        }
        write_node(dom, *child, out);
        previous_text = is_text;
    }
}

fn write_attrs(attrs: &Attrs, out: &mut String) {
    for (name, value) in attrs {
        out.push(' ');
        out.push_str(name);
        if !value.is_empty() {
            out.push_str("=\"");
            out.push_str(&escape_attr(value));
            out.push('"');
        }
    }
}

fn write_node(dom: &Dom, id: DomId, out: &mut String) {
    match dom.kind(id) {
        DomNodeKind::Text(text) if text.is_empty() => {
            out.push_str("<!--");
            out.push_str(EMPTY_TEXT_MARKER);
            out.push_str("-->");
        }
        DomNodeKind::Text(text) => out.push_str(&escape_text(text)),
        DomNodeKind::Comment(text) => {
            out.push_str("<!--");
            out.push_str(text);
            out.push_str("-->");
        }
        DomNodeKind::Boundary(edge) => {
            out.push_str("<!--");
            out.push_str(match edge {
                BoundaryEdge::Open => OPEN_MARKER,
                BoundaryEdge::Close => CLOSE_MARKER,
            });
            out.push_str("-->");
        }
        DomNodeKind::Element { tag, attrs } => {
            out.push('<');
            out.push_str(tag);
            write_attrs(attrs, out);
            if is_void(tag) {
                out.push_str(" />");
                return;
            }
            out.push('>');
            write_children(dom, id, out);
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        DomNodeKind::Wrapper { kind, attrs } => {
            out.push('<');
            out.push_str(kind.tag());
            write_attrs(attrs, out);
            out.push('>');
            write_children(dom, id, out);
            out.push_str("</");
            out.push_str(kind.tag());
            out.push('>');
        }
    }
}

/// Parse `markup` and append the resulting nodes to `parent`.
pub(super) fn parse_into(dom: &mut Dom, parent: DomId, markup: &str) -> Result<(), ParseError> {
    Parser {
        input: markup,
        pos: 0,
        dom,
        stack: vec![(parent, String::new())],
        merge_text: false,
    }
    .run()
}

struct Parser<'a, 'd> {
    input: &'a str,
    pos: usize,
    dom: &'d mut Dom,
    /// Open elements: node and tag name. The bottom entry is the target.
    stack: Vec<(DomId, String)>,
    /// Whether the next text run continues the previous text node.
    merge_text: bool,
}

impl<'a> Parser<'a, '_> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn current(&self) -> DomId {
        self.stack.last().map(|(id, _)| *id).unwrap_or_else(|| self.dom.root())
    }

    fn append(&mut self, kind: DomNodeKind) -> DomId {
        self.merge_text = false;
        let id = self.dom.create(kind);
        let parent = self.current();
        self.dom.append_child(parent, id);
        id
    }

    fn run(mut self) -> Result<(), ParseError> {
        while self.pos < self.input.len() {
            let rest = self.rest();
            if rest.starts_with("<!--") {
                self.comment()?;
            } else if rest.starts_with("</") {
                self.close_tag()?;
            } else if rest.starts_with("<!") || rest.starts_with("<?") {
                // Doctype and processing instructions carry no nodes
                let end = rest
                    .find('>')
                    .ok_or_else(|| ParseError::new(self.pos, "unterminated declaration"))?;
                self.pos += end + 1;
            } else if rest.starts_with('<')
                && rest[1..].starts_with(|c: char| c.is_ascii_alphabetic())
            {
                self.open_tag()?;
            } else {
                self.text();
            }
        }
        Ok(())
    }

    fn comment(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        let body_start = self.pos + 4;
        let end = self.input[body_start..]
            .find("-->")
            .ok_or_else(|| ParseError::new(start, "unterminated comment"))?;
        let body = &self.input[body_start..body_start + end];
        self.pos = body_start + end + 3;

        match body {
            "" => self.merge_text = false,
            EMPTY_TEXT_MARKER => {
                self.append(DomNodeKind::Text(String::new()));
            }
            OPEN_MARKER => {
                self.append(DomNodeKind::Boundary(BoundaryEdge::Open));
            }
            CLOSE_MARKER => {
                self.append(DomNodeKind::Boundary(BoundaryEdge::Close));
            }
            other => {
                let other = other.to_string();
                self.append(DomNodeKind::Comment(other));
            }
        }
        Ok(())
    }

    fn text(&mut self) {
        let rest = self.rest();
        // A lone '<' that does not start a tag is text
        let skip = usize::from(rest.starts_with('<'));
        let len = rest[skip..].find('<').map_or(rest.len(), |i| i + skip);
        let text = unescape(&rest[..len]);
        self.pos += len;

        let parent = self.current();
        if self.merge_text {
            if let Some(last) = self.dom.children(parent).last().copied() {
                if let DomNodeKind::Text(existing) = self.dom.kind(last) {
                    let merged = format!("{existing}{text}");
                    self.dom.set_text(last, merged);
                    return;
                }
            }
        }
        self.append(DomNodeKind::Text(text));
        self.merge_text = true;
    }

    fn close_tag(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        let end = self
            .rest()
            .find('>')
            .ok_or_else(|| ParseError::new(start, "unterminated closing tag"))?;
        let name = self.rest()[2..end].trim().to_ascii_lowercase();
        self.pos += end + 1;

        // Pop to the matching element, never past the target
        if let Some(depth) = self.stack.iter().skip(1).rposition(|(_, tag)| *tag == name) {
            self.stack.truncate(depth + 1);
        }
        Ok(())
    }

    fn open_tag(&mut self) -> Result<(), ParseError> {
        let start = self.pos;
        self.pos += 1;
        let name_len = self
            .rest()
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .ok_or_else(|| ParseError::new(start, "unterminated tag"))?;
        let tag = self.rest()[..name_len].to_ascii_lowercase();
        self.pos += name_len;

        let mut attrs = Attrs::new();
        let self_closing = loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.is_empty() {
                return Err(ParseError::new(start, format!("unterminated <{tag}> tag")));
            }
            if rest.starts_with("/>") {
                self.pos += 2;
                break true;
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break false;
            }
            let (name, value) = self.attribute(start)?;
            if !name.is_empty() {
                attrs.insert(name, value);
            }
        };

        let kind = match WrapperKind::from_tag(&tag) {
            Some(kind) => DomNodeKind::Wrapper { kind, attrs },
            None => DomNodeKind::Element {
                tag: tag.clone(),
                attrs,
            },
        };
        let id = self.append(kind);

        if self_closing || is_void(&tag) {
            return Ok(());
        }

        if is_raw_text(&tag) {
            let close = format!("</{tag}");
            let len = self
                .rest()
                .to_ascii_lowercase()
                .find(&close)
                .ok_or_else(|| ParseError::new(start, format!("unterminated <{tag}> element")))?;
            if len > 0 {
                let text = self.rest()[..len].to_string();
                let text_id = self.dom.create(DomNodeKind::Text(text));
                self.dom.append_child(id, text_id);
            }
            self.pos += len;
            return self.close_tag();
        }

        self.stack.push((id, tag));
        Ok(())
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().len() - self.rest().trim_start().len();
        self.pos += trimmed;
    }

    fn attribute(&mut self, tag_start: usize) -> Result<(String, String), ParseError> {
        let name_len = self
            .rest()
            .find(|c: char| c.is_whitespace() || c == '=' || c == '>' || c == '/')
            .unwrap_or(self.rest().len());
        if name_len == 0 {
            // Stray '/' inside a tag
            self.pos += 1;
            return Ok((String::new(), String::new()));
        }
        let name = self.rest()[..name_len].to_ascii_lowercase();
        self.pos += name_len;
        self.skip_whitespace();

        if !self.rest().starts_with('=') {
            return Ok((name, String::new()));
        }
        self.pos += 1;
        self.skip_whitespace();

        let rest = self.rest();
        let value = match rest.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let end = rest[1..].find(quote).ok_or_else(|| {
                    ParseError::new(tag_start, format!("unterminated value for attribute {name}"))
                })?;
                let value = unescape(&rest[1..1 + end]);
                self.pos += end + 2;
                value
            }
            _ => {
                let end = rest
                    .find(|c: char| c.is_whitespace() || c == '>')
                    .unwrap_or(rest.len());
                let value = unescape(&rest[..end]);
                self.pos += end;
                value
            }
        };
        Ok((name, value))
    }
}
