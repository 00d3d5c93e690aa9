//! Mutable document model for the comment widget's rendered subtree.
//!
//! Markup is parsed with `scraper` and copied into an arena so it can be
//! patched in place. Structural and text edits are reported to at most one
//! observer, the way a browser `MutationObserver` watching a subtree would.

use scraper::{ElementRef, Html};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeData {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    data: NodeData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    ChildList,
    CharacterData,
    Attributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveOptions {
    pub child_list: bool,
    pub character_data: bool,
    pub attributes: bool,
}

impl ObserveOptions {
    pub const CONTENT: ObserveOptions = ObserveOptions {
        child_list: true,
        character_data: true,
        attributes: false,
    };

    fn accepts(&self, kind: MutationKind) -> bool {
        match kind {
            MutationKind::ChildList => self.child_list,
            MutationKind::CharacterData => self.character_data,
            MutationKind::Attributes => self.attributes,
        }
    }
}

struct Observer {
    target: NodeId,
    options: ObserveOptions,
    sink: UnboundedSender<MutationRecord>,
}

pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    observer: Option<Observer>,
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                data: NodeData::Element {
                    tag: "body".to_string(),
                    attrs: Vec::new(),
                },
            }],
            root: NodeId(0),
            observer: None,
        }
    }

    /// Parses an HTML fragment; its top-level nodes become children of
    /// [`Document::root`].
    pub fn parse_fragment(html: &str) -> Self {
        let mut doc = Self::new();
        let fragment = Html::parse_fragment(html);
        let root = doc.root;
        doc.import(root, fragment.root_element());
        doc
    }

    fn import(&mut self, parent: NodeId, source: ElementRef<'_>) {
        for child in source.children() {
            match child.value() {
                scraper::Node::Element(element) => {
                    let attrs = element
                        .attrs()
                        .map(|(name, value)| (name.to_string(), value.to_string()))
                        .collect();
                    let id = self.alloc(NodeData::Element {
                        tag: element.name().to_string(),
                        attrs,
                    });
                    self.link(parent, id, None);
                    if let Some(child_ref) = ElementRef::wrap(child) {
                        self.import(id, child_ref);
                    }
                }
                scraper::Node::Text(text) => {
                    let id = self.alloc(NodeData::Text(String::from(&**text)));
                    self.link(parent, id, None);
                }
                _ => {}
            }
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn alloc(&mut self, data: NodeData) -> NodeId {
        self.nodes.push(Node {
            parent: None,
            children: Vec::new(),
            data,
        });
        NodeId(self.nodes.len() - 1)
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    // ---- observer ----

    /// Starts reporting mutations inside `target`'s subtree, replacing any
    /// previous observer.
    pub fn observe(
        &mut self,
        target: NodeId,
        options: ObserveOptions,
        sink: UnboundedSender<MutationRecord>,
    ) {
        self.observer = Some(Observer {
            target,
            options,
            sink,
        });
    }

    /// Stops reporting. Returns whether an observer was attached.
    pub fn disconnect(&mut self) -> bool {
        self.observer.take().is_some()
    }

    pub fn is_observed(&self) -> bool {
        self.observer.is_some()
    }

    fn record(&mut self, kind: MutationKind, target: NodeId) {
        let Some(observer) = &self.observer else {
            return;
        };
        if !observer.options.accepts(kind) || !self.is_inclusive_ancestor(observer.target, target)
        {
            return;
        }
        if observer.sink.send(MutationRecord { kind, target }).is_err() {
            // Receiver is gone.
            self.observer = None;
        }
    }

    // ---- tree structure ----

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.alloc(NodeData::Element {
            tag: tag.to_string(),
            attrs: Vec::new(),
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.alloc(NodeData::Text(text.to_string()))
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).parent
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.node(node).children
    }

    pub fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        let parent = self.parent(node)?;
        let siblings = &self.node(parent).children;
        let index = siblings.iter().position(|&c| c == node)?;
        siblings.get(index + 1).copied()
    }

    pub fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    pub fn is_attached(&self, node: NodeId) -> bool {
        self.is_inclusive_ancestor(self.root, node)
    }

    fn link(&mut self, parent: NodeId, child: NodeId, index: Option<usize>) {
        self.node_mut(child).parent = Some(parent);
        let children = &mut self.node_mut(parent).children;
        match index {
            Some(i) if i <= children.len() => children.insert(i, child),
            _ => children.push(child),
        }
    }

    pub fn detach(&mut self, node: NodeId) {
        let Some(parent) = self.node(node).parent else {
            return;
        };
        self.node_mut(parent).children.retain(|&c| c != node);
        self.node_mut(node).parent = None;
        self.record(MutationKind::ChildList, parent);
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        if self.is_inclusive_ancestor(child, parent) {
            return;
        }
        self.detach(child);
        self.link(parent, child, None);
        self.record(MutationKind::ChildList, parent);
    }

    /// Moves or inserts `node` directly after `reference`.
    pub fn insert_after(&mut self, reference: NodeId, node: NodeId) {
        if reference == node || self.is_inclusive_ancestor(node, reference) {
            return;
        }
        let Some(parent) = self.parent(reference) else {
            return;
        };
        self.detach(node);
        let index = self
            .children(parent)
            .iter()
            .position(|&c| c == reference)
            .map(|i| i + 1);
        self.link(parent, node, index);
        self.record(MutationKind::ChildList, parent);
    }

    pub fn insert_before(&mut self, reference: NodeId, node: NodeId) {
        if reference == node || self.is_inclusive_ancestor(node, reference) {
            return;
        }
        let Some(parent) = self.parent(reference) else {
            return;
        };
        self.detach(node);
        let index = self.children(parent).iter().position(|&c| c == reference);
        self.link(parent, node, index);
        self.record(MutationKind::ChildList, parent);
    }

    /// Preorder descendants of `node`, excluding `node` itself.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(node).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    // ---- element data ----

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        match &self.node(node).data {
            NodeData::Element { tag, .. } => Some(tag),
            NodeData::Text(_) => None,
        }
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        self.tag(node).is_some()
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.node(node).data {
            NodeData::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            NodeData::Text(_) => None,
        }
    }

    pub fn has_attr(&self, node: NodeId, name: &str) -> bool {
        self.attr(node, name).is_some()
    }

    pub fn set_attr(&mut self, node: NodeId, name: &str, value: &str) {
        let NodeData::Element { attrs, .. } = &mut self.node_mut(node).data else {
            return;
        };
        match attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, existing)) if *existing == value => return,
            Some((_, existing)) => *existing = value.to_string(),
            None => attrs.push((name.to_string(), value.to_string())),
        }
        self.record(MutationKind::Attributes, node);
    }

    pub fn remove_attr(&mut self, node: NodeId, name: &str) {
        let NodeData::Element { attrs, .. } = &mut self.node_mut(node).data else {
            return;
        };
        let before = attrs.len();
        attrs.retain(|(k, _)| k != name);
        if attrs.len() != before {
            self.record(MutationKind::Attributes, node);
        }
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attr(node, "class")
            .map(|classes| classes.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    pub fn add_class(&mut self, node: NodeId, class: &str) {
        if !self.is_element(node) || self.has_class(node, class) {
            return;
        }
        let classes = match self.attr(node, "class") {
            Some(existing) if !existing.trim().is_empty() => format!("{} {}", existing.trim(), class),
            _ => class.to_string(),
        };
        self.set_attr(node, "class", &classes);
    }

    // ---- text ----

    pub fn text(&self, node: NodeId) -> Option<&str> {
        match &self.node(node).data {
            NodeData::Text(text) => Some(text),
            NodeData::Element { .. } => None,
        }
    }

    /// Replaces the data of a text node.
    pub fn set_text(&mut self, node: NodeId, value: &str) {
        let NodeData::Text(text) = &mut self.node_mut(node).data else {
            return;
        };
        if *text == value {
            return;
        }
        *text = value.to_string();
        self.record(MutationKind::CharacterData, node);
    }

    /// Replaces all children of an element with one text node.
    pub fn set_text_content(&mut self, node: NodeId, value: &str) {
        if !self.is_element(node) {
            self.set_text(node, value);
            return;
        }
        for child in self.children(node).to_vec() {
            self.node_mut(child).parent = None;
        }
        self.node_mut(node).children.clear();
        let text = self.create_text(value);
        self.link(node, text, None);
        self.record(MutationKind::ChildList, node);
    }

    pub fn text_content(&self, node: NodeId) -> String {
        if let Some(text) = self.text(node) {
            return text.to_string();
        }
        self.descendants(node)
            .into_iter()
            .filter_map(|id| self.text(id))
            .collect()
    }

    // ---- selection ----

    /// Elements under `scope` (excluding `scope`) matching `selector`, in
    /// document order.
    pub fn select(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.descendants(scope)
            .into_iter()
            .filter(|&id| self.matches(id, selector))
            .collect()
    }

    pub fn select_first(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        self.descendants(scope)
            .into_iter()
            .find(|&id| self.matches(id, selector))
    }

    /// Nearest inclusive ancestor matching `selector`.
    pub fn closest(&self, node: NodeId, selector: &Selector) -> Option<NodeId> {
        let mut current = Some(node);
        while let Some(id) = current {
            if self.matches(id, selector) {
                return Some(id);
            }
            current = self.parent(id);
        }
        None
    }

    pub fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        selector.matches_at(self, node, selector.steps.len() - 1)
    }

    // ---- serialization ----

    pub fn outer_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.write_html(node, &mut out);
        out
    }

    pub fn inner_html(&self, node: NodeId) -> String {
        let mut out = String::new();
        for &child in self.children(node) {
            self.write_html(child, &mut out);
        }
        out
    }

    fn write_html(&self, node: NodeId, out: &mut String) {
        match &self.node(node).data {
            NodeData::Text(text) => out.push_str(&html_escape::encode_text(text)),
            NodeData::Element { tag, attrs } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&html_escape::encode_double_quoted_attribute(value));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&tag.as_str()) {
                    return;
                }
                for &child in self.children(node) {
                    self.write_html(child, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }

    /// MD5 of the serialized document.
    pub fn fingerprint(&self) -> String {
        format!("{:x}", md5::compute(self.inner_html(self.root)))
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,
    #[error("selector ends with a combinator: {0}")]
    DanglingCombinator(String),
    #[error("unsupported selector syntax: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    classes: Vec<String>,
    attrs: Vec<String>,
}

impl Compound {
    fn parse(token: &str) -> Result<Self, SelectorError> {
        let unsupported = || SelectorError::Unsupported(token.to_string());
        let mut compound = Compound::default();
        let mut rest = token;

        let tag_len = rest
            .find(|c: char| c == '.' || c == '[')
            .unwrap_or(rest.len());
        if tag_len > 0 {
            let tag = &rest[..tag_len];
            if !tag.chars().all(is_ident_char) {
                return Err(unsupported());
            }
            compound.tag = Some(tag.to_ascii_lowercase());
            rest = &rest[tag_len..];
        }

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let len = after
                    .find(|c: char| !is_ident_char(c))
                    .unwrap_or(after.len());
                if len == 0 {
                    return Err(unsupported());
                }
                compound.classes.push(after[..len].to_string());
                rest = &after[len..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(unsupported)?;
                let name = after[..end].trim();
                if name.is_empty() || !name.chars().all(is_ident_char) {
                    return Err(unsupported());
                }
                compound.attrs.push(name.to_string());
                rest = &after[end + 1..];
            } else {
                return Err(unsupported());
            }
        }
        Ok(compound)
    }

    fn matches(&self, doc: &Document, node: NodeId) -> bool {
        let Some(tag) = doc.tag(node) else {
            return false;
        };
        if let Some(want) = &self.tag {
            if want != "*" && !tag.eq_ignore_ascii_case(want) {
                return false;
            }
        }
        self.classes.iter().all(|c| doc.has_class(node, c))
            && self.attrs.iter().all(|a| doc.has_attr(node, a))
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '*'
}

/// A small CSS subset: tag, `.class`, `[attr]` compounds joined by
/// descendant (space) or child (`>`) combinators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    // The combinator of the first step is unused.
    steps: Vec<(Combinator, Compound)>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, SelectorError> {
        let spaced = source.replace('>', " > ");
        let mut steps = Vec::new();
        let mut pending = Combinator::Descendant;
        let mut expect_compound = false;
        for token in spaced.split_whitespace() {
            if token == ">" {
                if steps.is_empty() || expect_compound {
                    return Err(SelectorError::Unsupported(source.to_string()));
                }
                pending = Combinator::Child;
                expect_compound = true;
                continue;
            }
            steps.push((pending, Compound::parse(token)?));
            pending = Combinator::Descendant;
            expect_compound = false;
        }
        if expect_compound {
            return Err(SelectorError::DanglingCombinator(source.to_string()));
        }
        if steps.is_empty() {
            return Err(SelectorError::Empty);
        }
        Ok(Self { steps })
    }

    fn matches_at(&self, doc: &Document, node: NodeId, index: usize) -> bool {
        let (combinator, compound) = &self.steps[index];
        if !compound.matches(doc, node) {
            return false;
        }
        if index == 0 {
            return true;
        }
        match combinator {
            Combinator::Child => doc
                .parent(node)
                .is_some_and(|parent| self.matches_at(doc, parent, index - 1)),
            Combinator::Descendant => {
                let mut current = doc.parent(node);
                while let Some(ancestor) = current {
                    if self.matches_at(doc, ancestor, index - 1) {
                        return true;
                    }
                    current = doc.parent(ancestor);
                }
                false
            }
        }
    }
}
