//! Arena DOM tree
//!
//! A snapshot is a flat `Vec<DomNode>` addressed by [`NodeId`]. Parent and
//! child links are indices; the content document of an iframe and the shadow
//! roots of a host are ordinary children, and the `content_document`,
//! `shadow_roots` and `owner_document` fields only annotate them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::handle::ElementHandle;

/// Index of a node inside its [`DomTree`]
pub type NodeId = usize;

/// Bounding box in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Nonzero size and non-negative origin
    pub fn is_usable(&self) -> bool {
        self.width > 0.0 && self.height > 0.0 && self.x >= 0.0 && self.y >= 0.0
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    /// Bounding box of a protocol quad (`[x1,y1,x2,y2,x3,y3,x4,y4]`)
    pub fn from_quad(quad: &[f64]) -> Option<Self> {
        if quad.len() < 8 {
            return None;
        }
        let xs = [quad[0], quad[2], quad[4], quad[6]];
        let ys = [quad[1], quad[3], quad[5], quad[7]];
        let min_x = xs.iter().copied().fold(f64::INFINITY, f64::min);
        let max_x = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min_y = ys.iter().copied().fold(f64::INFINITY, f64::min);
        let max_y = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self::new(min_x, min_y, max_x - min_x, max_y - min_y))
    }
}

/// Node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Document,
    Element,
    Text,
    ShadowRoot,
    Other,
}

impl NodeKind {
    /// Map the protocol `nodeType`
    pub fn from_node_type(node_type: i64) -> Self {
        match node_type {
            1 => NodeKind::Element,
            3 => NodeKind::Text,
            9 => NodeKind::Document,
            11 => NodeKind::ShadowRoot,
            _ => NodeKind::Other,
        }
    }
}

/// One node of a snapshot
#[derive(Debug, Clone)]
pub struct DomNode {
    pub id: NodeId,
    /// Browser-assigned id, valid for one document lifetime
    pub backend_node_id: i64,
    pub kind: NodeKind,
    /// Lowercase tag for elements, `#text`/`#document` otherwise
    pub tag: String,
    /// Text content of text nodes
    pub text: Option<String>,
    pub attributes: BTreeMap<String, String>,
    /// Layout box relative to the root target's document; `None` when not laid out
    pub bounds: Option<Rect>,
    pub role: Option<String>,
    pub name: Option<String>,
    pub cursor_pointer: bool,
    /// Rendered with non-hidden computed styles
    pub visible: bool,
    /// Inside an `inert` subtree
    pub inert: bool,
    /// Inside an `aria-hidden="true"` subtree
    pub aria_hidden: bool,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub content_document: Option<NodeId>,
    pub shadow_roots: Vec<NodeId>,
    pub owner_document: Option<NodeId>,
    pub frame_id: Option<String>,
    /// Target whose session owns this node
    pub target_id: Arc<str>,
    /// Offset of the owning frame within the root target's document
    pub frame_offset: (f64, f64),
    /// Iframe boundaries between the root document and this node
    pub frame_depth: usize,
    /// Path relative to the owning document
    pub xpath: String,
    /// Interactive index, 1-based
    pub index: Option<usize>,
}

impl DomNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn is_element(&self) -> bool {
        self.kind == NodeKind::Element
    }

    pub fn is_iframe(&self) -> bool {
        self.is_element() && (self.tag == "iframe" || self.tag == "frame")
    }
}

/// Compact description of an interactive element, handed to the planner
#[derive(Debug, Clone, Serialize)]
pub struct ElementSummary {
    pub index: usize,
    pub tag: String,
    pub role: Option<String>,
    pub name: Option<String>,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub bounds: Option<Rect>,
    pub target_id: String,
}

/// Attributes worth showing to the planner
const SUMMARY_ATTRIBUTES: &[&str] = &[
    "id",
    "name",
    "type",
    "href",
    "placeholder",
    "aria-label",
    "title",
    "alt",
    "value",
    "role",
];

const SUMMARY_TEXT_LIMIT: usize = 100;

/// Immutable snapshot of one target's document
#[derive(Debug, Clone)]
pub struct DomTree {
    nodes: Vec<DomNode>,
    root: NodeId,
    selector_map: BTreeMap<usize, NodeId>,
    by_backend: HashMap<(Arc<str>, i64), NodeId>,
    target_id: String,
    url: String,
    epoch: u64,
    captured_at: DateTime<Utc>,
}

impl DomTree {
    pub(crate) fn new(nodes: Vec<DomNode>, root: NodeId, target_id: String, url: String, epoch: u64) -> Self {
        let by_backend = nodes
            .iter()
            .map(|n| ((Arc::clone(&n.target_id), n.backend_node_id), n.id))
            .collect();
        let selector_map = nodes
            .iter()
            .filter_map(|n| n.index.map(|i| (i, n.id)))
            .collect();
        Self {
            nodes,
            root,
            selector_map,
            by_backend,
            target_id,
            url,
            epoch,
            captured_at: Utc::now(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&DomNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Navigation epoch of the root target when the snapshot was taken
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Node carrying interactive index `index`
    pub fn by_index(&self, index: usize) -> Option<&DomNode> {
        self.selector_map.get(&index).and_then(|id| self.node(*id))
    }

    pub fn by_backend_id(&self, target_id: &str, backend_node_id: i64) -> Option<&DomNode> {
        let key: (Arc<str>, i64) = (Arc::from(target_id), backend_node_id);
        self.by_backend.get(&key).and_then(|id| self.node(*id))
    }

    pub fn by_xpath(&self, target_id: &str, xpath: &str) -> Option<&DomNode> {
        self.nodes
            .iter()
            .find(|n| n.is_element() && &*n.target_id == target_id && n.xpath == xpath)
    }

    /// Number of interactive elements
    pub fn interactive_count(&self) -> usize {
        self.selector_map.len()
    }

    /// Pre-order traversal from the root
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(node) = self.node(id) {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        order
    }

    /// Ancestors of a node, nearest first
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.node(id).and_then(|n| n.parent);
        while let Some(pid) = current {
            out.push(pid);
            current = self.node(pid).and_then(|n| n.parent);
        }
        out
    }

    /// Whitespace-collapsed text of a subtree
    pub fn element_text(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.node(current) else { continue };
            if node.kind == NodeKind::Text {
                if let Some(text) = node.text.as_deref() {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        parts.push(trimmed.to_string());
                    }
                }
            }
            if matches!(node.tag.as_str(), "script" | "style" | "noscript") {
                continue;
            }
            stack.extend(node.children.iter().rev().copied());
        }
        parts
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Summaries of every interactive element, by index
    pub fn element_index(&self) -> Vec<ElementSummary> {
        self.selector_map
            .iter()
            .filter_map(|(index, id)| {
                let node = self.node(*id)?;
                let mut text = self.element_text(*id);
                if text.chars().count() > SUMMARY_TEXT_LIMIT {
                    text = text.chars().take(SUMMARY_TEXT_LIMIT).collect::<String>() + "…";
                }
                let attributes = node
                    .attributes
                    .iter()
                    .filter(|(k, v)| SUMMARY_ATTRIBUTES.contains(&k.as_str()) && !v.is_empty())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Some(ElementSummary {
                    index: *index,
                    tag: node.tag.clone(),
                    role: node.role.clone(),
                    name: node.name.clone(),
                    text,
                    attributes,
                    bounds: node.bounds,
                    target_id: node.target_id.to_string(),
                })
            })
            .collect()
    }

    /// One line per interactive element: `[3]<button type=submit>Sign in</button>`
    pub fn render_index(&self) -> String {
        self.element_index()
            .iter()
            .map(|s| {
                let attrs: String = s
                    .attributes
                    .iter()
                    .map(|(k, v)| format!(" {}={}", k, v))
                    .collect();
                let label = if s.text.is_empty() {
                    s.name.clone().unwrap_or_default()
                } else {
                    s.text.clone()
                };
                format!("[{}]<{}{}>{}</{}>", s.index, s.tag, attrs, label, s.tag)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Handle for the element at `index`
    pub fn handle(&self, index: usize) -> Option<ElementHandle> {
        self.by_index(index).map(ElementHandle::from_node)
    }

    /// Re-resolve a handle taken from this or an older snapshot.
    ///
    /// Backend id first, then path, then index.
    pub fn resolve(&self, handle: &ElementHandle) -> Option<&DomNode> {
        if let Some(node) = self.by_backend_id(&handle.target_id, handle.backend_node_id) {
            return Some(node);
        }
        if let Some(node) = handle
            .xpath
            .as_deref()
            .and_then(|xpath| self.by_xpath(&handle.target_id, xpath))
        {
            return Some(node);
        }
        handle.index.and_then(|index| self.by_index(index))
    }
}
