//! DOM snapshot service
//!
//! One snapshot = `DOM.getDocument` (pierced), `DOMSnapshot.captureSnapshot`
//! and `Accessibility.getFullAXTree` for the root target, merged into one
//! arena tree. Same-process iframes arrive inside the pierced document;
//! out-of-process iframes are captured over their own session and grafted
//! under their iframe element. Both kinds count against `max_iframe_depth`.
//!
//! The root document's identity is read before and after the capture, and a
//! mismatch fails the snapshot even when the navigation event is still queued.

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::clickable::is_interactive;
use super::layout::{capture_params, LayoutMap};
use super::node::{DomNode, DomTree, NodeId, NodeKind};
use crate::config::Config;
use crate::session::{SessionManager, TargetKind};
use crate::{Error, Result};

/// Snapshot settings
#[derive(Debug, Clone)]
pub struct DomSettings {
    /// Iframe boundaries followed below the root document; 0 skips iframe content
    pub max_iframe_depth: usize,
    /// Attach to out-of-process iframes
    pub cross_origin_iframes: bool,
    pub timeout: Duration,
}

impl Default for DomSettings {
    fn default() -> Self {
        Self {
            max_iframe_depth: 3,
            cross_origin_iframes: true,
            timeout: Duration::from_secs(15),
        }
    }
}

impl DomSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iframe_depth: config.max_iframe_depth,
            cross_origin_iframes: config.cross_origin_iframes,
            timeout: config.snapshot_timeout(),
        }
    }
}

/// A new document gets a new root backend node
#[derive(Debug, PartialEq, Eq)]
struct DocumentIdentity {
    root_backend_id: Option<i64>,
    url: Option<String>,
}

impl DocumentIdentity {
    fn of(root: &Value) -> Self {
        Self {
            root_backend_id: root.get("backendNodeId").and_then(Value::as_i64),
            url: root.get("documentURL").and_then(Value::as_str).map(str::to_string),
        }
    }
}

/// Raw protocol results for one target
#[derive(Debug)]
struct RawCapture {
    document: Value,
    layout: LayoutMap,
    /// backend id -> (role, name)
    ax: HashMap<i64, (Option<String>, Option<String>)>,
}

impl RawCapture {
    fn parse(document: Value, snapshot: Value, ax_tree: Value) -> Result<Self> {
        let document = document
            .get("root")
            .cloned()
            .ok_or_else(|| Error::internal("DOM.getDocument returned no root"))?;
        let layout = LayoutMap::from_snapshot(&snapshot)?;

        let mut ax = HashMap::new();
        for node in ax_tree
            .get("nodes")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(backend_id) = node.get("backendDOMNodeId").and_then(Value::as_i64) else {
                continue;
            };
            if node.get("ignored").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            let role = node
                .pointer("/role/value")
                .and_then(Value::as_str)
                .map(str::to_string);
            let name = node
                .pointer("/name/value")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .map(str::to_string);
            ax.insert(backend_id, (role, name));
        }

        Ok(Self { document, layout, ax })
    }
}

/// Per-document walk context
#[derive(Debug, Clone)]
struct FrameContext {
    target_id: Arc<str>,
    depth: usize,
    offset: (f64, f64),
    inert: bool,
    aria_hidden: bool,
    owner_document: Option<NodeId>,
    frame_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Child,
    ContentDocument,
    ShadowRoot,
}

struct WalkItem<'a> {
    json: &'a Value,
    parent: Option<NodeId>,
    link: Link,
    ctx: FrameContext,
    xpath: String,
}

/// Out-of-process iframe waiting to be grafted
#[derive(Debug)]
struct PendingFrame {
    placeholder: NodeId,
    frame_id: String,
    depth: usize,
    offset: (f64, f64),
}

#[derive(Default)]
struct TreeBuilder {
    nodes: Vec<DomNode>,
}

impl TreeBuilder {
    /// Append one protocol document under `parent`; returns its node id and
    /// the out-of-process iframes found inside it
    fn add_document(
        &mut self,
        root: &Value,
        parent: Option<NodeId>,
        link: Link,
        ctx: FrameContext,
        raw: &RawCapture,
        settings: &DomSettings,
    ) -> (NodeId, Vec<PendingFrame>) {
        let first = self.nodes.len();
        let mut pending = Vec::new();
        let mut stack = vec![WalkItem {
            json: root,
            parent,
            link,
            ctx,
            xpath: String::new(),
        }];

        while let Some(item) = stack.pop() {
            let id = self.push_node(&item, raw);
            let node_kind = self.nodes[id].kind;
            let is_iframe = self.nodes[id].is_iframe();

            let mut child_ctx = item.ctx.clone();
            child_ctx.inert = self.nodes[id].inert;
            child_ctx.aria_hidden = self.nodes[id].aria_hidden;
            if node_kind == NodeKind::Document {
                child_ctx.owner_document = Some(id);
            }

            let mut next: Vec<WalkItem> = Vec::new();

            for shadow in item
                .json
                .get("shadowRoots")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                next.push(WalkItem {
                    json: shadow,
                    parent: Some(id),
                    link: Link::ShadowRoot,
                    ctx: child_ctx.clone(),
                    xpath: format!("{}/#shadow-root", item.xpath),
                });
            }

            let children = item.json.get("children").and_then(Value::as_array);
            let mut seen: HashMap<String, usize> = HashMap::new();
            for child in children.into_iter().flatten() {
                let xpath = if child.get("nodeType").and_then(Value::as_i64) == Some(1) {
                    let tag = tag_of(child);
                    let position = seen.entry(tag.clone()).or_insert(0);
                    *position += 1;
                    format!("{}/{}[{}]", item.xpath, tag, position)
                } else {
                    item.xpath.clone()
                };
                next.push(WalkItem {
                    json: child,
                    parent: Some(id),
                    link: Link::Child,
                    ctx: child_ctx.clone(),
                    xpath,
                });
            }

            if is_iframe {
                let depth = item.ctx.depth + 1;
                let offset = self.nodes[id]
                    .bounds
                    .map(|b| (b.x, b.y))
                    .unwrap_or(item.ctx.offset);

                match item.json.get("contentDocument") {
                    Some(content) if depth <= settings.max_iframe_depth => {
                        next.push(WalkItem {
                            json: content,
                            parent: Some(id),
                            link: Link::ContentDocument,
                            ctx: FrameContext {
                                depth,
                                offset,
                                owner_document: None,
                                frame_id: content
                                    .get("frameId")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                                ..child_ctx.clone()
                            },
                            xpath: format!("{}/#document", item.xpath),
                        });
                    }
                    Some(_) => debug!("Skipping iframe content beyond depth {}", settings.max_iframe_depth),
                    None => {
                        let frame_id = item.json.get("frameId").and_then(Value::as_str);
                        if let Some(frame_id) = frame_id {
                            if settings.cross_origin_iframes && depth <= settings.max_iframe_depth {
                                pending.push(PendingFrame {
                                    placeholder: id,
                                    frame_id: frame_id.to_string(),
                                    depth,
                                    offset,
                                });
                            }
                        }
                    }
                }
            }

            stack.extend(next.into_iter().rev());
        }

        (first, pending)
    }

    fn push_node(&mut self, item: &WalkItem<'_>, raw: &RawCapture) -> NodeId {
        let json = item.json;
        let id = self.nodes.len();
        let kind = NodeKind::from_node_type(json.get("nodeType").and_then(Value::as_i64).unwrap_or(0));
        let backend_node_id = json.get("backendNodeId").and_then(Value::as_i64).unwrap_or(0);

        let mut attributes = BTreeMap::new();
        if let Some(flat) = json.get("attributes").and_then(Value::as_array) {
            for pair in flat.chunks(2) {
                if let [k, v] = pair {
                    attributes.insert(
                        k.as_str().unwrap_or_default().to_string(),
                        v.as_str().unwrap_or_default().to_string(),
                    );
                }
            }
        }

        let layout = raw.layout.get(backend_node_id);
        let (role, name) = raw.ax.get(&backend_node_id).cloned().unwrap_or((None, None));
        let (dx, dy) = item.ctx.offset;

        let inert = item.ctx.inert || attributes.contains_key("inert");
        let aria_hidden =
            item.ctx.aria_hidden || attributes.get("aria-hidden").is_some_and(|v| v == "true");

        self.nodes.push(DomNode {
            id,
            backend_node_id,
            kind,
            tag: if kind == NodeKind::Element {
                tag_of(json)
            } else {
                json.get("nodeName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_lowercase()
            },
            text: if kind == NodeKind::Text {
                json.get("nodeValue").and_then(Value::as_str).map(str::to_string)
            } else {
                None
            },
            attributes,
            bounds: layout.map(|l| l.bounds.offset(dx, dy)),
            role,
            name,
            cursor_pointer: layout.is_some_and(|l| l.cursor_pointer),
            visible: layout.is_some_and(|l| l.visible),
            inert,
            aria_hidden,
            parent: item.parent,
            children: Vec::new(),
            content_document: None,
            shadow_roots: Vec::new(),
            owner_document: item.ctx.owner_document,
            frame_id: item.ctx.frame_id.clone(),
            target_id: Arc::clone(&item.ctx.target_id),
            frame_offset: item.ctx.offset,
            frame_depth: item.ctx.depth,
            xpath: item.xpath.clone(),
            index: None,
        });

        if let Some(parent) = item.parent {
            let parent_node = &mut self.nodes[parent];
            parent_node.children.push(id);
            match item.link {
                Link::ContentDocument => parent_node.content_document = Some(id),
                Link::ShadowRoot => parent_node.shadow_roots.push(id),
                Link::Child => {}
            }
        }
        id
    }

    /// Assign 1-based interactive indices in pre-order
    fn assign_indices(&mut self, root: NodeId) {
        let mut next_index = 1;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = &mut self.nodes[id];
            if node.visible && is_interactive(node) {
                node.index = Some(next_index);
                next_index += 1;
            }
            stack.extend(node.children.iter().rev().copied());
        }
    }
}

fn tag_of(json: &Value) -> String {
    json.get("localName")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| json.get("nodeName").and_then(Value::as_str))
        .unwrap_or_default()
        .to_lowercase()
}

/// Builds snapshots and remembers the latest one per target
pub struct DomService {
    manager: Arc<SessionManager>,
    settings: DomSettings,
    latest: RwLock<HashMap<String, Arc<DomTree>>>,
}

impl std::fmt::Debug for DomService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomService")
            .field("settings", &self.settings)
            .finish()
    }
}

impl DomService {
    pub fn new(manager: Arc<SessionManager>, settings: DomSettings) -> Self {
        Self {
            manager,
            settings,
            latest: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &DomSettings {
        &self.settings
    }

    /// Most recent snapshot of a target
    pub fn latest(&self, target_id: &str) -> Option<Arc<DomTree>> {
        self.latest
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(target_id)
            .cloned()
    }

    /// Drop the cached snapshot of a target
    pub fn invalidate(&self, target_id: &str) {
        self.latest
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(target_id);
    }

    /// Snapshot the focused target
    pub async fn snapshot_focused(&self) -> Result<Arc<DomTree>> {
        let target_id = self.manager.require_focus()?;
        self.snapshot(&target_id).await
    }

    /// Capture a fresh snapshot of `target_id`.
    ///
    /// Fails with [`Error::SnapshotInvalidated`] when the target committed a
    /// navigation while the snapshot was being captured.
    #[instrument(skip(self))]
    pub async fn snapshot(&self, target_id: &str) -> Result<Arc<DomTree>> {
        let tree = tokio::time::timeout(self.settings.timeout, self.build(target_id))
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "DOM snapshot of {} exceeded {:?}",
                    target_id, self.settings.timeout
                ))
            })??;

        let tree = Arc::new(tree);
        self.latest
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(target_id.to_string(), Arc::clone(&tree));
        Ok(tree)
    }

    async fn capture(&self, target_id: &str) -> Result<RawCapture> {
        let (document, snapshot, ax_tree) = futures::try_join!(
            self.manager.send_to_target(
                target_id,
                "DOM.getDocument",
                json!({ "depth": -1, "pierce": true })
            ),
            self.manager
                .send_to_target(target_id, "DOMSnapshot.captureSnapshot", capture_params()),
            self.manager
                .send_to_target(target_id, "Accessibility.getFullAXTree", json!({})),
        )?;
        RawCapture::parse(document, snapshot, ax_tree)
    }

    async fn build(&self, target_id: &str) -> Result<DomTree> {
        let epoch = self.manager.navigation_epoch(target_id);
        let before = self.current_document(target_id).await?;
        let raw = self.capture(target_id).await?;
        self.check_epoch(target_id, epoch)?;
        if DocumentIdentity::of(&raw.document) != before {
            debug!("Captured document of {} differs from {:?}", target_id, before);
            return Err(Error::snapshot_invalidated(target_id));
        }

        let url = raw
            .document
            .get("documentURL")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut builder = TreeBuilder::default();
        let root_ctx = FrameContext {
            target_id: Arc::from(target_id),
            depth: 0,
            offset: (0.0, 0.0),
            inert: false,
            aria_hidden: false,
            owner_document: None,
            frame_id: Some(target_id.to_string()),
        };
        let (root, mut pending) =
            builder.add_document(&raw.document, None, Link::Child, root_ctx, &raw, &self.settings);

        while let Some(frame) = pending.pop() {
            let known_iframe = self
                .manager
                .get_target(&frame.frame_id)
                .is_some_and(|t| t.kind == TargetKind::Iframe);
            if !known_iframe {
                debug!("No iframe target for frame {}, leaving placeholder empty", frame.frame_id);
                continue;
            }

            let sub = match self.capture(&frame.frame_id).await {
                Ok(sub) => sub,
                Err(e) => {
                    warn!("Could not capture cross-origin frame {}: {}", frame.frame_id, e);
                    continue;
                }
            };
            let ctx = FrameContext {
                target_id: Arc::from(frame.frame_id.as_str()),
                depth: frame.depth,
                offset: frame.offset,
                inert: builder.nodes[frame.placeholder].inert,
                aria_hidden: builder.nodes[frame.placeholder].aria_hidden,
                owner_document: None,
                frame_id: Some(frame.frame_id.clone()),
            };
            let (_, nested) = builder.add_document(
                &sub.document,
                Some(frame.placeholder),
                Link::ContentDocument,
                ctx,
                &sub,
                &self.settings,
            );
            pending.extend(nested);
        }

        self.check_epoch(target_id, epoch)?;
        // navigation events may still be queued behind the replies
        let after = self.current_document(target_id).await?;
        if after != before {
            debug!("Document of {} changed during capture: {:?} -> {:?}", target_id, before, after);
            return Err(Error::snapshot_invalidated(target_id));
        }
        builder.assign_indices(root);

        let tree = DomTree::new(builder.nodes, root, target_id.to_string(), url, epoch);
        debug!(
            "Snapshot of {}: {} nodes, {} interactive",
            target_id,
            tree.len(),
            tree.interactive_count()
        );
        Ok(tree)
    }

    async fn current_document(&self, target_id: &str) -> Result<DocumentIdentity> {
        let document = self
            .manager
            .send_to_target(target_id, "DOM.getDocument", json!({ "depth": 0 }))
            .await?;
        let root = document
            .get("root")
            .ok_or_else(|| Error::internal("DOM.getDocument returned no root"))?;
        Ok(DocumentIdentity::of(root))
    }

    fn check_epoch(&self, target_id: &str, before: u64) -> Result<()> {
        if self.manager.navigation_epoch(target_id) != before {
            return Err(Error::snapshot_invalidated(target_id));
        }
        Ok(())
    }
}
