//! Layout extraction from `DOMSnapshot.captureSnapshot`
//!
//! The snapshot is columnar: per document, `layout.nodeIndex[i]` points into
//! the document's node arrays, `layout.bounds[i]` is `[x, y, w, h]` and
//! `layout.styles[i]` holds indices into the shared `strings` table, one per
//! requested computed style.

use serde_json::{json, Value};
use std::collections::HashMap;

use super::node::Rect;
use crate::{Error, Result};

/// Computed styles requested from the browser, in column order
pub(crate) const COMPUTED_STYLES: &[&str] = &["display", "visibility", "opacity", "cursor", "pointer-events"];

/// Parameters for `DOMSnapshot.captureSnapshot`
pub(crate) fn capture_params() -> Value {
    json!({
        "computedStyles": COMPUTED_STYLES,
        "includeDOMRects": true,
        "includePaintOrder": false,
    })
}

/// Layout facts for one node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutInfo {
    /// Box in the coordinates of the node's own document
    pub bounds: Rect,
    pub cursor_pointer: bool,
    pub visible: bool,
}

/// Layout facts keyed by backend node id
#[derive(Debug, Clone, Default)]
pub struct LayoutMap {
    entries: HashMap<i64, LayoutInfo>,
}

impl LayoutMap {
    pub fn get(&self, backend_node_id: i64) -> Option<&LayoutInfo> {
        self.entries.get(&backend_node_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a `DOMSnapshot.captureSnapshot` result
    pub fn from_snapshot(raw: &Value) -> Result<Self> {
        let documents = raw
            .get("documents")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::internal("DOMSnapshot.captureSnapshot missing 'documents' array"))?;
        let strings: Vec<&str> = raw
            .get("strings")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::internal("DOMSnapshot.captureSnapshot missing 'strings' array"))?
            .iter()
            .map(|s| s.as_str().unwrap_or_default())
            .collect();

        let mut entries = HashMap::new();
        for document in documents {
            Self::read_document(document, &strings, &mut entries);
        }
        Ok(Self { entries })
    }

    fn read_document(document: &Value, strings: &[&str], entries: &mut HashMap<i64, LayoutInfo>) {
        let backend_ids = document
            .pointer("/nodes/backendNodeId")
            .and_then(Value::as_array);
        let layout = document.get("layout");
        let (Some(backend_ids), Some(layout)) = (backend_ids, layout) else {
            return;
        };

        let empty = Vec::new();
        let node_index = layout.get("nodeIndex").and_then(Value::as_array).unwrap_or(&empty);
        let bounds = layout.get("bounds").and_then(Value::as_array).unwrap_or(&empty);
        let styles = layout.get("styles").and_then(Value::as_array).unwrap_or(&empty);

        for (i, node) in node_index.iter().enumerate() {
            let Some(backend_id) = node
                .as_u64()
                .and_then(|n| backend_ids.get(n as usize))
                .and_then(Value::as_i64)
            else {
                continue;
            };
            let Some(rect) = bounds.get(i).and_then(parse_rect) else {
                continue;
            };

            let style = |column: usize| style_at(styles, strings, i, column);
            let display = style(0);
            let visibility = style(1);
            let opacity = style(2).parse::<f64>().unwrap_or(1.0);
            let cursor = style(3);
            let pointer_events = style(4);

            entries.insert(
                backend_id,
                LayoutInfo {
                    bounds: rect,
                    cursor_pointer: cursor == "pointer" && pointer_events != "none",
                    visible: display != "none"
                        && visibility != "hidden"
                        && visibility != "collapse"
                        && opacity > 0.0,
                },
            );
        }
    }
}

fn style_at<'a>(styles: &[Value], strings: &[&'a str], row: usize, column: usize) -> &'a str {
    styles
        .get(row)
        .and_then(|r| r.get(column))
        .and_then(Value::as_u64)
        .and_then(|idx| strings.get(idx as usize).copied())
        .unwrap_or("")
}

fn parse_rect(value: &Value) -> Option<Rect> {
    let items = value.as_array()?;
    if items.len() < 4 {
        return None;
    }
    let n = |i: usize| items[i].as_f64();
    Some(Rect::new(n(0)?, n(1)?, n(2)?, n(3)?))
}
