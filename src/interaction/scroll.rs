//! Scrolling the page or a scrollable element

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::input;
use super::service::InteractionEngine;
use crate::dom::ElementHandle;
use crate::Result;

const SCROLL_ELEMENT_FN: &str = "function(dx, dy) { this.scrollBy(dx, dy); }";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    /// Wheel deltas for scrolling `amount` pixels
    pub fn deltas(&self, amount: f64) -> (f64, f64) {
        match self {
            ScrollDirection::Up => (0.0, -amount),
            ScrollDirection::Down => (0.0, amount),
            ScrollDirection::Left => (-amount, 0.0),
            ScrollDirection::Right => (amount, 0.0),
        }
    }
}

impl InteractionEngine {
    /// Scroll by `amount` CSS pixels, over `handle` when given, else over the
    /// middle of the viewport
    #[instrument(skip(self))]
    pub async fn scroll(&self, direction: ScrollDirection, amount: f64, handle: Option<&ElementHandle>) -> Result<()> {
        let (dx, dy) = direction.deltas(amount);

        let (root, point, element) = match handle {
            Some(handle) => {
                let (root, node) = self.resolve(handle, false).await?;
                let located = self.check_state(root, node).await?;
                let point = self.element_point(&located).await?;
                (located.root.clone(), point, Some(located))
            }
            None => {
                let root = self.manager().require_focus()?;
                let point = self.viewport_center(&root).await;
                (root, point, None)
            }
        };

        match input::mouse_wheel(self.manager(), &root, point.0, point.1, dx, dy).await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                debug!("Wheel dispatch failed ({}), scrolling from script", e);
                match &element {
                    Some(located) => {
                        let target = located.node.target_id.to_string();
                        self.call_on(&target, &located.object_id, SCROLL_ELEMENT_FN, vec![json!(dx), json!(dy)])
                            .await?;
                    }
                    None => {
                        self.evaluate(&root, &format!("window.scrollBy({}, {})", dx, dy))
                            .await?;
                    }
                }
            }
            Err(e) => return Err(e),
        }

        // layout boxes moved
        self.dom().invalidate(&root);
        Ok(())
    }

    async fn viewport_center(&self, root: &str) -> (f64, f64) {
        let metrics = self
            .manager()
            .send_to_target(root, "Page.getLayoutMetrics", json!({}))
            .await
            .unwrap_or(Value::Null);
        let viewport = metrics
            .get("cssLayoutViewport")
            .or_else(|| metrics.get("layoutViewport"));
        let size = |name: &str| viewport.and_then(|v| v.get(name)).and_then(Value::as_f64);
        match (size("clientWidth"), size("clientHeight")) {
            (Some(w), Some(h)) if w > 0.0 && h > 0.0 => (w / 2.0, h / 2.0),
            _ => (640.0, 400.0),
        }
    }
}
