//! Interaction engine
//!
//! Owns the pieces every action needs: the session manager for protocol
//! round trips, the DOM service for element resolution and the navigation
//! policy. Clicks, typing and scrolling live in their own modules as further
//! `impl InteractionEngine` blocks.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::policy::NavigationPolicy;
use crate::bus::{BrowserEvent, EventBus, EventWaiter};
use crate::config::Config;
use crate::dom::{DomNode, DomService, DomTree, ElementHandle, Rect};
use crate::retry::RetryPolicy;
use crate::session::SessionManager;
use crate::{Error, Result};

/// Reports whether an element can receive input
const STATE_CHECK_FN: &str = r#"function() {
    const connected = this.isConnected;
    if (!connected) {
        return { connected: false, visible: false, enabled: false };
    }
    const view = this.ownerDocument.defaultView || window;
    const style = view.getComputedStyle(this);
    const rect = this.getBoundingClientRect();
    const visible = style.display !== 'none'
        && style.visibility !== 'hidden'
        && Number(style.opacity) > 0
        && rect.width > 0
        && rect.height > 0;
    const enabled = !this.disabled
        && this.getAttribute('aria-disabled') !== 'true'
        && !this.closest('[inert]');
    return { connected, visible, enabled };
}"#;

/// Timing and behavior knobs for input actions
#[derive(Debug, Clone)]
pub struct InteractionSettings {
    /// How long a click waits for a navigation
    pub navigation_race_timeout: Duration,
    /// How long a click waits for a download to start
    pub download_start_timeout: Duration,
    /// How long a started download may take
    pub download_timeout: Duration,
    /// Timeout for explicit navigations and navigating back
    pub navigation_timeout: Duration,
    pub humanize: bool,
    pub typing_delay_ms: Option<u64>,
    pub dismiss_popups: bool,
    /// Caller-facing click retries
    pub click_retry: RetryPolicy,
}

impl Default for InteractionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl InteractionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            navigation_race_timeout: Duration::from_millis(config.navigation_race_timeout_ms),
            download_start_timeout: Duration::from_millis(config.download_start_timeout_ms),
            download_timeout: Duration::from_millis(config.download_timeout_ms),
            navigation_timeout: config.navigation_timeout(),
            humanize: config.humanize_input,
            typing_delay_ms: config.typing_delay_ms,
            dismiss_popups: config.dismiss_popups,
            click_retry: RetryPolicy::click_from_config(config),
        }
    }
}

/// An element resolved against a snapshot and checked for input
#[derive(Debug, Clone)]
pub(crate) struct Located {
    /// Page target input events go to
    pub root: String,
    pub node: DomNode,
    /// Remote object for script fallbacks, valid in `node.target_id`
    pub object_id: String,
}

/// Input actions against the focused page
pub struct InteractionEngine {
    manager: Arc<SessionManager>,
    dom: Arc<DomService>,
    policy: NavigationPolicy,
    settings: InteractionSettings,
    pointer: Mutex<(f64, f64)>,
}

impl std::fmt::Debug for InteractionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionEngine")
            .field("policy", &self.policy)
            .field("settings", &self.settings)
            .finish()
    }
}

impl InteractionEngine {
    pub fn new(
        manager: Arc<SessionManager>,
        dom: Arc<DomService>,
        policy: NavigationPolicy,
        settings: InteractionSettings,
    ) -> Self {
        Self {
            manager,
            dom,
            policy,
            settings,
            pointer: Mutex::new((0.0, 0.0)),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn dom(&self) -> &Arc<DomService> {
        &self.dom
    }

    pub fn policy(&self) -> &NavigationPolicy {
        &self.policy
    }

    pub fn settings(&self) -> &InteractionSettings {
        &self.settings
    }

    pub(crate) fn bus(&self) -> &Arc<EventBus> {
        self.manager.bus()
    }

    pub(crate) fn pointer(&self) -> (f64, f64) {
        *self.pointer.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn set_pointer(&self, point: (f64, f64)) {
        *self.pointer.lock().unwrap_or_else(|p| p.into_inner()) = point;
    }

    /// Current snapshot of the focused page, capturing one when `refresh` is set
    /// or nothing is cached
    pub(crate) async fn current_tree(&self, refresh: bool) -> Result<Arc<DomTree>> {
        let root = self.manager.require_focus()?;
        match (refresh, self.dom.latest(&root)) {
            (false, Some(tree)) => Ok(tree),
            _ => self.dom.snapshot(&root).await,
        }
    }

    /// Map a handle to a node of the latest snapshot
    pub(crate) async fn resolve(&self, handle: &ElementHandle, refresh: bool) -> Result<(String, DomNode)> {
        let tree = self.current_tree(refresh).await?;
        let node = tree.resolve(handle).ok_or_else(|| {
            Error::element_not_found(format!(
                "backend node {} (index {:?}) in {}",
                handle.backend_node_id,
                handle.index,
                tree.target_id()
            ))
        })?;
        Ok((tree.target_id().to_string(), node.clone()))
    }

    /// Verify the element is attached, visible and enabled
    pub(crate) async fn check_state(&self, root: String, node: DomNode) -> Result<Located> {
        let target = node.target_id.to_string();
        let resolved = self
            .manager
            .send_to_target(
                &target,
                "DOM.resolveNode",
                json!({ "backendNodeId": node.backend_node_id }),
            )
            .await
            .map_err(|e| match e {
                Error::Protocol { message, .. } => {
                    Error::element_not_interactable(format!("detached: {}", message))
                }
                other => other,
            })?;
        let object_id = resolved
            .pointer("/object/objectId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::element_not_interactable("detached: no remote object"))?
            .to_string();

        let state = self.call_on(&target, &object_id, STATE_CHECK_FN, vec![]).await?;
        let flag = |name: &str| state.get(name).and_then(Value::as_bool).unwrap_or(false);
        let problem = if !flag("connected") {
            Some("detached from document")
        } else if !flag("visible") {
            Some("not visible")
        } else if !flag("enabled") {
            Some("disabled")
        } else {
            None
        };
        if let Some(problem) = problem {
            return Err(Error::element_not_interactable(format!(
                "<{}> backend node {}: {}",
                node.tag, node.backend_node_id, problem
            )));
        }

        Ok(Located {
            root,
            node,
            object_id,
        })
    }

    /// Scroll the element into view and return its center in root viewport coordinates
    pub(crate) async fn element_point(&self, located: &Located) -> Result<(f64, f64)> {
        let node = &located.node;
        let target = node.target_id.to_string();
        let params = json!({ "backendNodeId": node.backend_node_id });

        if let Err(e) = self
            .manager
            .send_to_target(&target, "DOM.scrollIntoViewIfNeeded", params.clone())
            .await
        {
            debug!("scrollIntoViewIfNeeded failed for {}: {}", node.backend_node_id, e);
        }

        let quad = match self
            .manager
            .send_to_target(&target, "DOM.getContentQuads", params)
            .await
        {
            Ok(result) => first_quad(&result),
            Err(e) => {
                debug!("getContentQuads failed for {}: {}", node.backend_node_id, e);
                None
            }
        };

        if let Some(rect) = quad {
            let (x, y) = rect.center();
            // quads of an out-of-process frame are relative to that frame
            if target != located.root {
                return Ok((x + node.frame_offset.0, y + node.frame_offset.1));
            }
            return Ok((x, y));
        }

        node.bounds
            .filter(|b| b.is_usable())
            .map(|b| b.center())
            .ok_or_else(|| {
                Error::element_not_interactable(format!(
                    "<{}> backend node {}: no layout box",
                    node.tag, node.backend_node_id
                ))
            })
    }

    /// `Runtime.callFunctionOn` with by-value result
    pub(crate) async fn call_on(
        &self,
        target_id: &str,
        object_id: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let arguments: Vec<Value> = args.into_iter().map(|v| json!({ "value": v })).collect();
        let result = self
            .manager
            .send_to_target(
                target_id,
                "Runtime.callFunctionOn",
                json!({
                    "objectId": object_id,
                    "functionDeclaration": function,
                    "arguments": arguments,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        script_value(&result, "Runtime.callFunctionOn")
    }

    /// `Runtime.evaluate` in the target's main world
    pub(crate) async fn evaluate(&self, target_id: &str, expression: &str) -> Result<Value> {
        let result = self
            .manager
            .send_to_target(
                target_id,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        script_value(&result, "Runtime.evaluate")
    }

    /// Wait for the next main-frame navigation of `target_id`
    pub(crate) async fn wait_for_navigation(
        waiter: &mut EventWaiter,
        target_id: &str,
        timeout: Duration,
        include_same_document: bool,
    ) -> Result<String> {
        waiter
            .next_matching(timeout, |event| match event {
                BrowserEvent::NavigationCompleted {
                    target_id: t,
                    url,
                    same_document,
                } if t == target_id && (include_same_document || !same_document) => Some(url.clone()),
                _ => None,
            })
            .await
    }

    /// Navigate the focused page, enforcing the allow-list before and after
    /// redirects. Returns the committed URL.
    #[instrument(skip(self))]
    pub async fn navigate(&self, url: &str) -> Result<String> {
        self.policy.check(url).map_err(Error::disallowed)?;
        let root = self.manager.require_focus()?;
        let previous = self
            .manager
            .get_target(&root)
            .map(|t| t.url)
            .unwrap_or_default();

        let mut waiter = self.bus().waiter();
        let result = self
            .manager
            .send_to_target_with_timeout(
                &root,
                "Page.navigate",
                json!({ "url": url }),
                self.settings.navigation_timeout,
            )
            .await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            return Err(Error::protocol("Page.navigate", -32000, format!("{} ({})", error, url)));
        }

        let committed =
            Self::wait_for_navigation(&mut waiter, &root, self.settings.navigation_timeout, true).await?;
        self.dom.invalidate(&root);

        if let Err(reason) = self.policy.check(&committed) {
            warn!("Navigation to {} redirected to disallowed {}", url, committed);
            self.go_back_to(&root, &previous).await?;
            return Err(Error::disallowed(reason));
        }
        Ok(committed)
    }

    /// Go one entry back in the focused page's history. Returns the new URL.
    #[instrument(skip(self))]
    pub async fn go_back(&self) -> Result<String> {
        let root = self.manager.require_focus()?;
        let history = self
            .manager
            .send_to_target(&root, "Page.getNavigationHistory", json!({}))
            .await?;
        let (current, entries) = history_entries(&history);
        let (entry_id, url) = current
            .checked_sub(1)
            .and_then(|i| entries.get(i))
            .cloned()
            .ok_or_else(|| {
                Error::protocol("Page.navigateToHistoryEntry", -32000, "no previous history entry")
            })?;

        let mut waiter = self.bus().waiter();
        self.manager
            .send_to_target(
                &root,
                "Page.navigateToHistoryEntry",
                json!({ "entryId": entry_id }),
            )
            .await?;
        let committed =
            Self::wait_for_navigation(&mut waiter, &root, self.settings.navigation_timeout, true)
                .await
                .unwrap_or(url);
        self.dom.invalidate(&root);
        Ok(committed)
    }

    /// Return `target_id` to `previous_url`, via history when the previous
    /// entry matches, otherwise by navigating there directly
    pub(crate) async fn go_back_to(&self, target_id: &str, previous_url: &str) -> Result<()> {
        let history = self
            .manager
            .send_to_target(target_id, "Page.getNavigationHistory", json!({}))
            .await
            .unwrap_or(Value::Null);
        let (current, entries) = history_entries(&history);
        let back_entry = current
            .checked_sub(1)
            .and_then(|i| entries.get(i))
            .filter(|(_, url)| previous_url.is_empty() || url == previous_url)
            .map(|(id, _)| *id);

        let mut waiter = self.bus().waiter();
        match back_entry {
            Some(entry_id) => {
                self.manager
                    .send_to_target(
                        target_id,
                        "Page.navigateToHistoryEntry",
                        json!({ "entryId": entry_id }),
                    )
                    .await?;
            }
            None if !previous_url.is_empty() => {
                self.manager
                    .send_to_target_with_timeout(
                        target_id,
                        "Page.navigate",
                        json!({ "url": previous_url }),
                        self.settings.navigation_timeout,
                    )
                    .await?;
            }
            None => {
                return Err(Error::internal(format!(
                    "cannot return {} to its previous page",
                    target_id
                )))
            }
        }

        if let Err(e) =
            Self::wait_for_navigation(&mut waiter, target_id, self.settings.navigation_timeout, true).await
        {
            warn!("No navigation observed after going back in {}: {}", target_id, e);
        }
        self.dom.invalidate(target_id);
        Ok(())
    }
}

fn first_quad(result: &Value) -> Option<Rect> {
    let quad: Vec<f64> = result
        .get("quads")?
        .as_array()?
        .first()?
        .as_array()?
        .iter()
        .filter_map(Value::as_f64)
        .collect();
    Rect::from_quad(&quad).filter(|r| r.width > 0.0 && r.height > 0.0)
}

fn script_value(result: &Value, method: &str) -> Result<Value> {
    if let Some(details) = result.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .or_else(|| details.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("script threw");
        return Err(Error::protocol(method, -32000, message));
    }
    Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
}

/// `(currentIndex, [(entry id, url)])` from `Page.getNavigationHistory`
fn history_entries(history: &Value) -> (usize, Vec<(i64, String)>) {
    let current = history
        .get("currentIndex")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let entries = history
        .get("entries")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| {
                    Some((
                        e.get("id")?.as_i64()?,
                        e.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();
    (current, entries)
}
