//! Session/target manager implementation
//!
//! Tracks every target reported by the browser and the session attached to
//! each one. Target events are applied from the transport's dispatch task, so
//! the maps change in protocol order; commands go through [`SessionManager::send_to_target`],
//! which re-attaches and retries when the browser reports the session as gone.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::target::{Session, Target, TargetKind};
use crate::bus::{BrowserEvent, EventBus};
use crate::cdp::{CdpEvent, CdpTransport, HandlerId, TargetInfo, ANY_EVENT};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

#[derive(Debug, Default)]
struct ManagerState {
    targets: HashMap<String, Target>,
    /// Discovery order of `targets`
    order: Vec<String>,
    /// Live session per target id
    sessions: HashMap<String, Session>,
    /// Live session id -> target id
    session_targets: HashMap<String, String>,
    /// Session ids the browser detached; never sent again
    retired: HashSet<String>,
    focused: Option<String>,
    nav_epochs: HashMap<String, u64>,
    /// Serializes attaches per target; dropped with the target
    attach_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ManagerState {
    /// Insert or update a target; true when it was not known before
    fn track(&mut self, target: Target) -> bool {
        match self.targets.get_mut(&target.target_id) {
            Some(existing) => {
                existing.url = target.url;
                existing.title = target.title;
                if existing.opener_id.is_none() {
                    existing.opener_id = target.opener_id;
                }
                false
            }
            None => {
                self.order.push(target.target_id.clone());
                self.targets.insert(target.target_id.clone(), target);
                true
            }
        }
    }

    fn forget(&mut self, target_id: &str) -> Option<Target> {
        let removed = self.targets.remove(target_id);
        self.order.retain(|id| id != target_id);
        if let Some(session) = self.sessions.remove(target_id) {
            self.session_targets.remove(&session.session_id);
            self.retired.insert(session.session_id);
        }
        self.nav_epochs.remove(target_id);
        self.attach_locks.remove(target_id);
        if self.focused.as_deref() == Some(target_id) {
            self.focused = None;
        }
        removed
    }

    fn retire(&mut self, session_id: &str) -> Option<String> {
        let target_id = self.session_targets.remove(session_id)?;
        if self
            .sessions
            .get(&target_id)
            .is_some_and(|s| s.session_id == session_id)
        {
            self.sessions.remove(&target_id);
        }
        self.retired.insert(session_id.to_string());
        Some(target_id)
    }

    fn adopt(&mut self, session: Session) {
        self.session_targets
            .insert(session.session_id.clone(), session.target_id.clone());
        self.sessions.insert(session.target_id.clone(), session);
    }
}

/// Session/target manager
pub struct SessionManager {
    transport: Arc<dyn CdpTransport>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
    state: RwLock<ManagerState>,
    listener: Mutex<Option<HandlerId>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read_state();
        f.debug_struct("SessionManager")
            .field("targets", &state.targets.len())
            .field("sessions", &state.sessions.len())
            .field("focused", &state.focused)
            .finish()
    }
}

impl SessionManager {
    /// Create a manager; call [`start`](Self::start) to begin tracking targets
    pub fn new(transport: Arc<dyn CdpTransport>, bus: Arc<EventBus>, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            transport,
            bus,
            retry,
            state: RwLock::new(ManagerState::default()),
            listener: Mutex::new(None),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ManagerState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ManagerState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn transport(&self) -> &Arc<dyn CdpTransport> {
        &self.transport
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Subscribe to protocol events, enable target discovery and seed the
    /// target table from `Target.getTargets`
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut listener = self.listener.lock().unwrap_or_else(|p| p.into_inner());
            if listener.is_none() {
                let weak: Weak<SessionManager> = Arc::downgrade(self);
                let id = self.transport.on(
                    ANY_EVENT,
                    Arc::new(move |event| {
                        if let Some(manager) = weak.upgrade() {
                            manager.on_protocol_event(event);
                        }
                    }),
                );
                *listener = Some(id);
            }
        }

        self.send_browser("Target.setDiscoverTargets", json!({ "discover": true }))
            .await?;
        let count = self.refresh_targets().await?;
        info!("Session manager started with {} targets", count);
        Ok(())
    }

    /// Stop reacting to protocol events
    pub fn stop(&self) {
        let id = self
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(id) = id {
            self.transport.off(id);
        }
    }

    /// Apply one protocol event. Runs on the transport dispatch task.
    pub(crate) fn on_protocol_event(&self, event: CdpEvent) {
        match event.method.as_str() {
            "Target.targetCreated" => {
                if let Some(info) = target_info(&event.params) {
                    let target = Target::from_info(&info);
                    let created = self.write_state().track(target.clone());
                    if created {
                        debug!("Target created: {} ({})", target.target_id, target.kind.as_str());
                        self.bus.dispatch(BrowserEvent::TabCreated { target });
                    }
                }
            }
            "Target.targetInfoChanged" => {
                if let Some(info) = target_info(&event.params) {
                    let target = Target::from_info(&info);
                    let (target_id, url, title) = (target.target_id.clone(), target.url.clone(), target.title.clone());
                    let created = self.write_state().track(target.clone());
                    if created {
                        self.bus.dispatch(BrowserEvent::TabCreated { target });
                    } else {
                        self.bus
                            .dispatch(BrowserEvent::TabUpdated { target_id, url, title });
                    }
                }
            }
            "Target.targetDestroyed" | "Target.targetCrashed" => {
                if let Some(target_id) = event.params.get("targetId").and_then(Value::as_str) {
                    if self.write_state().forget(target_id).is_some() {
                        debug!("Target gone: {}", target_id);
                        self.bus.dispatch(BrowserEvent::TabClosed {
                            target_id: target_id.to_string(),
                        });
                    }
                }
            }
            "Target.attachedToTarget" => {
                let session_id = event.params.get("sessionId").and_then(Value::as_str);
                let info = target_info(&event.params);
                if let (Some(session_id), Some(info)) = (session_id, info) {
                    let mut state = self.write_state();
                    state.track(Target::from_info(&info));
                    if !state.retired.contains(session_id) && !state.sessions.contains_key(&info.target_id) {
                        state.adopt(Session::new(session_id.to_string(), info.target_id.clone()));
                    }
                }
            }
            "Target.detachedFromTarget" => {
                if let Some(session_id) = event.params.get("sessionId").and_then(Value::as_str) {
                    let target_id = self.write_state().retire(session_id);
                    debug!("Session detached: {} (target {:?})", session_id, target_id);
                    self.bus.dispatch(BrowserEvent::SessionDetached {
                        target_id,
                        session_id: session_id.to_string(),
                    });
                }
            }
            _ => self.on_session_event(event),
        }
    }

    fn on_session_event(&self, event: CdpEvent) {
        let target_id = event
            .session_id
            .as_deref()
            .and_then(|sid| self.target_for_session(sid));

        if let (Some(target_id), "Page.frameNavigated") = (target_id.as_deref(), event.method.as_str()) {
            let frame = event.params.get("frame");
            let is_main = frame.is_some_and(|f| f.get("parentId").is_none());
            if is_main {
                let url = frame
                    .and_then(|f| f.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let mut state = self.write_state();
                *state.nav_epochs.entry(target_id.to_string()).or_insert(0) += 1;
                if let Some(target) = state.targets.get_mut(target_id) {
                    target.url = url;
                }
            }
        }

        if let Some(translated) = BrowserEvent::from_protocol(&event, target_id.as_deref()) {
            self.bus.dispatch(translated);
        }
    }

    /// Live session for a target, if one is attached
    pub fn session_for_target(&self, target_id: &str) -> Option<Session> {
        self.read_state().sessions.get(target_id).cloned()
    }

    /// Target owning a live session id
    pub fn target_for_session(&self, session_id: &str) -> Option<String> {
        self.read_state().session_targets.get(session_id).cloned()
    }

    /// Whether the browser already detached this session id
    pub fn is_retired(&self, session_id: &str) -> bool {
        self.read_state().retired.contains(session_id)
    }

    pub fn get_target(&self, target_id: &str) -> Option<Target> {
        self.read_state().targets.get(target_id).cloned()
    }

    /// Return a live session for the target, attaching when none exists.
    ///
    /// Attaches for one target are serialized, so concurrent callers share a
    /// single `Target.attachToTarget` round trip.
    pub async fn get_or_create_session(&self, target_id: &str, focus: bool) -> Result<Session> {
        if let Some(session) = self.session_for_target(target_id) {
            if focus {
                self.set_focus(target_id);
            }
            return Ok(session);
        }

        let lock = Arc::clone(
            self.write_state()
                .attach_locks
                .entry(target_id.to_string())
                .or_default(),
        );
        let _guard = lock.lock().await;

        // another caller may have attached while we waited
        if let Some(session) = self.session_for_target(target_id) {
            if focus {
                self.set_focus(target_id);
            }
            return Ok(session);
        }

        let session = self.attach(target_id).await?;
        if focus {
            self.set_focus(target_id);
        }
        Ok(session)
    }

    async fn attach(&self, target_id: &str) -> Result<Session> {
        let result = self
            .send_browser(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await
            .map_err(|e| match e {
                Error::TargetGone(_) => {
                    self.forget_target(target_id);
                    Error::target_gone(target_id)
                }
                other => other,
            })?;

        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::internal("Target.attachToTarget returned no sessionId"))?
            .to_string();

        let session = Session::new(session_id.clone(), target_id.to_string());
        let kind = {
            let mut state = self.write_state();
            if state.retired.contains(&session_id) {
                return Err(Error::internal(format!(
                    "Browser reused detached session id {}",
                    session_id
                )));
            }
            state.adopt(session.clone());
            state
                .targets
                .get(target_id)
                .map(|t| t.kind)
                .unwrap_or(TargetKind::Page)
        };
        debug!("Attached session {} to target {}", session_id, target_id);

        if matches!(kind, TargetKind::Page | TargetKind::Iframe) {
            for method in ["Page.enable", "Runtime.enable"] {
                if let Err(e) = self.transport.send(method, json!({}), Some(&session_id)).await {
                    warn!("{} failed on session {}: {}", method, session_id, e);
                }
            }
        }

        self.bus.dispatch(BrowserEvent::SessionAttached {
            target_id: target_id.to_string(),
            session_id,
            kind,
        });
        Ok(session)
    }

    fn retire_session(&self, session_id: &str) {
        self.write_state().retire(session_id);
    }

    fn forget_target(&self, target_id: &str) {
        if self.write_state().forget(target_id).is_some() {
            self.bus.dispatch(BrowserEvent::TabClosed {
                target_id: target_id.to_string(),
            });
        }
    }

    fn set_focus(&self, target_id: &str) {
        let mut state = self.write_state();
        if state.focused.as_deref() != Some(target_id) {
            debug!("Focus moved to target {}", target_id);
            state.focused = Some(target_id.to_string());
        }
    }

    /// Send a command to a target's session.
    ///
    /// A stale session is re-attached and the command retried with backoff;
    /// a vanished target fails immediately with [`Error::TargetGone`].
    pub async fn send_to_target(&self, target_id: &str, method: &str, params: Value) -> Result<Value> {
        self.send_to_target_inner(target_id, method, params, None).await
    }

    /// [`send_to_target`](Self::send_to_target) with an explicit per-attempt timeout
    pub async fn send_to_target_with_timeout(
        &self,
        target_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.send_to_target_inner(target_id, method, params, Some(timeout))
            .await
    }

    async fn send_to_target_inner(
        &self,
        target_id: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let mut retries = 0u32;
        loop {
            let session = self.get_or_create_session(target_id, false).await?;
            let sid = Some(session.session_id.as_str());
            let result = match timeout {
                Some(timeout) => {
                    self.transport
                        .send_with_timeout(method, params.clone(), sid, timeout)
                        .await
                }
                None => self.transport.send(method, params.clone(), sid).await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_session_stale() => {
                    self.retire_session(&session.session_id);
                    if !self.retry.allows(retries) {
                        warn!("{} on {}: session still stale after {} retries", method, target_id, retries);
                        return Err(Error::session_stale(session.session_id));
                    }
                    let delay = self.retry.delay_for(retries);
                    retries += 1;
                    debug!(
                        "{} hit stale session {} on {}, retry {} in {:?}",
                        method, session.session_id, target_id, retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(Error::TargetGone(_)) => {
                    self.forget_target(target_id);
                    return Err(Error::target_gone(target_id));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a browser-level command (no session)
    pub async fn send_browser(&self, method: &str, params: Value) -> Result<Value> {
        self.transport.send(method, params, None).await
    }

    /// Point-in-time copy of the tracked targets, in discovery order.
    ///
    /// An empty `kinds` slice matches every kind.
    pub fn list_targets(&self, kinds: &[TargetKind], include_extensions: bool) -> Vec<Target> {
        let state = self.read_state();
        state
            .order
            .iter()
            .filter_map(|id| state.targets.get(id))
            .filter(|t| kinds.is_empty() || kinds.contains(&t.kind))
            .filter(|t| include_extensions || !t.is_extension())
            .cloned()
            .collect()
    }

    /// Page targets, excluding extensions
    pub fn pages(&self) -> Vec<Target> {
        self.list_targets(&[TargetKind::Page], false)
    }

    /// Re-query the browser and reconcile the target table.
    ///
    /// Returns the number of tracked targets afterwards.
    pub async fn refresh_targets(&self) -> Result<usize> {
        let result = self.send_browser("Target.getTargets", json!({})).await?;
        let infos: Vec<TargetInfo> = serde_json::from_value(
            result
                .get("targetInfos")
                .cloned()
                .unwrap_or_else(|| json!([])),
        )?;

        let live: HashSet<String> = infos.iter().map(|i| i.target_id.clone()).collect();
        let mut created = Vec::new();
        let mut closed = Vec::new();
        let count = {
            let mut state = self.write_state();
            for info in &infos {
                let target = Target::from_info(info);
                if state.track(target.clone()) {
                    created.push(target);
                }
            }
            let stale: Vec<String> = state
                .targets
                .keys()
                .filter(|id| !live.contains(*id))
                .cloned()
                .collect();
            for id in stale {
                state.forget(&id);
                closed.push(id);
            }
            state.targets.len()
        };

        for target in created {
            self.bus.dispatch(BrowserEvent::TabCreated { target });
        }
        for target_id in closed {
            self.bus.dispatch(BrowserEvent::TabClosed { target_id });
        }
        Ok(count)
    }

    /// Open a new page target
    #[instrument(skip(self))]
    pub async fn create_target(&self, url: &str, background: bool) -> Result<String> {
        let result = self
            .send_browser(
                "Target.createTarget",
                json!({ "url": url, "background": background }),
            )
            .await?;
        let target_id = result
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::internal("Target.createTarget returned no targetId"))?
            .to_string();

        // the targetCreated event may not have arrived yet
        let target = Target {
            target_id: target_id.clone(),
            kind: TargetKind::Page,
            url: url.to_string(),
            title: String::new(),
            opener_id: None,
        };
        if self.write_state().track(target.clone()) {
            self.bus.dispatch(BrowserEvent::TabCreated { target });
        }
        info!("Created target {} for {}", target_id, url);
        Ok(target_id)
    }

    /// Close a target
    #[instrument(skip(self))]
    pub async fn close_target(&self, target_id: &str) -> Result<()> {
        match self
            .send_browser("Target.closeTarget", json!({ "targetId": target_id }))
            .await
        {
            Ok(_) | Err(Error::TargetGone(_)) => {}
            Err(e) => return Err(e),
        }
        self.forget_target(target_id);
        Ok(())
    }

    /// Bring a target to the front and make it the focused target
    #[instrument(skip(self))]
    pub async fn focus_target(&self, target_id: &str) -> Result<Session> {
        let session = self.get_or_create_session(target_id, true).await?;
        if let Err(e) = self
            .send_browser("Target.activateTarget", json!({ "targetId": target_id }))
            .await
        {
            warn!("Target.activateTarget failed for {}: {}", target_id, e);
        }
        Ok(session)
    }

    /// Currently focused target id
    pub fn focused_target(&self) -> Option<String> {
        self.read_state().focused.clone()
    }

    /// Focused target id, or an error when nothing has focus
    pub fn require_focus(&self) -> Result<String> {
        self.focused_target()
            .ok_or_else(|| Error::target_gone("no focused target"))
    }

    /// Number of main-frame navigations committed in a target so far
    pub fn navigation_epoch(&self, target_id: &str) -> u64 {
        self.read_state()
            .nav_epochs
            .get(target_id)
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn attach_lock_count(&self) -> usize {
        self.read_state().attach_locks.len()
    }

    /// Detach the control connection from a target
    pub async fn detach(&self, target_id: &str) -> Result<()> {
        let Some(session) = self.session_for_target(target_id) else {
            return Ok(());
        };
        self.retire_session(&session.session_id);
        match self
            .send_browser(
                "Target.detachFromTarget",
                json!({ "sessionId": session.session_id }),
            )
            .await
        {
            Ok(_) | Err(Error::SessionStale(_)) | Err(Error::TargetGone(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn target_info(params: &Value) -> Option<TargetInfo> {
    let info = params.get("targetInfo")?;
    match serde_json::from_value(info.clone()) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!("Malformed targetInfo: {}", e);
            None
        }
    }
}
