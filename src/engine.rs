//! Engine facade
//!
//! [`BrowserEngine`] wires transport, session manager, event bus, DOM service,
//! interaction engine and watchdogs together and exposes the three operations a
//! planner needs: [`get_state`](BrowserEngine::get_state),
//! [`execute`](BrowserEngine::execute) and [`subscribe`](BrowserEngine::subscribe).

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::bus::{BrowserEvent, BusConfig, EventBus, EventKind, SubscriptionId};
use crate::cdp::{discover_websocket_url, CdpTransport, CdpWebSocketConnection, CommandTimeouts};
use crate::config::Config;
use crate::dom::{DomService, DomSettings, ElementHandle, ElementSummary};
use crate::interaction::{ClickOutcome, InteractionEngine, InteractionSettings, NavigationPolicy, ScrollDirection};
use crate::launcher::{LaunchOptions, LocalBrowser};
use crate::ports::PortPool;
use crate::retry::RetryPolicy;
use crate::session::SessionManager;
use crate::watchdogs::{
    self, DialogRecord, DialogWatchdog, DownloadWatchdog, NetworkWatchdog, StorageWatchdog, TabsWatchdog, Watchdog,
};
use crate::{Error, Result};

fn default_scroll_amount() -> f64 {
    500.0
}

/// Everything a planner can ask the engine to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
        #[serde(default)]
        new_tab: bool,
    },
    Click {
        index: usize,
    },
    Type {
        index: usize,
        text: String,
        #[serde(default)]
        clear: bool,
    },
    Scroll {
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: f64,
        /// Scroll inside this element instead of the page
        #[serde(default)]
        index: Option<usize>,
    },
    PressKey {
        key: String,
    },
    GoBack,
    SwitchTab {
        target_id: String,
    },
    CloseTab {
        target_id: String,
    },
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::Scroll { .. } => "scroll",
            Action::PressKey { .. } => "press_key",
            Action::GoBack => "go_back",
            Action::SwitchTab { .. } => "switch_tab",
            Action::CloseTab { .. } => "close_tab",
        }
    }
}

/// Result of [`BrowserEngine::execute`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    /// Click outcome, for click actions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ClickOutcome>,
    /// URL of the focused page after the action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Error kind (`timeout`, `disallowed`, …) when the action failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    fn done(url: Option<String>) -> Self {
        Self {
            success: true,
            outcome: None,
            url,
            error_kind: None,
            error: None,
        }
    }

    fn clicked(outcome: ClickOutcome, url: Option<String>) -> Self {
        let error = match &outcome {
            ClickOutcome::Error(message) | ClickOutcome::Disallowed(message) => Some(message.clone()),
            _ => None,
        };
        let error_kind = match &outcome {
            ClickOutcome::Error(_) => Some("click_failed"),
            ClickOutcome::Disallowed(_) => Some("disallowed"),
            _ => None,
        };
        Self {
            success: outcome.is_success(),
            outcome: Some(outcome),
            url,
            error_kind,
            error,
        }
    }

    fn failed(error: &Error) -> Self {
        Self {
            success: false,
            outcome: None,
            url: None,
            error_kind: Some(error_kind(error)),
            error: Some(error.to_string()),
        }
    }
}

fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::Io(_) => "io",
        Error::Connection(_) => "connection",
        Error::Protocol { .. } => "protocol",
        Error::SessionStale(_) => "session_stale",
        Error::TargetGone(_) => "target_gone",
        Error::ElementNotFound(_) => "element_not_found",
        Error::ElementNotInteractable(_) => "element_not_interactable",
        Error::Timeout(_) => "timeout",
        Error::Disallowed(_) => "disallowed",
        Error::SnapshotInvalidated(_) => "snapshot_invalidated",
        Error::Http(_) => "http",
        Error::Serialization(_) => "serialization",
        Error::Configuration(_) => "configuration",
        Error::Internal(_) => "internal",
    }
}

/// One open page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabInfo {
    pub target_id: String,
    pub url: String,
    pub title: String,
    pub focused: bool,
}

/// What the planner sees of the browser
#[derive(Debug, Clone, Serialize)]
pub struct BrowserState {
    pub target_id: String,
    pub url: String,
    pub title: String,
    pub tabs: Vec<TabInfo>,
    /// Interactive elements of the focused page, by index
    pub element_index: Vec<ElementSummary>,
    /// PNG, base64 encoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub dialogs: Vec<DialogRecord>,
    pub downloads: Vec<PathBuf>,
}

/// The engine
pub struct BrowserEngine {
    config: Config,
    transport: Arc<dyn CdpTransport>,
    bus: Arc<EventBus>,
    manager: Arc<SessionManager>,
    dom: Arc<DomService>,
    interaction: InteractionEngine,
    network: Arc<NetworkWatchdog>,
    dialogs: Arc<DialogWatchdog>,
    storage: Option<Arc<StorageWatchdog>>,
    downloads: Option<Arc<DownloadWatchdog>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    local: tokio::sync::Mutex<Option<LocalBrowser>>,
}

impl std::fmt::Debug for BrowserEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserEngine")
            .field("focused", &self.manager.focused_target())
            .field("bus", &self.bus)
            .finish()
    }
}

impl BrowserEngine {
    /// Connect to the configured endpoint, or launch a local browser on a
    /// port from `pool` when none is set.
    ///
    /// Engines launched in the same process must share one pool.
    pub async fn start(config: Config, pool: &PortPool) -> Result<Self> {
        match config.cdp_endpoint.clone() {
            Some(endpoint) => Self::connect(&endpoint, config).await,
            None => Self::launch(config, pool).await,
        }
    }

    /// Connect to a running browser
    #[instrument(skip(config))]
    pub async fn connect(endpoint: &str, config: Config) -> Result<Self> {
        let ws_url = discover_websocket_url(endpoint, config.default_timeout()).await?;
        let connection = CdpWebSocketConnection::connect_with_timeouts(ws_url, command_timeouts(&config)).await?;
        Self::with_transport(connection, config).await
    }

    /// Launch a local browser on a port from `pool` and connect to it
    pub async fn launch(config: Config, pool: &PortPool) -> Result<Self> {
        let browser = LocalBrowser::launch(pool, &LaunchOptions::from_config(&config)).await?;
        let connection =
            CdpWebSocketConnection::connect_with_timeouts(browser.ws_url(), command_timeouts(&config)).await?;
        let engine = Self::with_transport(connection, config).await?;
        *engine.local.lock().await = Some(browser);
        Ok(engine)
    }

    /// Build the engine over an open transport.
    ///
    /// Watchdogs are attached before the session manager starts so they see
    /// the targets that already exist.
    pub async fn with_transport(transport: Arc<dyn CdpTransport>, config: Config) -> Result<Self> {
        config.validate()?;

        let bus = EventBus::new(BusConfig::from_config(&config));
        let manager = SessionManager::new(
            Arc::clone(&transport),
            Arc::clone(&bus),
            RetryPolicy::session_from_config(&config),
        );
        let dom = Arc::new(DomService::new(Arc::clone(&manager), DomSettings::from_config(&config)));
        let interaction = InteractionEngine::new(
            Arc::clone(&manager),
            Arc::clone(&dom),
            NavigationPolicy::from_config(&config),
            InteractionSettings::from_config(&config),
        );

        let weak = Arc::downgrade(&manager);
        let network = Arc::new(NetworkWatchdog::from_config(weak.clone(), &config));
        let dialogs = Arc::new(DialogWatchdog::new(weak.clone()));
        let tabs = Arc::new(TabsWatchdog::from_config(weak.clone(), &config));
        let storage = match &config.storage_state_path {
            Some(path) => Some(Arc::new(
                StorageWatchdog::from_path(weak.clone(), Some(PathBuf::from(path))).await?,
            )),
            None => None,
        };
        let downloads = config
            .downloads_path
            .as_ref()
            .map(|dir| Arc::new(DownloadWatchdog::new(weak.clone(), PathBuf::from(dir))));

        let mut attached: Vec<Arc<dyn Watchdog>> = vec![
            network.clone() as Arc<dyn Watchdog>,
            dialogs.clone() as Arc<dyn Watchdog>,
            tabs as Arc<dyn Watchdog>,
        ];
        if let Some(storage) = &storage {
            attached.push(storage.clone());
        }
        if let Some(downloads) = &downloads {
            attached.push(downloads.clone());
        }
        let subscriptions: Vec<SubscriptionId> = attached
            .into_iter()
            .flat_map(|watchdog| watchdogs::attach(watchdog, &bus))
            .collect();

        let engine = Self {
            config,
            transport,
            bus,
            manager,
            dom,
            interaction,
            network,
            dialogs,
            storage,
            downloads,
            subscriptions: Mutex::new(subscriptions),
            local: tokio::sync::Mutex::new(None),
        };

        engine.manager.start().await?;
        if let Some(downloads) = &engine.downloads {
            downloads.configure().await?;
        }
        engine.ensure_focus().await?;

        info!(
            "Engine ready, focused {:?}, {} pages",
            engine.manager.focused_target(),
            engine.manager.pages().len()
        );
        Ok(engine)
    }

    /// Make sure some page has focus, opening a blank one if the browser has none
    async fn ensure_focus(&self) -> Result<String> {
        // the tabs watchdog focuses discovered pages
        if let Err(e) = self.bus.wait_until_idle(self.config.default_timeout()).await {
            warn!("Event bus still busy at startup: {}", e);
        }
        if let Some(focused) = self.manager.focused_target() {
            return Ok(focused);
        }

        let target_id = match self.manager.pages().into_iter().last() {
            Some(page) => page.target_id,
            None => self.manager.create_target("about:blank", false).await?,
        };
        self.manager.focus_target(&target_id).await?;
        Ok(target_id)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn dom(&self) -> &Arc<DomService> {
        &self.dom
    }

    pub fn interaction(&self) -> &InteractionEngine {
        &self.interaction
    }

    pub fn network(&self) -> &Arc<NetworkWatchdog> {
        &self.network
    }

    pub fn storage(&self) -> Option<&Arc<StorageWatchdog>> {
        self.storage.as_ref()
    }

    pub fn downloads(&self) -> Option<&Arc<DownloadWatchdog>> {
        self.downloads.as_ref()
    }

    /// Snapshot the focused page
    #[instrument(skip(self))]
    pub async fn get_state(&self, include_screenshot: bool) -> Result<BrowserState> {
        let target_id = self.ensure_focus().await?;
        let tree = self.dom.snapshot(&target_id).await?;

        let screenshot = if include_screenshot {
            Some(self.capture_screenshot(&target_id).await?)
        } else {
            None
        };

        let target = self.manager.get_target(&target_id);
        let url = target
            .as_ref()
            .map(|t| t.url.clone())
            .unwrap_or_else(|| tree.url().to_string());
        let title = target.map(|t| t.title).unwrap_or_default();
        let tabs = self
            .manager
            .pages()
            .into_iter()
            .map(|page| TabInfo {
                focused: page.target_id == target_id,
                target_id: page.target_id,
                url: page.url,
                title: page.title,
            })
            .collect();

        Ok(BrowserState {
            target_id,
            url,
            title,
            tabs,
            element_index: tree.element_index(),
            screenshot,
            dialogs: self.dialogs.recent(),
            downloads: self
                .downloads
                .as_ref()
                .map(|d| d.completed())
                .unwrap_or_default(),
        })
    }

    /// PNG screenshot of the focused page
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let target_id = self.manager.require_focus()?;
        let data = self.capture_screenshot(&target_id).await?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::internal(format!("Invalid screenshot data: {}", e)))
    }

    async fn capture_screenshot(&self, target_id: &str) -> Result<String> {
        let result = self
            .manager
            .send_to_target(target_id, "Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        result
            .get("data")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::internal("Page.captureScreenshot returned no data"))
    }

    /// Navigate the focused page. Returns the committed URL.
    pub async fn navigate(&self, url: &str) -> Result<String> {
        self.interaction.navigate(url).await
    }

    /// Run one action. Failures are reported in the result, never as `Err`.
    #[instrument(skip(self, action), fields(action = action.name()))]
    pub async fn execute(&self, action: Action) -> ActionResult {
        debug!("Executing {:?}", action);
        let result = match action {
            Action::Click { index } => match self.interaction.click_index(index).await {
                Ok(outcome) => return ActionResult::clicked(outcome, self.focused_url()),
                Err(e) => Err(e),
            },
            other => self.run(other).await,
        };

        match result {
            Ok(()) => ActionResult::done(self.focused_url()),
            Err(e) => {
                warn!("Action failed: {}", e);
                let mut result = ActionResult::failed(&e);
                result.url = self.focused_url();
                result
            }
        }
    }

    async fn run(&self, action: Action) -> Result<()> {
        match action {
            Action::Navigate { url, new_tab: false } => self.interaction.navigate(&url).await.map(|_| ()),
            Action::Navigate { url, new_tab: true } => {
                self.interaction.policy().check(&url).map_err(Error::disallowed)?;
                let target_id = self.manager.create_target(&url, false).await?;
                self.manager.focus_target(&target_id).await?;
                Ok(())
            }
            Action::Click { index } => self.interaction.click_index(index).await.map(|_| ()),
            Action::Type { index, text, clear } => {
                let handle = self.handle_for(index).await?;
                self.interaction.type_text(&handle, &text, clear).await
            }
            Action::Scroll {
                direction,
                amount,
                index,
            } => {
                let handle = match index {
                    Some(index) => Some(self.handle_for(index).await?),
                    None => None,
                };
                self.interaction.scroll(direction, amount, handle.as_ref()).await
            }
            Action::PressKey { key } => self.interaction.press_key(&key).await,
            Action::GoBack => self.interaction.go_back().await.map(|_| ()),
            Action::SwitchTab { target_id } => {
                if self.manager.get_target(&target_id).is_none() {
                    return Err(Error::target_gone(target_id));
                }
                self.manager.focus_target(&target_id).await.map(|_| ())
            }
            Action::CloseTab { target_id } => {
                self.manager.close_target(&target_id).await?;
                self.ensure_focus().await.map(|_| ())
            }
        }
    }

    async fn handle_for(&self, index: usize) -> Result<ElementHandle> {
        let tree = self.interaction.current_tree(false).await?;
        tree.handle(index)
            .ok_or_else(|| Error::element_not_found(format!("index {}", index)))
    }

    fn focused_url(&self) -> Option<String> {
        self.manager
            .focused_target()
            .and_then(|id| self.manager.get_target(&id))
            .map(|t| t.url)
    }

    /// Run `handler` for every event of `kind`
    pub fn subscribe<F, Fut>(&self, kind: EventKind, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(BrowserEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.bus.on(kind, name, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.bus.off(id);
    }

    /// Stream of every event, for callers that prefer polling
    pub fn events(&self) -> broadcast::Receiver<BrowserEvent> {
        self.bus.subscribe()
    }

    /// Events of the given kinds as a stream; all kinds when `kinds` is empty.
    ///
    /// A slow consumer that falls behind the bus loses the oldest events.
    pub fn event_stream(&self, kinds: &[EventKind]) -> impl Stream<Item = BrowserEvent> + Send + 'static {
        let kinds = kinds.to_vec();
        BroadcastStream::new(self.bus.subscribe()).filter_map(move |item| match item {
            Ok(event) if kinds.is_empty() || kinds.contains(&event.kind()) => Some(event),
            Ok(_) => None,
            Err(e) => {
                warn!("Event stream lagged: {}", e);
                None
            }
        })
    }

    /// Save storage if configured, detach everything and close the browser
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if self.config.save_storage_state {
            if let Some(storage) = &self.storage {
                match storage.save().await {
                    Ok(state) => info!("Saved storage state ({} cookies)", state.cookies.len()),
                    Err(e) => warn!("Saving storage state failed: {}", e),
                }
            }
        }

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(|p| p.into_inner()));
        watchdogs::detach(&subscriptions, &self.bus);
        if let Err(e) = self.bus.wait_until_idle(self.config.default_timeout()).await {
            warn!("Event bus not idle at shutdown: {}", e);
        }
        self.manager.stop();

        if let Err(e) = self.transport.close().await {
            debug!("Closing transport: {}", e);
        }
        if let Some(browser) = self.local.lock().await.take() {
            browser.shutdown().await?;
        }
        info!("Engine shut down");
        Ok(())
    }
}

fn command_timeouts(config: &Config) -> CommandTimeouts {
    CommandTimeouts {
        default: config.default_timeout(),
        navigation: config.navigation_timeout(),
        ..CommandTimeouts::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_wire_format() {
        let action: Action = serde_json::from_value(json!({ "action": "click", "index": 3 })).unwrap();
        assert_eq!(action, Action::Click { index: 3 });

        let action: Action =
            serde_json::from_value(json!({ "action": "scroll", "direction": "down" })).unwrap();
        assert_eq!(
            action,
            Action::Scroll {
                direction: ScrollDirection::Down,
                amount: 500.0,
                index: None
            }
        );

        let action: Action = serde_json::from_value(json!({ "action": "go_back" })).unwrap();
        assert_eq!(action, Action::GoBack);

        assert!(serde_json::from_value::<Action>(json!({ "action": "fly" })).is_err());
    }

    #[test]
    fn test_click_results() {
        let result = ActionResult::clicked(ClickOutcome::NavigationTriggered("https://a.test/".into()), None);
        assert!(result.success);
        assert!(result.error.is_none());

        let result = ActionResult::clicked(ClickOutcome::Disallowed("https://evil.test/".into()), None);
        assert!(!result.success);
        assert_eq!(result.error_kind, Some("disallowed"));

        let result = ActionResult::failed(&Error::timeout("snapshot"));
        assert_eq!(result.error_kind, Some("timeout"));
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(wire["success"], false);
        assert!(wire.get("outcome").is_none());
    }
}
