//! Storage-state replay and capture
//!
//! The state file holds a `cookies` array and an `origins` array of
//! `{origin, localStorage[], sessionStorage[]}`. Cookies are set once per
//! browser; storage entries are written by an init script that only runs when
//! the document's origin is exactly the stored origin.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};
use tracing::{debug, info, instrument, warn};

use super::Watchdog;
use crate::bus::{BrowserEvent, EventKind};
use crate::session::{SessionManager, TargetKind};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Unix seconds; -1 for session cookies
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

impl Cookie {
    /// Parse a `Network.Cookie` from `Storage.getCookies`
    fn from_protocol(value: &Value) -> Option<Self> {
        Some(Self {
            name: value.get("name")?.as_str()?.to_string(),
            value: value.get("value")?.as_str()?.to_string(),
            domain: value.get("domain").and_then(Value::as_str).unwrap_or_default().to_string(),
            path: value.get("path").and_then(Value::as_str).unwrap_or("/").to_string(),
            expires: value
                .get("session")
                .and_then(Value::as_bool)
                .filter(|s| *s)
                .map(|_| -1.0)
                .or_else(|| value.get("expires").and_then(Value::as_f64))
                .unwrap_or(-1.0),
            http_only: value.get("httpOnly").and_then(Value::as_bool).unwrap_or(false),
            secure: value.get("secure").and_then(Value::as_bool).unwrap_or(false),
            same_site: value.get("sameSite").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// `Network.CookieParam` for `Storage.setCookies`
    fn to_protocol(&self) -> Value {
        let mut param = json!({
            "name": self.name,
            "value": self.value,
            "domain": self.domain,
            "path": self.path,
            "httpOnly": self.http_only,
            "secure": self.secure,
        });
        if self.expires >= 0.0 {
            param["expires"] = json!(self.expires);
        }
        if let Some(same_site) = &self.same_site {
            param["sameSite"] = json!(same_site);
        }
        param
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginState {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Vec<StorageEntry>,
    #[serde(default)]
    pub session_storage: Vec<StorageEntry>,
}

/// Persisted cookies and per-origin storage
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub origins: Vec<OriginState>,
}

impl StorageState {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }

    pub fn origin(&self, origin: &str) -> Option<&OriginState> {
        self.origins.iter().find(|o| o.origin == origin)
    }
}

/// Init script writing one origin's storage; a no-op on every other origin
pub fn init_script(origin: &OriginState) -> Result<String> {
    let pairs = |entries: &[StorageEntry]| -> Vec<(String, String)> {
        entries.iter().map(|e| (e.name.clone(), e.value.clone())).collect()
    };
    Ok(format!(
        r#"(() => {{
    if (window.location.origin !== {origin}) {{
        return;
    }}
    try {{
        for (const [name, value] of {local}) {{
            window.localStorage.setItem(name, value);
        }}
        for (const [name, value] of {session}) {{
            window.sessionStorage.setItem(name, value);
        }}
    }} catch (e) {{}}
}})();"#,
        origin = serde_json::to_string(&origin.origin)?,
        local = serde_json::to_string(&pairs(&origin.local_storage))?,
        session = serde_json::to_string(&pairs(&origin.session_storage))?,
    ))
}

/// Reads the active document's origin and both storages
const READ_STORAGE_JS: &str = r#"(() => {
    const dump = (storage) => {
        const entries = [];
        for (let i = 0; i < storage.length; i++) {
            const name = storage.key(i);
            entries.push({ name, value: storage.getItem(name) });
        }
        return entries;
    };
    try {
        return {
            origin: window.location.origin,
            localStorage: dump(window.localStorage),
            sessionStorage: dump(window.sessionStorage),
        };
    } catch (e) {
        return { origin: window.location.origin, localStorage: [], sessionStorage: [] };
    }
})()"#;

/// Replays a storage state into new sessions and captures it back
pub struct StorageWatchdog {
    manager: Weak<SessionManager>,
    state: Mutex<StorageState>,
    path: Option<PathBuf>,
    cookies_applied: AtomicBool,
}

impl StorageWatchdog {
    pub fn new(manager: Weak<SessionManager>, state: StorageState, path: Option<PathBuf>) -> Self {
        Self {
            manager,
            state: Mutex::new(state),
            path,
            cookies_applied: AtomicBool::new(false),
        }
    }

    /// Load the state file when it exists, else start empty
    pub async fn from_path(manager: Weak<SessionManager>, path: Option<PathBuf>) -> Result<Self> {
        let state = match &path {
            Some(p) if tokio::fs::try_exists(p).await.unwrap_or(false) => {
                let state = StorageState::load(p).await?;
                info!(
                    "Loaded storage state from {} ({} cookies, {} origins)",
                    p.display(),
                    state.cookies.len(),
                    state.origins.len()
                );
                state
            }
            _ => StorageState::default(),
        };
        Ok(Self::new(manager, state, path))
    }

    /// State that will be replayed into new sessions
    pub fn state(&self) -> StorageState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn manager(&self) -> Result<std::sync::Arc<SessionManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| Error::internal("session manager dropped"))
    }

    async fn replay(&self, target_id: &str) -> Result<()> {
        let manager = self.manager()?;
        let state = self.state();

        if !state.cookies.is_empty() && !self.cookies_applied.swap(true, Ordering::SeqCst) {
            let cookies: Vec<Value> = state.cookies.iter().map(Cookie::to_protocol).collect();
            if let Err(e) = manager
                .send_browser("Storage.setCookies", json!({ "cookies": cookies }))
                .await
            {
                self.cookies_applied.store(false, Ordering::SeqCst);
                return Err(e);
            }
            debug!("Replayed {} cookies", state.cookies.len());
        }

        for origin in &state.origins {
            if origin.local_storage.is_empty() && origin.session_storage.is_empty() {
                continue;
            }
            let source = init_script(origin)?;
            manager
                .send_to_target(
                    target_id,
                    "Page.addScriptToEvaluateOnNewDocument",
                    json!({ "source": source }),
                )
                .await?;
        }
        Ok(())
    }

    /// Capture cookies and the storage of every open page.
    ///
    /// Origins not open right now keep their previously stored entries. The
    /// result is written to the configured path, if any.
    #[instrument(skip(self))]
    pub async fn save(&self) -> Result<StorageState> {
        let manager = self.manager()?;

        let cookies = manager.send_browser("Storage.getCookies", json!({})).await?;
        let cookies: Vec<Cookie> = cookies
            .get("cookies")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Cookie::from_protocol).collect())
            .unwrap_or_default();

        let mut origins: BTreeMap<String, OriginState> = self
            .state()
            .origins
            .into_iter()
            .map(|o| (o.origin.clone(), o))
            .collect();

        for page in manager.pages() {
            let result = manager
                .send_to_target(
                    &page.target_id,
                    "Runtime.evaluate",
                    json!({ "expression": READ_STORAGE_JS, "returnByValue": true }),
                )
                .await;
            let value = match result {
                Ok(v) => v.pointer("/result/value").cloned().unwrap_or(Value::Null),
                Err(e) => {
                    warn!("Reading storage of {} failed: {}", page.target_id, e);
                    continue;
                }
            };
            let Ok(captured) = serde_json::from_value::<OriginState>(value) else {
                continue;
            };
            // opaque origins ("null") cannot be restored
            if captured.origin.is_empty() || captured.origin == "null" {
                continue;
            }
            origins.insert(captured.origin.clone(), captured);
        }

        let state = StorageState {
            cookies,
            origins: origins.into_values().collect(),
        };
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state.clone();

        if let Some(path) = &self.path {
            state.save(path).await?;
            info!("Saved storage state to {}", path.display());
        }
        Ok(state)
    }
}

#[async_trait]
impl Watchdog for StorageWatchdog {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn listens_to(&self) -> &'static [EventKind] {
        &[EventKind::SessionAttached]
    }

    async fn handle(&self, event: BrowserEvent) -> Result<()> {
        if let BrowserEvent::SessionAttached {
            target_id,
            kind: TargetKind::Page,
            ..
        } = event
        {
            self.replay(&target_id).await?;
        }
        Ok(())
    }
}
