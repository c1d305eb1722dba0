//! Common test utilities
//!
//! [`FakeBrowser`] answers protocol commands from a small in-memory browser:
//! tabs with navigation history, one fixed page layout, sessions that can be
//! made stale on demand, cookies and a download directory.
//!
//! Page layout (interactive index -> element):
//! 1. `button` "Go" (no side effect)
//! 2. `a` "Next" (navigates to the configured link target)
//! 3. `button` "Download" (downloads `report.pdf`)
//! 4. `input` text field

#![allow(dead_code)]

use chaser_engine::cdp::{MockCall, MockEmitter, MockReply, MockTransport};
use chaser_engine::config::Config;
use chaser_engine::BrowserEngine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const START_URL: &str = "https://example.com/";

/// 1x1 transparent PNG
pub const PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg==";

const BOXES: &[(i64, [f64; 4])] = &[
    (2, [0.0, 0.0, 1280.0, 800.0]),
    (4, [0.0, 0.0, 1280.0, 800.0]),
    (5, [10.0, 10.0, 80.0, 20.0]),
    (7, [10.0, 40.0, 80.0, 20.0]),
    (9, [10.0, 70.0, 80.0, 20.0]),
    (13, [10.0, 130.0, 200.0, 20.0]),
];

#[derive(Debug, Clone)]
pub struct Tab {
    pub target_id: String,
    pub history: Vec<String>,
    pub current: usize,
}

impl Tab {
    fn new(target_id: &str, url: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            history: vec![url.to_string()],
            current: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.history[self.current]
    }
}

#[derive(Debug, Default)]
struct State {
    tabs: Vec<Tab>,
    /// session id -> target id
    sessions: HashMap<String, String>,
    /// target id -> live session id
    live: HashMap<String, String>,
    next_session: u32,
    next_target: u32,
    /// method -> number of stale replies still to give
    stale: HashMap<String, u32>,
    link_target: String,
    last_resolved: i64,
    download_dir: Option<PathBuf>,
    cookies: Vec<Value>,
    local_storage: Vec<(String, String)>,
}

impl State {
    fn tab_mut(&mut self, target_id: &str) -> Option<&mut Tab> {
        self.tabs.iter_mut().find(|t| t.target_id == target_id)
    }

    fn target_of(&self, call: &MockCall) -> Option<String> {
        call.session_id
            .as_ref()
            .and_then(|sid| self.sessions.get(sid))
            .cloned()
    }

    fn url_of(&self, target_id: &str) -> String {
        self.tabs
            .iter()
            .find(|t| t.target_id == target_id)
            .map(|t| t.url().to_string())
            .unwrap_or_default()
    }

    fn emit_committed(&self, target_id: &str, emitter: &MockEmitter) {
        let url = self.url_of(target_id);
        let session = self.live.get(target_id).cloned();
        emitter.emit_after(
            Duration::from_millis(30),
            "Page.frameNavigated",
            json!({ "frame": { "id": target_id, "url": url } }),
            session.as_deref(),
        );
    }

    fn commit(&mut self, target_id: &str, url: &str, emitter: &MockEmitter) {
        if let Some(tab) = self.tab_mut(target_id) {
            tab.history.truncate(tab.current + 1);
            tab.history.push(url.to_string());
            tab.current = tab.history.len() - 1;
        }
        self.emit_committed(target_id, emitter);
    }
}

/// Scriptable in-memory browser
#[derive(Clone)]
pub struct FakeBrowser {
    pub mock: Arc<MockTransport>,
    state: Arc<Mutex<State>>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State {
            tabs: vec![Tab::new("T1", START_URL)],
            next_session: 1,
            next_target: 2,
            link_target: "https://example.com/next".to_string(),
            ..Default::default()
        }));
        let responder_state = Arc::clone(&state);
        let mock = MockTransport::with_responder(move |call, emitter| {
            let mut state = responder_state.lock().unwrap();
            respond(&mut state, call, emitter)
        });
        Self { mock, state }
    }

    /// Start an engine over this browser
    pub async fn engine(&self, config: Config) -> BrowserEngine {
        BrowserEngine::with_transport(self.mock.clone(), config)
            .await
            .expect("engine starts")
    }

    pub fn set_link_target(&self, url: &str) {
        self.state.lock().unwrap().link_target = url.to_string();
    }

    /// Answer the next `times` calls of `method` with a stale-session error
    pub fn fail_stale(&self, method: &str, times: u32) {
        self.state.lock().unwrap().stale.insert(method.to_string(), times);
    }

    pub fn set_local_storage(&self, entries: &[(&str, &str)]) {
        self.state.lock().unwrap().local_storage = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    pub fn set_cookies(&self, cookies: Vec<Value>) {
        self.state.lock().unwrap().cookies = cookies;
    }

    pub fn cookies(&self) -> Vec<Value> {
        self.state.lock().unwrap().cookies.clone()
    }

    pub fn url(&self, target_id: &str) -> String {
        self.state.lock().unwrap().url_of(target_id)
    }

    pub fn tab(&self, target_id: &str) -> Option<Tab> {
        self.state
            .lock()
            .unwrap()
            .tabs
            .iter()
            .find(|t| t.target_id == target_id)
            .cloned()
    }

    /// A page opens a new window
    pub fn open_popup(&self, opener: &str, url: &str) -> String {
        let target_id = {
            let mut state = self.state.lock().unwrap();
            let target_id = format!("T{}", state.next_target);
            state.next_target += 1;
            state.tabs.push(Tab::new(&target_id, url));
            target_id
        };
        self.mock.emit(
            "Target.targetCreated",
            json!({ "targetInfo": {
                "targetId": target_id, "type": "page", "url": url, "title": "", "openerId": opener
            }}),
            None,
        );
        target_id
    }

    /// The page shows an alert
    pub fn open_dialog(&self, target_id: &str, message: &str) {
        let session = self.state.lock().unwrap().live.get(target_id).cloned();
        self.mock.emit(
            "Page.javascriptDialogOpening",
            json!({ "type": "alert", "message": message, "url": START_URL, "hasBrowserHandler": false }),
            session.as_deref(),
        );
    }
}

/// Config with timeouts short enough for tests
pub fn config() -> Config {
    Config {
        default_timeout: 3000,
        navigation_timeout: 3000,
        snapshot_timeout: 3000,
        navigation_race_timeout_ms: 400,
        download_start_timeout_ms: 300,
        download_timeout_ms: 3000,
        click_retry_delay_ms: 10,
        session_retry_base_ms: 5,
        typing_delay_ms: Some(0),
        bus_handler_timeout: 3000,
        ..Default::default()
    }
}

/// Poll `check` for up to two seconds
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn element(backend: i64, tag: &str, attrs: &[(&str, &str)], children: Vec<Value>) -> Value {
    let flat: Vec<&str> = attrs.iter().flat_map(|(k, v)| [*k, *v]).collect();
    json!({
        "nodeId": backend,
        "backendNodeId": backend,
        "nodeType": 1,
        "nodeName": tag.to_uppercase(),
        "localName": tag,
        "attributes": flat,
        "children": children,
    })
}

fn text(backend: i64, value: &str) -> Value {
    json!({ "nodeId": backend, "backendNodeId": backend, "nodeType": 3, "nodeName": "#text", "nodeValue": value })
}

fn document(url: &str) -> Value {
    json!({
        "nodeId": 1,
        "backendNodeId": 1,
        "nodeType": 9,
        "nodeName": "#document",
        "documentURL": url,
        "children": [element(2, "html", &[], vec![element(4, "body", &[], vec![
            element(5, "button", &[("id", "go")], vec![text(6, "Go")]),
            element(7, "a", &[("href", "/next")], vec![text(8, "Next")]),
            element(9, "button", &[("id", "download")], vec![text(10, "Download")]),
            element(13, "input", &[("type", "text"), ("name", "q")], vec![]),
        ])])],
    })
}

fn layout() -> Value {
    json!({
        "strings": ["block", "visible", "1", "auto", "auto"],
        "documents": [{
            "nodes": { "backendNodeId": BOXES.iter().map(|b| b.0).collect::<Vec<_>>() },
            "layout": {
                "nodeIndex": (0..BOXES.len()).collect::<Vec<_>>(),
                "bounds": BOXES.iter().map(|b| b.1).collect::<Vec<_>>(),
                "styles": BOXES.iter().map(|_| [0, 1, 2, 3, 4]).collect::<Vec<_>>(),
            }
        }]
    })
}

fn quad(backend: i64) -> Value {
    match BOXES.iter().find(|b| b.0 == backend) {
        Some((_, [x, y, w, h])) => json!({ "quads": [[x, y, x + w, y, x + w, y + h, x, y + h]] }),
        None => json!({ "quads": [] }),
    }
}

fn origin(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.origin().ascii_serialization())
        .unwrap_or_else(|_| "null".to_string())
}

fn respond(state: &mut State, call: &MockCall, emitter: &MockEmitter) -> MockReply {
    if call.session_id.is_some() {
        if let Some(left) = state.stale.get_mut(&call.method) {
            if *left > 0 {
                *left -= 1;
                return MockReply::stale_session();
            }
        }
    }

    let target = state.target_of(call).unwrap_or_default();

    match call.method.as_str() {
        "Target.getTargets" => {
            let infos: Vec<Value> = state
                .tabs
                .iter()
                .map(|t| json!({ "targetId": t.target_id, "type": "page", "url": t.url(), "title": "Fake page" }))
                .collect();
            MockReply::Result(json!({ "targetInfos": infos }))
        }
        "Target.attachToTarget" => {
            let target_id = call.params["targetId"].as_str().unwrap_or_default().to_string();
            if !state.tabs.iter().any(|t| t.target_id == target_id) {
                return MockReply::error(-32602, "No target with given id found");
            }
            let session_id = format!("S{}", state.next_session);
            state.next_session += 1;
            state.sessions.insert(session_id.clone(), target_id.clone());
            state.live.insert(target_id, session_id.clone());
            MockReply::Result(json!({ "sessionId": session_id }))
        }
        "Target.createTarget" => {
            let url = call.params["url"].as_str().unwrap_or("about:blank").to_string();
            let target_id = format!("T{}", state.next_target);
            state.next_target += 1;
            state.tabs.push(Tab::new(&target_id, &url));
            emitter.emit(
                "Target.targetCreated",
                json!({ "targetInfo": { "targetId": target_id, "type": "page", "url": url, "title": "" } }),
                None,
            );
            MockReply::Result(json!({ "targetId": target_id }))
        }
        "Target.closeTarget" => {
            let target_id = call.params["targetId"].as_str().unwrap_or_default().to_string();
            state.tabs.retain(|t| t.target_id != target_id);
            state.live.remove(&target_id);
            emitter.emit_after(
                Duration::from_millis(10),
                "Target.targetDestroyed",
                json!({ "targetId": target_id }),
                None,
            );
            MockReply::Result(json!({ "success": true }))
        }
        "Browser.setDownloadBehavior" => {
            state.download_dir = call.params["downloadPath"].as_str().map(PathBuf::from);
            MockReply::ok()
        }
        "DOM.getDocument" => MockReply::Result(json!({ "root": document(&state.url_of(&target)) })),
        "DOMSnapshot.captureSnapshot" => MockReply::Result(layout()),
        "Accessibility.getFullAXTree" => MockReply::Result(json!({ "nodes": [] })),
        "DOM.resolveNode" => {
            let backend = call.params["backendNodeId"].as_i64().unwrap_or_default();
            state.last_resolved = backend;
            MockReply::Result(json!({ "object": { "objectId": format!("obj-{}", backend) } }))
        }
        "DOM.getContentQuads" => MockReply::Result(quad(call.params["backendNodeId"].as_i64().unwrap_or_default())),
        "Runtime.callFunctionOn" => {
            let function = call.params["functionDeclaration"].as_str().unwrap_or_default();
            if function.contains("connected") {
                MockReply::Result(json!({ "result": { "type": "object", "value": {
                    "connected": true, "visible": true, "enabled": true
                }}}))
            } else {
                MockReply::Result(json!({ "result": { "type": "undefined" } }))
            }
        }
        "Runtime.evaluate" => {
            let expression = call.params["expression"].as_str().unwrap_or_default();
            if expression.contains("localStorage") && expression.contains("sessionStorage") {
                let entries: Vec<Value> = state
                    .local_storage
                    .iter()
                    .map(|(name, value)| json!({ "name": name, "value": value }))
                    .collect();
                MockReply::Result(json!({ "result": { "type": "object", "value": {
                    "origin": origin(&state.url_of(&target)),
                    "localStorage": entries,
                    "sessionStorage": []
                }}}))
            } else {
                MockReply::Result(json!({ "result": { "type": "undefined" } }))
            }
        }
        "Input.dispatchMouseEvent" => {
            if call.params["type"] == "mouseReleased" {
                match state.last_resolved {
                    7 => {
                        let url = state.link_target.clone();
                        state.commit(&target, &url, emitter);
                    }
                    9 => start_download(state, emitter),
                    _ => {}
                }
            }
            MockReply::ok()
        }
        "Page.navigate" => {
            let url = call.params["url"].as_str().unwrap_or_default().to_string();
            state.commit(&target, &url, emitter);
            MockReply::Result(json!({ "frameId": target, "loaderId": "L1" }))
        }
        "Page.getNavigationHistory" => {
            let Some(tab) = state.tabs.iter().find(|t| t.target_id == target) else {
                return MockReply::error(-32000, "No target with given id found");
            };
            let entries: Vec<Value> = tab
                .history
                .iter()
                .enumerate()
                .map(|(i, url)| json!({ "id": i as i64 + 100, "url": url, "title": "" }))
                .collect();
            MockReply::Result(json!({ "currentIndex": tab.current, "entries": entries }))
        }
        "Page.navigateToHistoryEntry" => {
            let index = (call.params["entryId"].as_i64().unwrap_or(100) - 100).max(0) as usize;
            if let Some(tab) = state.tab_mut(&target) {
                tab.current = index.min(tab.history.len() - 1);
            }
            state.emit_committed(&target, emitter);
            MockReply::ok()
        }
        "Page.captureScreenshot" => MockReply::Result(json!({ "data": PNG_BASE64 })),
        "Page.getLayoutMetrics" => MockReply::Result(json!({
            "cssLayoutViewport": { "clientWidth": 1280, "clientHeight": 800 }
        })),
        "Storage.getCookies" => MockReply::Result(json!({ "cookies": state.cookies })),
        "Storage.setCookies" => {
            if let Some(cookies) = call.params["cookies"].as_array() {
                state.cookies.extend(cookies.iter().cloned());
            }
            MockReply::ok()
        }
        _ => MockReply::ok(),
    }
}

fn start_download(state: &mut State, emitter: &MockEmitter) {
    let Some(dir) = state.download_dir.clone() else {
        return;
    };
    std::fs::write(dir.join("g1"), b"%PDF-1.4").unwrap();
    emitter.emit_after(
        Duration::from_millis(20),
        "Browser.downloadWillBegin",
        json!({ "guid": "g1", "url": "https://example.com/report.pdf", "suggestedFilename": "report.pdf" }),
        None,
    );
    emitter.emit_after(
        Duration::from_millis(60),
        "Browser.downloadProgress",
        json!({ "guid": "g1", "state": "completed", "receivedBytes": 8, "totalBytes": 8 }),
        None,
    );
}
