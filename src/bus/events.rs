//! Closed set of engine events
//!
//! Every event carried on the bus is one variant of [`BrowserEvent`]; handlers
//! subscribe by [`EventKind`] and match on the variant.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::cdp::CdpEvent;
use crate::session::{Target, TargetKind};

/// State reported by download progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    InProgress,
    Completed,
    Canceled,
}

/// Engine event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserEvent {
    /// A target was discovered, whoever created it
    TabCreated { target: Target },
    /// A target was destroyed
    TabClosed { target_id: String },
    /// Target URL or title changed
    TabUpdated { target_id: String, url: String, title: String },
    /// A session was attached to a target
    SessionAttached { target_id: String, session_id: String, kind: TargetKind },
    /// The browser detached a session
    SessionDetached { target_id: Option<String>, session_id: String },
    /// Main frame asked to navigate
    NavigationStarted { target_id: String, url: String },
    /// Main frame committed a navigation
    NavigationCompleted { target_id: String, url: String, same_document: bool },
    /// Main frame load event fired
    PageLoaded { target_id: String },
    /// A native dialog (alert/confirm/prompt/beforeunload) opened
    DialogOpened {
        target_id: String,
        session_id: String,
        dialog_type: String,
        message: String,
        default_prompt: Option<String>,
    },
    /// The browser began a download
    DownloadStarted { guid: String, url: String, suggested_filename: String },
    /// Download progress
    DownloadProgress {
        guid: String,
        state: DownloadState,
        received_bytes: u64,
        total_bytes: u64,
    },
    /// Download finished and was saved
    DownloadCompleted { guid: String, path: PathBuf },
    /// A request was sent
    NetworkRequest {
        target_id: String,
        request_id: String,
        method: String,
        url: String,
        resource_type: String,
        headers: BTreeMap<String, String>,
        timestamp: f64,
    },
    /// Response headers were received
    NetworkResponse {
        target_id: String,
        request_id: String,
        status: u16,
        status_text: String,
        mime_type: String,
        headers: BTreeMap<String, String>,
        timestamp: f64,
    },
    /// Response body finished loading
    NetworkFinished { target_id: String, request_id: String, timestamp: f64 },
    /// Request failed
    NetworkFailed {
        target_id: String,
        request_id: String,
        error_text: String,
        canceled: bool,
        timestamp: f64,
    },
    /// A subsystem asks for a navigation (`target_id` None means the focused tab)
    NavigateRequested { target_id: Option<String>, url: String, new_tab: bool },
    /// A subsystem asks to focus another tab
    SwitchTabRequested { target_id: String },
    /// A subsystem asks to close a tab
    CloseTabRequested { target_id: String },
}

/// Discriminant of [`BrowserEvent`], used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TabCreated,
    TabClosed,
    TabUpdated,
    SessionAttached,
    SessionDetached,
    NavigationStarted,
    NavigationCompleted,
    PageLoaded,
    DialogOpened,
    DownloadStarted,
    DownloadProgress,
    DownloadCompleted,
    NetworkRequest,
    NetworkResponse,
    NetworkFinished,
    NetworkFailed,
    NavigateRequested,
    SwitchTabRequested,
    CloseTabRequested,
}

impl BrowserEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            BrowserEvent::TabCreated { .. } => EventKind::TabCreated,
            BrowserEvent::TabClosed { .. } => EventKind::TabClosed,
            BrowserEvent::TabUpdated { .. } => EventKind::TabUpdated,
            BrowserEvent::SessionAttached { .. } => EventKind::SessionAttached,
            BrowserEvent::SessionDetached { .. } => EventKind::SessionDetached,
            BrowserEvent::NavigationStarted { .. } => EventKind::NavigationStarted,
            BrowserEvent::NavigationCompleted { .. } => EventKind::NavigationCompleted,
            BrowserEvent::PageLoaded { .. } => EventKind::PageLoaded,
            BrowserEvent::DialogOpened { .. } => EventKind::DialogOpened,
            BrowserEvent::DownloadStarted { .. } => EventKind::DownloadStarted,
            BrowserEvent::DownloadProgress { .. } => EventKind::DownloadProgress,
            BrowserEvent::DownloadCompleted { .. } => EventKind::DownloadCompleted,
            BrowserEvent::NetworkRequest { .. } => EventKind::NetworkRequest,
            BrowserEvent::NetworkResponse { .. } => EventKind::NetworkResponse,
            BrowserEvent::NetworkFinished { .. } => EventKind::NetworkFinished,
            BrowserEvent::NetworkFailed { .. } => EventKind::NetworkFailed,
            BrowserEvent::NavigateRequested { .. } => EventKind::NavigateRequested,
            BrowserEvent::SwitchTabRequested { .. } => EventKind::SwitchTabRequested,
            BrowserEvent::CloseTabRequested { .. } => EventKind::CloseTabRequested,
        }
    }

    /// Target the event concerns, when it concerns one
    pub fn target_id(&self) -> Option<&str> {
        match self {
            BrowserEvent::TabCreated { target } => Some(&target.target_id),
            BrowserEvent::TabClosed { target_id }
            | BrowserEvent::TabUpdated { target_id, .. }
            | BrowserEvent::SessionAttached { target_id, .. }
            | BrowserEvent::NavigationStarted { target_id, .. }
            | BrowserEvent::NavigationCompleted { target_id, .. }
            | BrowserEvent::PageLoaded { target_id }
            | BrowserEvent::DialogOpened { target_id, .. }
            | BrowserEvent::NetworkRequest { target_id, .. }
            | BrowserEvent::NetworkResponse { target_id, .. }
            | BrowserEvent::NetworkFinished { target_id, .. }
            | BrowserEvent::NetworkFailed { target_id, .. }
            | BrowserEvent::SwitchTabRequested { target_id }
            | BrowserEvent::CloseTabRequested { target_id } => Some(target_id),
            BrowserEvent::SessionDetached { target_id, .. } | BrowserEvent::NavigateRequested { target_id, .. } => {
                target_id.as_deref()
            }
            BrowserEvent::DownloadStarted { .. }
            | BrowserEvent::DownloadProgress { .. }
            | BrowserEvent::DownloadCompleted { .. } => None,
        }
    }

    /// Translate a page/network/browser protocol event.
    ///
    /// `target_id` is the target owning the event's session; session-scoped
    /// events from unknown sessions are dropped. `Target.*` events are handled
    /// by the session manager, not here.
    pub fn from_protocol(event: &CdpEvent, target_id: Option<&str>) -> Option<BrowserEvent> {
        let p = &event.params;

        // browser-level events (no session needed)
        match event.method.as_str() {
            "Browser.downloadWillBegin" | "Page.downloadWillBegin" => {
                return Some(BrowserEvent::DownloadStarted {
                    guid: str_field(p, "guid"),
                    url: str_field(p, "url"),
                    suggested_filename: str_field(p, "suggestedFilename"),
                })
            }
            "Browser.downloadProgress" | "Page.downloadProgress" => {
                let state = match p.get("state").and_then(Value::as_str) {
                    Some("completed") => DownloadState::Completed,
                    Some("canceled") => DownloadState::Canceled,
                    _ => DownloadState::InProgress,
                };
                return Some(BrowserEvent::DownloadProgress {
                    guid: str_field(p, "guid"),
                    state,
                    received_bytes: p.get("receivedBytes").and_then(Value::as_f64).unwrap_or(0.0) as u64,
                    total_bytes: p.get("totalBytes").and_then(Value::as_f64).unwrap_or(0.0) as u64,
                });
            }
            _ => {}
        }

        let target_id = target_id?.to_string();

        match event.method.as_str() {
            "Page.frameNavigated" => {
                let frame = p.get("frame")?;
                if frame.get("parentId").is_some() {
                    return None;
                }
                Some(BrowserEvent::NavigationCompleted {
                    target_id,
                    url: str_field(frame, "url") + frame.get("urlFragment").and_then(Value::as_str).unwrap_or(""),
                    same_document: false,
                })
            }
            "Page.navigatedWithinDocument" => {
                if p.get("frameId").and_then(Value::as_str) != Some(target_id.as_str()) {
                    return None;
                }
                Some(BrowserEvent::NavigationCompleted {
                    url: str_field(p, "url"),
                    target_id,
                    same_document: true,
                })
            }
            "Page.frameRequestedNavigation" => {
                if p.get("frameId").and_then(Value::as_str) != Some(target_id.as_str()) {
                    return None;
                }
                Some(BrowserEvent::NavigationStarted {
                    url: str_field(p, "url"),
                    target_id,
                })
            }
            "Page.loadEventFired" => Some(BrowserEvent::PageLoaded { target_id }),
            "Page.javascriptDialogOpening" => Some(BrowserEvent::DialogOpened {
                target_id,
                session_id: event.session_id.clone().unwrap_or_default(),
                dialog_type: str_field(p, "type"),
                message: str_field(p, "message"),
                default_prompt: p.get("defaultPrompt").and_then(Value::as_str).map(str::to_string),
            }),
            "Network.requestWillBeSent" => {
                let request = p.get("request")?;
                Some(BrowserEvent::NetworkRequest {
                    target_id,
                    request_id: str_field(p, "requestId"),
                    method: str_field(request, "method"),
                    url: str_field(request, "url"),
                    resource_type: p
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("Other")
                        .to_string(),
                    headers: header_map(request.get("headers")),
                    timestamp: p.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0),
                })
            }
            "Network.responseReceived" => {
                let response = p.get("response")?;
                let headers = header_map(response.get("headers"));
                Some(BrowserEvent::NetworkResponse {
                    target_id,
                    request_id: str_field(p, "requestId"),
                    status: response.get("status").and_then(Value::as_u64).unwrap_or(0) as u16,
                    status_text: str_field(response, "statusText"),
                    mime_type: str_field(response, "mimeType"),
                    headers,
                    timestamp: p.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0),
                })
            }
            "Network.loadingFinished" => Some(BrowserEvent::NetworkFinished {
                target_id,
                request_id: str_field(p, "requestId"),
                timestamp: p.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0),
            }),
            "Network.loadingFailed" => Some(BrowserEvent::NetworkFailed {
                target_id,
                request_id: str_field(p, "requestId"),
                error_text: str_field(p, "errorText"),
                canceled: p.get("canceled").and_then(Value::as_bool).unwrap_or(false),
                timestamp: p.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0),
            }),
            _ => None,
        }
    }
}

/// Protocol `Headers` object; non-string values keep their JSON text
fn header_map(headers: Option<&Value>) -> BTreeMap<String, String> {
    headers
        .and_then(Value::as_object)
        .map(|h| {
            h.iter()
                .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
