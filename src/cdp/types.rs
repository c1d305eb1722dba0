//! CDP (Chrome DevTools Protocol) wire type definitions
//!
//! This module defines the JSON frames exchanged over the control connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// CDP JSON-RPC request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpRequest {
    /// Request ID
    pub id: u64,
    /// Method name (e.g., "Page.navigate")
    pub method: String,
    /// Method parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Session ID for flattened target sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// CDP error detail
#[derive(Debug, Clone, Deserialize)]
pub struct CdpErrorDetail {
    /// Error code
    pub code: i64,
    /// Error message
    pub message: String,
    /// Additional error data
    #[serde(default)]
    pub data: Option<Value>,
}

/// Any frame received from the browser, before classification
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingFrame {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<CdpErrorDetail>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Unsolicited protocol event
#[derive(Debug, Clone)]
pub struct CdpEvent {
    /// Event method (e.g., "Page.loadEventFired")
    pub method: String,
    /// Event parameters
    pub params: Value,
    /// Session the event was emitted on, `None` for browser-level events
    pub session_id: Option<String>,
}

impl CdpEvent {
    pub fn new<S: Into<String>>(method: S, params: Value, session_id: Option<String>) -> Self {
        Self {
            method: method.into(),
            params,
            session_id,
        }
    }

    /// Domain part of the method ("Page" for "Page.loadEventFired")
    pub fn domain(&self) -> &str {
        self.method.split('.').next().unwrap_or_default()
    }
}

/// Classified incoming frame
#[derive(Debug, Clone)]
pub enum CdpMessage {
    /// Response to a command we sent
    Response {
        id: u64,
        result: Value,
        error: Option<CdpErrorDetail>,
        session_id: Option<String>,
    },
    /// Event
    Event(CdpEvent),
}

impl IncomingFrame {
    /// Parse a text frame without serde_json's recursion limit; DOM payloads nest deeply.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let mut deserializer = serde_json::Deserializer::from_str(text);
        deserializer.disable_recursion_limit();
        let frame = IncomingFrame::deserialize(&mut deserializer)?;
        deserializer.end()?;
        Ok(frame)
    }

    /// Split into response or event; frames with neither id nor method are dropped
    pub fn classify(self) -> Option<CdpMessage> {
        match (self.id, self.method) {
            (Some(id), _) => Some(CdpMessage::Response {
                id,
                result: self.result.unwrap_or(Value::Null),
                error: self.error,
                session_id: self.session_id,
            }),
            (None, Some(method)) => Some(CdpMessage::Event(CdpEvent {
                method,
                params: self.params,
                session_id: self.session_id,
            })),
            (None, None) => None,
        }
    }
}

/// `Target.TargetInfo`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(default)]
    pub opener_id: Option<String>,
    #[serde(default)]
    pub browser_context_id: Option<String>,
}

/// Browser version information from `/json/version`
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserVersion {
    /// Product name
    #[serde(rename = "Browser", default)]
    pub product: String,
    /// Protocol version
    #[serde(rename = "Protocol-Version", default)]
    pub protocol_version: String,
    /// User agent
    #[serde(rename = "User-Agent", default)]
    pub user_agent: String,
    /// Browser-level WebSocket endpoint
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub web_socket_debugger_url: Option<String>,
}
