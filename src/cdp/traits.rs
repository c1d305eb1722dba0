//! CDP (Chrome DevTools Protocol) layer traits
//!
//! This module defines the abstract interface for the control connection.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::types::CdpEvent;

/// Event handler invoked once per matching event frame
pub type EventHandler = Arc<dyn Fn(CdpEvent) + Send + Sync>;

/// Registration token returned by [`CdpTransport::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Method name that matches every event
pub const ANY_EVENT: &str = "*";

/// CDP transport trait
///
/// One physical connection to the browser. Commands are correlated by a locally
/// generated id; unsolicited events are fanned out to registered handlers.
#[async_trait]
pub trait CdpTransport: Send + Sync + std::fmt::Debug {
    /// Send a command and wait for its result.
    ///
    /// `session_id` addresses a flattened target session; `None` talks to the browser.
    async fn send(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value, crate::Error>;

    /// Same as [`send`](Self::send) with an explicit timeout instead of the per-method default
    async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Value, crate::Error>;

    /// Register a handler for `method` (or [`ANY_EVENT`]).
    ///
    /// Handlers run on the transport's dispatch task in arrival order, never on the read loop.
    fn on(&self, method: &str, handler: EventHandler) -> HandlerId;

    /// Remove a handler registered with [`on`](Self::on)
    fn off(&self, id: HandlerId);

    /// Stream of every event received on this connection
    fn subscribe(&self) -> broadcast::Receiver<CdpEvent>;

    /// Close the connection
    async fn close(&self) -> Result<(), crate::Error>;

    /// Check if connection is active
    fn is_active(&self) -> bool;
}

/// Per-method default command timeouts
#[derive(Debug, Clone)]
pub struct CommandTimeouts {
    /// Default timeout for most commands
    pub default: Duration,
    /// Timeout for screenshot commands
    pub screenshot: Duration,
    /// Timeout for page navigation commands
    pub navigation: Duration,
    /// Timeout for JavaScript execution and DOM capture
    pub execution: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(30),
            screenshot: Duration::from_secs(90),
            navigation: Duration::from_secs(60),
            execution: Duration::from_secs(30),
        }
    }
}

impl CommandTimeouts {
    /// Get timeout duration for a specific command method
    pub fn for_method(&self, method: &str) -> Duration {
        match method {
            "Page.captureScreenshot" | "Page.printToPDF" => self.screenshot,
            "Page.navigate" | "Page.reload" | "Page.navigateToHistoryEntry" => self.navigation,
            m if m.starts_with("Runtime.") || m.starts_with("DOMSnapshot.") || m == "DOM.getDocument" => {
                self.execution
            }
            _ => self.default,
        }
    }
}
