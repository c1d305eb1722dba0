//! CDP WebSocket connection implementation
//!
//! This module provides the WebSocket-based control connection to the browser.

use super::router::EventRouter;
use super::traits::{CdpTransport, CommandTimeouts, EventHandler, HandlerId};
use super::types::{CdpErrorDetail, CdpEvent, CdpMessage, CdpRequest, IncomingFrame};
use crate::Error;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Pending command response
#[derive(Debug)]
struct PendingCommand {
    /// Response channel sender
    sender: oneshot::Sender<Result<Value, Error>>,
    /// Command method (for logging and error classification)
    method: String,
    /// Session the command was sent on
    session_id: Option<String>,
}

/// Table of commands waiting for their response
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    inner: std::sync::Mutex<HashMap<u64, PendingCommand>>,
}

impl PendingCalls {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCommand>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, id: u64, method: &str, session_id: Option<&str>) -> oneshot::Receiver<Result<Value, Error>> {
        let (sender, receiver) = oneshot::channel();
        self.lock().insert(
            id,
            PendingCommand {
                sender,
                method: method.to_string(),
                session_id: session_id.map(str::to_string),
            },
        );
        receiver
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Resolve the matching pending call; unknown ids (timed out earlier) are dropped
    fn resolve(&self, id: u64, result: Value, error: Option<CdpErrorDetail>) {
        let Some(pending) = self.lock().remove(&id) else {
            debug!("Received response for unknown command ID: {}", id);
            return;
        };

        let outcome = match error {
            Some(err) => Err(Error::from_protocol(
                &pending.method,
                err.code,
                &err.message,
                pending.session_id.as_deref(),
            )),
            None => Ok(result),
        };

        // the caller may have stopped waiting
        let _ = pending.sender.send(outcome);
    }

    /// Fail every pending call, e.g. when the socket drops
    fn fail_all(&self, reason: &str) {
        let drained: Vec<(u64, PendingCommand)> = self.lock().drain().collect();
        if !drained.is_empty() {
            warn!("Failing {} pending CDP commands: {}", drained.len(), reason);
        }
        for (_, pending) in drained {
            let _ = pending
                .sender
                .send(Err(Error::connection(format!("{} ({})", reason, pending.method))));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// CDP WebSocket connection implementation
pub struct CdpWebSocketConnection {
    /// WebSocket URL
    url: String,
    /// Write half of the socket
    sink: Mutex<Option<WsSink>>,
    /// Next command ID
    next_id: AtomicU64,
    /// Pending commands (ID -> response sender)
    pending: Arc<PendingCalls>,
    /// Event fan-out
    router: EventRouter,
    /// Is connection active
    is_active: Arc<AtomicBool>,
    /// Timeout configuration
    timeouts: CommandTimeouts,
}

impl std::fmt::Debug for CdpWebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpWebSocketConnection")
            .field("url", &self.url)
            .field("is_active", &self.is_active.load(Ordering::SeqCst))
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl CdpWebSocketConnection {
    /// Open a control connection
    ///
    /// # Arguments
    /// * `url` - WebSocket URL (e.g., "ws://localhost:9222/devtools/browser/ABC123")
    pub async fn connect<S: Into<String>>(url: S) -> Result<Arc<Self>, Error> {
        Self::connect_with_timeouts(url, CommandTimeouts::default()).await
    }

    /// Open a control connection with custom per-method timeouts
    pub async fn connect_with_timeouts<S: Into<String>>(
        url: S,
        timeouts: CommandTimeouts,
    ) -> Result<Arc<Self>, Error> {
        let url = url.into();
        info!("Connecting to WebSocket: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", url, e)))?;

        let (sink, source) = ws_stream.split();

        let connection = Arc::new(Self {
            url,
            sink: Mutex::new(Some(sink)),
            next_id: AtomicU64::new(1),
            pending: Arc::new(PendingCalls::default()),
            router: EventRouter::new(1024),
            is_active: Arc::new(AtomicBool::new(true)),
            timeouts,
        });

        info!("WebSocket connection established");

        let pending = Arc::clone(&connection.pending);
        let router = connection.router.clone();
        let is_active = Arc::clone(&connection.is_active);
        tokio::spawn(async move {
            Self::read_loop(source, pending, router, is_active).await;
        });

        Ok(connection)
    }

    /// Demultiplex incoming frames until the socket closes
    async fn read_loop(
        mut source: WsSource,
        pending: Arc<PendingCalls>,
        router: EventRouter,
        is_active: Arc<AtomicBool>,
    ) {
        debug!("CDP read loop started");

        while let Some(message) = source.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Dropping non UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(frame)) => {
                    info!("WebSocket close frame received: {:?}", frame);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
            };

            Self::handle_text(&text, &pending, &router);
        }

        is_active.store(false, Ordering::SeqCst);
        pending.fail_all("connection closed");
        info!("CDP read loop exited");
    }

    fn handle_text(text: &str, pending: &PendingCalls, router: &EventRouter) {
        let frame = match IncomingFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Unparseable CDP frame: {}", e);
                return;
            }
        };

        match frame.classify() {
            Some(CdpMessage::Response { id, result, error, .. }) => pending.resolve(id, result, error),
            Some(CdpMessage::Event(event)) => {
                debug!("Received event: {}", event.method);
                router.dispatch(event);
            }
            None => warn!("Unknown message format: {}", text),
        }
    }

    /// Send WebSocket message
    async fn send_message(&self, message: Message) -> Result<(), Error> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| Error::connection("WebSocket stream not available"))?;

        sink.send(message)
            .await
            .map_err(|e| Error::connection(format!("Failed to send message: {}", e)))
    }

    /// WebSocket URL this connection was opened with
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CdpTransport for CdpWebSocketConnection {
    async fn send(&self, method: &str, params: Value, session_id: Option<&str>) -> Result<Value, Error> {
        let timeout = self.timeouts.for_method(method);
        self.send_with_timeout(method, params, session_id, timeout).await
    }

    async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        if !self.is_active.load(Ordering::SeqCst) {
            return Err(Error::connection("Connection is not active"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = CdpRequest {
            id,
            method: method.to_string(),
            params: if params.is_null() { None } else { Some(params) },
            session_id: session_id.map(str::to_string),
        };
        let json = serde_json::to_string(&request)?;

        debug!("Sending CDP command {}: {} (session: {:?})", id, method, session_id);

        let receiver = self.pending.register(id, method, session_id);
        if let Err(e) = self.send_message(Message::Text(json)).await {
            self.pending.remove(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::connection(format!(
                "Connection closed before response to {}",
                method
            ))),
            Err(_) => {
                self.pending.remove(id);
                Err(Error::timeout(format!("{} (command {}) timed out after {:?}", method, id, timeout)))
            }
        }
    }

    fn on(&self, method: &str, handler: EventHandler) -> HandlerId {
        self.router.on(method, handler)
    }

    fn off(&self, id: HandlerId) {
        self.router.off(id)
    }

    fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.router.subscribe()
    }

    async fn close(&self) -> Result<(), Error> {
        info!("Closing CDP WebSocket connection");

        self.is_active.store(false, Ordering::SeqCst);

        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            if let Err(e) = sink.close().await {
                warn!("Failed to close WebSocket cleanly: {}", e);
            }
        }
        drop(guard);

        self.pending.fail_all("connection closed by client");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }
}
