//! Mock CDP transport for testing
//!
//! A scriptable in-process stand-in for the browser: a responder closure answers
//! commands and may emit events through a [`MockEmitter`].

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

use super::router::EventRouter;
use super::traits::{CdpTransport, CommandTimeouts, EventHandler, HandlerId};
use super::types::CdpEvent;
use crate::Error;

/// A command received by the mock
#[derive(Debug, Clone)]
pub struct MockCall {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// How the mock answers one command
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Successful result
    Result(Value),
    /// Browser error frame
    Error { code: i64, message: String },
    /// Answer after a delay
    Delayed(Duration, Box<MockReply>),
    /// Never answer (the caller's timeout fires)
    Hang,
}

impl MockReply {
    pub fn ok() -> Self {
        MockReply::Result(json!({}))
    }

    pub fn error<S: Into<String>>(code: i64, message: S) -> Self {
        MockReply::Error {
            code,
            message: message.into(),
        }
    }

    pub fn stale_session() -> Self {
        Self::error(-32001, "Session with given id not found.")
    }
}

/// Emits events into the mock's event stream
#[derive(Debug, Clone)]
pub struct MockEmitter {
    router: EventRouter,
}

impl MockEmitter {
    /// Emit an event now
    pub fn emit(&self, method: &str, params: Value, session_id: Option<&str>) {
        self.router
            .dispatch(CdpEvent::new(method, params, session_id.map(str::to_string)));
    }

    /// Emit an event after `delay` without blocking the responder
    pub fn emit_after(&self, delay: Duration, method: &str, params: Value, session_id: Option<&str>) {
        let emitter = self.clone();
        let method = method.to_string();
        let session_id = session_id.map(str::to_string);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            emitter.emit(&method, params, session_id.as_deref());
        });
    }
}

/// Responder closure type
pub type Responder = Arc<dyn Fn(&MockCall, &MockEmitter) -> MockReply + Send + Sync>;

/// Mock CDP transport
pub struct MockTransport {
    router: EventRouter,
    responder: RwLock<Responder>,
    calls: Mutex<Vec<MockCall>>,
    is_active: AtomicBool,
    timeouts: CommandTimeouts,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.call_count())
            .field("is_active", &self.is_active())
            .finish()
    }
}

impl MockTransport {
    /// Create a mock answering `{}` to every command
    pub fn new() -> Arc<Self> {
        Self::with_responder(|_, _| MockReply::ok())
    }

    /// Create a mock with a responder
    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&MockCall, &MockEmitter) -> MockReply + Send + Sync + 'static,
    {
        Arc::new(Self {
            router: EventRouter::new(1024),
            responder: RwLock::new(Arc::new(responder)),
            calls: Mutex::new(Vec::new()),
            is_active: AtomicBool::new(true),
            timeouts: CommandTimeouts {
                default: Duration::from_secs(5),
                screenshot: Duration::from_secs(5),
                navigation: Duration::from_secs(5),
                execution: Duration::from_secs(5),
            },
        })
    }

    /// Replace the responder
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&MockCall, &MockEmitter) -> MockReply + Send + Sync + 'static,
    {
        let mut guard = self.responder.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(responder);
    }

    /// Event emitter bound to this mock
    pub fn emitter(&self) -> MockEmitter {
        MockEmitter {
            router: self.router.clone(),
        }
    }

    /// Emit an event now
    pub fn emit(&self, method: &str, params: Value, session_id: Option<&str>) {
        self.emitter().emit(method, params, session_id);
    }

    /// Every command received so far
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Number of commands received
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Number of commands received for `method`
    pub fn count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Simulate the browser dropping the connection
    pub fn disconnect(&self) {
        self.is_active.store(false, Ordering::SeqCst);
    }

    async fn play(reply: MockReply, call: &MockCall) -> Result<Value, Error> {
        let mut reply = reply;
        loop {
            match reply {
                MockReply::Result(value) => return Ok(value),
                MockReply::Error { code, message } => {
                    return Err(Error::from_protocol(
                        &call.method,
                        code,
                        &message,
                        call.session_id.as_deref(),
                    ))
                }
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                MockReply::Hang => {
                    futures::future::pending::<()>().await;
                }
            }
        }
    }
}

#[async_trait]
impl CdpTransport for MockTransport {
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
        if !self.is_active() {
            return Err(Error::connection("Connection is not active"));
        }

        let call = MockCall {
            method: method.to_string(),
            params,
            session_id: session_id.map(str::to_string),
        };
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(call.clone());

        let responder = Arc::clone(&*self.responder.read().unwrap_or_else(|p| p.into_inner()));
        let reply = responder(&call, &self.emitter());

        match tokio::time::timeout(timeout, Self::play(reply, &call)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!("{} timed out after {:?}", method, timeout))),
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
        self.disconnect();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }
}
