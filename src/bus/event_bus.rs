//! In-order event bus
//!
//! Each bus owns one worker task. `dispatch` enqueues; the worker takes one
//! event at a time, runs every handler registered for its kind and only then
//! takes the next one. The worker runs handlers inside a task-local scope that
//! records which bus owns the current processing slot, so a handler can emit on
//! its own bus without waiting on itself.

use futures::future::join_all;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, instrument, trace, warn};

use super::events::{BrowserEvent, EventKind};
use crate::config::{Config, HandlerMode};
use crate::{Error, Result};

tokio::task_local! {
    /// Id of the bus whose processing slot the current task holds
    static ACTIVE_BUS: u64;
}

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Boxed bus handler
pub type BusHandler = Arc<dyn Fn(BrowserEvent) -> HandlerFuture + Send + Sync>;

/// Handle returned by [`EventBus::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Bus settings
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Name used in logs
    pub name: String,
    /// Whether handlers of one event run concurrently
    pub handler_mode: HandlerMode,
    /// Upper bound for one handler invocation
    pub handler_timeout: Duration,
    /// Buffer of the event stream used by waiters
    pub broadcast_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: "engine".to_string(),
            handler_mode: HandlerMode::Parallel,
            handler_timeout: Duration::from_secs(30),
            broadcast_capacity: 1024,
        }
    }
}

impl BusConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handler_mode: config.bus_handler_mode,
            handler_timeout: Duration::from_millis(config.bus_handler_timeout),
            ..Self::default()
        }
    }
}

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Idle,
    Processing,
}

/// A handler that failed, timed out or panicked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    pub message: String,
}

/// Result of processing one event
#[derive(Debug, Clone)]
pub struct EventOutcome {
    pub kind: EventKind,
    /// Number of handlers invoked
    pub handled: usize,
    pub failures: Vec<HandlerFailure>,
}

impl EventOutcome {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Registration {
    id: SubscriptionId,
    name: String,
    kind: EventKind,
    handler: BusHandler,
}

struct Queued {
    event: BrowserEvent,
    reply: Option<oneshot::Sender<EventOutcome>>,
}

/// Event bus
pub struct EventBus {
    id: u64,
    config: BusConfig,
    handlers: RwLock<Vec<Registration>>,
    next_subscription: AtomicU64,
    queue: mpsc::UnboundedSender<Queued>,
    /// Queued plus in-flight events
    pending: watch::Sender<usize>,
    processing: AtomicBool,
    processed: AtomicU64,
    stream: broadcast::Sender<BrowserEvent>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("pending", &*self.pending.borrow())
            .finish()
    }
}

impl EventBus {
    /// Create a bus and spawn its worker
    pub fn new(config: BusConfig) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        let (stream, _) = broadcast::channel(config.broadcast_capacity.max(1));

        let bus = Arc::new(Self {
            id: NEXT_BUS_ID.fetch_add(1, Ordering::SeqCst),
            config,
            handlers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            queue,
            pending,
            processing: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            stream,
        });

        tokio::spawn(Self::worker(Arc::downgrade(&bus), rx));
        bus
    }

    async fn worker(bus: Weak<EventBus>, mut rx: mpsc::UnboundedReceiver<Queued>) {
        while let Some(item) = rx.recv().await {
            let Some(bus) = bus.upgrade() else { break };

            bus.processing.store(true, Ordering::SeqCst);
            let outcome = ACTIVE_BUS.scope(bus.id, bus.process(&item.event)).await;
            bus.processing.store(false, Ordering::SeqCst);

            bus.processed.fetch_add(1, Ordering::SeqCst);
            bus.pending.send_modify(|n| *n = n.saturating_sub(1));

            if let Some(reply) = item.reply {
                let _ = reply.send(outcome);
            }
        }
        debug!("Event bus worker exited");
    }

    /// Register a handler for one event kind
    pub fn on<F, Fut>(&self, kind: EventKind, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(BrowserEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let handler: BusHandler = Arc::new(move |event| Box::pin(handler(event)));

        let mut guard = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        guard.push(Registration {
            id,
            name: name.to_string(),
            kind,
            handler,
        });
        debug!(bus = %self.config.name, handler = name, ?kind, "Registered handler");
        id
    }

    /// Remove a handler
    pub fn off(&self, id: SubscriptionId) {
        let mut guard = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        guard.retain(|r| r.id != id);
    }

    /// Number of handlers registered for `kind`
    pub fn handler_count(&self, kind: EventKind) -> usize {
        let guard = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        guard.iter().filter(|r| r.kind == kind).count()
    }

    /// Enqueue an event. Never blocks, also from inside a handler.
    pub fn dispatch(&self, event: BrowserEvent) {
        self.enqueue(event, None);
    }

    fn enqueue(&self, event: BrowserEvent, reply: Option<oneshot::Sender<EventOutcome>>) -> bool {
        trace!(bus = %self.config.name, kind = ?event.kind(), "Dispatching event");
        let _ = self.stream.send(event.clone());

        self.pending.send_modify(|n| *n += 1);
        if self.queue.send(Queued { event, reply }).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            warn!(bus = %self.config.name, "Event bus worker is gone, dropping event");
            return false;
        }
        true
    }

    /// Whether the current task is running a handler of this bus
    pub fn in_handler(&self) -> bool {
        ACTIVE_BUS.try_with(|active| *active == self.id).unwrap_or(false)
    }

    /// Dispatch an event and wait until its handlers finished.
    ///
    /// Called from one of this bus's own handlers, the event is processed
    /// inline instead of queued behind the event currently being handled.
    pub async fn emit(&self, event: BrowserEvent) -> Result<EventOutcome> {
        if self.in_handler() {
            trace!(bus = %self.config.name, kind = ?event.kind(), "Nested emit, processing inline");
            let _ = self.stream.send(event.clone());
            let outcome = self.process(&event).await;
            self.processed.fetch_add(1, Ordering::SeqCst);
            return Ok(outcome);
        }

        let (tx, rx) = oneshot::channel();
        if !self.enqueue(event, Some(tx)) {
            return Err(Error::internal("Event bus worker is gone"));
        }
        rx.await
            .map_err(|_| Error::internal("Event bus worker dropped the event"))
    }

    async fn process(&self, event: &BrowserEvent) -> EventOutcome {
        let kind = event.kind();
        let handlers: Vec<(String, BusHandler)> = {
            let guard = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            guard
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| (r.name.clone(), Arc::clone(&r.handler)))
                .collect()
        };

        let handled = handlers.len();
        let failures: Vec<HandlerFailure> = match self.config.handler_mode {
            HandlerMode::Parallel => join_all(
                handlers
                    .iter()
                    .map(|(name, handler)| self.run_handler(name, handler, event.clone())),
            )
            .await
            .into_iter()
            .flatten()
            .collect(),
            HandlerMode::Sequential => {
                let mut failures = Vec::new();
                for (name, handler) in &handlers {
                    if let Some(failure) = self.run_handler(name, handler, event.clone()).await {
                        failures.push(failure);
                    }
                }
                failures
            }
        };

        EventOutcome {
            kind,
            handled,
            failures,
        }
    }

    async fn run_handler(&self, name: &str, handler: &BusHandler, event: BrowserEvent) -> Option<HandlerFailure> {
        let kind = event.kind();
        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(fut) => fut,
            Err(_) => return Some(self.failure(name, kind, "handler panicked".to_string())),
        };

        match tokio::time::timeout(self.config.handler_timeout, AssertUnwindSafe(fut).catch_unwind()).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(self.failure(name, kind, e.to_string())),
            Ok(Err(_)) => Some(self.failure(name, kind, "handler panicked".to_string())),
            Err(_) => Some(self.failure(
                name,
                kind,
                format!("handler timed out after {:?}", self.config.handler_timeout),
            )),
        }
    }

    fn failure(&self, name: &str, kind: EventKind, message: String) -> HandlerFailure {
        warn!(bus = %self.config.name, handler = name, ?kind, "Event handler failed: {}", message);
        HandlerFailure {
            handler: name.to_string(),
            message,
        }
    }

    /// Wait until the queue is empty and no event is being processed
    #[instrument(skip(self), fields(bus = %self.config.name))]
    pub async fn wait_until_idle(&self, timeout: Duration) -> Result<()> {
        if self.in_handler() {
            return Err(Error::internal(
                "wait_until_idle called from a handler of the same bus",
            ));
        }

        let mut rx = self.pending.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::internal("Event bus closed")),
            Err(_) => Err(Error::timeout(format!(
                "Event bus '{}' not idle after {:?}",
                self.config.name, timeout
            ))),
        }
    }

    pub fn state(&self) -> BusState {
        if self.processing.load(Ordering::SeqCst) {
            BusState::Processing
        } else {
            BusState::Idle
        }
    }

    /// Events fully processed so far
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Events queued or in flight
    pub fn pending_count(&self) -> usize {
        *self.pending.borrow()
    }

    /// Stream of every dispatched event
    pub fn subscribe(&self) -> broadcast::Receiver<BrowserEvent> {
        self.stream.subscribe()
    }

    /// Waiter receiving every event dispatched from now on
    pub fn waiter(&self) -> EventWaiter {
        EventWaiter {
            inner: self.stream.subscribe(),
        }
    }
}

/// Receives events dispatched after its creation.
///
/// Create it before starting the operation whose events it should catch.
pub struct EventWaiter {
    inner: broadcast::Receiver<BrowserEvent>,
}

impl EventWaiter {
    /// Wait for the first event `select` maps to `Some`
    pub async fn next_matching<T, F>(&mut self, timeout: Duration, mut select: F) -> Result<T>
    where
        F: FnMut(&BrowserEvent) -> Option<T>,
    {
        let wait = async {
            loop {
                match self.inner.recv().await {
                    Ok(event) => {
                        if let Some(found) = select(&event) {
                            return Ok(found);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Event waiter lagged behind by {} events, catching up", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::internal("Event bus closed"));
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::timeout(format!("No matching event within {:?}", timeout)))?
    }
}
