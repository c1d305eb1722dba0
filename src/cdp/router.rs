//! Event fan-out shared by transport implementations
//!
//! The read loop only enqueues; a separate dispatch task invokes handlers in
//! arrival order, so a slow handler delays other handlers but never the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::traits::{EventHandler, HandlerId, ANY_EVENT};
use super::types::CdpEvent;

type HandlerTable = Arc<RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>>;

/// Event router
#[derive(Clone)]
pub struct EventRouter {
    handlers: HandlerTable,
    next_id: Arc<AtomicU64>,
    queue: mpsc::UnboundedSender<CdpEvent>,
    broadcast: broadcast::Sender<CdpEvent>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventRouter {
    /// Create a router and spawn its dispatch task.
    ///
    /// The task ends once every clone of the router is dropped.
    pub fn new(broadcast_capacity: usize) -> Self {
        let handlers: HandlerTable = Arc::new(RwLock::new(HashMap::new()));
        let (queue, mut rx) = mpsc::unbounded_channel::<CdpEvent>();
        let (broadcast, _) = broadcast::channel(broadcast_capacity.max(1));

        let table = Arc::clone(&handlers);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for handler in Self::matching(&table, &event.method) {
                    handler(event.clone());
                }
            }
            debug!("CDP event dispatch task exited");
        });

        Self {
            handlers,
            next_id: Arc::new(AtomicU64::new(1)),
            queue,
            broadcast,
        }
    }

    fn matching(table: &HandlerTable, method: &str) -> Vec<EventHandler> {
        let guard = match table.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let exact = guard.get(method).into_iter().flatten();
        let wildcard = guard.get(ANY_EVENT).into_iter().flatten();
        exact.chain(wildcard).map(|(_, h)| Arc::clone(h)).collect()
    }

    /// Register a handler
    pub fn on(&self, method: &str, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut guard = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.entry(method.to_string()).or_default().push((id, handler));
        id
    }

    /// Remove a handler
    pub fn off(&self, id: HandlerId) {
        let mut guard = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handlers in guard.values_mut() {
            handlers.retain(|(hid, _)| *hid != id);
        }
        guard.retain(|_, handlers| !handlers.is_empty());
    }

    /// Queue an event for handlers and publish it to stream subscribers
    pub fn dispatch(&self, event: CdpEvent) {
        // no stream subscribers is the common case
        let _ = self.broadcast.send(event.clone());

        if self.queue.send(event).is_err() {
            warn!("CDP event dispatch task is gone, dropping event");
        }
    }

    /// Stream of every dispatched event
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.broadcast.subscribe()
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        match self.handlers.read() {
            Ok(guard) => guard.values().map(Vec::len).sum(),
            Err(poisoned) => poisoned.into_inner().values().map(Vec::len).sum(),
        }
    }
}
