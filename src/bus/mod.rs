//! Engine event bus
//!
//! Protocol events are translated into [`BrowserEvent`]s and dispatched here;
//! watchdogs subscribe by [`EventKind`] and may dispatch request events of
//! their own (`NavigateRequested`, `SwitchTabRequested`, …).

pub mod events;
pub mod event_bus;


pub use event_bus::{
    BusConfig, BusHandler, BusState, EventBus, EventOutcome, EventWaiter, HandlerFailure, SubscriptionId,
};
pub use events::{BrowserEvent, DownloadState, EventKind};
