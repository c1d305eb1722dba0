//! chaser-engine: Chrome DevTools Protocol interaction engine
//!
//! Drives a Chromium browser over one control connection: target/session
//! tracking, an event bus for reactive subsystems, a merged DOM/accessibility
//! model with indexed interactive elements, and click/type/scroll actions that
//! race navigation and download events.

pub mod error;
pub mod config;
pub mod retry;

pub mod cdp;
pub mod session;
pub mod bus;
pub mod dom;
pub mod interaction;
pub mod watchdogs;

pub mod ports;
pub mod launcher;
pub mod engine;

// Re-exports
pub use engine::{Action, ActionResult, BrowserEngine, BrowserState, TabInfo};
pub use error::{Error, Result};

/// chaser-engine library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
