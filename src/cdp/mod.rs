//! # Chrome DevTools Protocol (CDP) transport layer
//!
//! One control connection per browser. Commands are JSON-RPC style frames
//! `{id, method, params, sessionId?}` correlated by id; frames without an id are
//! events and are fanned out to handlers.
//!
//! ## Module structure
//! - `traits`: the [`CdpTransport`] seam used by every layer above
//! - `types`: wire frames
//! - `router`: event fan-out shared by transport implementations
//! - `connection`: WebSocket transport
//! - `browser`: `/json/version` endpoint discovery
//! - `mock`: scriptable in-process transport for tests
//!
//! ## Example
//! ```rust,no_run
//! use chaser_engine::cdp::{CdpTransport, CdpWebSocketConnection};
//!
//! # async fn example() -> Result<(), chaser_engine::Error> {
//! let url = chaser_engine::cdp::discover_websocket_url(
//!     "http://127.0.0.1:9222",
//!     std::time::Duration::from_secs(5),
//! )
//! .await?;
//! let connection = CdpWebSocketConnection::connect(url).await?;
//! let targets = connection
//!     .send("Target.getTargets", serde_json::json!({}), None)
//!     .await?;
//! println!("{}", targets);
//! # Ok(())
//! # }
//! ```

pub mod traits;
pub mod types;
pub mod router;
pub mod connection;
pub mod browser;
pub mod mock;

pub use traits::{CdpTransport, CommandTimeouts, EventHandler, HandlerId, ANY_EVENT};
pub use types::{BrowserVersion, CdpEvent, TargetInfo};

pub use browser::{discover_websocket_url, fetch_version};
pub use connection::CdpWebSocketConnection;
pub use mock::{MockCall, MockEmitter, MockReply, MockTransport};
