//! Unified error types for chaser-engine

use thiserror::Error;

/// Unified Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for chaser-engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Control connection errors (dropped socket, handshake failure)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Command rejected by the browser
    #[error("Protocol error in {method}: {message} (code: {code})")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },

    /// Session was detached by the browser; recoverable by re-attaching
    #[error("Session stale: {0}")]
    SessionStale(String),

    /// Target no longer exists; never retried
    #[error("Target gone: {0}")]
    TargetGone(String),

    /// Element handle could not be resolved against the snapshot
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// Element resolved but is detached, hidden or disabled
    #[error("Element not interactable: {0}")]
    ElementNotInteractable(String),

    /// Timeout
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Navigation destination rejected by the allow-list
    #[error("Disallowed: {0}")]
    Disallowed(String),

    /// The document changed while a snapshot was being captured
    #[error("Snapshot invalidated by navigation: {0}")]
    SnapshotInvalidated(String),

    /// HTTP discovery errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Browser messages meaning "this session id is no longer attached"
const STALE_SESSION_MARKERS: &[&str] = &[
    "session with given id not found",
    "no session with given id",
    "session not found",
];

/// Browser messages meaning "this target is gone for good"
const TARGET_GONE_MARKERS: &[&str] = &[
    "no target with given id",
    "target closed",
    "target not found",
];

impl Error {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol<M: Into<String>, S: Into<String>>(method: M, code: i64, message: S) -> Self {
        Error::Protocol {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a new session stale error
    pub fn session_stale<S: Into<String>>(id: S) -> Self {
        Error::SessionStale(id.into())
    }

    /// Create a new target gone error
    pub fn target_gone<S: Into<String>>(id: S) -> Self {
        Error::TargetGone(id.into())
    }

    /// Create a new element not found error
    pub fn element_not_found<S: Into<String>>(msg: S) -> Self {
        Error::ElementNotFound(msg.into())
    }

    /// Create a new element not interactable error
    pub fn element_not_interactable<S: Into<String>>(msg: S) -> Self {
        Error::ElementNotInteractable(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create a new disallowed error
    pub fn disallowed<S: Into<String>>(msg: S) -> Self {
        Error::Disallowed(msg.into())
    }

    /// Create a new snapshot invalidated error
    pub fn snapshot_invalidated<S: Into<String>>(target_id: S) -> Self {
        Error::SnapshotInvalidated(target_id.into())
    }

    /// Create a new HTTP error
    pub fn http<S: Into<String>>(msg: S) -> Self {
        Error::Http(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Error::Configuration(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Classify an error frame returned by the browser.
    ///
    /// Stale-session and missing-target replies get their own variants so the
    /// session manager can tell "re-attach and retry" from "give up".
    pub fn from_protocol(method: &str, code: i64, message: &str, session_id: Option<&str>) -> Self {
        let lower = message.to_lowercase();

        if STALE_SESSION_MARKERS.iter().any(|m| lower.contains(m)) {
            return Error::session_stale(session_id.unwrap_or(message));
        }

        if TARGET_GONE_MARKERS.iter().any(|m| lower.contains(m)) {
            return Error::target_gone(message);
        }

        Error::protocol(method, code, message)
    }

    /// True when re-attaching a session may fix the failure
    pub fn is_session_stale(&self) -> bool {
        matches!(self, Error::SessionStale(_))
    }

    /// True for failures that a later attempt of the same operation may not hit
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SessionStale(_)
                | Error::Timeout(_)
                | Error::Protocol { .. }
                | Error::ElementNotInteractable(_)
                | Error::SnapshotInvalidated(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration(err.to_string())
    }
}
