//! Terminal results of one click

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result of a click, exactly one per attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ClickOutcome {
    /// Input dispatched, nothing observable followed
    Success,
    /// The page navigated to the given URL
    NavigationTriggered(String),
    /// A download finished and was saved to the given path
    DownloadCompleted(PathBuf),
    /// The click navigated outside the allow-list; the page was sent back
    Disallowed(String),
    /// Dispatch failed; for the retry wrapper, every distinct failure joined by `; `
    Error(String),
}

impl ClickOutcome {
    /// Outcomes after which the retry wrapper stops
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ClickOutcome::Error(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ClickOutcome::Success | ClickOutcome::NavigationTriggered(_) | ClickOutcome::DownloadCompleted(_)
        )
    }

    pub fn navigated_to(&self) -> Option<&str> {
        match self {
            ClickOutcome::NavigationTriggered(url) => Some(url),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClickOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClickOutcome::Success => write!(f, "clicked"),
            ClickOutcome::NavigationTriggered(url) => write!(f, "navigated to {}", url),
            ClickOutcome::DownloadCompleted(path) => write!(f, "downloaded {}", path.display()),
            ClickOutcome::Disallowed(reason) => write!(f, "disallowed: {}", reason),
            ClickOutcome::Error(message) => write!(f, "error: {}", message),
        }
    }
}

/// Collects distinct failure messages across attempts, in first-seen order
#[derive(Debug, Default, Clone)]
pub(crate) struct FailureLog {
    messages: Vec<String>,
}

impl FailureLog {
    pub fn record(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.messages.contains(&message) {
            self.messages.push(message);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_outcome(self) -> ClickOutcome {
        ClickOutcome::Error(self.messages.join("; "))
    }
}
