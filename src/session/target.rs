//! Target and session value types

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cdp::TargetInfo;

/// Kind of browser-addressable context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Page,
    Iframe,
    Worker,
    ServiceWorker,
    SharedWorker,
    BackgroundPage,
    Browser,
    Other,
}

impl TargetKind {
    /// Map the protocol's `type` string
    pub fn from_protocol(kind: &str) -> Self {
        match kind {
            "page" | "tab" => TargetKind::Page,
            "iframe" => TargetKind::Iframe,
            "worker" => TargetKind::Worker,
            "service_worker" => TargetKind::ServiceWorker,
            "shared_worker" => TargetKind::SharedWorker,
            "background_page" => TargetKind::BackgroundPage,
            "browser" => TargetKind::Browser,
            _ => TargetKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Page => "page",
            TargetKind::Iframe => "iframe",
            TargetKind::Worker => "worker",
            TargetKind::ServiceWorker => "service_worker",
            TargetKind::SharedWorker => "shared_worker",
            TargetKind::BackgroundPage => "background_page",
            TargetKind::Browser => "browser",
            TargetKind::Other => "other",
        }
    }
}

/// A browser-addressable context (page, iframe, worker).
///
/// Only the session manager builds these, from protocol target events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub target_id: String,
    pub kind: TargetKind,
    pub url: String,
    pub title: String,
    pub opener_id: Option<String>,
}

impl Target {
    pub(crate) fn from_info(info: &TargetInfo) -> Self {
        Self {
            target_id: info.target_id.clone(),
            kind: TargetKind::from_protocol(&info.target_type),
            url: info.url.clone(),
            title: info.title.clone(),
            opener_id: info.opener_id.clone(),
        }
    }

    /// Extension pages, extension workers and background pages
    pub fn is_extension(&self) -> bool {
        self.url.starts_with("chrome-extension://") || self.kind == TargetKind::BackgroundPage
    }

    pub fn is_page(&self) -> bool {
        self.kind == TargetKind::Page
    }
}

/// Attachment of the control connection to one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub target_id: String,
    pub attached_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(session_id: String, target_id: String) -> Self {
        Self {
            session_id,
            target_id,
            attached_at: Utc::now(),
        }
    }
}
