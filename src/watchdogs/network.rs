//! Network observer

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

use super::Watchdog;
use crate::bus::{BrowserEvent, EventKind};
use crate::config::Config;
use crate::session::{SessionManager, TargetKind};
use crate::Result;

/// One request seen on a target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkLogEntry {
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub resource_type: String,
    pub status: Option<u16>,
    pub mime_type: Option<String>,
    pub request_headers: Option<BTreeMap<String, String>>,
    pub response_headers: Option<BTreeMap<String, String>>,
    /// Protocol monotonic timestamps, seconds
    pub started_at: f64,
    pub finished_at: Option<f64>,
    pub error: Option<String>,
}

impl NetworkLogEntry {
    pub fn is_pending(&self) -> bool {
        self.finished_at.is_none() && self.error.is_none()
    }
}

/// Keeps the last `capacity` requests of each target
pub struct NetworkWatchdog {
    manager: Weak<SessionManager>,
    capacity: usize,
    ignored: HashSet<String>,
    logs: Mutex<HashMap<String, VecDeque<NetworkLogEntry>>>,
}

impl NetworkWatchdog {
    pub fn new(manager: Weak<SessionManager>, capacity: usize, ignored: impl IntoIterator<Item = String>) -> Self {
        Self {
            manager,
            capacity: capacity.max(1),
            ignored: ignored.into_iter().collect(),
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(manager: Weak<SessionManager>, config: &Config) -> Self {
        Self::new(
            manager,
            config.network_log_capacity,
            config.ignored_resource_types.iter().cloned(),
        )
    }

    fn logs(&self) -> MutexGuard<'_, HashMap<String, VecDeque<NetworkLogEntry>>> {
        self.logs.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Logged requests of a target, oldest first
    pub fn entries(&self, target_id: &str) -> Vec<NetworkLogEntry> {
        self.logs()
            .get(target_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Requests of a target still waiting for completion
    pub fn pending(&self, target_id: &str) -> usize {
        self.logs()
            .get(target_id)
            .map(|log| log.iter().filter(|e| e.is_pending()).count())
            .unwrap_or(0)
    }

    fn update<F>(&self, target_id: &str, request_id: &str, apply: F)
    where
        F: FnOnce(&mut NetworkLogEntry),
    {
        let mut logs = self.logs();
        // ignored resource kinds were never logged
        if let Some(entry) = logs
            .get_mut(target_id)
            .and_then(|log| log.iter_mut().rev().find(|e| e.request_id == request_id))
        {
            apply(entry);
        }
    }

    async fn enable(&self, target_id: &str) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if let Err(e) = manager
            .send_to_target(target_id, "Network.enable", json!({}))
            .await
        {
            warn!("Network.enable failed on {}: {}", target_id, e);
        }
    }
}

#[async_trait]
impl Watchdog for NetworkWatchdog {
    fn name(&self) -> &'static str {
        "network"
    }

    fn listens_to(&self) -> &'static [EventKind] {
        &[
            EventKind::SessionAttached,
            EventKind::NetworkRequest,
            EventKind::NetworkResponse,
            EventKind::NetworkFinished,
            EventKind::NetworkFailed,
            EventKind::TabClosed,
        ]
    }

    async fn handle(&self, event: BrowserEvent) -> Result<()> {
        match event {
            BrowserEvent::SessionAttached { target_id, kind, .. } => {
                if matches!(kind, TargetKind::Page | TargetKind::Iframe) {
                    self.enable(&target_id).await;
                }
            }
            BrowserEvent::NetworkRequest {
                target_id,
                request_id,
                method,
                url,
                resource_type,
                headers,
                timestamp,
            } => {
                if self.ignored.contains(&resource_type) {
                    return Ok(());
                }
                let mut logs = self.logs();
                let log = logs.entry(target_id).or_default();
                if log.len() == self.capacity {
                    log.pop_front();
                }
                log.push_back(NetworkLogEntry {
                    request_id,
                    method,
                    url,
                    resource_type,
                    status: None,
                    mime_type: None,
                    request_headers: Some(headers),
                    response_headers: None,
                    started_at: timestamp,
                    finished_at: None,
                    error: None,
                });
            }
            BrowserEvent::NetworkResponse {
                target_id,
                request_id,
                status,
                mime_type,
                headers,
                ..
            } => self.update(&target_id, &request_id, |entry| {
                entry.status = Some(status);
                entry.mime_type = Some(mime_type);
                entry.response_headers = Some(headers);
            }),
            BrowserEvent::NetworkFinished {
                target_id,
                request_id,
                timestamp,
            } => self.update(&target_id, &request_id, |entry| entry.finished_at = Some(timestamp)),
            BrowserEvent::NetworkFailed {
                target_id,
                request_id,
                error_text,
                timestamp,
                ..
            } => self.update(&target_id, &request_id, |entry| {
                entry.error = Some(error_text);
                entry.finished_at = Some(timestamp);
            }),
            BrowserEvent::TabClosed { target_id } => {
                if self.logs().remove(&target_id).is_some() {
                    debug!("Dropped network log of {}", target_id);
                }
            }
            _ => {}
        }
        Ok(())
    }
}
