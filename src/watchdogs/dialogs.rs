//! Native dialog handler
//!
//! Every alert/confirm/prompt/beforeunload is answered right away so a page
//! can never block the automation on a modal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Mutex, Weak};
use tracing::info;

use super::Watchdog;
use crate::bus::{BrowserEvent, EventKind};
use crate::session::SessionManager;
use crate::{Error, Result};

const MAX_RECORDS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogRecord {
    pub target_id: String,
    pub dialog_type: String,
    pub message: String,
    pub accepted: bool,
    pub at: DateTime<Utc>,
}

pub struct DialogWatchdog {
    manager: Weak<SessionManager>,
    recent: Mutex<VecDeque<DialogRecord>>,
}

impl DialogWatchdog {
    pub fn new(manager: Weak<SessionManager>) -> Self {
        Self {
            manager,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Dialogs handled most recently, oldest first
    pub fn recent(&self) -> Vec<DialogRecord> {
        self.recent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Forget the handled dialogs
    pub fn clear(&self) {
        self.recent.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn record(&self, record: DialogRecord) {
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        if recent.len() == MAX_RECORDS {
            recent.pop_front();
        }
        recent.push_back(record);
    }
}

#[async_trait]
impl Watchdog for DialogWatchdog {
    fn name(&self) -> &'static str {
        "dialogs"
    }

    fn listens_to(&self) -> &'static [EventKind] {
        &[EventKind::DialogOpened]
    }

    async fn handle(&self, event: BrowserEvent) -> Result<()> {
        let BrowserEvent::DialogOpened {
            target_id,
            dialog_type,
            message,
            default_prompt,
            ..
        } = event
        else {
            return Ok(());
        };

        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::internal("session manager dropped"))?;

        let mut params = json!({ "accept": true });
        if dialog_type == "prompt" {
            params["promptText"] = json!(default_prompt.unwrap_or_default());
        }
        info!("Accepting {} dialog on {}: {}", dialog_type, target_id, message);

        let result = manager
            .send_to_target(&target_id, "Page.handleJavaScriptDialog", params)
            .await;
        self.record(DialogRecord {
            target_id,
            dialog_type,
            message,
            accepted: result.is_ok(),
            at: Utc::now(),
        });
        result.map(|_| ())
    }
}
