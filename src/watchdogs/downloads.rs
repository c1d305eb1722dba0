//! Download handling
//!
//! The browser writes each download as `<dir>/<guid>`; once it completes the
//! file is renamed to its suggested name, made unique within the directory.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Weak};
use tracing::{debug, info, warn};

use super::Watchdog;
use crate::bus::{BrowserEvent, DownloadState, EventKind};
use crate::session::SessionManager;
use crate::{Error, Result};

/// `dir/name`, or `dir/stem (n).ext` with the first free `n`
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let name = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("download");

    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

pub struct DownloadWatchdog {
    manager: Weak<SessionManager>,
    dir: PathBuf,
    /// guid -> suggested file name
    active: Mutex<HashMap<String, String>>,
    completed: Mutex<Vec<PathBuf>>,
}

impl DownloadWatchdog {
    pub fn new(manager: Weak<SessionManager>, dir: PathBuf) -> Self {
        Self {
            manager,
            dir,
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files saved so far
    pub fn completed(&self) -> Vec<PathBuf> {
        self.completed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Create the directory and route browser downloads into it
    pub async fn configure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::internal("session manager dropped"))?;
        manager
            .send_browser(
                "Browser.setDownloadBehavior",
                json!({
                    "behavior": "allowAndName",
                    "downloadPath": self.dir.to_string_lossy(),
                    "eventsEnabled": true,
                }),
            )
            .await?;
        info!("Downloads go to {}", self.dir.display());
        Ok(())
    }

    async fn finish(&self, guid: &str) -> Result<()> {
        let suggested = self
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(guid)
            .unwrap_or_else(|| guid.to_string());

        let source = self.dir.join(guid);
        let target = unique_path(&self.dir, &suggested);
        let path = match tokio::fs::rename(&source, &target).await {
            Ok(()) => target,
            Err(e) => {
                warn!("Could not rename download {} to {}: {}", guid, target.display(), e);
                source
            }
        };

        info!("Download {} saved to {}", guid, path.display());
        self.completed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(path.clone());

        if let Some(manager) = self.manager.upgrade() {
            manager.bus().dispatch(BrowserEvent::DownloadCompleted {
                guid: guid.to_string(),
                path,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Watchdog for DownloadWatchdog {
    fn name(&self) -> &'static str {
        "downloads"
    }

    fn listens_to(&self) -> &'static [EventKind] {
        &[EventKind::DownloadStarted, EventKind::DownloadProgress]
    }

    fn emits(&self) -> &'static [EventKind] {
        &[EventKind::DownloadCompleted]
    }

    async fn handle(&self, event: BrowserEvent) -> Result<()> {
        match event {
            BrowserEvent::DownloadStarted {
                guid,
                suggested_filename,
                url,
            } => {
                debug!("Download {} started: {}", guid, url);
                self.active
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(guid, suggested_filename);
            }
            BrowserEvent::DownloadProgress {
                guid,
                state: DownloadState::Completed,
                ..
            } => self.finish(&guid).await?,
            BrowserEvent::DownloadProgress {
                guid,
                state: DownloadState::Canceled,
                ..
            } => {
                self.active
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&guid);
                debug!("Download {} canceled", guid);
            }
            _ => {}
        }
        Ok(())
    }
}
