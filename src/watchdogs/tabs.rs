//! Tab lifecycle and default actions
//!
//! Attaches to new pages and sizes their viewport, moves focus to tabs the
//! focused tab opened, picks a new focus when the focused tab closes, and
//! carries out navigate/switch/close requests dispatched on the bus.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::Watchdog;
use crate::bus::{BrowserEvent, EventKind};
use crate::config::Config;
use crate::session::{SessionManager, Target, TargetKind};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

pub struct TabsWatchdog {
    manager: Weak<SessionManager>,
    viewport: Option<Viewport>,
    follow_new_tabs: bool,
}

impl TabsWatchdog {
    pub fn new(manager: Weak<SessionManager>, viewport: Option<Viewport>, follow_new_tabs: bool) -> Self {
        Self {
            manager,
            viewport,
            follow_new_tabs,
        }
    }

    pub fn from_config(manager: Weak<SessionManager>, config: &Config) -> Self {
        let viewport = (config.viewport_width > 0 && config.viewport_height > 0).then_some(Viewport {
            width: config.viewport_width,
            height: config.viewport_height,
        });
        Self::new(manager, viewport, config.follow_new_tabs)
    }

    fn manager(&self) -> Result<Arc<SessionManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| Error::internal("session manager dropped"))
    }

    async fn adopt(&self, manager: &SessionManager, target: Target) -> Result<()> {
        if !target.is_page() || target.is_extension() {
            return Ok(());
        }

        let focused = manager.focused_target();
        let opened_by_focused = target.opener_id.is_some() && target.opener_id == focused;
        let take_focus = focused.is_none() || (self.follow_new_tabs && opened_by_focused);

        manager
            .get_or_create_session(&target.target_id, false)
            .await?;

        if let Some(viewport) = self.viewport {
            if let Err(e) = manager
                .send_to_target(
                    &target.target_id,
                    "Emulation.setDeviceMetricsOverride",
                    json!({
                        "width": viewport.width,
                        "height": viewport.height,
                        "deviceScaleFactor": 1,
                        "mobile": false,
                    }),
                )
                .await
            {
                warn!("Viewport override failed on {}: {}", target.target_id, e);
            }
        }

        if take_focus {
            info!("Focusing new tab {} ({})", target.target_id, target.url);
            manager.focus_target(&target.target_id).await?;
        }
        Ok(())
    }

    async fn refocus(&self, manager: &SessionManager, closed: &str) -> Result<()> {
        if manager.focused_target().is_some() {
            return Ok(());
        }
        match manager.pages().into_iter().last() {
            Some(page) => {
                debug!("Focused tab {} closed, focusing {}", closed, page.target_id);
                manager.focus_target(&page.target_id).await?;
            }
            None => debug!("Focused tab {} closed, no pages left", closed),
        }
        Ok(())
    }

    async fn navigate(&self, manager: &SessionManager, target_id: Option<String>, url: &str, new_tab: bool) -> Result<()> {
        if new_tab {
            let target_id = manager.create_target(url, false).await?;
            manager.focus_target(&target_id).await?;
            return Ok(());
        }
        let target_id = match target_id {
            Some(id) => id,
            None => manager.require_focus()?,
        };
        manager
            .send_to_target(&target_id, "Page.navigate", json!({ "url": url }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Watchdog for TabsWatchdog {
    fn name(&self) -> &'static str {
        "tabs"
    }

    fn listens_to(&self) -> &'static [EventKind] {
        &[
            EventKind::TabCreated,
            EventKind::TabClosed,
            EventKind::NavigateRequested,
            EventKind::SwitchTabRequested,
            EventKind::CloseTabRequested,
        ]
    }

    async fn handle(&self, event: BrowserEvent) -> Result<()> {
        let manager = self.manager()?;
        match event {
            BrowserEvent::TabCreated { target } if target.kind == TargetKind::Page => {
                self.adopt(&manager, target).await
            }
            BrowserEvent::TabClosed { target_id } => self.refocus(&manager, &target_id).await,
            BrowserEvent::NavigateRequested {
                target_id,
                url,
                new_tab,
            } => self.navigate(&manager, target_id, &url, new_tab).await,
            BrowserEvent::SwitchTabRequested { target_id } => {
                manager.focus_target(&target_id).await.map(|_| ())
            }
            BrowserEvent::CloseTabRequested { target_id } => manager.close_target(&target_id).await,
            _ => Ok(()),
        }
    }
}
