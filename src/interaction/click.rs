//! Click state machine
//!
//! One attempt runs Resolve → PopupCheck → StateCheck → Dispatch →
//! RaceOutcome. [`InteractionEngine::click`] repeats attempts with the click
//! retry policy until a terminal outcome.

use std::path::PathBuf;
use std::pin::pin;
use tracing::{debug, info, instrument, warn};

use super::input;
use super::outcome::{ClickOutcome, FailureLog};
use super::service::{InteractionEngine, Located};
use crate::bus::{BrowserEvent, EventWaiter};
use crate::dom::ElementHandle;
use crate::{Error, Result};

/// Clicks the first visible consent/cookie dismiss button near the top of the page
const DISMISS_POPUPS_JS: &str = r#"(() => {
    const selectors = [
        '#onetrust-accept-btn-handler',
        '#CybotCookiebotDialogBodyButtonAccept',
        'button[aria-label*="accept" i]',
        'button[aria-label*="close" i]',
        '[data-testid*="cookie" i] button',
        '.cookie-banner button',
        '.modal [data-dismiss="modal"]',
    ];
    const words = /^(accept|accept all|agree|i agree|got it|ok|allow all|close)$/i;
    const visible = (el) => {
        const r = el.getBoundingClientRect();
        return r.width > 0 && r.height > 0 && r.top < window.innerHeight;
    };
    for (const selector of selectors) {
        const el = document.querySelector(selector);
        if (el && visible(el)) { el.click(); return selector; }
    }
    for (const el of document.querySelectorAll('button, [role="button"]')) {
        if (visible(el) && words.test((el.innerText || '').trim())) { el.click(); return 'text'; }
    }
    return null;
})()"#;

const NATIVE_CLICK_FN: &str = "function() { this.click(); }";

/// What happened while the click raced navigation and download waiters
#[derive(Debug)]
enum Raced {
    Navigated(String),
    Downloaded(PathBuf),
    DownloadFailed(String),
    DispatchFailed(Error),
    Quiet,
}

enum DownloadWait {
    NotStarted,
    Completed(PathBuf),
    Failed(String),
}

impl InteractionEngine {
    /// Click an element, retrying per the click retry policy.
    ///
    /// Only a vanished target or a dropped connection surface as `Err`; every
    /// other failure ends up in [`ClickOutcome::Error`] once retries run out.
    #[instrument(skip(self), fields(backend = handle.backend_node_id))]
    pub async fn click(&self, handle: &ElementHandle) -> Result<ClickOutcome> {
        let policy = self.settings().click_retry.clone();
        let mut failures = FailureLog::default();
        let mut retries = 0u32;
        let mut refresh = false;

        loop {
            match self.click_once(handle, refresh).await {
                Ok(ClickOutcome::Error(message)) => failures.record(message),
                Ok(outcome) => {
                    info!("Click finished: {}", outcome);
                    return Ok(outcome);
                }
                Err(e @ (Error::TargetGone(_) | Error::Connection(_))) => return Err(e),
                Err(e) => failures.record(e.to_string()),
            }

            if !policy.allows(retries) {
                break;
            }
            let delay = policy.delay_for(retries);
            retries += 1;
            debug!("Click attempt failed, retry {} in {:?}", retries, delay);
            tokio::time::sleep(delay).await;
            refresh = true;
        }

        let outcome = failures.into_outcome();
        warn!("Click gave up after {} retries: {}", retries, outcome);
        Ok(outcome)
    }

    /// Click the element at `index` of the latest snapshot
    pub async fn click_index(&self, index: usize) -> Result<ClickOutcome> {
        let tree = self.current_tree(false).await?;
        let handle = tree
            .handle(index)
            .ok_or_else(|| Error::element_not_found(format!("index {}", index)))?;
        self.click(&handle).await
    }

    /// One pass through the state machine.
    ///
    /// Errors before dispatch come back as `Err`; once input was sent the
    /// attempt always resolves to a [`ClickOutcome`].
    pub async fn click_once(&self, handle: &ElementHandle, refresh: bool) -> Result<ClickOutcome> {
        // Resolve
        let (root, node) = self.resolve(handle, refresh).await?;

        // PopupCheck
        if self.settings().dismiss_popups {
            self.dismiss_popups(&root).await;
        }

        // StateCheck
        let located = self.check_state(root, node).await?;
        let point = self.element_point(&located).await?;
        let previous_url = self
            .manager()
            .get_target(&located.root)
            .map(|t| t.url)
            .unwrap_or_default();

        // Dispatch + RaceOutcome
        let raced = self.race(&located, point).await;
        self.resolve_race(&located.root, &previous_url, raced).await
    }

    async fn dismiss_popups(&self, root: &str) {
        match self.evaluate(root, DISMISS_POPUPS_JS).await {
            Ok(serde_json::Value::String(matched)) => debug!("Dismissed overlay via {}", matched),
            Ok(_) => {}
            Err(e) => debug!("Popup check failed: {}", e),
        }
    }

    /// Send the input, falling back to the element's own `click()` when the
    /// input pipeline reports a transient failure
    async fn dispatch(&self, located: &Located, point: (f64, f64)) -> Result<()> {
        let humanize = self.settings().humanize;
        let manager = self.manager();
        let sent = async {
            let path = input::pointer_path(self.pointer(), point, humanize);
            input::move_pointer(manager, &located.root, &path, humanize).await?;
            self.set_pointer(point);
            input::mouse_click(manager, &located.root, point.0, point.1, humanize).await
        }
        .await;

        match sent {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                debug!("Input dispatch failed ({}), using native click", e);
                let target = located.node.target_id.to_string();
                self.call_on(&target, &located.object_id, NATIVE_CLICK_FN, vec![])
                    .await
                    .map(|_| ())
                    .map_err(|fallback| {
                        Error::element_not_interactable(format!(
                            "input dispatch failed: {}; native click failed: {}",
                            e, fallback
                        ))
                    })
            }
            Err(e) => Err(e),
        }
    }

    async fn race(&self, located: &Located, point: (f64, f64)) -> Raced {
        // subscribe before dispatching so early events are not missed
        let mut nav_waiter = self.bus().waiter();
        let download_waiter = self.bus().waiter();
        let settings = self.settings();
        let root = located.root.clone();

        let mut dispatch = pin!(self.dispatch(located, point));
        let mut navigation = pin!(Self::wait_for_navigation(
            &mut nav_waiter,
            &root,
            settings.navigation_race_timeout,
            false,
        ));
        let mut download = pin!(self.wait_for_download(download_waiter));

        let (mut dispatched, mut nav_done, mut download_done) = (false, false, false);
        loop {
            tokio::select! {
                result = &mut dispatch, if !dispatched => {
                    dispatched = true;
                    if let Err(e) = result {
                        return Raced::DispatchFailed(e);
                    }
                }
                result = &mut navigation, if !nav_done => {
                    match result {
                        Ok(url) => return Raced::Navigated(url),
                        Err(_) => nav_done = true,
                    }
                }
                result = &mut download, if !download_done => {
                    match result {
                        DownloadWait::Completed(path) => return Raced::Downloaded(path),
                        DownloadWait::Failed(message) => return Raced::DownloadFailed(message),
                        DownloadWait::NotStarted => download_done = true,
                    }
                }
                else => return Raced::Quiet,
            }
            if dispatched && nav_done && download_done {
                return Raced::Quiet;
            }
        }
    }

    async fn wait_for_download(&self, mut waiter: EventWaiter) -> DownloadWait {
        let settings = self.settings();
        let started = waiter
            .next_matching(settings.download_start_timeout, |event| match event {
                BrowserEvent::DownloadStarted { guid, .. } => Some(guid.clone()),
                _ => None,
            })
            .await;
        let Ok(guid) = started else {
            return DownloadWait::NotStarted;
        };

        debug!("Download {} started", guid);
        let finished = waiter
            .next_matching(settings.download_timeout, |event| match event {
                BrowserEvent::DownloadCompleted { guid: g, path } if *g == guid => Some(Ok(path.clone())),
                BrowserEvent::DownloadProgress {
                    guid: g,
                    state: crate::bus::DownloadState::Canceled,
                    ..
                } if *g == guid => Some(Err(format!("download {} was canceled", guid))),
                _ => None,
            })
            .await;

        match finished {
            Ok(Ok(path)) => DownloadWait::Completed(path),
            Ok(Err(message)) => DownloadWait::Failed(message),
            Err(e) => DownloadWait::Failed(format!("download {} did not finish: {}", guid, e)),
        }
    }

    async fn resolve_race(&self, root: &str, previous_url: &str, raced: Raced) -> Result<ClickOutcome> {
        match raced {
            Raced::Downloaded(path) => Ok(ClickOutcome::DownloadCompleted(path)),
            Raced::DownloadFailed(message) => Ok(ClickOutcome::Error(message)),
            Raced::Navigated(url) => {
                self.dom().invalidate(root);
                match self.policy().check(&url) {
                    Ok(()) => Ok(ClickOutcome::NavigationTriggered(url)),
                    Err(reason) => {
                        warn!("Click navigated to disallowed {}, going back", url);
                        if let Err(e) = self.go_back_to(root, previous_url).await {
                            warn!("Going back from {} failed: {}", url, e);
                        }
                        Ok(ClickOutcome::Disallowed(reason))
                    }
                }
            }
            Raced::DispatchFailed(e @ (Error::TargetGone(_) | Error::Connection(_))) => Err(e),
            Raced::DispatchFailed(e) => Ok(ClickOutcome::Error(e.to_string())),
            Raced::Quiet => Ok(ClickOutcome::Success),
        }
    }
}
