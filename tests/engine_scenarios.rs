//! End-to-end scenarios against the in-memory browser

mod common;

use chaser_engine::bus::{BrowserEvent, EventKind};
use chaser_engine::interaction::{ClickOutcome, ScrollDirection};
use chaser_engine::ports::PortPool;
use chaser_engine::watchdogs::StorageState;
use chaser_engine::{Action, BrowserEngine, Error};
use common::{config, eventually, FakeBrowser, START_URL};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tokio_stream::StreamExt;

#[tokio::test]
async fn test_state_lists_indexed_elements() {
    let browser = FakeBrowser::new();
    let engine = browser.engine(config()).await;

    let state = engine.get_state(true).await.unwrap();
    assert_eq!(state.target_id, "T1");
    assert_eq!(state.url, START_URL);
    assert_eq!(state.tabs.len(), 1);
    assert!(state.tabs[0].focused);

    let tags: Vec<(usize, &str)> = state
        .element_index
        .iter()
        .map(|e| (e.index, e.tag.as_str()))
        .collect();
    assert_eq!(tags, vec![(1, "button"), (2, "a"), (3, "button"), (4, "input")]);
    assert_eq!(state.screenshot.as_deref(), Some(common::PNG_BASE64));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_click_link_reports_navigation() {
    let browser = FakeBrowser::new();
    let engine = browser.engine(config()).await;
    engine.get_state(false).await.unwrap();

    let result = engine.execute(Action::Click { index: 2 }).await;
    assert!(result.success, "{:?}", result);
    assert_eq!(
        result.outcome,
        Some(ClickOutcome::NavigationTriggered("https://example.com/next".to_string()))
    );
    assert_eq!(result.url.as_deref(), Some("https://example.com/next"));

    let plain = engine.execute(Action::Click { index: 1 }).await;
    assert_eq!(plain.outcome, Some(ClickOutcome::Success));
}

#[tokio::test]
async fn test_click_into_prohibited_domain_goes_back() {
    let browser = FakeBrowser::new();
    browser.set_link_target("https://blocked.test/landing");
    let engine = browser
        .engine(chaser_engine::config::Config {
            prohibited_domains: vec!["blocked.test".to_string()],
            ..config()
        })
        .await;
    engine.get_state(false).await.unwrap();

    let result = engine.execute(Action::Click { index: 2 }).await;
    assert!(!result.success);
    assert!(matches!(result.outcome, Some(ClickOutcome::Disallowed(_))));
    assert_eq!(result.error_kind, Some("disallowed"));

    assert!(eventually(|| browser.url("T1") == START_URL).await);
    assert!(browser.mock.count("Page.navigateToHistoryEntry") >= 1);
}

#[tokio::test]
async fn test_navigation_outside_allow_list_is_refused() {
    let browser = FakeBrowser::new();
    let engine = browser
        .engine(chaser_engine::config::Config {
            allowed_domains: vec!["example.com".to_string()],
            ..config()
        })
        .await;

    let result = engine
        .execute(Action::Navigate {
            url: "https://evil.test/".to_string(),
            new_tab: false,
        })
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some("disallowed"));
    assert_eq!(browser.mock.count("Page.navigate"), 0);

    let allowed = engine
        .execute(Action::Navigate {
            url: "https://example.com/about".to_string(),
            new_tab: false,
        })
        .await;
    assert!(allowed.success, "{:?}", allowed);
    assert_eq!(allowed.url.as_deref(), Some("https://example.com/about"));
}

#[tokio::test]
async fn test_stale_session_is_retried() {
    let browser = FakeBrowser::new();
    let engine = browser.engine(config()).await;

    browser.fail_stale("Page.captureScreenshot", 2);
    let png = engine.screenshot().await.unwrap();
    assert!(png.starts_with(b"\x89PNG"));
    assert_eq!(browser.mock.count("Page.captureScreenshot"), 3);
}

#[tokio::test]
async fn test_state_and_actions_run_concurrently() {
    let browser = FakeBrowser::new();
    let engine = browser.engine(config()).await;
    engine.get_state(false).await.unwrap();

    let (state, scrolled, typed) = tokio::join!(
        engine.get_state(false),
        engine.execute(Action::Scroll {
            direction: ScrollDirection::Down,
            amount: 300.0,
            index: None,
        }),
        engine.execute(Action::Type {
            index: 4,
            text: "rust".to_string(),
            clear: false,
        }),
    );

    assert_eq!(state.unwrap().element_index.len(), 4);
    assert!(scrolled.success, "{:?}", scrolled);
    assert!(typed.success, "{:?}", typed);
    assert!(browser.mock.count("Input.dispatchKeyEvent") > 0);
}

#[tokio::test]
async fn test_popup_takes_focus_until_closed() {
    let browser = FakeBrowser::new();
    let engine = browser.engine(config()).await;

    let popup = browser.open_popup("T1", "https://example.com/popup");
    assert!(eventually(|| engine.manager().focused_target().as_deref() == Some(popup.as_str())).await);

    let state = engine.get_state(false).await.unwrap();
    assert_eq!(state.target_id, popup);
    assert_eq!(state.tabs.len(), 2);

    let result = engine
        .execute(Action::CloseTab {
            target_id: popup.clone(),
        })
        .await;
    assert!(result.success, "{:?}", result);
    assert_eq!(browser.mock.count("Target.closeTarget"), 1);
    assert_eq!(engine.manager().focused_target().as_deref(), Some("T1"));

    let missing = engine.execute(Action::SwitchTab { target_id: popup }).await;
    assert_eq!(missing.error_kind, Some("target_gone"));
}

#[tokio::test]
async fn test_new_tab_navigation() {
    let browser = FakeBrowser::new();
    let engine = browser.engine(config()).await;

    let result = engine
        .execute(Action::Navigate {
            url: "https://example.com/second".to_string(),
            new_tab: true,
        })
        .await;
    assert!(result.success, "{:?}", result);

    let state = engine.get_state(false).await.unwrap();
    assert_eq!(state.tabs.len(), 2);
    assert_ne!(state.target_id, "T1");

    let back = engine
        .execute(Action::SwitchTab {
            target_id: "T1".to_string(),
        })
        .await;
    assert!(back.success);
    assert_eq!(back.url.as_deref(), Some(START_URL));
}

#[tokio::test]
async fn test_click_download_lands_in_download_dir() {
    let dir = tempfile::tempdir().unwrap();
    let browser = FakeBrowser::new();
    let engine = browser
        .engine(chaser_engine::config::Config {
            downloads_path: Some(dir.path().to_string_lossy().to_string()),
            ..config()
        })
        .await;
    engine.get_state(false).await.unwrap();

    let result = engine.execute(Action::Click { index: 3 }).await;
    let expected = dir.path().join("report.pdf");
    assert_eq!(result.outcome, Some(ClickOutcome::DownloadCompleted(expected.clone())));
    assert!(expected.exists());

    let state = engine.get_state(false).await.unwrap();
    assert_eq!(state.downloads, vec![expected]);
}

#[tokio::test]
async fn test_dialog_is_dismissed_and_reported() {
    let browser = FakeBrowser::new();
    let engine = browser.engine(config()).await;

    browser.open_dialog("T1", "Are you sure?");
    assert!(eventually(|| browser.mock.count("Page.handleJavaScriptDialog") == 1).await);

    let state = engine.get_state(false).await.unwrap();
    assert_eq!(state.dialogs.len(), 1);
    assert_eq!(state.dialogs[0].message, "Are you sure?");
    assert!(state.dialogs[0].accepted);
}

#[tokio::test]
async fn test_event_stream_filters_by_kind() {
    let browser = FakeBrowser::new();
    let engine = browser.engine(config()).await;
    let mut stream = Box::pin(engine.event_stream(&[EventKind::NavigationCompleted]));

    browser.open_dialog("T1", "ignored");
    engine.navigate("https://example.com/streamed").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap();
    match event {
        BrowserEvent::NavigationCompleted { url, .. } => assert_eq!(url, "https://example.com/streamed"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_go_back_and_keys() {
    let browser = FakeBrowser::new();
    let engine = browser.engine(config()).await;

    engine.navigate("https://example.com/b").await.unwrap();
    let result = engine.execute(Action::GoBack).await;
    assert!(result.success, "{:?}", result);
    assert_eq!(browser.url("T1"), START_URL);

    let key = engine
        .execute(Action::PressKey {
            key: "Enter".to_string(),
        })
        .await;
    assert!(key.success, "{:?}", key);
}

#[tokio::test]
async fn test_storage_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");
    let settings = chaser_engine::config::Config {
        storage_state_path: Some(path.to_string_lossy().to_string()),
        save_storage_state: true,
        ..config()
    };

    let first = FakeBrowser::new();
    first.set_cookies(vec![json!({
        "name": "sid", "value": "42", "domain": "example.com", "path": "/",
        "expires": -1, "httpOnly": true, "secure": true, "session": true
    })]);
    first.set_local_storage(&[("token", "abc")]);
    let engine = first.engine(settings.clone()).await;
    engine.shutdown().await.unwrap();

    let saved = StorageState::load(&path).await.unwrap();
    assert_eq!(saved.cookies.len(), 1);
    assert_eq!(saved.cookies[0].name, "sid");
    let origin = saved.origin("https://example.com").unwrap();
    assert_eq!(origin.local_storage[0].name, "token");

    let second = FakeBrowser::new();
    let engine = second.engine(settings).await;
    assert!(eventually(|| second.cookies().len() == 1).await);
    assert_eq!(second.mock.count("Storage.setCookies"), 1);

    let scripts: Vec<String> = second
        .mock
        .calls()
        .into_iter()
        .filter(|c| c.method == "Page.addScriptToEvaluateOnNewDocument")
        .filter_map(|c| c.params["source"].as_str().map(str::to_string))
        .collect();
    assert!(scripts.iter().any(|s| s.contains("\"token\"") && s.contains("https://example.com")));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_port_allocation() {
    let pool = PortPool::new(32_000..=32_199);

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.allocate() })
        })
        .collect();

    let mut leases = Vec::new();
    for task in tasks {
        leases.push(task.await.unwrap().unwrap());
    }

    let ports: HashSet<u16> = leases.iter().map(|l| l.port()).collect();
    assert_eq!(ports.len(), 50);
    assert_eq!(pool.in_use(), 50);
    for port in &ports {
        assert!(std::net::TcpListener::bind(("127.0.0.1", *port)).is_ok());
    }

    drop(leases);
    assert_eq!(pool.in_use(), 0);
}

/// Executable that ignores its arguments and never opens a debugging endpoint
#[cfg(unix)]
fn silent_browser(dir: &std::path::Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("silent-browser");
    std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
#[tokio::test]
async fn test_engines_started_together_share_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let settings = chaser_engine::config::Config {
        chrome_path: Some(silent_browser(dir.path()).to_string_lossy().to_string()),
        port_range_start: 32_400,
        port_range_end: 32_409,
        default_timeout: 600,
        ..config()
    };
    let pool = PortPool::from_config(&settings);

    let first = {
        let (settings, pool) = (settings.clone(), pool.clone());
        tokio::spawn(async move { BrowserEngine::start(settings, &pool).await.map(|_| ()) })
    };
    let second = {
        let (settings, pool) = (settings.clone(), pool.clone());
        tokio::spawn(async move { BrowserEngine::start(settings, &pool).await.map(|_| ()) })
    };

    // both launches are waiting for their endpoint, each on its own port
    assert!(eventually(|| pool.in_use() == 2).await);

    assert!(matches!(first.await.unwrap(), Err(Error::Timeout(_))));
    assert!(matches!(second.await.unwrap(), Err(Error::Timeout(_))));
    assert_eq!(pool.in_use(), 0);
}
