//! Watchdog tests

use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::bus::{BusConfig, DownloadState, EventBus};
use crate::cdp::{MockCall, MockReply, MockTransport};
use crate::retry::RetryPolicy;
use crate::session::SessionManager;

const IDLE: Duration = Duration::from_secs(2);

fn respond(call: &MockCall) -> MockReply {
    match call.method.as_str() {
        "Target.getTargets" => MockReply::Result(json!({ "targetInfos": [
            { "targetId": "T1", "type": "page", "url": "https://a.test/" },
        ]})),
        "Target.attachToTarget" => {
            let target = call.params["targetId"].as_str().unwrap_or_default();
            MockReply::Result(json!({ "sessionId": format!("S-{}", target) }))
        }
        "Target.createTarget" => MockReply::Result(json!({ "targetId": "T9" })),
        _ => MockReply::ok(),
    }
}

async fn manager_with<F>(responder: F) -> (Arc<MockTransport>, Arc<SessionManager>)
where
    F: Fn(&MockCall) -> MockReply + Send + Sync + 'static,
{
    let mock = MockTransport::with_responder(move |call, _| responder(call));
    let manager = SessionManager::new(mock.clone(), EventBus::new(BusConfig::default()), RetryPolicy::default());
    (mock, manager)
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn request(request_id: &str, resource_type: &str) -> BrowserEvent {
    BrowserEvent::NetworkRequest {
        target_id: "T1".to_string(),
        request_id: request_id.to_string(),
        method: "GET".to_string(),
        url: format!("https://a.test/{}", request_id),
        resource_type: resource_type.to_string(),
        headers: [("Accept".to_string(), "*/*".to_string())].into_iter().collect(),
        timestamp: 1.0,
    }
}

#[tokio::test]
async fn test_network_log_is_bounded_and_filtered() {
    let (mock, manager) = manager_with(respond).await;
    let watchdog = Arc::new(NetworkWatchdog::new(
        Arc::downgrade(&manager),
        3,
        vec!["Image".to_string()],
    ));
    attach(watchdog.clone(), manager.bus());

    let bus = manager.bus();
    manager.get_or_create_session("T1", false).await.unwrap();
    for id in ["r1", "r2", "r3", "r4"] {
        bus.dispatch(request(id, "Document"));
    }
    bus.dispatch(request("img", "Image"));
    bus.dispatch(BrowserEvent::NetworkResponse {
        target_id: "T1".to_string(),
        request_id: "r4".to_string(),
        status: 404,
        status_text: "Not Found".to_string(),
        mime_type: "text/html".to_string(),
        headers: [("Content-Type".to_string(), "text/html".to_string())].into_iter().collect(),
        timestamp: 2.0,
    });
    bus.dispatch(BrowserEvent::NetworkFailed {
        target_id: "T1".to_string(),
        request_id: "r3".to_string(),
        error_text: "net::ERR_ABORTED".to_string(),
        canceled: true,
        timestamp: 2.5,
    });
    bus.wait_until_idle(IDLE).await.unwrap();

    let entries = watchdog.entries("T1");
    let ids: Vec<&str> = entries.iter().map(|e| e.request_id.as_str()).collect();
    assert_eq!(ids, vec!["r2", "r3", "r4"]);
    assert_eq!(entries[2].status, Some(404));
    let response_headers = entries[2].response_headers.as_ref().unwrap();
    assert_eq!(response_headers.get("Content-Type").map(String::as_str), Some("text/html"));
    assert_eq!(
        entries[0].request_headers.as_ref().and_then(|h| h.get("Accept")).map(String::as_str),
        Some("*/*")
    );
    assert!(entries[0].response_headers.is_none());
    assert_eq!(entries[1].error.as_deref(), Some("net::ERR_ABORTED"));
    assert_eq!(watchdog.pending("T1"), 2);
    assert_eq!(mock.count("Network.enable"), 1);

    bus.dispatch(BrowserEvent::TabClosed {
        target_id: "T1".to_string(),
    });
    bus.wait_until_idle(IDLE).await.unwrap();
    assert!(watchdog.entries("T1").is_empty());
}

#[tokio::test]
async fn test_storage_round_trip_keeps_origins_apart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("storage.json");

    // capture from a browser showing https://a.test
    let (_mock, manager) = manager_with(|call| match call.method.as_str() {
        "Storage.getCookies" => MockReply::Result(json!({ "cookies": [
            { "name": "sid", "value": "42", "domain": "a.test", "path": "/", "expires": -1,
              "session": true, "httpOnly": true, "secure": true, "sameSite": "Lax" }
        ]})),
        "Runtime.evaluate" => MockReply::Result(json!({ "result": { "type": "object", "value": {
            "origin": "https://a.test",
            "localStorage": [{ "name": "token-a", "value": "A" }],
            "sessionStorage": [{ "name": "tab", "value": "1" }]
        }}})),
        _ => respond(call),
    })
    .await;
    manager.start().await.unwrap();

    let previous = StorageState {
        cookies: vec![],
        origins: vec![OriginState {
            origin: "https://b.test".to_string(),
            local_storage: vec![StorageEntry {
                name: "token-b".to_string(),
                value: "B".to_string(),
            }],
            session_storage: vec![],
        }],
    };
    let capture = StorageWatchdog::new(Arc::downgrade(&manager), previous, Some(path.clone()));
    let saved = capture.save().await.unwrap();
    assert_eq!(saved.cookies.len(), 1);
    assert_eq!(saved.origins.len(), 2);

    // replay into a fresh browser
    let (mock, fresh) = manager_with(respond).await;
    let replay = Arc::new(
        StorageWatchdog::from_path(Arc::downgrade(&fresh), Some(path.clone()))
            .await
            .unwrap(),
    );
    assert_eq!(replay.state(), saved);
    attach(replay, fresh.bus());
    fresh.start().await.unwrap();
    fresh.get_or_create_session("T1", true).await.unwrap();
    fresh.bus().wait_until_idle(IDLE).await.unwrap();

    let calls = mock.calls();
    let set_cookies: Vec<&MockCall> = calls.iter().filter(|c| c.method == "Storage.setCookies").collect();
    assert_eq!(set_cookies.len(), 1);
    assert_eq!(set_cookies[0].params["cookies"][0]["name"], "sid");
    assert_eq!(set_cookies[0].params["cookies"][0]["value"], "42");

    let scripts: Vec<String> = calls
        .iter()
        .filter(|c| c.method == "Page.addScriptToEvaluateOnNewDocument")
        .map(|c| c.params["source"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(scripts.len(), 2);
    let for_a = scripts.iter().find(|s| s.contains(r#""https://a.test""#)).unwrap();
    let for_b = scripts.iter().find(|s| s.contains(r#""https://b.test""#)).unwrap();
    assert!(for_a.contains("token-a") && !for_a.contains("token-b"));
    assert!(for_b.contains("token-b") && !for_b.contains("token-a"));
    assert!(for_a.contains(r#"window.location.origin !== "https://a.test""#));
}

#[tokio::test]
async fn test_dialogs_are_answered() {
    let (mock, manager) = manager_with(respond).await;
    manager.start().await.unwrap();
    let watchdog = Arc::new(DialogWatchdog::new(Arc::downgrade(&manager)));
    attach(watchdog.clone(), manager.bus());

    manager.bus().dispatch(BrowserEvent::DialogOpened {
        target_id: "T1".to_string(),
        session_id: "S-T1".to_string(),
        dialog_type: "prompt".to_string(),
        message: "Your name?".to_string(),
        default_prompt: Some("guest".to_string()),
    });
    manager.bus().wait_until_idle(IDLE).await.unwrap();

    let handled: Vec<MockCall> = mock
        .calls()
        .into_iter()
        .filter(|c| c.method == "Page.handleJavaScriptDialog")
        .collect();
    assert_eq!(handled.len(), 1);
    assert_eq!(handled[0].params["accept"], true);
    assert_eq!(handled[0].params["promptText"], "guest");
    assert_eq!(handled[0].session_id.as_deref(), Some("S-T1"));

    let recent = watchdog.recent();
    assert_eq!(recent.len(), 1);
    assert!(recent[0].accepted);
    assert_eq!(recent[0].message, "Your name?");
}

#[tokio::test]
async fn test_downloads_get_unique_names() {
    let dir = tempfile::tempdir().unwrap();
    let (mock, manager) = manager_with(respond).await;
    let watchdog = Arc::new(DownloadWatchdog::new(Arc::downgrade(&manager), dir.path().to_path_buf()));
    watchdog.configure().await.unwrap();
    attach(watchdog.clone(), manager.bus());
    assert_eq!(mock.count("Browser.setDownloadBehavior"), 1);

    let mut waiter = manager.bus().waiter();
    for guid in ["g1", "g2"] {
        std::fs::write(dir.path().join(guid), guid).unwrap();
        manager.bus().dispatch(BrowserEvent::DownloadStarted {
            guid: guid.to_string(),
            url: "https://a.test/report.pdf".to_string(),
            suggested_filename: "report.pdf".to_string(),
        });
        manager.bus().dispatch(BrowserEvent::DownloadProgress {
            guid: guid.to_string(),
            state: DownloadState::Completed,
            received_bytes: 2,
            total_bytes: 2,
        });
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    while paths.len() < 2 {
        let path = waiter
            .next_matching(IDLE, |event| match event {
                BrowserEvent::DownloadCompleted { path, .. } => Some(path.clone()),
                _ => None,
            })
            .await
            .unwrap();
        paths.push(path);
    }

    assert_eq!(paths[0], dir.path().join("report.pdf"));
    assert_eq!(paths[1], dir.path().join("report (1).pdf"));
    assert_eq!(std::fs::read_to_string(&paths[1]).unwrap(), "g2");
    assert_eq!(watchdog.completed().len(), 2);
}

#[tokio::test]
async fn test_tabs_follow_opened_tabs_and_refocus() {
    let (mock, manager) = manager_with(respond).await;
    let watchdog = Arc::new(TabsWatchdog::new(
        Arc::downgrade(&manager),
        Some(Viewport {
            width: 800,
            height: 600,
        }),
        true,
    ));
    attach(watchdog, manager.bus());
    manager.start().await.unwrap();

    // the first page takes focus
    assert!(eventually(|| manager.focused_target().as_deref() == Some("T1")).await);
    assert!(eventually(|| mock.count("Emulation.setDeviceMetricsOverride") == 1).await);

    // a tab opened by the focused one takes focus
    mock.emit(
        "Target.targetCreated",
        json!({ "targetInfo": { "targetId": "T2", "type": "page", "url": "https://a.test/popup", "openerId": "T1" } }),
        None,
    );
    assert!(eventually(|| manager.focused_target().as_deref() == Some("T2")).await);

    // closing it hands focus back
    manager.bus().dispatch(BrowserEvent::CloseTabRequested {
        target_id: "T2".to_string(),
    });
    assert!(eventually(|| manager.focused_target().as_deref() == Some("T1")).await);
    assert_eq!(mock.count("Target.closeTarget"), 1);

    manager.bus().dispatch(BrowserEvent::NavigateRequested {
        target_id: None,
        url: "https://a.test/next".to_string(),
        new_tab: false,
    });
    manager.bus().wait_until_idle(IDLE).await.unwrap();
    let navigate = mock
        .calls()
        .into_iter()
        .find(|c| c.method == "Page.navigate")
        .unwrap();
    assert_eq!(navigate.session_id.as_deref(), Some("S-T1"));
    assert_eq!(navigate.params["url"], "https://a.test/next");
}
