//! DOM snapshot tests against a scripted page

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{BusConfig, EventBus};
use crate::cdp::{MockCall, MockReply, MockTransport};
use crate::dom::{DomService, DomSettings, ElementHandle, NodeKind, Rect};
use crate::retry::RetryPolicy;
use crate::session::SessionManager;
use crate::Error;

fn el(backend: i64, tag: &str, attrs: &[(&str, &str)], children: Vec<Value>) -> Value {
    let flat: Vec<&str> = attrs.iter().flat_map(|(k, v)| [*k, *v]).collect();
    json!({
        "nodeId": backend,
        "backendNodeId": backend,
        "nodeType": 1,
        "nodeName": tag.to_uppercase(),
        "localName": tag,
        "attributes": flat,
        "children": children,
    })
}

fn text(backend: i64, value: &str) -> Value {
    json!({ "nodeId": backend, "backendNodeId": backend, "nodeType": 3, "nodeName": "#text", "nodeValue": value })
}

fn doc(backend: i64, url: &str, children: Vec<Value>) -> Value {
    json!({
        "nodeId": backend,
        "backendNodeId": backend,
        "nodeType": 9,
        "nodeName": "#document",
        "documentURL": url,
        "children": children,
    })
}

/// `(backend, [x, y, w, h], pointer cursor)`
fn layout(boxes: &[(i64, [f64; 4], bool)]) -> Value {
    let backends: Vec<i64> = boxes.iter().map(|b| b.0).collect();
    let bounds: Vec<[f64; 4]> = boxes.iter().map(|b| b.1).collect();
    let styles: Vec<[u32; 5]> = boxes
        .iter()
        .map(|b| [0, 1, 2, if b.2 { 3 } else { 5 }, 4])
        .collect();
    json!({
        "strings": ["block", "visible", "1", "pointer", "auto", "default"],
        "documents": [{
            "nodes": { "backendNodeId": backends },
            "layout": {
                "nodeIndex": (0..boxes.len()).collect::<Vec<_>>(),
                "bounds": bounds,
                "styles": styles,
            }
        }]
    })
}

fn main_document() -> Value {
    let mut same_origin = el(18, "iframe", &[("src", "/inner")], vec![]);
    same_origin["contentDocument"] = doc(
        19,
        "https://example.com/inner",
        vec![el(20, "html", &[], vec![el(21, "body", &[], vec![
            el(22, "button", &[], vec![text(23, "Inner")]),
        ])])],
    );
    let mut cross_origin = el(24, "iframe", &[("src", "https://other.test/")], vec![]);
    cross_origin["frameId"] = json!("F-OOP");

    doc(1, "https://example.com/", vec![el(2, "html", &[], vec![
        el(3, "head", &[], vec![]),
        el(4, "body", &[], vec![
            el(5, "button", &[("id", "go")], vec![text(6, "Go")]),
            el(7, "label", &[], vec![
                el(8, "input", &[("type", "checkbox")], vec![]),
                text(9, "Remember me"),
            ]),
            el(10, "label", &[("for", "email")], vec![text(11, "Email")]),
            el(12, "input", &[("id", "email")], vec![]),
            el(13, "a", &[], vec![text(14, "plain anchor")]),
            el(15, "div", &[("aria-hidden", "true")], vec![
                el(16, "button", &[], vec![text(17, "hidden")]),
            ]),
            same_origin,
            cross_origin,
        ]),
    ])])
}

fn main_layout() -> Value {
    layout(&[
        (2, [0.0, 0.0, 1280.0, 1000.0], false),
        (4, [0.0, 0.0, 1280.0, 1000.0], false),
        (5, [10.0, 10.0, 80.0, 20.0], true),
        (7, [10.0, 40.0, 120.0, 20.0], true),
        (8, [12.0, 42.0, 16.0, 16.0], false),
        (10, [10.0, 70.0, 60.0, 20.0], true),
        (12, [80.0, 70.0, 100.0, 20.0], false),
        (13, [10.0, 100.0, 80.0, 20.0], false),
        (15, [10.0, 130.0, 80.0, 20.0], false),
        (16, [10.0, 130.0, 80.0, 20.0], true),
        (18, [0.0, 200.0, 300.0, 150.0], false),
        (22, [5.0, 5.0, 50.0, 20.0], true),
        (24, [0.0, 400.0, 300.0, 150.0], false),
    ])
}

fn oopif_document() -> Value {
    doc(101, "https://other.test/", vec![el(102, "html", &[], vec![el(104, "body", &[], vec![
        el(103, "button", &[], vec![text(105, "Pay")]),
    ])])])
}

fn target_of(call: &MockCall) -> String {
    call.session_id
        .as_deref()
        .and_then(|s| s.strip_prefix("S-"))
        .unwrap_or_default()
        .to_string()
}

fn respond(call: &MockCall) -> MockReply {
    match call.method.as_str() {
        "Target.getTargets" => MockReply::Result(json!({ "targetInfos": [
            { "targetId": "T1", "type": "page", "url": "https://example.com/" },
            { "targetId": "F-OOP", "type": "iframe", "url": "https://other.test/" },
        ]})),
        "Target.attachToTarget" => {
            let target = call.params["targetId"].as_str().unwrap_or_default();
            MockReply::Result(json!({ "sessionId": format!("S-{}", target) }))
        }
        "DOM.getDocument" => match target_of(call).as_str() {
            "T1" => MockReply::Result(json!({ "root": main_document() })),
            _ => MockReply::Result(json!({ "root": oopif_document() })),
        },
        "DOMSnapshot.captureSnapshot" => match target_of(call).as_str() {
            "T1" => MockReply::Result(main_layout()),
            _ => MockReply::Result(layout(&[(103, [10.0, 10.0, 40.0, 20.0], true)])),
        },
        "Accessibility.getFullAXTree" => MockReply::Result(json!({ "nodes": [
            { "backendDOMNodeId": 5, "role": { "value": "button" }, "name": { "value": "Go" } },
            { "backendDOMNodeId": 13, "role": { "value": "generic" }, "ignored": false },
        ]})),
        _ => MockReply::ok(),
    }
}

async fn service(settings: DomSettings) -> (Arc<MockTransport>, Arc<SessionManager>, DomService) {
    let mock = MockTransport::with_responder(|call, _| respond(call));
    let manager = SessionManager::new(
        mock.clone(),
        EventBus::new(BusConfig::default()),
        RetryPolicy::default(),
    );
    manager.start().await.unwrap();
    let dom = DomService::new(Arc::clone(&manager), settings);
    (mock, manager, dom)
}

#[tokio::test]
async fn test_snapshot_indexes_interactive_elements_in_preorder() {
    let (_mock, _manager, dom) = service(DomSettings::default()).await;
    let tree = dom.snapshot("T1").await.unwrap();

    assert_eq!(tree.url(), "https://example.com/");
    let indexed: Vec<(usize, i64)> = tree
        .element_index()
        .iter()
        .map(|s| {
            let node = tree.by_index(s.index).unwrap();
            (s.index, node.backend_node_id)
        })
        .collect();

    // button, wrapping label, its checkbox, email input, same-origin button, cross-origin button
    assert_eq!(indexed, vec![(1, 5), (2, 7), (3, 8), (4, 12), (5, 22), (6, 103)]);
    assert_eq!(tree.by_index(1).unwrap().role.as_deref(), Some("button"));
    assert_eq!(tree.element_text(tree.by_index(2).unwrap().id), "Remember me");
}

#[tokio::test]
async fn test_iframes_are_nested_under_their_placeholder() {
    let (_mock, _manager, dom) = service(DomSettings::default()).await;
    let tree = dom.snapshot("T1").await.unwrap();

    let inner = tree.by_backend_id("T1", 22).unwrap();
    assert_eq!(inner.frame_depth, 1);
    assert_eq!(inner.bounds, Some(Rect::new(5.0, 205.0, 50.0, 20.0)));
    assert_eq!(inner.xpath, "/html[1]/body[1]/iframe[1]/#document/html[1]/body[1]/button[1]");

    let pay = tree.by_backend_id("F-OOP", 103).unwrap();
    assert_eq!(&*pay.target_id, "F-OOP");
    assert_eq!(pay.bounds, Some(Rect::new(10.0, 410.0, 40.0, 20.0)));
    assert_eq!(pay.frame_offset, (0.0, 400.0));

    let placeholder = tree.by_backend_id("T1", 24).unwrap();
    let grafted = placeholder.content_document.unwrap();
    assert_eq!(tree.node(grafted).unwrap().kind, NodeKind::Document);
    assert!(placeholder.children.contains(&grafted));

    // everything is reachable from the root through children only
    assert_eq!(tree.preorder().len(), tree.len());
    for id in tree.preorder() {
        if let Some(parent) = tree.node(id).unwrap().parent {
            assert!(tree.node(parent).unwrap().children.contains(&id));
        }
    }
}

#[tokio::test]
async fn test_iframe_depth_limit_zero_skips_frame_content() {
    let settings = DomSettings {
        max_iframe_depth: 0,
        ..DomSettings::default()
    };
    let (mock, _manager, dom) = service(settings).await;
    let tree = dom.snapshot("T1").await.unwrap();

    assert!(tree.by_backend_id("T1", 22).is_none());
    assert!(tree.by_backend_id("F-OOP", 103).is_none());
    assert_eq!(tree.interactive_count(), 4);
    assert!(mock
        .calls()
        .iter()
        .all(|c| c.session_id.as_deref() != Some("S-F-OOP")));
}

#[tokio::test]
async fn test_cross_origin_disabled_keeps_same_origin_frames() {
    let settings = DomSettings {
        cross_origin_iframes: false,
        ..DomSettings::default()
    };
    let (_mock, _manager, dom) = service(settings).await;
    let tree = dom.snapshot("T1").await.unwrap();

    assert!(tree.by_backend_id("T1", 22).is_some());
    assert!(tree.by_backend_id("F-OOP", 103).is_none());
}

#[tokio::test]
async fn test_navigation_during_capture_invalidates_snapshot() {
    let (mock, _manager, dom) = service(DomSettings::default()).await;
    mock.set_responder(|call, emitter| {
        if call.method == "DOM.getDocument" {
            emitter.emit(
                "Page.frameNavigated",
                json!({ "frame": { "id": "T1", "url": "https://example.com/elsewhere" } }),
                call.session_id.as_deref(),
            );
            return MockReply::Delayed(
                Duration::from_millis(50),
                Box::new(MockReply::Result(json!({ "root": main_document() }))),
            );
        }
        respond(call)
    });

    let err = dom.snapshot("T1").await.unwrap_err();
    assert!(matches!(err, Error::SnapshotInvalidated(_)));
    assert!(dom.latest("T1").is_none());
}

#[tokio::test]
async fn test_navigation_with_late_event_still_invalidates_snapshot() {
    let (mock, manager, dom) = service(DomSettings::default()).await;
    let navigated = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&navigated);
    // replies reflect the new document long before its event is delivered
    mock.set_responder(move |call, emitter| match call.method.as_str() {
        "DOMSnapshot.captureSnapshot" if target_of(call) == "T1" => {
            flag.store(true, Ordering::SeqCst);
            emitter.emit_after(
                Duration::from_secs(5),
                "Page.frameNavigated",
                json!({ "frame": { "id": "T1", "url": "https://example.com/next" } }),
                call.session_id.as_deref(),
            );
            MockReply::Result(main_layout())
        }
        "DOM.getDocument" if target_of(call) == "T1" && flag.load(Ordering::SeqCst) => {
            MockReply::Result(json!({ "root": doc(500, "https://example.com/next", vec![]) }))
        }
        _ => respond(call),
    });

    let err = dom.snapshot("T1").await.unwrap_err();
    assert!(matches!(err, Error::SnapshotInvalidated(_)));
    assert!(navigated.load(Ordering::SeqCst));
    assert_eq!(manager.navigation_epoch("T1"), 0);
    assert!(dom.latest("T1").is_none());
}

#[tokio::test]
async fn test_snapshot_reads_document_identity_around_capture() {
    let (mock, _manager, dom) = service(DomSettings::default()).await;
    dom.snapshot("T1").await.unwrap();

    let depths: Vec<i64> = mock
        .calls()
        .iter()
        .filter(|c| c.method == "DOM.getDocument" && c.session_id.as_deref() == Some("S-T1"))
        .filter_map(|c| c.params["depth"].as_i64())
        .collect();
    assert_eq!(depths, vec![0, -1, 0]);
}

#[tokio::test]
async fn test_snapshot_timeout() {
    let settings = DomSettings {
        timeout: Duration::from_millis(50),
        ..DomSettings::default()
    };
    let (mock, _manager, dom) = service(settings).await;
    mock.set_responder(|call, _| match call.method.as_str() {
        "Accessibility.getFullAXTree" => MockReply::Hang,
        _ => respond(call),
    });

    let err = dom.snapshot("T1").await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

#[tokio::test]
async fn test_handle_re_resolves_by_xpath() {
    let (_mock, _manager, dom) = service(DomSettings::default()).await;
    let tree = dom.snapshot("T1").await.unwrap();

    let handle = tree.handle(1).unwrap();
    assert_eq!(handle.backend_node_id, 5);
    assert!(Arc::ptr_eq(&dom.latest("T1").unwrap(), &tree));

    // backend id from an older document
    let stale = ElementHandle {
        backend_node_id: 9999,
        ..handle.clone()
    };
    assert_eq!(tree.resolve(&stale).unwrap().backend_node_id, 5);

    let unknown = ElementHandle {
        backend_node_id: 9999,
        index: None,
        xpath: Some("/html[1]/body[1]/section[1]".to_string()),
        target_id: "T1".to_string(),
    };
    assert!(tree.resolve(&unknown).is_none());
}

#[tokio::test]
async fn test_render_index_lists_elements() {
    let (_mock, _manager, dom) = service(DomSettings::default()).await;
    let tree = dom.snapshot("T1").await.unwrap();
    let rendered = tree.render_index();

    assert!(rendered.starts_with("[1]<button id=go>Go</button>"));
    assert!(rendered.contains("[6]<button>Pay</button>"));
    assert!(!rendered.contains("Email"));
}
