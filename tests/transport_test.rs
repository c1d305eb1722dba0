//! WebSocket transport against a mock DevTools server
//!
//! The server speaks just enough of the protocol to exercise correlation,
//! error classification, event fan-out and connection loss.

use chaser_engine::cdp::{discover_websocket_url, CdpEvent, CdpTransport, CdpWebSocketConnection, CommandTimeouts};
use chaser_engine::Error;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Mock DevTools server: one WebSocket listener plus an HTTP `/json/version` route
struct MockChromeServer {
    ws_url: String,
    http_url: String,
}

impl MockChromeServer {
    async fn start() -> Self {
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        let ws_url = format!("ws://{}/devtools/browser/mock", ws_addr);

        tokio::spawn(async move {
            while let Ok((stream, _)) = ws_listener.accept().await {
                tokio::spawn(Self::handle_connection(stream));
            }
        });

        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_url = format!("http://{}", http_listener.local_addr().unwrap());
        let version = json!({
            "Browser": "MockChrome/1.0",
            "Protocol-Version": "1.3",
            "webSocketDebuggerUrl": ws_url,
        })
        .to_string();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = http_listener.accept().await {
                let body = version.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        Self { ws_url, http_url }
    }

    async fn handle_connection(stream: TcpStream) {
        let Ok(ws_stream) = accept_async(stream).await else {
            return;
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<Value>>();

        // single writer; `None` closes the socket
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Some(value) => {
                        if ws_sender.send(Message::Text(value.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = ws_sender.close().await;
                        break;
                    }
                }
            }
        });

        while let Some(Ok(message)) = ws_receiver.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(request) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            Self::respond(&request, &tx);
        }
    }

    fn respond(request: &Value, tx: &mpsc::UnboundedSender<Option<Value>>) {
        let id = request["id"].as_u64().unwrap_or(0);
        let method = request["method"].as_str().unwrap_or_default();
        let session = request.get("sessionId").cloned();

        match method {
            "Browser.getVersion" => {
                let _ = tx.send(Some(json!({ "id": id, "result": { "product": "MockChrome/1.0" } })));
            }
            "Test.echo" => {
                let delay = request["params"]["delayMs"].as_u64().unwrap_or(0);
                let frame = json!({ "id": id, "result": { "echo": request["params"]["value"] } });
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let _ = tx.send(Some(frame));
                });
            }
            "Runtime.evaluate" => {
                let _ = tx.send(Some(json!({
                    "id": id,
                    "error": { "code": -32001, "message": "Session with given id not found." }
                })));
            }
            "Target.closeTarget" => {
                let _ = tx.send(Some(json!({
                    "id": id,
                    "error": { "code": -32602, "message": "No target with given id found" }
                })));
            }
            "Page.navigate" => {
                let _ = tx.send(Some(json!({
                    "id": id,
                    "error": { "code": -32000, "message": "Cannot navigate to invalid URL" }
                })));
            }
            "Page.enable" => {
                let mut event = json!({ "method": "Page.loadEventFired", "params": { "timestamp": 1.5 } });
                if let Some(session) = session {
                    event["sessionId"] = session;
                }
                let _ = tx.send(Some(event));
                let _ = tx.send(Some(json!({ "id": id, "result": {} })));
            }
            "Test.hang" => {}
            "Test.drop" => {
                let _ = tx.send(None);
            }
            _ => {
                let _ = tx.send(Some(json!({ "id": id, "result": {} })));
            }
        }
    }
}

async fn connect(server: &MockChromeServer) -> Arc<CdpWebSocketConnection> {
    CdpWebSocketConnection::connect(server.ws_url.clone())
        .await
        .expect("connects to mock server")
}

#[tokio::test]
async fn test_discovery_resolves_websocket_url() {
    let server = MockChromeServer::start().await;

    let discovered = discover_websocket_url(&server.http_url, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(discovered, server.ws_url);

    // a browser WebSocket URL is used as is
    let direct = discover_websocket_url(&server.ws_url, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(direct, server.ws_url);
}

#[tokio::test]
async fn test_responses_are_correlated() {
    let server = MockChromeServer::start().await;
    let connection = connect(&server).await;

    let version = connection.send("Browser.getVersion", json!({}), None).await.unwrap();
    assert_eq!(version["product"], "MockChrome/1.0");

    // the slow reply arrives last but resolves its own caller
    let (slow, fast) = tokio::join!(
        connection.send("Test.echo", json!({ "value": "slow", "delayMs": 150 }), None),
        connection.send("Test.echo", json!({ "value": "fast", "delayMs": 0 }), None),
    );
    assert_eq!(slow.unwrap()["echo"], "slow");
    assert_eq!(fast.unwrap()["echo"], "fast");
}

#[tokio::test]
async fn test_errors_are_classified() {
    let server = MockChromeServer::start().await;
    let connection = connect(&server).await;

    let stale = connection
        .send("Runtime.evaluate", json!({ "expression": "1" }), Some("S-9"))
        .await
        .unwrap_err();
    assert!(matches!(stale, Error::SessionStale(ref id) if id == "S-9"));

    let gone = connection
        .send("Target.closeTarget", json!({ "targetId": "T-404" }), None)
        .await
        .unwrap_err();
    assert!(matches!(gone, Error::TargetGone(_)));

    let other = connection
        .send("Page.navigate", json!({ "url": "bogus" }), Some("S-1"))
        .await
        .unwrap_err();
    assert!(matches!(other, Error::Protocol { code: -32000, .. }));
}

#[tokio::test]
async fn test_events_reach_subscribers() {
    let server = MockChromeServer::start().await;
    let connection = connect(&server).await;

    let mut events = connection.subscribe();
    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.on(
        "Page.loadEventFired",
        Arc::new(move |event: CdpEvent| {
            let _ = tx.send(event);
        }),
    );

    connection.send("Page.enable", json!({}), Some("S-1")).await.unwrap();

    let handled = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handled.session_id.as_deref(), Some("S-1"));
    assert_eq!(handled.params["timestamp"], 1.5);

    let streamed = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(streamed.method, "Page.loadEventFired");
}

#[tokio::test]
async fn test_command_timeout() {
    let server = MockChromeServer::start().await;
    let connection = connect(&server).await;

    let result = connection
        .send_with_timeout("Test.hang", json!({}), None, Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));

    // the connection stays usable
    assert!(connection.send("Browser.getVersion", json!({}), None).await.is_ok());
}

#[tokio::test]
async fn test_connection_loss_fails_pending_commands() {
    let server = MockChromeServer::start().await;
    let connection = CdpWebSocketConnection::connect_with_timeouts(
        server.ws_url.clone(),
        CommandTimeouts {
            default: Duration::from_secs(5),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let hanging = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.send("Test.hang", json!({}), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _ = connection.send("Test.drop", json!({}), None).await;

    let result = tokio::time::timeout(Duration::from_secs(2), hanging)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Connection(_))));
    assert!(!connection.is_active());

    let after = connection.send("Browser.getVersion", json!({}), None).await;
    assert!(matches!(after, Err(Error::Connection(_))));
}

#[tokio::test]
async fn test_close_is_final() {
    let server = MockChromeServer::start().await;
    let connection = connect(&server).await;

    assert!(connection.is_active());
    connection.close().await.unwrap();
    assert!(!connection.is_active());

    let result = connection.send("Browser.getVersion", json!({}), None).await;
    assert!(matches!(result, Err(Error::Connection(_))));
}
