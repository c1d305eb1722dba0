//! Browser endpoint discovery
//!
//! Resolves a user supplied endpoint to the browser-level WebSocket URL using
//! the `/json/version` metadata route.

use super::types::BrowserVersion;
use crate::Error;
use std::time::Duration;
use tracing::{debug, info};

/// Convert a WebSocket or HTTP endpoint into its HTTP base (`http://host:port`)
pub fn http_base(endpoint: &str) -> String {
    let converted = endpoint
        .trim_end_matches('/')
        .replacen("ws://", "http://", 1)
        .replacen("wss://", "https://", 1);

    // drop any /devtools/... path
    match converted.find("/devtools/") {
        Some(idx) => converted[..idx].to_string(),
        None => converted,
    }
}

/// Whether the endpoint already names a browser-level WebSocket
fn is_browser_websocket(endpoint: &str) -> bool {
    (endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) && endpoint.contains("/devtools/browser/")
}

/// Fetch `/json/version` from the browser
pub async fn fetch_version(endpoint: &str, timeout: Duration) -> Result<BrowserVersion, Error> {
    let url = format!("{}/json/version", http_base(endpoint));
    debug!("Fetching browser version from {}", url);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::http(format!("Failed to create HTTP client: {}", e)))?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::http(format!("Failed to connect to browser at {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(Error::http(format!("{} returned {}", url, response.status())));
    }

    response
        .json::<BrowserVersion>()
        .await
        .map_err(|e| Error::http(format!("Failed to parse version: {}", e)))
}

/// Resolve the browser-level WebSocket URL for an endpoint
pub async fn discover_websocket_url(endpoint: &str, timeout: Duration) -> Result<String, Error> {
    if is_browser_websocket(endpoint) {
        return Ok(endpoint.to_string());
    }

    let version = fetch_version(endpoint, timeout).await?;
    let ws_url = version
        .web_socket_debugger_url
        .ok_or_else(|| Error::http("No webSocketDebuggerUrl in /json/version response"))?;

    info!("Discovered browser {} at {}", version.product, ws_url);
    Ok(ws_url)
}
