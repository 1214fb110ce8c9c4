//! HTTP/SSE client for `BLE_MODE = "remote"`, spec.md §4.5.
//!
//! `mcappd` runs on a machine without BLE hardware and talks to a
//! [`crate::ble_service`] instance over the network instead of opening
//! `btleplug` itself. Grounded on the teacher's `control::client` (typed
//! `reqwest` client wrapping a handful of named endpoints, one method per
//! call) adapted from the simulator's control-plane calls to this crate's
//! BLE Remote Service routes.

use crate::ble::wire::BleNotification;
use crate::errors::BleError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

/// Per-call timeout, spec.md §5.
const CALL_TIMEOUT: Duration = Duration::from_secs(15);
/// Retries on transport errors and `409 Conflict` (the device mid-reconnect
/// on the remote side), spec.md §5.
const RETRY_ATTEMPTS: usize = 2;
const RETRY_DELAY: Duration = Duration::from_millis(1500);

pub struct RemoteBleClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct RemoteStatus {
    pub state: String,
    pub device_name: Option<String>,
    pub device_address: Option<String>,
    pub last_activity_ms: Option<i64>,
}

impl RemoteBleClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder().timeout(CALL_TIMEOUT).build().unwrap_or_default();
        Self { base_url: base_url.trim_end_matches('/').to_string(), api_key, http }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }
        req
    }

    async fn call_with_retry<F, Fut>(&self, mut issue: F) -> Result<reqwest::Response, BleError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut last_err = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            match issue().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::CONFLICT && attempt < RETRY_ATTEMPTS => {
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < RETRY_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(BleError::Io(last_err.map(|e| e.to_string()).unwrap_or_else(|| "remote BLE call failed".to_string())))
    }

    fn map_status(status: reqwest::StatusCode) -> BleError {
        match status.as_u16() {
            404 => BleError::DeviceNotFound,
            409 => BleError::AlreadyConnected,
            400 => BleError::Oversize { len: 0, max: 0 },
            _ => BleError::Io(format!("remote BLE service returned {status}")),
        }
    }

    pub async fn status(&self) -> Result<RemoteStatus, BleError> {
        let resp = self.call_with_retry(|| self.request(reqwest::Method::GET, "/api/ble/status").send()).await?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        resp.json().await.map_err(|e| BleError::Io(e.to_string()))
    }

    pub async fn connect(&self, device_address: Option<&str>, device_name: Option<&str>) -> Result<(), BleError> {
        let body = json!({ "device_address": device_address, "device_name": device_name });
        let resp = self
            .call_with_retry(|| self.request(reqwest::Method::POST, "/api/ble/connect").json(&body).send())
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::map_status(resp.status()))
        }
    }

    pub async fn disconnect(&self) -> Result<(), BleError> {
        let resp = self.call_with_retry(|| self.request(reqwest::Method::POST, "/api/ble/disconnect").send()).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::map_status(resp.status()))
        }
    }

    pub async fn send_command(&self, command: &str) -> Result<(), BleError> {
        let body = json!({ "command": command });
        let resp = self.call_with_retry(|| self.request(reqwest::Method::POST, "/api/ble/send").json(&body).send()).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::map_status(resp.status()))
        }
    }

    pub async fn send_group_message(&self, group: &str, message: &str) -> Result<(), BleError> {
        let body = json!({ "group": group, "message": message });
        let resp = self.call_with_retry(|| self.request(reqwest::Method::POST, "/api/ble/send").json(&body).send()).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::map_status(resp.status()))
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct WireNotification {
    raw_base64: String,
    format: String,
    #[serde(default)]
    parsed: Option<serde_json::Value>,
}

/// Subscribe to `/api/ble/notifications` and forward decoded frames to
/// `notify_tx` until the stream ends, reconnecting is the caller's concern
/// (mirrors [`crate::ble::conn::BleConnection::run_notification_pump`]'s
/// contract so `mcappd` can treat direct and remote BLE uniformly).
pub async fn run_notification_stream(
    base_url: &str,
    api_key: Option<&str>,
    notify_tx: mpsc::Sender<BleNotification>,
) -> Result<(), BleError> {
    let url = format!("{}/api/ble/notifications", base_url.trim_end_matches('/'));
    let mut req = reqwest::Client::new().get(&url);
    if let Some(key) = api_key {
        req = req.header("X-API-Key", key);
    }
    let resp = req.send().await.map_err(|e| BleError::Io(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(RemoteBleClient::map_status(resp.status()));
    }

    let mut stream = resp.bytes_stream();
    let mut buf = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| BleError::Io(e.to_string()))?;
        buf.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buf.find("\n\n") {
            let event = buf[..pos].to_string();
            buf.drain(..pos + 2);
            if let Some(data_line) = event.lines().find(|l| l.starts_with("data:")) {
                let payload = data_line.trim_start_matches("data:").trim();
                if let Ok(wire) = serde_json::from_str::<WireNotification>(payload) {
                    if let Some(notification) = decode_wire_notification(&wire) {
                        if notify_tx.send(notification).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn decode_wire_notification(wire: &WireNotification) -> Option<BleNotification> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD.decode(&wire.raw_base64).ok()?;
    if wire.format == "unknown" {
        return Some(BleNotification::Unknown(raw));
    }
    Some(crate::ble::wire::decode_notification(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_status_translates_404_and_409() {
        assert!(matches!(RemoteBleClient::map_status(reqwest::StatusCode::NOT_FOUND), BleError::DeviceNotFound));
        assert!(matches!(RemoteBleClient::map_status(reqwest::StatusCode::CONFLICT), BleError::AlreadyConnected));
    }

    #[test]
    fn decode_wire_notification_round_trips_json_frame() {
        use base64::Engine;
        let mut raw = vec![b'D'];
        raw.extend_from_slice(br#"{"ok":true}"#);
        let wire = WireNotification { raw_base64: base64::engine::general_purpose::STANDARD.encode(&raw), format: "json".to_string(), parsed: None };
        match decode_wire_notification(&wire) {
            Some(BleNotification::JsonCfg(v)) => assert_eq!(v["ok"], true),
            other => panic!("expected JsonCfg, got {other:?}"),
        }
    }
}
