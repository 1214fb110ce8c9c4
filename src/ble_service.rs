//! Split-deployment BLE Remote Service, spec.md §4.5.
//!
//! Runs on the machine with real BLE hardware; `mcappd` talks to it over
//! HTTP/SSE (see [`crate::ble::remote_client`]) when `BLE_MODE = "remote"`
//! instead of opening `btleplug` itself. This is a thin network facade over
//! the same [`crate::ble::conn`] state machine and [`crate::ble::wire`]
//! framing the direct BLE transport would use — not a reimplementation.
//! Grounded on the teacher's `control::client`/`control::command` pair
//! (typed HTTP client issuing commands, header-based API key auth), mirrored
//! here from the client side onto the server side with `axum`.

use crate::ble::conn::BleConnection;
use crate::ble::wire::{BleNotification, ControlCommand, SaveFlag};
use crate::ble::ConnState;
use crate::errors::BleError;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

const SSE_PING_INTERVAL: Duration = Duration::from_secs(30);
const SCAN_WHILE_CONNECTED_CONFLICT: &str = "cannot scan while connected";

#[derive(Clone)]
pub struct BleServiceState {
    pub conn: Arc<Mutex<BleConnection>>,
    /// `None` means the service is running unauthenticated (no
    /// `BLE_SERVICE_API_KEY`, or it was empty/`"disabled"`), spec.md §4.5.
    pub api_key: Option<Arc<String>>,
    pub notifications: broadcast::Sender<SseNotification>,
    pub last_activity_ms: Arc<AtomicI64>,
    pub device_name: Arc<Mutex<Option<String>>>,
    pub device_address: Arc<Mutex<Option<String>>>,
}

impl BleServiceState {
    pub fn new(conn: BleConnection, api_key: Option<String>) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            conn: Arc::new(Mutex::new(conn)),
            api_key: api_key.map(Arc::new),
            notifications: tx,
            last_activity_ms: Arc::new(AtomicI64::new(0)),
            device_name: Arc::new(Mutex::new(None)),
            device_address: Arc::new(Mutex::new(None)),
        }
    }

    fn touch_activity(&self) {
        self.last_activity_ms.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// One `notification` SSE event, spec.md §4.5 "SSE stream" table.
#[derive(Debug, Clone, Serialize)]
pub struct SseNotification {
    pub timestamp: i64,
    pub raw_base64: String,
    pub raw_hex: String,
    pub format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fcs_ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<serde_json::Value>,
}

impl SseNotification {
    /// Build an SSE-ready notification from a decoded frame, reconstructing
    /// its raw bytes for the `raw_base64`/`raw_hex` fields.
    pub fn from_notification(notification: &BleNotification) -> Self {
        let raw = notification_raw_bytes(notification);
        Self::from_raw(&raw, notification)
    }

    fn from_raw(raw: &[u8], notification: &BleNotification) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let raw_base64 = base64::engine::general_purpose::STANDARD.encode(raw);
        let raw_hex = hex::encode(raw);
        match notification {
            BleNotification::JsonCfg(value) => {
                Self { timestamp, raw_base64, raw_hex, format: "json", prefix: None, fcs_ok: None, parsed: Some(value.clone()) }
            }
            BleNotification::BinaryMesh { subtype, fcs_ok, .. } => Self {
                timestamp,
                raw_base64,
                raw_hex,
                format: "binary",
                prefix: Some(format!("@{}", *subtype as char)),
                fcs_ok: Some(*fcs_ok),
                parsed: None,
            },
            BleNotification::Ack { fcs_ok, .. } => {
                Self { timestamp, raw_base64, raw_hex, format: "binary", prefix: Some("@A".to_string()), fcs_ok: Some(*fcs_ok), parsed: None }
            }
            BleNotification::Unknown(_) => {
                Self { timestamp, raw_base64, raw_hex, format: "unknown", prefix: None, fcs_ok: None, parsed: None }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    state: String,
    device_name: Option<String>,
    device_address: Option<String>,
    last_activity_ms: Option<i64>,
}

fn state_name(state: &ConnState) -> String {
    match state {
        ConnState::Disconnected => "disconnected".into(),
        ConnState::Connecting => "connecting".into(),
        ConnState::Connected => "connected".into(),
        ConnState::Disconnecting => "disconnecting".into(),
        ConnState::Error(msg) => format!("error: {msg}"),
    }
}

fn ble_error_status(err: &BleError) -> StatusCode {
    match err {
        BleError::NotConnected | BleError::AlreadyConnected => StatusCode::CONFLICT,
        BleError::DeviceNotFound => StatusCode::NOT_FOUND,
        BleError::Oversize { .. } => StatusCode::BAD_REQUEST,
        BleError::ConnectTimeout | BleError::Io(_) | BleError::FcsMismatch => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `X-API-Key` auth middleware, spec.md §4.5 "Auth". `/health` is exempt
/// (checked by the caller before reaching here). An unset/empty/`"disabled"`
/// key means every other route is open too.
fn check_auth(state: &BleServiceState, headers: &HeaderMap) -> bool {
    match &state.api_key {
        None => true,
        Some(expected) => headers.get("X-API-Key").and_then(|v| v.to_str().ok()).map(|v| v == expected.as_str()).unwrap_or(false),
    }
}

async fn get_health() -> impl IntoResponse {
    StatusCode::OK
}

async fn get_status(State(state): State<BleServiceState>, headers: HeaderMap) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let conn = state.conn.lock().await;
    let last_activity = match state.last_activity_ms.load(Ordering::Relaxed) {
        0 => None,
        ts => Some(ts),
    };
    Json(StatusResponse {
        state: state_name(&conn.state()),
        device_name: state.device_name.lock().await.clone(),
        device_address: state.device_address.lock().await.clone(),
        last_activity_ms: last_activity,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ScanQuery {
    timeout: Option<u64>,
    prefix: Option<String>,
}

#[derive(Debug, Serialize)]
struct ScanResult {
    name: String,
    address: String,
}

async fn get_devices(State(state): State<BleServiceState>, headers: HeaderMap, Query(q): Query<ScanQuery>) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if state.conn.lock().await.state() == ConnState::Connected {
        return (StatusCode::CONFLICT, SCAN_WHILE_CONNECTED_CONFLICT).into_response();
    }
    let timeout = Duration::from_secs(q.timeout.unwrap_or(5));
    match BleConnection::scan(timeout, q.prefix.as_deref()).await {
        Ok(devices) => Json(devices.into_iter().map(|(name, address)| ScanResult { name, address }).collect::<Vec<_>>()).into_response(),
        Err(e) => (ble_error_status(&e), e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    device_address: Option<String>,
    device_name: Option<String>,
}

const NAME_RESOLUTION_SCAN: Duration = Duration::from_secs(5);

async fn post_connect(State(state): State<BleServiceState>, headers: HeaderMap, Json(req): Json<ConnectRequest>) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if req.device_address.is_none() && req.device_name.is_none() {
        return (StatusCode::BAD_REQUEST, "device_address or device_name required").into_response();
    }

    let address = if let Some(addr) = req.device_address.clone() {
        Some(addr)
    } else {
        let name = req.device_name.clone().unwrap();
        match BleConnection::scan(NAME_RESOLUTION_SCAN, Some(&name)).await {
            Ok(found) => found.into_iter().find(|(n, _)| n == &name).map(|(_, addr)| addr),
            Err(_) => None,
        }
    };
    let Some(address) = address else {
        return (StatusCode::NOT_FOUND, "could not resolve device_name to an address").into_response();
    };

    let mut conn = state.conn.lock().await;
    *conn = BleConnection::new(req.device_name.clone(), Some(address.clone()), conn_notify_sender(&state));
    match conn.connect().await {
        Ok(()) => {
            *state.device_address.lock().await = Some(address);
            *state.device_name.lock().await = req.device_name;
            state.touch_activity();
            StatusCode::OK.into_response()
        }
        Err(e) => (ble_error_status(&e), e.to_string()).into_response(),
    }
}

async fn post_disconnect(State(state): State<BleServiceState>, headers: HeaderMap) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let mut conn = state.conn.lock().await;
    match conn.disconnect().await {
        Ok(()) => StatusCode::OK,
        Err(e) => ble_error_status(&e),
    }
}

#[derive(Debug, Deserialize)]
struct DeviceAddressRequest {
    device_address: String,
}

async fn post_pair(State(state): State<BleServiceState>, headers: HeaderMap, Json(_req): Json<DeviceAddressRequest>) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.conn.lock().await.pair().await {
        Ok(()) => StatusCode::OK,
        Err(e) => ble_error_status(&e),
    }
}

async fn post_unpair(State(state): State<BleServiceState>, headers: HeaderMap, Json(_req): Json<DeviceAddressRequest>) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.conn.lock().await.unpair().await {
        Ok(()) => StatusCode::OK,
        Err(e) => ble_error_status(&e),
    }
}

/// One of `{command}`, `{message, group}`, `{data_base64}`, `{data_hex}`,
/// spec.md §4.5 `/api/ble/send`.
#[derive(Debug, Deserialize)]
struct SendRequest {
    command: Option<String>,
    message: Option<String>,
    group: Option<String>,
    data_base64: Option<String>,
    data_hex: Option<String>,
}

async fn post_send(State(state): State<BleServiceState>, headers: HeaderMap, Json(req): Json<SendRequest>) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let conn = state.conn.lock().await;
    let result = if let Some(cmd) = req.command {
        conn.write_control(&ControlCommand::TextCommand(cmd)).await
    } else if let (Some(group), Some(message)) = (req.group, req.message) {
        conn.write_control(&ControlCommand::TextCommand(format!("--send {group} {message}"))).await
    } else if let Some(b64) = req.data_base64 {
        match base64::engine::general_purpose::STANDARD.decode(&b64) {
            Ok(bytes) => conn.write_raw(&bytes).await,
            Err(_) => return StatusCode::BAD_REQUEST,
        }
    } else if let Some(h) = req.data_hex {
        match hex::decode(&h) {
            Ok(bytes) => conn.write_raw(&bytes).await,
            Err(_) => return StatusCode::BAD_REQUEST,
        }
    } else {
        return StatusCode::BAD_REQUEST;
    };
    match result {
        Ok(()) => {
            state.touch_activity();
            StatusCode::ACCEPTED
        }
        Err(e) => ble_error_status(&e),
    }
}

async fn post_settime(State(state): State<BleServiceState>, headers: HeaderMap) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.conn.lock().await.sync_time().await {
        Ok(()) => StatusCode::OK,
        Err(e) => ble_error_status(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CallsignQuery {
    callsign: String,
}

async fn post_config_callsign(State(state): State<BleServiceState>, headers: HeaderMap, Query(q): Query<CallsignQuery>) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.conn.lock().await.write_control(&ControlCommand::SetCallsign(q.callsign)).await {
        Ok(()) => StatusCode::OK,
        Err(e) => ble_error_status(&e),
    }
}

#[derive(Debug, Deserialize)]
struct WifiQuery {
    ssid: String,
    password: String,
}

async fn post_config_wifi(State(state): State<BleServiceState>, headers: HeaderMap, Query(q): Query<WifiQuery>) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.conn.lock().await.write_control(&ControlCommand::SetWifi { ssid: q.ssid, password: q.password }).await {
        Ok(()) => StatusCode::OK,
        Err(e) => ble_error_status(&e),
    }
}

#[derive(Debug, Deserialize)]
struct PositionQuery {
    lat: f32,
    lon: f32,
    alt: Option<i32>,
    save: Option<String>,
}

fn parse_save_flag(v: Option<&str>) -> SaveFlag {
    match v {
        Some("volatile") => SaveFlag::Volatile,
        _ => SaveFlag::Persist,
    }
}

async fn post_config_position(State(state): State<BleServiceState>, headers: HeaderMap, Query(q): Query<PositionQuery>) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let save = parse_save_flag(q.save.as_deref());
    let conn = state.conn.lock().await;
    if let Err(e) = conn.write_control(&ControlCommand::SetLat(q.lat, save)).await {
        return ble_error_status(&e);
    }
    if let Err(e) = conn.write_control(&ControlCommand::SetLon(q.lon, save)).await {
        return ble_error_status(&e);
    }
    if let Some(alt) = q.alt {
        if let Err(e) = conn.write_control(&ControlCommand::SetAltitude(alt, save)).await {
            return ble_error_status(&e);
        }
    }
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct AprsQuery {
    primary: String,
    secondary: String,
}

async fn post_config_aprs(State(state): State<BleServiceState>, headers: HeaderMap, Query(q): Query<AprsQuery>) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let (Some(primary), Some(secondary)) = (q.primary.bytes().next(), q.secondary.bytes().next()) else {
        return StatusCode::BAD_REQUEST;
    };
    match state.conn.lock().await.write_control(&ControlCommand::SetAprsSymbol(primary, secondary)).await {
        Ok(()) => StatusCode::OK,
        Err(e) => ble_error_status(&e),
    }
}

async fn post_config_save(State(state): State<BleServiceState>, headers: HeaderMap) -> impl IntoResponse {
    if !check_auth(&state, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match state.conn.lock().await.write_control(&ControlCommand::SaveAndReboot).await {
        Ok(()) => StatusCode::OK,
        Err(e) => ble_error_status(&e),
    }
}

async fn get_notifications(
    State(state): State<BleServiceState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    if !check_auth(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let rx = state.notifications.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(notification) => serde_json::to_string(&notification).ok().map(|json| Ok(Event::default().event("notification").data(json))),
        Err(_lagged) => None,
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_PING_INTERVAL).text("ping")))
}

pub fn router(state: BleServiceState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/ble/status", get(get_status))
        .route("/api/ble/devices", get(get_devices))
        .route("/api/ble/connect", post(post_connect))
        .route("/api/ble/disconnect", post(post_disconnect))
        .route("/api/ble/pair", post(post_pair))
        .route("/api/ble/unpair", post(post_unpair))
        .route("/api/ble/send", post(post_send))
        .route("/api/ble/settime", post(post_settime))
        .route("/api/ble/config/callsign", post(post_config_callsign))
        .route("/api/ble/config/wifi", post(post_config_wifi))
        .route("/api/ble/config/position", post(post_config_position))
        .route("/api/ble/config/aprs", post(post_config_aprs))
        .route("/api/ble/config/save", post(post_config_save))
        .route("/api/ble/notifications", get(get_notifications))
        .with_state(state)
}

/// Placeholder sender handed to a freshly (re)constructed [`BleConnection`]
/// before its notification pump is wired up by the caller; callers replace
/// this by driving `run_notification_pump` against `notify_rx` themselves.
fn conn_notify_sender(state: &BleServiceState) -> tokio::sync::mpsc::Sender<BleNotification> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let broadcast_tx = state.notifications.clone();
    let last_activity = state.last_activity_ms.clone();
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            last_activity.store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
            let _ = broadcast_tx.send(SseNotification::from_notification(&notification));
        }
    });
    tx
}

/// Best-effort reconstruction of the bytes behind a decoded notification,
/// for the SSE stream's `raw_base64`/`raw_hex` fields. `BinaryMesh`/`Ack`
/// frames don't carry their FCS past decode, so this omits it; consumers
/// needing the exact wire bytes should read `parsed`/`fcs_ok` instead.
fn notification_raw_bytes(notification: &BleNotification) -> Vec<u8> {
    match notification {
        BleNotification::JsonCfg(value) => {
            let mut bytes = vec![b'D'];
            bytes.extend_from_slice(serde_json::to_string(value).unwrap_or_default().as_bytes());
            bytes
        }
        BleNotification::BinaryMesh { subtype, payload_type, msg_id, hop_count, payload, .. } => {
            let mut bytes = vec![b'@', *subtype, *payload_type, *msg_id, *hop_count];
            bytes.extend_from_slice(payload);
            bytes
        }
        BleNotification::Ack { msg_id, .. } => vec![b'@', b'A', *msg_id],
        BleNotification::Unknown(raw) => raw.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_mode_accepts_any_headers() {
        let (tx, _rx) = broadcast::channel(1);
        let state = BleServiceState {
            conn: Arc::new(Mutex::new(BleConnection::new(None, None, tokio::sync::mpsc::channel(1).0))),
            api_key: None,
            notifications: tx,
            last_activity_ms: Arc::new(AtomicI64::new(0)),
            device_name: Arc::new(Mutex::new(None)),
            device_address: Arc::new(Mutex::new(None)),
        };
        assert!(check_auth(&state, &HeaderMap::new()));
    }

    #[test]
    fn authenticated_mode_rejects_missing_key() {
        let (tx, _rx) = broadcast::channel(1);
        let state = BleServiceState {
            conn: Arc::new(Mutex::new(BleConnection::new(None, None, tokio::sync::mpsc::channel(1).0))),
            api_key: Some(Arc::new("secret".to_string())),
            notifications: tx,
            last_activity_ms: Arc::new(AtomicI64::new(0)),
            device_name: Arc::new(Mutex::new(None)),
            device_address: Arc::new(Mutex::new(None)),
        };
        assert!(!check_auth(&state, &HeaderMap::new()));
    }

    #[test]
    fn sse_notification_tags_binary_mesh_with_prefix_and_fcs() {
        let notification = BleNotification::BinaryMesh {
            subtype: b':',
            payload_type: 1,
            msg_id: 2,
            hop_count: 0,
            payload: vec![1, 2, 3],
            fcs_ok: false,
        };
        let event = SseNotification::from_notification(&notification);
        assert_eq!(event.format, "binary");
        assert_eq!(event.prefix.as_deref(), Some("@:"));
        assert_eq!(event.fcs_ok, Some(false));
    }
}
