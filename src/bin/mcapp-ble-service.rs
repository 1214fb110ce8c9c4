//! Split-deployment BLE Remote Service: runs on the machine with BLE
//! hardware, exposes `ble::conn`/`ble::wire` over HTTP/SSE for a remote
//! `mcappd` to consume. spec.md §4.5.

use mcapp::ble::BleConnection;
use mcapp::ble_service::{self, BleServiceState};
use std::process::ExitCode;
use tokio::sync::mpsc;

/// Literal sentinel meaning "run unauthenticated", alongside unset/empty,
/// spec.md §4.5 "Auth".
const DISABLED_SENTINEL: &str = "disabled";

fn resolve_api_key() -> Option<String> {
    match std::env::var("BLE_SERVICE_API_KEY") {
        Ok(v) if v.is_empty() || v == DISABLED_SENTINEL => None,
        Ok(v) => Some(v),
        Err(_) => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let api_key = resolve_api_key();
    if api_key.is_none() {
        log::warn!("BLE_SERVICE_API_KEY not set (or 'disabled'); running the BLE remote service unauthenticated");
    }

    let device_name = std::env::var("BLE_DEVICE_NAME").ok();
    let device_address = std::env::var("BLE_DEVICE_ADDRESS").ok();
    let bind_addr = std::env::var("BLE_SERVICE_BIND").unwrap_or_else(|_| "0.0.0.0:8765".to_string());

    let (notify_tx, mut notify_rx) = mpsc::channel(256);
    let conn = BleConnection::new(device_name.clone(), device_address.clone(), notify_tx.clone());
    let state = BleServiceState::new(conn, api_key);
    *state.device_name.lock().await = device_name.clone();
    *state.device_address.lock().await = device_address.clone();

    // Drain decoded notifications from whichever BleConnection is currently
    // installed into the SSE broadcast channel; post_connect swaps the
    // connection wholesale and rebuilds this pipe via its own notify_tx, so
    // this task only matters for the connection constructed at startup.
    {
        let broadcast_tx = state.notifications.clone();
        let last_activity = state.last_activity_ms.clone();
        tokio::spawn(async move {
            while let Some(notification) = notify_rx.recv().await {
                last_activity.store(chrono::Utc::now().timestamp_millis(), std::sync::atomic::Ordering::Relaxed);
                let _ = broadcast_tx.send(ble_service::SseNotification::from_notification(&notification));
            }
        });
    }

    if device_name.is_some() || device_address.is_some() {
        let conn = state.conn.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.lock().await.connect().await {
                log::warn!("initial BLE auto-connect failed: {e}");
            }
        });
    }

    let app = ble_service::router(state);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to bind BLE remote service on {bind_addr}: {e}");
            return ExitCode::from(mcapp::errors::exit_code::CONFIG_ERROR as u8);
        }
    };
    log::info!("BLE remote service listening on {bind_addr}");
    if let Err(e) = axum::serve(listener, app).await {
        log::error!("BLE remote service exited: {e}");
        return ExitCode::from(mcapp::errors::exit_code::BLE_SERVICE_UNREACHABLE as u8);
    }
    ExitCode::from(mcapp::errors::exit_code::CLEAN as u8)
}
