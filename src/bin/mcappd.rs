//! Main McApp daemon: wires config, storage, transports, the router, the
//! command dispatcher, and the SSE gateway into one process. spec.md §5.

use mcapp::ble::remote_client::{self, RemoteBleClient};
use mcapp::ble::wire::BleNotification;
use mcapp::command::CommandRegistry;
use mcapp::config::{BleMode, Config, StorageBackendKind};
use mcapp::errors::exit_code;
use mcapp::model::{MeshMessage, MessageType, TransportKind};
use mcapp::router::{Protocol, Router, RouterEvent};
use mcapp::sse::{self, GatewayState};
use mcapp::storage::{MemoryStorage, PositionUpdate, RetentionConfig, SqliteStorage, StorageHandle};
use mcapp::transport::UdpTransport;
use mcapp::validator::{Disposition, Validator};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::lookup_host;
use tokio::sync::{mpsc, Mutex};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/etc/mcapp/config.json"));
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("failed to load config from {}: {e}", config_path.display());
            return ExitCode::from(exit_code::CONFIG_ERROR as u8);
        }
    };

    let backend: Box<dyn mcapp::storage::StorageBackend> = match config.storage_backend.0 {
        StorageBackendKind::Sqlite => match SqliteStorage::open(Path::new(&config.db_path())) {
            Ok(s) => Box::new(s),
            Err(e) => {
                log::error!("failed to open storage database: {e}");
                return ExitCode::from(exit_code::SCHEMA_UNRECOVERABLE as u8);
            }
        },
        StorageBackendKind::Memory => Box::new(MemoryStorage::new()),
    };
    let storage = StorageHandle::spawn(backend);

    let router = Arc::new(Router::new());
    let validator = Arc::new(Mutex::new(Validator::new()));
    let command_registry = Arc::new(CommandRegistry::new(config.admin_callsigns.clone()));

    let target_addr = match lookup_host((config.udp_target.as_str(), config.udp_port_send)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => {
                log::error!("UDP_TARGET '{}' resolved to no addresses", config.udp_target);
                return ExitCode::from(exit_code::CONFIG_ERROR as u8);
            }
        },
        Err(e) => {
            log::error!("failed to resolve UDP_TARGET '{}': {e}", config.udp_target);
            return ExitCode::from(exit_code::CONFIG_ERROR as u8);
        }
    };
    let udp = match UdpTransport::bind(config.udp_port_list, target_addr).await {
        Ok(t) => Arc::new(t),
        Err(e) => {
            log::error!("failed to bind UDP listener on port {}: {e}", config.udp_port_list);
            return ExitCode::from(exit_code::CONFIG_ERROR as u8);
        }
    };
    router.register_protocol(Protocol::Udp).await;

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<MeshMessage>(256);
    let call_sign = config.call_sign.clone();

    let mut remote_ble: Option<Arc<RemoteBleClient>> = None;
    if config.ble_mode.0 == BleMode::Remote {
        let Some(url) = config.ble_remote_url.clone() else {
            log::error!("BLE_MODE=remote requires BLE_REMOTE_URL");
            return ExitCode::from(exit_code::CONFIG_ERROR as u8);
        };
        router.register_protocol(Protocol::Ble).await;
        log::info!("BLE remote mode enabled, service at {url}");
        let client = Arc::new(RemoteBleClient::new(url.clone(), config.ble_api_key.clone()));
        if let (Some(name), Some(addr)) = (config.ble_device_name.clone(), config.ble_device_address.clone()) {
            let connect_client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = connect_client.connect(Some(&addr), Some(&name)).await {
                    log::warn!("initial BLE remote connect failed: {e}");
                }
            });
        }
        remote_ble = Some(client);

        // Bridge decoded BLE notifications from the remote service into the
        // same validate/store/route/dispatch pipeline the UDP pump uses.
        let (ble_notify_tx, mut ble_notify_rx) = mpsc::channel::<BleNotification>(256);
        {
            let url = url.clone();
            let api_key = config.ble_api_key.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = remote_client::run_notification_stream(&url, api_key.as_deref(), ble_notify_tx.clone()).await {
                        log::warn!("BLE remote notification stream ended: {e}, retrying in 5s");
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });
        }
        {
            let validator = validator.clone();
            let router = router.clone();
            let storage = storage.clone();
            let command_registry = command_registry.clone();
            let outbound_tx = outbound_tx.clone();
            tokio::spawn(async move {
                while let Some(notification) = ble_notify_rx.recv().await {
                    handle_ble_notification(notification, &validator, &router, &storage, &command_registry, &outbound_tx).await;
                }
            });
        }
    }

    // Outbound sender: pace sends, tag with our callsign, mark as pending so
    // the echo we'll hear back on UDP/BLE gets suppressed instead of re-routed.
    {
        let udp = udp.clone();
        let validator = validator.clone();
        let router = router.clone();
        let pacing = config.outbound_pacing();
        let call_sign = call_sign.clone();
        let remote_ble = remote_ble.clone();
        tokio::spawn(async move {
            while let Some(mut msg) = outbound_rx.recv().await {
                if msg.src.is_empty() {
                    msg.src = call_sign.clone();
                }
                let wait = validator.lock().await.outbound_wait(pacing);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                validator.lock().await.mark_outbound(&msg);
                if let Err(e) = udp.send(&msg).await {
                    log::warn!("outbound UDP send failed: {e}");
                    continue;
                }
                if let Some(remote) = &remote_ble {
                    if let Err(e) = remote.send_group_message(&msg.dst, &msg.msg).await {
                        log::warn!("outbound BLE remote send failed: {e}");
                    }
                }
                router.publish(RouterEvent::Outbound(msg));
            }
        });
    }

    // Inbound UDP pump: normalize, dedup/echo-suppress, store, route,
    // dispatch chat commands.
    {
        let udp = udp.clone();
        let validator = validator.clone();
        let router = router.clone();
        let storage = storage.clone();
        let command_registry = command_registry.clone();
        let outbound_tx = outbound_tx.clone();
        tokio::spawn(async move {
            loop {
                let msg = match udp.recv().await {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("UDP recv error: {e}");
                        continue;
                    }
                };
                let normalized = validator.lock().await.normalize(msg);
                match validator.lock().await.classify_inbound(&normalized) {
                    Disposition::Echo | Disposition::Duplicate => continue,
                    Disposition::Quarantine(reason) => {
                        log::debug!("quarantined frame from {}: {reason}", normalized.src);
                        continue;
                    }
                    Disposition::Accept => {}
                }

                if let Err(e) = storage.append(normalized.clone()).await {
                    log::warn!("failed to persist inbound message: {e}");
                }
                store_position_if_beacon(&storage, &router, &normalized).await;
                if let (Some(rssi), Some(snr)) = (normalized.rssi, normalized.snr) {
                    let _ = storage
                        .append_signal_sample(normalized.src.clone(), rssi, snr, normalized.timestamp)
                        .await;
                    let _ = storage.upsert_station_signal(normalized.src.clone(), rssi, snr, normalized.timestamp).await;
                }
                router.publish(RouterEvent::Inbound(normalized.clone()));

                if normalized.msg_type == MessageType::Msg && normalized.msg.trim_start().starts_with('!') {
                    let registry = command_registry.clone();
                    let storage = storage.clone();
                    let router = router.clone();
                    let outbound_tx = outbound_tx.clone();
                    let src = normalized.src.clone();
                    let text = normalized.msg.clone();
                    tokio::spawn(async move {
                        match registry.dispatch(&src, &text, &storage, &router).await {
                            Ok(reply) => {
                                let reply_msg = MeshMessage {
                                    msg_id: None,
                                    src: String::new(),
                                    dst: src,
                                    msg: reply,
                                    msg_type: MessageType::Msg,
                                    timestamp: 0,
                                    rssi: None,
                                    snr: None,
                                    src_type: TransportKind::Udp,
                                    raw: Vec::new(),
                                    echo_id: None,
                                    acked: None,
                                }
                                .with_default_timestamp();
                                let _ = outbound_tx.send(reply_msg).await;
                            }
                            Err(e) => log::debug!("command dispatch declined: {e}"),
                        }
                    });
                }
            }
        });
    }

    // Nightly retention + rollup, plus a startup pass so a long-stopped
    // daemon doesn't carry unbounded history.
    {
        let storage = storage.clone();
        let prune_hours = config.prune_hours;
        let prune_hours_pos = config.prune_hours_pos;
        let prune_hours_ack = config.prune_hours_ack;
        tokio::spawn(async move {
            let retention = RetentionConfig {
                messages_msg_hours: prune_hours,
                messages_pos_ack_hours: prune_hours_pos.max(prune_hours_ack),
                ..RetentionConfig::default()
            };
            loop {
                let now_ms = chrono::Utc::now().timestamp_millis();
                if let Err(e) = storage.prune_now(retention.clone(), now_ms).await {
                    log::warn!("retention pass failed: {e}");
                }
                if let Err(e) = storage.rollup_buckets(now_ms).await {
                    log::warn!("bucket rollup failed: {e}");
                }
                tokio::time::sleep(seconds_until_next_4am()).await;
            }
        });
    }

    if config.sse_enabled {
        let gateway_state = GatewayState { router: router.clone(), storage: storage.clone(), outbound_tx: outbound_tx.clone() };
        let app = sse::router(gateway_state);
        let addr = format!("{}:{}", config.sse_host, config.sse_port);
        router.register_protocol(Protocol::Sse).await;
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    log::info!("SSE gateway listening on {addr}");
                    if let Err(e) = axum::serve(listener, app).await {
                        log::error!("SSE gateway exited: {e}");
                    }
                }
                Err(e) => log::error!("failed to bind SSE gateway on {addr}: {e}"),
            }
        });
    }

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, flushing in-flight aggregates");
    let now_ms = chrono::Utc::now().timestamp_millis();
    if let Err(e) = storage.rollup_buckets(now_ms).await {
        log::warn!("final bucket flush failed: {e}");
    }
    ExitCode::from(exit_code::CLEAN as u8)
}

/// Fold one decoded BLE notification from the remote service into the same
/// validate/store/route pipeline the UDP pump runs, spec.md §9 Design Notes
/// "one router, many transports". Binary mesh payloads are the device's raw
/// over-the-air frame, not a JSON envelope like UDP's; a best-effort
/// `{src,dst,msg}` JSON parse is tried first since several MeshCom firmware
/// revisions do put one there, falling back to treating the bytes as the
/// message body with an unknown sender (see DESIGN.md, binary mesh payload
/// decoding is an Open Question the spec leaves to the implementation).
async fn handle_ble_notification(
    notification: BleNotification,
    validator: &Mutex<Validator>,
    router: &Arc<Router>,
    storage: &StorageHandle,
    command_registry: &Arc<CommandRegistry>,
    outbound_tx: &mpsc::Sender<MeshMessage>,
) {
    let mesh_message = match notification {
        BleNotification::BinaryMesh { payload, .. } => Some(mesh_message_from_binary_payload(&payload)),
        BleNotification::JsonCfg(value) => {
            if let (Some(lat), Some(lon)) = (value.get("lat").and_then(|v| v.as_f64()), value.get("lon").and_then(|v| v.as_f64())) {
                router.set_gps(lat, lon).await;
            }
            None
        }
        BleNotification::Ack { .. } | BleNotification::Unknown(_) => None,
    };

    let Some(msg) = mesh_message else { return };
    let normalized = validator.lock().await.normalize(msg);
    match validator.lock().await.classify_inbound(&normalized) {
        Disposition::Echo | Disposition::Duplicate => return,
        Disposition::Quarantine(reason) => {
            log::debug!("quarantined BLE frame from {}: {reason}", normalized.src);
            return;
        }
        Disposition::Accept => {}
    }
    if let Err(e) = storage.append(normalized.clone()).await {
        log::warn!("failed to persist inbound BLE message: {e}");
    }
    store_position_if_beacon(storage, router, &normalized).await;
    router.publish(RouterEvent::Inbound(normalized.clone()));

    if normalized.msg_type == MessageType::Msg && normalized.msg.trim_start().starts_with('!') {
        let registry = command_registry.clone();
        let storage = storage.clone();
        let router = router.clone();
        let outbound_tx = outbound_tx.clone();
        let src = normalized.src.clone();
        let text = normalized.msg.clone();
        tokio::spawn(async move {
            match registry.dispatch(&src, &text, &storage, &router).await {
                Ok(reply) => {
                    let reply_msg = MeshMessage {
                        msg_id: None,
                        src: String::new(),
                        dst: src,
                        msg: reply,
                        msg_type: MessageType::Msg,
                        timestamp: 0,
                        rssi: None,
                        snr: None,
                        src_type: TransportKind::Ble,
                        raw: Vec::new(),
                        echo_id: None,
                        acked: None,
                    }
                    .with_default_timestamp();
                    let _ = outbound_tx.send(reply_msg).await;
                }
                Err(e) => log::debug!("BLE command dispatch declined: {e}"),
            }
        });
    }
}

fn mesh_message_from_binary_payload(payload: &[u8]) -> MeshMessage {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
        let src = value.get("src").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let dst = value.get("dst").and_then(|v| v.as_str()).unwrap_or("*").to_string();
        let msg = value.get("msg").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let msg_type = value.get("type").and_then(|v| v.as_str()).map(parse_msg_type_str).unwrap_or(MessageType::Msg);
        return MeshMessage {
            msg_id: None,
            src,
            dst,
            msg,
            msg_type,
            timestamp: 0,
            rssi: None,
            snr: None,
            src_type: TransportKind::Ble,
            raw: payload.to_vec(),
            echo_id: None,
            acked: None,
        }
        .with_default_timestamp();
    }
    MeshMessage {
        msg_id: None,
        src: "unknown".to_string(),
        dst: "*".to_string(),
        msg: String::from_utf8_lossy(payload).to_string(),
        msg_type: MessageType::Msg,
        timestamp: 0,
        rssi: None,
        snr: None,
        src_type: TransportKind::Ble,
        raw: payload.to_vec(),
        echo_id: None,
        acked: None,
    }
    .with_default_timestamp()
}

fn parse_msg_type_str(s: &str) -> MessageType {
    match s {
        "pos" => MessageType::Pos,
        "ack" => MessageType::Ack,
        _ => MessageType::Msg,
    }
}

/// Position beacons carry `lat=..,lon=..,alt=..,hw=..,sym=<table><code>` in
/// their text body (spec.md §3 "Station Position" fields). Returns `None`
/// when lat/lon are missing, since those two are the only required fields.
fn parse_position_fields(body: &str) -> Option<(f64, f64, Option<f64>, Option<String>, Option<char>, Option<char>)> {
    let mut lat = None;
    let mut lon = None;
    let mut alt = None;
    let mut hw = None;
    let mut sym_table = None;
    let mut sym_code = None;
    for part in body.split(',') {
        let part = part.trim();
        if let Some(v) = part.strip_prefix("lat=") {
            lat = v.parse().ok();
        } else if let Some(v) = part.strip_prefix("lon=") {
            lon = v.parse().ok();
        } else if let Some(v) = part.strip_prefix("alt=") {
            alt = v.parse().ok();
        } else if let Some(v) = part.strip_prefix("hw=") {
            hw = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("sym=") {
            let mut chars = v.chars();
            sym_table = chars.next();
            sym_code = chars.next();
        }
    }
    match (lat, lon) {
        (Some(lat), Some(lon)) => Some((lat, lon, alt, hw, sym_table, sym_code)),
        _ => None,
    }
}

/// Shared by the UDP and BLE inbound pumps: on a `pos` frame, refresh the
/// GPS cache (spec.md §4.6) and UPSERT `station_positions` (spec.md §8
/// invariant 3) without ever touching that station's signal fields.
async fn store_position_if_beacon(storage: &StorageHandle, router: &Router, normalized: &MeshMessage) {
    if normalized.msg_type != MessageType::Pos {
        return;
    }
    let Some((lat, lon, alt, hw, sym_table, sym_code)) = parse_position_fields(&normalized.msg) else {
        return;
    };
    router.set_gps(lat, lon).await;
    let update = PositionUpdate {
        callsign: normalized.src.clone(),
        lat,
        lon,
        alt,
        hw,
        sym_table,
        sym_code,
        timestamp: normalized.timestamp,
    };
    if let Err(e) = storage.upsert_station_position(update).await {
        log::warn!("failed to upsert station position for {}: {e}", normalized.src);
    }
}

fn seconds_until_next_4am() -> std::time::Duration {
    use chrono::{Duration as ChronoDuration, Local, Timelike};
    let now = Local::now();
    let mut target = now.date_naive().and_hms_opt(4, 0, 0).unwrap();
    if now.naive_local() >= target {
        target += ChronoDuration::days(1);
    }
    let delta = target - now.naive_local();
    std::time::Duration::from_secs(delta.num_seconds().max(60) as u64)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
