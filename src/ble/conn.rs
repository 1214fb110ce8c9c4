//! BLE connection lifecycle, spec.md §4.4 "Connection state machine".
//!
//! One dedicated async task owns the `btleplug` peripheral handle and walks
//! it through `Disconnected -> Connecting -> Connected`, with automatic
//! reconnect on drop and an exponential backoff schedule. Grounded on the
//! teacher's `time_driver` for the idea of a small owned clock/backoff
//! sequence driving retries, adapted from simulated ticks to real
//! `tokio::time::sleep`.

use super::wire::{BleNotification, ControlCommand, KEEPALIVE_COMMAND};
use crate::errors::BleError;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

/// Reconnect backoff schedule, spec.md §4.4: 5s, 10s, 20s, then steady 60s
/// (4 attempts total before giving up for good until an explicit connect).
const RECONNECT_BACKOFF: &[Duration] =
    &[Duration::from_secs(5), Duration::from_secs(10), Duration::from_secs(20), Duration::from_secs(60)];
const MAX_RECONNECT_ATTEMPTS: usize = 4;

/// Retry backoff for extended register queries, spec.md §4.4.
const REGISTER_QUERY_BACKOFF: &[Duration] = &[Duration::from_millis(500), Duration::from_secs(1), Duration::from_secs(2)];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// MeshCom firmware ignores any 0xA0 command until it has processed the hello
/// write; a fresh connection must wait this long before issuing anything
/// else (spec.md §8 "Hello ordering"). Reconnecting to an already-synced
/// device skips the wait.
const HELLO_SETTLE: Duration = Duration::from_secs(1);
/// `--pos` every 5 minutes inhibits device sleep, spec.md §4.4 "Keepalive".
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Terminal until an explicit `disconnect()` call clears it, spec.md
    /// §4.4's state table.
    Error(String),
}

pub struct BleConnection {
    device_name: Option<String>,
    device_address: Option<String>,
    state: ConnState,
    peripheral: Option<Peripheral>,
    write_char: Option<Characteristic>,
    notify_tx: mpsc::Sender<BleNotification>,
    /// `true` once a hello has settled on this peripheral; reset on
    /// disconnect so a fresh connect waits out `HELLO_SETTLE` again, but
    /// skipped on a same-session reconnect per spec.md §4.4.
    synced: bool,
}

impl BleConnection {
    pub fn new(device_name: Option<String>, device_address: Option<String>, notify_tx: mpsc::Sender<BleNotification>) -> Self {
        Self { device_name, device_address, state: ConnState::Disconnected, peripheral: None, write_char: None, notify_tx, synced: false }
    }

    pub fn state(&self) -> ConnState {
        self.state.clone()
    }

    async fn find_adapter() -> Result<Adapter, BleError> {
        let manager = Manager::new().await.map_err(|e| BleError::Io(e.to_string()))?;
        let adapters = manager.adapters().await.map_err(|e| BleError::Io(e.to_string()))?;
        adapters.into_iter().next().ok_or(BleError::DeviceNotFound)
    }

    /// Scan for a matching peripheral; used both by `connect()` and by the
    /// BLE Remote Service's name-resolution endpoint (spec.md §4.5).
    pub async fn scan(timeout_dur: Duration, name_prefix: Option<&str>) -> Result<Vec<(String, String)>, BleError> {
        let adapter = Self::find_adapter().await?;
        adapter.start_scan(ScanFilter::default()).await.map_err(|e| BleError::Io(e.to_string()))?;
        tokio::time::sleep(timeout_dur).await;
        let peripherals = adapter.peripherals().await.map_err(|e| BleError::Io(e.to_string()))?;
        let mut found = Vec::new();
        for p in peripherals {
            if let Ok(Some(props)) = p.properties().await {
                let name = props.local_name.unwrap_or_default();
                if let Some(prefix) = name_prefix {
                    if !name.starts_with(prefix) {
                        continue;
                    }
                }
                found.push((name, props.address.to_string()));
            }
        }
        Ok(found)
    }

    async fn find_peripheral(adapter: &Adapter, name: Option<&str>, address: Option<&str>) -> Result<Peripheral, BleError> {
        adapter.start_scan(ScanFilter::default()).await.map_err(|e| BleError::Io(e.to_string()))?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let peripherals = adapter.peripherals().await.map_err(|e| BleError::Io(e.to_string()))?;
        for p in peripherals {
            let props = match p.properties().await {
                Ok(Some(props)) => props,
                _ => continue,
            };
            if let Some(addr) = address {
                if props.address.to_string().eq_ignore_ascii_case(addr) {
                    return Ok(p);
                }
            }
            if let Some(name) = name {
                if props.local_name.as_deref() == Some(name) {
                    return Ok(p);
                }
            }
        }
        Err(BleError::DeviceNotFound)
    }

    /// Drive one full connect attempt: scan, GATT connect, discover
    /// services, subscribe to notifications, send hello, wait out the
    /// settle period (unless already synced from a prior session).
    pub async fn connect(&mut self) -> Result<(), BleError> {
        if self.state == ConnState::Connected {
            return Err(BleError::AlreadyConnected);
        }
        self.state = ConnState::Connecting;
        let result = timeout(CONNECT_TIMEOUT, self.connect_inner()).await;
        match result {
            Ok(Ok(())) => {
                self.state = ConnState::Connected;
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = ConnState::Error(e.to_string());
                Err(e)
            }
            Err(_) => {
                self.state = ConnState::Error("connect timed out".into());
                Err(BleError::ConnectTimeout)
            }
        }
    }

    async fn connect_inner(&mut self) -> Result<(), BleError> {
        let adapter = Self::find_adapter().await?;
        let peripheral = Self::find_peripheral(&adapter, self.device_name.as_deref(), self.device_address.as_deref()).await?;

        peripheral.connect().await.map_err(|e| BleError::Io(e.to_string()))?;
        peripheral.discover_services().await.map_err(|e| BleError::Io(e.to_string()))?;

        let characteristics = peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| c.uuid == meshcom_write_characteristic())
            .cloned()
            .ok_or_else(|| BleError::Io("write characteristic not found".into()))?;
        let notify_char = characteristics
            .iter()
            .find(|c| c.uuid == meshcom_notify_characteristic())
            .cloned()
            .ok_or_else(|| BleError::Io("notify characteristic not found".into()))?;

        peripheral.subscribe(&notify_char).await.map_err(|e| BleError::Io(e.to_string()))?;

        self.write_char = Some(write_char);
        self.peripheral = Some(peripheral);
        self.write_control(&ControlCommand::Hello).await?;
        if !self.synced {
            tokio::time::sleep(HELLO_SETTLE).await;
        }
        self.synced = true;
        Ok(())
    }

    pub async fn write_control(&self, cmd: &ControlCommand) -> Result<(), BleError> {
        let bytes = cmd.encode()?;
        self.write_raw(&bytes).await
    }

    /// Write pre-encoded bytes directly, bypassing [`ControlCommand`]
    /// framing. Used by the BLE Remote Service's raw-bytes send endpoint
    /// (spec.md §4.5 `{data_base64}`/`{data_hex}`) where the caller has
    /// already built the frame.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), BleError> {
        if bytes.len() > super::wire::MAX_FRAME_LEN {
            return Err(BleError::Oversize { len: bytes.len(), max: super::wire::MAX_FRAME_LEN });
        }
        let peripheral = self.peripheral.as_ref().ok_or(BleError::NotConnected)?;
        let write_char = self.write_char.as_ref().ok_or(BleError::NotConnected)?;
        peripheral.write(write_char, bytes, WriteType::WithoutResponse).await.map_err(|e| BleError::Io(e.to_string()))
    }

    pub async fn send_keepalive(&self) -> Result<(), BleError> {
        self.write_control(&ControlCommand::TextCommand(KEEPALIVE_COMMAND.to_string())).await
    }

    /// OS-level bonding, spec.md §4.5 `/api/ble/pair`. Independent of
    /// application-level `connect()`/`disconnect()`: some MeshCom devices
    /// require bonding before the GATT characteristics above are writable.
    pub async fn pair(&self) -> Result<(), BleError> {
        let peripheral = self.peripheral.as_ref().ok_or(BleError::NotConnected)?;
        peripheral.pair().await.map_err(|e| BleError::Io(e.to_string()))
    }

    pub async fn unpair(&self) -> Result<(), BleError> {
        let peripheral = self.peripheral.as_ref().ok_or(BleError::NotConnected)?;
        peripheral.unpair().await.map_err(|e| BleError::Io(e.to_string()))
    }

    /// Send `--settime` with the current unix time, spec.md §4.4 "Connecting
    /// -> success" side effects.
    pub async fn sync_time(&self) -> Result<(), BleError> {
        let now = chrono::Utc::now().timestamp() as u32;
        self.write_control(&ControlCommand::SetTime(now)).await
    }

    /// Issue one extended register query (e.g. `--io`), retrying with the
    /// spec's backoff if the write itself fails. The device's own multi-part
    /// replies (e.g. `--seset` => `SE` then `S1`) are not our concern here;
    /// the notification pump delivers each as it arrives without coalescing.
    pub async fn query_register(&self, command: &str) -> Result<(), BleError> {
        let mut last_err = None;
        for (attempt, backoff) in REGISTER_QUERY_BACKOFF.iter().enumerate() {
            match self.write_control(&ControlCommand::TextCommand(command.to_string())).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("register query '{command}' attempt {attempt} failed: {e}");
                    last_err = Some(e);
                    tokio::time::sleep(*backoff).await;
                }
            }
        }
        Err(last_err.unwrap_or(BleError::NotConnected))
    }

    /// Explicit disconnect: cancels any pending auto-reconnect and clears an
    /// `Error` state, spec.md §4.4's state table.
    pub async fn disconnect(&mut self) -> Result<(), BleError> {
        self.state = ConnState::Disconnecting;
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await.map_err(|e| BleError::Io(e.to_string()))?;
        }
        self.write_char = None;
        self.synced = false;
        self.state = ConnState::Disconnected;
        Ok(())
    }

    /// Drain notifications from the subscribed characteristic and forward
    /// decoded frames to `notify_tx`. Runs until the peripheral drops,
    /// marking the connection `Error` (an involuntary drop per spec.md
    /// §4.4's table, not a clean `Disconnected`).
    pub async fn run_notification_pump(&mut self) -> Result<(), BleError> {
        let peripheral = self.peripheral.clone().ok_or(BleError::NotConnected)?;
        let mut stream = peripheral.notifications().await.map_err(|e| BleError::Io(e.to_string()))?;
        while let Some(data) = stream.next().await {
            let notification = super::wire::decode_notification(&data.value);
            if self.notify_tx.send(notification).await.is_err() {
                break;
            }
        }
        if self.state == ConnState::Connected {
            self.state = ConnState::Error("GATT notification stream closed".into());
        }
        Ok(())
    }

    /// Run the keepalive loop; call from its own task alongside the
    /// notification pump. Exits once the connection is no longer `Connected`.
    pub async fn run_keepalive_loop(&self) {
        let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            if self.state != ConnState::Connected {
                break;
            }
            if let Err(e) = self.send_keepalive().await {
                log::warn!("BLE keepalive failed: {e}");
                break;
            }
        }
    }
}

/// Drive reconnect attempts with the spec's 4-step backoff schedule
/// (5s/10s/20s/60s), spec.md §4.4 "Auto-reconnect". Stops after the schedule
/// is exhausted; the caller decides whether to keep retrying at the final
/// interval or give up.
pub async fn reconnect_with_backoff<F, Fut>(mut attempt: F) -> Result<(), BleError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), BleError>>,
{
    for (idx, backoff) in RECONNECT_BACKOFF.iter().enumerate().take(MAX_RECONNECT_ATTEMPTS) {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("BLE connect failed ({e}), retrying in {backoff:?} (attempt {})", idx + 1);
                tokio::time::sleep(*backoff).await;
            }
        }
    }
    attempt().await
}

fn meshcom_write_characteristic() -> Uuid {
    Uuid::parse_str("6e400002-b5a3-f393-e0a9-e50e24dcca9e").expect("static UUID literal")
}

fn meshcom_notify_characteristic() -> Uuid {
    Uuid::parse_str("6e400003-b5a3-f393-e0a9-e50e24dcca9e").expect("static UUID literal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn reconnect_with_backoff_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        reconnect_with_backoff(move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(BleError::ConnectTimeout)
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_four_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result = reconnect_with_backoff(move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), BleError>(BleError::ConnectTimeout)
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 5); // 4 scheduled + 1 final try
    }
}
