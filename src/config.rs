//! Configuration loading, spec.md §6.
//!
//! Generalizes the teacher's `control::config::ControlConfig::load` (read a
//! file, `deserialize` it, wrap IO/parse failures in a typed error) from TOML
//! to JSON, since the spec mandates a JSON config file, and adds the
//! `MCAPP_`-prefixed environment-variable override layer.

use crate::errors::ConfigError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleMode {
    Remote,
    Disabled,
}

impl Default for BleMode {
    fn default() -> Self {
        BleMode::Disabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendKind {
    Sqlite,
    Memory,
}

impl Default for StorageBackendKind {
    fn default() -> Self {
        StorageBackendKind::Sqlite
    }
}

fn default_udp_port() -> u16 {
    1799
}
fn default_sse_host() -> String {
    "0.0.0.0".to_string()
}
fn default_sse_port() -> u16 {
    2981
}
fn default_prune_hours() -> u32 {
    720
}
fn default_prune_hours_pos() -> u32 {
    192
}
fn default_prune_hours_ack() -> u32 {
    192
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "UDP_TARGET")]
    pub udp_target: String,
    #[serde(rename = "UDP_PORT_send", default = "default_udp_port")]
    pub udp_port_send: u16,
    #[serde(rename = "UDP_PORT_list", default = "default_udp_port")]
    pub udp_port_list: u16,

    #[serde(rename = "SSE_ENABLED", default = "default_true")]
    pub sse_enabled: bool,
    #[serde(rename = "SSE_HOST", default = "default_sse_host")]
    pub sse_host: String,
    #[serde(rename = "SSE_PORT", default = "default_sse_port")]
    pub sse_port: u16,

    #[serde(rename = "CALL_SIGN")]
    pub call_sign: String,
    #[serde(rename = "LAT", default)]
    pub lat: Option<f64>,
    #[serde(rename = "LONG", default)]
    pub long: Option<f64>,
    #[serde(rename = "STAT_NAME", default)]
    pub stat_name: Option<String>,

    #[serde(rename = "PRUNE_HOURS", default = "default_prune_hours")]
    pub prune_hours: u32,
    #[serde(rename = "PRUNE_HOURS_POS", default = "default_prune_hours_pos")]
    pub prune_hours_pos: u32,
    #[serde(rename = "PRUNE_HOURS_ACK", default = "default_prune_hours_ack")]
    pub prune_hours_ack: u32,
    #[serde(rename = "MAX_STORAGE_SIZE_MB", default)]
    pub max_storage_size_mb: Option<u32>,

    #[serde(rename = "BLE_MODE", default)]
    pub ble_mode: BleModeConfig,
    #[serde(rename = "BLE_REMOTE_URL", default)]
    pub ble_remote_url: Option<String>,
    #[serde(rename = "BLE_API_KEY", default)]
    pub ble_api_key: Option<String>,
    #[serde(rename = "BLE_DEVICE_NAME", default)]
    pub ble_device_name: Option<String>,
    #[serde(rename = "BLE_DEVICE_ADDRESS", default)]
    pub ble_device_address: Option<String>,

    #[serde(rename = "backend", default)]
    pub storage_backend: StorageBackendConfig,

    #[serde(rename = "DB_PATH", default)]
    pub db_path: Option<String>,

    #[serde(rename = "OUTBOUND_PACING_SECONDS", default)]
    pub outbound_pacing_seconds: Option<u64>,
    #[serde(rename = "ADMIN_CALLSIGNS", default)]
    pub admin_callsigns: Vec<String>,
}

/// Wrapper so `ble_mode` round-trips as the lowercase strings in spec.md §6
/// while exposing a typed enum to the rest of the program.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct BleModeConfig(pub BleMode);

impl Default for BleModeConfig {
    fn default() -> Self {
        BleModeConfig(BleMode::Disabled)
    }
}

impl TryFrom<String> for BleModeConfig {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "remote" => Ok(BleModeConfig(BleMode::Remote)),
            "disabled" => Ok(BleModeConfig(BleMode::Disabled)),
            other => Err(format!("unknown BLE_MODE '{other}', expected 'remote' or 'disabled'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct StorageBackendConfig(pub StorageBackendKind);

impl Default for StorageBackendConfig {
    fn default() -> Self {
        StorageBackendConfig(StorageBackendKind::Sqlite)
    }
}

impl TryFrom<String> for StorageBackendConfig {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "sqlite" => Ok(StorageBackendConfig(StorageBackendKind::Sqlite)),
            "memory" => Ok(StorageBackendConfig(StorageBackendKind::Memory)),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Overlay `MCAPP_<KEY>` environment variables onto the parsed config.
    /// Only scalar string/number fields that make sense to override from a
    /// process environment are covered; nested objects are config-file-only.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MCAPP_UDP_TARGET") {
            self.udp_target = v;
        }
        if let Ok(v) = std::env::var("MCAPP_CALL_SIGN") {
            self.call_sign = v;
        }
        if let Ok(v) = std::env::var("MCAPP_SSE_PORT") {
            if let Ok(port) = v.parse() {
                self.sse_port = port;
            }
        }
        if let Ok(v) = std::env::var("MCAPP_BLE_REMOTE_URL") {
            self.ble_remote_url = Some(v);
        }
        if let Ok(v) = std::env::var("MCAPP_BLE_API_KEY") {
            self.ble_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("MCAPP_DB_PATH") {
            self.db_path = Some(v);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.udp_target.trim().is_empty() {
            return Err(ConfigError::Invalid("UDP_TARGET must not be empty".into()));
        }
        if self.call_sign.trim().is_empty() {
            return Err(ConfigError::Invalid("CALL_SIGN must not be empty".into()));
        }
        if self.ble_mode.0 == BleMode::Remote && self.ble_remote_url.is_none() {
            return Err(ConfigError::Invalid("BLE_MODE=remote requires BLE_REMOTE_URL".into()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> String {
        self.db_path.clone().unwrap_or_else(|| "/var/lib/mcapp/messages.db".to_string())
    }

    pub fn outbound_pacing(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.outbound_pacing_seconds.unwrap_or(12))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_call_sign() {
        let json = r#"{"UDP_TARGET": "10.0.0.1", "CALL_SIGN": ""}"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, json).unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_override_wins_over_file() {
        let json = r#"{"UDP_TARGET": "10.0.0.1", "CALL_SIGN": "DK5EN-9"}"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, json).unwrap();
        std::env::set_var("MCAPP_CALL_SIGN", "DL4GLE-10");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.call_sign, "DL4GLE-10");
        std::env::remove_var("MCAPP_CALL_SIGN");
    }
}
