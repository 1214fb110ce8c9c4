//! Typed error taxonomy shared across transports, storage, and the command
//! handler. See spec.md §7 for the kind → recovery → surfaced mapping this
//! mirrors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database corrupt: {0}")]
    Corrupt(String),
    #[error("storage worker channel closed")]
    WorkerGone,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("frame exceeds transport limit ({len} > {max})")]
    Oversize { len: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum BleError {
    #[error("io error: {0}")]
    Io(String),
    #[error("fcs mismatch")]
    FcsMismatch,
    #[error("frame exceeds BLE MTU ({len} > {max})")]
    Oversize { len: usize, max: usize },
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("device not found")]
    DeviceNotFound,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("throttled")]
    Throttled,
    #[error("duplicate command suppressed")]
    Duplicate,
    #[error("caller not authorized for admin command")]
    Unauthorized,
    #[error("unknown command: {0}")]
    Unknown(String),
}

/// Process exit codes, spec.md §6.
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const CONFIG_ERROR: i32 = 1;
    pub const SCHEMA_UNRECOVERABLE: i32 = 2;
    pub const BLE_SERVICE_UNREACHABLE: i32 = 3;
}
