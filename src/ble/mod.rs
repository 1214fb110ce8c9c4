//! BLE transport, spec.md §4.4. Split into wire framing ([`wire`]) and
//! connection lifecycle management ([`conn`]) since they vary independently:
//! the wire format is fixed by the MeshCom firmware, the connection state
//! machine is ours. [`remote_client`] lets `mcappd` itself talk BLE-over-HTTP
//! to a split-deployment [`crate::ble_service`] instead of opening `btleplug`
//! in-process (spec.md §4.5, `BLE_MODE = "remote"`).

pub mod conn;
pub mod remote_client;
pub mod wire;

pub use conn::{BleConnection, ConnState};
pub use wire::{BleNotification, ControlCommand, SaveFlag};
