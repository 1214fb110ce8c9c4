//! Core data model, spec.md §3 and §9.
//!
//! Dynamic, dict-like frames at the system's boundaries (UDP JSON, BLE device
//! notifications) are modeled as tagged sum types here rather than passed
//! around as free-form JSON, per the Design Notes in spec.md §9.

use serde::{Deserialize, Serialize};

/// The closed set of mesh message types, spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Msg,
    Pos,
    Ack,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Msg => "msg",
            MessageType::Pos => "pos",
            MessageType::Ack => "ack",
        }
    }
}

/// Which physical transport a frame arrived on or is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Ble,
}

/// A single frame observed on (or produced for) the mesh, before storage
/// assigns it an `id` and an ordering-safe timestamp. Created on ingress,
/// immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshMessage {
    /// Transport-assigned identifier; absent for beacons.
    pub msg_id: Option<String>,
    /// Source callsign, possibly a comma-separated relay path.
    pub src: String,
    /// `*` broadcast, a numeric group id, or a direct-message callsign.
    pub dst: String,
    pub msg: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
    pub rssi: Option<f32>,
    pub snr: Option<f32>,
    pub src_type: TransportKind,
    pub raw: Vec<u8>,
    pub echo_id: Option<String>,
    pub acked: Option<bool>,
}

/// A `messages` row as actually stored: `MeshMessage` plus the fields the
/// storage engine itself assigns (`id`, and `send_success` for our own
/// outbound sends).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub msg_id: Option<String>,
    pub src: String,
    pub dst: String,
    pub msg: String,
    pub msg_type: MessageType,
    pub timestamp: i64,
    pub rssi: Option<f32>,
    pub snr: Option<f32>,
    pub src_type: TransportKind,
    pub raw: Vec<u8>,
    pub echo_id: Option<String>,
    pub acked: Option<bool>,
    pub send_success: Option<bool>,
}

/// One entry per distinct callsign, spec.md §3. Position fields and signal
/// fields update independently (station-field disjointness, §8 invariant 3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StationPosition {
    pub callsign: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub rssi: Option<f32>,
    pub snr: Option<f32>,
    pub hw: Option<String>,
    pub sym_table: Option<char>,
    pub sym_code: Option<char>,
    pub first_seen: i64,
    pub last_seen: i64,
}

/// Raw RSSI/SNR sample from an MHeard beacon. Append-only, pruned by age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSample {
    pub callsign: String,
    pub timestamp: i64,
    pub rssi: f32,
    pub snr: f32,
}

/// Aggregation granularity for `signal_buckets`, spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    FiveMin,
    OneHour,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::FiveMin => "5min",
            Granularity::OneHour => "1h",
        }
    }

    pub fn bucket_seconds(self) -> i64 {
        match self {
            Granularity::FiveMin => 5 * 60,
            Granularity::OneHour => 60 * 60,
        }
    }
}

/// Pre-aggregated (callsign, granularity, bucket_start) signal statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalBucket {
    pub callsign: String,
    pub granularity: Granularity,
    pub bucket_start: i64,
    pub count: i64,
    pub sum_rssi: f64,
    pub sum_snr: f64,
    pub min_rssi: f32,
    pub max_rssi: f32,
}

impl SignalBucket {
    pub fn new(callsign: String, granularity: Granularity, bucket_start: i64, rssi: f32, snr: f32) -> Self {
        Self {
            callsign,
            granularity,
            bucket_start,
            count: 1,
            sum_rssi: rssi as f64,
            sum_snr: snr as f64,
            min_rssi: rssi,
            max_rssi: rssi,
        }
    }

    pub fn accumulate(&mut self, rssi: f32, snr: f32) {
        self.count += 1;
        self.sum_rssi += rssi as f64;
        self.sum_snr += snr as f64;
        self.min_rssi = self.min_rssi.min(rssi);
        self.max_rssi = self.max_rssi.max(rssi);
    }
}

/// Transient pacing state held by the validator's outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundPending {
    pub transport: TransportKind,
    pub payload: MeshMessage,
    pub enqueue_time: i64,
    pub attempt_count: u32,
}

/// Cursor-paginated query filters for `storage::query`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageFilter {
    pub msg_type: Option<MessageType>,
    pub dst: Option<String>,
    pub src: Option<String>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl MeshMessage {
    /// Normalize a freshly-parsed frame's timestamp: frames the transport
    /// didn't stamp get the current wall-clock time.
    pub fn with_default_timestamp(mut self) -> Self {
        if self.timestamp == 0 {
            self.timestamp = now_ms();
        }
        self
    }
}
