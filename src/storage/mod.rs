//! Storage Engine (C1), spec.md §4.1.
//!
//! All blocking database work happens on one dedicated OS thread (the
//! "worker" of spec.md §5); the rest of the program talks to it only through
//! [`StorageHandle`], which ships commands over an `mpsc` channel and awaits
//! a `oneshot` reply. This is the message-passing boundary the concurrency
//! model requires: no `Arc<Mutex<Connection>>` shared between the async loop
//! and the worker.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::errors::StorageError;
use crate::model::{Granularity, MessageFilter, SignalBucket, StationPosition, StoredMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Per-type row counts returned to an SSE client bootstrapping its history,
/// spec.md §4.1 "initial payload operation".
#[derive(Debug, Clone)]
pub struct InitialPayloadLimits {
    pub msg: usize,
    pub pos: usize,
    pub ack: usize,
}

impl Default for InitialPayloadLimits {
    fn default() -> Self {
        Self { msg: 500, pos: 200, ack: 100 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitialPayload {
    pub msg: Vec<StoredMessage>,
    pub pos: Vec<StoredMessage>,
    pub ack: Vec<StoredMessage>,
}

/// Retention windows, spec.md §4.1 table. Hour-based fields mirror the
/// `PRUNE_HOURS*` config keys from spec.md §6 directly.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub messages_msg_hours: u32,
    pub messages_pos_ack_hours: u32,
    pub signal_log_hours: u32,
    pub buckets_5min_hours: u32,
    pub buckets_1h_hours: u32,
    pub station_hours: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            messages_msg_hours: 720,
            messages_pos_ack_hours: 192,
            signal_log_hours: 192,
            buckets_5min_hours: 192,
            buckets_1h_hours: 365 * 24,
            station_hours: 720,
        }
    }
}

/// A position beacon's fields, kept distinct from signal fields per the
/// station-field-disjointness invariant (spec.md §8 invariant 3).
#[derive(Debug, Clone)]
pub struct PositionUpdate {
    pub callsign: String,
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
    pub hw: Option<String>,
    pub sym_table: Option<char>,
    pub sym_code: Option<char>,
    pub timestamp: i64,
}

/// Backend-agnostic storage contract. Implementations run entirely inside
/// the storage worker thread; none of their methods are `async`.
pub trait StorageBackend: Send {
    fn append(&mut self, msg: &crate::model::MeshMessage) -> Result<StoredMessage, StorageError>;
    fn query(&mut self, filter: &MessageFilter, cursor: Option<i64>, limit: usize) -> Result<Vec<StoredMessage>, StorageError>;
    fn upsert_station_position(&mut self, update: &PositionUpdate) -> Result<(), StorageError>;
    fn upsert_station_signal(&mut self, callsign: &str, rssi: f32, snr: f32, ts: i64) -> Result<(), StorageError>;
    fn append_signal_sample(&mut self, callsign: &str, rssi: f32, snr: f32, ts: i64) -> Result<(), StorageError>;
    fn station_position(&mut self, callsign: &str) -> Result<Option<StationPosition>, StorageError>;
    fn initial_payload(&mut self, limits: &InitialPayloadLimits) -> Result<InitialPayload, StorageError>;
    fn insert_bucket(&mut self, bucket: &SignalBucket) -> Result<(), StorageError>;
    fn buckets_older_than(&mut self, granularity: Granularity, cutoff: i64) -> Result<Vec<SignalBucket>, StorageError>;
    fn delete_buckets_older_than(&mut self, granularity: Granularity, cutoff: i64) -> Result<u64, StorageError>;
    fn prune_now(&mut self, cfg: &RetentionConfig, now_ms: i64) -> Result<(), StorageError>;
    fn recent_signal_samples(&mut self, since_ms: i64) -> Result<Vec<crate::model::SignalSample>, StorageError>;
    fn analyze(&mut self) -> Result<(), StorageError>;
}

enum Command {
    Append(crate::model::MeshMessage, oneshot::Sender<Result<StoredMessage, StorageError>>),
    Query(MessageFilter, Option<i64>, usize, oneshot::Sender<Result<Vec<StoredMessage>, StorageError>>),
    UpsertPosition(PositionUpdate, oneshot::Sender<Result<(), StorageError>>),
    UpsertSignal(String, f32, f32, i64, oneshot::Sender<Result<(), StorageError>>),
    AppendSignalSample(String, f32, f32, i64, oneshot::Sender<Result<(), StorageError>>),
    StationPosition(String, oneshot::Sender<Result<Option<StationPosition>, StorageError>>),
    InitialPayload(InitialPayloadLimits, oneshot::Sender<Result<InitialPayload, StorageError>>),
    PruneNow(RetentionConfig, i64, oneshot::Sender<Result<(), StorageError>>),
    RollupBuckets(i64, oneshot::Sender<Result<(), StorageError>>),
}

/// Handle to the storage worker. Cheaply `Clone`-able; every clone shares the
/// same underlying worker thread and database handle.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<Command>,
}

/// The in-memory 5-minute bucket accumulator, spec.md §4.1. Lives in the
/// worker so every mutation is naturally serialized with the database writes
/// it eventually flushes into.
struct BucketAccumulator {
    open: HashMap<String, SignalBucket>,
}

impl BucketAccumulator {
    fn new() -> Self {
        Self { open: HashMap::new() }
    }

    fn bucket_start(ts_ms: i64) -> i64 {
        let secs = ts_ms / 1000;
        secs - (secs % Granularity::FiveMin.bucket_seconds())
    }

    /// Record a sample, returning a closed bucket if the 5-minute window for
    /// this callsign rolled over.
    fn observe(&mut self, callsign: &str, rssi: f32, snr: f32, ts_ms: i64) -> Option<SignalBucket> {
        let start = Self::bucket_start(ts_ms);
        match self.open.get_mut(callsign) {
            Some(bucket) if bucket.bucket_start == start => {
                bucket.accumulate(rssi, snr);
                None
            }
            Some(bucket) => {
                let closed = std::mem::replace(
                    bucket,
                    SignalBucket::new(callsign.to_string(), Granularity::FiveMin, start, rssi, snr),
                );
                Some(closed)
            }
            None => {
                self.open.insert(
                    callsign.to_string(),
                    SignalBucket::new(callsign.to_string(), Granularity::FiveMin, start, rssi, snr),
                );
                None
            }
        }
    }

    fn flush_all(&mut self) -> Vec<SignalBucket> {
        self.open.drain().map(|(_, b)| b).collect()
    }

    /// Rebuild open buckets for the current window from recent `signal_log`
    /// rows, used on startup per spec.md §4.1.
    fn rebuild_from_samples(&mut self, samples: &[crate::model::SignalSample]) {
        for s in samples {
            self.observe(&s.callsign, s.rssi, s.snr, s.timestamp);
        }
    }
}

fn worker_loop(mut backend: Box<dyn StorageBackend>, mut rx: mpsc::Receiver<Command>) {
    let mut accumulator = BucketAccumulator::new();

    // Rebuild in-memory 5-minute buckets for the current window.
    let now = chrono::Utc::now().timestamp_millis();
    let window_start = now - Granularity::FiveMin.bucket_seconds() * 1000;
    if let Ok(samples) = backend.recent_signal_samples(window_start) {
        accumulator.rebuild_from_samples(&samples);
    }

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::Append(msg, reply) => {
                let result = backend.append(&msg);
                let _ = reply.send(result);
            }
            Command::Query(filter, cursor, limit, reply) => {
                let result = backend.query(&filter, cursor, limit);
                let _ = reply.send(result);
            }
            Command::UpsertPosition(update, reply) => {
                let result = backend.upsert_station_position(&update);
                let _ = reply.send(result);
            }
            Command::UpsertSignal(cs, rssi, snr, ts, reply) => {
                let result = backend.upsert_station_signal(&cs, rssi, snr, ts);
                let _ = reply.send(result);
            }
            Command::AppendSignalSample(cs, rssi, snr, ts, reply) => {
                let append_result = backend.append_signal_sample(&cs, rssi, snr, ts);
                if append_result.is_ok() {
                    if let Some(closed) = accumulator.observe(&cs, rssi, snr, ts) {
                        if let Err(err) = backend.insert_bucket(&closed) {
                            log::warn!("failed to flush signal bucket for {cs}: {err}");
                        }
                    }
                }
                let _ = reply.send(append_result);
            }
            Command::StationPosition(cs, reply) => {
                let result = backend.station_position(&cs);
                let _ = reply.send(result);
            }
            Command::InitialPayload(limits, reply) => {
                let result = backend.initial_payload(&limits);
                let _ = reply.send(result);
            }
            Command::PruneNow(cfg, now_ms, reply) => {
                let result = backend.prune_now(&cfg, now_ms);
                let _ = reply.send(result);
            }
            Command::RollupBuckets(now_ms, reply) => {
                for bucket in accumulator.flush_all() {
                    if let Err(err) = backend.insert_bucket(&bucket) {
                        log::warn!("failed to flush signal bucket on rollup: {err}");
                    }
                }
                let result = rollup_buckets(backend.as_mut(), now_ms);
                let _ = reply.send(result);
            }
        }
    }
    log::info!("storage worker shutting down");
}

/// Aggregate 5-minute buckets older than the 24h roll-up horizon into
/// 1-hour buckets, then delete the source rows. spec.md §4.1 "Roll-up".
fn rollup_buckets(backend: &mut dyn StorageBackend, now_ms: i64) -> Result<(), StorageError> {
    const ROLLUP_HORIZON_SECS: i64 = 24 * 60 * 60;
    let cutoff = now_ms / 1000 - ROLLUP_HORIZON_SECS;
    let stale = backend.buckets_older_than(Granularity::FiveMin, cutoff)?;

    let mut merged: HashMap<(String, i64), SignalBucket> = HashMap::new();
    for bucket in stale {
        let hour_start = bucket.bucket_start - (bucket.bucket_start % Granularity::OneHour.bucket_seconds());
        let key = (bucket.callsign.clone(), hour_start);
        merged
            .entry(key)
            .and_modify(|acc| {
                acc.count += bucket.count;
                acc.sum_rssi += bucket.sum_rssi;
                acc.sum_snr += bucket.sum_snr;
                acc.min_rssi = acc.min_rssi.min(bucket.min_rssi);
                acc.max_rssi = acc.max_rssi.max(bucket.max_rssi);
            })
            .or_insert_with(|| SignalBucket {
                callsign: bucket.callsign.clone(),
                granularity: Granularity::OneHour,
                bucket_start: hour_start,
                count: bucket.count,
                sum_rssi: bucket.sum_rssi,
                sum_snr: bucket.sum_snr,
                min_rssi: bucket.min_rssi,
                max_rssi: bucket.max_rssi,
            });
    }
    for bucket in merged.into_values() {
        backend.insert_bucket(&bucket)?;
    }
    backend.delete_buckets_older_than(Granularity::FiveMin, cutoff)?;
    backend.analyze()?;
    Ok(())
}

impl StorageHandle {
    /// Spawn the storage worker thread and return a handle to it. `backend`
    /// is constructed by the caller (so tests can pass a `MemoryStorage`
    /// without touching disk) and moved onto the dedicated thread.
    pub fn spawn(backend: Box<dyn StorageBackend>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        std::thread::Builder::new()
            .name("mcapp-storage".to_string())
            .spawn(move || worker_loop(backend, rx))
            .expect("failed to spawn storage worker thread");
        Self { tx }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T, StorageError>>) -> Command) -> Result<T, StorageError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(build(reply_tx)).await.map_err(|_| StorageError::WorkerGone)?;
        reply_rx.await.map_err(|_| StorageError::WorkerGone)?
    }

    pub async fn append(&self, msg: crate::model::MeshMessage) -> Result<StoredMessage, StorageError> {
        self.call(|reply| Command::Append(msg, reply)).await
    }

    pub async fn query(&self, filter: MessageFilter, cursor: Option<i64>, limit: usize) -> Result<Vec<StoredMessage>, StorageError> {
        self.call(|reply| Command::Query(filter, cursor, limit, reply)).await
    }

    pub async fn upsert_station_position(&self, update: PositionUpdate) -> Result<(), StorageError> {
        self.call(|reply| Command::UpsertPosition(update, reply)).await
    }

    pub async fn upsert_station_signal(&self, callsign: String, rssi: f32, snr: f32, ts: i64) -> Result<(), StorageError> {
        self.call(|reply| Command::UpsertSignal(callsign, rssi, snr, ts, reply)).await
    }

    pub async fn append_signal_sample(&self, callsign: String, rssi: f32, snr: f32, ts: i64) -> Result<(), StorageError> {
        self.call(|reply| Command::AppendSignalSample(callsign, rssi, snr, ts, reply)).await
    }

    pub async fn station_position(&self, callsign: String) -> Result<Option<StationPosition>, StorageError> {
        self.call(|reply| Command::StationPosition(callsign, reply)).await
    }

    pub async fn initial_payload(&self, limits: InitialPayloadLimits) -> Result<InitialPayload, StorageError> {
        self.call(|reply| Command::InitialPayload(limits, reply)).await
    }

    pub async fn prune_now(&self, cfg: RetentionConfig, now_ms: i64) -> Result<(), StorageError> {
        self.call(|reply| Command::PruneNow(cfg, now_ms, reply)).await
    }

    pub async fn rollup_buckets(&self, now_ms: i64) -> Result<(), StorageError> {
        self.call(|reply| Command::RollupBuckets(now_ms, reply)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_accumulator_rolls_over_on_window_boundary() {
        let mut acc = BucketAccumulator::new();
        let base = 1_700_000_000_000i64;
        assert!(acc.observe("DL4GLE-10", -90.0, 4.0, base).is_none());
        assert!(acc.observe("DL4GLE-10", -88.0, 5.0, base + 60_000).is_none());
        // 6 minutes later: crosses a 5-minute boundary, closes the first bucket.
        let closed = acc.observe("DL4GLE-10", -85.0, 6.0, base + 6 * 60_000);
        assert!(closed.is_some());
        let closed = closed.unwrap();
        assert_eq!(closed.count, 2);
    }
}
