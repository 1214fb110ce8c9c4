//! In-process [`StorageBackend`] for `STORAGE.backend = "memory"` deployments
//! and for tests. Bounded `VecDeque`s stand in for the SQLite tables; nothing
//! here survives a restart, which is the whole point of the mode (spec.md §6
//! `backend` config key, `STORAGE_BACKEND_MEMORY` non-goal exception).

use super::{InitialPayload, InitialPayloadLimits, PositionUpdate, RetentionConfig, StorageBackend};
use crate::errors::StorageError;
use crate::model::{Granularity, MeshMessage, MessageFilter, MessageType, SignalBucket, SignalSample, StationPosition, StoredMessage};
use std::collections::{HashMap, VecDeque};

const MAX_MESSAGES: usize = 20_000;
const MAX_SIGNAL_LOG: usize = 50_000;

pub struct MemoryStorage {
    messages: VecDeque<StoredMessage>,
    next_id: i64,
    stations: HashMap<String, StationPosition>,
    signal_log: VecDeque<SignalSample>,
    buckets: HashMap<(String, Granularity, i64), SignalBucket>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            next_id: 1,
            stations: HashMap::new(),
            signal_log: VecDeque::new(),
            buckets: HashMap::new(),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStorage {
    fn append(&mut self, msg: &MeshMessage) -> Result<StoredMessage, StorageError> {
        let stored = StoredMessage {
            id: self.next_id,
            msg_id: msg.msg_id.clone(),
            src: msg.src.clone(),
            dst: msg.dst.clone(),
            msg: msg.msg.clone(),
            msg_type: msg.msg_type,
            timestamp: msg.timestamp,
            rssi: msg.rssi,
            snr: msg.snr,
            src_type: msg.src_type,
            raw: msg.raw.clone(),
            echo_id: msg.echo_id.clone(),
            acked: msg.acked,
            send_success: None,
        };
        self.next_id += 1;
        self.messages.push_back(stored.clone());
        if self.messages.len() > MAX_MESSAGES {
            self.messages.pop_front();
        }
        Ok(stored)
    }

    fn query(&mut self, filter: &MessageFilter, cursor: Option<i64>, limit: usize) -> Result<Vec<StoredMessage>, StorageError> {
        let matches = |m: &StoredMessage| -> bool {
            if let Some(mt) = filter.msg_type {
                if m.msg_type != mt {
                    return false;
                }
            }
            if let Some(dst) = &filter.dst {
                if &m.dst != dst {
                    return false;
                }
            }
            if let Some(src) = &filter.src {
                if &m.src != src {
                    return false;
                }
            }
            if let Some(cursor) = cursor {
                if m.id >= cursor {
                    return false;
                }
            }
            true
        };
        Ok(self
            .messages
            .iter()
            .rev()
            .filter(|m| matches(m))
            .take(limit)
            .cloned()
            .collect())
    }

    fn upsert_station_position(&mut self, update: &PositionUpdate) -> Result<(), StorageError> {
        let entry = self.stations.entry(update.callsign.clone()).or_insert_with(|| StationPosition {
            callsign: update.callsign.clone(),
            first_seen: update.timestamp,
            ..Default::default()
        });
        entry.lat = Some(update.lat);
        entry.lon = Some(update.lon);
        entry.alt = update.alt;
        entry.hw = update.hw.clone();
        entry.sym_table = update.sym_table;
        entry.sym_code = update.sym_code;
        entry.last_seen = update.timestamp;
        Ok(())
    }

    fn upsert_station_signal(&mut self, callsign: &str, rssi: f32, snr: f32, ts: i64) -> Result<(), StorageError> {
        let entry = self.stations.entry(callsign.to_string()).or_insert_with(|| StationPosition {
            callsign: callsign.to_string(),
            first_seen: ts,
            ..Default::default()
        });
        entry.rssi = Some(rssi);
        entry.snr = Some(snr);
        entry.last_seen = ts;
        Ok(())
    }

    fn append_signal_sample(&mut self, callsign: &str, rssi: f32, snr: f32, ts: i64) -> Result<(), StorageError> {
        self.signal_log.push_back(SignalSample { callsign: callsign.to_string(), timestamp: ts, rssi, snr });
        if self.signal_log.len() > MAX_SIGNAL_LOG {
            self.signal_log.pop_front();
        }
        Ok(())
    }

    fn station_position(&mut self, callsign: &str) -> Result<Option<StationPosition>, StorageError> {
        Ok(self.stations.get(callsign).cloned())
    }

    fn initial_payload(&mut self, limits: &InitialPayloadLimits) -> Result<InitialPayload, StorageError> {
        let take = |mt: MessageType, limit: usize| -> Vec<StoredMessage> {
            let mut out: Vec<StoredMessage> = self.messages.iter().rev().filter(|m| m.msg_type == mt).take(limit).cloned().collect();
            out.reverse();
            out
        };
        Ok(InitialPayload {
            msg: take(MessageType::Msg, limits.msg),
            pos: take(MessageType::Pos, limits.pos),
            ack: take(MessageType::Ack, limits.ack),
        })
    }

    fn insert_bucket(&mut self, bucket: &SignalBucket) -> Result<(), StorageError> {
        let key = (bucket.callsign.clone(), bucket.granularity, bucket.bucket_start);
        self.buckets
            .entry(key)
            .and_modify(|b| {
                b.count += bucket.count;
                b.sum_rssi += bucket.sum_rssi;
                b.sum_snr += bucket.sum_snr;
                b.min_rssi = b.min_rssi.min(bucket.min_rssi);
                b.max_rssi = b.max_rssi.max(bucket.max_rssi);
            })
            .or_insert_with(|| bucket.clone());
        Ok(())
    }

    fn buckets_older_than(&mut self, granularity: Granularity, cutoff: i64) -> Result<Vec<SignalBucket>, StorageError> {
        Ok(self
            .buckets
            .values()
            .filter(|b| b.granularity == granularity && b.bucket_start < cutoff)
            .cloned()
            .collect())
    }

    fn delete_buckets_older_than(&mut self, granularity: Granularity, cutoff: i64) -> Result<u64, StorageError> {
        let before = self.buckets.len();
        self.buckets.retain(|_, b| !(b.granularity == granularity && b.bucket_start < cutoff));
        Ok((before - self.buckets.len()) as u64)
    }

    fn prune_now(&mut self, cfg: &RetentionConfig, now_ms: i64) -> Result<(), StorageError> {
        let cutoff = |hours: u32| now_ms - (hours as i64) * 3_600_000;
        let msg_cutoff = cutoff(cfg.messages_msg_hours);
        let pos_ack_cutoff = cutoff(cfg.messages_pos_ack_hours);
        self.messages.retain(|m| match m.msg_type {
            MessageType::Msg => m.timestamp >= msg_cutoff,
            MessageType::Pos | MessageType::Ack => m.timestamp >= pos_ack_cutoff,
        });
        let signal_cutoff = cutoff(cfg.signal_log_hours);
        self.signal_log.retain(|s| s.timestamp >= signal_cutoff);
        let station_cutoff = cutoff(cfg.station_hours);
        self.stations.retain(|_, s| s.last_seen >= station_cutoff);
        let five_min_cutoff = cutoff(cfg.buckets_5min_hours) / 1000;
        let one_hour_cutoff = cutoff(cfg.buckets_1h_hours) / 1000;
        self.buckets.retain(|_, b| match b.granularity {
            Granularity::FiveMin => b.bucket_start >= five_min_cutoff,
            Granularity::OneHour => b.bucket_start >= one_hour_cutoff,
        });
        Ok(())
    }

    fn recent_signal_samples(&mut self, since_ms: i64) -> Result<Vec<SignalSample>, StorageError> {
        Ok(self.signal_log.iter().filter(|s| s.timestamp >= since_ms).cloned().collect())
    }

    fn analyze(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransportKind;

    fn sample(ts: i64) -> MeshMessage {
        MeshMessage {
            msg_id: None,
            src: "DK5EN-9".into(),
            dst: "*".into(),
            msg: "test".into(),
            msg_type: MessageType::Msg,
            timestamp: ts,
            rssi: None,
            snr: None,
            src_type: TransportKind::Udp,
            raw: vec![],
            echo_id: None,
            acked: None,
        }
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut storage = MemoryStorage::new();
        for i in 0..(MAX_MESSAGES + 5) {
            storage.append(&sample(i as i64)).unwrap();
        }
        assert_eq!(storage.messages.len(), MAX_MESSAGES);
        assert_eq!(storage.messages.front().unwrap().timestamp, 5);
    }

    #[test]
    fn prune_now_removes_signal_log_rows_older_than_retention() {
        let mut storage = MemoryStorage::new();
        let now = 1_700_000_000_000i64;
        let nine_days_ago = now - 9 * 24 * 3_600_000;
        storage.append_signal_sample("DL4GLE-10", -93.0, 3.0, nine_days_ago).unwrap();
        storage.append_signal_sample("DL4GLE-10", -80.0, 7.0, now).unwrap();
        storage.prune_now(&RetentionConfig::default(), now).unwrap();
        let remaining = storage.recent_signal_samples(0).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, now);
    }

    #[test]
    fn initial_payload_returns_oldest_first() {
        let mut storage = MemoryStorage::new();
        storage.append(&sample(1)).unwrap();
        storage.append(&sample(2)).unwrap();
        let payload = storage.initial_payload(&InitialPayloadLimits::default()).unwrap();
        assert_eq!(payload.msg[0].timestamp, 1);
        assert_eq!(payload.msg[1].timestamp, 2);
    }
}
