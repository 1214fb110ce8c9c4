//! SQLite-backed [`StorageBackend`], spec.md §4.1.
//!
//! Grounded on the teacher's `control::config::ControlConfig::load` pattern
//! for turning IO/parse failures into a typed error, generalized here to
//! schema setup and row mapping. WAL mode and `synchronous=NORMAL` follow the
//! durability/throughput tradeoff spec.md §4.1 calls for on a single-writer
//! worker thread.

use super::{InitialPayload, InitialPayloadLimits, PositionUpdate, RetentionConfig, StorageBackend};
use crate::errors::StorageError;
use crate::model::{
    Granularity, MeshMessage, MessageFilter, MessageType, SignalBucket, SignalSample, StationPosition, StoredMessage,
    TransportKind,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const SCHEMA_VERSION: i64 = 1;

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let storage = Self { conn };
        storage.migrate()?;
        Ok(storage)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn };
        storage.migrate()?;
        Ok(storage)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

             CREATE TABLE IF NOT EXISTS messages (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 msg_id TEXT,
                 src TEXT NOT NULL,
                 dst TEXT NOT NULL,
                 msg TEXT NOT NULL,
                 msg_type TEXT NOT NULL,
                 timestamp INTEGER NOT NULL,
                 rssi REAL,
                 snr REAL,
                 src_type TEXT NOT NULL,
                 raw BLOB NOT NULL,
                 echo_id TEXT,
                 acked INTEGER,
                 send_success INTEGER
             );
             CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(timestamp);
             CREATE INDEX IF NOT EXISTS idx_messages_src ON messages(src);
             CREATE INDEX IF NOT EXISTS idx_messages_dst ON messages(dst);
             CREATE INDEX IF NOT EXISTS idx_messages_type ON messages(msg_type);
             CREATE INDEX IF NOT EXISTS idx_messages_type_ts ON messages(msg_type, timestamp DESC);
             CREATE INDEX IF NOT EXISTS idx_messages_dst_ts ON messages(dst, timestamp);
             CREATE INDEX IF NOT EXISTS idx_messages_type_dst_ts ON messages(msg_type, dst, timestamp DESC);

             CREATE TABLE IF NOT EXISTS station_positions (
                 callsign TEXT PRIMARY KEY,
                 lat REAL,
                 lon REAL,
                 alt REAL,
                 rssi REAL,
                 snr REAL,
                 hw TEXT,
                 sym_table TEXT,
                 sym_code TEXT,
                 first_seen INTEGER NOT NULL,
                 last_seen INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS signal_log (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 callsign TEXT NOT NULL,
                 timestamp INTEGER NOT NULL,
                 rssi REAL NOT NULL,
                 snr REAL NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_signal_log_ts ON signal_log(timestamp);
             CREATE INDEX IF NOT EXISTS idx_signal_log_callsign ON signal_log(callsign, timestamp);

             CREATE TABLE IF NOT EXISTS signal_buckets (
                 callsign TEXT NOT NULL,
                 granularity TEXT NOT NULL,
                 bucket_start INTEGER NOT NULL,
                 count INTEGER NOT NULL,
                 sum_rssi REAL NOT NULL,
                 sum_snr REAL NOT NULL,
                 min_rssi REAL NOT NULL,
                 max_rssi REAL NOT NULL,
                 PRIMARY KEY (callsign, granularity, bucket_start)
             );",
        )?;

        let version: Option<i64> = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |r| r.get(0))
            .optional()?;
        match version {
            None => {
                self.conn.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(StorageError::Corrupt(format!(
                    "database schema_version {v} is newer than this binary supports ({SCHEMA_VERSION})"
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<StoredMessage> {
        let msg_type_str: String = row.get("msg_type")?;
        let src_type_str: String = row.get("src_type")?;
        let acked: Option<i64> = row.get("acked")?;
        let send_success: Option<i64> = row.get("send_success")?;
        Ok(StoredMessage {
            id: row.get("id")?,
            msg_id: row.get("msg_id")?,
            src: row.get("src")?,
            dst: row.get("dst")?,
            msg: row.get("msg")?,
            msg_type: parse_msg_type(&msg_type_str),
            timestamp: row.get("timestamp")?,
            rssi: row.get("rssi")?,
            snr: row.get("snr")?,
            src_type: parse_transport_kind(&src_type_str),
            raw: row.get("raw")?,
            echo_id: row.get("echo_id")?,
            acked: acked.map(|v| v != 0),
            send_success: send_success.map(|v| v != 0),
        })
    }
}

fn parse_msg_type(s: &str) -> MessageType {
    match s {
        "pos" => MessageType::Pos,
        "ack" => MessageType::Ack,
        _ => MessageType::Msg,
    }
}

fn parse_transport_kind(s: &str) -> TransportKind {
    match s {
        "ble" => TransportKind::Ble,
        _ => TransportKind::Udp,
    }
}

fn granularity_str(g: Granularity) -> &'static str {
    g.as_str()
}

impl StorageBackend for SqliteStorage {
    fn append(&mut self, msg: &MeshMessage) -> Result<StoredMessage, StorageError> {
        self.conn.execute(
            "INSERT INTO messages (msg_id, src, dst, msg, msg_type, timestamp, rssi, snr, src_type, raw, echo_id, acked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                msg.msg_id,
                msg.src,
                msg.dst,
                msg.msg,
                msg.msg_type.as_str(),
                msg.timestamp,
                msg.rssi,
                msg.snr,
                if msg.src_type == TransportKind::Ble { "ble" } else { "udp" },
                msg.raw,
                msg.echo_id,
                msg.acked.map(|v| v as i64),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(StoredMessage {
            id,
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
        })
    }

    fn query(&mut self, filter: &MessageFilter, cursor: Option<i64>, limit: usize) -> Result<Vec<StoredMessage>, StorageError> {
        let mut sql = String::from("SELECT * FROM messages WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(mt) = filter.msg_type {
            sql.push_str(" AND msg_type = ?");
            args.push(Box::new(mt.as_str().to_string()));
        }
        if let Some(dst) = &filter.dst {
            sql.push_str(" AND dst = ?");
            args.push(Box::new(dst.clone()));
        }
        if let Some(src) = &filter.src {
            sql.push_str(" AND src = ?");
            args.push(Box::new(src.clone()));
        }
        if let Some(cursor) = cursor {
            sql.push_str(" AND id < ?");
            args.push(Box::new(cursor));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), Self::row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn upsert_station_position(&mut self, update: &PositionUpdate) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO station_positions (callsign, lat, lon, alt, hw, sym_table, sym_code, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(callsign) DO UPDATE SET
                 lat = excluded.lat,
                 lon = excluded.lon,
                 alt = excluded.alt,
                 hw = excluded.hw,
                 sym_table = excluded.sym_table,
                 sym_code = excluded.sym_code,
                 last_seen = excluded.last_seen",
            params![
                update.callsign,
                update.lat,
                update.lon,
                update.alt,
                update.hw,
                update.sym_table.map(|c| c.to_string()),
                update.sym_code.map(|c| c.to_string()),
                update.timestamp,
            ],
        )?;
        Ok(())
    }

    fn upsert_station_signal(&mut self, callsign: &str, rssi: f32, snr: f32, ts: i64) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO station_positions (callsign, rssi, snr, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(callsign) DO UPDATE SET
                 rssi = excluded.rssi,
                 snr = excluded.snr,
                 last_seen = excluded.last_seen",
            params![callsign, rssi, snr, ts],
        )?;
        Ok(())
    }

    fn append_signal_sample(&mut self, callsign: &str, rssi: f32, snr: f32, ts: i64) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO signal_log (callsign, timestamp, rssi, snr) VALUES (?1, ?2, ?3, ?4)",
            params![callsign, ts, rssi, snr],
        )?;
        Ok(())
    }

    fn station_position(&mut self, callsign: &str) -> Result<Option<StationPosition>, StorageError> {
        self.conn
            .query_row(
                "SELECT callsign, lat, lon, alt, rssi, snr, hw, sym_table, sym_code, first_seen, last_seen
                 FROM station_positions WHERE callsign = ?1",
                params![callsign],
                |row| {
                    let sym_table: Option<String> = row.get("sym_table")?;
                    let sym_code: Option<String> = row.get("sym_code")?;
                    Ok(StationPosition {
                        callsign: row.get("callsign")?,
                        lat: row.get("lat")?,
                        lon: row.get("lon")?,
                        alt: row.get("alt")?,
                        rssi: row.get("rssi")?,
                        snr: row.get("snr")?,
                        hw: row.get("hw")?,
                        sym_table: sym_table.and_then(|s| s.chars().next()),
                        sym_code: sym_code.and_then(|s| s.chars().next()),
                        first_seen: row.get("first_seen")?,
                        last_seen: row.get("last_seen")?,
                    })
                },
            )
            .optional()
            .map_err(StorageError::from)
    }

    fn initial_payload(&mut self, limits: &InitialPayloadLimits) -> Result<InitialPayload, StorageError> {
        let fetch = |conn: &Connection, msg_type: &str, limit: usize| -> Result<Vec<StoredMessage>, StorageError> {
            let mut stmt = conn.prepare(
                "SELECT * FROM messages WHERE msg_type = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![msg_type, limit as i64], Self::row_to_message)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out.reverse();
            Ok(out)
        };
        Ok(InitialPayload {
            msg: fetch(&self.conn, "msg", limits.msg)?,
            pos: fetch(&self.conn, "pos", limits.pos)?,
            ack: fetch(&self.conn, "ack", limits.ack)?,
        })
    }

    fn insert_bucket(&mut self, bucket: &SignalBucket) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO signal_buckets (callsign, granularity, bucket_start, count, sum_rssi, sum_snr, min_rssi, max_rssi)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(callsign, granularity, bucket_start) DO UPDATE SET
                 count = count + excluded.count,
                 sum_rssi = sum_rssi + excluded.sum_rssi,
                 sum_snr = sum_snr + excluded.sum_snr,
                 min_rssi = min(min_rssi, excluded.min_rssi),
                 max_rssi = max(max_rssi, excluded.max_rssi)",
            params![
                bucket.callsign,
                granularity_str(bucket.granularity),
                bucket.bucket_start,
                bucket.count,
                bucket.sum_rssi,
                bucket.sum_snr,
                bucket.min_rssi,
                bucket.max_rssi,
            ],
        )?;
        Ok(())
    }

    fn buckets_older_than(&mut self, granularity: Granularity, cutoff: i64) -> Result<Vec<SignalBucket>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT callsign, bucket_start, count, sum_rssi, sum_snr, min_rssi, max_rssi
             FROM signal_buckets WHERE granularity = ?1 AND bucket_start < ?2",
        )?;
        let rows = stmt.query_map(params![granularity_str(granularity), cutoff], |row| {
            Ok(SignalBucket {
                callsign: row.get(0)?,
                granularity,
                bucket_start: row.get(1)?,
                count: row.get(2)?,
                sum_rssi: row.get(3)?,
                sum_snr: row.get(4)?,
                min_rssi: row.get(5)?,
                max_rssi: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn delete_buckets_older_than(&mut self, granularity: Granularity, cutoff: i64) -> Result<u64, StorageError> {
        let n = self.conn.execute(
            "DELETE FROM signal_buckets WHERE granularity = ?1 AND bucket_start < ?2",
            params![granularity_str(granularity), cutoff],
        )?;
        Ok(n as u64)
    }

    fn prune_now(&mut self, cfg: &RetentionConfig, now_ms: i64) -> Result<(), StorageError> {
        let cutoff = |hours: u32| now_ms - (hours as i64) * 3_600_000;
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE msg_type = 'msg' AND timestamp < ?1",
            params![cutoff(cfg.messages_msg_hours)],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE msg_type IN ('pos', 'ack') AND timestamp < ?1",
            params![cutoff(cfg.messages_pos_ack_hours)],
        )?;
        tx.execute("DELETE FROM signal_log WHERE timestamp < ?1", params![cutoff(cfg.signal_log_hours)])?;
        tx.execute(
            "DELETE FROM signal_buckets WHERE granularity = '5min' AND bucket_start < ?1",
            params![cutoff(cfg.buckets_5min_hours) / 1000],
        )?;
        tx.execute(
            "DELETE FROM signal_buckets WHERE granularity = '1h' AND bucket_start < ?1",
            params![cutoff(cfg.buckets_1h_hours) / 1000],
        )?;
        tx.execute(
            "DELETE FROM station_positions WHERE last_seen < ?1",
            params![cutoff(cfg.station_hours)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn recent_signal_samples(&mut self, since_ms: i64) -> Result<Vec<SignalSample>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT callsign, timestamp, rssi, snr FROM signal_log WHERE timestamp >= ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![since_ms], |row| {
            Ok(SignalSample {
                callsign: row.get(0)?,
                timestamp: row.get(1)?,
                rssi: row.get(2)?,
                snr: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn analyze(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch("PRAGMA optimize;")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn sample_message(ts: i64) -> MeshMessage {
        MeshMessage {
            msg_id: Some("abc123".into()),
            src: "DL4GLE-10".into(),
            dst: "*".into(),
            msg: "hello mesh".into(),
            msg_type: MessageType::Msg,
            timestamp: ts,
            rssi: Some(-92.0),
            snr: Some(6.5),
            src_type: TransportKind::Udp,
            raw: b"{}".to_vec(),
            echo_id: None,
            acked: None,
        }
    }

    #[test]
    fn append_then_query_round_trips() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let stored = storage.append(&sample_message(NOW)).unwrap();
        assert_eq!(stored.id, 1);
        let rows = storage.query(&MessageFilter::default(), None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].src, "DL4GLE-10");
    }

    #[test]
    fn prune_now_removes_old_msg_rows_but_keeps_recent() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let now = NOW;
        storage.append(&sample_message(now - 1000 * 3600 * 1000)).unwrap();
        storage.append(&sample_message(now)).unwrap();
        storage.prune_now(&RetentionConfig::default(), now).unwrap();
        let rows = storage.query(&MessageFilter::default(), None, 10).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn prune_now_removes_signal_log_rows_older_than_retention() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let now = NOW;
        let nine_days_ago = now - 9 * 24 * 3_600_000;
        storage.append_signal_sample("DL4GLE-10", -93.0, 3.0, nine_days_ago).unwrap();
        storage.append_signal_sample("DL4GLE-10", -80.0, 7.0, now).unwrap();
        storage.prune_now(&RetentionConfig::default(), now).unwrap();
        let remaining = storage.recent_signal_samples(0).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, now);
    }

    #[test]
    fn signal_bucket_upsert_accumulates() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let bucket = SignalBucket::new("DL4GLE-10".into(), Granularity::FiveMin, 1_700_000_000, -90.0, 4.0);
        storage.insert_bucket(&bucket).unwrap();
        storage.insert_bucket(&bucket).unwrap();
        let rows = storage.buckets_older_than(Granularity::FiveMin, 1_800_000_000).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 2);
    }
}
