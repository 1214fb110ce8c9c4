//! Normalization, quarantine routing, dedup, and outbound suppression/pacing.
//! spec.md §4.2 "Validator" and the outbound-echo-loop invariant in §8.
//!
//! Grounded on the teacher's `signal_calculations` module for the idiom of a
//! small, pure, heavily-unit-tested struct sitting between raw transport
//! input and the router.

use crate::model::{MeshMessage, OutboundPending, TransportKind};
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

const DEDUP_WINDOW: usize = 2000;
const OUTBOUND_SUPPRESSION_TTL: Duration = Duration::from_secs(30);

/// Synthetic destination a frame is rerouted to when its payload fails the
/// APRS-safe-character check, spec.md §4.2 Normalization. The frame is still
/// stored and broadcast under this group rather than dropped.
pub const QUARANTINE_GROUP: &str = "QUARANTINE";

/// Remove control bytes from a payload, spec.md §4.2 "strip control bytes".
fn strip_control_bytes(text: &str) -> String {
    text.chars().filter(|c| !c.is_control()).collect()
}

/// True if every character is printable ASCII or a non-control, non-replacement
/// Unicode character, i.e. "printable ASCII + defined UTF-8 sequences" per
/// spec.md §3's payload-text invariant.
fn is_aprs_safe(text: &str) -> bool {
    text.chars().all(|c| {
        if c.is_ascii() {
            c.is_ascii_graphic() || c == ' '
        } else {
            !c.is_control() && c != char::REPLACEMENT_CHARACTER
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Accept,
    Duplicate,
    Echo,
    Quarantine(String),
}

/// A frame that failed validation outright (not a duplicate, not an echo of
/// our own traffic) but shouldn't crash ingestion. Counted, logged, dropped.
#[derive(Debug, Clone)]
pub struct QuarantinedFrame {
    pub reason: String,
    pub src: String,
    pub msg_type: &'static str,
}

pub struct Validator {
    seen_fingerprints: VecDeque<String>,
    seen_set: HashSet<String>,
    pending_outbound: Vec<(String, Instant)>,
    last_outbound_sent: Option<Instant>,
    quarantine_count: u64,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            seen_fingerprints: VecDeque::with_capacity(DEDUP_WINDOW),
            seen_set: HashSet::with_capacity(DEDUP_WINDOW),
            pending_outbound: Vec::new(),
            last_outbound_sent: None,
            quarantine_count: 0,
        }
    }

    pub fn quarantine_count(&self) -> u64 {
        self.quarantine_count
    }

    /// Fill in fields a transport may have left blank, strip control bytes
    /// from the payload, and reroute non-APRS-safe payloads to the synthetic
    /// quarantine group instead of their original destination. Never rejects
    /// a frame outright.
    pub fn normalize(&self, mut msg: MeshMessage) -> MeshMessage {
        if msg.dst.trim().is_empty() {
            msg.dst = "*".to_string();
        }
        msg.src = msg.src.trim().to_string();
        msg.msg = strip_control_bytes(&msg.msg);
        if !is_aprs_safe(&msg.msg) {
            msg.dst = QUARANTINE_GROUP.to_string();
        }
        msg.with_default_timestamp()
    }

    /// Structural checks that must hold before a frame reaches the router.
    pub fn validate(&self, msg: &MeshMessage) -> Result<(), QuarantinedFrame> {
        if msg.src.is_empty() {
            return Err(QuarantinedFrame {
                reason: "empty src callsign".into(),
                src: msg.src.clone(),
                msg_type: msg.msg_type.as_str(),
            });
        }
        if msg.msg.is_empty() && msg.msg_type == crate::model::MessageType::Msg {
            return Err(QuarantinedFrame {
                reason: "empty msg body".into(),
                src: msg.src.clone(),
                msg_type: msg.msg_type.as_str(),
            });
        }
        Ok(())
    }

    fn fingerprint(msg: &MeshMessage) -> String {
        match &msg.msg_id {
            Some(id) if !id.is_empty() => format!("id:{id}"),
            _ => format!("fp:{}:{}:{}:{}", msg.src, msg.dst, msg.msg, msg.timestamp / 1000),
        }
    }

    /// Returns `true` and records the fingerprint if this is new; `false` if
    /// it was already seen within the sliding window.
    fn observe_fingerprint(&mut self, fp: String) -> bool {
        if self.seen_set.contains(&fp) {
            return false;
        }
        if self.seen_fingerprints.len() >= DEDUP_WINDOW {
            if let Some(oldest) = self.seen_fingerprints.pop_front() {
                self.seen_set.remove(&oldest);
            }
        }
        self.seen_set.insert(fp.clone());
        self.seen_fingerprints.push_back(fp);
        true
    }

    fn prune_pending_outbound(&mut self, now: Instant) {
        self.pending_outbound.retain(|(_, t)| now.duration_since(*t) < OUTBOUND_SUPPRESSION_TTL);
    }

    /// Record that we just sent `msg` so the next matching inbound echo of it
    /// is suppressed instead of re-routed as new traffic.
    pub fn mark_outbound(&mut self, msg: &MeshMessage) {
        let now = Instant::now();
        self.prune_pending_outbound(now);
        self.pending_outbound.push((Self::fingerprint(msg), now));
    }

    /// Full ingress decision for an inbound frame: echo suppression first
    /// (cheapest and most specific), then dedup, then validation.
    pub fn classify_inbound(&mut self, msg: &MeshMessage) -> Disposition {
        let now = Instant::now();
        self.prune_pending_outbound(now);
        let fp = Self::fingerprint(msg);
        if self.pending_outbound.iter().any(|(pending_fp, _)| pending_fp == &fp) {
            return Disposition::Echo;
        }
        if let Err(q) = self.validate(msg) {
            self.quarantine_count += 1;
            return Disposition::Quarantine(q.reason);
        }
        if !self.observe_fingerprint(fp) {
            return Disposition::Duplicate;
        }
        Disposition::Accept
    }

    /// How long to wait before the next outbound send given the configured
    /// pacing gap. Call right before sending; does not itself sleep.
    pub fn outbound_wait(&mut self, pacing: Duration) -> Duration {
        let now = Instant::now();
        let wait = match self.last_outbound_sent {
            Some(last) => pacing.saturating_sub(now.duration_since(last)),
            None => Duration::ZERO,
        };
        self.last_outbound_sent = Some(now + wait);
        wait
    }

    pub fn to_pending(transport: TransportKind, payload: MeshMessage, enqueue_time: i64) -> OutboundPending {
        OutboundPending { transport, payload, enqueue_time, attempt_count: 0 }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageType, TransportKind};

    fn msg(src: &str, id: Option<&str>) -> MeshMessage {
        MeshMessage {
            msg_id: id.map(|s| s.to_string()),
            src: src.to_string(),
            dst: "*".to_string(),
            msg: "hello".to_string(),
            msg_type: MessageType::Msg,
            timestamp: 1_700_000_000_000,
            rssi: None,
            snr: None,
            src_type: TransportKind::Udp,
            raw: vec![],
            echo_id: None,
            acked: None,
        }
    }

    #[test]
    fn duplicate_by_msg_id_is_rejected() {
        let mut v = Validator::new();
        assert_eq!(v.classify_inbound(&msg("DL4GLE-10", Some("abc"))), Disposition::Accept);
        assert_eq!(v.classify_inbound(&msg("DL4GLE-10", Some("abc"))), Disposition::Duplicate);
    }

    #[test]
    fn own_outbound_echo_is_suppressed() {
        let mut v = Validator::new();
        let sent = msg("DK5EN-9", None);
        v.mark_outbound(&sent);
        assert_eq!(v.classify_inbound(&sent), Disposition::Echo);
    }

    #[test]
    fn empty_src_is_quarantined_not_panicking() {
        let mut v = Validator::new();
        let bad = msg("", None);
        match v.classify_inbound(&bad) {
            Disposition::Quarantine(_) => {}
            other => panic!("expected quarantine, got {other:?}"),
        }
        assert_eq!(v.quarantine_count(), 1);
    }

    #[test]
    fn normalize_strips_control_bytes() {
        let v = Validator::new();
        let mut noisy = msg("DL4GLE-10", None);
        noisy.msg = "hel\x07lo\x1bworld".to_string();
        let cleaned = v.normalize(noisy);
        assert_eq!(cleaned.msg, "helloworld");
        assert_eq!(cleaned.dst, "*");
    }

    #[test]
    fn normalize_routes_non_aprs_safe_payload_to_quarantine_group() {
        let v = Validator::new();
        let mut bad = msg("DL4GLE-10", None);
        bad.dst = "WIDE2-1".to_string();
        bad.msg = format!("broken{}", char::REPLACEMENT_CHARACTER);
        let routed = v.normalize(bad);
        assert_eq!(routed.dst, QUARANTINE_GROUP);
    }

    #[test]
    fn normalize_leaves_clean_payload_dst_untouched() {
        let v = Validator::new();
        let mut clean = msg("DL4GLE-10", None);
        clean.dst = "WIDE2-1".to_string();
        let routed = v.normalize(clean);
        assert_eq!(routed.dst, "WIDE2-1");
    }

    #[test]
    fn outbound_wait_enforces_pacing_gap() {
        let mut v = Validator::new();
        let pacing = Duration::from_millis(50);
        let first = v.outbound_wait(pacing);
        assert_eq!(first, Duration::ZERO);
        let second = v.outbound_wait(pacing);
        assert!(second > Duration::ZERO);
    }
}
