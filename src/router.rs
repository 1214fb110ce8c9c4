//! Pub/sub message router, spec.md §4.6 and Design Notes §9.
//!
//! Typed event variants, not free-form JSON, move between transports, the
//! validator, storage, the command handler, and the SSE gateway. Grounded on
//! the teacher's `control::client` retry idiom (bounded attempts with a fixed
//! backoff ladder) for [`retry`], generalized from one HTTP call to any
//! fallible async operation.

use crate::model::{MeshMessage, StationPosition};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

const RETRY_BACKOFF: &[Duration] = &[Duration::from_millis(500), Duration::from_secs(1), Duration::from_secs(2)];

#[derive(Debug, Clone)]
pub enum RouterEvent {
    Inbound(MeshMessage),
    Outbound(MeshMessage),
    StationUpdate(StationPosition),
}

/// Protocols (transports, command handler, SSE gateway) register themselves
/// so the router can log who is actually subscribed, per spec.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Ble,
    Command,
    Sse,
}

pub struct Router {
    bus: broadcast::Sender<RouterEvent>,
    registered: Mutex<Vec<Protocol>>,
    gps_cache: Arc<Mutex<Option<(f64, f64)>>>,
}

impl Router {
    pub fn new() -> Self {
        let (bus, _rx) = broadcast::channel(1024);
        Self { bus, registered: Mutex::new(Vec::new()), gps_cache: Arc::new(Mutex::new(None)) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.bus.subscribe()
    }

    pub fn publish(&self, event: RouterEvent) {
        // No subscribers is a normal state at startup; a send error here
        // just means nobody is listening yet, not a failure to report.
        let _ = self.bus.send(event);
    }

    pub async fn register_protocol(&self, protocol: Protocol) {
        let mut registered = self.registered.lock().await;
        if !registered.contains(&protocol) {
            log::info!("router: {protocol:?} registered");
            registered.push(protocol);
        }
    }

    pub async fn registered_protocols(&self) -> Vec<Protocol> {
        self.registered.lock().await.clone()
    }

    pub async fn set_gps(&self, lat: f64, lon: f64) {
        *self.gps_cache.lock().await = Some((lat, lon));
    }

    pub async fn gps(&self) -> Option<(f64, f64)> {
        *self.gps_cache.lock().await
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry a fallible async operation: an initial attempt plus three retries,
/// waiting 0.5s/1s/2s between each (spec.md §4.6).
pub async fn retry<F, Fut, T, E>(mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_err = None;
    for backoff in RETRY_BACKOFF {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                log::warn!("operation failed, retrying in {backoff:?}: {e}");
                last_err = Some(e);
                tokio::time::sleep(*backoff).await;
            }
        }
    }
    op().await.map_err(|e| last_err.take().unwrap_or(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageType, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample() -> MeshMessage {
        MeshMessage {
            msg_id: None,
            src: "DL4GLE-10".into(),
            dst: "*".into(),
            msg: "hi".into(),
            msg_type: MessageType::Msg,
            timestamp: 1,
            rssi: None,
            snr: None,
            src_type: TransportKind::Udp,
            raw: vec![],
            echo_id: None,
            acked: None,
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let router = Router::new();
        let mut a = router.subscribe();
        let mut b = router.subscribe();
        router.publish(RouterEvent::Inbound(sample()));
        assert!(matches!(a.recv().await.unwrap(), RouterEvent::Inbound(_)));
        assert!(matches!(b.recv().await.unwrap(), RouterEvent::Inbound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_three_attempts() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), &str> = retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("still failing") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn gps_cache_round_trips() {
        let router = Router::new();
        assert_eq!(router.gps().await, None);
        router.set_gps(48.1, 11.5).await;
        assert_eq!(router.gps().await, Some((48.1, 11.5)));
    }
}
