//! HTTP/SSE Gateway, spec.md §4.8. The only surface web clients see: everyone
//! else in the process talks typed Rust, this module is where it degrades to
//! JSON. Event tagging follows the `#[serde(tag = "...", content = "...")]`
//! pattern seen in the ground-station backend's websocket handler, adapted
//! from a websocket push to an axum SSE stream.

use crate::model::{MeshMessage, MessageFilter, MessageType, StoredMessage};
use crate::router::{Router, RouterEvent};
use crate::storage::StorageHandle;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt as _;

#[derive(Clone)]
pub struct GatewayState {
    pub router: Arc<Router>,
    pub storage: StorageHandle,
    pub outbound_tx: mpsc::Sender<MeshMessage>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "ty", content = "data")]
enum SseEvent {
    #[serde(rename = "message")]
    Message(StoredMessageView),
    #[serde(rename = "station")]
    Station(crate::model::StationPosition),
}

#[derive(Debug, Serialize)]
struct StoredMessageView {
    src: String,
    dst: String,
    msg: String,
    #[serde(rename = "type")]
    msg_type: MessageType,
    timestamp: i64,
    rssi: Option<f32>,
    snr: Option<f32>,
}

impl From<&MeshMessage> for StoredMessageView {
    fn from(m: &MeshMessage) -> Self {
        Self {
            src: m.src.clone(),
            dst: m.dst.clone(),
            msg: m.msg.clone(),
            msg_type: m.msg_type,
            timestamp: m.timestamp,
            rssi: m.rssi,
            snr: m.snr,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub dst: String,
    pub msg: String,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(rename = "type")]
    pub msg_type: Option<String>,
    pub dst: Option<String>,
    pub src: Option<String>,
    pub cursor: Option<i64>,
    pub limit: Option<usize>,
}

async fn get_events(State(state): State<GatewayState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.router.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|item| {
        let event = match item {
            Ok(RouterEvent::Inbound(m)) | Ok(RouterEvent::Outbound(m)) => SseEvent::Message(StoredMessageView::from(&m)),
            Ok(RouterEvent::StationUpdate(s)) => SseEvent::Station(s),
            Err(_lagged) => return None,
        };
        serde_json::to_string(&event).ok().map(|json| Ok(Event::default().data(json)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn post_send(State(state): State<GatewayState>, Json(req): Json<SendRequest>) -> impl IntoResponse {
    if req.msg.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    let msg = MeshMessage {
        msg_id: None,
        src: String::new(), // filled in by the sender task from the configured CALL_SIGN
        dst: req.dst,
        msg: req.msg,
        msg_type: MessageType::Msg,
        timestamp: 0,
        rssi: None,
        snr: None,
        src_type: crate::model::TransportKind::Udp,
        raw: Vec::new(),
        echo_id: None,
        acked: None,
    }
    .with_default_timestamp();

    match state.outbound_tx.send(msg).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn get_messages(State(state): State<GatewayState>, Query(q): Query<MessagesQuery>) -> impl IntoResponse {
    let msg_type = q.msg_type.as_deref().and_then(|s| match s {
        "msg" => Some(MessageType::Msg),
        "pos" => Some(MessageType::Pos),
        "ack" => Some(MessageType::Ack),
        _ => None,
    });
    let filter = MessageFilter { msg_type, dst: q.dst, src: q.src };
    let limit = q.limit.unwrap_or(100).min(1000);
    match state.storage.query(filter, q.cursor, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            log::error!("storage query failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn get_health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

pub fn router(state: GatewayState) -> AxumRouter {
    AxumRouter::new()
        .route("/health", get(get_health))
        .route("/events", get(get_events))
        .route("/api/send", post(post_send))
        .route("/api/messages", get(get_messages))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_event_serializes_with_tag_and_content() {
        let event = SseEvent::Message(StoredMessageView {
            src: "DL4GLE-10".into(),
            dst: "*".into(),
            msg: "hi".into(),
            msg_type: MessageType::Msg,
            timestamp: 1,
            rssi: None,
            snr: None,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"ty\":\"message\""));
        assert!(json.contains("\"data\":"));
    }
}
