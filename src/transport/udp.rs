//! UDP transport, spec.md §4.3.
//!
//! MeshCom's UDP bridge wraps each frame in a JSON string that is itself
//! JSON-encoded (the payload on the wire is a JSON string literal whose
//! content is another JSON document) — "double-stringified JSON". Grounded on
//! the teacher's `control::client` for the request/typed-error idiom, adapted
//! here from HTTP request/response to datagram send/recv.

use crate::errors::TransportError;
use crate::model::MeshMessage;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// UDP frames observed in the wild stay well under 1500 bytes; anything
/// bigger is not a MeshCom frame.
const MAX_DATAGRAM: usize = 4096;

pub struct UdpTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTransport {
    /// Bind the listening socket on `listen_port` and remember `target` as
    /// the address outbound frames are sent to (`UDP_TARGET:UDP_PORT_send`).
    pub async fn bind(listen_port: u16, target: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(("0.0.0.0", listen_port)).await?;
        Ok(Self { socket, target })
    }

    pub async fn send(&self, msg: &MeshMessage) -> Result<(), TransportError> {
        let frame = encode_frame(msg)?;
        if frame.len() > MAX_DATAGRAM {
            return Err(TransportError::Oversize { len: frame.len(), max: MAX_DATAGRAM });
        }
        self.socket.send_to(&frame, self.target).await?;
        Ok(())
    }

    pub async fn recv(&self) -> Result<MeshMessage, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, _from) = self.socket.recv_from(&mut buf).await?;
        decode_frame(&buf[..len])
    }
}

/// Encode a message the way MeshCom's UDP bridge expects: JSON-serialize the
/// message, then JSON-serialize that string again.
pub fn encode_frame(msg: &MeshMessage) -> Result<Vec<u8>, TransportError> {
    let inner = serde_json::to_string(msg).map_err(|e| TransportError::Protocol(e.to_string()))?;
    let outer = serde_json::to_string(&inner).map_err(|e| TransportError::Protocol(e.to_string()))?;
    Ok(outer.into_bytes())
}

/// Reverse of [`encode_frame`]: unwrap the outer JSON string, then parse the
/// inner JSON document it contains.
pub fn decode_frame(bytes: &[u8]) -> Result<MeshMessage, TransportError> {
    let outer: String = serde_json::from_slice(bytes).map_err(|e| TransportError::Protocol(format!("not a JSON string: {e}")))?;
    let msg: MeshMessage = serde_json::from_str(&outer).map_err(|e| TransportError::Protocol(format!("inner frame invalid: {e}")))?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageType, TransportKind};

    fn sample() -> MeshMessage {
        MeshMessage {
            msg_id: Some("deadbeef".into()),
            src: "DL4GLE-10".into(),
            dst: "*".into(),
            msg: "hello mesh".into(),
            msg_type: MessageType::Msg,
            timestamp: 1_700_000_000_000,
            rssi: Some(-91.0),
            snr: Some(6.2),
            src_type: TransportKind::Udp,
            raw: vec![],
            echo_id: None,
            acked: None,
        }
    }

    #[test]
    fn round_trips_through_double_stringified_json() {
        let msg = sample();
        let frame = encode_frame(&msg).unwrap();
        // The wire bytes must themselves parse as a JSON string value.
        let as_string: String = serde_json::from_slice(&frame).unwrap();
        assert!(as_string.starts_with('{'));
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.src, msg.src);
        assert_eq!(decoded.msg, msg.msg);
    }

    #[test]
    fn rejects_single_stringified_payload() {
        let msg = sample();
        let single = serde_json::to_vec(&msg).unwrap();
        assert!(decode_frame(&single).is_err());
    }
}
