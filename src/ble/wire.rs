//! BLE GATT wire framing, spec.md §4.4.
//!
//! MeshCom's BLE characteristic carries several unrelated frame shapes over
//! the same pipe: JSON device notifications (`D{...}`), binary mesh payloads
//! (`@:`/`@!`), binary acks (`@A`), and a family of length-prefixed control
//! commands the client writes to the device (hello, settime, set-callsign,
//! ...). [`ControlCommand`] builds the client->device writes; [`decode_notification`]
//! parses device->client notifications. Grounded on the mbuscrate wM-Bus
//! packet module's byte-framing style (length-prefixed, explicit checksum
//! validation on decode), adapted to MeshCom's specific frame table.

use crate::errors::BleError;

/// Negotiated GATT MTU ceiling for MeshCom BLE devices; no write may exceed
/// this (spec.md §8 "MTU law").
pub const MAX_FRAME_LEN: usize = 247;

/// CRC16-CCITT (poly 0x1021, init 0xFFFF, unreflected), the FCS carried by
/// binary mesh/ack frames.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Persist-or-volatile flag for lat/lon/altitude writes, spec.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFlag {
    Persist,
    Volatile,
}

impl SaveFlag {
    fn byte(self) -> u8 {
        match self {
            SaveFlag::Persist => 0x0A,
            SaveFlag::Volatile => 0x0B,
        }
    }
}

/// Build a length-prefixed control frame: `[len][id][payload]`, where `len`
/// includes itself and the id byte (`len = payload.len() + 2`), per spec.md
/// §4.4. Rejects anything that would not fit the BLE MTU before writing.
fn build_command(id: u8, payload: &[u8]) -> Result<Vec<u8>, BleError> {
    let len = payload.len() + 2;
    if len > u8::MAX as usize {
        return Err(BleError::Oversize { len, max: u8::MAX as usize });
    }
    let mut buf = Vec::with_capacity(len);
    buf.push(len as u8);
    buf.push(id);
    buf.extend_from_slice(payload);
    if buf.len() > MAX_FRAME_LEN {
        return Err(BleError::Oversize { len: buf.len(), max: MAX_FRAME_LEN });
    }
    Ok(buf)
}

/// The client->device control commands of spec.md §4.4's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `[0x04][0x10][0x20][0x30]`, wakes the device; must precede any other
    /// write on a fresh connection (spec.md §4.4 "Hello contract").
    Hello,
    /// `[len][0x20][uint32_le unix_seconds]`.
    SetTime(u32),
    /// `[len][0x50][utf8 bytes]`.
    SetCallsign(String),
    /// `[len][0x55][ssid_len][ssid][pwd_len][pwd]`.
    SetWifi { ssid: String, password: String },
    /// `[len][0x70][float32_le][save_flag]`.
    SetLat(f32, SaveFlag),
    /// `[len][0x80][float32_le][save_flag]`.
    SetLon(f32, SaveFlag),
    /// `[len][0x90][int32_le meters][save_flag]`.
    SetAltitude(i32, SaveFlag),
    /// `[len][0x95][primary_byte][secondary_byte]`.
    SetAprsSymbol(u8, u8),
    /// `[len][0xA0][utf8 ascii command bytes]`.
    TextCommand(String),
    /// `[0x02][0xF0]`.
    SaveAndReboot,
}

impl ControlCommand {
    pub fn encode(&self) -> Result<Vec<u8>, BleError> {
        match self {
            ControlCommand::Hello => build_command(0x10, &[0x20, 0x30]),
            ControlCommand::SetTime(secs) => build_command(0x20, &secs.to_le_bytes()),
            ControlCommand::SetCallsign(cs) => build_command(0x50, cs.as_bytes()),
            ControlCommand::SetWifi { ssid, password } => {
                if ssid.len() > u8::MAX as usize || password.len() > u8::MAX as usize {
                    return Err(BleError::Oversize { len: ssid.len() + password.len(), max: u8::MAX as usize });
                }
                let mut payload = Vec::with_capacity(2 + ssid.len() + password.len());
                payload.push(ssid.len() as u8);
                payload.extend_from_slice(ssid.as_bytes());
                payload.push(password.len() as u8);
                payload.extend_from_slice(password.as_bytes());
                build_command(0x55, &payload)
            }
            ControlCommand::SetLat(lat, save) => {
                let mut payload = lat.to_le_bytes().to_vec();
                payload.push(save.byte());
                build_command(0x70, &payload)
            }
            ControlCommand::SetLon(lon, save) => {
                let mut payload = lon.to_le_bytes().to_vec();
                payload.push(save.byte());
                build_command(0x80, &payload)
            }
            ControlCommand::SetAltitude(meters, save) => {
                let mut payload = meters.to_le_bytes().to_vec();
                payload.push(save.byte());
                build_command(0x90, &payload)
            }
            ControlCommand::SetAprsSymbol(primary, secondary) => build_command(0x95, &[*primary, *secondary]),
            ControlCommand::TextCommand(cmd) => build_command(0xA0, cmd.as_bytes()),
            ControlCommand::SaveAndReboot => build_command(0xF0, &[]),
        }
    }
}

/// Literal keepalive text command MeshCom firmware expects to inhibit sleep,
/// spec.md §4.4 "Keepalive". The firmware only recognizes the bare `--pos`;
/// `--pos info` (a plausible typo carried over from the extended-register
/// commands) is silently ignored and the device eventually drops the
/// connection as idle. Reimplementations must not reintroduce it (spec.md §9
/// Open Questions).
pub const KEEPALIVE_COMMAND: &str = "--pos";

/// The fixed list of extended register queries issued after hello settles,
/// spec.md §4.4 "Extended register queries". `--seset`, `--wifiset`,
/// `--weather`, `--analogset` are historical/optional; `--io` and `--tel`
/// are the baseline set every connection issues.
pub const BASELINE_REGISTER_QUERIES: &[&str] = &["--io", "--tel"];
pub const EXTENDED_REGISTER_QUERIES: &[&str] = &["--seset", "--wifiset", "--weather", "--analogset"];

/// A decoded device->client notification, spec.md §4.4 and Design Notes §9.
/// Modeled as a sum type at the boundary rather than a free-form byte bag.
#[derive(Debug, Clone, PartialEq)]
pub enum BleNotification {
    /// `D{...}`: config/status/MHeard JSON payload.
    JsonCfg(serde_json::Value),
    /// `@:`/`@!`: binary mesh payload. `fcs_ok` is permissive — a mismatch is
    /// logged and still delivered (spec.md §8 "FCS law").
    BinaryMesh { subtype: u8, payload_type: u8, msg_id: u8, hop_count: u8, payload: Vec<u8>, fcs_ok: bool },
    /// `@A`: ack frame.
    Ack { msg_id: u8, fcs_ok: bool },
    /// Anything that didn't parse as one of the above; counted, not dropped.
    Unknown(Vec<u8>),
}

/// Parse one GATT notification into a typed variant. Never returns an error:
/// undecodable bytes become `Unknown` so a single malformed notification
/// can't take down the notification pump (spec.md §7 ProtocolViolation
/// policy: discard/log, don't crash).
pub fn decode_notification(bytes: &[u8]) -> BleNotification {
    if bytes.is_empty() {
        return BleNotification::Unknown(bytes.to_vec());
    }
    match bytes[0] {
        b'D' => match serde_json::from_slice(&bytes[1..]) {
            Ok(value) => BleNotification::JsonCfg(value),
            Err(_) => BleNotification::Unknown(bytes.to_vec()),
        },
        b'@' if bytes.len() >= 2 => match bytes[1] {
            b':' | b'!' => decode_binary_mesh(bytes[1], &bytes[2..], bytes),
            b'A' => decode_ack(&bytes[2..], bytes),
            _ => BleNotification::Unknown(bytes.to_vec()),
        },
        _ => BleNotification::Unknown(bytes.to_vec()),
    }
}

/// Header is payload_type/msg_id/hop_count (one byte each) followed by the
/// mesh payload and a trailing 2-byte little-endian FCS.
fn decode_binary_mesh(subtype: u8, body: &[u8], whole: &[u8]) -> BleNotification {
    const HEADER_LEN: usize = 3;
    const FCS_LEN: usize = 2;
    if body.len() < HEADER_LEN + FCS_LEN {
        return BleNotification::Unknown(whole.to_vec());
    }
    let (header, rest) = body.split_at(HEADER_LEN);
    let (payload, fcs_bytes) = rest.split_at(rest.len() - FCS_LEN);
    let expected = crc16_ccitt(&whole[..whole.len() - FCS_LEN]);
    let actual = u16::from_le_bytes([fcs_bytes[0], fcs_bytes[1]]);
    if expected != actual {
        log::warn!("BLE binary mesh frame FCS mismatch (subtype {subtype:#04x}): permissive, delivering anyway");
    }
    BleNotification::BinaryMesh {
        subtype,
        payload_type: header[0],
        msg_id: header[1],
        hop_count: header[2],
        payload: payload.to_vec(),
        fcs_ok: expected == actual,
    }
}

fn decode_ack(body: &[u8], whole: &[u8]) -> BleNotification {
    const FCS_LEN: usize = 2;
    if body.len() < 1 + FCS_LEN {
        return BleNotification::Unknown(whole.to_vec());
    }
    let msg_id = body[0];
    let fcs_bytes = &body[body.len() - FCS_LEN..];
    let expected = crc16_ccitt(&whole[..whole.len() - FCS_LEN]);
    let actual = u16::from_le_bytes([fcs_bytes[0], fcs_bytes[1]]);
    if expected != actual {
        log::warn!("BLE ack frame FCS mismatch: permissive, delivering anyway");
    }
    BleNotification::Ack { msg_id, fcs_ok: expected == actual }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_frame_matches_fixed_bytes() {
        assert_eq!(ControlCommand::Hello.encode().unwrap(), vec![0x04, 0x10, 0x20, 0x30]);
    }

    #[test]
    fn save_and_reboot_matches_fixed_bytes() {
        assert_eq!(ControlCommand::SaveAndReboot.encode().unwrap(), vec![0x02, 0xF0]);
    }

    #[test]
    fn settime_len_byte_includes_itself_and_id() {
        let frame = ControlCommand::SetTime(1_700_000_000).encode().unwrap();
        assert_eq!(frame[0], 6); // 1 (len) + 1 (id) + 4 (payload) = 6, and len == total bytes
        assert_eq!(frame.len(), 6);
        assert_eq!(frame[1], 0x20);
        assert_eq!(u32::from_le_bytes(frame[2..6].try_into().unwrap()), 1_700_000_000);
    }

    #[test]
    fn oversize_text_command_is_rejected_before_write() {
        let huge = "x".repeat(300);
        assert!(matches!(ControlCommand::TextCommand(huge).encode(), Err(BleError::Oversize { .. })));
    }

    #[test]
    fn set_wifi_encodes_ssid_and_password_lengths() {
        let frame = ControlCommand::SetWifi { ssid: "mesh".into(), password: "hunter2".into() }.encode().unwrap();
        assert_eq!(frame[2], 4); // ssid_len
        assert_eq!(&frame[3..7], b"mesh");
        assert_eq!(frame[7], 7); // pwd_len
        assert_eq!(&frame[8..15], b"hunter2");
    }

    #[test]
    fn keepalive_command_is_bare_pos_flag() {
        assert_eq!(KEEPALIVE_COMMAND, "--pos");
    }

    #[test]
    fn json_notification_decodes_the_d_prefix() {
        let mut bytes = vec![b'D'];
        bytes.extend_from_slice(br#"{"battery":87}"#);
        match decode_notification(&bytes) {
            BleNotification::JsonCfg(v) => assert_eq!(v["battery"], 87),
            other => panic!("expected JsonCfg, got {other:?}"),
        }
    }

    #[test]
    fn binary_mesh_notification_round_trips_with_valid_fcs() {
        let mut frame = vec![b'@', b':', 0x01, 0x42, 0x03];
        frame.extend_from_slice(b"hello");
        let fcs = crc16_ccitt(&frame);
        frame.extend_from_slice(&fcs.to_le_bytes());
        match decode_notification(&frame) {
            BleNotification::BinaryMesh { subtype, payload_type, msg_id, hop_count, payload, fcs_ok } => {
                assert_eq!(subtype, b':');
                assert_eq!(payload_type, 0x01);
                assert_eq!(msg_id, 0x42);
                assert_eq!(hop_count, 0x03);
                assert_eq!(payload, b"hello");
                assert!(fcs_ok);
            }
            other => panic!("expected BinaryMesh, got {other:?}"),
        }
    }

    #[test]
    fn binary_mesh_notification_with_bad_fcs_is_still_delivered() {
        let mut frame = vec![b'@', b'!', 0x01, 0x01, 0x00];
        frame.extend_from_slice(b"x");
        frame.extend_from_slice(&0u16.to_le_bytes()); // deliberately wrong FCS
        match decode_notification(&frame) {
            BleNotification::BinaryMesh { fcs_ok, .. } => assert!(!fcs_ok),
            other => panic!("expected BinaryMesh, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_bytes_become_unknown_not_an_error() {
        assert!(matches!(decode_notification(&[0xFF, 0x01]), BleNotification::Unknown(_)));
    }
}
