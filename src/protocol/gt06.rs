//! GT06 / Concox binary protocol.
//!
//! Frame: `0x78 0x78` (1-byte length) or `0x79 0x79` (2-byte length),
//! protocol number, content, 2-byte serial, 2-byte CRC-ITU, `0x0D 0x0A`.
//! The CRC covers length through serial and is verified on every inbound
//! frame; a mismatch rejects the frame and the decoder resyncs on the next
//! start marker. Every server reply is framed and checksummed the same way.

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tracing::warn;

use super::crc::crc_itu;
use super::{Decoded, EncodedCommand, Frame, SessionContext};
use crate::domain::{Command, NormalizedPosition};

const MSG_LOGIN: u8 = 0x01;
const MSG_POSITION: u8 = 0x12;
const MSG_HEARTBEAT: u8 = 0x13;
const MSG_COMMAND_RESPONSE: u8 = 0x15;
const MSG_POSITION_ALARM: u8 = 0x16;
const MSG_POSITION_GPS: u8 = 0x1A;
const MSG_COMMAND: u8 = 0x80;

pub fn decode(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    if buf.len() < 2 {
        return Decoded::need_more();
    }

    // Resync: drop noise ahead of the next start marker.
    if buf[0..2] != [0x78, 0x78] && buf[0..2] != [0x79, 0x79] {
        let skip = buf
            .windows(2)
            .position(|w| w == [0x78, 0x78] || w == [0x79, 0x79])
            .unwrap_or(buf.len());
        return Decoded::skip(skip.max(1));
    }

    let extended = buf[0] == 0x79;
    let header = if extended { 4 } else { 3 };
    if buf.len() < header {
        return Decoded::need_more();
    }
    let content_len = if extended {
        u16::from_be_bytes([buf[2], buf[3]]) as usize
    } else {
        buf[2] as usize
    };
    let total_len = content_len + header + 2;
    if content_len < 5 || total_len > super::MAX_BUFFER {
        return Decoded::error(2, "gt06: implausible frame length");
    }
    if buf.len() < total_len {
        return Decoded::need_more();
    }

    let frame = &buf[..total_len];
    let crc_field = u16::from_be_bytes([frame[total_len - 4], frame[total_len - 3]]);
    if crc_itu(&frame[2..total_len - 4]) != crc_field {
        warn!("gt06: crc mismatch, rejecting frame");
        return Decoded::error(total_len, "gt06: crc mismatch");
    }

    let serial = u16::from_be_bytes([frame[total_len - 6], frame[total_len - 5]]);
    ctx.serial = serial;

    let proto = frame[header];
    let content = &frame[header + 1..total_len - 6];

    match proto {
        MSG_LOGIN => decode_login(content, total_len, ctx),
        MSG_HEARTBEAT => Decoded {
            frames: vec![Frame::Heartbeat],
            consumed: total_len,
            response: Some(frame_reply(MSG_HEARTBEAT, serial)),
        },
        MSG_POSITION | MSG_POSITION_ALARM | MSG_POSITION_GPS => {
            match decode_position(content, ctx.imei.as_deref()) {
                Some(position) => Decoded {
                    frames: vec![Frame::Position(position)],
                    consumed: total_len,
                    response: None,
                },
                None => Decoded::skip(total_len),
            }
        }
        MSG_COMMAND_RESPONSE => Decoded {
            frames: decode_command_response(content),
            consumed: total_len,
            response: None,
        },
        other => {
            warn!(proto = format!("0x{other:02X}"), "gt06: unhandled message type");
            Decoded::skip(total_len)
        }
    }
}

fn decode_login(content: &[u8], consumed: usize, ctx: &mut SessionContext) -> Decoded {
    if content.len() < 8 {
        return Decoded::error(consumed, "gt06: short login frame");
    }
    let imei = bcd_imei(&content[..8]);
    ctx.imei = Some(imei.clone());
    Decoded { frames: vec![Frame::Login { imei }], consumed, response: None }
}

/// Terminal id is BCD: two decimal digits per byte, left-padded with zero.
fn bcd_imei(bytes: &[u8]) -> String {
    let digits: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    digits.trim_start_matches('0').to_string()
}

/// Position content: date (6), satellite byte, course/status (2),
/// latitude (4, x1/1800000), longitude (4), speed (1), status (1).
fn decode_position(content: &[u8], imei: Option<&str>) -> Option<NormalizedPosition> {
    let imei = imei?;
    if content.len() < 19 {
        return None;
    }
    let device_time = bcd_datetime(&content[..6])?;
    let satellites = (content[6] >> 4) & 0x0F;
    let course_status = u16::from_be_bytes([content[7], content[8]]);
    let course = course_status & 0x03FF;
    let lat = u32::from_be_bytes(content[9..13].try_into().ok()?) as f64 / 1_800_000.0;
    let lon = u32::from_be_bytes(content[13..17].try_into().ok()?) as f64 / 1_800_000.0;
    let speed = content[17];
    let status = content[18];

    let mut position = NormalizedPosition::new(imei, device_time, lat, lon);
    position.speed = Some(speed as f64);
    position.course = Some(course as f64);
    position.satellites = Some(satellites as i32);
    position.ignition = Some(status & 0x02 != 0);
    position.sensors.insert("status_raw".into(), serde_json::json!(status));
    position.sensors.insert("gps_tracking".into(), serde_json::json!(status & 0x10 != 0));
    position.sensors.insert("charging".into(), serde_json::json!(status & 0x04 != 0));
    Some(position)
}

fn bcd_datetime(raw: &[u8]) -> Option<OffsetDateTime> {
    let month = Month::try_from(raw[1]).ok()?;
    let date = Date::from_calendar_date(2000 + raw[0] as i32, month, raw[2]).ok()?;
    let time = Time::from_hms(raw[3], raw[4], raw[5]).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

/// 0x15: terminal response to a 0x80 command; the echoed 4-byte server
/// flag is our correlation key.
fn decode_command_response(content: &[u8]) -> Vec<Frame> {
    if content.len() < 5 {
        return Vec::new();
    }
    let flag = u32::from_be_bytes(content[1..5].try_into().unwrap_or_default());
    let response = String::from_utf8_lossy(&content[5..]).trim().to_string();
    vec![Frame::CommandAck {
        command_key: Some(format!("{flag:08X}")),
        success: true,
        response,
    }]
}

/// Server frame with protocol number and echoed serial, CRC included.
fn frame_reply(proto: u8, serial: u16) -> Vec<u8> {
    let mut body = vec![0x05, proto];
    body.extend_from_slice(&serial.to_be_bytes());
    let crc = crc_itu(&body);
    let mut out = vec![0x78, 0x78];
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&[0x0D, 0x0A]);
    out
}

pub fn login_ack(serial: u16) -> Vec<u8> {
    frame_reply(MSG_LOGIN, serial)
}

/// 0x80 online command: length, 4-byte server flag (the command id, echoed
/// back in the 0x15 response), ASCII content.
pub fn encode_command(command: &Command) -> Option<EncodedCommand> {
    let text = match command.command_type.as_str() {
        "custom" => command.payload.trim().to_string(),
        "reset" => "RESET#".to_string(),
        "status" => "STATUS#".to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }

    let flag = command.id as u32;
    let mut content = Vec::with_capacity(text.len() + 5);
    content.push((4 + text.len()) as u8);
    content.extend_from_slice(&flag.to_be_bytes());
    content.extend_from_slice(text.as_bytes());

    let mut body = vec![(1 + content.len() + 4) as u8, MSG_COMMAND];
    body.extend_from_slice(&content);
    body.extend_from_slice(&(command.id as u16).to_be_bytes()); // serial
    let crc = crc_itu(&body);

    let mut out = vec![0x78, 0x78];
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&[0x0D, 0x0A]);
    Some(EncodedCommand { bytes: out, key: Some(format!("{flag:08X}")) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len()).step_by(2).map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap()).collect()
    }

    const LOGIN: &str = "78780d010867440069999999000183cf0d0a";
    const HEARTBEAT: &str = "78780a1340040400010002070b0d0a";
    const POSITION: &str = "7878181218030f081e00c9145a026b3f3d0c3d4cf23c120003df330d0a";

    #[test]
    fn login_frame_decodes_bcd_imei() {
        let mut ctx = SessionContext::default();
        let buf = hex(LOGIN);
        let out = decode(&buf, &mut ctx);
        assert_eq!(out.consumed, buf.len());
        assert!(matches!(&out.frames[0], Frame::Login { imei } if imei == "867440069999999"));
        assert_eq!(ctx.serial, 1);
        assert_eq!(login_ack(ctx.serial), hex("787805010001d9dc0d0a"));
    }

    #[test]
    fn heartbeat_is_acked_with_echoed_serial() {
        let mut ctx = SessionContext::default();
        let out = decode(&hex(HEARTBEAT), &mut ctx);
        assert!(matches!(out.frames[0], Frame::Heartbeat));
        assert_eq!(out.response, Some(hex("787805130002db6a0d0a")));
    }

    #[test]
    fn position_frame_decodes() {
        let mut ctx =
            SessionContext { imei: Some("867440069999999".into()), ..Default::default() };
        let buf = hex(POSITION);
        let out = decode(&buf, &mut ctx);
        assert_eq!(out.consumed, buf.len());
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert!((pos.latitude - 22.546096).abs() < 1e-5);
        assert!((pos.longitude - 114.079992).abs() < 1e-5);
        assert_eq!(pos.speed, Some(60.0));
        assert_eq!(pos.course, Some(90.0));
        assert_eq!(pos.satellites, Some(12));
        assert_eq!(pos.ignition, Some(true));
        assert_eq!(pos.device_time.unix_timestamp(), 1_710_491_400);
    }

    #[test]
    fn any_single_bit_corruption_rejects_the_frame() {
        let good = hex(POSITION);
        let mut ctx =
            SessionContext { imei: Some("867440069999999".into()), ..Default::default() };
        // Flip one bit in every CRC-covered byte (length..serial).
        for i in 2..good.len() - 4 {
            let mut corrupt = good.clone();
            corrupt[i] ^= 0x01;
            let out = decode(&corrupt, &mut ctx);
            assert!(
                out.frames.iter().all(|f| matches!(f, Frame::Error { .. })),
                "corruption at byte {i} was accepted"
            );
        }
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut ctx = SessionContext::default();
        let buf = hex(LOGIN);
        let out = decode(&buf[..6], &mut ctx);
        assert_eq!(out.consumed, 0);
        assert!(out.frames.is_empty());
    }

    #[test]
    fn garbage_resyncs_to_start_marker() {
        let mut ctx = SessionContext::default();
        let mut buf = vec![0x00, 0xFF, 0x13];
        buf.extend_from_slice(&hex(LOGIN));
        let out = decode(&buf, &mut ctx);
        assert_eq!(out.consumed, 3);
        assert!(out.frames.is_empty());
    }

    #[test]
    fn command_roundtrip_carries_the_key() {
        let command = Command {
            id: 7,
            device_id: 1,
            command_type: "custom".into(),
            payload: "RESET#".into(),
            status: crate::domain::CommandStatus::Pending,
            retries_remaining: 0,
            command_key: None,
            created_at: time::OffsetDateTime::UNIX_EPOCH,
            sent_at: None,
            acked_at: None,
            response: None,
        };
        let encoded = encode_command(&command).unwrap();
        assert_eq!(encoded.key.as_deref(), Some("00000007"));
        // The device echoes the server flag in its 0x15 response.
        let mut body = vec![0x0C, MSG_COMMAND_RESPONSE, 0x04];
        body.extend_from_slice(&7u32.to_be_bytes());
        body.extend_from_slice(b"OK");
        body.extend_from_slice(&1u16.to_be_bytes());
        let crc = crc_itu(&body);
        let mut frame = vec![0x78, 0x78];
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&[0x0D, 0x0A]);

        let mut ctx = SessionContext::default();
        let out = decode(&frame, &mut ctx);
        let Frame::CommandAck { command_key, response, .. } = &out.frames[0] else {
            panic!("expected command ack")
        };
        assert_eq!(command_key.as_deref(), Some("00000007"));
        assert_eq!(response, "OK");
    }
}
