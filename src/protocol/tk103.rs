//! TK103 / Coban ASCII protocol: parenthesised messages
//! `(<id 12-15 digits><cmd 2><payload>)`. Login (BR) and heartbeat (BP)
//! both expect an ASCII ack; position reports are BO/BV/BZ/BX/BN.

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tracing::{debug, warn};

use super::{Decoded, EncodedCommand, Frame, SessionContext};
use crate::domain::{Command, NormalizedPosition};

pub fn decode(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    let Some(start) = buf.iter().position(|&b| b == b'(') else {
        return Decoded::skip(buf.len().max(1));
    };
    let Some(end) = buf[start..].iter().position(|&b| b == b')') else {
        if buf.len() > 1024 {
            return Decoded::error(buf.len(), "tk103: oversized message without terminator");
        }
        return Decoded::need_more();
    };
    let consumed = start + end + 1;
    let Ok(message) = std::str::from_utf8(&buf[start + 1..start + end]) else {
        return Decoded::error(consumed, "tk103: non-ascii message");
    };

    let id_len = message.bytes().take_while(u8::is_ascii_digit).count();
    if !(12..=15).contains(&id_len) || message.len() < id_len + 4 {
        return Decoded::error(consumed, "tk103: malformed header");
    }
    let imei = &message[..id_len];
    let command = &message[id_len..id_len + 2];
    let payload = &message[id_len + 4..]; // two length digits skipped

    match command {
        "BR" => {
            ctx.imei = Some(imei.to_string());
            Decoded {
                frames: vec![Frame::Login { imei: imei.to_string() }],
                consumed,
                response: None,
            }
        }
        "BP" => Decoded {
            frames: vec![Frame::Heartbeat],
            consumed,
            response: Some(format!("({imei}AP05)").into_bytes()),
        },
        "BO" | "BV" | "BZ" | "BX" | "BN" => match parse_position(imei, payload, command) {
            Some(position) => {
                Decoded { frames: vec![Frame::Position(position)], consumed, response: None }
            }
            None => Decoded::error(consumed, "tk103: unparseable position"),
        },
        other => {
            debug!(command = other, "tk103: unhandled message type");
            Decoded::skip(consumed)
        }
    }
}

pub fn login_ack(imei: &str) -> Vec<u8> {
    format!("({imei}AP01HSO)").into_bytes()
}

/// Payload: DDMMYY | A/V | DDMM.MMMM N/S | DDDMM.MMMM E/W |
/// speed knots 000.0 | HHMMSS | A/V | course 4 digits | status.
fn parse_position(imei: &str, payload: &str, command: &str) -> Option<NormalizedPosition> {
    if payload.len() < 40 || !payload.is_ascii() {
        warn!(imei, len = payload.len(), "tk103: malformed payload");
        return None;
    }
    let date_str = &payload[0..6];
    let valid = &payload[6..7] == "A";

    let lat = parse_coordinate(&payload[7..16], &payload[16..17])?;
    let lon = parse_coordinate(&payload[17..27], &payload[27..28])?;

    let speed_knots: f64 = payload[28..33].parse().ok()?;
    let time_str = &payload[33..39];
    let course: f64 = payload.get(40..44).and_then(|s| s.parse().ok()).unwrap_or(0.0);

    let device_time =
        parse_datetime(date_str, time_str).unwrap_or_else(OffsetDateTime::now_utc);

    let mut position = NormalizedPosition::new(imei, device_time, lat, lon);
    position.speed = Some(speed_knots * 1.852);
    position.course = Some(course);
    position.valid = valid;
    let event = match command {
        "BV" => Some("speed_alert"),
        "BZ" => Some("low_battery"),
        "BX" => Some("vibration"),
        "BN" => Some("sos"),
        _ => None,
    };
    if let Some(event) = event {
        position.sensors.insert("alert_type".into(), serde_json::json!(event));
    }
    Some(position)
}

fn parse_coordinate(value: &str, hemisphere: &str) -> Option<f64> {
    let dot = value.find('.')?;
    if dot < 2 {
        return None;
    }
    let degrees: f64 = value[..dot - 2].parse().ok()?;
    let minutes: f64 = value[dot - 2..].parse().ok()?;
    let mut result = degrees + minutes / 60.0;
    if matches!(hemisphere, "S" | "W" | "s" | "w") {
        result = -result;
    }
    Some(result)
}

fn parse_datetime(date_str: &str, time_str: &str) -> Option<OffsetDateTime> {
    let dd: u8 = date_str[0..2].parse().ok()?;
    let mo: u8 = date_str[2..4].parse().ok()?;
    let yy: i32 = date_str[4..6].parse().ok()?;
    let hh: u8 = time_str[0..2].parse().ok()?;
    let mi: u8 = time_str[2..4].parse().ok()?;
    let ss: u8 = time_str[4..6].parse().ok()?;
    let date = Date::from_calendar_date(2000 + yy, Month::try_from(mo).ok()?, dd).ok()?;
    let time = Time::from_hms(hh, mi, ss).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

pub fn encode_command(command: &Command, imei: &str) -> Option<EncodedCommand> {
    let text = match command.command_type.as_str() {
        "request_position" => format!("({imei}AP00)"),
        "custom" => command.payload.trim().to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }
    Some(EncodedCommand::plain(text.into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITION: &[u8] =
        b"(013632651491BO01150324A2232.7658N11404.7995E015.0083000A0090000000L00000000)";

    #[test]
    fn login_produces_frame_and_ack() {
        let mut ctx = SessionContext::default();
        let out = decode(b"(013632651491BR00150324A2232.7658N11404.7995E000.0083000A0000)", &mut ctx);
        assert!(matches!(&out.frames[0], Frame::Login { imei } if imei == "013632651491"));
        assert_eq!(login_ack("013632651491"), b"(013632651491AP01HSO)".to_vec());
    }

    #[test]
    fn heartbeat_is_acked() {
        let mut ctx = SessionContext::default();
        let out = decode(b"(013632651491BP05000013632651491)", &mut ctx);
        assert!(matches!(out.frames[0], Frame::Heartbeat));
        assert_eq!(out.response, Some(b"(013632651491AP05)".to_vec()));
    }

    #[test]
    fn position_report_decodes() {
        let mut ctx = SessionContext::default();
        let out = decode(POSITION, &mut ctx);
        assert_eq!(out.consumed, POSITION.len());
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert!((pos.latitude - (22.0 + 32.7658 / 60.0)).abs() < 1e-9);
        assert!((pos.longitude - (114.0 + 4.7995 / 60.0)).abs() < 1e-9);
        assert!((pos.speed.unwrap() - 15.0 * 1.852).abs() < 1e-9);
        assert_eq!(pos.course, Some(90.0));
        assert_eq!(pos.device_time.unix_timestamp(), 1_710_491_400);
        assert!(pos.valid);
    }

    #[test]
    fn incomplete_message_waits() {
        let mut ctx = SessionContext::default();
        let out = decode(b"(013632651491BO0115", &mut ctx);
        assert_eq!(out.consumed, 0);
    }
}
