//! GPS103 / Xexun ASCII protocol. Semicolon-terminated messages:
//! login `##,imei:<id>,A;` (acked `LOAD`), bare-digit heartbeat (acked
//! `ON`), and `imei:<id>,<event>,...;` position reports with GPRMC-style
//! coordinate fields.

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tracing::debug;

use super::{Decoded, EncodedCommand, Frame, SessionContext};
use crate::domain::{Command, NormalizedPosition};

pub fn decode(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    let Some(end) = buf.iter().position(|&b| b == b';') else {
        if buf.len() > 1024 {
            return Decoded::error(buf.len(), "gps103: oversized message without terminator");
        }
        return Decoded::need_more();
    };
    let consumed = end + 1;
    let Ok(raw) = std::str::from_utf8(&buf[..end]) else {
        return Decoded::error(consumed, "gps103: non-ascii message");
    };
    let message = raw.trim_matches(['\r', '\n', ' ']);
    if message.is_empty() {
        return Decoded::skip(consumed);
    }
    if !message.is_ascii() {
        return Decoded::error(consumed, "gps103: non-ascii message");
    }

    // Login handshake: ##,imei:<digits>,A
    if let Some(rest) = message.strip_prefix("##,imei:") {
        let imei: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if imei.is_empty() {
            return Decoded::error(consumed, "gps103: login without identifier");
        }
        ctx.imei = Some(imei.clone());
        return Decoded { frames: vec![Frame::Login { imei }], consumed, response: None };
    }

    // Keepalive: bare identifier digits.
    if message.bytes().all(|b| b.is_ascii_digit()) {
        return Decoded {
            frames: vec![Frame::Heartbeat],
            consumed,
            response: Some(b"ON".to_vec()),
        };
    }

    if message.starts_with("imei:") {
        return match parse_position(message, ctx) {
            Some(position) => {
                Decoded { frames: vec![Frame::Position(position)], consumed, response: None }
            }
            None => Decoded::error(consumed, "gps103: unparseable position"),
        };
    }

    debug!(message, "gps103: unhandled message");
    Decoded::skip(consumed)
}

pub fn login_ack() -> Vec<u8> {
    b"LOAD".to_vec()
}

/// imei:<id>,<event>,<YYMMDDHHMM>,<phone>,F,<hhmmss.sss>,A,<DDMM.MMMM>,
/// <N/S>,<DDDMM.MMMM>,<E/W>,<speed knots>,<course>;
fn parse_position(message: &str, ctx: &mut SessionContext) -> Option<NormalizedPosition> {
    let parts: Vec<&str> = message.split(',').collect();
    if parts.len() < 12 {
        return None;
    }
    let imei = parts[0].strip_prefix("imei:")?.to_string();
    ctx.imei = Some(imei.clone());
    let event = parts[1].trim();

    let device_time = parse_datetime(parts[2].trim(), parts[5].trim())
        .unwrap_or_else(OffsetDateTime::now_utc);
    let valid = parts[6].trim().eq_ignore_ascii_case("A");
    let latitude = parse_coordinate(parts[7].trim(), parts[8].trim())?;
    let longitude = parse_coordinate(parts[9].trim(), parts[10].trim())?;
    let speed_knots: f64 = parts[11].trim().parse().unwrap_or(0.0);
    let course = parts.get(12).and_then(|s| s.trim().parse::<f64>().ok());

    let mut position = NormalizedPosition::new(imei, device_time, latitude, longitude);
    position.speed = Some(speed_knots * 1.852);
    position.course = course;
    position.valid = valid;

    match event {
        "acc on" => position.ignition = Some(true),
        "acc off" => position.ignition = Some(false),
        "tracker" | "" => {}
        other => {
            position.sensors.insert("alert_type".into(), serde_json::json!(other));
        }
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
    if matches!(hemisphere.to_ascii_uppercase().as_str(), "S" | "W") {
        result = -result;
    }
    Some(result)
}

/// Date from the local YYMMDDHHMM field, time-of-day from the UTC
/// hhmmss.sss field.
fn parse_datetime(local: &str, utc_time: &str) -> Option<OffsetDateTime> {
    if local.len() < 6 || utc_time.len() < 6 {
        return None;
    }
    let yy: i32 = local[0..2].parse().ok()?;
    let mo: u8 = local[2..4].parse().ok()?;
    let dd: u8 = local[4..6].parse().ok()?;
    let hh: u8 = utc_time[0..2].parse().ok()?;
    let mi: u8 = utc_time[2..4].parse().ok()?;
    let ss: u8 = utc_time[4..6].parse().ok()?;
    let date = Date::from_calendar_date(2000 + yy, Month::try_from(mo).ok()?, dd).ok()?;
    let time = Time::from_hms(hh, mi, ss).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

pub fn encode_command(command: &Command, imei: &str) -> Option<EncodedCommand> {
    let text = match command.command_type.as_str() {
        "request_position" => format!("**,imei:{imei},B;"),
        "continuous_tracking" => {
            let interval = command.payload.trim();
            let interval = if interval.is_empty() { "30s" } else { interval };
            format!("**,imei:{imei},C,{interval};")
        }
        "stop_tracking" => format!("**,imei:{imei},D;"),
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

    #[test]
    fn login_then_ack() {
        let mut ctx = SessionContext::default();
        let out = decode(b"##,imei:359586015829802,A;", &mut ctx);
        assert!(matches!(&out.frames[0], Frame::Login { imei } if imei == "359586015829802"));
        assert_eq!(login_ack(), b"LOAD".to_vec());
    }

    #[test]
    fn bare_digits_are_a_heartbeat() {
        let mut ctx = SessionContext::default();
        let out = decode(b"359586015829802;", &mut ctx);
        assert!(matches!(out.frames[0], Frame::Heartbeat));
        assert_eq!(out.response, Some(b"ON".to_vec()));
    }

    #[test]
    fn tracker_report_decodes() {
        let mut ctx = SessionContext::default();
        let msg = b"imei:359586015829802,tracker,2403150830,,F,083000.000,A,2232.7658,N,11404.7995,E,8.50,90;";
        let out = decode(msg, &mut ctx);
        assert_eq!(out.consumed, msg.len());
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert!((pos.latitude - (22.0 + 32.7658 / 60.0)).abs() < 1e-9);
        assert!((pos.speed.unwrap() - 8.5 * 1.852).abs() < 1e-9);
        assert_eq!(pos.course, Some(90.0));
        assert_eq!(pos.device_time.unix_timestamp(), 1_710_491_400);
        assert!(pos.ignition.is_none());
    }

    #[test]
    fn acc_events_set_ignition() {
        let mut ctx = SessionContext::default();
        let msg = b"imei:359586015829802,acc off,2403150830,,F,083000.000,A,2232.7658,N,11404.7995,E,0.00,0;";
        let out = decode(msg, &mut ctx);
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert_eq!(pos.ignition, Some(false));
    }

    #[test]
    fn alarm_event_lands_in_sensors() {
        let mut ctx = SessionContext::default();
        let msg = b"imei:359586015829802,help me,2403150830,,F,083000.000,A,2232.7658,N,11404.7995,E,0.00,0;";
        let out = decode(msg, &mut ctx);
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert_eq!(pos.sensors["alert_type"], serde_json::json!("help me"));
    }

    #[test]
    fn position_command_embeds_identifier() {
        let command = Command {
            id: 1,
            device_id: 1,
            command_type: "request_position".into(),
            payload: String::new(),
            status: crate::domain::CommandStatus::Pending,
            retries_remaining: 0,
            command_key: None,
            created_at: time::OffsetDateTime::UNIX_EPOCH,
            sent_at: None,
            acked_at: None,
            response: None,
        };
        let encoded = encode_command(&command, "359586015829802").unwrap();
        assert_eq!(encoded.bytes, b"**,imei:359586015829802,B;".to_vec());
    }
}
