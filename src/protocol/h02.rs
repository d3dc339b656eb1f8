//! H02 ASCII protocol (`*HQ,...#`), spoken by H02/H08/H12 hardware and
//! countless OEM clones. Runs over UDP here: every datagram is a complete
//! message and carries the device identifier, so there is no login
//! handshake; the decoder records the identifier in the session context.

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tracing::{debug, warn};

use super::{Decoded, Frame, SessionContext};
use crate::domain::NormalizedPosition;

pub fn decode(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    let Some(start) = buf.iter().position(|&b| b == b'*') else {
        return Decoded::skip(buf.len().max(1));
    };
    let Some(end) = buf[start..].iter().position(|&b| b == b'#') else {
        if buf.len() > 2048 {
            return Decoded::error(buf.len(), "h02: oversized message without terminator");
        }
        return Decoded::need_more();
    };
    let consumed = start + end + 1;
    let message = &buf[start..start + end + 1];

    let Ok(text) = std::str::from_utf8(message) else {
        return Decoded::error(consumed, "h02: non-ascii message");
    };
    if !text.is_ascii() {
        return Decoded::error(consumed, "h02: non-ascii message");
    }
    let Some(payload) = text.strip_prefix("*HQ,").and_then(|t| t.strip_suffix('#')) else {
        return Decoded::error(consumed, "h02: bad frame markers");
    };

    let parts: Vec<&str> = payload.split(',').collect();
    if parts.len() < 2 {
        return Decoded::error(consumed, "h02: too few fields");
    }
    let imei = parts[0].trim().to_string();
    let msg_type = parts[1].trim().to_ascii_uppercase();
    ctx.imei = Some(imei.clone());

    match msg_type.as_str() {
        "HTBT" => Decoded {
            frames: vec![Frame::Heartbeat],
            consumed,
            response: Some(format!("*HQ,{imei},R12#\r\n").into_bytes()),
        },
        "V1" | "V4" => match parse_position(&parts, &imei) {
            Some(position) => Decoded {
                frames: vec![Frame::Position(position)],
                consumed,
                response: None,
            },
            None => Decoded::error(consumed, "h02: unparseable position"),
        },
        // Cell-tower and link/status reports carry no GPS fix; they only
        // refresh last-seen.
        "NBR" | "LINK" => Decoded { frames: vec![Frame::Heartbeat], consumed, response: None },
        other => {
            debug!(msg_type = other, "h02: unhandled message type");
            Decoded::skip(consumed)
        }
    }
}

/// V1/V4 layout after splitting on commas:
/// imei, V1, HHMMSS, A/V, DDMM.MMMM, N/S, DDDMM.MMMM, E/W, speed (knots),
/// course, DDMMYY, flags hex, io hex, battery volts, gsm signal.
fn parse_position(parts: &[&str], imei: &str) -> Option<NormalizedPosition> {
    if parts.len() < 11 {
        warn!(imei, fields = parts.len(), "h02: short position report");
        return None;
    }
    let device_time = parse_datetime(parts[2].trim(), parts[10].trim())
        .unwrap_or_else(OffsetDateTime::now_utc);
    let latitude = parse_coordinate(parts[4].trim(), parts[5].trim())?;
    let longitude = parse_coordinate(parts[6].trim(), parts[7].trim())?;

    let speed_kmh = parts[8].trim().parse::<f64>().ok().map(|knots| knots * 1.852);
    let course = parts[9].trim().parse::<f64>().ok();
    let valid = parts[3].trim().eq_ignore_ascii_case("A");

    let mut position = NormalizedPosition::new(imei, device_time, latitude, longitude);
    position.speed = speed_kmh;
    position.course = course;
    position.valid = valid;

    if let Some(flags) = parts.get(11).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Ok(bits) = u32::from_str_radix(flags, 16) {
            position.ignition = Some(bits & 0x01 != 0);
            position.sensors.insert("charging".into(), serde_json::json!(bits & 0x02 != 0));
            position.sensors.insert("alarm_active".into(), serde_json::json!(bits & 0x04 != 0));
            position.sensors.insert("flags_raw".into(), serde_json::json!(flags));
        }
    }
    if let Some(volts) =
        parts.get(13).and_then(|s| s.trim().parse::<f64>().ok()).filter(|v| *v > 0.0)
    {
        position.sensors.insert("battery_voltage".into(), serde_json::json!(volts));
    }
    if let Some(signal) = parts.get(14).and_then(|s| s.trim().parse::<i64>().ok()) {
        position.sensors.insert("gsm_signal".into(), serde_json::json!(signal));
    }

    Some(position)
}

/// DDMM.MMMM (or DDDMM.MMMM) plus hemisphere to signed decimal degrees.
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

fn parse_datetime(time_str: &str, date_str: &str) -> Option<OffsetDateTime> {
    if time_str.len() < 6 || date_str.len() < 6 {
        return None;
    }
    let hh: u8 = time_str[0..2].parse().ok()?;
    let mm: u8 = time_str[2..4].parse().ok()?;
    let ss: u8 = time_str[4..6].parse().ok()?;
    let dd: u8 = date_str[0..2].parse().ok()?;
    let mo: u8 = date_str[2..4].parse().ok()?;
    let yy: i32 = date_str[4..6].parse().ok()?;
    let date = Date::from_calendar_date(2000 + yy, Month::try_from(mo).ok()?, dd).ok()?;
    let time = Time::from_hms(hh, mm, ss).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1: &[u8] =
        b"*HQ,1451234567,V1,083000,A,2232.7658,N,11404.7995,E,032.41,090,150324,FFFFFBFF#";

    #[test]
    fn v1_position_decodes() {
        let mut ctx = SessionContext::default();
        let out = decode(V1, &mut ctx);
        assert_eq!(out.consumed, V1.len());
        assert_eq!(ctx.imei.as_deref(), Some("1451234567"));
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert!((pos.latitude - (22.0 + 32.7658 / 60.0)).abs() < 1e-9);
        assert!((pos.longitude - (114.0 + 4.7995 / 60.0)).abs() < 1e-9);
        assert!((pos.speed.unwrap() - 32.41 * 1.852).abs() < 1e-9);
        assert_eq!(pos.course, Some(90.0));
        assert!(pos.valid);
        assert_eq!(pos.ignition, Some(true));
        assert_eq!(pos.device_time.unix_timestamp(), 1_710_491_400);
    }

    #[test]
    fn southern_western_hemispheres_are_negative() {
        assert!(parse_coordinate("2232.7658", "S").unwrap() < 0.0);
        assert!(parse_coordinate("11404.7995", "W").unwrap() < 0.0);
    }

    #[test]
    fn heartbeat_is_acked() {
        let mut ctx = SessionContext::default();
        let out = decode(b"*HQ,1451234567,HTBT,4.05#", &mut ctx);
        assert!(matches!(out.frames[0], Frame::Heartbeat));
        assert_eq!(out.response, Some(b"*HQ,1451234567,R12#\r\n".to_vec()));
    }

    #[test]
    fn invalid_fix_is_kept_but_flagged() {
        let mut ctx = SessionContext::default();
        let msg = b"*HQ,1451234567,V1,083000,V,2232.7658,N,11404.7995,E,000.00,000,150324,FFFFFBFE#";
        let out = decode(msg, &mut ctx);
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert!(!pos.valid);
        assert_eq!(pos.ignition, Some(false));
    }

    #[test]
    fn incomplete_message_waits() {
        let mut ctx = SessionContext::default();
        let out = decode(b"*HQ,1451234567,V1,0830", &mut ctx);
        assert_eq!(out.consumed, 0);
        assert!(out.frames.is_empty());
    }

    #[test]
    fn link_report_refreshes_last_seen_only() {
        let mut ctx = SessionContext::default();
        let out = decode(b"*HQ,1451234567,LINK,083000,9,28,85,0,0,150324#", &mut ctx);
        assert!(matches!(out.frames[0], Frame::Heartbeat));
        assert!(out.response.is_none());
    }
}
