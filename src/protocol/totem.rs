//! Totem ASCII protocol: `$$`-prefixed, CRLF-terminated records with
//! comma-separated fields. Identity travels in every record, so the
//! gateway binds the session on the first one; there is no downlink.
//!
//! Record layout:
//! `$$<imei>,<event>,<DDMMYY>,<HHMMSS>,<A|V>,<DDMM.MMMM>,<N|S>,
//! <DDDMM.MMMM>,<E|W>,<speed knots>,<course>[,<io hex>]\r\n`

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use super::{Decoded, Frame, SessionContext};
use crate::domain::NormalizedPosition;

pub fn decode(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    let Some(start) = buf.windows(2).position(|w| w == b"$$") else {
        return Decoded::skip(buf.len().max(1));
    };
    let Some(end) = buf[start..].windows(2).position(|w| w == b"\r\n") else {
        if buf.len() > 2048 {
            return Decoded::error(buf.len(), "totem: oversized record without terminator");
        }
        return Decoded::need_more();
    };
    let consumed = start + end + 2;
    let Ok(record) = std::str::from_utf8(&buf[start + 2..start + end]) else {
        return Decoded::error(consumed, "totem: non-ascii record");
    };
    if !record.is_ascii() {
        return Decoded::error(consumed, "totem: non-ascii record");
    }

    let parts: Vec<&str> = record.split(',').collect();
    if parts.len() < 11 {
        return Decoded::error(consumed, "totem: short record");
    }
    let imei = parts[0].trim();
    if imei.is_empty() || !imei.bytes().all(|b| b.is_ascii_digit()) {
        return Decoded::error(consumed, "totem: bad identifier");
    }
    ctx.imei = Some(imei.to_string());

    let Some(position) = parse_position(&parts, imei) else {
        return Decoded::error(consumed, "totem: unparseable record");
    };
    Decoded { frames: vec![Frame::Position(position)], consumed, response: None }
}

fn parse_position(parts: &[&str], imei: &str) -> Option<NormalizedPosition> {
    let device_time = parse_datetime(parts[2].trim(), parts[3].trim())
        .unwrap_or_else(OffsetDateTime::now_utc);
    let valid = parts[4].trim().eq_ignore_ascii_case("A");
    let latitude = parse_coordinate(parts[5].trim(), parts[6].trim())?;
    let longitude = parse_coordinate(parts[7].trim(), parts[8].trim())?;
    let speed_knots: f64 = parts[9].trim().parse().ok()?;
    let course: f64 = parts[10].trim().parse().ok()?;

    let mut position = NormalizedPosition::new(imei, device_time, latitude, longitude);
    position.speed = Some(speed_knots * 1.852);
    position.course = Some(course);
    position.valid = valid;

    match parts[1].trim() {
        "ACCON" => position.ignition = Some(true),
        "ACCOFF" => position.ignition = Some(false),
        "" | "POS" => {}
        other => {
            position.sensors.insert("alert_type".into(), serde_json::json!(other));
        }
    }
    if let Some(io) = parts.get(11).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Ok(bits) = u32::from_str_radix(io, 16) {
            position.sensors.insert("io_raw".into(), serde_json::json!(bits));
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

fn parse_datetime(date_str: &str, time_str: &str) -> Option<OffsetDateTime> {
    if date_str.len() < 6 || time_str.len() < 6 {
        return None;
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &[u8] =
        b"$$867857048588227,POS,150324,083000,A,2232.7658,N,11404.7995,E,12.00,045,00FF\r\n";

    #[test]
    fn record_decodes() {
        let mut ctx = SessionContext::default();
        let out = decode(RECORD, &mut ctx);
        assert_eq!(out.consumed, RECORD.len());
        assert_eq!(ctx.imei.as_deref(), Some("867857048588227"));
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert!((pos.latitude - (22.0 + 32.7658 / 60.0)).abs() < 1e-9);
        assert!((pos.speed.unwrap() - 12.0 * 1.852).abs() < 1e-9);
        assert_eq!(pos.course, Some(45.0));
        assert_eq!(pos.sensors["io_raw"], serde_json::json!(255));
        assert_eq!(pos.device_time.unix_timestamp(), 1_710_491_400);
    }

    #[test]
    fn ignition_events_map_to_the_flag() {
        let mut ctx = SessionContext::default();
        let msg =
            b"$$867857048588227,ACCOFF,150324,083000,A,2232.7658,N,11404.7995,E,0.00,0\r\n";
        let out = decode(msg, &mut ctx);
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert_eq!(pos.ignition, Some(false));
    }

    #[test]
    fn waits_for_crlf() {
        let mut ctx = SessionContext::default();
        let out = decode(b"$$867857048588227,POS,1503", &mut ctx);
        assert_eq!(out.consumed, 0);
    }

    #[test]
    fn garbage_before_marker_is_skipped() {
        let mut ctx = SessionContext::default();
        let out = decode(b"xx$$", &mut ctx);
        assert_eq!(out.consumed, 0); // waits: marker found but no CRLF yet
        let out = decode(b"xxyy", &mut ctx);
        assert_eq!(out.consumed, 4);
    }
}
