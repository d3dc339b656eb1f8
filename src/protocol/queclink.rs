//! Queclink GV/GL/GB series ASCII protocol: `+RESP:GTxxx,...$` reports,
//! `+ACK:GTxxx,...$` command acknowledgements, AT-command downlink.
//! There is no login handshake; every report carries the IMEI and the
//! gateway binds the session on the first one.

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tracing::debug;

use super::{Decoded, EncodedCommand, Frame, SessionContext};
use crate::domain::{Command, NormalizedPosition};

const POSITION_REPORTS: [&str; 7] =
    ["GTFRI", "GTRTL", "GTGEO", "GTDOG", "GTSPD", "GTSOS", "GTIDN"];

pub fn decode(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    let Some(start) = buf.iter().position(|&b| b == b'+') else {
        return Decoded::skip(buf.len().max(1));
    };
    let Some(end) = buf[start..].iter().position(|&b| b == b'$') else {
        if buf.len() > 2048 {
            return Decoded::error(buf.len(), "queclink: oversized message without terminator");
        }
        return Decoded::need_more();
    };
    let consumed = start + end + 1;
    let Ok(message) = std::str::from_utf8(&buf[start..start + end]) else {
        return Decoded::error(consumed, "queclink: non-ascii message");
    };

    // +PREFIX:GTTYPE,field,field,...
    let Some((head, payload)) = message[1..].split_once(',') else {
        return Decoded::error(consumed, "queclink: malformed header");
    };
    let Some((prefix, msg_type)) = head.split_once(':') else {
        return Decoded::error(consumed, "queclink: malformed header");
    };
    let fields: Vec<&str> = payload.split(',').collect();

    match prefix {
        "ACK" => Decoded {
            frames: vec![Frame::CommandAck {
                command_key: ack_serial(&fields),
                success: true,
                response: message.to_string(),
            }],
            consumed,
            response: None,
        },
        "RESP" | "BUFF" => {
            if !POSITION_REPORTS.contains(&msg_type) && !matches!(msg_type, "GTIGN" | "GTIGF") {
                debug!(msg_type, "queclink: unhandled report type");
                return Decoded::skip(consumed);
            }
            match parse_position(&fields, msg_type, ctx) {
                Some(position) => {
                    Decoded { frames: vec![Frame::Position(position)], consumed, response: None }
                }
                None => Decoded::error(consumed, "queclink: unparseable report"),
            }
        }
        other => {
            debug!(prefix = other, "queclink: unhandled prefix");
            Decoded::skip(consumed)
        }
    }
}

/// In `+ACK:GTxxx,<proto>,<imei>,...,<serial>,<time>,<count>$` the echoed
/// serial is the 4-hex-digit field we put into the command.
fn ack_serial(fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .rev()
        .map(|s| s.trim())
        .find(|s| s.len() == 4 && s.bytes().all(|b| b.is_ascii_hexdigit()))
        .map(|s| s.to_ascii_uppercase())
}

/// Reports share a tail layout around the 14-digit GPS timestamp:
/// ..., accuracy, speed km/h, azimuth, altitude, longitude, latitude,
/// YYYYMMDDHHMMSS, mcc, mnc, lac, cell, ...
fn parse_position(
    fields: &[&str],
    msg_type: &str,
    ctx: &mut SessionContext,
) -> Option<NormalizedPosition> {
    let imei = fields.get(1).map(|s| s.trim()).filter(|s| s.len() >= 14)?;
    ctx.imei = Some(imei.to_string());

    let time_idx = fields.iter().position(|f| {
        let f = f.trim();
        f.len() == 14 && f.bytes().all(|b| b.is_ascii_digit())
    })?;
    if time_idx < 6 {
        return None;
    }
    let device_time =
        parse_timestamp(fields[time_idx].trim()).unwrap_or_else(OffsetDateTime::now_utc);
    let latitude: f64 = fields[time_idx - 1].trim().parse().ok()?;
    let longitude: f64 = fields[time_idx - 2].trim().parse().ok()?;
    let altitude = fields[time_idx - 3].trim().parse::<f64>().ok();
    let course = fields[time_idx - 4].trim().parse::<f64>().ok();
    let speed = fields[time_idx - 5].trim().parse::<f64>().ok();

    let mut position = NormalizedPosition::new(imei, device_time, latitude, longitude);
    position.speed = speed;
    position.course = course;
    position.altitude = altitude;

    match msg_type {
        "GTIGN" => position.ignition = Some(true),
        "GTIGF" => position.ignition = Some(false),
        "GTSOS" => {
            position.sensors.insert("alert_type".into(), serde_json::json!("sos"));
        }
        "GTSPD" => {
            position.sensors.insert("alert_type".into(), serde_json::json!("speed"));
        }
        _ => {}
    }

    // Cellular context follows the timestamp where present.
    for (offset, key) in [(1, "mcc"), (2, "mnc"), (3, "lac"), (4, "cell_id")] {
        if let Some(value) =
            fields.get(time_idx + offset).map(|s| s.trim()).filter(|s| !s.is_empty())
        {
            position.sensors.insert(key.into(), serde_json::json!(value));
        }
    }
    Some(position)
}

fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    let year: i32 = value[0..4].parse().ok()?;
    let month: u8 = value[4..6].parse().ok()?;
    let day: u8 = value[6..8].parse().ok()?;
    let hh: u8 = value[8..10].parse().ok()?;
    let mi: u8 = value[10..12].parse().ok()?;
    let ss: u8 = value[12..14].parse().ok()?;
    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
    let time = Time::from_hms(hh, mi, ss).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

/// AT-style downlink. The trailing 4-hex-digit count is echoed in the
/// device's `+ACK` and doubles as the correlation key.
pub fn encode_command(command: &Command) -> Option<EncodedCommand> {
    let password = "000000";
    let serial = format!("{:04X}", (command.id as u16) & 0xFFFF);
    let text = match command.command_type.as_str() {
        "reboot" => format!("AT+GTRTO={password},3,,,,,,{serial}$"),
        "get_version" => format!("AT+GTRTO={password},0,,,,,,{serial}$"),
        "request_position" => format!("AT+GTRTO={password},1,,,,,,{serial}$"),
        "set_interval" => {
            let interval: u32 = command.payload.trim().parse().unwrap_or(30);
            format!("AT+GTFRI={password},1,,,,,,{interval},,,,,,,,{serial}$")
        }
        "custom" => {
            let mut payload = command.payload.trim().to_string();
            if payload.is_empty() {
                return None;
            }
            if !payload.starts_with("AT+") {
                payload = format!("AT+{payload}");
            }
            if !payload.ends_with('$') {
                payload.push('$');
            }
            payload
        }
        _ => return None,
    };
    Some(EncodedCommand { bytes: text.into_bytes(), key: Some(serial) })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GTFRI: &[u8] = b"+RESP:GTFRI,060228,135790246811220,,,00,1,1,4.3,92,70.0,121.354335,31.222073,20090214013254,0460,0000,18d8,6141,00,20090214093254,11F0$";

    #[test]
    fn gtfri_report_decodes() {
        let mut ctx = SessionContext::default();
        let out = decode(GTFRI, &mut ctx);
        assert_eq!(out.consumed, GTFRI.len());
        assert_eq!(ctx.imei.as_deref(), Some("135790246811220"));
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert!((pos.latitude - 31.222073).abs() < 1e-9);
        assert!((pos.longitude - 121.354335).abs() < 1e-9);
        assert_eq!(pos.speed, Some(4.3));
        assert_eq!(pos.course, Some(92.0));
        assert_eq!(pos.altitude, Some(70.0));
        assert_eq!(pos.sensors["mcc"], serde_json::json!("0460"));
    }

    #[test]
    fn ignition_reports_set_the_flag() {
        let mut ctx = SessionContext::default();
        let msg = b"+RESP:GTIGN,060228,135790246811220,,,00,1,1,0.0,0,70.0,121.354335,31.222073,20090214013254,0460,0000,18d8,6141,00$";
        let out = decode(msg, &mut ctx);
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert_eq!(pos.ignition, Some(true));
    }

    #[test]
    fn ack_carries_the_serial_key() {
        let mut ctx = SessionContext::default();
        let msg = b"+ACK:GTRTO,060228,135790246811220,,0002,20090214093254,11F0$";
        let out = decode(msg, &mut ctx);
        let Frame::CommandAck { command_key, .. } = &out.frames[0] else {
            panic!("expected ack")
        };
        assert_eq!(command_key.as_deref(), Some("11F0"));
    }

    #[test]
    fn command_serial_matches_key() {
        let command = Command {
            id: 0x0002,
            device_id: 1,
            command_type: "reboot".into(),
            payload: String::new(),
            status: crate::domain::CommandStatus::Pending,
            retries_remaining: 0,
            command_key: None,
            created_at: time::OffsetDateTime::UNIX_EPOCH,
            sent_at: None,
            acked_at: None,
            response: None,
        };
        let encoded = encode_command(&command).unwrap();
        assert_eq!(encoded.key.as_deref(), Some("0002"));
        assert!(String::from_utf8(encoded.bytes).unwrap().ends_with("0002$"));
    }

    #[test]
    fn incomplete_message_waits() {
        let mut ctx = SessionContext::default();
        let out = decode(b"+RESP:GTFRI,060228,1357", &mut ctx);
        assert_eq!(out.consumed, 0);
    }
}
