//! Flespi standardized JSON protocol: newline-delimited objects (or
//! arrays of objects) using dotted flespi field names. An `ident`-only
//! object is the login; telemetry objects may also carry the ident.

use time::OffsetDateTime;
use tracing::debug;

use super::{Decoded, Frame, SessionContext};
use crate::domain::NormalizedPosition;

pub fn decode(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > 8192 {
            return Decoded::error(buf.len(), "flespi: oversized message without newline");
        }
        return Decoded::need_more();
    };
    let consumed = newline + 1;
    let Ok(text) = std::str::from_utf8(&buf[..newline]) else {
        return Decoded::error(consumed, "flespi: non-utf8 message");
    };
    let text = text.trim();
    if text.is_empty() {
        return Decoded::skip(consumed);
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return Decoded::error(consumed, format!("flespi: bad json: {err}")),
    };

    let mut frames = Vec::new();
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                if let Some(frame) = decode_object(&item, ctx) {
                    frames.push(frame);
                }
            }
        }
        object => {
            if let Some(frame) = decode_object(&object, ctx) {
                frames.push(frame);
            }
        }
    }

    // The login ack is the gateway's call: it depends on the device lookup.
    Decoded { frames, consumed, response: None }
}

pub fn login_ack() -> Vec<u8> {
    b"{\"status\": \"ok\"}\n".to_vec()
}

fn decode_object(value: &serde_json::Value, ctx: &mut SessionContext) -> Option<Frame> {
    let object = value.as_object()?;

    let ident = object
        .get("ident")
        .or_else(|| object.get("device.ident"))
        .and_then(json_string);
    if let Some(ident) = &ident {
        ctx.imei = Some(ident.clone());
    }
    let imei = ident.or_else(|| ctx.imei.clone())?;

    let latitude = number(object, "position.latitude");
    let longitude = number(object, "position.longitude");
    let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
        // Ident without a fix is the login message.
        debug!(imei, "flespi: login");
        return Some(Frame::Login { imei });
    };

    let device_time = number(object, "timestamp")
        .or_else(|| number(object, "server.timestamp"))
        .and_then(|t| {
            let secs = if t > 10_000_000_000.0 { t / 1000.0 } else { t };
            OffsetDateTime::from_unix_timestamp(secs as i64).ok()
        })
        .unwrap_or_else(OffsetDateTime::now_utc);

    let mut position = NormalizedPosition::new(imei, device_time, latitude, longitude);
    position.speed = number(object, "position.speed");
    position.course = number(object, "position.direction");
    position.altitude = number(object, "position.altitude");
    position.satellites = number(object, "position.satellites").map(|v| v as i32);
    position.valid = object
        .get("position.valid")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(true);
    position.ignition =
        object.get("engine.ignition.status").and_then(serde_json::Value::as_bool);

    for (flespi_key, sensor_key) in [
        ("battery.voltage", "battery_voltage"),
        ("external.powersource.voltage", "external_voltage"),
        ("gnss.hdop", "hdop"),
        ("gsm.signal.level", "gsm_signal"),
        ("engine.rpm", "rpm"),
        ("fuel.level", "fuel_level"),
        ("vehicle.mileage", "odometer"),
    ] {
        if let Some(value) = object.get(flespi_key) {
            position.sensors.insert(sensor_key.into(), value.clone());
        }
    }
    Some(Frame::Position(position))
}

fn number(object: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<f64> {
    object.get(key).and_then(serde_json::Value::as_f64)
}

fn json_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_message_is_a_login() {
        let mut ctx = SessionContext::default();
        let out = decode(b"{\"ident\": \"867440069999999\"}\n", &mut ctx);
        assert!(matches!(&out.frames[0], Frame::Login { imei } if imei == "867440069999999"));
        assert!(out.response.is_none(), "ack is sent after the device lookup");
        assert_eq!(ctx.imei.as_deref(), Some("867440069999999"));
        assert_eq!(login_ack(), b"{\"status\": \"ok\"}\n".to_vec());
    }

    #[test]
    fn telemetry_message_decodes() {
        let mut ctx =
            SessionContext { imei: Some("867440069999999".into()), ..Default::default() };
        let msg = br#"{"timestamp": 1710491400, "position.latitude": 22.546096, "position.longitude": 114.079992, "position.speed": 60, "position.direction": 90, "position.satellites": 9, "engine.ignition.status": true, "battery.voltage": 3.9}
"#;
        let out = decode(msg, &mut ctx);
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert!((pos.latitude - 22.546096).abs() < 1e-9);
        assert_eq!(pos.speed, Some(60.0));
        assert_eq!(pos.ignition, Some(true));
        assert_eq!(pos.sensors["battery_voltage"], serde_json::json!(3.9));
        assert_eq!(pos.device_time.unix_timestamp(), 1_710_491_400);
    }

    #[test]
    fn array_payload_yields_multiple_frames() {
        let mut ctx =
            SessionContext { imei: Some("867440069999999".into()), ..Default::default() };
        let msg = br#"[{"timestamp": 1, "position.latitude": 1.0, "position.longitude": 2.0}, {"timestamp": 2, "position.latitude": 1.1, "position.longitude": 2.1}]
"#;
        let out = decode(msg, &mut ctx);
        assert_eq!(out.frames.len(), 2);
    }

    #[test]
    fn bad_json_is_an_error_frame() {
        let mut ctx = SessionContext::default();
        let out = decode(b"{not json}\n", &mut ctx);
        assert!(matches!(out.frames[0], Frame::Error { .. }));
        assert_eq!(out.consumed, 11);
    }

    #[test]
    fn waits_for_the_newline() {
        let mut ctx = SessionContext::default();
        let out = decode(b"{\"ident\": \"8674", &mut ctx);
        assert_eq!(out.consumed, 0);
    }
}
