//! OsmAnd mobile-app protocol: plain HTTP requests with the fix in the
//! query string or an URL-encoded body. Every request is answered with an
//! empty HTTP 200; there is no login handshake and no downlink.

use time::OffsetDateTime;
use tracing::warn;

use super::{Decoded, Frame, SessionContext};
use crate::domain::NormalizedPosition;

const HTTP_200: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

const KNOWN_KEYS: [&str; 14] = [
    "id", "deviceid", "lat", "latitude", "lon", "longitude", "speed", "bearing", "course",
    "altitude", "alt", "timestamp", "sat", "ignition",
];

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub fn decode(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    let Some(header_end) = find_subslice(buf, b"\r\n\r\n") else {
        if buf.len() > 8192 {
            return Decoded::error(buf.len(), "osmand: oversized request head");
        }
        return Decoded::need_more();
    };
    let head = &buf[..header_end];
    let Ok(head_text) = std::str::from_utf8(head) else {
        return Decoded::error(header_end + 4, "osmand: non-utf8 request head");
    };

    let content_length = head_text
        .lines()
        .skip(1)
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim().eq_ignore_ascii_case("content-length").then(|| value.trim())
        })
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    let total = header_end + 4 + content_length;
    if buf.len() < total {
        return Decoded::need_more();
    }
    let body = String::from_utf8_lossy(&buf[header_end + 4..total]);

    // Request line: METHOD SP path SP version
    let path = head_text.lines().next().and_then(|l| l.split_whitespace().nth(1)).unwrap_or("/");
    let mut params = parse_query(path.split_once('?').map(|(_, q)| q).unwrap_or(""));
    if params.is_empty() {
        params = parse_query(body.trim());
    }

    let Some(device_id) =
        params.get("id").or_else(|| params.get("deviceid")).filter(|s| !s.is_empty())
    else {
        warn!("osmand: request without device id");
        return Decoded {
            frames: vec![Frame::Error { reason: "osmand: missing device id".into() }],
            consumed: total,
            response: Some(HTTP_200.to_vec()),
        };
    };
    ctx.imei = Some(device_id.clone());

    match parse_position(&params, device_id) {
        Some(position) => Decoded {
            frames: vec![Frame::Position(position)],
            consumed: total,
            response: Some(HTTP_200.to_vec()),
        },
        None => Decoded {
            frames: vec![Frame::Heartbeat],
            consumed: total,
            response: Some(HTTP_200.to_vec()),
        },
    }
}

fn parse_position(
    params: &std::collections::HashMap<String, String>,
    device_id: &str,
) -> Option<NormalizedPosition> {
    let latitude: f64 =
        params.get("lat").or_else(|| params.get("latitude"))?.parse().ok()?;
    let longitude: f64 =
        params.get("lon").or_else(|| params.get("longitude"))?.parse().ok()?;

    // Seconds or milliseconds since epoch, both seen in the wild.
    let device_time = params
        .get("timestamp")
        .and_then(|t| t.parse::<f64>().ok())
        .and_then(|t| {
            let secs = if t > 10_000_000_000.0 { t / 1000.0 } else { t };
            OffsetDateTime::from_unix_timestamp(secs as i64).ok()
        })
        .unwrap_or_else(OffsetDateTime::now_utc);

    let mut position = NormalizedPosition::new(device_id, device_time, latitude, longitude);
    // The app reports speed in m/s.
    position.speed =
        params.get("speed").and_then(|s| s.parse::<f64>().ok()).map(|ms| ms * 3.6);
    position.course = params
        .get("bearing")
        .or_else(|| params.get("course"))
        .and_then(|s| s.parse().ok());
    position.altitude =
        params.get("altitude").or_else(|| params.get("alt")).and_then(|s| s.parse().ok());
    position.satellites = params.get("sat").and_then(|s| s.parse().ok());
    position.ignition = params.get("ignition").and_then(|s| s.parse().ok());

    for (key, value) in params {
        if KNOWN_KEYS.contains(&key.as_str()) {
            continue;
        }
        let json = value
            .parse::<f64>()
            .map(|n| serde_json::json!(n))
            .unwrap_or_else(|_| serde_json::json!(value));
        position.sensors.insert(key.clone(), json);
    }
    Some(position)
}

fn parse_query(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_ascii_lowercase(), percent_decode(value)))
        })
        .collect()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let digits = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match digits {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_request_decodes() {
        let mut ctx = SessionContext::default();
        let req = b"GET /?id=864454079682667&lat=37.7749&lon=-122.4194&speed=5.0&bearing=180&altitude=12&timestamp=1710491400&batt=77 HTTP/1.1\r\nHost: x\r\n\r\n";
        let out = decode(req, &mut ctx);
        assert_eq!(out.consumed, req.len());
        assert_eq!(out.response.as_deref(), Some(HTTP_200));
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert_eq!(pos.imei, "864454079682667");
        assert!((pos.latitude - 37.7749).abs() < 1e-9);
        assert!((pos.longitude + 122.4194).abs() < 1e-9);
        assert!((pos.speed.unwrap() - 18.0).abs() < 1e-9);
        assert_eq!(pos.course, Some(180.0));
        assert_eq!(pos.device_time.unix_timestamp(), 1_710_491_400);
        assert_eq!(pos.sensors["batt"], serde_json::json!(77.0));
    }

    #[test]
    fn body_parameters_are_a_fallback() {
        let mut ctx = SessionContext::default();
        let body = "id=864454079682667&lat=37.99&lon=23.79";
        let req = format!(
            "GET / HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let out = decode(req.as_bytes(), &mut ctx);
        let Frame::Position(pos) = &out.frames[0] else { panic!("expected position") };
        assert!((pos.latitude - 37.99).abs() < 1e-9);
    }

    #[test]
    fn missing_id_still_gets_a_200() {
        let mut ctx = SessionContext::default();
        let req = b"GET /?lat=1&lon=2 HTTP/1.1\r\n\r\n";
        let out = decode(req, &mut ctx);
        assert!(matches!(out.frames[0], Frame::Error { .. }));
        assert_eq!(out.response.as_deref(), Some(HTTP_200));
    }

    #[test]
    fn partial_request_waits_for_body() {
        let mut ctx = SessionContext::default();
        let req = b"GET / HTTP/1.1\r\nContent-Length: 20\r\n\r\nid=1";
        let out = decode(req, &mut ctx);
        assert_eq!(out.consumed, 0);
    }
}
