//! Teltonika Codec 8 / 8E decoder and Codec 12 command encoder.
//!
//! TCP session shape:
//!   1. IMEI announcement: 2-byte big-endian length + ASCII digits.
//!      Server replies 0x01 (accept) or 0x00 (reject and close).
//!   2. AVL data packets: 4 zero bytes | 4-byte data length | data | 4-byte CRC.
//!      Data field: codec id (0x08 or 0x8E) | record count | records | count again.
//!      Server replies with the record count as a 4-byte big-endian integer.
//!
//! AVL record layout:
//!   8 B timestamp (ms since epoch) | 1 B priority |
//!   4 B longitude ×1e-7 | 4 B latitude ×1e-7 | 2 B altitude |
//!   2 B course | 1 B satellites | 2 B speed km/h |
//!   IO header + IO groups at widths 1/2/4/8 (ids and counts are one byte
//!   wide for Codec 8, two bytes for 8E).

use time::OffsetDateTime;
use tracing::{debug, warn};

use super::crc::crc16_arc;
use super::{Decoded, EncodedCommand, Frame, SessionContext};
use crate::domain::{Command, NormalizedPosition};

const CODEC_8: u8 = 0x08;
const CODEC_8E: u8 = 0x8E;
const CODEC_12: u8 = 0x0C;

/// Documented mapping from AVL I/O id to sensor key. Unlisted ids come
/// through as `io_<id>`.
fn io_name(id: u16) -> Option<&'static str> {
    Some(match id {
        1 => "din1",
        2 => "din2",
        3 => "din3",
        4 => "din4",
        9 => "adc1",
        10 => "adc2",
        11 => "iccid1",
        12 => "fuel_used",
        13 => "fuel_consumption",
        16 => "odometer",
        17 => "axis_x",
        18 => "axis_y",
        19 => "axis_z",
        21 => "gsm_signal",
        24 => "speed",
        30 => "fault_count",
        31 => "engine_load",
        32 => "coolant_temp",
        36 => "rpm",
        66 => "external_voltage",
        67 => "battery_voltage",
        68 => "battery_current",
        69 => "gnss_status",
        70 => "pcb_temp",
        72 => "temp1",
        73 => "temp2",
        74 => "temp3",
        75 => "temp4",
        80 => "data_mode",
        81 => "obd_speed",
        82 => "throttle",
        85 => "rpm_obd",
        87 => "odometer_obd",
        89 => "fuel_level_percent",
        113 => "battery_level_percent",
        115 => "engine_temp",
        179 => "dout1",
        180 => "dout2",
        181 => "pdop",
        182 => "hdop",
        199 => "trip_odometer",
        200 => "sleep_mode",
        205 => "cell_id",
        206 => "lac",
        236 => "active_gsm_operator",
        239 => "ignition",
        240 => "movement",
        241 => "gsm_operator",
        244 => "roaming",
        246 => "towing",
        247 => "crash_detection",
        248 => "immobilizer",
        249 => "jamming",
        250 => "trip_event",
        _ => return None,
    })
}

/// Raw value × multiplier = engineering value (volts, degrees C, DOP).
fn io_multiplier(id: u16) -> Option<f64> {
    Some(match id {
        9 | 10 | 66 | 67 | 68 => 0.001,
        70 | 72 | 73 | 74 | 75 | 115 => 0.1,
        181 | 182 => 0.1,
        13 => 0.01,
        _ => return None,
    })
}

pub fn decode(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    if buf.len() >= 8 && buf[0..4] == [0, 0, 0, 0] {
        return decode_data_packet(buf, ctx);
    }
    decode_imei_preamble(buf, ctx)
}

fn decode_imei_preamble(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    if buf.len() < 2 {
        return Decoded::need_more();
    }
    let imei_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if imei_len == 0 {
        // Could be the first fragment of a data packet's zero preamble.
        if buf.len() < 8 {
            return Decoded::need_more();
        }
        return Decoded::error(1, "teltonika: bad preamble length");
    }
    if imei_len > 17 {
        return Decoded::error(1, "teltonika: bad preamble length");
    }
    if buf.len() < 2 + imei_len {
        return Decoded::need_more();
    }
    let raw = &buf[2..2 + imei_len];
    if !raw.iter().all(u8::is_ascii_digit) {
        return Decoded::error(1, "teltonika: non-numeric identifier");
    }
    let imei = String::from_utf8_lossy(raw).into_owned();
    ctx.imei = Some(imei.clone());
    Decoded {
        frames: vec![Frame::Login { imei }],
        consumed: 2 + imei_len,
        response: None,
    }
}

fn decode_data_packet(buf: &[u8], ctx: &mut SessionContext) -> Decoded {
    let data_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let total_len = 8 + data_len + 4;
    if data_len < 2 || data_len > super::MAX_BUFFER {
        return Decoded::error(buf.len(), "teltonika: implausible data length");
    }
    if buf.len() < total_len {
        return Decoded::need_more();
    }

    let data = &buf[8..8 + data_len];
    let codec_id = data[0];
    match codec_id {
        CODEC_8 | CODEC_8E => {
            let extended = codec_id == CODEC_8E;
            let record_count = data[1];
            let frames = match ctx.imei.as_deref() {
                Some(imei) => decode_records(&data[2..], record_count, imei, extended),
                None => {
                    warn!("teltonika: data packet before identifier announcement");
                    Vec::new()
                }
            };
            Decoded {
                frames,
                consumed: total_len,
                response: Some(record_ack(record_count as u32)),
            }
        }
        CODEC_12 => Decoded {
            frames: decode_command_response(data),
            consumed: total_len,
            response: None,
        },
        other => {
            warn!(codec = format!("0x{other:02X}"), "teltonika: unsupported codec");
            Decoded::skip(total_len)
        }
    }
}

/// The 4-byte big-endian record-count ack the device expects after every
/// AVL packet. Anything else makes real hardware retransmit forever.
pub fn record_ack(count: u32) -> Vec<u8> {
    count.to_be_bytes().to_vec()
}

pub fn login_ack(accepted: bool) -> Vec<u8> {
    vec![if accepted { 0x01 } else { 0x00 }]
}

fn decode_records(data: &[u8], count: u8, imei: &str, extended: bool) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut offset = 0usize;
    for _ in 0..count {
        match decode_record(data, offset, imei, extended) {
            Some((position, consumed)) => {
                offset += consumed;
                if let Some(position) = position {
                    frames.push(Frame::Position(position));
                }
            }
            None => {
                warn!(offset, "teltonika: truncated record, dropping rest of packet");
                break;
            }
        }
    }
    frames
}

/// Parse one AVL record at `offset`. Returns None on truncation; a record
/// with a 0,0 fix is consumed but yields no position.
fn decode_record(
    data: &[u8],
    offset: usize,
    imei: &str,
    extended: bool,
) -> Option<(Option<NormalizedPosition>, usize)> {
    let start = offset;
    let mut offset = offset;

    let timestamp_ms = i64::from_be_bytes(data.get(offset..offset + 8)?.try_into().ok()?);
    offset += 8;
    let _priority = *data.get(offset)?;
    offset += 1;

    let gps = data.get(offset..offset + 15)?;
    let lon = i32::from_be_bytes(gps[0..4].try_into().ok()?) as f64 / 10_000_000.0;
    let lat = i32::from_be_bytes(gps[4..8].try_into().ok()?) as f64 / 10_000_000.0;
    let alt = i16::from_be_bytes(gps[8..10].try_into().ok()?);
    let course = u16::from_be_bytes(gps[10..12].try_into().ok()?);
    let sats = gps[12];
    let speed = u16::from_be_bytes(gps[13..15].try_into().ok()?);
    offset += 15;

    // Event IO id + total count header; values unused.
    offset += if extended { 4 } else { 2 };
    if offset > data.len() {
        return None;
    }

    let mut ignition: Option<bool> = None;
    let mut sensors = std::collections::HashMap::new();

    for width in [1usize, 2, 4, 8] {
        let group_count = read_uint(data, &mut offset, if extended { 2 } else { 1 })?;
        for _ in 0..group_count {
            let id = read_uint(data, &mut offset, if extended { 2 } else { 1 })? as u16;
            let raw = read_uint(data, &mut offset, width)?;
            if id == 239 {
                ignition = Some(raw != 0);
            }
            let key = io_name(id).map(str::to_string).unwrap_or_else(|| format!("io_{id}"));
            let value = match io_multiplier(id) {
                Some(mult) => {
                    let scaled = (raw as f64 * mult * 1000.0).round() / 1000.0;
                    serde_json::json!(scaled)
                }
                None => serde_json::json!(raw),
            };
            sensors.insert(key, value);
        }
    }

    let consumed = offset - start;

    // Devices report 0,0 when they have no fix; consume but do not store.
    if lat == 0.0 && lon == 0.0 {
        debug!(imei, "teltonika: dropping record without GPS fix");
        return Some((None, consumed));
    }

    let device_time =
        OffsetDateTime::from_unix_timestamp_nanos(timestamp_ms as i128 * 1_000_000).ok()?;

    let mut position = NormalizedPosition::new(imei, device_time, lat, lon);
    position.altitude = Some(alt as f64);
    position.course = Some(course as f64);
    position.satellites = Some(sats as i32);
    position.speed = Some(speed as f64);
    position.ignition = ignition;
    position.sensors = sensors;

    Some((Some(position), consumed))
}

fn read_uint(data: &[u8], offset: &mut usize, width: usize) -> Option<u64> {
    let bytes = data.get(*offset..*offset + width)?;
    *offset += width;
    let mut value = 0u64;
    for &b in bytes {
        value = (value << 8) | b as u64;
    }
    Some(value)
}

/// Codec 12 type 0x06: response to an earlier text command.
fn decode_command_response(data: &[u8]) -> Vec<Frame> {
    if data.len() < 8 || data[2] != 0x06 {
        return Vec::new();
    }
    let len = u32::from_be_bytes([data[3], data[4], data[5], data[6]]) as usize;
    let Some(text) = data.get(7..7 + len) else {
        return Vec::new();
    };
    vec![Frame::CommandAck {
        command_key: None,
        success: true,
        response: String::from_utf8_lossy(text).into_owned(),
    }]
}

const TEXT_COMMANDS: [&str; 12] = [
    "cpureset", "getver", "getgps", "readio", "getrecord", "ggps", "getinfo", "setparam",
    "getparam", "flush", "readstatus", "getimei",
];

/// Codec 12 text command packet. `custom` payloads that look like hex are
/// sent as raw binary.
pub fn encode_command(command: &Command) -> Option<EncodedCommand> {
    let text = if command.command_type == "custom" {
        let payload = command.payload.trim();
        if payload.is_empty() {
            return None;
        }
        if payload.len() % 2 == 0 && payload.bytes().all(|b| b.is_ascii_hexdigit()) {
            let bytes = (0..payload.len())
                .step_by(2)
                .filter_map(|i| u8::from_str_radix(&payload[i..i + 2], 16).ok())
                .collect();
            return Some(EncodedCommand::plain(bytes));
        }
        payload.to_string()
    } else {
        let base = TEXT_COMMANDS
            .iter()
            .find(|&&c| c == command.command_type.to_ascii_lowercase())?;
        if command.payload.trim().is_empty() {
            base.to_string()
        } else {
            format!("{base} {}", command.payload.trim())
        }
    };
    Some(EncodedCommand::plain(encode_text_command(&text)))
}

fn encode_text_command(text: &str) -> Vec<u8> {
    let cmd = text.as_bytes();
    let mut data = Vec::with_capacity(cmd.len() + 8);
    data.push(CODEC_12);
    data.push(0x01); // command quantity
    data.push(0x05); // type 5 = text command
    data.extend_from_slice(&(cmd.len() as u32).to_be_bytes());
    data.extend_from_slice(cmd);
    data.push(0x01); // trailing quantity

    let mut packet = Vec::with_capacity(data.len() + 12);
    packet.extend_from_slice(&[0, 0, 0, 0]);
    packet.extend_from_slice(&(data.len() as u32).to_be_bytes());
    packet.extend_from_slice(&data);
    packet.extend_from_slice(&(crc16_arc(&data) as u32).to_be_bytes());
    packet
}
