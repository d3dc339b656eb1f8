use crate::domain::{Command, NormalizedPosition};

pub mod crc;
pub mod flespi;
pub mod gps103;
pub mod gt06;
pub mod h02;
pub mod osmand;
pub mod queclink;
pub mod teltonika;
pub mod tk103;
pub mod totem;

/// Accumulated unframed bytes beyond this close the connection.
pub const MAX_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// One decoded unit from the wire.
#[derive(Debug, Clone)]
pub enum Frame {
    Login { imei: String },
    Position(NormalizedPosition),
    Heartbeat,
    CommandAck { command_key: Option<String>, success: bool, response: String },
    Error { reason: String },
}

/// Result of one `decode` call.
///
/// `consumed == 0` with no frames means a partial frame: keep the buffer and
/// wait for more bytes. `response` carries protocol-mandated acks computed
/// during decode (record-count acks, heartbeat acks); login acks are built
/// separately after device lookup.
#[derive(Debug, Default)]
pub struct Decoded {
    pub frames: Vec<Frame>,
    pub consumed: usize,
    pub response: Option<Vec<u8>>,
}

impl Decoded {
    pub fn need_more() -> Self {
        Self::default()
    }

    /// Consume bytes without producing anything (skip garbage, resync).
    pub fn skip(consumed: usize) -> Self {
        Self { frames: Vec::new(), consumed, response: None }
    }

    pub fn error(consumed: usize, reason: impl Into<String>) -> Self {
        Self {
            frames: vec![Frame::Error { reason: reason.into() }],
            consumed,
            response: None,
        }
    }
}

/// Per-connection decoder scratch. Lives as long as the session.
#[derive(Debug, Default, Clone)]
pub struct SessionContext {
    /// Identifier announced at login, if any.
    pub imei: Option<String>,
    /// Last sequence number seen (GT06 serial), echoed in acks.
    pub serial: u16,
}

#[derive(Debug, Clone)]
pub struct CommandPreview {
    pub hex: String,
    pub ascii: String,
}

/// Every protocol the gateway speaks. A listener binds exactly one kind;
/// dispatch is a match on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Teltonika,
    Gt06,
    H02,
    Tk103,
    Gps103,
    Queclink,
    OsmAnd,
    Flespi,
    Totem,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 9] = [
        ProtocolKind::Teltonika,
        ProtocolKind::Gt06,
        ProtocolKind::H02,
        ProtocolKind::Tk103,
        ProtocolKind::Gps103,
        ProtocolKind::Queclink,
        ProtocolKind::OsmAnd,
        ProtocolKind::Flespi,
        ProtocolKind::Totem,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "teltonika" => Some(ProtocolKind::Teltonika),
            "gt06" => Some(ProtocolKind::Gt06),
            "h02" => Some(ProtocolKind::H02),
            "tk103" => Some(ProtocolKind::Tk103),
            "gps103" => Some(ProtocolKind::Gps103),
            "queclink" => Some(ProtocolKind::Queclink),
            "osmand" => Some(ProtocolKind::OsmAnd),
            "flespi" => Some(ProtocolKind::Flespi),
            "totem" => Some(ProtocolKind::Totem),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Teltonika => "teltonika",
            ProtocolKind::Gt06 => "gt06",
            ProtocolKind::H02 => "h02",
            ProtocolKind::Tk103 => "tk103",
            ProtocolKind::Gps103 => "gps103",
            ProtocolKind::Queclink => "queclink",
            ProtocolKind::OsmAnd => "osmand",
            ProtocolKind::Flespi => "flespi",
            ProtocolKind::Totem => "totem",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ProtocolKind::Teltonika => 5027,
            ProtocolKind::Gt06 => 5023,
            ProtocolKind::H02 => 5025,
            ProtocolKind::Tk103 => 5021,
            ProtocolKind::Gps103 => 5022,
            ProtocolKind::Queclink => 5026,
            ProtocolKind::OsmAnd => 5055,
            ProtocolKind::Flespi => 5149,
            ProtocolKind::Totem => 5028,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            ProtocolKind::H02 => Transport::Udp,
            _ => Transport::Tcp,
        }
    }

    pub fn supports_commands(&self) -> bool {
        matches!(
            self,
            ProtocolKind::Teltonika
                | ProtocolKind::Gt06
                | ProtocolKind::Tk103
                | ProtocolKind::Gps103
                | ProtocolKind::Queclink
        )
    }

    /// Decode as many bytes from the front of `buf` as the protocol
    /// recognises. Partial frames yield zero frames and zero consumption.
    pub fn decode(&self, buf: &[u8], ctx: &mut SessionContext) -> Decoded {
        match self {
            ProtocolKind::Teltonika => teltonika::decode(buf, ctx),
            ProtocolKind::Gt06 => gt06::decode(buf, ctx),
            ProtocolKind::H02 => h02::decode(buf, ctx),
            ProtocolKind::Tk103 => tk103::decode(buf, ctx),
            ProtocolKind::Gps103 => gps103::decode(buf, ctx),
            ProtocolKind::Queclink => queclink::decode(buf, ctx),
            ProtocolKind::OsmAnd => osmand::decode(buf, ctx),
            ProtocolKind::Flespi => flespi::decode(buf, ctx),
            ProtocolKind::Totem => totem::decode(buf, ctx),
        }
    }

    /// Protocol-specific login acceptance/rejection bytes, sent after the
    /// device lookup. Teltonika has an explicit reject byte; the other
    /// protocols reject by staying silent and closing.
    pub fn login_ack(&self, accepted: bool, ctx: &SessionContext) -> Option<Vec<u8>> {
        match self {
            ProtocolKind::Teltonika => Some(teltonika::login_ack(accepted)),
            ProtocolKind::Gt06 => accepted.then(|| gt06::login_ack(ctx.serial)),
            ProtocolKind::Tk103 => {
                if accepted {
                    ctx.imei.as_deref().map(tk103::login_ack)
                } else {
                    None
                }
            }
            ProtocolKind::Gps103 => accepted.then(gps103::login_ack),
            ProtocolKind::Flespi => accepted.then(flespi::login_ack),
            _ => None,
        }
    }

    /// Encode a queued command for the wire, or None when the protocol has
    /// no downlink. `imei` is the target device identifier, embedded in the
    /// command text by the ASCII protocols. The returned key, if any,
    /// correlates the eventual ack.
    pub fn encode_command(&self, command: &Command, imei: &str) -> Option<EncodedCommand> {
        match self {
            ProtocolKind::Teltonika => teltonika::encode_command(command),
            ProtocolKind::Gt06 => gt06::encode_command(command),
            ProtocolKind::Tk103 => tk103::encode_command(command, imei),
            ProtocolKind::Gps103 => gps103::encode_command(command, imei),
            ProtocolKind::Queclink => queclink::encode_command(command),
            _ => None,
        }
    }

    /// Hex and ASCII rendering of the encoded command, for UI preview.
    pub fn preview(&self, command: &Command, imei: &str) -> Option<CommandPreview> {
        let encoded = self.encode_command(command, imei)?;
        Some(CommandPreview {
            hex: hex_string(&encoded.bytes),
            ascii: encoded
                .bytes
                .iter()
                .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
                .collect(),
        })
    }
}

/// Command bytes plus an optional protocol correlation key.
#[derive(Debug, Clone)]
pub struct EncodedCommand {
    pub bytes: Vec<u8>,
    pub key: Option<String>,
}

impl EncodedCommand {
    pub fn plain(bytes: Vec<u8>) -> Self {
        Self { bytes, key: None }
    }
}

pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names_roundtrip() {
        for kind in ProtocolKind::ALL {
            assert_eq!(ProtocolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ProtocolKind::from_name("TELTONIKA"), Some(ProtocolKind::Teltonika));
        assert_eq!(ProtocolKind::from_name("meitrack"), None);
    }

    #[test]
    fn listener_defaults_match_deployment_plan() {
        assert_eq!(ProtocolKind::Teltonika.default_port(), 5027);
        assert_eq!(ProtocolKind::Gt06.default_port(), 5023);
        assert_eq!(ProtocolKind::H02.default_port(), 5025);
        assert_eq!(ProtocolKind::H02.transport(), Transport::Udp);
        assert_eq!(ProtocolKind::OsmAnd.transport(), Transport::Tcp);
    }

    #[test]
    fn commandless_protocols_report_it() {
        assert!(!ProtocolKind::OsmAnd.supports_commands());
        assert!(!ProtocolKind::Flespi.supports_commands());
        assert!(!ProtocolKind::Totem.supports_commands());
        assert!(ProtocolKind::Gt06.supports_commands());
    }

    #[test]
    fn preview_renders_hex_and_ascii() {
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
        let preview = ProtocolKind::Gps103.preview(&command, "359586015829802").unwrap();
        assert_eq!(preview.ascii, "**,imei:359586015829802,B;");
        assert_eq!(preview.hex.len(), preview.ascii.len() * 2);
        assert!(ProtocolKind::OsmAnd.preview(&command, "x").is_none());
    }
}
