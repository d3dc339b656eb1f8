use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// Unified position record produced by every protocol decoder.
///
/// Decoders fill what the wire format carries; everything else stays None
/// and the pipeline treats missing speed/course as zero where it must.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedPosition {
    pub imei: String,
    #[serde(with = "time::serde::iso8601")]
    pub device_time: OffsetDateTime,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    /// km/h
    pub speed: Option<f64>,
    /// degrees, 0-360
    pub course: Option<f64>,
    pub satellites: Option<i32>,
    pub valid: bool,
    pub ignition: Option<bool>,
    #[serde(default)]
    pub sensors: HashMap<String, serde_json::Value>,
}

impl NormalizedPosition {
    pub fn new(
        imei: impl Into<String>,
        device_time: OffsetDateTime,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            imei: imei.into(),
            device_time,
            latitude,
            longitude,
            altitude: None,
            speed: None,
            course: None,
            satellites: None,
            valid: true,
            ignition: None,
            sensors: HashMap::new(),
        }
    }

    pub fn speed_kmh(&self) -> f64 {
        self.speed.unwrap_or(0.0)
    }
}

/// A registered tracker. `(imei, protocol)` resolves exactly one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub imei: String,
    pub name: String,
    pub protocol: String,
    pub vehicle_type: Option<String>,
    pub license_plate: Option<String>,
    pub vin: Option<String>,
    pub config: DeviceConfig,
    pub is_active: bool,
    /// Users the device is assigned to (many-to-many, admin managed).
    #[serde(default)]
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Fixed UTC offset for the schedule gate; None means UTC.
    pub timezone_offset_minutes: Option<i32>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Live per-device state, written through to storage at coarse cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: i64,
    pub last_latitude: Option<f64>,
    pub last_longitude: Option<f64>,
    pub last_altitude: Option<f64>,
    pub last_speed: Option<f64>,
    pub last_course: Option<f64>,
    #[serde(with = "time::serde::iso8601::option")]
    pub last_update: Option<OffsetDateTime>,
    #[serde(with = "time::serde::iso8601::option")]
    pub last_position_time: Option<OffsetDateTime>,
    pub ignition_on: bool,
    pub is_moving: bool,
    pub is_online: bool,
    /// km, monotonic non-decreasing
    pub total_odometer: f64,
    /// km accumulated inside the active trip
    pub trip_odometer: f64,
    pub active_trip_id: Option<i64>,
    /// Position captured at the last ignition on->off edge (towing reference).
    pub anchor_latitude: Option<f64>,
    pub anchor_longitude: Option<f64>,
    #[serde(with = "time::serde::iso8601::option")]
    pub last_ignition_on: Option<OffsetDateTime>,
    #[serde(with = "time::serde::iso8601::option")]
    pub last_ignition_off: Option<OffsetDateTime>,
}

impl DeviceState {
    pub fn empty(device_id: i64) -> Self {
        Self {
            device_id,
            last_latitude: None,
            last_longitude: None,
            last_altitude: None,
            last_speed: None,
            last_course: None,
            last_update: None,
            last_position_time: None,
            ignition_on: false,
            is_moving: false,
            is_online: false,
            total_odometer: 0.0,
            trip_odometer: 0.0,
            active_trip_id: None,
            anchor_latitude: None,
            anchor_longitude: None,
            last_ignition_on: None,
            last_ignition_off: None,
        }
    }
}

/// Contiguous run of motion, derived by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: i64,
    pub device_id: i64,
    #[serde(with = "time::serde::iso8601")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::iso8601::option")]
    pub end_time: Option<OffsetDateTime>,
    pub start_latitude: f64,
    pub start_longitude: f64,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
    pub distance_km: f64,
    pub max_speed: Option<f64>,
    pub avg_speed: Option<f64>,
    pub duration_minutes: Option<i32>,
}

/// Closed set of watchable conditions. The tag selects the evaluator,
/// the payload is that evaluator's parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    Speeding {
        threshold_kmh: f64,
        #[serde(default = "default_speeding_duration")]
        duration_s: u32,
    },
    Idling {
        #[serde(default = "default_idling_duration")]
        duration_s: u32,
    },
    GeofenceEnter {
        geofence_id: i64,
    },
    GeofenceExit {
        geofence_id: i64,
    },
    Offline {
        threshold_hours: f64,
    },
    Towing {
        #[serde(default = "default_towing_threshold")]
        threshold_m: f64,
    },
    LowBattery {
        threshold_v: f64,
        #[serde(default)]
        duration_s: u32,
    },
    HarshBraking {
        threshold_ms2: f64,
    },
    HarshAcceleration {
        threshold_ms2: f64,
    },
    Maintenance {
        next_service_km: f64,
        interval_km: f64,
    },
    Custom {
        name: String,
        expression: String,
        duration_s: Option<u32>,
    },
}

fn default_speeding_duration() -> u32 {
    30
}
fn default_idling_duration() -> u32 {
    300
}
fn default_towing_threshold() -> f64 {
    100.0
}

impl RuleKind {
    /// Stable name used in the alerts table and in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::Speeding { .. } => "speeding",
            RuleKind::Idling { .. } => "idling",
            RuleKind::GeofenceEnter { .. } => "geofence_enter",
            RuleKind::GeofenceExit { .. } => "geofence_exit",
            RuleKind::Offline { .. } => "offline",
            RuleKind::Towing { .. } => "towing",
            RuleKind::LowBattery { .. } => "low_battery",
            RuleKind::HarshBraking { .. } => "harsh_braking",
            RuleKind::HarshAcceleration { .. } => "harsh_acceleration",
            RuleKind::Maintenance { .. } => "maintenance",
            RuleKind::Custom { .. } => "custom",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            RuleKind::Towing { .. }
            | RuleKind::HarshBraking { .. }
            | RuleKind::HarshAcceleration { .. } => Severity::Critical,
            RuleKind::Maintenance { .. } | RuleKind::Custom { .. } => Severity::Info,
            _ => Severity::Warning,
        }
    }
}

/// Weekday/hour window during which a rule may fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Weekday numbers, Monday = 1 .. Sunday = 7.
    pub days: Vec<u8>,
    pub hour_start: u8,
    pub hour_end: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub device_id: i64,
    #[serde(flatten)]
    pub kind: RuleKind,
    pub schedule: Option<Schedule>,
    /// Names of the owning user's notification channels; empty = all.
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// A fired alert event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Option<i64>,
    pub device_id: i64,
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
    pub is_read: bool,
}

impl Alert {
    pub fn new(device_id: i64, kind: &str, severity: Severity, message: String) -> Self {
        Self {
            id: None,
            device_id,
            kind: kind.to_string(),
            severity,
            message,
            latitude: None,
            longitude: None,
            metadata: serde_json::Value::Null,
            created_at: OffsetDateTime::now_utc(),
            is_read: false,
        }
    }

    pub fn at(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Geofence geometry in WGS-84, (latitude, longitude) pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum GeofenceGeometry {
    Polygon {
        ring: Vec<(f64, f64)>,
    },
    Polyline {
        points: Vec<(f64, f64)>,
        #[serde(default = "default_corridor")]
        corridor_m: f64,
    },
}

fn default_corridor() -> f64 {
    50.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geofence {
    pub id: i64,
    pub user_id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub color: String,
    pub geometry: GeofenceGeometry,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Acknowledged | CommandStatus::Failed)
    }
}

/// Queued downstream instruction for a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: i64,
    pub device_id: i64,
    pub command_type: String,
    pub payload: String,
    pub status: CommandStatus,
    pub retries_remaining: i32,
    /// Protocol correlation key stored at send time for ack matching.
    pub command_key: Option<String>,
    #[serde(with = "time::serde::iso8601")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::iso8601::option")]
    pub sent_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::iso8601::option")]
    pub acked_at: Option<OffsetDateTime>,
    pub response: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub name: String,
    /// Dispatcher URL (tgram://, discord://, mailto://, https://...).
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub is_admin: bool,
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannel>,
}
