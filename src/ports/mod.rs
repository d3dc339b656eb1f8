use async_trait::async_trait;
use time::OffsetDateTime;

use crate::domain::{
    Alert, AlertRule, Command, Device, DeviceState, Geofence, NormalizedPosition, RuleKind, User,
};

/// Everything the core persists. One implementation speaks PostgreSQL;
/// tests swap in mocks.
#[async_trait]
pub trait StorageRepository: Send + Sync {
    /// Resolve a device by its wire identifier and protocol name.
    /// Returns None for unknown devices; the gateway rejects those logins.
    async fn device_by_imei(&self, imei: &str, protocol: &str) -> anyhow::Result<Option<Device>>;

    async fn device_by_id(&self, device_id: i64) -> anyhow::Result<Option<Device>>;

    /// All devices, used to warm the in-memory caches at startup.
    async fn load_devices(&self) -> anyhow::Result<Vec<Device>>;

    async fn load_states(&self) -> anyhow::Result<Vec<DeviceState>>;

    /// True if a position for `(device_id, device_time)` is already stored.
    async fn position_exists(
        &self,
        device_id: i64,
        device_time: OffsetDateTime,
    ) -> anyhow::Result<bool>;

    /// Persist the position and the updated device state in one
    /// transaction. Duplicate `(device_id, device_time)` rows are dropped
    /// by the database as a second line of defence.
    async fn store_position(
        &self,
        device_id: i64,
        position: &NormalizedPosition,
        trip_id: Option<i64>,
        state: &DeviceState,
    ) -> anyhow::Result<()>;

    async fn persist_state(&self, state: &DeviceState) -> anyhow::Result<()>;

    /// Create an open trip, returning its id.
    async fn open_trip(
        &self,
        device_id: i64,
        start_time: OffsetDateTime,
        start_latitude: f64,
        start_longitude: f64,
    ) -> anyhow::Result<i64>;

    /// Close an open trip; duration and average speed derive from the
    /// stored start time.
    async fn close_trip(
        &self,
        trip_id: i64,
        end_time: OffsetDateTime,
        end_latitude: f64,
        end_longitude: f64,
        distance_km: f64,
        max_speed: f64,
    ) -> anyhow::Result<()>;

    async fn load_rules(&self) -> anyhow::Result<Vec<AlertRule>>;

    async fn rules_for_device(&self, device_id: i64) -> anyhow::Result<Vec<AlertRule>>;

    /// Rewrite a rule's parameters (maintenance interval bump).
    async fn update_rule_kind(&self, rule_id: i64, kind: &RuleKind) -> anyhow::Result<()>;

    async fn geofence(&self, geofence_id: i64) -> anyhow::Result<Option<Geofence>>;

    async fn store_alert(&self, alert: &Alert) -> anyhow::Result<i64>;

    async fn users_by_ids(&self, user_ids: &[i64]) -> anyhow::Result<Vec<User>>;

    async fn mark_device_offline(&self, device_id: i64) -> anyhow::Result<()>;

    /// Oldest `pending` command for the device, if any.
    async fn next_pending_command(&self, device_id: i64) -> anyhow::Result<Option<Command>>;

    /// Transition to `sent`: stamps `sent_at`, stores the correlation key,
    /// and burns one retry.
    async fn mark_command_sent(
        &self,
        command_id: i64,
        command_key: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn mark_command_acknowledged(
        &self,
        command_id: i64,
        response: &str,
    ) -> anyhow::Result<()>;

    async fn mark_command_failed(&self, command_id: i64) -> anyhow::Result<()>;

    /// Put a timed-out command back in the queue; the retry budget was
    /// already decremented at send time.
    async fn requeue_command(&self, command_id: i64) -> anyhow::Result<()>;

    /// Fail every non-terminal command for a device (device retirement).
    async fn fail_pending_commands(&self, device_id: i64) -> anyhow::Result<()>;
}

/// Cross-process fan-out seam. Topic per user, JSON payloads.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

/// Notification seam. The dispatcher behind it understands multi-channel
/// URLs (tgram://, discord://, mailto://, https://...); the core hands it
/// a rendered message and forgets. Failures are logged, never retried.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        channel_url: &str,
        subject: &str,
        body: &str,
        severity: &str,
    ) -> anyhow::Result<()>;
}
