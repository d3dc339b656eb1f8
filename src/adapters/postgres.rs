use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

use crate::domain::{
    Alert, AlertRule, Command, CommandStatus, Device, DeviceConfig, DeviceState, Geofence,
    NormalizedPosition, NotificationChannel, RuleKind, Schedule, User,
};
use crate::ports::StorageRepository;

/// PostgreSQL storage. Raw SQL, `ON CONFLICT DO NOTHING` de-duplication
/// on positions, transactional position+state writes.
pub struct PgStorage {
    pool: PgPool,
}

/// Transient failures get a short bounded backoff before giving up.
const RETRY_DELAYS: [Duration; 3] =
    [Duration::from_millis(100), Duration::from_millis(400), Duration::from_millis(1600)];

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables on startup; every statement is idempotent.
    pub async fn init_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("database schema ready");
        Ok(())
    }

    fn device_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<Device> {
        let config: serde_json::Value = row.try_get("config")?;
        let user_ids: Option<Vec<i64>> = row.try_get("user_ids")?;
        Ok(Device {
            id: row.try_get("id")?,
            imei: row.try_get("imei")?,
            name: row.try_get("name")?,
            protocol: row.try_get("protocol")?,
            vehicle_type: row.try_get("vehicle_type")?,
            license_plate: row.try_get("license_plate")?,
            vin: row.try_get("vin")?,
            config: serde_json::from_value::<DeviceConfig>(config).unwrap_or_default(),
            is_active: row.try_get("is_active")?,
            user_ids: user_ids.unwrap_or_default(),
        })
    }

    fn state_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<DeviceState> {
        Ok(DeviceState {
            device_id: row.try_get("device_id")?,
            last_latitude: row.try_get("last_latitude")?,
            last_longitude: row.try_get("last_longitude")?,
            last_altitude: row.try_get("last_altitude")?,
            last_speed: row.try_get("last_speed")?,
            last_course: row.try_get("last_course")?,
            last_update: row.try_get("last_update")?,
            last_position_time: row.try_get("last_position_time")?,
            ignition_on: row.try_get("ignition_on")?,
            is_moving: row.try_get("is_moving")?,
            is_online: row.try_get("is_online")?,
            total_odometer: row.try_get("total_odometer")?,
            trip_odometer: row.try_get("trip_odometer")?,
            active_trip_id: row.try_get("active_trip_id")?,
            anchor_latitude: row.try_get("anchor_latitude")?,
            anchor_longitude: row.try_get("anchor_longitude")?,
            last_ignition_on: row.try_get("last_ignition_on")?,
            last_ignition_off: row.try_get("last_ignition_off")?,
        })
    }

    fn rule_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<AlertRule> {
        let kind: String = row.try_get("kind")?;
        let params: serde_json::Value = row.try_get("params")?;
        let mut tagged = match params {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        tagged.insert("kind".into(), serde_json::Value::String(kind));
        let kind: RuleKind = serde_json::from_value(serde_json::Value::Object(tagged))?;

        let schedule: Option<serde_json::Value> = row.try_get("schedule")?;
        let schedule =
            schedule.and_then(|s| serde_json::from_value::<Schedule>(s).ok());
        let channels: Option<serde_json::Value> = row.try_get("channels")?;
        let channels = channels
            .and_then(|c| serde_json::from_value::<Vec<String>>(c).ok())
            .unwrap_or_default();

        Ok(AlertRule {
            id: row.try_get("id")?,
            device_id: row.try_get("device_id")?,
            kind,
            schedule,
            channels,
        })
    }

    fn command_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<Command> {
        let status: String = row.try_get("status")?;
        let status = match status.as_str() {
            "pending" => CommandStatus::Pending,
            "sent" => CommandStatus::Sent,
            "acknowledged" => CommandStatus::Acknowledged,
            _ => CommandStatus::Failed,
        };
        Ok(Command {
            id: row.try_get("id")?,
            device_id: row.try_get("device_id")?,
            command_type: row.try_get("command_type")?,
            payload: row.try_get("payload")?,
            status,
            retries_remaining: row.try_get("retries_remaining")?,
            command_key: row.try_get("command_key")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
            acked_at: row.try_get("acked_at")?,
            response: row.try_get("response")?,
        })
    }
}

const SELECT_DEVICE: &str = r#"
    SELECT d.id, d.imei, d.name, d.protocol, d.vehicle_type, d.license_plate,
           d.vin, d.config, d.is_active,
           (SELECT array_agg(a.user_id) FROM user_device_access a
             WHERE a.device_id = d.id) AS user_ids
    FROM devices d
"#;

#[async_trait]
impl StorageRepository for PgStorage {
    async fn device_by_imei(&self, imei: &str, protocol: &str) -> anyhow::Result<Option<Device>> {
        let row = sqlx::query(&format!("{SELECT_DEVICE} WHERE d.imei = $1 AND d.protocol = $2"))
            .bind(imei)
            .bind(protocol)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::device_from_row).transpose()
    }

    async fn device_by_id(&self, device_id: i64) -> anyhow::Result<Option<Device>> {
        let row = sqlx::query(&format!("{SELECT_DEVICE} WHERE d.id = $1"))
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::device_from_row).transpose()
    }

    async fn load_devices(&self) -> anyhow::Result<Vec<Device>> {
        let rows = sqlx::query(SELECT_DEVICE).fetch_all(&self.pool).await?;
        rows.iter().map(Self::device_from_row).collect()
    }

    async fn load_states(&self) -> anyhow::Result<Vec<DeviceState>> {
        let rows = sqlx::query("SELECT * FROM device_states").fetch_all(&self.pool).await?;
        rows.iter().map(Self::state_from_row).collect()
    }

    async fn position_exists(
        &self,
        device_id: i64,
        device_time: OffsetDateTime,
    ) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM positions WHERE device_id = $1 AND device_time = $2",
        )
        .bind(device_id)
        .bind(device_time)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    #[instrument(skip(self, position, state))]
    async fn store_position(
        &self,
        device_id: i64,
        position: &NormalizedPosition,
        trip_id: Option<i64>,
        state: &DeviceState,
    ) -> anyhow::Result<()> {
        let mut last_err: Option<anyhow::Error> = None;
        for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
            match self.try_store_position(device_id, position, trip_id, state).await {
                Ok(()) => return Ok(()),
                Err(err) if is_transient(&err) => {
                    warn!(attempt, "transient storage failure, backing off: {err}");
                    metrics::counter!("storage_retries_total", 1);
                    last_err = Some(err.into());
                    tokio::time::sleep(*delay).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("position store failed")))
    }

    async fn persist_state(&self, state: &DeviceState) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_state(&mut tx, state).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn open_trip(
        &self,
        device_id: i64,
        start_time: OffsetDateTime,
        start_latitude: f64,
        start_longitude: f64,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO trips (device_id, start_time, start_latitude, start_longitude, distance_km)
            VALUES ($1, $2, $3, $4, 0)
            RETURNING id
            "#,
        )
        .bind(device_id)
        .bind(start_time)
        .bind(start_latitude)
        .bind(start_longitude)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn close_trip(
        &self,
        trip_id: i64,
        end_time: OffsetDateTime,
        end_latitude: f64,
        end_longitude: f64,
        distance_km: f64,
        max_speed: f64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE trips SET
                end_time = $2,
                end_latitude = $3,
                end_longitude = $4,
                distance_km = $5,
                max_speed = $6,
                duration_minutes = GREATEST(0, EXTRACT(EPOCH FROM ($2 - start_time)) / 60)::int,
                avg_speed = CASE
                    WHEN $2 > start_time
                    THEN $5 / (EXTRACT(EPOCH FROM ($2 - start_time)) / 3600.0)
                    ELSE NULL
                END
            WHERE id = $1 AND end_time IS NULL
            "#,
        )
        .bind(trip_id)
        .bind(end_time)
        .bind(end_latitude)
        .bind(end_longitude)
        .bind(distance_km)
        .bind(max_speed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_rules(&self) -> anyhow::Result<Vec<AlertRule>> {
        let rows = sqlx::query("SELECT * FROM alert_rules").fetch_all(&self.pool).await?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::rule_from_row(row) {
                Ok(rule) => rules.push(rule),
                Err(err) => warn!("skipping unreadable alert rule: {err:#}"),
            }
        }
        Ok(rules)
    }

    async fn rules_for_device(&self, device_id: i64) -> anyhow::Result<Vec<AlertRule>> {
        let rows = sqlx::query("SELECT * FROM alert_rules WHERE device_id = $1")
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::rule_from_row).collect()
    }

    async fn update_rule_kind(&self, rule_id: i64, kind: &RuleKind) -> anyhow::Result<()> {
        let mut params = serde_json::to_value(kind)?;
        if let serde_json::Value::Object(map) = &mut params {
            map.remove("kind");
        }
        sqlx::query("UPDATE alert_rules SET kind = $2, params = $3 WHERE id = $1")
            .bind(rule_id)
            .bind(kind.name())
            .bind(params)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn geofence(&self, geofence_id: i64) -> anyhow::Result<Option<Geofence>> {
        let row = sqlx::query("SELECT * FROM geofences WHERE id = $1")
            .bind(geofence_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let geometry: serde_json::Value = row.try_get("geometry")?;
        Ok(Some(Geofence {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            color: row.try_get("color")?,
            geometry: serde_json::from_value(geometry)?,
            is_active: row.try_get("is_active")?,
        }))
    }

    #[instrument(skip(self, alert), fields(device_id = alert.device_id, kind = %alert.kind))]
    async fn store_alert(&self, alert: &Alert) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO alerts (device_id, kind, severity, message, latitude, longitude,
                                metadata, created_at, is_read)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false)
            RETURNING id
            "#,
        )
        .bind(alert.device_id)
        .bind(&alert.kind)
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(alert.latitude)
        .bind(alert.longitude)
        .bind(&alert.metadata)
        .bind(alert.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn users_by_ids(&self, user_ids: &[i64]) -> anyhow::Result<Vec<User>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM users WHERE id = ANY($1)")
            .bind(user_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let channels: serde_json::Value = row.try_get("notification_channels")?;
                Ok(User {
                    id: row.try_get("id")?,
                    username: row.try_get("username")?,
                    password_hash: row.try_get("password_hash")?,
                    is_admin: row.try_get("is_admin")?,
                    notification_channels: serde_json::from_value::<Vec<NotificationChannel>>(
                        channels,
                    )
                    .unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn mark_device_offline(&self, device_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE device_states SET is_online = false WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn next_pending_command(&self, device_id: i64) -> anyhow::Result<Option<Command>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM commands
            WHERE device_id = $1 AND status = 'pending'
            ORDER BY created_at, id
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::command_from_row).transpose()
    }

    async fn mark_command_sent(
        &self,
        command_id: i64,
        command_key: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE commands
            SET status = 'sent', sent_at = now(), command_key = $2,
                retries_remaining = retries_remaining - 1
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(command_id)
        .bind(command_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_command_acknowledged(
        &self,
        command_id: i64,
        response: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE commands
            SET status = 'acknowledged', acked_at = now(), response = $2
            WHERE id = $1 AND status = 'sent'
            "#,
        )
        .bind(command_id)
        .bind(response)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_command_failed(&self, command_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE commands SET status = 'failed'
            WHERE id = $1 AND status IN ('pending', 'sent')
            "#,
        )
        .bind(command_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue_command(&self, command_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE commands SET status = 'pending', command_key = NULL
            WHERE id = $1 AND status = 'sent'
            "#,
        )
        .bind(command_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_pending_commands(&self, device_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE commands SET status = 'failed'
            WHERE device_id = $1 AND status IN ('pending', 'sent')
            "#,
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl PgStorage {
    async fn try_store_position(
        &self,
        device_id: i64,
        position: &NormalizedPosition,
        trip_id: Option<i64>,
        state: &DeviceState,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            INSERT INTO positions (device_id, trip_id, device_time, server_time, latitude,
                                   longitude, altitude, speed, course, satellites, valid,
                                   ignition, sensors)
            VALUES ($1, $2, $3, now(), $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (device_id, device_time) DO NOTHING
            "#,
        )
        .bind(device_id)
        .bind(trip_id)
        .bind(position.device_time)
        .bind(position.latitude)
        .bind(position.longitude)
        .bind(position.altitude)
        .bind(position.speed)
        .bind(position.course)
        .bind(position.satellites)
        .bind(position.valid)
        .bind(position.ignition)
        .bind(serde_json::to_value(&position.sensors).unwrap_or(serde_json::Value::Null))
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            warn!(device_id, "duplicate position hit the database constraint");
        }
        upsert_state(&mut tx, state).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_state(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    state: &DeviceState,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO device_states (device_id, last_latitude, last_longitude, last_altitude,
                                   last_speed, last_course, last_update, last_position_time,
                                   ignition_on, is_moving, is_online, total_odometer,
                                   trip_odometer, active_trip_id, anchor_latitude,
                                   anchor_longitude, last_ignition_on, last_ignition_off)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT (device_id) DO UPDATE SET
            last_latitude = EXCLUDED.last_latitude,
            last_longitude = EXCLUDED.last_longitude,
            last_altitude = EXCLUDED.last_altitude,
            last_speed = EXCLUDED.last_speed,
            last_course = EXCLUDED.last_course,
            last_update = EXCLUDED.last_update,
            last_position_time = EXCLUDED.last_position_time,
            ignition_on = EXCLUDED.ignition_on,
            is_moving = EXCLUDED.is_moving,
            is_online = EXCLUDED.is_online,
            total_odometer = GREATEST(device_states.total_odometer, EXCLUDED.total_odometer),
            trip_odometer = EXCLUDED.trip_odometer,
            active_trip_id = EXCLUDED.active_trip_id,
            anchor_latitude = EXCLUDED.anchor_latitude,
            anchor_longitude = EXCLUDED.anchor_longitude,
            last_ignition_on = EXCLUDED.last_ignition_on,
            last_ignition_off = EXCLUDED.last_ignition_off
        "#,
    )
    .bind(state.device_id)
    .bind(state.last_latitude)
    .bind(state.last_longitude)
    .bind(state.last_altitude)
    .bind(state.last_speed)
    .bind(state.last_course)
    .bind(state.last_update)
    .bind(state.last_position_time)
    .bind(state.ignition_on)
    .bind(state.is_moving)
    .bind(state.is_online)
    .bind(state.total_odometer)
    .bind(state.trip_odometer)
    .bind(state.active_trip_id)
    .bind(state.anchor_latitude)
    .bind(state.anchor_longitude)
    .bind(state.last_ignition_on)
    .bind(state.last_ignition_off)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Logical schema; the spatial index on positions backs geofence and
/// containment queries.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        is_admin BOOLEAN NOT NULL DEFAULT false,
        notification_channels JSONB NOT NULL DEFAULT '[]',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS devices (
        id BIGSERIAL PRIMARY KEY,
        imei TEXT NOT NULL,
        name TEXT NOT NULL,
        protocol TEXT NOT NULL,
        vehicle_type TEXT,
        license_plate TEXT,
        vin TEXT,
        config JSONB NOT NULL DEFAULT '{}',
        is_active BOOLEAN NOT NULL DEFAULT true,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (imei, protocol)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS user_device_access (
        user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        device_id BIGINT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        PRIMARY KEY (user_id, device_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS trips (
        id BIGSERIAL PRIMARY KEY,
        device_id BIGINT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ,
        start_latitude DOUBLE PRECISION NOT NULL,
        start_longitude DOUBLE PRECISION NOT NULL,
        end_latitude DOUBLE PRECISION,
        end_longitude DOUBLE PRECISION,
        distance_km DOUBLE PRECISION NOT NULL DEFAULT 0,
        max_speed DOUBLE PRECISION,
        avg_speed DOUBLE PRECISION,
        duration_minutes INTEGER
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_trips_device_start ON trips (device_id, start_time)"#,
    r#"CREATE TABLE IF NOT EXISTS positions (
        id BIGSERIAL PRIMARY KEY,
        device_id BIGINT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        trip_id BIGINT REFERENCES trips(id) ON DELETE SET NULL,
        device_time TIMESTAMPTZ NOT NULL,
        server_time TIMESTAMPTZ NOT NULL DEFAULT now(),
        latitude DOUBLE PRECISION NOT NULL,
        longitude DOUBLE PRECISION NOT NULL,
        altitude DOUBLE PRECISION,
        speed DOUBLE PRECISION,
        course DOUBLE PRECISION,
        satellites INTEGER,
        valid BOOLEAN NOT NULL DEFAULT true,
        ignition BOOLEAN,
        sensors JSONB,
        UNIQUE (device_id, device_time)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_positions_device_time
        ON positions (device_id, device_time)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_positions_latlng ON positions (latitude, longitude)"#,
    r#"CREATE TABLE IF NOT EXISTS device_states (
        device_id BIGINT PRIMARY KEY REFERENCES devices(id) ON DELETE CASCADE,
        last_latitude DOUBLE PRECISION,
        last_longitude DOUBLE PRECISION,
        last_altitude DOUBLE PRECISION,
        last_speed DOUBLE PRECISION,
        last_course DOUBLE PRECISION,
        last_update TIMESTAMPTZ,
        last_position_time TIMESTAMPTZ,
        ignition_on BOOLEAN NOT NULL DEFAULT false,
        is_moving BOOLEAN NOT NULL DEFAULT false,
        is_online BOOLEAN NOT NULL DEFAULT false,
        total_odometer DOUBLE PRECISION NOT NULL DEFAULT 0,
        trip_odometer DOUBLE PRECISION NOT NULL DEFAULT 0,
        active_trip_id BIGINT,
        anchor_latitude DOUBLE PRECISION,
        anchor_longitude DOUBLE PRECISION,
        last_ignition_on TIMESTAMPTZ,
        last_ignition_off TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE IF NOT EXISTS alert_rules (
        id BIGSERIAL PRIMARY KEY,
        device_id BIGINT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        params JSONB NOT NULL DEFAULT '{}',
        schedule JSONB,
        channels JSONB NOT NULL DEFAULT '[]'
    )"#,
    r#"CREATE TABLE IF NOT EXISTS alerts (
        id BIGSERIAL PRIMARY KEY,
        device_id BIGINT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        severity TEXT NOT NULL,
        message TEXT NOT NULL,
        latitude DOUBLE PRECISION,
        longitude DOUBLE PRECISION,
        metadata JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        is_read BOOLEAN NOT NULL DEFAULT false,
        read_at TIMESTAMPTZ
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_alerts_device_time ON alerts (device_id, created_at)"#,
    r#"CREATE TABLE IF NOT EXISTS geofences (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        description TEXT,
        color TEXT NOT NULL DEFAULT '#3388ff',
        geometry JSONB NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT true
    )"#,
    r#"CREATE TABLE IF NOT EXISTS commands (
        id BIGSERIAL PRIMARY KEY,
        device_id BIGINT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
        command_type TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending',
        retries_remaining INTEGER NOT NULL DEFAULT 3,
        command_key TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        sent_at TIMESTAMPTZ,
        acked_at TIMESTAMPTZ,
        response TEXT
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_commands_device_status ON commands (device_id, status)"#,
    r#"CREATE TABLE IF NOT EXISTS push_subscriptions (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        endpoint TEXT NOT NULL,
        keys JSONB NOT NULL DEFAULT '{}'
    )"#,
];
