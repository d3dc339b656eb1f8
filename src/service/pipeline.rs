use dashmap::DashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, instrument, warn};

use crate::domain::{Device, DeviceState, NormalizedPosition};
use crate::ports::StorageRepository;
use crate::service::alert_engine::AlertEngine;
use crate::service::broadcast_hub::BroadcastHub;
use crate::service::geo;
use crate::state::live_state::LiveStateStore;

/// Positions timestamped outside this window are clock drift and dropped.
const MAX_FUTURE: Duration = Duration::days(1);
const MAX_PAST: Duration = Duration::days(30);

/// Odometer window: no accumulation against a previous position older
/// than this.
const ODOMETER_WINDOW: Duration = Duration::hours(12);

/// A jump beyond this distance in under this time is a GPS glitch.
const JUMP_KM: f64 = 500.0;
const JUMP_WINDOW: Duration = Duration::minutes(5);

/// Sustained-movement trip opening when ignition is unknown.
const MOTION_SPEED_KMH: f64 = 5.0;
const MOTION_SUSTAIN: Duration = Duration::seconds(60);

/// Trip closes after ignition off plus this much sustained standstill.
const STOP_SUSTAIN: Duration = Duration::seconds(60);
const STANDSTILL_KMH: f64 = 0.5;

/// Trip closes when no position arrives for this long.
pub const IDLE_GAP: Duration = Duration::minutes(15);

/// Per-trip derivation scratch; in-memory only, rebuilt after restart.
#[derive(Debug, Default, Clone)]
struct TripScratch {
    motion_since: Option<OffsetDateTime>,
    stop_since: Option<OffsetDateTime>,
    trip_max_speed: f64,
}

/// The per-position pipeline: clock sanity, de-duplication, odometer
/// accumulation, trip segmentation, towing anchor, transactional persist,
/// then hand-off to the alert engine (synchronous) and the broadcast hub
/// (asynchronous).
pub struct PositionPipeline {
    storage: Arc<dyn StorageRepository>,
    live: Arc<LiveStateStore>,
    engine: Arc<AlertEngine>,
    hub: Arc<BroadcastHub>,
    scratch: DashMap<i64, TripScratch>,
    /// Serialises ingestion per device; positions are processed in
    /// arrival order.
    locks: DashMap<i64, Arc<tokio::sync::Mutex<()>>>,
}

impl PositionPipeline {
    pub fn new(
        storage: Arc<dyn StorageRepository>,
        live: Arc<LiveStateStore>,
        engine: Arc<AlertEngine>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            storage,
            live,
            engine,
            hub,
            scratch: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Returns true when the position was stored and handed off, false
    /// when it was rejected or de-duplicated.
    #[instrument(skip_all, fields(device_id = device.id, imei = %position.imei))]
    pub async fn ingest(
        &self,
        device: &Device,
        position: NormalizedPosition,
    ) -> anyhow::Result<bool> {
        let lock = self
            .locks
            .entry(device.id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let start = std::time::Instant::now();
        let now = OffsetDateTime::now_utc();

        // 1. Clock sanity.
        if position.device_time > now + MAX_FUTURE || position.device_time < now - MAX_PAST {
            warn!(device_time = %position.device_time, "rejecting position with implausible clock");
            metrics::counter!("positions_rejected_total", 1, "reason" => "clock");
            return Ok(false);
        }

        // 2. De-duplication.
        if self.storage.position_exists(device.id, position.device_time).await? {
            debug!("duplicate position dropped");
            metrics::counter!("positions_rejected_total", 1, "reason" => "duplicate");
            return Ok(false);
        }

        let previous = self.live.snapshot(device.id);
        let mut scratch = self.scratch.entry(device.id).or_default().clone();

        // 3. Odometer accumulation.
        let mut distance_km = 0.0;
        if let (Some(last_lat), Some(last_lon), Some(last_time)) =
            (previous.last_latitude, previous.last_longitude, previous.last_position_time)
        {
            let elapsed = position.device_time - last_time;
            if elapsed.abs() <= ODOMETER_WINDOW {
                let hop =
                    geo::haversine_km(last_lat, last_lon, position.latitude, position.longitude);
                if hop > JUMP_KM && elapsed.abs() < JUMP_WINDOW {
                    warn!(
                        hop_km = hop,
                        elapsed_s = elapsed.whole_seconds(),
                        "GPS jump detected, odometer frozen for this hop"
                    );
                    metrics::counter!("gps_jumps_total", 1);
                } else {
                    distance_km = hop;
                }
            }
        }

        // 4. Trip segmentation. An idle gap first closes any open trip at
        // the previous position, so the current one can start fresh.
        let mut active_trip_id = previous.active_trip_id;
        let mut trip_odometer = previous.trip_odometer;
        if let (Some(trip_id), Some(last_time)) = (active_trip_id, previous.last_position_time) {
            if position.device_time - last_time > IDLE_GAP {
                self.close_trip(trip_id, &previous, &scratch).await?;
                active_trip_id = None;
                trip_odometer = 0.0;
                scratch = TripScratch::default();
            }
        }

        let ignition = position.ignition.unwrap_or(previous.ignition_on);
        let speed = position.speed_kmh();

        match active_trip_id {
            None => {
                let open_now = if position.ignition == Some(true) && speed > 0.0 {
                    true
                } else if position.ignition.is_none() && speed > MOTION_SPEED_KMH {
                    let since = *scratch.motion_since.get_or_insert(position.device_time);
                    position.device_time - since >= MOTION_SUSTAIN
                } else {
                    scratch.motion_since = None;
                    false
                };
                if open_now {
                    let trip_id = self
                        .storage
                        .open_trip(
                            device.id,
                            position.device_time,
                            position.latitude,
                            position.longitude,
                        )
                        .await?;
                    debug!(trip_id, "trip opened");
                    active_trip_id = Some(trip_id);
                    trip_odometer = 0.0;
                    scratch = TripScratch::default();
                }
            }
            Some(trip_id) => {
                trip_odometer += distance_km;
                scratch.trip_max_speed = scratch.trip_max_speed.max(speed);
                if !ignition && speed < STANDSTILL_KMH {
                    let since = *scratch.stop_since.get_or_insert(position.device_time);
                    if position.device_time - since >= STOP_SUSTAIN {
                        let end = DeviceState {
                            last_latitude: Some(position.latitude),
                            last_longitude: Some(position.longitude),
                            last_position_time: Some(position.device_time),
                            trip_odometer,
                            ..previous.clone()
                        };
                        self.close_trip(trip_id, &end, &scratch).await?;
                        active_trip_id = None;
                        trip_odometer = 0.0;
                        scratch = TripScratch::default();
                    }
                } else {
                    scratch.stop_since = None;
                }
            }
        }

        // 5. Towing anchor on the ignition on -> off edge.
        let mut anchor_latitude = previous.anchor_latitude;
        let mut anchor_longitude = previous.anchor_longitude;
        let mut last_ignition_on = previous.last_ignition_on;
        let mut last_ignition_off = previous.last_ignition_off;
        if previous.ignition_on && position.ignition == Some(false) {
            anchor_latitude = Some(position.latitude);
            anchor_longitude = Some(position.longitude);
            last_ignition_off = Some(position.device_time);
        } else if !previous.ignition_on && position.ignition == Some(true) {
            anchor_latitude = None;
            anchor_longitude = None;
            last_ignition_on = Some(position.device_time);
        }

        let state = DeviceState {
            device_id: device.id,
            last_latitude: Some(position.latitude),
            last_longitude: Some(position.longitude),
            last_altitude: position.altitude.or(previous.last_altitude),
            last_speed: Some(speed),
            last_course: position.course.or(previous.last_course),
            last_update: Some(now),
            last_position_time: Some(position.device_time),
            ignition_on: ignition,
            is_moving: speed > 1.0,
            is_online: true,
            // Odometer is monotonic: glitches contribute zero, never less.
            total_odometer: previous.total_odometer + distance_km,
            trip_odometer,
            active_trip_id,
            anchor_latitude,
            anchor_longitude,
            last_ignition_on,
            last_ignition_off,
        };

        // 6. Persist position and state in one transaction. Failure aborts
        // both hand-offs.
        self.storage.store_position(device.id, &position, active_trip_id, &state).await?;
        self.live.update(device.id, |s| *s = state.clone());
        self.scratch.insert(device.id, scratch);

        metrics::counter!("positions_stored_total", 1, "protocol" => device.protocol.clone());
        metrics::histogram!(
            "pipeline_ingest_duration_seconds",
            start.elapsed().as_secs_f64()
        );

        // 7a. Alert engine, synchronous.
        self.engine.process_position(device, &state, &position).await;

        // 7b. Broadcast hub, fire-and-forget.
        let hub = self.hub.clone();
        let device = device.clone();
        let payload = live_payload(&state, &position);
        tokio::spawn(async move {
            hub.publish_position(&device, payload).await;
        });

        Ok(true)
    }

    /// Close `trip_id` using the given end state. Used by the pipeline on
    /// segmentation boundaries and by the sweep for stale trips.
    async fn close_trip(
        &self,
        trip_id: i64,
        end: &DeviceState,
        scratch: &TripScratch,
    ) -> anyhow::Result<()> {
        let end_time = end.last_position_time.unwrap_or_else(OffsetDateTime::now_utc);
        self.storage
            .close_trip(
                trip_id,
                end_time,
                end.last_latitude.unwrap_or_default(),
                end.last_longitude.unwrap_or_default(),
                end.trip_odometer,
                scratch.trip_max_speed,
            )
            .await?;
        debug!(trip_id, distance_km = end.trip_odometer, "trip closed");
        metrics::counter!("trips_closed_total", 1);
        Ok(())
    }

    /// Stale-trip closure, called by the periodic sweep: any open trip
    /// whose device has been silent past the idle gap ends at its last
    /// observed position.
    pub async fn close_stale_trips(&self, now: OffsetDateTime) {
        for state in self.live.all() {
            let (Some(trip_id), Some(last_time)) = (state.active_trip_id, state.last_position_time)
            else {
                continue;
            };
            if now - last_time <= IDLE_GAP {
                continue;
            }
            let scratch = self.scratch.get(&state.device_id).map(|s| s.clone()).unwrap_or_default();
            if let Err(err) = self.close_trip(trip_id, &state, &scratch).await {
                warn!(trip_id, "stale trip closure failed: {err:#}");
                continue;
            }
            let updated = self.live.update(state.device_id, |s| {
                s.active_trip_id = None;
                s.trip_odometer = 0.0;
            });
            self.scratch.remove(&state.device_id);
            if let Err(err) = self.storage.persist_state(&updated).await {
                warn!(device_id = state.device_id, "state persist failed: {err:#}");
            }
        }
    }

    /// Device retirement: drop per-device pipeline state.
    pub fn clear_device(&self, device_id: i64) {
        self.scratch.remove(&device_id);
        self.locks.remove(&device_id);
        self.live.remove(device_id);
    }
}

/// Dashboard payload for a live position update.
fn live_payload(state: &DeviceState, position: &NormalizedPosition) -> serde_json::Value {
    serde_json::json!({
        "latitude": position.latitude,
        "longitude": position.longitude,
        "altitude": position.altitude,
        "speed": position.speed_kmh(),
        "course": position.course,
        "satellites": position.satellites,
        "ignition": state.ignition_on,
        "is_moving": state.is_moving,
        "is_online": state.is_online,
        "total_odometer": state.total_odometer,
        "trip_odometer": state.trip_odometer,
        "trip_id": state.active_trip_id,
        "device_time": position.device_time.unix_timestamp(),
        "sensors": position.sensors,
    })
}
