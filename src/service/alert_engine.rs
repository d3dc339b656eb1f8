use dashmap::DashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    Alert, AlertRule, Device, DeviceState, NormalizedPosition, RuleKind, Schedule,
};
use crate::ports::{AlertDispatcher, StorageRepository};
use crate::service::broadcast_hub::BroadcastHub;
use crate::service::expr::{Context, Expr};
use crate::service::geo;
use crate::state::rule_cache::RuleCache;

/// Per-(device, rule) evaluation state, in-memory only. A restart primes
/// everything to "not firing": transition rules re-prime on their first
/// position, debounce timers restart from the first fresh position.
#[derive(Debug, Default)]
struct RuleState {
    /// Debounce episode start (device time); None while the condition is
    /// clear.
    since: Option<OffsetDateTime>,
    /// One fire per episode.
    fired: bool,
    /// Last observed geofence membership; None means unprimed.
    inside: Option<bool>,
    /// Previous (device time, speed km/h) for the harsh rules.
    prev_motion: Option<(OffsetDateTime, f64)>,
}

/// What a rule evaluation decided to emit.
struct Firing {
    message: String,
    metadata: serde_json::Value,
}

/// Evaluates the rule list for a device on every position and runs the
/// periodic offline check. Debounce state lives here; alerts go to
/// storage, the broadcast hub, and the notification seam.
pub struct AlertEngine {
    storage: Arc<dyn StorageRepository>,
    rules: Arc<RuleCache>,
    dispatcher: Arc<dyn AlertDispatcher>,
    hub: Arc<BroadcastHub>,
    states: DashMap<(i64, i64), RuleState>,
    exprs: DashMap<i64, (String, Option<Expr>)>,
}

impl AlertEngine {
    pub fn new(
        storage: Arc<dyn StorageRepository>,
        rules: Arc<RuleCache>,
        dispatcher: Arc<dyn AlertDispatcher>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            storage,
            rules,
            dispatcher,
            hub,
            states: DashMap::new(),
            exprs: DashMap::new(),
        }
    }

    /// Evaluate every rule for this device against a fresh position.
    /// `state` is the live snapshot the pipeline just wrote.
    #[instrument(skip_all, fields(device_id = device.id))]
    pub async fn process_position(
        &self,
        device: &Device,
        state: &DeviceState,
        position: &NormalizedPosition,
    ) {
        for rule in self.rules.rules_for(device.id) {
            if let Err(err) = self.evaluate_rule(device, state, position, &rule).await {
                error!(rule_id = rule.id, "rule evaluation failed: {err:#}");
            }
        }
    }

    async fn evaluate_rule(
        &self,
        device: &Device,
        state: &DeviceState,
        position: &NormalizedPosition,
        rule: &AlertRule,
    ) -> anyhow::Result<()> {
        // Geofence geometry is fetched before touching rule state so no
        // lock is held across an await.
        let fence = match &rule.kind {
            RuleKind::GeofenceEnter { geofence_id } | RuleKind::GeofenceExit { geofence_id } => {
                let Some(fence) = self.rules.geofence(*geofence_id).await? else {
                    debug!(rule_id = rule.id, "geofence missing or inactive, skipping");
                    return Ok(());
                };
                Some(fence)
            }
            _ => None,
        };

        let firing = {
            let mut entry = self.states.entry((device.id, rule.id)).or_default();
            let st = entry.value_mut();
            match &rule.kind {
                RuleKind::Speeding { threshold_kmh, duration_s } => debounce(
                    st,
                    position.speed_kmh() > *threshold_kmh,
                    *duration_s,
                    position.device_time,
                    || Firing {
                        message: format!(
                            "Speeding: {:.1} km/h (limit {} km/h)",
                            position.speed_kmh(),
                            threshold_kmh
                        ),
                        metadata: serde_json::json!({
                            "speed": position.speed_kmh(),
                            "threshold_kmh": threshold_kmh,
                        }),
                    },
                ),
                RuleKind::Idling { duration_s } => debounce(
                    st,
                    position.ignition == Some(true) && position.speed_kmh() < 3.0,
                    *duration_s,
                    position.device_time,
                    || Firing {
                        message: format!(
                            "Idling: stationary with ignition on for {duration_s} s"
                        ),
                        metadata: serde_json::json!({ "duration_s": duration_s }),
                    },
                ),
                RuleKind::LowBattery { threshold_v, duration_s } => {
                    let voltage = position
                        .sensors
                        .get("battery_voltage")
                        .and_then(serde_json::Value::as_f64);
                    debounce(
                        st,
                        voltage.map(|v| v < *threshold_v).unwrap_or(false),
                        *duration_s,
                        position.device_time,
                        || Firing {
                            message: format!(
                                "Low battery: {:.2} V (threshold {} V)",
                                voltage.unwrap_or(0.0),
                                threshold_v
                            ),
                            metadata: serde_json::json!({
                                "voltage": voltage,
                                "threshold_v": threshold_v,
                            }),
                        },
                    )
                }
                RuleKind::GeofenceEnter { .. } | RuleKind::GeofenceExit { .. } => {
                    match fence.as_ref() {
                        None => None,
                        Some(fence) => {
                            let member = geo::contains(
                                &fence.geometry,
                                position.latitude,
                                position.longitude,
                            );
                            let previous = st.inside.replace(member);
                            let entering = matches!(rule.kind, RuleKind::GeofenceEnter { .. });
                            match previous {
                                // First evaluation primes without firing.
                                None => None,
                                Some(was) if was != member && member == entering => {
                                    Some(Firing {
                                        message: format!(
                                            "Geofence {}: '{}'",
                                            if entering { "entered" } else { "exited" },
                                            fence.name
                                        ),
                                        metadata: serde_json::json!({
                                            "geofence_id": fence.id,
                                            "geofence_name": fence.name,
                                            "event": if entering { "enter" } else { "exit" },
                                        }),
                                    })
                                }
                                Some(_) => None,
                            }
                        }
                    }
                }
                RuleKind::Towing { threshold_m } => {
                    if state.ignition_on {
                        st.fired = false;
                        None
                    } else {
                        match (state.anchor_latitude, state.anchor_longitude) {
                            (Some(anchor_lat), Some(anchor_lon)) => {
                                let distance = geo::distance_m(
                                    anchor_lat,
                                    anchor_lon,
                                    position.latitude,
                                    position.longitude,
                                );
                                if distance > *threshold_m && !st.fired {
                                    st.fired = true;
                                    Some(Firing {
                                        message: format!(
                                            "Towing: moved {distance:.0} m from parked position (limit {threshold_m} m)"
                                        ),
                                        metadata: serde_json::json!({
                                            "distance_m": distance,
                                            "threshold_m": threshold_m,
                                        }),
                                    })
                                } else {
                                    None
                                }
                            }
                            _ => None,
                        }
                    }
                }
                RuleKind::HarshBraking { threshold_ms2 } => harsh(
                    st,
                    position,
                    -*threshold_ms2,
                    "Harsh braking",
                ),
                RuleKind::HarshAcceleration { threshold_ms2 } => {
                    harsh(st, position, *threshold_ms2, "Harsh acceleration")
                }
                RuleKind::Maintenance { next_service_km, .. } => {
                    if state.total_odometer >= *next_service_km && !st.fired {
                        st.fired = true;
                        Some(Firing {
                            message: format!(
                                "Maintenance due: odometer {:.0} km passed {:.0} km",
                                state.total_odometer, next_service_km
                            ),
                            metadata: serde_json::json!({
                                "odometer_km": state.total_odometer,
                                "next_service_km": next_service_km,
                            }),
                        })
                    } else {
                        None
                    }
                }
                RuleKind::Custom { name, expression, duration_s } => {
                    match self.compiled_expr(rule.id, expression) {
                        Some(expr) => {
                            let ctx = Context::from_position(position);
                            debounce(
                                st,
                                expr.matches(&ctx),
                                duration_s.unwrap_or(0),
                                position.device_time,
                                || Firing {
                                    message: format!("Custom alert '{name}' triggered"),
                                    metadata: serde_json::json!({
                                        "rule_name": name,
                                        "expression": expression,
                                    }),
                                },
                            )
                        }
                        // Bad expression: the rule sits out this position.
                        None => None,
                    }
                }
                // Evaluated by the periodic sweep; a fresh position means
                // the device is back, so the episode may fire again later.
                RuleKind::Offline { .. } => {
                    st.fired = false;
                    None
                }
            }
        };

        if let Some(firing) = firing {
            if !schedule_allows(
                rule.schedule.as_ref(),
                device.config.timezone_offset_minutes,
                OffsetDateTime::now_utc(),
            ) {
                debug!(rule_id = rule.id, "firing suppressed by schedule window");
                return Ok(());
            }
            self.fire(device, rule, firing, Some(position)).await?;
        }
        Ok(())
    }

    /// Periodic offline evaluation for one device. Returns true when any
    /// offline rule considers the device past its threshold, so the sweep
    /// can flip `is_online`.
    pub async fn sweep_offline(
        &self,
        device: &Device,
        state: &DeviceState,
        now: OffsetDateTime,
    ) -> bool {
        let mut beyond_threshold = false;
        for rule in self.rules.rules_for(device.id) {
            let RuleKind::Offline { threshold_hours } = &rule.kind else { continue };
            let Some(last_update) = state.last_update else { continue };
            let elapsed_hours = (now - last_update).as_seconds_f64() / 3600.0;
            if elapsed_hours <= *threshold_hours {
                continue;
            }
            beyond_threshold = true;

            let should_fire = {
                let mut entry = self.states.entry((device.id, rule.id)).or_default();
                let st = entry.value_mut();
                if st.fired {
                    false
                } else {
                    st.fired = true;
                    true
                }
            };
            if !should_fire {
                continue;
            }
            if !schedule_allows(
                rule.schedule.as_ref(),
                device.config.timezone_offset_minutes,
                now,
            ) {
                continue;
            }
            let firing = Firing {
                message: format!(
                    "Device offline: no data for {elapsed_hours:.1} h (threshold {threshold_hours} h)"
                ),
                metadata: serde_json::json!({
                    "elapsed_hours": elapsed_hours,
                    "threshold_hours": threshold_hours,
                }),
            };
            if let Err(err) = self.fire(device, &rule, firing, None).await {
                error!(rule_id = rule.id, "offline alert failed: {err:#}");
            }
        }
        beyond_threshold
    }

    /// Maintenance acknowledgement bumps the service threshold by the
    /// configured interval and re-arms the rule.
    pub async fn acknowledge_maintenance(&self, rule: &AlertRule) -> anyhow::Result<()> {
        let RuleKind::Maintenance { next_service_km, interval_km } = &rule.kind else {
            anyhow::bail!("rule {} is not a maintenance rule", rule.id);
        };
        let bumped = RuleKind::Maintenance {
            next_service_km: next_service_km + interval_km,
            interval_km: *interval_km,
        };
        self.storage.update_rule_kind(rule.id, &bumped).await?;
        self.rules.refresh_device(rule.device_id).await?;
        if let Some(mut entry) = self.states.get_mut(&(rule.device_id, rule.id)) {
            entry.value_mut().fired = false;
        }
        info!(rule_id = rule.id, "maintenance acknowledged, threshold bumped");
        Ok(())
    }

    /// Device retirement: forget all in-memory rule state.
    pub fn clear_device(&self, device_id: i64) {
        self.states.retain(|(dev, _), _| *dev != device_id);
    }

    fn compiled_expr(&self, rule_id: i64, expression: &str) -> Option<Expr> {
        if let Some(cached) = self.exprs.get(&rule_id) {
            if cached.0 == expression {
                return cached.1.clone();
            }
        }
        let compiled = match Expr::parse(expression) {
            Ok(expr) => Some(expr),
            Err(err) => {
                warn!(rule_id, %expression, "rejecting custom expression: {err}");
                None
            }
        };
        self.exprs.insert(rule_id, (expression.to_string(), compiled.clone()));
        compiled
    }

    async fn fire(
        &self,
        device: &Device,
        rule: &AlertRule,
        firing: Firing,
        position: Option<&NormalizedPosition>,
    ) -> anyhow::Result<()> {
        let severity = rule.kind.default_severity();
        let mut alert =
            Alert::new(device.id, rule.kind.name(), severity, firing.message.clone())
                .with_metadata(serde_json::json!({
                    "rule_id": rule.id,
                    "details": firing.metadata,
                }));
        if let Some(position) = position {
            alert = alert.at(position.latitude, position.longitude);
        }
        alert.id = Some(self.storage.store_alert(&alert).await?);

        info!(
            device = %device.name,
            kind = rule.kind.name(),
            severity = severity.as_str(),
            "alert fired"
        );
        metrics::counter!("alerts_fired_total", 1, "kind" => rule.kind.name());

        self.hub.publish_alert(device, &alert).await;
        self.notify(device, rule, &alert).await;
        Ok(())
    }

    /// Resolve the rule's channel list against the owning users' channels
    /// and hand off to the notification seam. Failures are logged only.
    async fn notify(&self, device: &Device, rule: &AlertRule, alert: &Alert) {
        let users = match self.storage.users_by_ids(&device.user_ids).await {
            Ok(users) => users,
            Err(err) => {
                error!("loading users for notification failed: {err:#}");
                return;
            }
        };
        let subject = format!("{} - {}", device.name, alert.kind.to_uppercase());
        for user in users {
            for channel in &user.notification_channels {
                if !rule.channels.is_empty() && !rule.channels.contains(&channel.name) {
                    continue;
                }
                if let Err(err) = self
                    .dispatcher
                    .dispatch(&channel.url, &subject, &alert.message, alert.severity.as_str())
                    .await
                {
                    warn!(channel = %channel.name, "notification dispatch failed: {err:#}");
                }
            }
        }
    }
}

/// Shared duration-debounce with episode semantics: the condition must
/// hold continuously for `duration_s` before firing, one fire per episode,
/// and the episode resets when the condition clears.
fn debounce(
    st: &mut RuleState,
    condition: bool,
    duration_s: u32,
    device_time: OffsetDateTime,
    firing: impl FnOnce() -> Firing,
) -> Option<Firing> {
    if !condition {
        st.since = None;
        st.fired = false;
        return None;
    }
    let since = *st.since.get_or_insert(device_time);
    if st.fired {
        return None;
    }
    let elapsed = (device_time - since).whole_seconds();
    if elapsed >= duration_s as i64 {
        st.fired = true;
        return Some(firing());
    }
    None
}

/// Speed delta over consecutive positions, m/s^2. Positive threshold
/// catches acceleration, negative braking. Needs two positions less than
/// 30 s apart.
fn harsh(
    st: &mut RuleState,
    position: &NormalizedPosition,
    threshold_ms2: f64,
    label: &str,
) -> Option<Firing> {
    let current = (position.device_time, position.speed_kmh());
    let previous = st.prev_motion.replace(current);
    let (prev_time, prev_speed) = previous?;
    let dt = (position.device_time - prev_time).as_seconds_f64();
    if dt <= 0.0 || dt >= 30.0 {
        st.fired = false;
        return None;
    }
    let accel = (position.speed_kmh() - prev_speed) / 3.6 / dt;
    let exceeded = if threshold_ms2 < 0.0 { accel <= threshold_ms2 } else { accel >= threshold_ms2 };
    if !exceeded {
        st.fired = false;
        return None;
    }
    if st.fired {
        return None;
    }
    st.fired = true;
    Some(Firing {
        message: format!("{label}: {:.1} m/s^2", accel.abs()),
        metadata: serde_json::json!({
            "acceleration_ms2": accel,
            "threshold_ms2": threshold_ms2,
        }),
    })
}

/// Schedule gate on device-local time (fixed UTC offset, UTC when unset).
fn schedule_allows(
    schedule: Option<&Schedule>,
    offset_minutes: Option<i32>,
    now: OffsetDateTime,
) -> bool {
    let Some(schedule) = schedule else { return true };
    let offset = offset_minutes.unwrap_or(0);
    let local = now + time::Duration::minutes(offset as i64);
    let weekday = local.weekday().number_from_monday();
    if !schedule.days.is_empty() && !schedule.days.contains(&weekday) {
        return false;
    }
    let hour = local.hour();
    schedule.hour_start <= hour && hour <= schedule.hour_end
}
