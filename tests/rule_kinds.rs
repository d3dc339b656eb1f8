//! Rule-kind behaviors beyond the headline scenarios: custom expressions,
//! low battery debounce, harsh braking, maintenance acknowledgement, and
//! the schedule gate.

mod common;

use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use common::{test_device, MockDispatcher, MockStorage};
use fleetgate::domain::{AlertRule, NormalizedPosition, RuleKind, Schedule};
use fleetgate::ports::{AlertDispatcher, StorageRepository};
use fleetgate::service::alert_engine::AlertEngine;
use fleetgate::service::broadcast_hub::BroadcastHub;
use fleetgate::service::pipeline::PositionPipeline;
use fleetgate::state::live_state::LiveStateStore;
use fleetgate::state::rule_cache::RuleCache;

struct Core {
    storage: Arc<MockStorage>,
    rules: Arc<RuleCache>,
    engine: Arc<AlertEngine>,
    pipeline: Arc<PositionPipeline>,
}

async fn build_core(storage: Arc<MockStorage>) -> Core {
    let storage_port: Arc<dyn StorageRepository> = storage.clone();
    let rules = Arc::new(RuleCache::new(storage_port.clone()));
    rules.load_all().await.unwrap();
    let dispatcher: Arc<dyn AlertDispatcher> = Arc::new(MockDispatcher::default());
    let hub = Arc::new(BroadcastHub::new(None));
    let live = Arc::new(LiveStateStore::new());
    let engine = Arc::new(AlertEngine::new(
        storage_port.clone(),
        rules.clone(),
        dispatcher,
        hub.clone(),
    ));
    let pipeline =
        Arc::new(PositionPipeline::new(storage_port, live, engine.clone(), hub));
    Core { storage, rules, engine, pipeline }
}

fn rule(id: i64, kind: RuleKind) -> AlertRule {
    AlertRule { id, device_id: 1, kind, schedule: None, channels: vec![] }
}

fn position(t: OffsetDateTime, speed: f64) -> NormalizedPosition {
    let mut p = NormalizedPosition::new("867440069999999", t, 10.0, 20.0);
    p.speed = Some(speed);
    p
}

#[tokio::test]
async fn custom_expression_fires_per_episode_with_duration() {
    let storage = Arc::new(MockStorage::new());
    let device = test_device(1, "teltonika", "867440069999999");
    storage.devices.lock().unwrap().push(device.clone());
    storage.rules.lock().unwrap().push(rule(
        1,
        RuleKind::Custom {
            name: "cold engine push".into(),
            expression: "speed > 40 and coolant_temp < 50".into(),
            duration_s: Some(20),
        },
    ));
    let core = build_core(storage).await;

    let base = OffsetDateTime::now_utc() - Duration::hours(1);
    for (offset, speed, coolant) in
        [(0i64, 60.0, 30.0), (10, 62.0, 35.0), (21, 64.0, 40.0), (30, 65.0, 42.0)]
    {
        let mut p = position(base + Duration::seconds(offset), speed);
        p.sensors.insert("coolant_temp".into(), serde_json::json!(coolant));
        core.pipeline.ingest(&device, p).await.unwrap();
    }
    assert_eq!(core.storage.alert_count("custom"), 1, "held 20 s, fired once");

    // Engine warms up: condition clears and the episode resets.
    let mut p = position(base + Duration::seconds(40), 66.0);
    p.sensors.insert("coolant_temp".into(), serde_json::json!(70.0));
    core.pipeline.ingest(&device, p).await.unwrap();
    assert_eq!(core.storage.alert_count("custom"), 1);
}

#[tokio::test]
async fn invalid_custom_expression_never_fires() {
    let storage = Arc::new(MockStorage::new());
    let device = test_device(1, "teltonika", "867440069999999");
    storage.devices.lock().unwrap().push(device.clone());
    storage.rules.lock().unwrap().push(rule(
        1,
        RuleKind::Custom {
            name: "bad".into(),
            expression: "speed.max() > 40".into(),
            duration_s: None,
        },
    ));
    let core = build_core(storage).await;

    let base = OffsetDateTime::now_utc() - Duration::hours(1);
    core.pipeline.ingest(&device, position(base, 120.0)).await.unwrap();
    assert_eq!(core.storage.alert_count("custom"), 0);
}

#[tokio::test]
async fn low_battery_uses_the_sensor_with_debounce() {
    let storage = Arc::new(MockStorage::new());
    let device = test_device(1, "teltonika", "867440069999999");
    storage.devices.lock().unwrap().push(device.clone());
    storage.rules.lock().unwrap().push(rule(
        1,
        RuleKind::LowBattery { threshold_v: 3.5, duration_s: 60 },
    ));
    let core = build_core(storage).await;

    let base = OffsetDateTime::now_utc() - Duration::hours(1);
    for (offset, volts) in [(0i64, 3.2), (30, 3.1), (61, 3.0)] {
        let mut p = position(base + Duration::seconds(offset), 0.0);
        p.sensors.insert("battery_voltage".into(), serde_json::json!(volts));
        core.pipeline.ingest(&device, p).await.unwrap();
    }
    assert_eq!(core.storage.alert_count("low_battery"), 1);

    // A position without the sensor clears the episode.
    core.pipeline
        .ingest(&device, position(base + Duration::seconds(90), 0.0))
        .await
        .unwrap();
    assert_eq!(core.storage.alert_count("low_battery"), 1);
}

#[tokio::test]
async fn harsh_braking_fires_on_close_position_pairs() {
    let storage = Arc::new(MockStorage::new());
    let device = test_device(1, "teltonika", "867440069999999");
    storage.devices.lock().unwrap().push(device.clone());
    storage.rules.lock().unwrap().push(rule(1, RuleKind::HarshBraking { threshold_ms2: 4.0 }));
    let core = build_core(storage).await;

    let base = OffsetDateTime::now_utc() - Duration::hours(1);
    // 80 -> 20 km/h in 3 s is about -5.6 m/s^2.
    core.pipeline.ingest(&device, position(base, 80.0)).await.unwrap();
    core.pipeline
        .ingest(&device, position(base + Duration::seconds(3), 20.0))
        .await
        .unwrap();
    assert_eq!(core.storage.alert_count("harsh_braking"), 1);

    // Gentle braking afterwards stays quiet.
    core.pipeline
        .ingest(&device, position(base + Duration::seconds(13), 10.0))
        .await
        .unwrap();
    assert_eq!(core.storage.alert_count("harsh_braking"), 1);
}

#[tokio::test]
async fn maintenance_fires_once_and_rearms_on_acknowledgement() {
    let storage = Arc::new(MockStorage::new());
    let device = test_device(1, "teltonika", "867440069999999");
    storage.devices.lock().unwrap().push(device.clone());
    storage.rules.lock().unwrap().push(rule(
        1,
        RuleKind::Maintenance { next_service_km: 1.0, interval_km: 10_000.0 },
    ));
    let core = build_core(storage).await;

    let base = OffsetDateTime::now_utc() - Duration::hours(1);
    core.pipeline.ingest(&device, position(base, 50.0)).await.unwrap();
    // ~2.2 km south: odometer passes the 1 km threshold.
    let mut moved = NormalizedPosition::new("867440069999999", base + Duration::seconds(120), 10.02, 20.0);
    moved.speed = Some(50.0);
    core.pipeline.ingest(&device, moved).await.unwrap();
    core.pipeline
        .ingest(
            &device,
            position(base + Duration::seconds(180), 50.0),
        )
        .await
        .unwrap();
    assert_eq!(core.storage.alert_count("maintenance"), 1, "fires once, no repeats");

    // Acknowledgement bumps the threshold by the interval and re-arms.
    let rule = core.storage.rules_for_device(1).await.unwrap().remove(0);
    core.engine.acknowledge_maintenance(&rule).await.unwrap();
    let bumped = core.rules.rules_for(1).remove(0);
    assert_eq!(
        bumped.kind,
        RuleKind::Maintenance { next_service_km: 10_001.0, interval_km: 10_000.0 }
    );
    core.pipeline
        .ingest(&device, position(base + Duration::seconds(240), 50.0))
        .await
        .unwrap();
    assert_eq!(core.storage.alert_count("maintenance"), 1, "below the new threshold");
}

#[tokio::test]
async fn schedule_window_suppresses_out_of_hours_firing() {
    let storage = Arc::new(MockStorage::new());
    let device = test_device(1, "teltonika", "867440069999999");
    storage.devices.lock().unwrap().push(device.clone());
    // A window that can never match: empty day list is "any day", so use
    // an impossible hour range instead of guessing the test wall clock.
    let mut gated = rule(1, RuleKind::Speeding { threshold_kmh: 50.0, duration_s: 0 });
    gated.schedule = Some(Schedule { days: vec![], hour_start: 24, hour_end: 24 });
    storage.rules.lock().unwrap().push(gated);
    let core = build_core(storage).await;

    let base = OffsetDateTime::now_utc() - Duration::hours(1);
    core.pipeline.ingest(&device, position(base, 120.0)).await.unwrap();
    assert_eq!(core.storage.alert_count("speeding"), 0, "schedule window blocks the fire");
}
