use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::ports::StorageRepository;
use crate::service::alert_engine::AlertEngine;
use crate::service::pipeline::PositionPipeline;
use crate::state::live_state::LiveStateStore;

/// Offline detection and stale-trip closure cadence.
pub const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Periodic task: flips `is_online` when a device passes its offline
/// threshold (firing the offline rules exactly once per outage) and closes
/// trips abandoned past the idle gap.
pub async fn run_offline_sweep(
    storage: Arc<dyn StorageRepository>,
    live: Arc<LiveStateStore>,
    engine: Arc<AlertEngine>,
    pipeline: Arc<PositionPipeline>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("offline sweep started");
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                if let Err(err) =
                    sweep_once(&storage, &live, &engine, &pipeline, OffsetDateTime::now_utc()).await
                {
                    error!("offline sweep failed: {err:#}");
                }
            }
        }
    }
    info!("offline sweep stopped");
}

#[instrument(skip_all)]
pub async fn sweep_once(
    storage: &Arc<dyn StorageRepository>,
    live: &Arc<LiveStateStore>,
    engine: &Arc<AlertEngine>,
    pipeline: &Arc<PositionPipeline>,
    now: OffsetDateTime,
) -> anyhow::Result<()> {
    let devices: HashMap<i64, _> =
        storage.load_devices().await?.into_iter().map(|d| (d.id, d)).collect();

    for state in live.all() {
        let Some(device) = devices.get(&state.device_id) else { continue };
        if !device.is_active {
            continue;
        }
        let offline = engine.sweep_offline(device, &state, now).await;
        if offline && state.is_online {
            storage.mark_device_offline(device.id).await?;
            live.update(device.id, |s| s.is_online = false);
            info!(device_id = device.id, "device marked offline");
        }
    }

    pipeline.close_stale_trips(now).await;
    Ok(())
}
