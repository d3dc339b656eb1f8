use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::domain::{AlertRule, Geofence};
use crate::ports::StorageRepository;

/// Device rules and geofence geometries, cached so the hot path never
/// waits on the database for configuration. Warmed at startup, refreshed
/// write-through when the config surface edits a device.
pub struct RuleCache {
    storage: Arc<dyn StorageRepository>,
    rules: DashMap<i64, Vec<AlertRule>>,
    geofences: DashMap<i64, Geofence>,
}

impl RuleCache {
    pub fn new(storage: Arc<dyn StorageRepository>) -> Self {
        Self { storage, rules: DashMap::new(), geofences: DashMap::new() }
    }

    pub async fn load_all(&self) -> anyhow::Result<()> {
        let mut count = 0usize;
        for rule in self.storage.load_rules().await? {
            count += 1;
            self.rules.entry(rule.device_id).or_default().push(rule);
        }
        info!("loaded {count} alert rules into cache");
        Ok(())
    }

    pub fn rules_for(&self, device_id: i64) -> Vec<AlertRule> {
        self.rules.get(&device_id).map(|r| r.clone()).unwrap_or_default()
    }

    /// Reload one device's rules from storage (config edit, rule bump).
    pub async fn refresh_device(&self, device_id: i64) -> anyhow::Result<()> {
        let rules = self.storage.rules_for_device(device_id).await?;
        self.rules.insert(device_id, rules);
        Ok(())
    }

    pub fn evict_device(&self, device_id: i64) {
        self.rules.remove(&device_id);
    }

    /// Load-through geofence lookup. Inactive and missing fences resolve
    /// to None and are not cached.
    pub async fn geofence(&self, geofence_id: i64) -> anyhow::Result<Option<Geofence>> {
        if let Some(fence) = self.geofences.get(&geofence_id) {
            return Ok(Some(fence.clone()));
        }
        match self.storage.geofence(geofence_id).await? {
            Some(fence) if fence.is_active => {
                self.geofences.insert(geofence_id, fence.clone());
                Ok(Some(fence))
            }
            _ => Ok(None),
        }
    }

    #[cfg(test)]
    pub fn inject_rules(&self, device_id: i64, rules: Vec<AlertRule>) {
        self.rules.insert(device_id, rules);
    }

    #[cfg(test)]
    pub fn inject_geofence(&self, fence: Geofence) {
        self.geofences.insert(fence.id, fence);
    }
}
