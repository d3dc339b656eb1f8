use dashmap::DashMap;
use tracing::info;

use crate::domain::DeviceState;
use crate::ports::StorageRepository;

/// In-memory live state, one record per device.
///
/// The pipeline task for a device is the only writer; everyone else
/// (alert engine, broadcast hub, sweep) reads cloned snapshots. Storage
/// holds the durable copy and seeds the map at startup.
pub struct LiveStateStore {
    states: DashMap<i64, DeviceState>,
}

impl LiveStateStore {
    pub fn new() -> Self {
        Self { states: DashMap::new() }
    }

    /// Seed from storage so restarts keep odometers and open trips.
    pub async fn load_all(&self, storage: &dyn StorageRepository) -> anyhow::Result<()> {
        for state in storage.load_states().await? {
            self.states.insert(state.device_id, state);
        }
        info!("loaded {} device states into memory", self.states.len());
        Ok(())
    }

    /// Snapshot of one device's state; empty state if never seen.
    pub fn snapshot(&self, device_id: i64) -> DeviceState {
        self.states
            .get(&device_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| DeviceState::empty(device_id))
    }

    /// Apply a mutation and return the updated snapshot.
    pub fn update<F>(&self, device_id: i64, mutate: F) -> DeviceState
    where
        F: FnOnce(&mut DeviceState),
    {
        let mut entry =
            self.states.entry(device_id).or_insert_with(|| DeviceState::empty(device_id));
        mutate(entry.value_mut());
        entry.value().clone()
    }

    /// Snapshot of every device, for the periodic sweeps.
    pub fn all(&self) -> Vec<DeviceState> {
        self.states.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn remove(&self, device_id: i64) {
        self.states.remove(&device_id);
    }
}

impl Default for LiveStateStore {
    fn default() -> Self {
        Self::new()
    }
}
