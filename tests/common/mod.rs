//! Shared test doubles: an in-memory storage repository and a recording
//! notification dispatcher.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use time::OffsetDateTime;

use fleetgate::domain::{
    Alert, AlertRule, Command, CommandStatus, Device, DeviceConfig, DeviceState, Geofence,
    NormalizedPosition, RuleKind, User,
};
use fleetgate::ports::{AlertDispatcher, StorageRepository};

#[derive(Default)]
pub struct MockStorage {
    pub devices: Mutex<Vec<Device>>,
    pub states: Mutex<HashMap<i64, DeviceState>>,
    pub positions: Mutex<Vec<(i64, OffsetDateTime)>>,
    pub rules: Mutex<Vec<AlertRule>>,
    pub geofences: Mutex<Vec<Geofence>>,
    pub alerts: Mutex<Vec<Alert>>,
    pub users: Mutex<Vec<User>>,
    pub commands: Mutex<Vec<Command>>,
    pub trips_opened: Mutex<Vec<i64>>,
    pub trips_closed: Mutex<Vec<(i64, f64)>>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alert_count(&self, kind: &str) -> usize {
        self.alerts.lock().unwrap().iter().filter(|a| a.kind == kind).count()
    }

    pub fn command(&self, command_id: i64) -> Command {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == command_id)
            .cloned()
            .expect("command exists")
    }
}

#[async_trait]
impl StorageRepository for MockStorage {
    async fn device_by_imei(&self, imei: &str, protocol: &str) -> anyhow::Result<Option<Device>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.imei == imei && d.protocol == protocol)
            .cloned())
    }

    async fn device_by_id(&self, device_id: i64) -> anyhow::Result<Option<Device>> {
        Ok(self.devices.lock().unwrap().iter().find(|d| d.id == device_id).cloned())
    }

    async fn load_devices(&self) -> anyhow::Result<Vec<Device>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn load_states(&self) -> anyhow::Result<Vec<DeviceState>> {
        Ok(self.states.lock().unwrap().values().cloned().collect())
    }

    async fn position_exists(
        &self,
        device_id: i64,
        device_time: OffsetDateTime,
    ) -> anyhow::Result<bool> {
        Ok(self
            .positions
            .lock()
            .unwrap()
            .iter()
            .any(|(d, t)| *d == device_id && *t == device_time))
    }

    async fn store_position(
        &self,
        device_id: i64,
        position: &NormalizedPosition,
        _trip_id: Option<i64>,
        state: &DeviceState,
    ) -> anyhow::Result<()> {
        let mut positions = self.positions.lock().unwrap();
        let key = (device_id, position.device_time);
        if !positions.contains(&key) {
            positions.push(key);
        }
        self.states.lock().unwrap().insert(device_id, state.clone());
        Ok(())
    }

    async fn persist_state(&self, state: &DeviceState) -> anyhow::Result<()> {
        self.states.lock().unwrap().insert(state.device_id, state.clone());
        Ok(())
    }

    async fn open_trip(
        &self,
        device_id: i64,
        _start_time: OffsetDateTime,
        _start_latitude: f64,
        _start_longitude: f64,
    ) -> anyhow::Result<i64> {
        let mut opened = self.trips_opened.lock().unwrap();
        let id = (opened.len() + 1) as i64;
        opened.push(device_id);
        Ok(id)
    }

    async fn close_trip(
        &self,
        trip_id: i64,
        _end_time: OffsetDateTime,
        _end_latitude: f64,
        _end_longitude: f64,
        distance_km: f64,
        _max_speed: f64,
    ) -> anyhow::Result<()> {
        self.trips_closed.lock().unwrap().push((trip_id, distance_km));
        Ok(())
    }

    async fn load_rules(&self) -> anyhow::Result<Vec<AlertRule>> {
        Ok(self.rules.lock().unwrap().clone())
    }

    async fn rules_for_device(&self, device_id: i64) -> anyhow::Result<Vec<AlertRule>> {
        Ok(self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn update_rule_kind(&self, rule_id: i64, kind: &RuleKind) -> anyhow::Result<()> {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) {
            rule.kind = kind.clone();
        }
        Ok(())
    }

    async fn geofence(&self, geofence_id: i64) -> anyhow::Result<Option<Geofence>> {
        Ok(self.geofences.lock().unwrap().iter().find(|g| g.id == geofence_id).cloned())
    }

    async fn store_alert(&self, alert: &Alert) -> anyhow::Result<i64> {
        let mut alerts = self.alerts.lock().unwrap();
        let id = (alerts.len() + 1) as i64;
        alerts.push(alert.clone());
        Ok(id)
    }

    async fn users_by_ids(&self, user_ids: &[i64]) -> anyhow::Result<Vec<User>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .filter(|u| user_ids.contains(&u.id))
            .cloned()
            .collect())
    }

    async fn mark_device_offline(&self, device_id: i64) -> anyhow::Result<()> {
        if let Some(state) = self.states.lock().unwrap().get_mut(&device_id) {
            state.is_online = false;
        }
        Ok(())
    }

    async fn next_pending_command(&self, device_id: i64) -> anyhow::Result<Option<Command>> {
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.device_id == device_id && c.status == CommandStatus::Pending)
            .min_by_key(|c| (c.created_at, c.id))
            .cloned())
    }

    async fn mark_command_sent(
        &self,
        command_id: i64,
        command_key: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut commands = self.commands.lock().unwrap();
        if let Some(command) = commands
            .iter_mut()
            .find(|c| c.id == command_id && c.status == CommandStatus::Pending)
        {
            command.status = CommandStatus::Sent;
            command.sent_at = Some(OffsetDateTime::now_utc());
            command.command_key = command_key.map(str::to_string);
            command.retries_remaining -= 1;
        }
        Ok(())
    }

    async fn mark_command_acknowledged(
        &self,
        command_id: i64,
        response: &str,
    ) -> anyhow::Result<()> {
        let mut commands = self.commands.lock().unwrap();
        if let Some(command) = commands
            .iter_mut()
            .find(|c| c.id == command_id && c.status == CommandStatus::Sent)
        {
            command.status = CommandStatus::Acknowledged;
            command.acked_at = Some(OffsetDateTime::now_utc());
            command.response = Some(response.to_string());
        }
        Ok(())
    }

    async fn mark_command_failed(&self, command_id: i64) -> anyhow::Result<()> {
        let mut commands = self.commands.lock().unwrap();
        if let Some(command) = commands
            .iter_mut()
            .find(|c| c.id == command_id && !c.status.is_terminal())
        {
            command.status = CommandStatus::Failed;
        }
        Ok(())
    }

    async fn requeue_command(&self, command_id: i64) -> anyhow::Result<()> {
        let mut commands = self.commands.lock().unwrap();
        if let Some(command) = commands
            .iter_mut()
            .find(|c| c.id == command_id && c.status == CommandStatus::Sent)
        {
            command.status = CommandStatus::Pending;
            command.command_key = None;
        }
        Ok(())
    }

    async fn fail_pending_commands(&self, device_id: i64) -> anyhow::Result<()> {
        let mut commands = self.commands.lock().unwrap();
        for command in commands
            .iter_mut()
            .filter(|c| c.device_id == device_id && !c.status.is_terminal())
        {
            command.status = CommandStatus::Failed;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDispatcher {
    pub sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl AlertDispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        channel_url: &str,
        subject: &str,
        body: &str,
        _severity: &str,
    ) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel_url.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

pub fn test_device(id: i64, protocol: &str, imei: &str) -> Device {
    Device {
        id,
        imei: imei.to_string(),
        name: format!("Vehicle {id}"),
        protocol: protocol.to_string(),
        vehicle_type: Some("car".into()),
        license_plate: None,
        vin: None,
        config: DeviceConfig::default(),
        is_active: true,
        user_ids: vec![1],
    }
}

pub fn test_command(id: i64, device_id: i64, payload: &str, retries: i32) -> Command {
    Command {
        id,
        device_id,
        command_type: "custom".into(),
        payload: payload.to_string(),
        status: CommandStatus::Pending,
        retries_remaining: retries,
        command_key: None,
        created_at: OffsetDateTime::now_utc() + time::Duration::milliseconds(id),
        sent_at: None,
        acked_at: None,
        response: None,
    }
}
