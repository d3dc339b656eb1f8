use dashmap::DashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::gateway::session::SessionRegistry;
use crate::ports::StorageRepository;
use crate::protocol::ProtocolKind;

/// A `sent` command with no ack inside this window is retried or failed.
pub const ACK_TIMEOUT: time::Duration = time::Duration::seconds(60);

/// Timeout scan cadence.
const TICK: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone)]
struct InFlight {
    command_id: i64,
    command_key: Option<String>,
    sent_at: OffsetDateTime,
    retries_remaining: i32,
}

/// Sends queued commands when a device's session is live, one in flight
/// per device, and matches incoming acks back to `sent` rows. Terminal
/// states (`acknowledged`, `failed`) are never left.
pub struct CommandDispatcher {
    storage: Arc<dyn StorageRepository>,
    sessions: Arc<SessionRegistry>,
    inflight: DashMap<i64, InFlight>,
}

impl CommandDispatcher {
    pub fn new(storage: Arc<dyn StorageRepository>, sessions: Arc<SessionRegistry>) -> Self {
        Self { storage, sessions, inflight: DashMap::new() }
    }

    /// Dispatcher task: reacts to session registrations and scans for ack
    /// timeouts until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut connects: mpsc::Receiver<i64>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("command dispatcher started");
        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                device_id = connects.recv() => {
                    match device_id {
                        Some(device_id) => {
                            if let Err(err) = self.pump_device(device_id).await {
                                error!(device_id, "command flush failed: {err:#}");
                            }
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.scan_timeouts(OffsetDateTime::now_utc()).await;
                }
            }
        }
        info!("command dispatcher stopped");
    }

    /// Push the device's oldest pending command onto its live session, if
    /// any and if nothing is already in flight.
    #[instrument(skip(self))]
    pub async fn pump_device(&self, device_id: i64) -> anyhow::Result<()> {
        if self.inflight.contains_key(&device_id) {
            return Ok(());
        }
        let Some(session) = self.sessions.get(device_id) else {
            return Ok(());
        };
        let Some(command) = self.storage.next_pending_command(device_id).await? else {
            return Ok(());
        };
        let Some(device) = self.storage.device_by_id(device_id).await? else {
            return Ok(());
        };
        let Some(protocol) = ProtocolKind::from_name(&device.protocol) else {
            warn!(protocol = %device.protocol, "unknown protocol for command");
            self.storage.mark_command_failed(command.id).await?;
            return Ok(());
        };

        let Some(encoded) = protocol.encode_command(&command, &device.imei) else {
            warn!(
                command_id = command.id,
                command_type = %command.command_type,
                "protocol cannot encode command, failing it"
            );
            self.storage.mark_command_failed(command.id).await?;
            return Ok(());
        };

        if let Err(err) = session.write(encoded.bytes).await {
            debug!(command_id = command.id, "session write failed, command stays pending: {err:#}");
            return Ok(());
        }

        // Sending burns one attempt; what remains decides timeout handling.
        self.storage.mark_command_sent(command.id, encoded.key.as_deref()).await?;
        self.inflight.insert(
            device_id,
            InFlight {
                command_id: command.id,
                command_key: encoded.key,
                sent_at: OffsetDateTime::now_utc(),
                retries_remaining: command.retries_remaining - 1,
            },
        );
        info!(command_id = command.id, command_type = %command.command_type, "command sent");
        metrics::counter!("commands_sent_total", 1);
        Ok(())
    }

    /// Match an incoming ack frame against the device's in-flight command.
    /// Protocols without keyed acks match the oldest `sent` command, which
    /// with one in flight per device is exactly the in-flight one.
    pub async fn handle_ack(
        &self,
        device_id: i64,
        command_key: Option<&str>,
        success: bool,
        response: &str,
    ) {
        let matched = {
            let Some(entry) = self.inflight.get(&device_id) else {
                debug!(device_id, "ack with no command in flight");
                return;
            };
            match (command_key, &entry.command_key) {
                (Some(incoming), Some(expected)) if incoming != expected => {
                    debug!(device_id, incoming, expected, "ack key mismatch, ignoring");
                    None
                }
                _ => Some(entry.command_id),
            }
        };
        let Some(command_id) = matched else { return };
        self.inflight.remove(&device_id);

        let result = if success {
            self.storage.mark_command_acknowledged(command_id, response).await
        } else {
            self.storage.mark_command_failed(command_id).await
        };
        if let Err(err) = result {
            error!(command_id, "ack transition failed: {err:#}");
            return;
        }
        info!(command_id, success, "command acknowledged");
        metrics::counter!("commands_acked_total", 1);

        // Next queued command for the same device goes out immediately.
        if let Err(err) = self.pump_device(device_id).await {
            error!(device_id, "follow-up command flush failed: {err:#}");
        }
    }

    /// Retry or fail commands whose ack window has passed.
    pub async fn scan_timeouts(&self, now: OffsetDateTime) {
        let expired: Vec<(i64, InFlight)> = self
            .inflight
            .iter()
            .filter(|entry| now - entry.value().sent_at > ACK_TIMEOUT)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (device_id, inflight) in expired {
            self.inflight.remove(&device_id);
            let result = if inflight.retries_remaining > 0 {
                debug!(
                    command_id = inflight.command_id,
                    retries_remaining = inflight.retries_remaining,
                    "ack timeout, requeueing"
                );
                self.storage.requeue_command(inflight.command_id).await
            } else {
                warn!(command_id = inflight.command_id, "ack timeout, command failed");
                metrics::counter!("commands_failed_total", 1);
                self.storage.mark_command_failed(inflight.command_id).await
            };
            if let Err(err) = result {
                error!(command_id = inflight.command_id, "timeout transition failed: {err:#}");
                continue;
            }
            if let Err(err) = self.pump_device(device_id).await {
                error!(device_id, "retry flush failed: {err:#}");
            }
        }
    }

    /// Device retirement: drop the in-flight marker and fail everything
    /// still queued.
    pub async fn retire_device(&self, device_id: i64) -> anyhow::Result<()> {
        self.inflight.remove(&device_id);
        self.storage.fail_pending_commands(device_id).await
    }
}
