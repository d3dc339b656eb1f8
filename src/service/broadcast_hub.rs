use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{Alert, Device};
use crate::ports::MessageBroker;

/// Per-subscriber buffer; a dashboard that cannot drain this fast is
/// dropped rather than allowed to stall the hub.
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    PositionUpdate { device_id: i64, data: serde_json::Value },
    Alert { device_id: i64, data: serde_json::Value },
}

impl HubMessage {
    pub fn device_id(&self) -> i64 {
        match self {
            HubMessage::PositionUpdate { device_id, .. } => *device_id,
            HubMessage::Alert { device_id, .. } => *device_id,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<HubMessage>,
}

/// Fan-out registry from user id to live dashboard connections.
///
/// Delivery is fire-and-forget: a full or closed subscriber buffer drops
/// the subscriber. Cross-process fan-out is mirrored to the pub/sub seam
/// on a topic per user.
pub struct BroadcastHub {
    subscribers: DashMap<i64, Vec<Subscriber>>,
    broker: Option<Arc<dyn MessageBroker>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new(broker: Option<Arc<dyn MessageBroker>>) -> Self {
        Self { subscribers: DashMap::new(), broker, next_id: AtomicU64::new(1) }
    }

    /// Register a dashboard connection for a user. The returned id
    /// unsubscribes; dropping the receiver works too (the next publish
    /// cleans it up).
    pub fn subscribe(&self, user_id: i64) -> (u64, mpsc::Receiver<HubMessage>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.entry(user_id).or_default().push(Subscriber { id, tx });
        debug!(user_id, subscriber = id, "hub subscriber attached");
        (id, rx)
    }

    pub fn unsubscribe(&self, user_id: i64, subscriber_id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(&user_id) {
            entry.retain(|s| s.id != subscriber_id);
        }
        self.subscribers.remove_if(&user_id, |_, subs| subs.is_empty());
    }

    pub async fn publish_position(&self, device: &Device, data: serde_json::Value) {
        let message = HubMessage::PositionUpdate { device_id: device.id, data };
        self.route(&device.user_ids, message).await;
    }

    pub async fn publish_alert(&self, device: &Device, alert: &Alert) {
        let data = serde_json::to_value(alert).unwrap_or(serde_json::Value::Null);
        let message = HubMessage::Alert { device_id: device.id, data };
        self.route(&device.user_ids, message).await;
    }

    async fn route(&self, user_ids: &[i64], message: HubMessage) {
        for &user_id in user_ids {
            if let Some(mut entry) = self.subscribers.get_mut(&user_id) {
                entry.retain(|subscriber| match subscriber.tx.try_send(message.clone()) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(
                            user_id,
                            subscriber = subscriber.id,
                            "dropping hub subscriber: {err}"
                        );
                        metrics::counter!("hub_subscribers_dropped_total", 1);
                        false
                    }
                });
            }

            if let Some(broker) = &self.broker {
                let payload = match serde_json::to_vec(&message) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if let Err(err) = broker.publish(&format!("user:{user_id}"), payload).await {
                    debug!(user_id, "pub/sub publish failed: {err:#}");
                }
            }
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, user_id: i64) -> usize {
        self.subscribers.get(&user_id).map(|s| s.len()).unwrap_or(0)
    }
}
