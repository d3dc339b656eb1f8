use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{info, instrument};

use crate::ports::MessageBroker;

/// Redis-backed pub/sub seam for cross-process dashboard fan-out.
/// `ConnectionManager` reconnects on its own; a publish against a dead
/// broker surfaces as an error the hub logs and drops.
pub struct RedisPubSub {
    connection: ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("redis pub/sub connected");
        Ok(Self { connection })
    }
}

#[async_trait]
impl MessageBroker for RedisPubSub {
    #[instrument(skip(self, payload), fields(topic = %topic, payload_len = payload.len()))]
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let mut connection = self.connection.clone();
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async::<_, i64>(&mut connection)
            .await?;
        Ok(())
    }
}
