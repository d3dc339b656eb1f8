pub mod notifier;
pub mod postgres;
pub mod redis_pubsub;

pub use notifier::WebhookNotifier;
pub use postgres::PgStorage;
pub use redis_pubsub::RedisPubSub;
