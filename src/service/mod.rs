pub mod alert_engine;
pub mod broadcast_hub;
pub mod command_dispatcher;
pub mod expr;
pub mod geo;
pub mod offline_sweep;
pub mod pipeline;

use std::sync::Arc;
use tracing::info;

use crate::gateway::session::SessionRegistry;
use crate::state::rule_cache::RuleCache;

/// Device retirement, called by the config surface on delete: close any
/// live session, fail queued commands, and drop every piece of in-memory
/// state. Storage rows cascade with the device row deleted by the caller.
pub async fn retire_device(
    device_id: i64,
    sessions: &Arc<SessionRegistry>,
    dispatcher: &Arc<command_dispatcher::CommandDispatcher>,
    engine: &Arc<alert_engine::AlertEngine>,
    pipeline: &Arc<pipeline::PositionPipeline>,
    rules: &Arc<RuleCache>,
) -> anyhow::Result<()> {
    sessions.close_device(device_id);
    dispatcher.retire_device(device_id).await?;
    engine.clear_device(device_id);
    pipeline.clear_device(device_id);
    rules.evict_device(device_id);
    info!(device_id, "device retired");
    Ok(())
}
