pub mod live_state;
pub mod rule_cache;
