//! Expand command implementation.

use leafsync_engine::{EngineConfig, LogicalKey, Schema};
use serde_json::Value;

/// Prints every leaf key `key` expands into, one per line.
pub fn run(
    schema: &Value,
    key: &str,
    depth: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let schema = Schema::from_value(schema);
    let key = LogicalKey::parse(key)?;
    let depth = depth.unwrap_or(EngineConfig::default().max_depth);

    let leaves = schema.expand_leaves(&key, depth)?;
    for leaf in &leaves {
        println!("{leaf}");
    }
    tracing::debug!(key = %key, leaves = leaves.len(), "expanded");
    Ok(())
}
