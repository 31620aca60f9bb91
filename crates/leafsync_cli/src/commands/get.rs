//! Get command implementation.

use super::open_session;
use leafsync_engine::CacheMode;
use serde_json::Value;

/// Reads `keys` through the engine and prints the result as JSON.
pub async fn run(
    schema: &Value,
    keys: Vec<String>,
    mode: CacheMode,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_store, engine) = open_session(schema)?;
    let pending = engine.get(keys, mode)?;

    let scheduler = engine.start();
    let result = pending.await;
    scheduler.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    let stats = engine.stats();
    tracing::debug!(ticks = stats.ticks, leaves = stats.leaves_read, "get complete");
    Ok(())
}
