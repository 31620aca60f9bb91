//! Set command implementation.

use super::open_session;
use leafsync_engine::CacheMode;
use serde_json::Value;

/// Writes `value` (JSON text) to `key`, then reads the key back from the store.
pub async fn run(schema: &Value, key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let value: Value =
        serde_json::from_str(value).map_err(|e| format!("value is not valid JSON: {e}"))?;

    let (store, engine) = open_session(schema)?;
    let scheduler = engine.start();

    let outcome: Result<Value, Box<dyn std::error::Error>> = async {
        if !engine.write(key, value)?.await? {
            return Err(format!("store rejected the write to `{key}`").into());
        }
        Ok(engine.get(key, CacheMode::IgnoreCache)?.await?)
    }
    .await;
    scheduler.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&outcome?)?);
    tracing::debug!(requests = store.request_count(), "set complete");
    Ok(())
}
