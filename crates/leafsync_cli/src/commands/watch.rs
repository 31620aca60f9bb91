//! Watch command implementation.

use super::open_session;
use leafsync_engine::LogicalKey;
use leafsync_store::MemoryStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const CONTROLLER_PERIOD: Duration = Duration::from_millis(200);
const CHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Subscribes to `key` and prints `ticks` change events while a background
/// task keeps changing the leaves under it in the store.
pub async fn run(schema: &Value, key: &str, ticks: usize) -> Result<(), Box<dyn std::error::Error>> {
    let (store, engine) = open_session(schema)?;
    let logical = LogicalKey::parse(key)?;
    let navigator = engine.navigator();
    let addresses: Vec<String> = navigator
        .read_leaves(&logical, engine.config().max_depth)?
        .iter()
        .map(|leaf| navigator.address(leaf))
        .collect();
    if addresses.is_empty() {
        return Err(format!("`{key}` has no leaves to watch").into());
    }

    let mut subscription = engine.subscribe(key, false)?;
    let scheduler = engine.start();
    let controller = tokio::spawn(simulate_controller(Arc::clone(&store), addresses));

    for _ in 0..ticks {
        match tokio::time::timeout(CHANGE_TIMEOUT, subscription.recv()).await {
            Ok(Some(event)) => println!(
                "{} <- {}: {}",
                event.key,
                event.changed_key,
                serde_json::to_string(&event.value)?
            ),
            Ok(None) => break,
            Err(_) => tracing::warn!(key = %key, "no change within {CHANGE_TIMEOUT:?}"),
        }
    }

    controller.abort();
    subscription.unsubscribe();
    scheduler.shutdown().await;
    Ok(())
}

/// Changes one leaf per period, cycling through `addresses`.
async fn simulate_controller(store: Arc<MemoryStore>, addresses: Vec<String>) {
    let mut interval = tokio::time::interval(CONTROLLER_PERIOD);
    for address in addresses.iter().cycle() {
        interval.tick().await;
        let next = match store.read(address) {
            Ok(current) => bump(&current),
            Err(err) => {
                tracing::warn!(address = %address, error = %err, "controller cannot read leaf");
                continue;
            }
        };
        if let Err(err) = store.set(address, next) {
            tracing::warn!(address = %address, error = %err, "controller cannot change leaf");
        }
    }
}

fn bump(value: &Value) -> Value {
    match value {
        Value::Bool(flag) => Value::Bool(!flag),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Value::from(i.wrapping_add(1)),
            None => Value::from(n.as_f64().unwrap_or_default() + 1.0),
        },
        Value::String(text) => Value::String(format!("{text}+")),
        other => other.clone(),
    }
}
