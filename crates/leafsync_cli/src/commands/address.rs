//! Address command implementation.

use leafsync_engine::{KeyMap, LogicalKey, Navigator, Schema};
use serde_json::Value;

/// Prints the transport address of `key` after prefix substitution.
pub fn run(schema: &Value, key: &str, maps: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let pairs = maps
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .ok_or_else(|| format!("expected FROM=TO, got `{entry}`"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let navigator = Navigator::new(Some(Schema::from_value(schema)), KeyMap::from_pairs(&pairs)?);
    let key = LogicalKey::parse(key)?;
    navigator.check(&key)?;

    println!("{}", navigator.address(&key));
    Ok(())
}
