//! CLI command implementations.

pub mod address;
pub mod expand;
pub mod get;
pub mod set;
pub mod watch;

use leafsync_engine::{Engine, EngineConfig, LoopbackClient, LoopbackServer, RpcTransport, Schema};
use leafsync_store::{MemoryStore, StoreConfig};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Engine talking JSON-RPC to an in-process store.
pub type LoopbackEngine = Engine<RpcTransport<LoopbackClient<StoreServer>>>;

/// Serves a [`MemoryStore`] to a loopback client.
#[derive(Debug, Clone)]
pub struct StoreServer(pub Arc<MemoryStore>);

impl LoopbackServer for StoreServer {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        self.0.handle_post(path, body).map_err(|e| e.to_string())
    }
}

/// Reads a schema document.
pub fn load_schema(path: &Path) -> Result<Value, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read schema {}: {e}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

/// Seeds a store from `schema` and connects an engine to it.
pub fn open_session(
    schema: &Value,
) -> Result<(Arc<MemoryStore>, LoopbackEngine), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::from_schema(schema, StoreConfig::default()));
    let client = LoopbackClient::new(StoreServer(Arc::clone(&store)));
    let transport = RpcTransport::new("http://loopback", client);
    let engine = Engine::new(
        EngineConfig::default(),
        Some(Schema::from_value(schema)),
        transport,
    )?;
    Ok((store, engine))
}
