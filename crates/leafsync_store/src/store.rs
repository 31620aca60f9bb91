//! The in-memory store.

use crate::address::{parse_address, Step};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use leafsync_protocol::{
    Command, LeafRequest, LeafResponse, RemoteError, RequestBatch, ResponseBatch, JSON_RPC_PATH,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// A leaf-only key-value store held in memory.
///
/// Only atomic (scalar) addresses can be read or written, exactly like the
/// remote controllers this models. Composite targets are rejected with
/// `UnsupportedAddress`, writes never change a leaf's type, and writes
/// under a read-only prefix fail with `PermissionDenied`.
///
/// # Example
///
/// ```
/// use leafsync_protocol::{LeafRequest, RequestBatch};
/// use leafsync_store::{MemoryStore, StoreConfig};
/// use serde_json::json;
///
/// let store = MemoryStore::from_schema(&json!({"\"DB\"": {"a": 0}}), StoreConfig::default());
/// let batch = RequestBatch::new(vec![LeafRequest::read("r", "\"DB\".a")]);
/// let response = store.handle(&batch).unwrap();
/// assert_eq!(response.responses[0].id, "r");
/// ```
pub struct MemoryStore {
    config: StoreConfig,
    root: RwLock<Value>,
    requests: AtomicU64,
}

impl MemoryStore {
    /// Creates a store seeded with the example values of a schema document.
    ///
    /// `null` array slots become empty strings, matching how clients treat
    /// them.
    pub fn from_schema(schema: &Value, config: StoreConfig) -> Self {
        Self {
            config,
            root: RwLock::new(seed(schema)),
            requests: AtomicU64::new(0),
        }
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Answers a batch of atomic operations.
    ///
    /// Fails as a whole only if the batch exceeds the size limit; every
    /// other problem is reported per operation.
    pub fn handle(&self, batch: &RequestBatch) -> StoreResult<ResponseBatch> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !self.config.allows_batch(batch.len()) {
            return Err(StoreError::BatchTooLarge {
                size: batch.len(),
                max: self.config.max_batch,
            });
        }

        let responses: Vec<LeafResponse> = batch.requests.iter().map(|r| self.answer(r)).collect();
        debug!(
            operations = batch.len(),
            failed = responses.iter().filter(|r| !r.outcome.is_ok()).count(),
            "handled batch"
        );
        Ok(ResponseBatch::new(responses))
    }

    /// Answers an encoded JSON-RPC batch.
    pub fn handle_json(&self, body: &[u8]) -> StoreResult<Vec<u8>> {
        let batch = RequestBatch::decode(body)?;
        let response = self.handle(&batch)?;
        Ok(response.encode()?)
    }

    /// Answers a POST to `path`, as an HTTP front end would.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> StoreResult<Vec<u8>> {
        if path != JSON_RPC_PATH {
            return Err(StoreError::UnknownEndpoint(path.to_string()));
        }
        self.handle_json(body)
    }

    /// Reads one leaf.
    pub fn read(&self, address: &str) -> Result<Value, RemoteError> {
        let steps = parse(address)?;
        let root = self.root.read();
        let node = locate(&root, &steps)
            .ok_or_else(|| RemoteError::address_not_found(address.to_string()))?;
        if is_composite(node) {
            return Err(RemoteError::unsupported_address(address.to_string()));
        }
        Ok(node.clone())
    }

    /// Writes one leaf as a client would.
    pub fn write(&self, address: &str, value: Value) -> Result<(), RemoteError> {
        if self.config.is_read_only(address) {
            return Err(RemoteError::permission_denied(format!(
                "`{address}` is read-only"
            )));
        }
        self.store(address, value)
    }

    /// Changes a leaf out of band, as the controller itself would.
    ///
    /// Read-only regions do not apply; shape and type rules do.
    pub fn set(&self, address: &str, value: Value) -> StoreResult<()> {
        self.store(address, value)
            .map_err(|error| StoreError::Rejected {
                address: address.to_string(),
                error,
            })
    }

    /// Copy of the whole value tree.
    pub fn snapshot(&self) -> Value {
        self.root.read().clone()
    }

    /// Number of batches received so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn answer(&self, request: &LeafRequest) -> LeafResponse {
        let id = request.id.clone();
        let result = match request.command {
            Command::Ping => Ok(Value::Bool(true)),
            Command::Read => match &request.address {
                Some(address) => self.read(address),
                None => Err(RemoteError::invalid_params("missing address")),
            },
            Command::Write => match (&request.address, &request.value) {
                (Some(address), Some(value)) => {
                    self.write(address, value.clone()).map(|()| Value::Bool(true))
                }
                (None, _) => Err(RemoteError::invalid_params("missing address")),
                (_, None) => Err(RemoteError::invalid_params("missing value")),
            },
        };
        match result {
            Ok(value) => LeafResponse::value(id, value),
            Err(error) => {
                trace!(id = %id, error = %error, "operation rejected");
                LeafResponse::error(id, error)
            }
        }
    }

    fn store(&self, address: &str, value: Value) -> Result<(), RemoteError> {
        let steps = parse(address)?;
        if is_composite(&value) {
            return Err(RemoteError::invalid_params(format!(
                "`{address}` only accepts scalar values"
            )));
        }

        let mut root = self.root.write();
        let node = locate_mut(&mut root, &steps)
            .ok_or_else(|| RemoteError::address_not_found(address.to_string()))?;
        if is_composite(node) {
            return Err(RemoteError::unsupported_address(address.to_string()));
        }
        if !same_type(node, &value) {
            return Err(RemoteError::invalid_params(format!(
                "type mismatch writing {value} to `{address}`"
            )));
        }
        *node = value;
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("config", &self.config)
            .field("requests", &self.request_count())
            .finish()
    }
}

fn parse(address: &str) -> Result<Vec<Step>, RemoteError> {
    parse_address(address).map_err(RemoteError::invalid_params)
}

fn seed(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Value::Null => Value::String(String::new()),
                    other => seed(other),
                })
                .collect(),
        ),
        Value::Object(members) => Value::Object(
            members
                .iter()
                .map(|(name, member)| (name.clone(), seed(member)))
                .collect(),
        ),
        scalar => scalar.clone(),
    }
}

fn locate<'a>(root: &'a Value, steps: &[Step]) -> Option<&'a Value> {
    let mut node = root;
    for step in steps {
        node = match (node, step) {
            (Value::Object(members), Step::Member(name)) => members.get(name)?,
            (Value::Array(items), Step::Index(index)) => items.get(*index)?,
            _ => return None,
        };
    }
    Some(node)
}

fn locate_mut<'a>(root: &'a mut Value, steps: &[Step]) -> Option<&'a mut Value> {
    let mut node = root;
    for step in steps {
        node = match (node, step) {
            (Value::Object(members), Step::Member(name)) => members.get_mut(name)?,
            (Value::Array(items), Step::Index(index)) => items.get_mut(*index)?,
            _ => return None,
        };
    }
    Some(node)
}

fn is_composite(value: &Value) -> bool {
    value.is_array() || value.is_object()
}

fn same_type(current: &Value, new: &Value) -> bool {
    matches!(
        (current, new),
        (Value::Null, _)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafsync_protocol::{LeafOutcome, RemoteErrorKind};
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::from_schema(
            &json!({
                "\"DB\"": {"a": 0, "b": "text", "arr": [1, null], "status": {"code": 7}}
            }),
            StoreConfig::new().with_read_only("\"DB\".status"),
        )
    }

    fn kind(result: Result<impl std::fmt::Debug, RemoteError>) -> RemoteErrorKind {
        result.unwrap_err().kind
    }

    #[test]
    fn reads_leaves_only() {
        let store = store();
        assert_eq!(store.read("\"DB\".a").unwrap(), json!(0));
        assert_eq!(store.read("\"DB\".arr[1]").unwrap(), json!(""));
        assert_eq!(kind(store.read("\"DB\"")), RemoteErrorKind::UnsupportedAddress);
        assert_eq!(kind(store.read("\"DB\".arr")), RemoteErrorKind::UnsupportedAddress);
        assert_eq!(kind(store.read("\"DB\".nope")), RemoteErrorKind::AddressNotFound);
        assert_eq!(kind(store.read("\"DB\".arr[5]")), RemoteErrorKind::AddressNotFound);
        assert_eq!(kind(store.read("\"DB\"..a")), RemoteErrorKind::InvalidParams);
    }

    #[test]
    fn writes_keep_types_and_permissions() {
        let store = store();
        store.write("\"DB\".a", json!(5)).unwrap();
        assert_eq!(store.read("\"DB\".a").unwrap(), json!(5));

        assert_eq!(kind(store.write("\"DB\".a", json!("5"))), RemoteErrorKind::InvalidParams);
        assert_eq!(kind(store.write("\"DB\".a", json!([5]))), RemoteErrorKind::InvalidParams);
        assert_eq!(
            kind(store.write("\"DB\".status.code", json!(1))),
            RemoteErrorKind::PermissionDenied
        );
        assert_eq!(kind(store.write("\"DB\".arr", json!(1))), RemoteErrorKind::UnsupportedAddress);
    }

    #[test]
    fn set_bypasses_read_only() {
        let store = store();
        store.set("\"DB\".status.code", json!(9)).unwrap();
        assert_eq!(store.read("\"DB\".status.code").unwrap(), json!(9));
        assert!(matches!(
            store.set("\"DB\".missing", json!(1)),
            Err(StoreError::Rejected { .. })
        ));
    }

    #[test]
    fn batches_answer_every_operation() {
        let store = store();
        let batch = RequestBatch::new(vec![
            LeafRequest::write("w", "\"DB\".a", json!(3)),
            LeafRequest::read("r", "\"DB\".a"),
            LeafRequest::read("bad", "\"DB\".nope"),
            LeafRequest::ping("p"),
        ]);
        let response = store.handle(&batch).unwrap();

        assert_eq!(response.len(), 4);
        assert_eq!(response.responses[0].outcome, LeafOutcome::Value(json!(true)));
        assert_eq!(response.responses[1].outcome, LeafOutcome::Value(json!(3)));
        assert!(!response.responses[2].outcome.is_ok());
        assert_eq!(response.responses[3].outcome, LeafOutcome::Value(json!(true)));
        assert_eq!(store.request_count(), 1);
    }

    #[test]
    fn oversized_batch_fails_whole_request() {
        let store = MemoryStore::from_schema(&json!({"a": 0}), StoreConfig::new().with_max_batch(1));
        let batch = RequestBatch::new(vec![LeafRequest::ping("1"), LeafRequest::ping("2")]);
        assert!(matches!(
            store.handle(&batch),
            Err(StoreError::BatchTooLarge { size: 2, max: 1 })
        ));
    }

    #[test]
    fn json_endpoint() {
        let store = store();
        let body = RequestBatch::new(vec![LeafRequest::read("r", "\"DB\".b")])
            .encode()
            .unwrap();

        let reply = store.handle_post(JSON_RPC_PATH, &body).unwrap();
        let response = ResponseBatch::decode(&reply).unwrap();
        assert_eq!(response.responses[0].outcome, LeafOutcome::Value(json!("text")));

        assert!(matches!(
            store.handle_post("/sync/pull", &body),
            Err(StoreError::UnknownEndpoint(_))
        ));
        assert!(matches!(
            store.handle_json(b"not json"),
            Err(StoreError::InvalidRequest(_))
        ));
    }
}
