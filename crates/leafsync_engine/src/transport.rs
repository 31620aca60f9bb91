//! Transport layer abstraction for leaf batches.

use crate::error::{EngineError, EngineResult};
use leafsync_protocol::{
    Command, LeafRequest, LeafResponse, RemoteError, RequestBatch, ResponseBatch,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A transport sends one batch of atomic operations to the store and returns
/// the correlated results.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (JSON-RPC over HTTP, in-process, mock for testing).
/// A batch-level failure is an `Err`; per-leaf failures are carried inside
/// the returned [`ResponseBatch`].
pub trait Transport: Send + Sync {
    /// Sends a batch and waits for its responses.
    fn send(&self, batch: &RequestBatch) -> EngineResult<ResponseBatch>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> EngineResult<()>;
}

/// A mock transport for testing.
///
/// Answers leaf operations from an address map, records every batch it
/// receives, and can be told to fail whole batches or single addresses.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    failing: AtomicBool,
    values: Mutex<HashMap<String, Value>>,
    errors: Mutex<HashMap<String, RemoteError>>,
    sent: Mutex<Vec<RequestBatch>>,
}

impl MockTransport {
    /// Creates a new, connected mock transport with no values.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Sets the value at an address.
    pub fn set_value(&self, address: impl Into<String>, value: Value) {
        self.values.lock().insert(address.into(), value);
    }

    /// Returns the value at an address.
    pub fn value(&self, address: &str) -> Option<Value> {
        self.values.lock().get(address).cloned()
    }

    /// Makes every operation on `address` fail with `error`.
    pub fn fail_address(&self, address: impl Into<String>, error: RemoteError) {
        self.errors.lock().insert(address.into(), error);
    }

    /// Makes whole batches fail at the transport level.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Batches received so far, oldest first.
    pub fn sent(&self) -> Vec<RequestBatch> {
        self.sent.lock().clone()
    }

    /// The most recent batch.
    pub fn last_sent(&self) -> Option<RequestBatch> {
        self.sent.lock().last().cloned()
    }

    fn answer(&self, request: &LeafRequest) -> LeafResponse {
        let id = request.id.clone();
        if request.command == Command::Ping {
            return LeafResponse::value(id, Value::Bool(true));
        }

        let Some(address) = &request.address else {
            return LeafResponse::error(id, RemoteError::invalid_params("missing address"));
        };
        if let Some(error) = self.errors.lock().get(address) {
            return LeafResponse::error(id, error.clone());
        }

        match request.command {
            Command::Read => match self.values.lock().get(address) {
                Some(value) => LeafResponse::value(id, value.clone()),
                None => LeafResponse::error(id, RemoteError::address_not_found(address.clone())),
            },
            _ => match &request.value {
                Some(value) => {
                    self.values.lock().insert(address.clone(), value.clone());
                    LeafResponse::value(id, Value::Bool(true))
                }
                None => LeafResponse::error(id, RemoteError::invalid_params("missing value")),
            },
        }
    }
}

impl Transport for MockTransport {
    fn send(&self, batch: &RequestBatch) -> EngineResult<ResponseBatch> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected);
        }
        self.sent.lock().push(batch.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::transport_retryable("mock transport failure"));
        }

        let responses = batch.requests.iter().map(|r| self.answer(r)).collect();
        Ok(ResponseBatch::new(responses))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> EngineResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
