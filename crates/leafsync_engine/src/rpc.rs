//! JSON-RPC transport over HTTP.
//!
//! The actual HTTP client is abstracted via a trait so hosts can plug in
//! whichever library they already use (reqwest, hyper, ureq) or route
//! requests in-process.

use crate::error::{EngineError, EngineResult};
use crate::transport::Transport;
use leafsync_protocol::{RequestBatch, ResponseBatch, JSON_RPC_PATH};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// HTTP client abstraction.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// Transport that posts each batch as one JSON-RPC 2.0 batch request.
pub struct RpcTransport<C: HttpClient> {
    /// Base URL of the store (e.g., "https://plc.example.com").
    base_url: String,
    client: C,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> RpcTransport<C> {
    /// Creates a new transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL of the JSON-RPC endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, JSON_RPC_PATH)
    }

    /// Returns the last client error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

impl<C: HttpClient> Transport for RpcTransport<C> {
    fn send(&self, batch: &RequestBatch) -> EngineResult<ResponseBatch> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected);
        }

        let body = batch
            .encode()
            .map_err(|e| EngineError::Protocol(format!("failed to encode batch: {e}")))?;

        debug!(operations = batch.len(), "posting batch");
        let response = self.client.post(&self.endpoint(), body).map_err(|e| {
            *self.last_error.write() = Some(e.clone());
            EngineError::transport_retryable(e)
        })?;
        *self.last_error.write() = None;

        ResponseBatch::decode(&response)
            .map_err(|e| EngineError::Protocol(format!("failed to decode response: {e}")))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> EngineResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

/// An HTTP client that routes requests directly to an in-process server.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// The server behind this client.
    pub fn server(&self) -> &S {
        &self.server
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        let path = url.find("/api/").map(|i| &url[i..]).unwrap_or(url);
        self.server.handle_post(path, &body)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
