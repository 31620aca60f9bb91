//! Request and response batches and their JSON-RPC 2.0 encoding.
//!
//! A batch is sent as one JSON array of JSON-RPC calls. Every call carries
//! the correlation id of its [`LeafRequest`]; the store answers with an array
//! of results in any order, matched back by id.

use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::{Command, LeafOutcome, LeafRequest, LeafResponse};
use crate::remote::{RemoteError, RemoteErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version string.
pub const JSON_RPC_VERSION: &str = "2.0";

/// Path, relative to the store's base URL, that batches are posted to.
pub const JSON_RPC_PATH: &str = "/api/jsonrpc";

#[derive(Debug, Serialize, Deserialize)]
struct WireCall {
    jsonrpc: String,
    method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<WireParams>,
    id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireReply {
    #[serde(default)]
    jsonrpc: Option<String>,
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireError {
    code: i64,
    #[serde(default)]
    message: String,
}

/// A batch of atomic operations sent in one round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestBatch {
    /// Operations in send order.
    pub requests: Vec<LeafRequest>,
}

impl RequestBatch {
    /// Creates a batch from operations.
    pub fn new(requests: Vec<LeafRequest>) -> Self {
        Self { requests }
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns true if the batch has no operations.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Returns true if the batch is a lone liveness ping.
    pub fn is_ping_only(&self) -> bool {
        self.requests.len() == 1 && self.requests[0].command == Command::Ping
    }

    /// Converts to a JSON-RPC array.
    pub fn to_json_rpc(&self) -> Value {
        let calls: Vec<WireCall> = self
            .requests
            .iter()
            .map(|request| WireCall {
                jsonrpc: JSON_RPC_VERSION.to_string(),
                method: request.command.method().to_string(),
                params: match request.command {
                    Command::Ping => None,
                    Command::Read | Command::Write => Some(WireParams {
                        var: request.address.clone(),
                        value: request.value.clone(),
                    }),
                },
                id: request.id.clone(),
            })
            .collect();
        // Serializing plain structs of strings and values cannot fail.
        serde_json::to_value(calls).unwrap_or(Value::Array(Vec::new()))
    }

    /// Parses a JSON-RPC array.
    pub fn from_json_rpc(value: Value) -> ProtocolResult<Self> {
        let calls: Vec<WireCall> = serde_json::from_value(value)?;
        let mut requests = Vec::with_capacity(calls.len());

        for call in calls {
            let command = Command::from_method(&call.method)
                .ok_or_else(|| ProtocolError::UnknownMethod(call.method.clone()))?;
            let params = call.params.unwrap_or_default();
            let request = match command {
                Command::Ping => LeafRequest::ping(call.id),
                Command::Read => {
                    let address = params
                        .var
                        .ok_or_else(|| ProtocolError::missing_field(&call.id, "var"))?;
                    LeafRequest::read(call.id, address)
                }
                Command::Write => {
                    let address = params
                        .var
                        .ok_or_else(|| ProtocolError::missing_field(&call.id, "var"))?;
                    let value = params
                        .value
                        .ok_or_else(|| ProtocolError::missing_field(&call.id, "value"))?;
                    LeafRequest::write(call.id, address, value)
                }
            };
            requests.push(request);
        }

        Ok(Self { requests })
    }

    /// Encodes to JSON bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_json_rpc())?)
    }

    /// Decodes from JSON bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_json_rpc(value)
    }
}

/// The store's answers to a [`RequestBatch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseBatch {
    /// Responses, not necessarily in request order.
    pub responses: Vec<LeafResponse>,
}

impl ResponseBatch {
    /// Creates a batch from responses.
    pub fn new(responses: Vec<LeafResponse>) -> Self {
        Self { responses }
    }

    /// Number of responses.
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    /// Returns true if there are no responses.
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Converts to a JSON-RPC array.
    pub fn to_json_rpc(&self) -> Value {
        let replies: Vec<WireReply> = self
            .responses
            .iter()
            .map(|response| match &response.outcome {
                LeafOutcome::Value(value) => WireReply {
                    jsonrpc: Some(JSON_RPC_VERSION.to_string()),
                    id: response.id.clone(),
                    result: Some(value.clone()),
                    error: None,
                },
                LeafOutcome::Error(error) => WireReply {
                    jsonrpc: Some(JSON_RPC_VERSION.to_string()),
                    id: response.id.clone(),
                    result: None,
                    error: Some(WireError {
                        code: error.kind.to_code(),
                        message: error.message.clone(),
                    }),
                },
            })
            .collect();
        serde_json::to_value(replies).unwrap_or(Value::Array(Vec::new()))
    }

    /// Parses a JSON-RPC array.
    ///
    /// A reply without `error` is a success; a missing or `null` result is
    /// read as `null`.
    pub fn from_json_rpc(value: Value) -> ProtocolResult<Self> {
        let replies: Vec<WireReply> = serde_json::from_value(value)?;
        let responses = replies
            .into_iter()
            .map(|reply| match reply.error {
                Some(error) => LeafResponse::error(
                    reply.id,
                    RemoteError::new(RemoteErrorKind::from_code(error.code), error.message),
                ),
                None => LeafResponse::value(reply.id, reply.result.unwrap_or(Value::Null)),
            })
            .collect();
        Ok(Self { responses })
    }

    /// Encodes to JSON bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_json_rpc())?)
    }

    /// Decodes from JSON bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_json_rpc(value)
    }
}
