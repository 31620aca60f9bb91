//! Batch assembly and correlation of results.
//!
//! Each atomic operation in a batch is tagged with a short hash of a
//! readable correlation id such as `READ:"DB".a:3`. The table remembers what
//! each hash stands for so results can be routed back when they return.

use crate::arena::TxnId;
use crate::error::{EngineError, EngineResult};
use crate::key::LogicalKey;
use leafsync_protocol::{LeafRequest, RequestBatch};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Probes tried before giving up on a free hash.
const MAX_PROBES: usize = 64;

/// What an atomic operation was sent for.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Origin {
    /// A leaf read, shared by every transaction waiting on the leaf.
    Read {
        leaf: LogicalKey,
        waiting: Vec<TxnId>,
    },
    /// One leaf of a write transaction.
    Write {
        leaf: LogicalKey,
        txn: TxnId,
        value: Value,
    },
    /// Liveness ping.
    Ping,
}

#[derive(Debug)]
struct Entry {
    readable: String,
    origin: Origin,
}

/// Maps correlation hashes to the operations they were issued for.
#[derive(Debug)]
pub(crate) struct CorrelationTable {
    hash_len: usize,
    entries: HashMap<String, Entry>,
}

impl CorrelationTable {
    pub(crate) fn new(hash_len: usize) -> Self {
        Self {
            hash_len: hash_len.clamp(1, 64),
            entries: HashMap::new(),
        }
    }

    /// Allocates a hash for `readable`, probing with `#1`, `#2`, ... on
    /// collision.
    pub(crate) fn register(&mut self, readable: &str, origin: Origin) -> EngineResult<String> {
        for probe in 0..=MAX_PROBES {
            let candidate = if probe == 0 {
                readable.to_string()
            } else {
                format!("{readable}#{probe}")
            };
            let hash = short_hash(&candidate, self.hash_len);
            if !self.entries.contains_key(&hash) {
                self.entries.insert(
                    hash.clone(),
                    Entry {
                        readable: candidate,
                        origin,
                    },
                );
                return Ok(hash);
            }
        }
        Err(EngineError::Protocol(format!(
            "no free correlation hash for `{readable}` after {MAX_PROBES} probes"
        )))
    }

    /// Removes and returns the entry for `hash`.
    pub(crate) fn take(&mut self, hash: &str) -> Option<(String, Origin)> {
        self.entries
            .remove(hash)
            .map(|entry| (entry.readable, entry.origin))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// First `len` hex digits of the SHA-256 of `text`.
pub(crate) fn short_hash(text: &str, len: usize) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest.iter() {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(len);
    hex
}

/// A batch ready to send, with the table to route its results.
#[derive(Debug)]
pub(crate) struct PreparedBatch {
    pub(crate) requests: RequestBatch,
    pub(crate) table: CorrelationTable,
}

impl PreparedBatch {
    pub(crate) fn new(hash_len: usize) -> Self {
        Self {
            requests: RequestBatch::default(),
            table: CorrelationTable::new(hash_len),
        }
    }

    /// Adds a leaf read. `requester` names the first transaction needing it,
    /// or `sub` when only subscriptions do.
    pub(crate) fn push_read(
        &mut self,
        leaf: LogicalKey,
        address: String,
        requester: &str,
        waiting: Vec<TxnId>,
    ) -> EngineResult<()> {
        let readable = format!("READ:{leaf}:{requester}");
        let id = self.table.register(&readable, Origin::Read { leaf, waiting })?;
        self.requests.requests.push(LeafRequest::read(id, address));
        Ok(())
    }

    /// Adds one leaf of a write transaction.
    pub(crate) fn push_write(
        &mut self,
        leaf: LogicalKey,
        address: String,
        txn: TxnId,
        value: Value,
    ) -> EngineResult<()> {
        let readable = format!("WRITE:{leaf}:{txn}");
        let id = self.table.register(
            &readable,
            Origin::Write {
                leaf,
                txn,
                value: value.clone(),
            },
        )?;
        self.requests
            .requests
            .push(LeafRequest::write(id, address, value));
        Ok(())
    }

    /// Adds the liveness ping.
    pub(crate) fn push_ping(&mut self) -> EngineResult<()> {
        let id = self.table.register("PING", Origin::Ping)?;
        self.requests.requests.push(LeafRequest::ping(id));
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
