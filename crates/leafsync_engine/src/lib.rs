//! # leafsync engine
//!
//! Client-side reconciliation engine for key-value stores that only read and
//! write single scalar addresses over a request/response transport.
//!
//! This crate provides:
//! - Schema navigation: structured keys expand into atomic leaf operations
//! - A grow-only mirror cache rebuilt from leaf responses
//! - Read and write transactions with configurable cache modes
//! - Subscriptions at any granularity, fanned out through a prefix trie
//! - A batching scheduler that sends one round trip per tick
//! - A JSON-RPC transport over an abstract HTTP client
//!
//! ## Architecture
//!
//! Calls to [`Engine::get`], [`Engine::write`] and [`Engine::subscribe`]
//! never touch the network. They register work that the next
//! [`Engine::tick`] gathers into a single batch:
//! 1. Expand pending writes, reads and subscribed keys into leaves
//! 2. Send the batch (or a liveness ping when nothing is pending)
//! 3. Mirror results, resolve transactions, notify subscribers
//!
//! [`Engine::start`] runs ticks on a tokio task, adapting the interval to the
//! observed round-trip time.
//!
//! ## Key Invariants
//!
//! - At most one batch is in flight
//! - Every transaction resolves exactly once
//! - The mirror is only mutated while dispatching a batch's results
//! - A failed batch leaves all pending work in place

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod arena;
mod batch;
mod cache;
mod config;
mod engine;
mod error;
mod key;
mod notify;
mod rpc;
mod scheduler;
mod schema;
mod subscription;
mod transaction;
mod transport;

pub use arena::{SlotArena, TxnId};
pub use cache::MirrorCache;
pub use config::{EngineConfig, RetryConfig};
pub use engine::{Engine, EngineStats, ErrorEvent, TickReport};
pub use error::{EngineError, EngineResult};
pub use key::{IntoKeys, KeyMap, LogicalKey, Segment};
pub use notify::{ChangeEvent, NotificationIndex};
pub use rpc::{HttpClient, LoopbackClient, LoopbackServer, RpcTransport};
pub use scheduler::{DelayModel, Mode, SchedulerHandle};
pub use schema::{Navigator, Schema, SchemaNode};
pub use subscription::Subscription;
pub use transaction::{CacheMode, LeafState, Pending};
pub use transport::{MockTransport, Transport};
