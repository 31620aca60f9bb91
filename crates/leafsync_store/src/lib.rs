//! # leafsync store
//!
//! In-memory reference implementation of a leaf-only key-value store.
//!
//! This crate provides:
//! - A value tree seeded from a schema example document
//! - Atomic reads and writes addressed in bracket notation (`"DB".arr[2]`)
//! - Per-operation errors (address not found, unsupported address,
//!   permission denied, invalid params)
//! - A JSON-RPC 2.0 batch endpoint
//!
//! # Architecture
//!
//! The store mirrors the behaviour of the controllers clients talk to: it
//! never accepts composite reads or writes, so every structured access must
//! be broken into leaves by the client. Out-of-band changes made with
//! [`MemoryStore::set`] model the controller changing its own values.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod address;
mod config;
mod error;
mod store;

pub use address::{parse_address, Step};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use store::MemoryStore;
