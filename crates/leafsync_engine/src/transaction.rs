//! Read and write transaction registries.
//!
//! Every open `get` or `write` is a transaction that waits on a set of leaf
//! operations. A transaction resolves exactly once, when every leaf it
//! depends on has reported, and is then removed from its registry.

use crate::arena::{SlotArena, TxnId};
use crate::error::{EngineError, EngineResult};
use crate::key::LogicalKey;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// How a `get` may use local state instead of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheMode {
    /// Always read from the store on the next tick.
    #[default]
    IgnoreCache,
    /// Answer from the mirror when every requested leaf is mirrored.
    UseCache,
    /// Answer with the value of a pending write to the key, assuming it will
    /// succeed; otherwise like `UseCache`.
    UseWrite,
    /// Wait for a pending write to the key to resolve, then answer from the
    /// mirror; otherwise like `UseCache`.
    WaitForWrite,
}

impl CacheMode {
    /// Returns true for modes that only accept a single key.
    pub fn requires_single_key(&self) -> bool {
        matches!(self, CacheMode::UseWrite | CacheMode::WaitForWrite)
    }

    /// Upper-case name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            CacheMode::IgnoreCache => "IGNORE_CACHE",
            CacheMode::UseCache => "USE_CACHE",
            CacheMode::UseWrite => "USE_WRITE",
            CacheMode::WaitForWrite => "WAIT_FOR_WRITE",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one dependent leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafState {
    /// No result yet.
    Pending,
    /// The leaf operation succeeded.
    Succeeded,
    /// The store rejected the leaf operation.
    Failed,
}

/// Handle to a result that arrives later.
///
/// Await it, or poll it from synchronous code with [`Pending::try_take`].
#[derive(Debug)]
pub struct Pending<T> {
    inner: PendingInner<T>,
}

#[derive(Debug)]
enum PendingInner<T> {
    Ready(Option<EngineResult<T>>),
    Waiting(oneshot::Receiver<EngineResult<T>>),
}

impl<T> Pending<T> {
    /// A handle that is already resolved.
    pub fn ready(result: EngineResult<T>) -> Self {
        Self {
            inner: PendingInner::Ready(Some(result)),
        }
    }

    pub(crate) fn channel() -> (oneshot::Sender<EngineResult<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                inner: PendingInner::Waiting(rx),
            },
        )
    }

    /// Takes the result if it has arrived.
    ///
    /// Returns `None` while the transaction is open. After the result has
    /// been taken once, further calls return `Err(Cancelled)`.
    pub fn try_take(&mut self) -> Option<EngineResult<T>> {
        match &mut self.inner {
            PendingInner::Ready(result) => Some(result.take().unwrap_or(Err(EngineError::Cancelled))),
            PendingInner::Waiting(rx) => match rx.try_recv() {
                Ok(result) => {
                    self.inner = PendingInner::Ready(None);
                    Some(result)
                }
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(Err(EngineError::Cancelled)),
            },
        }
    }

    /// Returns true if the result can be taken without waiting.
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, PendingInner::Ready(Some(_)))
    }
}

impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
    type Output = EngineResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            PendingInner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(EngineError::Cancelled)))
            }
            PendingInner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(EngineError::Cancelled))),
        }
    }
}

/// An open `get`.
#[derive(Debug)]
pub(crate) struct ReadTxn {
    pub(crate) keys: Vec<LogicalKey>,
    pub(crate) mode: CacheMode,
    pub(crate) depth: usize,
    leaves: BTreeMap<LogicalKey, LeafState>,
    failure: Option<EngineError>,
    waiters: Vec<oneshot::Sender<EngineResult<Value>>>,
}

impl ReadTxn {
    /// First remote failure among the leaves, if any.
    pub(crate) fn failure(&self) -> Option<&EngineError> {
        self.failure.as_ref()
    }

    /// Delivers the terminal result to every waiter.
    pub(crate) fn finish(self, result: EngineResult<Value>) {
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Registry of open `get` transactions.
#[derive(Debug, Default)]
pub(crate) struct ReadRegistry {
    txns: SlotArena<ReadTxn>,
}

impl ReadRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Finds an open transaction for the same keys, mode and depth.
    pub(crate) fn find_identical(
        &self,
        keys: &[LogicalKey],
        mode: CacheMode,
        depth: usize,
    ) -> Option<TxnId> {
        self.txns
            .iter()
            .find(|(_, txn)| txn.keys == keys && txn.mode == mode && txn.depth == depth)
            .map(|(id, _)| id)
    }

    /// Opens a transaction waiting on `leaves`.
    pub(crate) fn create(
        &mut self,
        keys: Vec<LogicalKey>,
        mode: CacheMode,
        depth: usize,
        leaves: Vec<LogicalKey>,
    ) -> (TxnId, Pending<Value>) {
        let (tx, pending) = Pending::channel();
        let txn = ReadTxn {
            keys,
            mode,
            depth,
            leaves: leaves
                .into_iter()
                .map(|leaf| (leaf, LeafState::Pending))
                .collect(),
            failure: None,
            waiters: vec![tx],
        };
        (self.txns.insert(txn), pending)
    }

    /// Adds another waiter to an open transaction.
    pub(crate) fn attach(&mut self, id: TxnId) -> Option<Pending<Value>> {
        let txn = self.txns.get_mut(id)?;
        let (tx, pending) = Pending::channel();
        txn.waiters.push(tx);
        Some(pending)
    }

    /// Leaves still waiting for a read result, per transaction.
    pub(crate) fn pending_leaves(&self) -> Vec<(TxnId, LogicalKey)> {
        self.txns
            .iter()
            .flat_map(|(id, txn)| {
                txn.leaves
                    .iter()
                    .filter(|(_, state)| **state == LeafState::Pending)
                    .map(move |(leaf, _)| (id, leaf.clone()))
            })
            .collect()
    }

    /// Records the result of one leaf read.
    ///
    /// Returns the transaction, removed from the registry, once all of its
    /// leaves have reported.
    pub(crate) fn resolve_leaf(
        &mut self,
        id: TxnId,
        leaf: &LogicalKey,
        outcome: Result<(), EngineError>,
    ) -> Option<ReadTxn> {
        let txn = self.txns.get_mut(id)?;
        let state = txn.leaves.get_mut(leaf)?;
        if *state != LeafState::Pending {
            return None;
        }
        match outcome {
            Ok(()) => *state = LeafState::Succeeded,
            Err(err) => {
                *state = LeafState::Failed;
                txn.failure.get_or_insert(err);
            }
        }

        let complete = txn.leaves.values().all(|state| *state != LeafState::Pending);
        if complete {
            self.txns.remove(id)
        } else {
            None
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.txns.len()
    }
}

/// An open `write`.
#[derive(Debug)]
pub(crate) struct WriteTxn {
    pub(crate) key: LogicalKey,
    pub(crate) value: Value,
    seq: u64,
    leaves: BTreeMap<LogicalKey, (Value, LeafState)>,
    waiter: Option<oneshot::Sender<EngineResult<bool>>>,
    read_waiters: Vec<oneshot::Sender<EngineResult<Value>>>,
}

impl WriteTxn {
    /// Logical AND of every leaf outcome.
    pub(crate) fn succeeded(&self) -> bool {
        self.leaves
            .values()
            .all(|(_, state)| *state == LeafState::Succeeded)
    }

    /// Delivers the write result and answers reads that waited on it.
    ///
    /// `read_value` is the mirrored value of the key after the write, used
    /// for reads waiting on a successful write.
    pub(crate) fn finish(self, read_value: Value) {
        let success = self.succeeded();
        if let Some(waiter) = self.waiter {
            let _ = waiter.send(Ok(success));
        }
        for waiter in self.read_waiters {
            let result = if success {
                Ok(read_value.clone())
            } else {
                Err(EngineError::WriteFailed(self.key.to_string()))
            };
            let _ = waiter.send(result);
        }
    }
}

/// Registry of open `write` transactions.
#[derive(Debug, Default)]
pub(crate) struct WriteRegistry {
    txns: SlotArena<WriteTxn>,
    next_seq: u64,
}

impl WriteRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Opens a write of `value` to `key`. Dependents are added separately.
    pub(crate) fn create(&mut self, key: LogicalKey, value: Value) -> (TxnId, Pending<bool>) {
        let (tx, pending) = Pending::channel();
        self.next_seq += 1;
        let txn = WriteTxn {
            key,
            value,
            seq: self.next_seq,
            leaves: BTreeMap::new(),
            waiter: Some(tx),
            read_waiters: Vec::new(),
        };
        (self.txns.insert(txn), pending)
    }

    /// Adds a leaf write the transaction depends on.
    pub(crate) fn add_dependent_key(&mut self, id: TxnId, leaf: LogicalKey, value: Value) {
        if let Some(txn) = self.txns.get_mut(id) {
            txn.leaves.insert(leaf, (value, LeafState::Pending));
        }
    }

    /// Records the result of one leaf write.
    ///
    /// Returns the transaction, removed from the registry, once all of its
    /// leaves have reported.
    pub(crate) fn resolve_dependent_key(
        &mut self,
        id: TxnId,
        leaf: &LogicalKey,
        success: bool,
    ) -> Option<WriteTxn> {
        let txn = self.txns.get_mut(id)?;
        let (_, state) = txn.leaves.get_mut(leaf)?;
        if *state != LeafState::Pending {
            return None;
        }
        *state = if success {
            LeafState::Succeeded
        } else {
            LeafState::Failed
        };

        let complete = txn
            .leaves
            .values()
            .all(|(_, state)| *state != LeafState::Pending);
        if complete {
            self.txns.remove(id)
        } else {
            None
        }
    }

    /// Removes a transaction that has no dependents left to wait for.
    pub(crate) fn take_if_complete(&mut self, id: TxnId) -> Option<WriteTxn> {
        let txn = self.txns.get(id)?;
        if txn.leaves.values().all(|(_, state)| *state != LeafState::Pending) {
            self.txns.remove(id)
        } else {
            None
        }
    }

    /// Returns true if any of `keys` is the target of an open write.
    pub(crate) fn is_currently_writing(&self, keys: &[LogicalKey]) -> bool {
        self.txns.iter().any(|(_, txn)| keys.contains(&txn.key))
    }

    /// The most recently opened write targeting `key`.
    pub(crate) fn latest_for(&self, key: &LogicalKey) -> Option<TxnId> {
        self.txns
            .iter()
            .filter(|(_, txn)| &txn.key == key)
            .max_by_key(|(_, txn)| txn.seq)
            .map(|(id, _)| id)
    }

    /// Value being written by `id`.
    pub(crate) fn value_of(&self, id: TxnId) -> Option<&Value> {
        self.txns.get(id).map(|txn| &txn.value)
    }

    /// Registers a read that resolves when `id` does.
    pub(crate) fn add_read_waiter(&mut self, id: TxnId) -> Option<Pending<Value>> {
        let txn = self.txns.get_mut(id)?;
        let (tx, pending) = Pending::channel();
        txn.read_waiters.push(tx);
        Some(pending)
    }

    /// Leaf writes still waiting for a result.
    pub(crate) fn pending_leaves(&self) -> Vec<(TxnId, LogicalKey, Value)> {
        self.txns
            .iter()
            .flat_map(|(id, txn)| {
                txn.leaves
                    .iter()
                    .filter(|(_, (_, state))| *state == LeafState::Pending)
                    .map(move |(leaf, (value, _))| (id, leaf.clone(), value.clone()))
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.txns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(raw: &str) -> LogicalKey {
        LogicalKey::parse(raw).unwrap()
    }

    #[test]
    fn read_resolves_once_after_all_leaves_in_any_order() {
        let mut reads = ReadRegistry::new();
        let leaves = vec![key("DB.a"), key("DB.b"), key("DB.c")];
        let (id, mut pending) =
            reads.create(vec![key("DB")], CacheMode::IgnoreCache, 32, leaves.clone());

        assert!(reads.resolve_leaf(id, &key("DB.c"), Ok(())).is_none());
        assert!(reads.resolve_leaf(id, &key("DB.a"), Ok(())).is_none());
        assert!(reads.resolve_leaf(id, &key("DB.a"), Ok(())).is_none());
        assert!(pending.try_take().is_none());

        let txn = reads.resolve_leaf(id, &key("DB.b"), Ok(())).unwrap();
        assert!(txn.failure().is_none());
        txn.finish(Ok(json!({"a": 1})));

        assert_eq!(pending.try_take(), Some(Ok(json!({"a": 1}))));
        assert_eq!(reads.len(), 0);
        assert!(reads.resolve_leaf(id, &key("DB.b"), Ok(())).is_none());
    }

    #[test]
    fn read_records_first_failure() {
        let mut reads = ReadRegistry::new();
        let (id, _pending) = reads.create(
            vec![key("DB")],
            CacheMode::IgnoreCache,
            32,
            vec![key("DB.a"), key("DB.b")],
        );
        reads.resolve_leaf(id, &key("DB.a"), Err(EngineError::WriteFailed("first".into())));
        let txn = reads
            .resolve_leaf(id, &key("DB.b"), Err(EngineError::WriteFailed("second".into())))
            .unwrap();
        assert_eq!(txn.failure(), Some(&EngineError::WriteFailed("first".into())));
    }

    #[test]
    fn identical_reads_share_one_transaction() {
        let mut reads = ReadRegistry::new();
        let (id, mut first) =
            reads.create(vec![key("DB.a")], CacheMode::IgnoreCache, 32, vec![key("DB.a")]);

        assert_eq!(
            reads.find_identical(&[key("DB.a")], CacheMode::IgnoreCache, 32),
            Some(id)
        );
        assert_eq!(
            reads.find_identical(&[key("DB.a")], CacheMode::UseCache, 32),
            None
        );
        assert_eq!(
            reads.find_identical(&[key("DB.a")], CacheMode::IgnoreCache, 2),
            None
        );

        let mut second = reads.attach(id).unwrap();
        let txn = reads.resolve_leaf(id, &key("DB.a"), Ok(())).unwrap();
        txn.finish(Ok(json!(3)));

        assert_eq!(first.try_take(), Some(Ok(json!(3))));
        assert_eq!(second.try_take(), Some(Ok(json!(3))));
    }

    #[test]
    fn pending_read_leaves() {
        let mut reads = ReadRegistry::new();
        let (id, _p) = reads.create(
            vec![key("DB")],
            CacheMode::IgnoreCache,
            32,
            vec![key("DB.a"), key("DB.b")],
        );
        reads.resolve_leaf(id, &key("DB.a"), Ok(()));
        assert_eq!(reads.pending_leaves(), vec![(id, key("DB.b"))]);
    }

    #[test]
    fn write_result_is_and_of_leaves() {
        let mut writes = WriteRegistry::new();
        let (id, mut pending) = writes.create(key("DB"), json!({"a": 1, "b": 2}));
        writes.add_dependent_key(id, key("DB.a"), json!(1));
        writes.add_dependent_key(id, key("DB.b"), json!(2));
        let mut waiting_read = writes.add_read_waiter(id).unwrap();

        assert!(writes.is_currently_writing(&[key("DB")]));
        assert!(!writes.is_currently_writing(&[key("DB.a")]));
        assert_eq!(writes.pending_leaves().len(), 2);

        assert!(writes.resolve_dependent_key(id, &key("DB.b"), false).is_none());
        let txn = writes.resolve_dependent_key(id, &key("DB.a"), true).unwrap();
        assert!(!txn.succeeded());
        txn.finish(json!(null));

        assert_eq!(pending.try_take(), Some(Ok(false)));
        assert_eq!(
            waiting_read.try_take(),
            Some(Err(EngineError::WriteFailed("DB".into())))
        );
        assert!(!writes.is_currently_writing(&[key("DB")]));
    }

    #[test]
    fn latest_write_wins_for_lookups() {
        let mut writes = WriteRegistry::new();
        let (first, _a) = writes.create(key("DB.a"), json!(1));
        let (second, _b) = writes.create(key("DB.a"), json!(2));

        assert_ne!(first, second);
        assert_eq!(writes.latest_for(&key("DB.a")), Some(second));
        assert_eq!(writes.value_of(second), Some(&json!(2)));
        assert_eq!(writes.latest_for(&key("DB.b")), None);
        assert_eq!(writes.len(), 2);
    }

    #[test]
    fn pending_handles() {
        let mut ready = Pending::ready(Ok(5));
        assert!(ready.is_ready());
        assert_eq!(ready.try_take(), Some(Ok(5)));
        assert_eq!(ready.try_take(), Some(Err(EngineError::Cancelled)));

        let (tx, mut waiting) = Pending::<bool>::channel();
        assert!(waiting.try_take().is_none());
        drop(tx);
        assert_eq!(waiting.try_take(), Some(Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn pending_is_a_future() {
        let (tx, pending) = Pending::<Value>::channel();
        tx.send(Ok(json!("done"))).unwrap();
        assert_eq!(pending.await, Ok(json!("done")));
    }

    #[test]
    fn cache_mode_names() {
        assert_eq!(CacheMode::default(), CacheMode::IgnoreCache);
        assert!(CacheMode::WaitForWrite.requires_single_key());
        assert!(!CacheMode::UseCache.requires_single_key());
        assert_eq!(CacheMode::UseWrite.to_string(), "USE_WRITE");
    }
}
