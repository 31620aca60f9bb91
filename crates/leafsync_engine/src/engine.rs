//! The reconciliation engine.
//!
//! [`Engine`] owns the mirror cache, both notification indexes and the
//! transaction registries behind one mutex. Public calls only queue work;
//! the network is touched exclusively by [`Engine::tick`], which gathers
//! every pending leaf operation into one batch, sends it, and dispatches the
//! results. Only one tick can be in flight at a time.

use crate::batch::{CorrelationTable, Origin, PreparedBatch};
use crate::cache::MirrorCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::key::{parse_keys, IntoKeys, KeyMap, LogicalKey};
use crate::notify::NotificationIndex;
use crate::scheduler::{self, DelayModel, Mode, SchedulerHandle};
use crate::schema::{Navigator, Schema};
use crate::subscription::Subscription;
use crate::transaction::{CacheMode, Pending, ReadRegistry, WriteRegistry, WriteTxn};
use crate::transport::Transport;
use leafsync_protocol::{LeafOutcome, LeafResponse, RemoteError, ResponseBatch};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

/// An error published on the shared error stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorEvent {
    /// The store rejected one atomic operation.
    Remote {
        /// Leaf the operation targeted.
        key: LogicalKey,
        /// Error reported by the store.
        error: RemoteError,
    },
    /// A whole batch could not be delivered.
    Transport {
        /// Description of the failure.
        message: String,
        /// Number of consecutive failed batches, this one included.
        attempt: u32,
    },
}

/// Counters maintained by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    /// Completed ticks.
    pub ticks: u64,
    /// Ticks that carried only a liveness ping.
    pub pings: u64,
    /// Successful leaf reads.
    pub leaves_read: u64,
    /// Successful leaf writes.
    pub leaves_written: u64,
    /// Batches that failed at the transport level.
    pub transport_failures: u64,
    /// Atomic operations rejected by the store.
    pub remote_errors: u64,
    /// Duration of the last successful round trip.
    pub last_round_trip: Option<Duration>,
}

/// Summary of one completed tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Mode the tick ran in.
    pub mode: Mode,
    /// Atomic operations sent.
    pub operations: usize,
    /// Round-trip time of the batch.
    pub elapsed: Duration,
    /// Delay until the next tick.
    pub next_delay: Duration,
}

struct State {
    cache: MirrorCache,
    cached_index: NotificationIndex,
    fresh_index: NotificationIndex,
    reads: ReadRegistry,
    writes: WriteRegistry,
    mode: Mode,
    delay: DelayModel,
    stats: EngineStats,
    failures: u32,
}

impl State {
    fn index_mut(&mut self, ignore_cache: bool) -> &mut NotificationIndex {
        if ignore_cache {
            &mut self.fresh_index
        } else {
            &mut self.cached_index
        }
    }
}

pub(crate) struct Core {
    config: EngineConfig,
    navigator: Navigator,
    state: Mutex<State>,
    wake: Notify,
    retry: Notify,
    in_flight: AtomicBool,
    errors: broadcast::Sender<ErrorEvent>,
}

impl Core {
    /// Drops one reference on each key.
    pub(crate) fn release(&self, keys: &[LogicalKey], ignore_cache: bool) {
        let mut state = self.state.lock();
        let index = state.index_mut(ignore_cache);
        for key in keys {
            index.decrement(key);
        }
    }

    fn wake_if_slow(&self, mode: Mode) {
        if mode == Mode::Slow {
            self.wake.notify_one();
        }
    }

    fn gather(&self, state: &mut State) -> EngineResult<(PreparedBatch, Mode)> {
        let mut batch = PreparedBatch::new(self.config.correlation_hash_len);

        for (txn, leaf, value) in state.writes.pending_leaves() {
            let address = self.navigator.address(&leaf);
            batch.push_write(leaf, address, txn, value)?;
        }

        // One read per leaf; the first requester names the correlation id.
        let mut reads: BTreeMap<LogicalKey, (String, Vec<_>)> = BTreeMap::new();
        for (txn, leaf) in state.reads.pending_leaves() {
            reads
                .entry(leaf)
                .or_insert_with(|| (txn.to_string(), Vec::new()))
                .1
                .push(txn);
        }

        let mut subscribed = state.cached_index.active_keys();
        subscribed.extend(state.fresh_index.active_keys());
        for key in subscribed {
            match self.navigator.read_leaves(&key, self.config.max_depth) {
                Ok(leaves) => {
                    for leaf in leaves {
                        reads
                            .entry(leaf)
                            .or_insert_with(|| ("sub".to_string(), Vec::new()));
                    }
                }
                Err(err) => warn!(key = %key, error = %err, "cannot expand subscribed key"),
            }
        }

        for (leaf, (requester, waiting)) in reads {
            let address = self.navigator.address(&leaf);
            batch.push_read(leaf, address, &requester, waiting)?;
        }

        let mode = if batch.is_empty() {
            batch.push_ping()?;
            Mode::Slow
        } else {
            Mode::Fast
        };
        state.mode = mode;
        Ok((batch, mode))
    }

    fn dispatch(&self, state: &mut State, mut table: CorrelationTable, response: ResponseBatch) {
        let mut done_reads = Vec::new();
        let mut done_writes = Vec::new();

        for LeafResponse { id, outcome } in response.responses {
            let Some((readable, origin)) = table.take(&id) else {
                warn!(id = %id, "response with unknown correlation id");
                continue;
            };

            match (origin, outcome) {
                (Origin::Ping, _) => {}
                (Origin::Read { leaf, waiting }, LeafOutcome::Value(value)) => {
                    state.stats.leaves_read += 1;
                    let result = self.mirror(state, &leaf, value);
                    if let Err(err) = &result {
                        warn!(op = %readable, error = %err, "cannot mirror read result");
                    }
                    for txn in waiting {
                        if let Some(done) = state.reads.resolve_leaf(txn, &leaf, result.clone()) {
                            done_reads.push(done);
                        }
                    }
                }
                (Origin::Read { leaf, waiting }, LeafOutcome::Error(error)) => {
                    self.report_remote(state, &readable, &leaf, &error);
                    let err = EngineError::Remote {
                        key: leaf.to_string(),
                        error,
                    };
                    for txn in waiting {
                        if let Some(done) = state.reads.resolve_leaf(txn, &leaf, Err(err.clone())) {
                            done_reads.push(done);
                        }
                    }
                }
                (Origin::Write { leaf, txn, value }, LeafOutcome::Value(_)) => {
                    state.stats.leaves_written += 1;
                    if let Err(err) = self.mirror(state, &leaf, value) {
                        warn!(op = %readable, error = %err, "cannot mirror written value");
                    }
                    if let Some(done) = state.writes.resolve_dependent_key(txn, &leaf, true) {
                        done_writes.push(done);
                    }
                }
                (Origin::Write { leaf, txn, .. }, LeafOutcome::Error(error)) => {
                    self.report_remote(state, &readable, &leaf, &error);
                    if let Some(done) = state.writes.resolve_dependent_key(txn, &leaf, false) {
                        done_writes.push(done);
                    }
                }
            }
        }

        if !table.is_empty() {
            debug!(unanswered = table.len(), "operations left pending for the next tick");
        }

        for txn in done_writes {
            complete_write(state, txn);
        }
        for txn in done_reads {
            let result = match txn.failure() {
                Some(err) => Err(err.clone()),
                None => Ok(assemble(&state.cache, &txn.keys)),
            };
            txn.finish(result);
        }
    }

    /// Writes a leaf into the mirror and notifies observers.
    ///
    /// The cache-aware index only hears about values that changed.
    fn mirror(&self, state: &mut State, leaf: &LogicalKey, value: Value) -> EngineResult<()> {
        let previous = state.cache.write(leaf, value.clone())?;
        let changed = previous.as_ref() != Some(&value);
        state.fresh_index.notify(leaf, &state.cache);
        if changed {
            state.cached_index.notify(leaf, &state.cache);
        }
        Ok(())
    }

    fn report_remote(&self, state: &mut State, op: &str, leaf: &LogicalKey, error: &RemoteError) {
        state.stats.remote_errors += 1;
        debug!(op = %op, error = %error, "store rejected operation");
        let _ = self.errors.send(ErrorEvent::Remote {
            key: leaf.clone(),
            error: error.clone(),
        });
    }
}

/// Merges a resolved write into the mirror and wakes its waiters.
fn complete_write(state: &mut State, txn: WriteTxn) {
    if txn.succeeded() {
        if let Err(err) = state.cache.merge(&txn.key, txn.value.clone()) {
            warn!(key = %txn.key, error = %err, "cannot merge written value");
        }
    }
    let value = state.cache.read_copy(&txn.key).unwrap_or(Value::Null);
    txn.finish(value);
}

/// Result of a read: the single value, or an object keyed by trailing segment.
fn assemble(cache: &MirrorCache, keys: &[LogicalKey]) -> Value {
    if let [key] = keys {
        return cache.read_copy(key).unwrap_or(Value::Null);
    }
    let mut out = Map::new();
    for key in keys {
        out.insert(
            key.trailing_segment(),
            cache.read_copy(key).unwrap_or(Value::Null),
        );
    }
    Value::Object(out)
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Client-side access layer for a leaf-only key-value store.
///
/// Cloning an engine is cheap; all clones share the same state.
///
/// # Example
///
/// ```
/// use leafsync_engine::{CacheMode, Engine, EngineConfig, MockTransport, Schema};
/// use serde_json::json;
///
/// let schema = Schema::from_value(&json!({"\"DB\"": {"a": 0, "b": 0}}));
/// let transport = MockTransport::new();
/// transport.set_value("\"DB\".a", json!(1));
/// transport.set_value("\"DB\".b", json!(2));
///
/// let engine = Engine::new(EngineConfig::default(), Some(schema), transport).unwrap();
/// let mut value = engine.get("\"DB\"", CacheMode::IgnoreCache).unwrap();
/// engine.tick().unwrap();
/// assert_eq!(value.try_take(), Some(Ok(json!({"a": 1, "b": 2}))));
/// ```
pub struct Engine<T: Transport> {
    core: Arc<Core>,
    transport: Arc<T>,
}

impl<T: Transport> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T: Transport> Engine<T> {
    /// Creates an engine.
    ///
    /// Fails if the configuration is invalid, a prefix or initial key does
    /// not parse, or an initial key is not declared in the schema.
    pub fn new(config: EngineConfig, schema: Option<Schema>, transport: T) -> EngineResult<Self> {
        config.validate()?;
        let map = KeyMap::from_pairs(&config.prefix_map)?;
        let navigator = Navigator::new(schema, map);
        for key in &config.initial_keys {
            navigator.check(&LogicalKey::parse(key)?)?;
        }

        let (errors, _) = broadcast::channel(config.event_buffer);
        let state = State {
            cache: MirrorCache::new(),
            cached_index: NotificationIndex::new(config.event_buffer),
            fresh_index: NotificationIndex::new(config.event_buffer),
            reads: ReadRegistry::new(),
            writes: WriteRegistry::new(),
            mode: Mode::Slow,
            delay: DelayModel::new(&config),
            stats: EngineStats::default(),
            failures: 0,
        };

        Ok(Self {
            core: Arc::new(Core {
                config,
                navigator,
                state: Mutex::new(state),
                wake: Notify::new(),
                retry: Notify::new(),
                in_flight: AtomicBool::new(false),
                errors,
            }),
            transport: Arc::new(transport),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Schema navigator used for expansion and address translation.
    pub fn navigator(&self) -> &Navigator {
        &self.core.navigator
    }

    /// The transport batches are sent through.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Reads one or more keys, bounded by the configured maximum depth.
    pub fn get(&self, keys: impl IntoKeys, mode: CacheMode) -> EngineResult<Pending<Value>> {
        self.get_with_depth(keys, mode, self.core.config.max_depth)
    }

    /// Reads one or more keys.
    ///
    /// A single key resolves to its value; several keys resolve to an object
    /// keyed by each key's trailing segment. Configuration errors (unknown
    /// key, colliding trailing segments, several keys with a write-aware
    /// mode) are returned immediately.
    pub fn get_with_depth(
        &self,
        keys: impl IntoKeys,
        mode: CacheMode,
        depth: usize,
    ) -> EngineResult<Pending<Value>> {
        let keys = parse_keys(keys)?;
        if mode.requires_single_key() && keys.len() != 1 {
            return Err(EngineError::MultiKeyMode {
                mode: mode.name(),
                count: keys.len(),
            });
        }
        for key in &keys {
            self.core.navigator.check(key)?;
        }
        if keys.len() > 1 {
            let mut fields = HashSet::new();
            for key in &keys {
                let field = key.trailing_segment();
                if !fields.insert(field.clone()) {
                    return Err(EngineError::KeyCollision(field));
                }
            }
        }

        let mut leaves = BTreeSet::new();
        for key in &keys {
            leaves.extend(self.core.navigator.read_leaves(key, depth)?);
        }

        let mut guard = self.core.state.lock();
        let state = &mut *guard;

        if let Some(write) = state.writes.latest_for(&keys[0]) {
            match mode {
                CacheMode::UseWrite => {
                    let value = state.writes.value_of(write).cloned().unwrap_or(Value::Null);
                    return Ok(Pending::ready(Ok(value)));
                }
                CacheMode::WaitForWrite => {
                    if let Some(pending) = state.writes.add_read_waiter(write) {
                        return Ok(pending);
                    }
                }
                _ => {}
            }
        }

        let cached = mode != CacheMode::IgnoreCache
            && leaves.iter().all(|leaf| state.cache.exists(leaf));
        if cached || leaves.is_empty() {
            return Ok(Pending::ready(Ok(assemble(&state.cache, &keys))));
        }

        if let Some(open) = state.reads.find_identical(&keys, mode, depth) {
            if let Some(pending) = state.reads.attach(open) {
                return Ok(pending);
            }
        }

        let (txn, pending) = state
            .reads
            .create(keys, mode, depth, leaves.into_iter().collect());
        debug!(txn = %txn, mode = %mode, "read queued");
        let current = state.mode;
        drop(guard);
        self.core.wake_if_slow(current);
        Ok(pending)
    }

    /// Writes `value` to `key`, resolving to true once every leaf write
    /// succeeded.
    ///
    /// Composite values are split into leaf writes along the schema. A
    /// second write to a key with a write in flight is independent of the
    /// first; callers needing ordering must wait for the first result.
    pub fn write(&self, key: &str, value: Value) -> EngineResult<Pending<bool>> {
        let key = LogicalKey::parse(key)?;
        self.core.navigator.check(&key)?;
        let leaves = self
            .core
            .navigator
            .write_leaves(&key, &value, self.core.config.max_depth)?;

        let mut guard = self.core.state.lock();
        let state = &mut *guard;
        let (txn, pending) = state.writes.create(key, value);
        for (leaf, slice) in leaves {
            state.writes.add_dependent_key(txn, leaf, slice);
        }
        if let Some(empty) = state.writes.take_if_complete(txn) {
            complete_write(state, empty);
        }
        debug!(txn = %txn, "write queued");
        let current = state.mode;
        drop(guard);
        self.core.wake_if_slow(current);
        Ok(pending)
    }

    /// Subscribes to changes of one or more keys.
    ///
    /// With `ignore_cache` every poll of a subscribed leaf is delivered;
    /// otherwise only values that differ from the mirrored one are.
    ///
    /// Nothing is emitted on subscribe. A cache-aware subscriber joining
    /// after a value was mirrored hears nothing until that value changes;
    /// read it with [`Engine::peek`] or a [`CacheMode::UseCache`] get first.
    pub fn subscribe(&self, keys: impl IntoKeys, ignore_cache: bool) -> EngineResult<Subscription> {
        let keys = parse_keys(keys)?;
        for key in &keys {
            self.core.navigator.check(key)?;
        }

        let mut state = self.core.state.lock();
        let index = state.index_mut(ignore_cache);
        let receivers = keys
            .iter()
            .map(|key| {
                let receiver = index.register(key);
                index.increment(key);
                receiver
            })
            .collect();
        let current = state.mode;
        drop(state);

        self.core.wake_if_slow(current);
        Ok(Subscription::new(
            Arc::clone(&self.core),
            keys,
            ignore_cache,
            receivers,
        ))
    }

    /// Returns true if a write to `key` is in flight.
    pub fn is_pending(&self, key: &str) -> bool {
        match LogicalKey::parse(key) {
            Ok(key) => self.core.state.lock().writes.is_currently_writing(&[key]),
            Err(_) => false,
        }
    }

    /// Copy of the mirrored value at `key`, without touching the network.
    pub fn peek(&self, key: &str) -> EngineResult<Option<Value>> {
        let key = LogicalKey::parse(key)?;
        Ok(self.core.state.lock().cache.read_copy(&key))
    }

    /// Subscribes to the shared error stream.
    pub fn errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.core.errors.subscribe()
    }

    /// Current scheduling mode.
    pub fn mode(&self) -> Mode {
        self.core.state.lock().mode
    }

    /// Delay the polling loop waits before the next tick.
    pub fn next_delay(&self) -> Duration {
        self.core.state.lock().delay.current()
    }

    /// Snapshot of the engine counters.
    pub fn stats(&self) -> EngineStats {
        self.core.state.lock().stats.clone()
    }

    /// Runs one gather, send, dispatch cycle.
    ///
    /// Blocks on the transport. On a transport failure the error is
    /// published on the error stream and returned; pending work is kept so
    /// the next tick re-sends it. Returns `Busy` if another tick is in flight.
    pub fn tick(&self) -> EngineResult<TickReport> {
        if self.core.in_flight.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Busy);
        }
        let _in_flight = InFlight(&self.core.in_flight);

        let (batch, mode) = {
            let mut state = self.core.state.lock();
            self.core.gather(&mut state)?
        };
        let operations = batch.requests.len();

        let started = Instant::now();
        let result = self.transport.send(&batch.requests);
        let elapsed = started.elapsed();

        let mut guard = self.core.state.lock();
        let state = &mut *guard;
        match result {
            Err(err) => {
                state.failures += 1;
                state.stats.transport_failures += 1;
                warn!(error = %err, attempt = state.failures, "batch failed");
                let _ = self.core.errors.send(ErrorEvent::Transport {
                    message: err.to_string(),
                    attempt: state.failures,
                });
                Err(err)
            }
            Ok(response) => {
                state.failures = 0;
                state.stats.ticks += 1;
                if mode == Mode::Slow {
                    state.stats.pings += 1;
                }
                self.core.dispatch(state, batch.table, response);
                let next_delay = state.delay.observe(elapsed, mode);
                state.stats.last_round_trip = Some(elapsed);
                debug!(
                    mode = %mode,
                    operations,
                    open_reads = state.reads.len(),
                    open_writes = state.writes.len(),
                    "tick dispatched"
                );
                Ok(TickReport {
                    mode,
                    operations,
                    elapsed,
                    next_delay,
                })
            }
        }
    }

    /// Re-runs work after a failed batch when the polling loop is waiting
    /// for a caller-triggered retry.
    pub fn retry(&self) {
        self.core.retry.notify_one();
    }

    pub(crate) fn wake_signal(&self) -> &Notify {
        &self.core.wake
    }

    pub(crate) fn retry_signal(&self) -> &Notify {
        &self.core.retry
    }
}

impl<T: Transport + 'static> Engine<T> {
    /// Starts the polling loop on the current tokio runtime.
    ///
    /// Keys listed in `initial_keys` are queued for reading first.
    pub fn start(&self) -> SchedulerHandle {
        for key in &self.core.config.initial_keys {
            if let Err(err) = self.get(key.as_str(), CacheMode::IgnoreCache) {
                warn!(key = %key, error = %err, "cannot warm up key");
            }
        }
        info!(warm_up = self.core.config.initial_keys.len(), "starting polling loop");
        scheduler::spawn(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use leafsync_protocol::{Command, RemoteErrorKind};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::from_value(&json!({
            "DB": {"a": 0, "b": 0, "arr": [0, 0]},
            "X": {"y": 0},
            "Z": {"y": 0}
        }))
    }

    fn engine() -> Engine<MockTransport> {
        let transport = MockTransport::new();
        for (address, value) in [
            ("DB.a", json!(1)),
            ("DB.b", json!(2)),
            ("DB.arr[0]", json!(10)),
            ("DB.arr[1]", json!(11)),
            ("X.y", json!(3)),
            ("Z.y", json!(4)),
        ] {
            transport.set_value(address, value);
        }
        Engine::new(EngineConfig::default(), Some(schema()), transport).unwrap()
    }

    #[test]
    fn get_composite_key() {
        let engine = engine();
        let mut value = engine.get("DB", CacheMode::IgnoreCache).unwrap();
        assert!(value.try_take().is_none());

        let report = engine.tick().unwrap();
        assert_eq!(report.mode, Mode::Fast);
        assert_eq!(report.operations, 4);
        assert_eq!(
            value.try_take(),
            Some(Ok(json!({"a": 1, "b": 2, "arr": [10, 11]})))
        );
        assert_eq!(engine.stats().leaves_read, 4);
    }

    #[test]
    fn multi_key_results_are_concatenated() {
        let engine = engine();
        let mut value = engine.get(["DB.a", "DB.b"], CacheMode::IgnoreCache).unwrap();
        engine.tick().unwrap();
        assert_eq!(value.try_take(), Some(Ok(json!({"a": 1, "b": 2}))));
    }

    #[test]
    fn colliding_fields_rejected() {
        let engine = engine();
        assert_eq!(
            engine.get(["X.y", "Z.y"], CacheMode::IgnoreCache).unwrap_err(),
            EngineError::KeyCollision("y".into())
        );
    }

    #[test]
    fn configuration_errors_are_synchronous() {
        let engine = engine();
        assert_eq!(
            engine.get("DB.nope", CacheMode::IgnoreCache).unwrap_err(),
            EngineError::KeyNotFound("DB.nope".into())
        );
        assert!(matches!(
            engine.get(["DB.a", "DB.b"], CacheMode::UseWrite),
            Err(EngineError::MultiKeyMode { count: 2, .. })
        ));
        assert!(matches!(
            engine.write("DB", json!({"c": 1})),
            Err(EngineError::ShapeMismatch { .. })
        ));
        assert_eq!(
            engine.get(Vec::<String>::new(), CacheMode::IgnoreCache).unwrap_err(),
            EngineError::EmptyRequest
        );
    }

    #[test]
    fn identical_gets_share_one_read() {
        let engine = engine();
        let mut first = engine.get("DB.a", CacheMode::IgnoreCache).unwrap();
        let mut second = engine.get("DB.a", CacheMode::IgnoreCache).unwrap();
        let mut third = engine.get("DB.a", CacheMode::UseCache).unwrap();

        let report = engine.tick().unwrap();
        assert_eq!(report.operations, 1);
        for pending in [&mut first, &mut second, &mut third] {
            assert_eq!(pending.try_take(), Some(Ok(json!(1))));
        }
    }

    #[test]
    fn use_cache_answers_locally() {
        let engine = engine();
        let _ = engine.get("DB.a", CacheMode::IgnoreCache).unwrap();
        engine.tick().unwrap();

        let mut cached = engine.get("DB.a", CacheMode::UseCache).unwrap();
        assert_eq!(cached.try_take(), Some(Ok(json!(1))));

        let mut missing = engine.get("DB.b", CacheMode::UseCache).unwrap();
        assert!(missing.try_take().is_none());
    }

    #[test]
    fn use_cache_answers_null_leaf_locally() {
        let engine = engine();
        engine.transport().set_value("DB.b", Value::Null);
        let mut first = engine.get("DB.b", CacheMode::IgnoreCache).unwrap();
        engine.tick().unwrap();
        assert_eq!(first.try_take(), Some(Ok(Value::Null)));

        let sent = engine.transport().sent().len();
        let mut cached = engine.get("DB.b", CacheMode::UseCache).unwrap();
        assert_eq!(cached.try_take(), Some(Ok(Value::Null)));
        assert_eq!(engine.transport().sent().len(), sent);
        assert_eq!(engine.core.state.lock().reads.len(), 0);
    }

    #[test]
    fn shallow_get_skips_nested_leaves() {
        let engine = engine();
        let mut shallow = engine
            .get_with_depth("DB", CacheMode::IgnoreCache, 1)
            .unwrap();

        assert_eq!(engine.tick().unwrap().operations, 2);
        assert_eq!(shallow.try_take(), Some(Ok(json!({"a": 1, "b": 2}))));
        assert_eq!(engine.peek("DB.arr").unwrap(), None);
    }

    #[test]
    fn gets_at_different_depths_stay_separate() {
        let engine = engine();
        let mut shallow = engine
            .get_with_depth("DB", CacheMode::IgnoreCache, 1)
            .unwrap();
        let mut deep = engine
            .get_with_depth("DB", CacheMode::IgnoreCache, 2)
            .unwrap();
        assert_eq!(engine.core.state.lock().reads.len(), 2);

        // Leaves are still read once per batch.
        assert_eq!(engine.tick().unwrap().operations, 4);
        assert!(matches!(shallow.try_take(), Some(Ok(_))));
        assert_eq!(
            deep.try_take(),
            Some(Ok(json!({"a": 1, "b": 2, "arr": [10, 11]})))
        );
    }

    #[test]
    fn gets_at_the_same_depth_share_one_read() {
        let engine = engine();
        let mut first = engine
            .get_with_depth("DB", CacheMode::IgnoreCache, 1)
            .unwrap();
        let mut second = engine
            .get_with_depth("DB", CacheMode::IgnoreCache, 1)
            .unwrap();
        assert_eq!(engine.core.state.lock().reads.len(), 1);

        assert_eq!(engine.tick().unwrap().operations, 2);
        for pending in [&mut first, &mut second] {
            assert_eq!(pending.try_take(), Some(Ok(json!({"a": 1, "b": 2}))));
        }
    }

    #[test]
    fn write_splits_and_merges() {
        let engine = engine();
        let mut done = engine.write("DB", json!({"a": 5, "arr": [7]})).unwrap();
        assert!(engine.is_pending("DB"));
        assert!(!engine.is_pending("DB.a"));

        engine.tick().unwrap();
        assert_eq!(done.try_take(), Some(Ok(true)));
        assert!(!engine.is_pending("DB"));
        assert_eq!(engine.transport().value("DB.a"), Some(json!(5)));
        assert_eq!(engine.transport().value("DB.arr[0]"), Some(json!(7)));
        assert_eq!(engine.peek("DB").unwrap(), Some(json!({"a": 5, "arr": [7]})));
    }

    #[test]
    fn failed_leaf_fails_the_write() {
        let engine = engine();
        engine
            .transport()
            .fail_address("DB.b", RemoteError::permission_denied("read only"));
        let mut errors = engine.errors();

        let mut done = engine.write("DB", json!({"a": 5, "b": 6})).unwrap();
        engine.tick().unwrap();

        assert_eq!(done.try_take(), Some(Ok(false)));
        match errors.try_recv().unwrap() {
            ErrorEvent::Remote { key, error } => {
                assert_eq!(key.as_str(), "DB.b");
                assert_eq!(error.kind, RemoteErrorKind::PermissionDenied);
            }
            other => panic!("unexpected {other:?}"),
        }
        // The successful leaf is still mirrored.
        assert_eq!(engine.peek("DB.a").unwrap(), Some(json!(5)));
        assert_eq!(engine.peek("DB.b").unwrap(), None);
    }

    #[test]
    fn failed_read_leaves_cache_untouched() {
        let engine = engine();
        engine
            .transport()
            .fail_address("DB.b", RemoteError::address_not_found("DB.b"));

        let mut value = engine.get("DB", CacheMode::IgnoreCache).unwrap();
        engine.tick().unwrap();

        match value.try_take() {
            Some(Err(EngineError::Remote { key, .. })) => assert_eq!(key, "DB.b"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.peek("DB.a").unwrap(), Some(json!(1)));
        assert_eq!(engine.peek("DB.b").unwrap(), None);
        assert_eq!(engine.stats().remote_errors, 1);
    }

    #[test]
    fn use_write_and_wait_for_write() {
        let engine = engine();
        let mut write = engine.write("DB.a", json!(5)).unwrap();

        let mut optimistic = engine.get("DB.a", CacheMode::UseWrite).unwrap();
        assert_eq!(optimistic.try_take(), Some(Ok(json!(5))));

        let mut waiting = engine.get("DB.a", CacheMode::WaitForWrite).unwrap();
        assert!(waiting.try_take().is_none());

        engine.tick().unwrap();
        assert_eq!(write.try_take(), Some(Ok(true)));
        assert_eq!(waiting.try_take(), Some(Ok(json!(5))));
    }

    #[test]
    fn wait_for_write_fails_with_the_write() {
        let engine = engine();
        engine
            .transport()
            .fail_address("DB.a", RemoteError::permission_denied("locked"));
        let _write = engine.write("DB.a", json!(5)).unwrap();
        let mut waiting = engine.get("DB.a", CacheMode::WaitForWrite).unwrap();

        engine.tick().unwrap();
        assert_eq!(
            waiting.try_take(),
            Some(Err(EngineError::WriteFailed("DB.a".into())))
        );
    }

    #[test]
    fn latest_write_is_used() {
        let engine = engine();
        let _first = engine.write("DB.a", json!(5)).unwrap();
        let _second = engine.write("DB.a", json!(6)).unwrap();

        let mut optimistic = engine.get("DB.a", CacheMode::UseWrite).unwrap();
        assert_eq!(optimistic.try_take(), Some(Ok(json!(6))));
    }

    #[test]
    fn idle_tick_sends_one_ping() {
        let engine = engine();
        let report = engine.tick().unwrap();

        assert_eq!(report.mode, Mode::Slow);
        assert_eq!(report.operations, 1);
        assert!(report.next_delay >= engine.config().slow_min_delay);
        let batch = engine.transport().last_sent().unwrap();
        assert_eq!(batch.requests[0].command, Command::Ping);
        assert_eq!(engine.stats().pings, 1);
        assert_eq!(engine.mode(), Mode::Slow);
    }

    #[test]
    fn transport_failure_keeps_work() {
        let engine = engine();
        let mut errors = engine.errors();
        let mut value = engine.get("DB.a", CacheMode::IgnoreCache).unwrap();

        engine.transport().set_failing(true);
        assert!(engine.tick().unwrap_err().is_retryable());
        assert_eq!(
            errors.try_recv().unwrap(),
            ErrorEvent::Transport {
                message: "transport error: mock transport failure".into(),
                attempt: 1
            }
        );
        assert!(value.try_take().is_none());

        engine.transport().set_failing(false);
        engine.tick().unwrap();
        assert_eq!(value.try_take(), Some(Ok(json!(1))));

        let sent = engine.transport().sent();
        assert_eq!(sent[0], sent[1]);
    }

    #[test]
    fn subscription_to_parent_sees_leaf_changes() {
        let engine = engine();
        let mut sub = engine.subscribe("DB", false).unwrap();

        engine.tick().unwrap();
        let mut changed = Vec::new();
        while let Some(event) = sub.try_recv() {
            assert_eq!(event.key.as_str(), "DB");
            changed.push(event.changed_key.to_string());
        }
        assert_eq!(changed, vec!["DB.a", "DB.arr.0", "DB.arr.1", "DB.b"]);

        // Unchanged values are not delivered again.
        engine.tick().unwrap();
        assert!(sub.try_recv().is_none());

        engine.transport().set_value("DB.b", json!(20));
        engine.tick().unwrap();
        let event = sub.try_recv().unwrap();
        assert_eq!(event.changed_key.as_str(), "DB.b");
        assert_eq!(event.value, json!({"a": 1, "b": 20, "arr": [10, 11]}));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn late_subscriber_waits_for_a_change() {
        let engine = engine();
        let _ = engine.get("DB.a", CacheMode::IgnoreCache).unwrap();
        engine.tick().unwrap();

        let mut sub = engine.subscribe("DB.a", false).unwrap();
        engine.tick().unwrap();
        assert!(sub.try_recv().is_none());
        assert_eq!(engine.peek("DB.a").unwrap(), Some(json!(1)));

        engine.transport().set_value("DB.a", json!(2));
        engine.tick().unwrap();
        assert_eq!(sub.try_recv().map(|e| e.value), Some(json!(2)));
    }

    #[test]
    fn fresh_subscription_hears_every_poll() {
        let engine = engine();
        let mut sub = engine.subscribe("DB.a", true).unwrap();
        engine.tick().unwrap();
        engine.tick().unwrap();
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn same_value_written_twice_notifies_once() {
        let engine = engine();
        let mut sub = engine.subscribe("DB.a", false).unwrap();
        engine.tick().unwrap();
        assert!(sub.try_recv().is_some());

        let _ = engine.write("DB.a", json!(9)).unwrap();
        engine.tick().unwrap();
        let _ = engine.write("DB.a", json!(9)).unwrap();
        engine.tick().unwrap();

        assert_eq!(sub.try_recv().map(|e| e.value), Some(json!(9)));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropping_subscription_stops_polling() {
        let engine = engine();
        let sub = engine.subscribe(["DB.a", "DB.b"], false).unwrap();
        assert_eq!(engine.tick().unwrap().operations, 2);

        drop(sub);
        let report = engine.tick().unwrap();
        assert_eq!(report.mode, Mode::Slow);
    }

    #[test]
    fn subscription_reads_are_shared_with_transactions() {
        let engine = engine();
        let _sub = engine.subscribe("DB.a", false).unwrap();
        let mut value = engine.get("DB.a", CacheMode::IgnoreCache).unwrap();
        assert_eq!(engine.tick().unwrap().operations, 1);
        assert_eq!(value.try_take(), Some(Ok(json!(1))));
    }

    #[test]
    fn prefix_map_translates_addresses() {
        let transport = MockTransport::new();
        transport.set_value("\"DB_Motor\".speed", json!(1500));
        let config = EngineConfig::new().with_prefix("Motor", "\"DB_Motor\"");
        let engine = Engine::new(config, None, transport).unwrap();

        let mut speed = engine.get("Motor.speed", CacheMode::IgnoreCache).unwrap();
        engine.tick().unwrap();
        assert_eq!(speed.try_take(), Some(Ok(json!(1500))));
        assert_eq!(engine.peek("Motor.speed").unwrap(), Some(json!(1500)));
    }

    #[test]
    fn composite_write_without_schema_rejected() {
        let engine = Engine::new(EngineConfig::default(), None, MockTransport::new()).unwrap();
        assert_eq!(
            engine.write("DB", json!({"a": 1})).unwrap_err(),
            EngineError::CompositeWithoutSchema("DB".into())
        );
        assert!(engine.write("DB.a", json!(1)).is_ok());
    }

    #[test]
    fn invalid_initial_key_rejected() {
        let config = EngineConfig::new().with_initial_key("DB.nope");
        assert!(Engine::new(config, Some(schema()), MockTransport::new()).is_err());
    }

    #[test]
    fn dropped_engine_cancels_pending() {
        let engine = engine();
        let mut value = engine.get("DB.a", CacheMode::IgnoreCache).unwrap();
        drop(engine);
        assert_eq!(value.try_take(), Some(Err(EngineError::Cancelled)));
    }
}
