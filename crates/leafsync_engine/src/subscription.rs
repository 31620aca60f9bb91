//! Live change streams.

use crate::engine::Core;
use crate::key::LogicalKey;
use crate::notify::ChangeEvent;
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tracing::warn;

type RecvFuture<'a> = Pin<Box<dyn Future<Output = Result<ChangeEvent, RecvError>> + Send + 'a>>;

/// A stream of changes for one or more keys.
///
/// Every changed leaf at or below a subscribed key produces one
/// [`ChangeEvent`] per subscribed key on its path. The subscription holds a
/// reference on each of its keys so the polling loop keeps reading them;
/// dropping it (or calling [`Subscription::unsubscribe`]) releases them.
pub struct Subscription {
    core: Arc<Core>,
    keys: Vec<LogicalKey>,
    ignore_cache: bool,
    streams: Vec<(LogicalKey, Receiver<ChangeEvent>)>,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(
        core: Arc<Core>,
        keys: Vec<LogicalKey>,
        ignore_cache: bool,
        receivers: Vec<Receiver<ChangeEvent>>,
    ) -> Self {
        let streams = keys.iter().cloned().zip(receivers).collect();
        Self {
            core,
            keys,
            ignore_cache,
            streams,
            active: true,
        }
    }

    /// Subscribed keys.
    pub fn keys(&self) -> &[LogicalKey] {
        &self.keys
    }

    /// Returns true if events are delivered even when a value did not change.
    pub fn ignores_cache(&self) -> bool {
        self.ignore_cache
    }

    /// Waits for the next change.
    ///
    /// The subscription shares the engine's state, so dropping the
    /// [`Engine`](crate::Engine) handle does not end the stream: callers
    /// that need a way out should race this against their own shutdown
    /// signal or a timeout. `None` is only returned once every underlying
    /// channel has closed. Events dropped because this subscriber fell
    /// behind are skipped with a warning.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            if !self.active || self.streams.is_empty() {
                return None;
            }

            let (index, result) = {
                let mut pending: Vec<RecvFuture<'_>> = self
                    .streams
                    .iter_mut()
                    .map(|(_, rx)| Box::pin(rx.recv()) as RecvFuture<'_>)
                    .collect();
                poll_fn(|cx| {
                    for (index, fut) in pending.iter_mut().enumerate() {
                        if let Poll::Ready(result) = fut.as_mut().poll(cx) {
                            return Poll::Ready((index, result));
                        }
                    }
                    Poll::Pending
                })
                .await
            };

            match result {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(key = %self.streams[index].0, skipped, "subscriber lagged");
                }
                Err(RecvError::Closed) => {
                    self.streams.remove(index);
                }
            }
        }
    }

    /// Returns the next change if one is already queued.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        if !self.active {
            return None;
        }
        for (key, rx) in self.streams.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => return Some(event),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(key = %key, skipped, "subscriber lagged");
                    }
                    Err(_) => break,
                }
            }
        }
        None
    }

    /// Cancels the subscription and releases its keys.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.core.release(&self.keys, self.ignore_cache);
        self.streams.clear();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("keys", &self.keys)
            .field("ignore_cache", &self.ignore_cache)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{CacheMode, Engine, EngineConfig, Mode, MockTransport, Schema};
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> Engine<MockTransport> {
        let transport = MockTransport::new();
        transport.set_value("A.x", json!(1));
        transport.set_value("B.y", json!(2));
        let schema = Schema::from_value(&json!({"A": {"x": 0}, "B": {"y": 0}}));
        Engine::new(EngineConfig::default(), Some(schema), transport).unwrap()
    }

    #[tokio::test]
    async fn merges_every_key() {
        let engine = engine();
        let mut subscription = engine.subscribe(["A", "B.y"], false).unwrap();
        engine.tick().unwrap();

        let mut changed = Vec::new();
        for _ in 0..2 {
            let event = subscription.recv().await.unwrap();
            changed.push(event.changed_key.to_string());
        }
        changed.sort();
        assert_eq!(changed, vec!["A.x", "B.y"]);
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn drop_releases_keys() {
        let engine = engine();
        let first = engine.subscribe("A", true).unwrap();
        let second = engine.subscribe("A", true).unwrap();

        drop(first);
        assert_eq!(engine.tick().unwrap().mode, Mode::Fast);
        drop(second);
        assert_eq!(engine.tick().unwrap().mode, Mode::Slow);
    }

    #[test]
    fn unsubscribed_stream_is_empty() {
        let engine = engine();
        let subscription = engine.subscribe("A.x", true).unwrap();
        assert!(subscription.ignores_cache());
        assert_eq!(subscription.keys()[0].as_str(), "A.x");
        subscription.unsubscribe();

        let mut value = engine.get("A.x", CacheMode::IgnoreCache).unwrap();
        assert_eq!(engine.tick().unwrap().operations, 1);
        assert_eq!(value.try_take(), Some(Ok(json!(1))));
    }

    #[tokio::test]
    async fn stream_stays_open_after_engine_drop() {
        let engine = engine();
        let mut subscription = engine.subscribe("A.x", false).unwrap();
        engine.tick().unwrap();
        drop(engine);

        assert!(subscription.recv().await.is_some());
        let idle = tokio::time::timeout(Duration::from_millis(20), subscription.recv()).await;
        assert!(idle.is_err());
    }
}
