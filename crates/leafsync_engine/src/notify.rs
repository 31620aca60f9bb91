//! Prefix trie of subscription channels.
//!
//! Every trie node may own one broadcast channel plus a count of active
//! subscribers. A changed leaf notifies the channel of every ancestor on its
//! path (the leaf itself included), so a subscriber to `DB` sees a change to
//! `DB.arr.3` with the full `DB` subtree attached.

use crate::cache::MirrorCache;
use crate::key::{LogicalKey, Segment};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// A change delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// The subscribed key this event was emitted for.
    pub key: LogicalKey,
    /// Copy of the subtree at `key` after the change.
    pub value: Value,
    /// The leaf whose update caused the event.
    pub changed_key: LogicalKey,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: BTreeMap<Segment, TrieNode>,
    channel: Option<broadcast::Sender<ChangeEvent>>,
    ref_count: usize,
}

/// Maps keys to fan-out channels with reference counts.
#[derive(Debug)]
pub struct NotificationIndex {
    root: TrieNode,
    capacity: usize,
}

impl NotificationIndex {
    /// Creates an empty index whose channels buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            root: TrieNode::default(),
            capacity: capacity.max(1),
        }
    }

    /// Returns a receiver on the channel for `key`, creating it if needed.
    ///
    /// Registering does not change the reference count.
    pub fn register(&mut self, key: &LogicalKey) -> broadcast::Receiver<ChangeEvent> {
        let capacity = self.capacity;
        let node = self.node_mut(key);
        match &node.channel {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(capacity);
                node.channel = Some(sender);
                receiver
            }
        }
    }

    /// Adds one subscriber to `key`.
    pub fn increment(&mut self, key: &LogicalKey) -> usize {
        let node = self.node_mut(key);
        node.ref_count += 1;
        node.ref_count
    }

    /// Removes one subscriber from `key`. The channel itself is kept.
    pub fn decrement(&mut self, key: &LogicalKey) -> usize {
        match self.node_mut_existing(key) {
            Some(node) => {
                node.ref_count = node.ref_count.saturating_sub(1);
                node.ref_count
            }
            None => 0,
        }
    }

    /// Active subscriber count of `key`.
    pub fn ref_count(&self, key: &LogicalKey) -> usize {
        self.node(key).map(|node| node.ref_count).unwrap_or(0)
    }

    /// Keys with at least one active subscriber, in trie order.
    pub fn active_keys(&self) -> Vec<LogicalKey> {
        let mut keys = Vec::new();
        let mut path = Vec::new();
        collect_active(&self.root, &mut path, &mut keys);
        keys
    }

    /// Emits `changed` to every ancestor channel with live receivers.
    ///
    /// Returns the number of events sent.
    pub fn notify(&self, changed: &LogicalKey, cache: &MirrorCache) -> usize {
        let mut sent = 0;
        let mut node = &self.root;

        for depth in 1..=changed.depth() {
            let segment = &changed.segments()[depth - 1];
            node = match node.children.get(segment) {
                Some(child) => child,
                None => break,
            };

            let prefix = changed.prefix(depth);
            let Some(value) = cache.read(&prefix) else {
                break;
            };

            if let Some(sender) = &node.channel {
                if node.ref_count > 0 && sender.receiver_count() > 0 {
                    let event = ChangeEvent {
                        key: prefix,
                        value: value.clone(),
                        changed_key: changed.clone(),
                    };
                    if sender.send(event).is_ok() {
                        sent += 1;
                    }
                }
            }
        }
        sent
    }

    fn node(&self, key: &LogicalKey) -> Option<&TrieNode> {
        let mut node = &self.root;
        for segment in key.segments() {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    fn node_mut_existing(&mut self, key: &LogicalKey) -> Option<&mut TrieNode> {
        let mut node = &mut self.root;
        for segment in key.segments() {
            node = node.children.get_mut(segment)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, key: &LogicalKey) -> &mut TrieNode {
        let mut node = &mut self.root;
        for segment in key.segments() {
            node = node.children.entry(segment.clone()).or_default();
        }
        node
    }
}

fn collect_active(node: &TrieNode, path: &mut Vec<Segment>, out: &mut Vec<LogicalKey>) {
    if node.ref_count > 0 && !path.is_empty() {
        out.push(LogicalKey::from_segments(path.clone()));
    }
    for (segment, child) in &node.children {
        path.push(segment.clone());
        collect_active(child, path, out);
        path.pop();
    }
}
