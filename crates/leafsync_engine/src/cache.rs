//! Local mirror of the remote store.
//!
//! The mirror only grows: entries are created or overwritten, never removed.
//! Intermediate containers are created on demand, choosing an array when the
//! next segment is an index and an object otherwise. Array slots created as
//! padding hold `null` in the tree but are tracked separately, so a leaf
//! whose mirrored value really is `null` still exists.

use crate::error::{EngineError, EngineResult};
use crate::key::{LogicalKey, Segment};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// A nested, grow-only mirror of leaf values.
#[derive(Debug, Clone)]
pub struct MirrorCache {
    root: Value,
    padding: BTreeSet<LogicalKey>,
}

impl MirrorCache {
    /// Creates an empty mirror.
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
            padding: BTreeSet::new(),
        }
    }

    /// Borrows the value at `key`.
    ///
    /// Padding slots read as `null`; use [`MirrorCache::exists`] to tell
    /// them apart from mirrored values.
    pub fn read(&self, key: &LogicalKey) -> Option<&Value> {
        let mut node = &self.root;
        for segment in key.segments() {
            node = match (node, segment) {
                (Value::Object(map), segment) => map.get(&segment.to_string())?,
                (Value::Array(items), Segment::Index(index)) => items.get(*index)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Returns a deep copy of the value at `key`.
    pub fn read_copy(&self, key: &LogicalKey) -> Option<Value> {
        self.read(key).cloned()
    }

    /// Returns true if a mirrored value exists at `key`, `null` included.
    pub fn exists(&self, key: &LogicalKey) -> bool {
        self.read(key).is_some() && !self.padding.contains(key)
    }

    /// Copy of the whole mirror.
    pub fn snapshot(&self) -> Value {
        self.root.clone()
    }

    /// Sets the value at `key`, creating missing containers.
    ///
    /// Returns the previous mirrored value, if any.
    pub fn write(&mut self, key: &LogicalKey, value: Value) -> EngineResult<Option<Value>> {
        let existed = self.exists(key);
        let slot = self.slot(key)?;
        let previous = std::mem::replace(slot, value);
        self.padding.retain(|padded| !padded.starts_with(key));
        Ok(Some(previous).filter(|_| existed))
    }

    /// Deep-merges `value` into the subtree at `key`.
    ///
    /// Objects merge member by member and arrays index by index, so siblings
    /// not mentioned in `value` keep their mirrored values.
    pub fn merge(&mut self, key: &LogicalKey, value: Value) -> EngineResult<()> {
        let slot = self.slot(key)?;
        let mut filled = Vec::new();
        merge_into(slot, value, key, &mut filled);
        for covered in filled {
            self.padding.retain(|padded| !padded.starts_with(&covered));
        }
        Ok(())
    }

    /// Walks to the node at `key`, creating containers on the way.
    ///
    /// Array slots skipped over are recorded as padding; slots walked
    /// through stop being padding.
    fn slot(&mut self, key: &LogicalKey) -> EngineResult<&mut Value> {
        let segments = key.segments();
        if segments.is_empty() {
            return Err(EngineError::invalid_key("", "cannot write the cache root"));
        }

        let Self { root, padding } = self;
        let mut node = root;
        for (i, segment) in segments.iter().enumerate() {
            let next = segments.get(i + 1);
            if node.is_null() {
                *node = empty_container(segment);
            }
            node = match (node, segment) {
                (Value::Object(map), Segment::Member(name)) => map
                    .entry(name.clone())
                    .or_insert_with(|| next.map(empty_container).unwrap_or(Value::Null)),
                (Value::Array(items), Segment::Index(index)) => {
                    if items.len() <= *index {
                        let parent = key.prefix(i);
                        for skipped in items.len()..*index {
                            padding.insert(parent.child(Segment::Index(skipped)));
                        }
                        items.resize(*index + 1, Value::Null);
                    }
                    if next.is_some() {
                        padding.remove(&key.prefix(i + 1));
                    }
                    &mut items[*index]
                }
                (Value::Object(_), Segment::Index(_)) => {
                    return Err(EngineError::cache_conflict(
                        key.as_str(),
                        format!("index segment `{segment}` into an object"),
                    ))
                }
                (Value::Array(_), Segment::Member(_)) => {
                    return Err(EngineError::cache_conflict(
                        key.as_str(),
                        format!("member segment `{segment}` into an array"),
                    ))
                }
                (_, _) => {
                    return Err(EngineError::cache_conflict(
                        key.as_str(),
                        format!("scalar in the way of `{segment}`"),
                    ))
                }
            };
        }
        Ok(node)
    }
}

impl Default for MirrorCache {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_container(segment: &Segment) -> Value {
    match segment {
        Segment::Index(_) => Value::Array(Vec::new()),
        Segment::Member(_) => Value::Object(Map::new()),
    }
}

/// Merges `value` into `target`, collecting the keys it overwrote.
fn merge_into(target: &mut Value, value: Value, key: &LogicalKey, filled: &mut Vec<LogicalKey>) {
    match (target, value) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (name, member) in incoming {
                let child = key.child(Segment::Member(name.clone()));
                match existing.get_mut(&name) {
                    Some(slot) => merge_into(slot, member, &child, filled),
                    None => {
                        existing.insert(name, member);
                    }
                }
            }
        }
        (Value::Array(existing), Value::Array(incoming)) => {
            for (index, item) in incoming.into_iter().enumerate() {
                let child = key.child(Segment::Index(index));
                match existing.get_mut(index) {
                    Some(slot) => merge_into(slot, item, &child, filled),
                    None => existing.push(item),
                }
            }
        }
        (target, value) => {
            *target = value;
            filled.push(key.clone());
        }
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
    fn write_grows_structure() {
        let mut cache = MirrorCache::new();
        cache.write(&key("\"DB\".arr.2.x"), json!(4)).unwrap();

        assert_eq!(
            cache.snapshot(),
            json!({"\"DB\"": {"arr": [null, null, {"x": 4}]}})
        );
        assert!(cache.exists(&key("\"DB\".arr.2.x")));
        assert!(cache.exists(&key("\"DB\".arr")));
        assert!(!cache.exists(&key("\"DB\".arr.0")));
        assert!(!cache.exists(&key("\"DB\".arr.5")));
        assert!(!cache.exists(&key("\"DB\".other")));
    }

    #[test]
    fn write_returns_previous() {
        let mut cache = MirrorCache::new();
        assert_eq!(cache.write(&key("a.b"), json!(1)).unwrap(), None);
        assert_eq!(cache.write(&key("a.b"), json!(2)).unwrap(), Some(json!(1)));
        assert_eq!(cache.read(&key("a.b")), Some(&json!(2)));
    }

    #[test]
    fn padding_slot_can_become_container() {
        let mut cache = MirrorCache::new();
        cache.write(&key("a.1"), json!(1)).unwrap();
        cache.write(&key("a.0.x"), json!(2)).unwrap();
        assert_eq!(cache.snapshot(), json!({"a": [{"x": 2}, 1]}));
    }

    #[test]
    fn incompatible_containers_rejected() {
        let mut cache = MirrorCache::new();
        cache.write(&key("a.b"), json!(1)).unwrap();

        assert!(matches!(
            cache.write(&key("a.0"), json!(1)),
            Err(EngineError::CacheConflict { .. })
        ));
        assert!(cache.write(&key("a.b.c"), json!(1)).is_err());

        cache.write(&key("l.0"), json!(1)).unwrap();
        assert!(cache.write(&key("l.x"), json!(1)).is_err());
    }

    #[test]
    fn read_copy_is_detached() {
        let mut cache = MirrorCache::new();
        cache.write(&key("a.b"), json!(1)).unwrap();

        let mut copy = cache.read_copy(&key("a")).unwrap();
        copy["b"] = json!(99);
        assert_eq!(cache.read(&key("a.b")), Some(&json!(1)));
    }

    #[test]
    fn merge_keeps_siblings() {
        let mut cache = MirrorCache::new();
        cache.write(&key("DB.a"), json!(1)).unwrap();
        cache.write(&key("DB.b"), json!(2)).unwrap();
        cache.write(&key("DB.arr.1"), json!(3)).unwrap();

        cache
            .merge(&key("DB"), json!({"a": 10, "arr": [5]}))
            .unwrap();
        assert_eq!(
            cache.snapshot(),
            json!({"DB": {"a": 10, "b": 2, "arr": [5, 3]}})
        );
        assert!(cache.exists(&key("DB.arr.0")));
    }

    #[test]
    fn stored_null_exists() {
        let mut cache = MirrorCache::new();
        cache.write(&key("DB.arr.2"), json!(null)).unwrap();

        assert!(cache.exists(&key("DB.arr.2")));
        assert!(!cache.exists(&key("DB.arr.1")));
        assert_eq!(cache.read(&key("DB.arr.1")), Some(&json!(null)));

        assert_eq!(
            cache.write(&key("DB.arr.2"), json!(7)).unwrap(),
            Some(json!(null))
        );
        assert_eq!(cache.write(&key("DB.arr.1"), json!(null)).unwrap(), None);
        assert!(cache.exists(&key("DB.arr.1")));
        assert!(!cache.exists(&key("DB.arr.0")));
    }

    #[test]
    fn composite_write_clears_padding_below() {
        let mut cache = MirrorCache::new();
        cache.write(&key("a.l.3"), json!(1)).unwrap();
        assert!(!cache.exists(&key("a.l.0")));

        cache.write(&key("a.l"), json!([0, 0, 0, 1])).unwrap();
        assert!(cache.exists(&key("a.l.0")));
        assert!(cache.exists(&key("a.l.2")));
    }
}
