//! Static schema of the remote store and leaf expansion.
//!
//! The schema is an example value tree: objects, arrays with their fixed
//! lengths, and scalar placeholders. It is converted once into
//! [`SchemaNode`]s so expansion never inspects raw JSON types again.

use crate::error::{EngineError, EngineResult};
use crate::key::{KeyMap, LogicalKey, Segment};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

/// A node of the schema tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    /// An atomic value; holds the example/default value.
    Scalar(Value),
    /// A fixed-length array.
    Array(Vec<SchemaNode>),
    /// An object with members in document order.
    Object(Vec<(String, SchemaNode)>),
}

impl SchemaNode {
    /// Converts an example value into a schema node.
    ///
    /// `null` array slots become empty-string scalars.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(items) => SchemaNode::Array(
                items
                    .iter()
                    .map(|item| match item {
                        Value::Null => SchemaNode::Scalar(Value::String(String::new())),
                        other => SchemaNode::from_value(other),
                    })
                    .collect(),
            ),
            Value::Object(members) => SchemaNode::Object(
                members
                    .iter()
                    .map(|(name, member)| (name.clone(), SchemaNode::from_value(member)))
                    .collect(),
            ),
            scalar => SchemaNode::Scalar(scalar.clone()),
        }
    }

    /// Converts back into the example value.
    pub fn to_value(&self) -> Value {
        match self {
            SchemaNode::Scalar(value) => value.clone(),
            SchemaNode::Array(items) => Value::Array(items.iter().map(Self::to_value).collect()),
            SchemaNode::Object(members) => {
                let mut map = Map::new();
                for (name, member) in members {
                    map.insert(name.clone(), member.to_value());
                }
                Value::Object(map)
            }
        }
    }

    /// Returns true for atomic nodes.
    pub fn is_scalar(&self) -> bool {
        matches!(self, SchemaNode::Scalar(_))
    }

    /// Looks up one child.
    pub fn child(&self, segment: &Segment) -> Option<&SchemaNode> {
        match (self, segment) {
            (SchemaNode::Array(items), Segment::Index(index)) => items.get(*index),
            (SchemaNode::Object(members), segment) => {
                let name = segment.to_string();
                members
                    .iter()
                    .find(|(member, _)| *member == name)
                    .map(|(_, node)| node)
            }
            _ => None,
        }
    }
}

/// The immutable schema of the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    root: SchemaNode,
}

impl Schema {
    /// Builds a schema from an example document.
    pub fn from_value(value: &Value) -> Self {
        Self {
            root: SchemaNode::from_value(value),
        }
    }

    /// Parses a schema from JSON text.
    pub fn from_json(text: &str) -> EngineResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| EngineError::InvalidConfig(format!("schema is not valid JSON: {e}")))?;
        Ok(Self::from_value(&value))
    }

    /// Root node.
    pub fn root(&self) -> &SchemaNode {
        &self.root
    }

    /// Resolves the node at `key`.
    pub fn resolve(&self, key: &LogicalKey) -> EngineResult<&SchemaNode> {
        let mut node = &self.root;
        for segment in key.segments() {
            node = node
                .child(segment)
                .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))?;
        }
        Ok(node)
    }

    /// Example value of the subtree at `key`.
    pub fn default_value(&self, key: &LogicalKey) -> EngineResult<Value> {
        Ok(self.resolve(key)?.to_value())
    }

    /// Enumerates the atomic leaves under `key`, in schema order.
    ///
    /// Subtrees nested deeper than `depth` levels below `key` are skipped with
    /// a warning.
    pub fn expand_leaves(&self, key: &LogicalKey, depth: usize) -> EngineResult<Vec<LogicalKey>> {
        let node = self.resolve(key)?;
        let mut leaves = Vec::new();
        collect_leaves(node, key.clone(), 0, depth, &mut leaves);
        Ok(leaves)
    }

    /// Slices `value` into `(leaf, scalar)` pairs following the schema at `key`.
    ///
    /// Object members absent from `value` are left alone; unknown members,
    /// out-of-range indices and scalar/composite mix-ups are shape mismatches.
    pub fn expand_write(
        &self,
        key: &LogicalKey,
        value: &Value,
        depth: usize,
    ) -> EngineResult<Vec<(LogicalKey, Value)>> {
        let node = self.resolve(key)?;
        let mut leaves = Vec::new();
        slice_value(node, key.clone(), value, 0, depth, &mut leaves)?;
        Ok(leaves)
    }
}

fn collect_leaves(
    node: &SchemaNode,
    key: LogicalKey,
    level: usize,
    depth: usize,
    out: &mut Vec<LogicalKey>,
) {
    match node {
        SchemaNode::Scalar(_) => out.push(key),
        _ if level >= depth => {
            warn!(key = %key, depth, "schema expansion depth exceeded, skipping subtree");
        }
        SchemaNode::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_leaves(item, key.child(Segment::Index(index)), level + 1, depth, out);
            }
        }
        SchemaNode::Object(members) => {
            for (name, member) in members {
                collect_leaves(
                    member,
                    key.child(Segment::Member(name.clone())),
                    level + 1,
                    depth,
                    out,
                );
            }
        }
    }
}

fn slice_value(
    node: &SchemaNode,
    key: LogicalKey,
    value: &Value,
    level: usize,
    depth: usize,
    out: &mut Vec<(LogicalKey, Value)>,
) -> EngineResult<()> {
    match (node, value) {
        (SchemaNode::Scalar(_), Value::Array(_) | Value::Object(_)) => Err(
            EngineError::shape_mismatch(key.as_str(), "composite value for a scalar"),
        ),
        (SchemaNode::Scalar(_), scalar) => {
            out.push((key, scalar.clone()));
            Ok(())
        }
        (SchemaNode::Array(_) | SchemaNode::Object(_), _) if level >= depth => {
            warn!(key = %key, depth, "schema expansion depth exceeded, skipping subtree");
            Ok(())
        }
        (SchemaNode::Array(items), Value::Array(values)) => {
            if values.len() > items.len() {
                return Err(EngineError::shape_mismatch(
                    key.as_str(),
                    format!("array of {} items, schema allows {}", values.len(), items.len()),
                ));
            }
            for (index, (item, element)) in items.iter().zip(values).enumerate() {
                slice_value(
                    item,
                    key.child(Segment::Index(index)),
                    element,
                    level + 1,
                    depth,
                    out,
                )?;
            }
            Ok(())
        }
        (SchemaNode::Object(_), Value::Object(members)) => {
            for (name, member) in members {
                let child_key = key.child(Segment::Member(name.clone()));
                let child = node
                    .child(&Segment::Member(name.clone()))
                    .ok_or_else(|| {
                        EngineError::shape_mismatch(key.as_str(), format!("unknown member `{name}`"))
                    })?;
                slice_value(child, child_key, member, level + 1, depth, out)?;
            }
            Ok(())
        }
        (SchemaNode::Array(_), _) => Err(EngineError::shape_mismatch(
            key.as_str(),
            "expected an array",
        )),
        (SchemaNode::Object(_), _) => Err(EngineError::shape_mismatch(
            key.as_str(),
            "expected an object",
        )),
    }
}

/// Expands logical keys into leaves and translates them to addresses.
///
/// Without a schema every key passes through unchanged as a single leaf and
/// composite writes are rejected.
#[derive(Debug, Clone)]
pub struct Navigator {
    schema: Option<Arc<Schema>>,
    map: KeyMap,
}

impl Navigator {
    /// Creates a navigator.
    pub fn new(schema: Option<Schema>, map: KeyMap) -> Self {
        Self {
            schema: schema.map(Arc::new),
            map,
        }
    }

    /// The loaded schema, if any.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_deref()
    }

    /// Fails if `key` is not declared in the schema.
    pub fn check(&self, key: &LogicalKey) -> EngineResult<()> {
        if let Some(schema) = &self.schema {
            schema.resolve(key)?;
        }
        Ok(())
    }

    /// Leaf keys to read for `key`.
    pub fn read_leaves(&self, key: &LogicalKey, depth: usize) -> EngineResult<Vec<LogicalKey>> {
        match &self.schema {
            Some(schema) => schema.expand_leaves(key, depth),
            None => Ok(vec![key.clone()]),
        }
    }

    /// Leaf writes needed to store `value` at `key`.
    pub fn write_leaves(
        &self,
        key: &LogicalKey,
        value: &Value,
        depth: usize,
    ) -> EngineResult<Vec<(LogicalKey, Value)>> {
        match &self.schema {
            Some(schema) => schema.expand_write(key, value, depth),
            None if value.is_array() || value.is_object() => {
                Err(EngineError::CompositeWithoutSchema(key.to_string()))
            }
            None => Ok(vec![(key.clone(), value.clone())]),
        }
    }

    /// Transport address of a leaf.
    pub fn address(&self, key: &LogicalKey) -> String {
        self.map.address(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(raw: &str) -> LogicalKey {
        LogicalKey::parse(raw).unwrap()
    }

    fn keys(leaves: &[LogicalKey]) -> Vec<String> {
        leaves.iter().map(|k| k.to_string()).collect()
    }

    fn sample() -> Schema {
        Schema::from_value(&json!({
            "\"DB\"": {
                "a": 0,
                "b": 0,
                "arr": [1, 2, null],
                "nested": {"x": true, "y": {"z": "s"}}
            }
        }))
    }

    #[test]
    fn scalar_is_its_own_leaf() {
        let schema = sample();
        let leaves = schema.expand_leaves(&key("\"DB\".a"), 32).unwrap();
        assert_eq!(keys(&leaves), vec!["\"DB\".a"]);
    }

    #[test]
    fn object_and_array_expansion() {
        let schema = sample();
        let leaves = schema.expand_leaves(&key("\"DB\""), 32).unwrap();
        let leaves = keys(&leaves);
        assert_eq!(leaves.len(), 7);
        assert!(leaves.contains(&"\"DB\".arr.0".to_string()));
        assert!(leaves.contains(&"\"DB\".arr.2".to_string()));
        assert!(leaves.contains(&"\"DB\".nested.y.z".to_string()));
    }

    #[test]
    fn null_array_slot_is_string_placeholder() {
        let schema = sample();
        let node = schema.resolve(&key("\"DB\".arr.2")).unwrap();
        assert_eq!(node, &SchemaNode::Scalar(json!("")));
    }

    #[test]
    fn expansion_is_repeatable() {
        let schema = sample();
        let first = schema.expand_leaves(&key("\"DB\""), 32).unwrap();
        let second = schema.expand_leaves(&key("\"DB\""), 32).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn depth_bound_skips_deep_subtrees() {
        let schema = sample();
        let leaves = keys(&schema.expand_leaves(&key("\"DB\".nested"), 1).unwrap());
        assert_eq!(leaves, vec!["\"DB\".nested.x"]);

        assert!(schema.expand_leaves(&key("\"DB\""), 0).unwrap().is_empty());
    }

    #[test]
    fn missing_key_is_fatal() {
        let schema = sample();
        assert!(matches!(
            schema.expand_leaves(&key("\"DB\".nope"), 32),
            Err(EngineError::KeyNotFound(k)) if k == "\"DB\".nope"
        ));
        assert!(schema.resolve(&key("\"DB\".a.b")).is_err());
        assert!(schema.resolve(&key("\"DB\".arr.9")).is_err());
    }

    #[test]
    fn write_slicing() {
        let schema = sample();
        let slices = schema
            .expand_write(&key("\"DB\""), &json!({"a": 5, "arr": [7, 8]}), 32)
            .unwrap();
        assert_eq!(
            slices,
            vec![
                (key("\"DB\".a"), json!(5)),
                (key("\"DB\".arr.0"), json!(7)),
                (key("\"DB\".arr.1"), json!(8)),
            ]
        );
    }

    #[test]
    fn write_shape_mismatches() {
        let schema = sample();
        assert!(matches!(
            schema.expand_write(&key("\"DB\".a"), &json!({"x": 1}), 32),
            Err(EngineError::ShapeMismatch { .. })
        ));
        assert!(schema
            .expand_write(&key("\"DB\""), &json!({"zzz": 1}), 32)
            .is_err());
        assert!(schema
            .expand_write(&key("\"DB\".arr"), &json!([1, 2, 3, 4]), 32)
            .is_err());
        assert!(schema.expand_write(&key("\"DB\".arr"), &json!(1), 32).is_err());
    }

    #[test]
    fn default_value_round_trips_example() {
        let schema = sample();
        assert_eq!(
            schema.default_value(&key("\"DB\".nested")).unwrap(),
            json!({"x": true, "y": {"z": "s"}})
        );
    }

    #[test]
    fn navigator_without_schema_passes_through() {
        let nav = Navigator::new(None, KeyMap::new());
        let leaves = nav.read_leaves(&key("\"DB\".arr.1"), 32).unwrap();
        assert_eq!(keys(&leaves), vec!["\"DB\".arr.1"]);
        assert_eq!(nav.address(&leaves[0]), "\"DB\".arr[1]");

        assert!(nav.write_leaves(&key("x"), &json!(1), 32).is_ok());
        assert!(matches!(
            nav.write_leaves(&key("x"), &json!({"a": 1}), 32),
            Err(EngineError::CompositeWithoutSchema(_))
        ));
    }
}
