//! Logical keys and their translation to transport addresses.
//!
//! A logical key is a dot-separated path. Each segment is either an object
//! member or, when it parses as a non-negative integer, an array index.
//! Dots inside double quotes do not split, so store names such as
//! `"DB.v2".a` stay one member.

use crate::error::{EngineError, EngineResult};
use std::fmt;
use std::str::FromStr;

/// One step of a logical key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    /// Object member.
    Member(String),
    /// Array index.
    Index(usize),
}

impl Segment {
    fn parse(text: &str) -> Self {
        if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = text.parse::<usize>() {
                return Segment::Index(index);
            }
        }
        Segment::Member(text.to_string())
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Member(name) => f.write_str(name),
            Segment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// A parsed dotted key.
///
/// Equality and ordering follow the canonical text form, so `a.007` and
/// `a.7` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalKey {
    text: String,
    segments: Vec<Segment>,
}

impl LogicalKey {
    /// Parses a dotted key.
    pub fn parse(raw: &str) -> EngineResult<Self> {
        let parts = split_segments(raw)?;
        let segments: Vec<Segment> = parts.iter().map(|part| Segment::parse(part)).collect();
        Ok(Self::from_segments(segments))
    }

    /// Builds a key from segments.
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        let text = join(&segments);
        Self { text, segments }
    }

    /// Canonical text form.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Parsed segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Returns the key extended by one segment.
    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self::from_segments(segments)
    }

    /// Returns the key made of the first `len` segments.
    pub fn prefix(&self, len: usize) -> Self {
        Self::from_segments(self.segments[..len.min(self.segments.len())].to_vec())
    }

    /// Returns true if `prefix` is this key or one of its ancestors.
    pub fn starts_with(&self, prefix: &LogicalKey) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// The last segment as text, used as the field name in merged results.
    pub fn trailing_segment(&self) -> String {
        self.segments
            .last()
            .map(|segment| segment.to_string())
            .unwrap_or_default()
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for LogicalKey {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        Self::parse(s)
    }
}

fn join(segments: &[Segment]) -> String {
    let mut text = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            text.push('.');
        }
        text.push_str(&segment.to_string());
    }
    text
}

/// Splits on dots outside double quotes.
fn split_segments(raw: &str) -> EngineResult<Vec<String>> {
    if raw.is_empty() {
        return Err(EngineError::invalid_key(raw, "empty key"));
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in raw.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '.' if !in_quotes => {
                if current.is_empty() {
                    return Err(EngineError::invalid_key(raw, "empty segment"));
                }
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }

    if in_quotes {
        return Err(EngineError::invalid_key(raw, "unbalanced quote"));
    }
    if current.is_empty() {
        return Err(EngineError::invalid_key(raw, "empty segment"));
    }
    parts.push(current);
    Ok(parts)
}

/// Anything that names one or more logical keys.
pub trait IntoKeys {
    /// Returns the key texts.
    fn into_keys(self) -> Vec<String>;
}

impl IntoKeys for &str {
    fn into_keys(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoKeys for String {
    fn into_keys(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoKeys for &String {
    fn into_keys(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl IntoKeys for &[&str] {
    fn into_keys(self) -> Vec<String> {
        self.iter().map(|key| key.to_string()).collect()
    }
}

impl<const N: usize> IntoKeys for [&str; N] {
    fn into_keys(self) -> Vec<String> {
        self.iter().map(|key| key.to_string()).collect()
    }
}

impl IntoKeys for Vec<&str> {
    fn into_keys(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl IntoKeys for Vec<String> {
    fn into_keys(self) -> Vec<String> {
        self
    }
}

impl IntoKeys for &[String] {
    fn into_keys(self) -> Vec<String> {
        self.to_vec()
    }
}

/// Parses every key, rejecting an empty set.
pub(crate) fn parse_keys(keys: impl IntoKeys) -> EngineResult<Vec<LogicalKey>> {
    let keys = keys
        .into_keys()
        .iter()
        .map(|key| LogicalKey::parse(key))
        .collect::<EngineResult<Vec<_>>>()?;
    if keys.is_empty() {
        return Err(EngineError::EmptyRequest);
    }
    Ok(keys)
}

/// Longest-prefix substitution from logical keys to transport addresses.
///
/// After substitution, index segments are rendered in bracket form
/// (`a.3.b` becomes `a[3].b`).
#[derive(Debug, Clone, Default)]
pub struct KeyMap {
    entries: Vec<(LogicalKey, String)>,
}

impl KeyMap {
    /// Creates an empty map (identity translation).
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from `(logical prefix, transport prefix)` pairs.
    pub fn from_pairs(pairs: &[(String, String)]) -> EngineResult<Self> {
        let mut map = Self::new();
        for (logical, transport) in pairs {
            map.insert(LogicalKey::parse(logical)?, transport.clone());
        }
        Ok(map)
    }

    /// Adds a substitution. A later entry for the same prefix replaces the earlier one.
    pub fn insert(&mut self, logical: LogicalKey, transport: impl Into<String>) {
        self.entries.retain(|(existing, _)| existing != &logical);
        self.entries.push((logical, transport.into()));
        self.entries
            .sort_by(|a, b| b.0.depth().cmp(&a.0.depth()).then_with(|| a.0.cmp(&b.0)));
    }

    /// Number of substitutions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no substitutions are configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Translates a logical key into the transport address.
    pub fn address(&self, key: &LogicalKey) -> String {
        let matched = self
            .entries
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix));

        let (mut address, rest) = match matched {
            Some((prefix, transport)) => (
                bracket_indices(transport),
                &key.segments()[prefix.depth()..],
            ),
            None => (String::new(), key.segments()),
        };

        for segment in rest {
            match segment {
                Segment::Index(index) => {
                    address.push('[');
                    address.push_str(&index.to_string());
                    address.push(']');
                }
                Segment::Member(name) => {
                    if !address.is_empty() {
                        address.push('.');
                    }
                    address.push_str(name);
                }
            }
        }
        address
    }
}

/// Rewrites `.N` segments of an already substituted prefix into `[N]`.
fn bracket_indices(text: &str) -> String {
    match split_segments(text) {
        Ok(parts) => {
            let mut out = String::new();
            for part in parts {
                match Segment::parse(&part) {
                    Segment::Index(index) if !out.is_empty() => {
                        out.push('[');
                        out.push_str(&index.to_string());
                        out.push(']');
                    }
                    _ => {
                        if !out.is_empty() {
                            out.push('.');
                        }
                        out.push_str(&part);
                    }
                }
            }
            out
        }
        Err(_) => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> LogicalKey {
        LogicalKey::parse(raw).unwrap()
    }

    #[test]
    fn parse_members_and_indices() {
        let k = key("\"DB\".arr.3.x");
        assert_eq!(
            k.segments(),
            &[
                Segment::Member("\"DB\"".into()),
                Segment::Member("arr".into()),
                Segment::Index(3),
                Segment::Member("x".into()),
            ]
        );
        assert_eq!(k.to_string(), "\"DB\".arr.3.x");
        assert_eq!(k.trailing_segment(), "x");
    }

    #[test]
    fn quoted_dots_do_not_split() {
        let k = key("\"DB.v2\".a");
        assert_eq!(k.depth(), 2);
        assert_eq!(k.segments()[0], Segment::Member("\"DB.v2\"".into()));
    }

    #[test]
    fn invalid_keys() {
        assert!(matches!(
            LogicalKey::parse(""),
            Err(EngineError::InvalidKey { .. })
        ));
        assert!(LogicalKey::parse("a..b").is_err());
        assert!(LogicalKey::parse("a.").is_err());
        assert!(LogicalKey::parse("\"DB.a").is_err());
    }

    #[test]
    fn canonical_indices() {
        assert_eq!(key("a.007"), key("a.7"));
        assert_eq!(key("a.007").as_str(), "a.7");
    }

    #[test]
    fn prefix_relations() {
        let k = key("a.b.c");
        assert!(k.starts_with(&key("a")));
        assert!(k.starts_with(&key("a.b.c")));
        assert!(!k.starts_with(&key("a.c")));
        assert!(!key("ab.c").starts_with(&key("a")));
        assert_eq!(k.prefix(2), key("a.b"));
        assert_eq!(key("a").child(Segment::Index(0)), key("a.0"));
    }

    #[test]
    fn into_keys_variants() {
        assert_eq!("a".into_keys(), vec!["a".to_string()]);
        assert_eq!(["a", "b"].into_keys().len(), 2);
        assert_eq!(vec!["a".to_string()].into_keys().len(), 1);
        assert!(matches!(
            parse_keys(Vec::<String>::new()),
            Err(EngineError::EmptyRequest)
        ));
    }

    #[test]
    fn address_without_map_uses_brackets() {
        let map = KeyMap::new();
        assert_eq!(map.address(&key("\"DB\".arr.3.x")), "\"DB\".arr[3].x");
        assert_eq!(map.address(&key("\"DB\".a")), "\"DB\".a");
    }

    #[test]
    fn longest_prefix_wins() {
        let mut map = KeyMap::new();
        map.insert(key("a"), "X");
        map.insert(key("a.b"), "Y");

        assert_eq!(map.address(&key("a.b.c")), "Y.c");
        assert_eq!(map.address(&key("a.c")), "X.c");
        assert_eq!(map.address(&key("z.c")), "z.c");
    }

    #[test]
    fn substituted_prefix_indices_are_bracketed() {
        let mut map = KeyMap::new();
        map.insert(key("Motors"), "\"DB_Drives\".motor");
        map.insert(key("Left"), "\"DB_Drives\".motor.0");

        assert_eq!(map.address(&key("Motors.2.speed")), "\"DB_Drives\".motor[2].speed");
        assert_eq!(map.address(&key("Left.speed")), "\"DB_Drives\".motor[0].speed");
    }

    #[test]
    fn key_map_from_pairs() {
        let pairs = vec![("a".to_string(), "X".to_string())];
        let map = KeyMap::from_pairs(&pairs).unwrap();
        assert_eq!(map.len(), 1);
        assert!(KeyMap::from_pairs(&[("".to_string(), "X".to_string())]).is_err());
    }
}
