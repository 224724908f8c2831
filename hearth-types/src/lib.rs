//! Shared types for hearth
//!
//! This crate provides the common identity and value types used across
//! the hearth ecosystem: resource paths and locations, typed values,
//! sample quality, framework timestamps and consumer identities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

/// Error raised when parsing a [`ResourcePath`] from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The path contained no segments.
    #[error("resource path must not be empty")]
    Empty,
    /// A segment was empty (leading, trailing or doubled separator).
    #[error("empty segment in resource path {0:?}")]
    EmptySegment(String),
}

/// Hierarchical path naming a resource from a root, e.g. `"meter/reading"`.
///
/// A path identifies a resource by navigation; it is *not* stable under
/// reference aliasing. The reference-resolved identity of the underlying
/// storage cell is a [`Location`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourcePath(Vec<String>);

impl ResourcePath {
    /// Create a path from segments. Segments must be non-empty.
    pub fn new(segments: Vec<String>) -> Result<Self, PathError> {
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        if segments.iter().any(|s| s.is_empty() || s.contains('/')) {
            return Err(PathError::EmptySegment(segments.join("/")));
        }
        Ok(Self(segments))
    }

    /// Parse a `"a/b/c"` style path.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        if text.is_empty() {
            return Err(PathError::Empty);
        }
        let segments: Vec<String> = text.split('/').map(|s| s.to_string()).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PathError::EmptySegment(text.to_string()));
        }
        Ok(Self(segments))
    }

    /// The path segments, root first.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The final segment (the resource's own name).
    pub fn name(&self) -> &str {
        self.0.last().map(|s| s.as_str()).unwrap_or("")
    }

    /// The parent path, or `None` for a root path.
    pub fn parent(&self) -> Option<ResourcePath> {
        if self.0.len() <= 1 {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Append a segment, returning the child path.
    pub fn child(&self, name: impl Into<String>) -> ResourcePath {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    /// Append another (relative) path.
    pub fn join(&self, rel: &ResourcePath) -> ResourcePath {
        let mut segments = self.0.clone();
        segments.extend(rel.0.iter().cloned());
        Self(segments)
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Paths are never empty; kept for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Canonical, reference-resolved identity of a storage cell.
///
/// Two paths that alias the same cell through references share one
/// `Location`; equality of locations is equality of the underlying
/// storage, which is what activation state and values attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location(pub u64);

impl Location {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loc:{}", self.0)
    }
}

/// The fixed set of value kinds a leaf resource can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    /// Milliseconds on the framework clock.
    Time,
    Str,
    Bytes,
    BoolArray,
    IntArray,
    FloatArray,
    StringArray,
}

/// A typed resource value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Time(i64),
    Str(String),
    Bytes(Vec<u8>),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl Value {
    /// The kind tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Time(_) => ValueKind::Time,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::BoolArray(_) => ValueKind::BoolArray,
            Value::IntArray(_) => ValueKind::IntArray,
            Value::FloatArray(_) => ValueKind::FloatArray,
            Value::StringArray(_) => ValueKind::StringArray,
        }
    }

    /// Numeric view used by the channel transform. `None` for
    /// non-numeric kinds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Time(t) => Some(*t as f64),
            _ => None,
        }
    }

    /// Build a value of `kind` from a raw numeric sample. `None` for
    /// non-numeric kinds.
    pub fn from_f64(kind: ValueKind, raw: f64) -> Option<Value> {
        match kind {
            ValueKind::Bool => Some(Value::Bool(raw != 0.0)),
            ValueKind::Int => Some(Value::Int(raw as i64)),
            ValueKind::Float => Some(Value::Float(raw)),
            ValueKind::Time => Some(Value::Time(raw as i64)),
            _ => None,
        }
    }
}

/// Quality flag attached to hardware samples and propagated into cell
/// metadata rather than being silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Quality {
    #[default]
    Good,
    Bad,
}

/// Milliseconds on the framework clock (virtual time, not wall clock).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Saturating addition of a millisecond offset.
    pub fn plus_millis(&self, ms: i64) -> Timestamp {
        Timestamp(self.0.saturating_add(ms))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t:{}", self.0)
    }
}

/// Why a consumer was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Regular shutdown requested by the framework or the consumer.
    Normal,
    /// The consumer was stopped because of a failure.
    Error,
}

/// Identity of a registered consumer (application).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(pub u64);

static CONSUMER_COUNTER: AtomicU64 = AtomicU64::new(1);

impl ConsumerId {
    /// Allocate a fresh consumer id.
    pub fn new() -> Self {
        Self(CONSUMER_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer:{}", self.0)
    }
}

/// Identity of a registered pattern demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DemandId(pub u64);

static DEMAND_COUNTER: AtomicU64 = AtomicU64::new(1);

impl DemandId {
    /// Allocate a fresh demand id.
    pub fn new() -> Self {
        Self(DEMAND_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for DemandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DemandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "demand:{}", self.0)
    }
}

/// Unforgeable handle identifying a listener registration.
///
/// The holder of a handle can remove the registration; removal is
/// synchronous-and-complete (no callbacks after it returns).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenerHandle(pub Uuid);

impl ListenerHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lh:{}", &self.0.to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_parse_and_display() {
        let path = ResourcePath::parse("meter/reading").unwrap();
        assert_eq!(path.segments(), &["meter", "reading"]);
        assert_eq!(path.to_string(), "meter/reading");
        assert_eq!(path.name(), "reading");
        assert_eq!(path.parent().unwrap().to_string(), "meter");
    }

    #[test]
    fn test_path_rejects_empty_segments() {
        assert!(matches!(ResourcePath::parse(""), Err(PathError::Empty)));
        assert!(matches!(
            ResourcePath::parse("a//b"),
            Err(PathError::EmptySegment(_))
        ));
        assert!(matches!(
            ResourcePath::parse("/a"),
            Err(PathError::EmptySegment(_))
        ));
    }

    #[test]
    fn test_path_join() {
        let base = ResourcePath::parse("device").unwrap();
        let rel = ResourcePath::parse("sensor/value").unwrap();
        assert_eq!(base.join(&rel).to_string(), "device/sensor/value");
    }

    #[test]
    fn test_value_kind_roundtrip() {
        assert_eq!(Value::Float(1.5).kind(), ValueKind::Float);
        assert_eq!(Value::from_f64(ValueKind::Int, 3.9), Some(Value::Int(3)));
        assert_eq!(Value::Bool(true).as_f64(), Some(1.0));
        assert_eq!(Value::Str("x".into()).as_f64(), None);
        assert_eq!(Value::from_f64(ValueKind::Str, 1.0), None);
    }

    #[test]
    fn test_consumer_id_uniqueness() {
        let a = ConsumerId::new();
        let b = ConsumerId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_listener_handle_uniqueness() {
        assert_ne!(ListenerHandle::new(), ListenerHandle::new());
    }
}
