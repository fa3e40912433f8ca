//! Bus Values
//!
//! Dynamic argument/result values carried by calls. Arrays and objects are
//! shared mutable containers so that aliasing and cycles survive a trip
//! through the dispatcher; equality on containers and handles is identity.

use crate::error::{BusError, Result};
use crate::stream::{ReadableStream, WritableStream};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Dynamic value passed through procedure calls
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    Bytes(Bytes),
    Array(ArrayRef),
    Object(ObjectRef),
    /// Reference to an object pinned on a remote peer
    Pinned(PinnedHandle),
    /// Readable side of a duplex stream
    Readable(ReadableStream),
    /// Writable side of a duplex stream
    Writable(WritableStream),
}

/// Shared, mutable array
#[derive(Clone, Default)]
pub struct ArrayRef(Arc<Mutex<Vec<Value>>>);

/// Shared, mutable string-keyed object
#[derive(Clone, Default)]
pub struct ObjectRef(Arc<Mutex<BTreeMap<String, Value>>>);

impl ArrayRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Arc::new(Mutex::new(items)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.lock().get(index).cloned()
    }

    pub fn push(&self, value: Value) {
        self.0.lock().push(value);
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        match self.0.lock().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Shallow copy of the current items; never holds the lock afterwards
    pub fn snapshot(&self) -> Vec<Value> {
        self.0.lock().clone()
    }

    pub fn ptr_eq(&self, other: &ArrayRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl ObjectRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.lock().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.lock().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.lock().keys().cloned().collect()
    }

    /// Shallow copy of the current entries; never holds the lock afterwards
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.0
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Array@{:x}[{}]", self.identity(), self.len())
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object@{:x}{:?}", self.identity(), self.keys())
    }
}

/// Handle to an object pinned on a remote peer.
///
/// Fan-out targets share one handle; release is owned by whoever pinned it.
#[derive(Clone)]
pub struct PinnedHandle {
    inner: Arc<PinnedInner>,
}

struct PinnedInner {
    id: Uuid,
    label: String,
}

impl PinnedHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PinnedInner {
                id: Uuid::new_v4(),
                label: label.into(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn ptr_eq(&self, other: &PinnedHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for PinnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pinned({}, {})", self.inner.label, self.inner.id.simple())
    }
}

impl Value {
    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(ArrayRef::from_vec(items.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        let object = ObjectRef::new();
        for (key, value) in entries {
            object.insert(key, value);
        }
        Value::Object(object)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Pointer identity for containers and handles, `None` for plain data
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Array(a) => Some(a.identity()),
            Value::Object(o) => Some(o.identity()),
            Value::Pinned(p) => Some(p.identity()),
            Value::Readable(r) => Some(r.identity()),
            Value::Writable(w) => Some(w.identity()),
            _ => None,
        }
    }

    /// Convert plain data to JSON. Fails on handles and cycles.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        self.to_json_inner(&mut HashSet::new())
    }

    fn to_json_inner(&self, visiting: &mut HashSet<usize>) -> Result<serde_json::Value> {
        use serde_json::Value as Json;

        let json = match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.to_string()),
            Value::Bytes(b) => Json::Array(b.iter().map(|byte| Json::from(*byte)).collect()),
            Value::Array(a) => {
                if !visiting.insert(a.identity()) {
                    return Err(BusError::application("CycleError", "array contains itself"));
                }
                let items = a
                    .snapshot()
                    .iter()
                    .map(|item| item.to_json_inner(visiting))
                    .collect::<Result<Vec<_>>>()?;
                visiting.remove(&a.identity());
                Json::Array(items)
            }
            Value::Object(o) => {
                if !visiting.insert(o.identity()) {
                    return Err(BusError::application("CycleError", "object contains itself"));
                }
                let mut map = serde_json::Map::new();
                for (key, value) in o.snapshot() {
                    map.insert(key, value.to_json_inner(visiting)?);
                }
                visiting.remove(&o.identity());
                Json::Object(map)
            }
            Value::Pinned(_) | Value::Readable(_) | Value::Writable(_) => {
                return Err(BusError::application(
                    "SerializationError",
                    "handles have no JSON form",
                ))
            }
        };
        Ok(json)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(n) => write!(f, "Float({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes({}B)", b.len()),
            Value::Array(a) => a.fmt(f),
            Value::Object(o) => o.fmt(f),
            Value::Pinned(p) => p.fmt(f),
            Value::Readable(r) => r.fmt(f),
            Value::Writable(w) => w.fmt(f),
        }
    }
}

/// Scalars compare by value; containers and handles by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(ArrayRef::from_vec(items))
    }
}

impl From<PinnedHandle> for Value {
    fn from(handle: PinnedHandle) -> Self {
        Value::Pinned(handle)
    }
}

impl From<ReadableStream> for Value {
    fn from(stream: ReadableStream) -> Self {
        Value::Readable(stream)
    }
}

impl From<WritableStream> for Value {
    fn from(stream: WritableStream) -> Self {
        Value::Writable(stream)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            Json::String(s) => Value::from(s),
            Json::Array(items) => Value::array(items.into_iter().map(Value::from)),
            Json::Object(map) => Value::object(map.into_iter().map(|(k, v)| (k, Value::from(v)))),
        }
    }
}
