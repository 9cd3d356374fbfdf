//! Diffable containers holding synchronized values.
//!
//! Containers are plain data. Each one carries a `version` that only moves
//! forward, and only when an assignment actually changed something. The
//! [`CompiledEntityType`](crate::CompiledEntityType) that created a
//! container is what knows how to assign into it.

use indexmap::IndexMap;
use serde_json::{Map, Value};

/// A synchronized value built from a compiled declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncValue {
    Scalar(SyncScalar),
    Object(SyncObject),
    List(SyncList),
    Map(SyncMap),
}

impl SyncValue {
    /// Current change version of this container.
    pub fn version(&self) -> u64 {
        match self {
            Self::Scalar(s) => s.version,
            Self::Object(o) => o.version,
            Self::List(l) => l.version,
            Self::Map(m) => m.version,
        }
    }

    /// Renders the container as the JSON clients see.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Scalar(s) => s.value.clone(),
            Self::Object(o) => o.to_json(),
            Self::List(l) => Value::Array(l.items.iter().map(SyncValue::to_json).collect()),
            Self::Map(m) => Value::Object(
                m.entries
                    .iter()
                    .map(|(key, item)| (key.clone(), item.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn as_object(&self) -> Option<&SyncObject> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&SyncMap> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&SyncList> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }
}

/// A primitive with replace semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncScalar {
    pub(crate) value: Value,
    pub(crate) version: u64,
}

impl SyncScalar {
    pub(crate) fn new(value: Value) -> Self {
        Self { value, version: 0 }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Replaces the value, returning `true` if it differed.
    pub(crate) fn replace(&mut self, value: &Value) -> bool {
        // `0` and `0.0` are the same number on the wire.
        let same = match (&self.value, value) {
            (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
            (a, b) => a == b,
        };
        if same {
            return false;
        }
        self.value = value.clone();
        self.version += 1;
        true
    }
}

/// A composite with one container per declared field.
///
/// `raw_cache` remembers the last raw input seen per field so a field is
/// only re-assigned when its input changes.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncObject {
    pub(crate) fields: IndexMap<String, SyncValue>,
    pub(crate) raw_cache: IndexMap<String, Value>,
    pub(crate) last_raw: Option<Value>,
    pub(crate) version: u64,
    pub(crate) net_version: Option<u64>,
}

impl SyncObject {
    pub(crate) fn new(fields: IndexMap<String, SyncValue>) -> Self {
        Self {
            fields,
            raw_cache: IndexMap::new(),
            last_raw: None,
            version: 0,
            net_version: None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&SyncValue> {
        self.fields.get(field)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version assigned by the executor, when the record is versioned.
    pub fn net_version(&self) -> Option<u64> {
        self.net_version
    }

    pub(crate) fn set_net_version(&mut self, version: u64) {
        self.net_version = Some(version);
    }

    fn to_json(&self) -> Value {
        let mut out: Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        if let Some(version) = self.net_version {
            out.insert("_netVersion".into(), Value::from(version));
        }
        Value::Object(out)
    }
}

/// An ordered list of leaf containers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncList {
    pub(crate) items: Vec<SyncValue>,
    pub(crate) last_raw: Option<Value>,
    pub(crate) version: u64,
}

impl SyncList {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SyncValue> {
        self.items.get(index)
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// A string-keyed map of leaf containers, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncMap {
    pub(crate) entries: IndexMap<String, SyncValue>,
    pub(crate) last_raw: Option<Value>,
    pub(crate) version: u64,
}

impl SyncMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&SyncValue> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}
