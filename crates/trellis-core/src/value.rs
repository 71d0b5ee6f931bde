//! Scalar-or-reference values stored inside tracked containers.

use crate::store::NodeId;

/// A value held by a record field, sequence slot, or map entry.
///
/// `Ref` points at another tracked container in the same store; reading a
/// `Ref` through a handle re-wraps it into a child handle, which is what
/// keeps nested containers transitively tracked.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ref(NodeId),
}

impl Value {
    /// Returns `true` when the value is a handle to a tracked container.
    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Ref(_))
    }

    pub fn as_ref_id(&self) -> Option<NodeId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Converts a scalar JSON value. Objects and arrays are container
    /// shapes and must go through `Store::wrap_json` instead.
    pub fn from_scalar_json(v: &serde_json::Value) -> Option<Value> {
        match v {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            serde_json::Value::String(s) => Some(Value::Str(s.clone())),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<NodeId> for Value {
    fn from(v: NodeId) -> Self {
        Value::Ref(v)
    }
}

impl From<Key> for Value {
    fn from(k: Key) -> Self {
        match k {
            Key::Null => Value::Null,
            Key::Bool(b) => Value::Bool(b),
            Key::Int(i) => Value::Int(i),
            Key::Str(s) => Value::Str(s),
            Key::Ref(id) => Value::Ref(id),
        }
    }
}

// ── Map/set keys ──────────────────────────────────────────────────────────

/// Totally ordered subset of [`Value`] usable as a map key or set member.
///
/// Floats are deliberately excluded. A `Ref` key is a tracked container used
/// as a key; identity is the arena id, so a key obtained through any handle
/// compares equal to the same key obtained through any other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Ref(NodeId),
}

impl Key {
    /// Renders the key as a JSON object-key literal for `view_json`.
    pub fn render(&self) -> String {
        match self {
            Key::Null => "null".to_owned(),
            Key::Bool(b) => b.to_string(),
            Key::Int(i) => i.to_string(),
            Key::Str(s) => s.clone(),
            Key::Ref(id) => format!("@{}", id.index()),
        }
    }
}

impl From<bool> for Key {
    fn from(v: bool) -> Self {
        Key::Bool(v)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Int(v as i64)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Str(v.to_owned())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Str(v)
    }
}

impl From<NodeId> for Key {
    fn from(v: NodeId) -> Self {
        Key::Ref(v)
    }
}

impl TryFrom<Value> for Key {
    type Error = Value;

    fn try_from(v: Value) -> Result<Self, Value> {
        match v {
            Value::Null => Ok(Key::Null),
            Value::Bool(b) => Ok(Key::Bool(b)),
            Value::Int(i) => Ok(Key::Int(i)),
            Value::Str(s) => Ok(Key::Str(s)),
            Value::Ref(id) => Ok(Key::Ref(id)),
            other @ Value::Float(_) => Err(other),
        }
    }
}
