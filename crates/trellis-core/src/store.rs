//! Slab arena of tracked containers.
//!
//! Every tracked container lives in the arena under a stable [`NodeId`];
//! all engine indices (patch↔target, modified set, subscription reverse
//! index) key by that id. The id is the identity of the source model's
//! wrapper: wrapping is allocation, unwrapping is materialization.

use indexmap::IndexMap;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::value::{Key, Value};

/// Stable handle for a tracked container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown node id {0}")]
    UnknownNode(u32),
    #[error("value is already a tracked handle")]
    AlreadyWrapped,
    #[error("scalar values cannot be tracked as containers")]
    NotAContainer,
    #[error("operation does not match the container shape")]
    KindMismatch,
    #[error("sequence index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// One tracked container; a closed variant over the four shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Record(IndexMap<String, Value>),
    Sequence(Vec<Value>),
    Map(BTreeMap<Key, Value>),
    Set(BTreeSet<Key>),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Record(_) => NodeKind::Record,
            Node::Sequence(_) => NodeKind::Sequence,
            Node::Map(_) => NodeKind::Map,
            Node::Set(_) => NodeKind::Set,
        }
    }

    /// Collections in the iterate-subscription sense: everything except
    /// plain records.
    pub fn is_collection(&self) -> bool {
        !matches!(self, Node::Record(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Record,
    Sequence,
    Map,
    Set,
}

/// The arena. Slots are never reused within a store's lifetime, so ids
/// stay unambiguous across undo history.
#[derive(Debug, Default)]
pub struct Store {
    nodes: Vec<Option<Node>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(id.index()).is_some_and(|n| n.is_some())
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, StoreError> {
        self.nodes
            .get(id.index())
            .and_then(|n| n.as_ref())
            .ok_or(StoreError::UnknownNode(id.0))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, StoreError> {
        self.nodes
            .get_mut(id.index())
            .and_then(|n| n.as_mut())
            .ok_or(StoreError::UnknownNode(id.0))
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    pub fn alloc_record(&mut self) -> NodeId {
        self.alloc(Node::Record(IndexMap::new()))
    }

    pub fn alloc_sequence(&mut self) -> NodeId {
        self.alloc(Node::Sequence(Vec::new()))
    }

    pub fn alloc_map(&mut self) -> NodeId {
        self.alloc(Node::Map(BTreeMap::new()))
    }

    pub fn alloc_set(&mut self) -> NodeId {
        self.alloc(Node::Set(BTreeSet::new()))
    }

    // ── Identity primitives ───────────────────────────────────────────

    /// Returns `true` when the value is a tracked handle.
    pub fn is_wrapped(value: &Value) -> bool {
        value.is_ref()
    }

    /// Guard for wrapping values of unknown provenance.
    ///
    /// A `Ref` is already a tracked handle, so wrapping it again is the
    /// double-wrap programmer error; scalars are not container shapes.
    /// Plain container data enters through [`Store::wrap_json`].
    pub fn check_wrappable(value: &Value) -> Result<(), StoreError> {
        match value {
            Value::Ref(_) => Err(StoreError::AlreadyWrapped),
            _ => Err(StoreError::NotAContainer),
        }
    }

    /// Recursively imports a plain JSON tree: objects become records,
    /// arrays become sequences. The root must be a container shape.
    pub fn wrap_json(&mut self, v: &Json) -> Result<NodeId, StoreError> {
        match v {
            Json::Object(_) | Json::Array(_) => self.import(v),
            _ => Err(StoreError::NotAContainer),
        }
    }

    fn import(&mut self, v: &Json) -> Result<NodeId, StoreError> {
        match v {
            Json::Object(map) => {
                let mut rec = IndexMap::with_capacity(map.len());
                for (k, child) in map {
                    rec.insert(k.clone(), self.import_value(child)?);
                }
                Ok(self.alloc(Node::Record(rec)))
            }
            Json::Array(items) => {
                let mut seq = Vec::with_capacity(items.len());
                for child in items {
                    seq.push(self.import_value(child)?);
                }
                Ok(self.alloc(Node::Sequence(seq)))
            }
            _ => Err(StoreError::NotAContainer),
        }
    }

    /// Imports one JSON value into a [`Value`], allocating nested
    /// containers as needed.
    pub fn import_value(&mut self, v: &Json) -> Result<Value, StoreError> {
        match Value::from_scalar_json(v) {
            Some(scalar) => Ok(scalar),
            None => Ok(Value::Ref(self.import(v)?)),
        }
    }

    /// Materializes the plain tree reachable from `id` (`asOriginal`).
    ///
    /// Maps render as objects keyed by the key literal, sets as arrays of
    /// member literals. A node revisited on the current path renders as
    /// `null`; the arena can hold cycles, JSON cannot.
    pub fn view_json(&self, id: NodeId) -> Result<Json, StoreError> {
        let mut visiting = Vec::new();
        self.render(id, &mut visiting)
    }

    fn render(&self, id: NodeId, visiting: &mut Vec<NodeId>) -> Result<Json, StoreError> {
        if visiting.contains(&id) {
            return Ok(Json::Null);
        }
        visiting.push(id);
        let out = match self.node(id)? {
            Node::Record(rec) => {
                let mut map = serde_json::Map::with_capacity(rec.len());
                for (k, v) in rec {
                    map.insert(k.clone(), self.render_value(v, visiting)?);
                }
                Json::Object(map)
            }
            Node::Sequence(seq) => {
                let mut items = Vec::with_capacity(seq.len());
                for v in seq {
                    items.push(self.render_value(v, visiting)?);
                }
                Json::Array(items)
            }
            Node::Map(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (k, v) in entries {
                    map.insert(k.render(), self.render_value(v, visiting)?);
                }
                Json::Object(map)
            }
            Node::Set(members) => {
                let items = members
                    .iter()
                    .map(|k| Json::String(k.render()))
                    .collect::<Vec<_>>();
                Json::Array(items)
            }
        };
        visiting.pop();
        Ok(out)
    }

    fn render_value(&self, v: &Value, visiting: &mut Vec<NodeId>) -> Result<Json, StoreError> {
        Ok(match v {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Ref(id) => self.render(*id, visiting)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrap_json_round_trips_records_and_sequences() {
        let mut store = Store::new();
        let tree = json!({"name": "Bob", "tags": ["a", "b"], "age": 42});
        let id = store.wrap_json(&tree).unwrap();
        assert_eq!(store.view_json(id).unwrap(), tree);
        assert!(!store.node(id).unwrap().is_collection());
    }

    #[test]
    fn wrap_json_rejects_scalars() {
        let mut store = Store::new();
        assert!(matches!(
            store.wrap_json(&json!(42)),
            Err(StoreError::NotAContainer)
        ));
    }

    #[test]
    fn wrapping_guards_reject_handles_and_scalars() {
        let mut store = Store::new();
        let id = store.alloc_record();
        assert!(Store::is_wrapped(&Value::Ref(id)));
        assert!(!Store::is_wrapped(&Value::Int(1)));
        assert!(matches!(
            Store::check_wrappable(&Value::Ref(id)),
            Err(StoreError::AlreadyWrapped)
        ));
        assert!(matches!(
            Store::check_wrappable(&Value::Str("x".into())),
            Err(StoreError::NotAContainer)
        ));
    }

    #[test]
    fn cyclic_graph_renders_null_at_reentry() {
        let mut store = Store::new();
        let a = store.alloc_record();
        let b = store.alloc_record();
        match store.node_mut(a).unwrap() {
            Node::Record(rec) => {
                rec.insert("child".into(), Value::Ref(b));
            }
            _ => unreachable!(),
        }
        match store.node_mut(b).unwrap() {
            Node::Record(rec) => {
                rec.insert("parent".into(), Value::Ref(a));
            }
            _ => unreachable!(),
        }
        let view = store.view_json(a).unwrap();
        assert_eq!(view, json!({"child": {"parent": null}}));
    }
}
