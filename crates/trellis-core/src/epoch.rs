//! Recording epochs and the tracked mutation surface.
//!
//! An [`Epoch`] is the span of one top-level mutation: writes performed
//! through a [`Handle`] lazily capture prior state into per-target patch
//! data, and `harvest` drains one patch per touched target at the end.
//! The pending table doubles as the modified set — a target is "modified"
//! exactly when it has uncommitted patch data.
//!
//! [`CaptureScope`] bundles the store with the live epoch and is what a
//! mutator closure receives (via a handle on its target). Reads that hit a
//! `Ref` value re-wrap into a child handle, so everything reachable from a
//! tracked root stays tracked.

use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::patch::{Patch, PatchData, Slot};
use crate::store::{Node, NodeId, NodeKind, Store, StoreError};
use crate::value::{Key, Value};

// ── Epoch ─────────────────────────────────────────────────────────────────

/// Uncommitted patch data for the current recording epoch, first-touch
/// ordered.
#[derive(Debug, Default)]
pub struct Epoch {
    pending: IndexMap<NodeId, PatchData>,
}

impl Epoch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the modified set; called at the start of a top-level epoch.
    pub fn begin(&mut self) {
        self.pending.clear();
    }

    /// Drains one patch per modified target, clearing the modified set.
    pub fn harvest(&mut self) -> Vec<Patch> {
        self.pending
            .drain(..)
            .map(|(target, data)| Patch { target, data })
            .collect()
    }

    pub fn is_modified(&self, id: NodeId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn modified_count(&self) -> usize {
        self.pending.len()
    }

    // ── Lazy capture, one rule per shape ──────────────────────────────

    /// Records the prior slot of a record field, once per field per epoch.
    fn capture_record_key(
        &mut self,
        store: &Store,
        id: NodeId,
        field: &str,
    ) -> Result<(), StoreError> {
        let rec = match store.node(id)? {
            Node::Record(rec) => rec,
            _ => return Err(StoreError::KindMismatch),
        };
        let prior = rec
            .get(field)
            .cloned()
            .map(Slot::Present)
            .unwrap_or(Slot::Absent);
        match self
            .pending
            .entry(id)
            .or_insert_with(|| PatchData::Record(IndexMap::new()))
        {
            PatchData::Record(entries) => {
                entries.entry(field.to_owned()).or_insert(prior);
            }
            _ => return Err(StoreError::KindMismatch),
        }
        Ok(())
    }

    /// Snapshots the whole sequence on its first mutating touch.
    fn capture_sequence(&mut self, store: &Store, id: NodeId) -> Result<(), StoreError> {
        if self.pending.contains_key(&id) {
            return Ok(());
        }
        let seq = match store.node(id)? {
            Node::Sequence(seq) => seq.clone(),
            _ => return Err(StoreError::KindMismatch),
        };
        self.pending.insert(id, PatchData::Sequence(seq));
        Ok(())
    }

    /// Records the prior slot of a map key, once per key per epoch.
    fn capture_map_key(&mut self, store: &Store, id: NodeId, key: &Key) -> Result<(), StoreError> {
        let entries = match store.node(id)? {
            Node::Map(entries) => entries,
            _ => return Err(StoreError::KindMismatch),
        };
        let prior = entries
            .get(key)
            .cloned()
            .map(Slot::Present)
            .unwrap_or(Slot::Absent);
        match self
            .pending
            .entry(id)
            .or_insert_with(|| PatchData::Map(Default::default()))
        {
            PatchData::Map(captured) => {
                captured.entry(key.clone()).or_insert(prior);
            }
            _ => return Err(StoreError::KindMismatch),
        }
        Ok(())
    }

    /// Records the prior membership of a set member, once per epoch.
    fn capture_set_member(
        &mut self,
        store: &Store,
        id: NodeId,
        member: &Key,
    ) -> Result<(), StoreError> {
        let members = match store.node(id)? {
            Node::Set(members) => members,
            _ => return Err(StoreError::KindMismatch),
        };
        let was_present = members.contains(member);
        match self
            .pending
            .entry(id)
            .or_insert_with(|| PatchData::Set(Default::default()))
        {
            PatchData::Set(captured) => {
                captured.entry(member.clone()).or_insert(was_present);
            }
            _ => return Err(StoreError::KindMismatch),
        }
        Ok(())
    }
}

// ── Capture scope ─────────────────────────────────────────────────────────

/// Store plus live epoch; the mutation context threaded through every
/// tracked write. Re-entrant mutation happens through [`CaptureScope::enter`]
/// and folds into the same epoch.
pub struct CaptureScope<'a> {
    store: &'a mut Store,
    epoch: &'a mut Epoch,
}

impl<'a> CaptureScope<'a> {
    pub fn new(store: &'a mut Store, epoch: &'a mut Epoch) -> Self {
        Self { store, epoch }
    }

    pub fn store(&self) -> &Store {
        &*self.store
    }

    /// Wraps a target id into a tracked handle.
    pub fn handle(&mut self, id: NodeId) -> Result<Handle<'_, 'a>, StoreError> {
        self.store.node(id)?;
        Ok(Handle { scope: self, id })
    }

    /// Runs a nested mutator against another target. Patches accumulate
    /// into the enclosing epoch; there is no separate harvest or publish.
    pub fn enter<R>(
        &mut self,
        target: NodeId,
        f: impl FnOnce(&mut Handle<'_, 'a>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut handle = self.handle(target)?;
        f(&mut handle)
    }

    /// Imports a plain JSON tree, allocating containers in the store.
    pub fn wrap_json(&mut self, v: &Json) -> Result<NodeId, StoreError> {
        self.store.wrap_json(v)
    }

    /// Replays a patch through the capture rules, so the replay itself is
    /// recorded (yielding a redo patch) and reaches subscribers when run
    /// inside a dispatched epoch.
    pub fn apply_patch(&mut self, patch: &Patch) -> Result<(), StoreError> {
        let mut handle = self.handle(patch.target)?;
        match &patch.data {
            PatchData::Record(entries) => {
                for (field, slot) in entries {
                    match slot {
                        Slot::Present(v) => handle.set(field, v.clone())?,
                        Slot::Absent => {
                            handle.remove(field)?;
                        }
                    }
                }
            }
            PatchData::Sequence(snapshot) => {
                handle.truncate(snapshot.len())?;
                for (i, v) in snapshot.iter().enumerate() {
                    if i < handle.len()? {
                        handle.set_at(i, v.clone())?;
                    } else {
                        handle.push(v.clone())?;
                    }
                }
            }
            PatchData::Map(entries) => {
                for (key, slot) in entries {
                    match slot {
                        Slot::Present(v) => {
                            handle.put(key.clone(), v.clone())?;
                        }
                        Slot::Absent => {
                            handle.delete(key)?;
                        }
                    }
                }
            }
            PatchData::Set(entries) => {
                for (member, was_present) in entries {
                    if *was_present {
                        handle.add(member.clone())?;
                    } else {
                        handle.take(member)?;
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Handle ────────────────────────────────────────────────────────────────

/// The sole mutation surface for one tracked container. Writes capture
/// prior state lazily before they land; reads of `Ref` values re-wrap.
pub struct Handle<'s, 'a> {
    scope: &'s mut CaptureScope<'a>,
    id: NodeId,
}

impl<'s, 'a> Handle<'s, 'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> Result<NodeKind, StoreError> {
        Ok(self.scope.store.node(self.id)?.kind())
    }

    pub fn scope(&mut self) -> &mut CaptureScope<'a> {
        &mut *self.scope
    }

    /// Element count for any shape.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(match self.scope.store.node(self.id)? {
            Node::Record(rec) => rec.len(),
            Node::Sequence(seq) => seq.len(),
            Node::Map(entries) => entries.len(),
            Node::Set(members) => members.len(),
        })
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    fn record(&self) -> Result<&IndexMap<String, Value>, StoreError> {
        match self.scope.store.node(self.id)? {
            Node::Record(rec) => Ok(rec),
            _ => Err(StoreError::KindMismatch),
        }
    }

    fn child(&mut self, id: NodeId) -> Handle<'_, 'a> {
        Handle {
            scope: &mut *self.scope,
            id,
        }
    }

    // ── Records ───────────────────────────────────────────────────────

    pub fn get(&self, field: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.record()?.get(field).cloned())
    }

    pub fn has(&self, field: &str) -> Result<bool, StoreError> {
        Ok(self.record()?.contains_key(field))
    }

    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.record()?.keys().cloned().collect())
    }

    /// Transparent re-wrap: a field holding a `Ref` comes back as a child
    /// handle, anything else as `None`.
    pub fn get_ref(&mut self, field: &str) -> Result<Option<Handle<'_, 'a>>, StoreError> {
        match self.get(field)? {
            Some(Value::Ref(id)) => Ok(Some(self.child(id))),
            _ => Ok(None),
        }
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        self.scope
            .epoch
            .capture_record_key(self.scope.store, self.id, field)?;
        match self.scope.store.node_mut(self.id)? {
            Node::Record(rec) => {
                rec.insert(field.to_owned(), value.into());
                Ok(())
            }
            _ => Err(StoreError::KindMismatch),
        }
    }

    /// Imports a JSON tree and stores it under `field`; objects and
    /// arrays allocate fresh tracked containers.
    pub fn set_json(&mut self, field: &str, v: &Json) -> Result<(), StoreError> {
        let value = self.scope.store.import_value(v)?;
        self.set(field, value)
    }

    pub fn remove(&mut self, field: &str) -> Result<Option<Value>, StoreError> {
        self.scope
            .epoch
            .capture_record_key(self.scope.store, self.id, field)?;
        match self.scope.store.node_mut(self.id)? {
            Node::Record(rec) => Ok(rec.shift_remove(field)),
            _ => Err(StoreError::KindMismatch),
        }
    }

    // ── Sequences ─────────────────────────────────────────────────────

    fn sequence(&self) -> Result<&Vec<Value>, StoreError> {
        match self.scope.store.node(self.id)? {
            Node::Sequence(seq) => Ok(seq),
            _ => Err(StoreError::KindMismatch),
        }
    }

    fn sequence_mut(&mut self) -> Result<&mut Vec<Value>, StoreError> {
        match self.scope.store.node_mut(self.id)? {
            Node::Sequence(seq) => Ok(seq),
            _ => Err(StoreError::KindMismatch),
        }
    }

    pub fn at(&self, index: usize) -> Result<Option<Value>, StoreError> {
        Ok(self.sequence()?.get(index).cloned())
    }

    pub fn ref_at(&mut self, index: usize) -> Result<Option<Handle<'_, 'a>>, StoreError> {
        match self.at(index)? {
            Some(Value::Ref(id)) => Ok(Some(self.child(id))),
            _ => Ok(None),
        }
    }

    pub fn set_at(&mut self, index: usize, value: impl Into<Value>) -> Result<(), StoreError> {
        self.scope.epoch.capture_sequence(self.scope.store, self.id)?;
        let seq = self.sequence_mut()?;
        let len = seq.len();
        match seq.get_mut(index) {
            Some(slot) => {
                *slot = value.into();
                Ok(())
            }
            None => Err(StoreError::IndexOutOfBounds { index, len }),
        }
    }

    pub fn push(&mut self, value: impl Into<Value>) -> Result<(), StoreError> {
        self.scope.epoch.capture_sequence(self.scope.store, self.id)?;
        self.sequence_mut()?.push(value.into());
        Ok(())
    }

    pub fn push_json(&mut self, v: &Json) -> Result<(), StoreError> {
        let value = self.scope.store.import_value(v)?;
        self.push(value)
    }

    pub fn pop(&mut self) -> Result<Option<Value>, StoreError> {
        self.scope.epoch.capture_sequence(self.scope.store, self.id)?;
        Ok(self.sequence_mut()?.pop())
    }

    pub fn insert_at(&mut self, index: usize, value: impl Into<Value>) -> Result<(), StoreError> {
        self.scope.epoch.capture_sequence(self.scope.store, self.id)?;
        let seq = self.sequence_mut()?;
        let len = seq.len();
        if index > len {
            return Err(StoreError::IndexOutOfBounds { index, len });
        }
        seq.insert(index, value.into());
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> Result<Value, StoreError> {
        self.scope.epoch.capture_sequence(self.scope.store, self.id)?;
        let seq = self.sequence_mut()?;
        let len = seq.len();
        if index >= len {
            return Err(StoreError::IndexOutOfBounds { index, len });
        }
        Ok(seq.remove(index))
    }

    pub fn truncate(&mut self, len: usize) -> Result<(), StoreError> {
        self.scope.epoch.capture_sequence(self.scope.store, self.id)?;
        self.sequence_mut()?.truncate(len);
        Ok(())
    }

    // ── Maps ──────────────────────────────────────────────────────────

    pub fn entry(&self, key: impl Into<Key>) -> Result<Option<Value>, StoreError> {
        match self.scope.store.node(self.id)? {
            Node::Map(entries) => Ok(entries.get(&key.into()).cloned()),
            _ => Err(StoreError::KindMismatch),
        }
    }

    pub fn entry_ref(&mut self, key: impl Into<Key>) -> Result<Option<Handle<'_, 'a>>, StoreError> {
        match self.entry(key)? {
            Some(Value::Ref(id)) => Ok(Some(self.child(id))),
            _ => Ok(None),
        }
    }

    pub fn contains_key(&self, key: impl Into<Key>) -> Result<bool, StoreError> {
        match self.scope.store.node(self.id)? {
            Node::Map(entries) => Ok(entries.contains_key(&key.into())),
            _ => Err(StoreError::KindMismatch),
        }
    }

    pub fn put(
        &mut self,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, StoreError> {
        let key = key.into();
        self.scope
            .epoch
            .capture_map_key(self.scope.store, self.id, &key)?;
        match self.scope.store.node_mut(self.id)? {
            Node::Map(entries) => Ok(entries.insert(key, value.into())),
            _ => Err(StoreError::KindMismatch),
        }
    }

    pub fn put_json(&mut self, key: impl Into<Key>, v: &Json) -> Result<(), StoreError> {
        let value = self.scope.store.import_value(v)?;
        self.put(key, value)?;
        Ok(())
    }

    pub fn delete(&mut self, key: &Key) -> Result<bool, StoreError> {
        self.scope
            .epoch
            .capture_map_key(self.scope.store, self.id, key)?;
        match self.scope.store.node_mut(self.id)? {
            Node::Map(entries) => Ok(entries.remove(key).is_some()),
            _ => Err(StoreError::KindMismatch),
        }
    }

    // ── Sets ──────────────────────────────────────────────────────────

    pub fn has_member(&self, member: impl Into<Key>) -> Result<bool, StoreError> {
        match self.scope.store.node(self.id)? {
            Node::Set(members) => Ok(members.contains(&member.into())),
            _ => Err(StoreError::KindMismatch),
        }
    }

    pub fn add(&mut self, member: impl Into<Key>) -> Result<bool, StoreError> {
        let member = member.into();
        self.scope
            .epoch
            .capture_set_member(self.scope.store, self.id, &member)?;
        match self.scope.store.node_mut(self.id)? {
            Node::Set(members) => Ok(members.insert(member)),
            _ => Err(StoreError::KindMismatch),
        }
    }

    pub fn take(&mut self, member: &Key) -> Result<bool, StoreError> {
        self.scope
            .epoch
            .capture_set_member(self.scope.store, self.id, member)?;
        match self.scope.store.node_mut(self.id)? {
            Node::Set(members) => Ok(members.remove(member)),
            _ => Err(StoreError::KindMismatch),
        }
    }

    // ── Shared clears ─────────────────────────────────────────────────

    /// Empties a sequence, map, or set, capturing every removed entry.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        match self.scope.store.node(self.id)? {
            Node::Sequence(_) => self.truncate(0),
            Node::Map(entries) => {
                let keys: Vec<Key> = entries.keys().cloned().collect();
                for key in &keys {
                    self.delete(key)?;
                }
                Ok(())
            }
            Node::Set(members) => {
                let members: Vec<Key> = members.iter().cloned().collect();
                for member in &members {
                    self.take(member)?;
                }
                Ok(())
            }
            Node::Record(_) => Err(StoreError::KindMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup(tree: Json) -> (Store, Epoch, NodeId) {
        let mut store = Store::new();
        let root = store.wrap_json(&tree).unwrap();
        (store, Epoch::new(), root)
    }

    #[test]
    fn first_write_captures_prior_field_value_once() {
        let (mut store, mut epoch, root) = setup(json!({"count": 0}));
        epoch.begin();
        let mut scope = CaptureScope::new(&mut store, &mut epoch);
        let mut h = scope.handle(root).unwrap();
        h.set("count", 1).unwrap();
        h.set("count", 2).unwrap();
        assert!(epoch.is_modified(root));
        assert_eq!(epoch.modified_count(), 1);
        let patches = epoch.harvest();
        assert_eq!(patches.len(), 1);
        match &patches[0].data {
            PatchData::Record(entries) => {
                assert_eq!(entries.get("count"), Some(&Slot::Present(Value::Int(0))));
            }
            other => panic!("expected record patch, got {other:?}"),
        }
    }

    #[test]
    fn new_field_records_absent_sentinel() {
        let (mut store, mut epoch, root) = setup(json!({}));
        epoch.begin();
        let mut scope = CaptureScope::new(&mut store, &mut epoch);
        scope
            .enter(root, |h| h.set("fresh", "hello"))
            .unwrap();
        let patches = epoch.harvest();
        match &patches[0].data {
            PatchData::Record(entries) => {
                assert_eq!(entries.get("fresh"), Some(&Slot::Absent));
            }
            other => panic!("expected record patch, got {other:?}"),
        }
    }

    #[test]
    fn sequence_snapshots_whole_vector_on_first_touch() {
        let (mut store, mut epoch, root) = setup(json!([1, 2, 3]));
        epoch.begin();
        let mut scope = CaptureScope::new(&mut store, &mut epoch);
        scope
            .enter(root, |h| {
                h.set_at(0, 9)?;
                h.push(4)?;
                h.pop()?;
                Ok(())
            })
            .unwrap();
        let patches = epoch.harvest();
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0].data,
            PatchData::Sequence(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn nested_reads_rewrap_and_track_transitively() {
        let (mut store, mut epoch, root) = setup(json!({"person": {"name": "Bob"}}));
        epoch.begin();
        let mut scope = CaptureScope::new(&mut store, &mut epoch);
        let person = scope
            .enter(root, |h| {
                let mut person = h.get_ref("person")?.expect("person is tracked");
                person.set("name", "Sally")?;
                Ok(person.id())
            })
            .unwrap();
        let patches = epoch.harvest();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].target, person);
        assert_ne!(person, root);
    }

    #[test]
    fn map_capture_distinguishes_no_entry_from_prior_value() {
        let mut store = Store::new();
        let map = store.alloc_map();
        let mut epoch = Epoch::new();

        epoch.begin();
        let mut scope = CaptureScope::new(&mut store, &mut epoch);
        scope.enter(map, |h| h.put("foo", 123).map(|_| ())).unwrap();
        let first = epoch.harvest();
        assert_eq!(
            first[0].data,
            PatchData::Map([(Key::from("foo"), Slot::Absent)].into_iter().collect())
        );

        epoch.begin();
        let mut scope = CaptureScope::new(&mut store, &mut epoch);
        scope.enter(map, |h| h.put("foo", 821).map(|_| ())).unwrap();
        let second = epoch.harvest();
        assert_eq!(
            second[0].data,
            PatchData::Map(
                [(Key::from("foo"), Slot::Present(Value::Int(123)))]
                    .into_iter()
                    .collect()
            )
        );
    }
}
