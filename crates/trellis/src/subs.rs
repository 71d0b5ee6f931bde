//! Subscription dependency graph: a tree of nodes mirroring recorded
//! paths, a reverse index from tracked target to interested nodes, and
//! the patch-to-callback resolution that fires the minimal callback set.
//!
//! Nodes bind to the target currently reachable at their path. When a
//! publish detects that a bound sub-object was replaced, the whole
//! subtree rebinds to the values now reachable, so callbacks survive
//! wholesale replacement (`state.person = new_person`) without being
//! re-registered.

use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use trellis_core::{Key, Node, NodeId, Patch, PatchBatch, PatchData, Slot, Store, Value};

use crate::path::{PathNode, PathRecord, Step};

/// Handle for one subscription-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubId(u32);

/// Identity of a registered callback; one callback may back several
/// subscriptions and still fires at most once per published batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(u64);

/// Returned by `subscribe`; feed to `unsubscribe` to detach.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) callback: CallbackId,
    pub(crate) leaves: Vec<SubId>,
}

impl Subscription {
    pub fn callback_id(&self) -> CallbackId {
        self.callback
    }
}

type CallbackFn = Box<dyn FnMut(&Store) + Send + Sync>;

struct CallbackEntry {
    f: CallbackFn,
    uses: usize,
}

#[derive(Debug, Default)]
struct SubNode {
    parent: Option<SubId>,
    /// Step from the parent; `None` at roots.
    step: Option<Step>,
    /// Target currently bound at this path, when the path resolves to a
    /// tracked container.
    observed: Option<NodeId>,
    fields: IndexMap<String, SubId>,
    indices: BTreeMap<usize, SubId>,
    map_keys: BTreeMap<Key, SubId>,
    each: Option<SubId>,
    any: Option<SubId>,
    callbacks: BTreeSet<CallbackId>,
}

impl SubNode {
    fn child_ids(&self) -> Vec<SubId> {
        let mut out: Vec<SubId> = self.fields.values().copied().collect();
        out.extend(self.indices.values().copied());
        out.extend(self.map_keys.values().copied());
        out.extend(self.each);
        out.extend(self.any);
        out
    }

    fn has_children(&self) -> bool {
        !self.fields.is_empty()
            || !self.indices.is_empty()
            || !self.map_keys.is_empty()
            || self.each.is_some()
            || self.any.is_some()
    }
}

/// Root nodes, the reverse target index, and the callback table.
#[derive(Default)]
pub struct SubscriptionTracker {
    nodes: Vec<Option<SubNode>>,
    roots: HashMap<NodeId, SubId>,
    reverse: HashMap<NodeId, BTreeSet<SubId>>,
    callbacks: BTreeMap<CallbackId, CallbackEntry>,
    next_callback: u64,
    version: u64,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic counter, bumped once per published batch.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// True when some live subscription node observes `target`.
    pub fn observes(&self, target: NodeId) -> bool {
        self.reverse.get(&target).is_some_and(|s| !s.is_empty())
    }

    fn node(&self, id: SubId) -> &SubNode {
        self.nodes[id.0 as usize]
            .as_ref()
            .expect("subscription node is live")
    }

    fn node_mut(&mut self, id: SubId) -> &mut SubNode {
        self.nodes[id.0 as usize]
            .as_mut()
            .expect("subscription node is live")
    }

    fn alloc(&mut self, node: SubNode) -> SubId {
        let id = SubId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    // ── Registration ──────────────────────────────────────────────────

    /// Registers `callback` on every leaf of the recorded path, binding
    /// intermediate nodes to the values currently reachable in `store`.
    pub fn subscribe(
        &mut self,
        store: &Store,
        target: NodeId,
        record: &PathRecord,
        callback: CallbackFn,
    ) -> Subscription {
        let id = CallbackId(self.next_callback);
        self.next_callback += 1;
        self.callbacks.insert(id, CallbackEntry { f: callback, uses: 0 });
        self.attach(store, target, record, id)
    }

    /// Attaches an existing callback along another path; the callback
    /// still fires at most once per batch across all of its paths.
    pub fn subscribe_with(
        &mut self,
        store: &Store,
        target: NodeId,
        record: &PathRecord,
        callback: CallbackId,
    ) -> Option<Subscription> {
        if !self.callbacks.contains_key(&callback) {
            return None;
        }
        Some(self.attach(store, target, record, callback))
    }

    fn attach(
        &mut self,
        store: &Store,
        target: NodeId,
        record: &PathRecord,
        callback: CallbackId,
    ) -> Subscription {
        let root = match self.roots.get(&target) {
            Some(&root) => root,
            None => {
                let root = self.alloc(SubNode {
                    observed: Some(target),
                    ..Default::default()
                });
                self.roots.insert(target, root);
                self.reverse.entry(target).or_default().insert(root);
                root
            }
        };
        let mut leaves = Vec::new();
        self.build(store, root, &record.root, callback, &mut leaves);
        for &leaf in &leaves {
            if self.node_mut(leaf).callbacks.insert(callback) {
                self.callbacks
                    .get_mut(&callback)
                    .expect("callback entry is live")
                    .uses += 1;
            }
        }
        Subscription {
            callback,
            leaves,
        }
    }

    fn build(
        &mut self,
        store: &Store,
        parent: SubId,
        path: &PathNode,
        callback: CallbackId,
        leaves: &mut Vec<SubId>,
    ) {
        if path.is_leaf() {
            leaves.push(parent);
            return;
        }
        for (step, child_path) in &path.children {
            let child = self.child_for_step(parent, step);
            let observed = resolve_step(store, self.node(parent).observed, step);
            self.bind(child, observed);
            self.build(store, child, child_path, callback, leaves);
        }
    }

    fn child_for_step(&mut self, parent: SubId, step: &Step) -> SubId {
        let existing = {
            let node = self.node(parent);
            match step {
                Step::Field(name) => node.fields.get(name).copied(),
                Step::Index(i) => node.indices.get(i).copied(),
                Step::MapKey(k) => node.map_keys.get(k).copied(),
                Step::Each => node.each,
                Step::Any => node.any,
            }
        };
        if let Some(id) = existing {
            return id;
        }
        let id = self.alloc(SubNode {
            parent: Some(parent),
            step: Some(step.clone()),
            ..Default::default()
        });
        let node = self.node_mut(parent);
        match step {
            Step::Field(name) => {
                node.fields.insert(name.clone(), id);
            }
            Step::Index(i) => {
                node.indices.insert(*i, id);
            }
            Step::MapKey(k) => {
                node.map_keys.insert(k.clone(), id);
            }
            Step::Each => node.each = Some(id),
            Step::Any => node.any = Some(id),
        }
        id
    }

    /// Points a node at a (possibly new) observed target, keeping the
    /// reverse index exact.
    fn bind(&mut self, id: SubId, observed: Option<NodeId>) {
        let old = self.node(id).observed;
        if old == observed {
            return;
        }
        if let Some(old_target) = old {
            if let Some(set) = self.reverse.get_mut(&old_target) {
                set.remove(&id);
                if set.is_empty() {
                    self.reverse.remove(&old_target);
                }
            }
        }
        if let Some(new_target) = observed {
            self.reverse.entry(new_target).or_default().insert(id);
        }
        self.node_mut(id).observed = observed;
    }

    // ── Removal ───────────────────────────────────────────────────────

    /// Detaches a subscription: removes its callback from each leaf and
    /// prunes now-empty ancestors up to the first node still holding
    /// callbacks or children.
    pub fn unsubscribe(&mut self, subscription: Subscription) {
        let Subscription { callback, leaves } = subscription;
        for leaf in leaves {
            if self.nodes[leaf.0 as usize].is_none() {
                continue;
            }
            if self.node_mut(leaf).callbacks.remove(&callback) {
                let entry = self
                    .callbacks
                    .get_mut(&callback)
                    .expect("callback entry is live");
                entry.uses -= 1;
                if entry.uses == 0 {
                    self.callbacks.remove(&callback);
                }
            }
            self.prune_up(leaf);
        }
    }

    fn prune_up(&mut self, mut id: SubId) {
        loop {
            let (empty, parent) = {
                let node = self.node(id);
                (
                    node.callbacks.is_empty() && !node.has_children(),
                    node.parent,
                )
            };
            if !empty {
                return;
            }
            self.bind(id, None);
            let step = self.nodes[id.0 as usize]
                .take()
                .and_then(|n| n.step);
            match parent {
                Some(parent_id) => {
                    let parent_node = self.node_mut(parent_id);
                    match step {
                        Some(Step::Field(name)) => {
                            parent_node.fields.shift_remove(&name);
                        }
                        Some(Step::Index(i)) => {
                            parent_node.indices.remove(&i);
                        }
                        Some(Step::MapKey(k)) => {
                            parent_node.map_keys.remove(&k);
                        }
                        Some(Step::Each) => parent_node.each = None,
                        Some(Step::Any) => parent_node.any = None,
                        None => {}
                    }
                    id = parent_id;
                }
                None => {
                    self.roots.retain(|_, &mut root| root != id);
                    return;
                }
            }
        }
    }

    // ── Publish ───────────────────────────────────────────────────────

    /// Resolves a batch of patches to the minimal callback set, rebinds
    /// invalidated subtrees, and fires each affected callback exactly
    /// once. Returns the number of callbacks fired.
    pub fn publish(&mut self, store: &Store, batches: &[PatchBatch]) -> usize {
        let mut invalidated: BTreeSet<SubId> = BTreeSet::new();
        let mut patch_count = 0usize;
        for batch in batches {
            for patch in &batch.patches {
                patch_count += 1;
                self.invalidate_for_patch(store, patch, &mut invalidated);
            }
        }
        if patch_count == 0 {
            return 0;
        }
        self.version += 1;

        let tops = self.highest_ancestors(&invalidated);
        let mut fired: BTreeSet<CallbackId> = BTreeSet::new();
        for top in tops {
            let observed = match self.node(top).parent {
                // Roots stay bound to their target for the store's life.
                None => self.node(top).observed,
                Some(parent) => {
                    let step = self.node(top).step.clone().expect("non-root node has a step");
                    resolve_step(store, self.node(parent).observed, &step)
                }
            };
            self.rebind_subtree(store, top, observed, &mut fired);
        }
        debug!(
            patches = patch_count,
            fired = fired.len(),
            version = self.version,
            "publish resolved callback set"
        );
        let mut count = 0;
        for id in fired {
            if let Some(entry) = self.callbacks.get_mut(&id) {
                (entry.f)(store);
                count += 1;
            }
        }
        count
    }

    fn invalidate_for_patch(
        &self,
        store: &Store,
        patch: &Patch,
        invalidated: &mut BTreeSet<SubId>,
    ) {
        let Some(watchers) = self.reverse.get(&patch.target) else {
            return;
        };
        let current = store.node(patch.target).ok();
        for &watcher in watchers {
            let node = self.node(watcher);
            match (&patch.data, current) {
                (PatchData::Record(entries), Some(Node::Record(rec))) => {
                    let mut any_changed = false;
                    for (field, prior) in entries {
                        if slot_changed(prior, rec.get(field)) {
                            any_changed = true;
                            if let Some(&child) = node.fields.get(field) {
                                invalidated.insert(child);
                            }
                        }
                    }
                    if any_changed {
                        invalidated.extend(node.any);
                    }
                }
                (PatchData::Sequence(snapshot), Some(Node::Sequence(seq))) => {
                    // A sequence patch marks the collection touched even
                    // when values compare equal.
                    invalidated.extend(node.each);
                    let mut any_changed = false;
                    let longest = snapshot.len().max(seq.len());
                    for i in 0..longest {
                        if snapshot.get(i) != seq.get(i) {
                            any_changed = true;
                            if let Some(&child) = node.indices.get(&i) {
                                invalidated.insert(child);
                            }
                        }
                    }
                    if any_changed {
                        invalidated.extend(node.any);
                    }
                }
                (PatchData::Map(entries), _) => {
                    invalidated.extend(node.each);
                    for key in entries.keys() {
                        if let Some(&child) = node.map_keys.get(key) {
                            invalidated.insert(child);
                        }
                    }
                    if !entries.is_empty() {
                        invalidated.extend(node.any);
                    }
                }
                (PatchData::Set(entries), _) => {
                    invalidated.extend(node.each);
                    for member in entries.keys() {
                        if let Some(&child) = node.map_keys.get(member) {
                            invalidated.insert(child);
                        }
                    }
                    if !entries.is_empty() {
                        invalidated.extend(node.any);
                    }
                }
                _ => {}
            }
        }
    }

    /// Nodes of the set with no proper ancestor also in the set.
    fn highest_ancestors(&self, invalidated: &BTreeSet<SubId>) -> Vec<SubId> {
        invalidated
            .iter()
            .copied()
            .filter(|&id| {
                let mut cursor = self.node(id).parent;
                while let Some(ancestor) = cursor {
                    if invalidated.contains(&ancestor) {
                        return false;
                    }
                    cursor = self.node(ancestor).parent;
                }
                true
            })
            .collect()
    }

    /// Rebinds `id` and every descendant to the values now reachable at
    /// their paths, gathering every callback found in the subtree.
    fn rebind_subtree(
        &mut self,
        store: &Store,
        id: SubId,
        observed: Option<NodeId>,
        fired: &mut BTreeSet<CallbackId>,
    ) {
        self.bind(id, observed);
        fired.extend(self.node(id).callbacks.iter().copied());
        for child in self.node(id).child_ids() {
            let step = self.node(child).step.clone().expect("child node has a step");
            let child_observed = resolve_step(store, observed, &step);
            self.rebind_subtree(store, child, child_observed, fired);
        }
    }
}

/// Resolves one path step against the live store: the tracked container
/// reachable at that step, if any.
fn resolve_step(store: &Store, parent: Option<NodeId>, step: &Step) -> Option<NodeId> {
    let parent = parent?;
    let node = store.node(parent).ok()?;
    let value = match (node, step) {
        (Node::Record(rec), Step::Field(name)) => rec.get(name),
        (Node::Sequence(seq), Step::Index(i)) => seq.get(*i),
        (Node::Map(entries), Step::MapKey(k)) => entries.get(k),
        _ => None,
    };
    match value {
        Some(Value::Ref(id)) => Some(*id),
        _ => None,
    }
}

fn slot_changed(prior: &Slot, current: Option<&Value>) -> bool {
    match (prior, current) {
        (Slot::Present(p), Some(c)) => p != c,
        (Slot::Present(_), None) => true,
        (Slot::Absent, Some(_)) => true,
        (Slot::Absent, None) => false,
    }
}
