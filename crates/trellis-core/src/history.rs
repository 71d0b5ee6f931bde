//! Reverse-patch construction and raw patch replay.
//!
//! These operate directly on the store, outside any epoch: replaying here
//! neither records new patches nor reaches subscribers. Dispatch-aware
//! replay (undo that publishes) goes through `CaptureScope::apply_patch`.

use crate::patch::{Patch, PatchData, PatchError, Slot};
use crate::store::{Node, NodeId, Store};

fn node_of<'a>(store: &'a Store, target: NodeId) -> Result<&'a Node, PatchError> {
    store
        .node(target)
        .map_err(|_| PatchError::UnknownTarget(target.index() as u32))
}

/// Builds the patch that undoes undoing: same shape as `patch`, entries
/// capture the *current* value of every key the input patch touched.
pub fn create_reverse_patch(store: &Store, patch: &Patch) -> Result<Patch, PatchError> {
    let node = node_of(store, patch.target)?;
    let data = match (&patch.data, node) {
        (PatchData::Record(entries), Node::Record(rec)) => PatchData::Record(
            entries
                .keys()
                .map(|field| {
                    let slot = rec
                        .get(field)
                        .cloned()
                        .map(Slot::Present)
                        .unwrap_or(Slot::Absent);
                    (field.clone(), slot)
                })
                .collect(),
        ),
        (PatchData::Sequence(_), Node::Sequence(seq)) => PatchData::Sequence(seq.clone()),
        (PatchData::Map(entries), Node::Map(current)) => PatchData::Map(
            entries
                .keys()
                .map(|key| {
                    let slot = current
                        .get(key)
                        .cloned()
                        .map(Slot::Present)
                        .unwrap_or(Slot::Absent);
                    (key.clone(), slot)
                })
                .collect(),
        ),
        (PatchData::Set(entries), Node::Set(members)) => PatchData::Set(
            entries
                .keys()
                .map(|member| (member.clone(), members.contains(member)))
                .collect(),
        ),
        _ => return Err(PatchError::ShapeMismatch),
    };
    Ok(Patch {
        target: patch.target,
        data,
    })
}

/// Replays a patch onto its linked target.
///
/// Records assign `Present` slots verbatim and delete on `Absent`;
/// sequences truncate to the snapshot length then overwrite each index;
/// maps resolve `Absent` as delete; sets resolve the flag as add/remove.
pub fn apply_patch(store: &mut Store, patch: &Patch) -> Result<(), PatchError> {
    let node = store
        .node_mut(patch.target)
        .map_err(|_| PatchError::UnknownTarget(patch.target.index() as u32))?;
    match (&patch.data, node) {
        (PatchData::Record(entries), Node::Record(rec)) => {
            for (field, slot) in entries {
                match slot {
                    Slot::Present(v) => {
                        rec.insert(field.clone(), v.clone());
                    }
                    Slot::Absent => {
                        rec.shift_remove(field);
                    }
                }
            }
        }
        (PatchData::Sequence(snapshot), Node::Sequence(seq)) => {
            seq.truncate(snapshot.len());
            for (i, v) in snapshot.iter().enumerate() {
                if i < seq.len() {
                    seq[i] = v.clone();
                } else {
                    seq.push(v.clone());
                }
            }
        }
        (PatchData::Map(entries), Node::Map(current)) => {
            for (key, slot) in entries {
                match slot {
                    Slot::Present(v) => {
                        current.insert(key.clone(), v.clone());
                    }
                    Slot::Absent => {
                        current.remove(key);
                    }
                }
            }
        }
        (PatchData::Set(entries), Node::Set(members)) => {
            for (member, was_present) in entries {
                if *was_present {
                    members.insert(member.clone());
                } else {
                    members.remove(member);
                }
            }
        }
        _ => return Err(PatchError::ShapeMismatch),
    }
    Ok(())
}

/// Replays a batch of patches newest-first, unwinding one epoch.
pub fn apply_batch_reversed(store: &mut Store, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches.iter().rev() {
        apply_patch(store, patch)?;
    }
    Ok(())
}
