//! Structural-diff records harvested at the end of a recording epoch.
//!
//! A patch captures the prior state of exactly one target, shaped by the
//! target's container kind. Replaying a patch (see [`crate::history`])
//! restores that prior state; replaying a batch newest-first unwinds a
//! whole epoch sequence.

use indexmap::IndexMap;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::store::NodeId;
use crate::value::{Key, Value};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch target {0} is not in the store")]
    UnknownTarget(u32),
    #[error("patch shape does not match the target container")]
    ShapeMismatch,
}

/// Prior state of one key: a value, or the no-entry sentinel.
///
/// `Absent` on a map key means the key did not exist before the epoch;
/// the same sentinel is used for record fields so that replay can delete
/// fields created during the epoch instead of guessing a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Present(Value),
    Absent,
}

/// Per-shape prior-state capture.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchData {
    /// Prior slot per changed field, in first-touch order.
    Record(IndexMap<String, Slot>),
    /// Full prior snapshot. Sequences are never field-diffed; the first
    /// mutating touch re-captures the whole vector.
    Sequence(Vec<Value>),
    /// Prior slot per changed key.
    Map(BTreeMap<Key, Slot>),
    /// Prior membership per changed member.
    Set(BTreeMap<Key, bool>),
}

impl PatchData {
    pub fn is_empty(&self) -> bool {
        match self {
            PatchData::Record(entries) => entries.is_empty(),
            // A sequence snapshot records a touch even when the vector
            // was empty before.
            PatchData::Sequence(_) => false,
            PatchData::Map(entries) => entries.is_empty(),
            PatchData::Set(entries) => entries.is_empty(),
        }
    }
}

/// A harvested patch. `target` links the patch back to its source
/// container without owning it; callers must keep the store alive for as
/// long as they retain patches against it.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub target: NodeId,
    pub data: PatchData,
}

/// The patches of one recording epoch, in first-touch order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchBatch {
    pub patches: Vec<Patch>,
}

impl PatchBatch {
    pub fn new(patches: Vec<Patch>) -> Self {
        Self { patches }
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }
}
