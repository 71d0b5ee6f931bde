//! Core primitives for trellis: the arena store of tracked containers,
//! the patch model, lazy epoch capture, and history utilities.
//!
//! The dispatch pipeline, path recorder, and subscription graph live in
//! the `trellis` crate on top of these primitives.

pub mod epoch;
pub mod history;
pub mod patch;
pub mod store;
pub mod value;

pub use epoch::{CaptureScope, Epoch, Handle};
pub use patch::{Patch, PatchBatch, PatchData, PatchError, Slot};
pub use store::{Node, NodeId, NodeKind, Store, StoreError};
pub use value::{Key, Value};

/// Returns the crate version at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
