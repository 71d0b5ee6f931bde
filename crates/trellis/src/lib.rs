//! Transparent mutation tracking with fine-grained path subscriptions.
//!
//! A [`Session`] owns an arena of tracked containers. Mutator closures
//! run inside recording epochs: every write captures the prior state
//! into a patch, and at the end of the top-level epoch the patch batch
//! is published to exactly the subscribers whose recorded read-path
//! changed.
//!
//! ```
//! use trellis::Session;
//! use serde_json::json;
//! use std::sync::{Arc, Mutex};
//!
//! let mut session = Session::new();
//! let state = session.wrap_json(&json!({"count": 0})).unwrap();
//!
//! let hits = Arc::new(Mutex::new(0));
//! let hits_clone = Arc::clone(&hits);
//! session
//!     .subscribe(state, |s| { s.field("count"); }, move |_| {
//!         *hits_clone.lock().unwrap() += 1;
//!     })
//!     .unwrap();
//!
//! session.mutate(state, |h| h.set("count", 1)).unwrap();
//! assert_eq!(*hits.lock().unwrap(), 1);
//! ```

pub mod path;
pub mod pipeline;
pub mod session;
pub mod steps;
pub mod subs;

pub use path::{record_path, PathProbe, PathRecord, Step};
pub use session::Session;
pub use steps::{FnSteps, StepError, StepFlow, StepHandle, StepMutator, StepStatus};
pub use subs::{CallbackId, Subscription, SubscriptionTracker};

pub use trellis_core::{
    CaptureScope, Epoch, Handle, Key, Node, NodeId, NodeKind, Patch, PatchBatch, PatchData,
    PatchError, Slot, Store, StoreError, Value,
};

/// Returns the crate version at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
