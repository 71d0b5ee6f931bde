//! Multi-step (suspendable) mutators with cooperative cancellation.
//!
//! A step mutator models what a suspendable async mutator does in the
//! dynamic-runtime version of this engine: an explicit state machine
//! whose steps each run inside their own top-level epoch, with control
//! returning to the caller between steps. Cancellation is checked at the
//! resume boundary — a step already running is never preempted, and
//! epochs committed before cancellation stay applied.

use thiserror::Error;

use trellis_core::{Handle, NodeId, StoreError};

#[derive(Debug, Error)]
pub enum StepError {
    #[error("operation was cancelled")]
    Cancelled,
    #[error("unknown or completed operation")]
    UnknownOperation,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a step reports about its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFlow {
    /// Suspend; the sequence continues at the next resume.
    Yield,
    /// The sequence is finished.
    Done,
}

/// Status returned by `Session::resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Complete,
}

/// A mutator that suspends at explicit yield points. Each `step` call
/// runs inside a fresh top-level epoch with its own publish cycle.
pub trait StepMutator {
    fn step(&mut self, handle: &mut Handle<'_, '_>) -> Result<StepFlow, StoreError>;
}

/// Identifies one outstanding step sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepHandle(pub(crate) u64);

pub(crate) struct PendingStep {
    pub target: NodeId,
    pub mutator: Box<dyn StepMutator>,
    pub cancelled: bool,
}

/// Convenience step mutator built from a list of closures, each run as
/// one step.
pub struct FnSteps {
    steps: Vec<Box<dyn FnMut(&mut Handle<'_, '_>) -> Result<(), StoreError>>>,
    cursor: usize,
}

impl FnSteps {
    pub fn new(
        steps: Vec<Box<dyn FnMut(&mut Handle<'_, '_>) -> Result<(), StoreError>>>,
    ) -> Self {
        Self { steps, cursor: 0 }
    }
}

impl StepMutator for FnSteps {
    fn step(&mut self, handle: &mut Handle<'_, '_>) -> Result<StepFlow, StoreError> {
        match self.steps.get_mut(self.cursor) {
            None => Ok(StepFlow::Done),
            Some(f) => {
                f(handle)?;
                self.cursor += 1;
                if self.cursor == self.steps.len() {
                    Ok(StepFlow::Done)
                } else {
                    Ok(StepFlow::Yield)
                }
            }
        }
    }
}
