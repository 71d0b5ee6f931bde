//! The stateful façade: one `Session` owns the store, the live epoch,
//! the subscription tracker, the pipeline stages, and the table of
//! outstanding step sequences.

use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::warn;

use trellis_core::history::create_reverse_patch;
use trellis_core::{
    CaptureScope, Epoch, Handle, NodeId, Patch, PatchError, Store, StoreError,
};

use crate::path::{record_path, PathProbe, PathRecord};
use crate::pipeline::{
    dispatch, DepthStage, DispatchCtx, EpochStage, Middleware, PatchHandlerStage, PublishStage,
};
use crate::steps::{PendingStep, StepError, StepFlow, StepHandle, StepMutator, StepStatus};
use crate::subs::{CallbackId, Subscription, SubscriptionTracker};

pub struct Session {
    store: Store,
    epoch: Epoch,
    subs: SubscriptionTracker,
    depth_stage: Rc<dyn Middleware>,
    publish_stage: Rc<dyn Middleware>,
    epoch_stage: Rc<dyn Middleware>,
    pending: BTreeMap<u64, PendingStep>,
    next_step: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            store: Store::new(),
            epoch: Epoch::new(),
            subs: SubscriptionTracker::new(),
            depth_stage: Rc::new(DepthStage),
            publish_stage: Rc::new(PublishStage),
            epoch_stage: Rc::new(EpochStage),
            pending: BTreeMap::new(),
            next_step: 1,
        }
    }

    // ── Store access ──────────────────────────────────────────────────

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Tracks a plain JSON tree and returns its root id.
    pub fn wrap_json(&mut self, v: &serde_json::Value) -> Result<NodeId, StoreError> {
        self.store.wrap_json(v)
    }

    pub fn view_json(&self, id: NodeId) -> Result<serde_json::Value, StoreError> {
        self.store.view_json(id)
    }

    pub fn alloc_map(&mut self) -> NodeId {
        self.store.alloc_map()
    }

    pub fn alloc_set(&mut self) -> NodeId {
        self.store.alloc_set()
    }

    /// Subscription-tracker version; bumps once per published batch.
    pub fn version(&self) -> u64 {
        self.subs.version()
    }

    // ── Mutation ──────────────────────────────────────────────────────

    /// Runs one top-level mutation epoch against `target`: writes made
    /// through the handle are captured, harvested at the end, and
    /// published to the minimal set of affected subscribers.
    pub fn mutate<R: 'static>(
        &mut self,
        target: NodeId,
        f: impl FnOnce(&mut Handle<'_, '_>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.dispatch_with(target, Vec::new(), f)
    }

    /// As [`Session::mutate`], then — still inside the same top-level
    /// dispatch — runs `handler` as its own capture pass whose patches
    /// are appended to the published batch list. The handler receives a
    /// handle on `handler_state`, the mutator's harvested patches, and
    /// the mutator's result. Typical use: recording an undo stack.
    pub fn mutate_with_patches<R: 'static>(
        &mut self,
        target: NodeId,
        f: impl FnOnce(&mut Handle<'_, '_>) -> Result<R, StoreError>,
        handler_state: NodeId,
        handler: impl FnOnce(&mut Handle<'_, '_>, &[Patch], &R) + 'static,
    ) -> Result<R, StoreError> {
        self.store.node(handler_state)?;
        let stage = PatchHandlerStage::new(Box::new(move |scope, patches, result| {
            let result = match result.downcast_ref::<Result<R, StoreError>>() {
                Some(Ok(r)) => r,
                _ => return,
            };
            match scope.handle(handler_state) {
                Ok(mut handle) => handler(&mut handle, patches, result),
                Err(err) => warn!(%err, "patch handler state is gone; skipping handler"),
            }
        }));
        self.dispatch_with(target, vec![Rc::new(stage)], f)
    }

    fn dispatch_with<R: 'static>(
        &mut self,
        target: NodeId,
        dynamic: Vec<Rc<dyn Middleware>>,
        f: impl FnOnce(&mut Handle<'_, '_>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.store.node(target)?;
        // Fixed order: depth, publish, dynamic stages, epoch. Dynamic
        // stages therefore observe the harvested batch before publish.
        let mut stages: Vec<Rc<dyn Middleware>> = Vec::with_capacity(3 + dynamic.len());
        stages.push(Rc::clone(&self.depth_stage));
        stages.push(Rc::clone(&self.publish_stage));
        stages.extend(dynamic);
        stages.push(Rc::clone(&self.epoch_stage));

        let mut f = Some(f);
        let mut ctx = DispatchCtx {
            store: &mut self.store,
            epoch: &mut self.epoch,
            subs: &mut self.subs,
            target,
            depth: 0,
            batches: Vec::new(),
            result: None,
            failed: false,
        };
        let mut body = |ctx: &mut DispatchCtx<'_>| {
            let Some(f) = f.take() else { return };
            let out: Result<R, StoreError> = (|| {
                let mut scope = CaptureScope::new(&mut *ctx.store, &mut *ctx.epoch);
                let mut handle = scope.handle(ctx.target)?;
                f(&mut handle)
            })();
            ctx.failed = out.is_err();
            ctx.result = Some(Box::new(out));
        };
        dispatch(&stages, &mut ctx, &mut body);
        let result = ctx.result.take().expect("mutator body ran");
        *result
            .downcast::<Result<R, StoreError>>()
            .expect("mutator result type is stable")
    }

    // ── Step sequences ────────────────────────────────────────────────

    /// Registers a multi-step mutation; drive it with [`Session::resume`].
    pub fn spawn(
        &mut self,
        target: NodeId,
        mutator: impl StepMutator + 'static,
    ) -> Result<StepHandle, StoreError> {
        self.store.node(target)?;
        let id = self.next_step;
        self.next_step += 1;
        self.pending.insert(
            id,
            PendingStep {
                target,
                mutator: Box::new(mutator),
                cancelled: false,
            },
        );
        Ok(StepHandle(id))
    }

    /// Runs exactly one step inside its own top-level epoch (with its own
    /// publish cycle). A cancelled sequence rejects here and is dropped;
    /// epochs already committed are not rolled back.
    pub fn resume(&mut self, handle: StepHandle) -> Result<StepStatus, StepError> {
        let Some(mut op) = self.pending.remove(&handle.0) else {
            return Err(StepError::UnknownOperation);
        };
        if op.cancelled {
            return Err(StepError::Cancelled);
        }
        let flow = self.mutate(op.target, |h| op.mutator.step(h))?;
        match flow {
            StepFlow::Yield => {
                self.pending.insert(handle.0, op);
                Ok(StepStatus::Pending)
            }
            StepFlow::Done => Ok(StepStatus::Complete),
        }
    }

    /// Drives a sequence until it completes or errors.
    pub fn run_to_completion(&mut self, handle: StepHandle) -> Result<(), StepError> {
        loop {
            if let StepStatus::Complete = self.resume(handle)? {
                return Ok(());
            }
        }
    }

    /// Cooperatively cancels every outstanding step sequence: each one's
    /// next resume rejects. Code already mid-step is never preempted.
    pub fn cancel_all(&mut self) {
        for op in self.pending.values_mut() {
            op.cancelled = true;
        }
    }

    pub fn outstanding_steps(&self) -> usize {
        self.pending.len()
    }

    // ── Subscriptions ─────────────────────────────────────────────────

    /// Subscribes `callback` to the paths the selector touches. The
    /// callback fires (at most once per published batch) whenever a
    /// mutation changes a value along one of those paths.
    pub fn subscribe<F>(
        &mut self,
        target: NodeId,
        selector: impl FnOnce(&PathProbe),
        callback: F,
    ) -> Result<Subscription, StoreError>
    where
        F: FnMut(&Store) + Send + Sync + 'static,
    {
        self.store.node(target)?;
        let record = record_path(selector);
        Ok(self
            .subs
            .subscribe(&self.store, target, &record, Box::new(callback)))
    }

    /// Attaches an already-registered callback along another selector;
    /// it still fires at most once per batch across all of its paths.
    pub fn subscribe_shared(
        &mut self,
        target: NodeId,
        selector: impl FnOnce(&PathProbe),
        callback: CallbackId,
    ) -> Result<Option<Subscription>, StoreError> {
        self.store.node(target)?;
        let record = record_path(selector);
        Ok(self.subs.subscribe_with(&self.store, target, &record, callback))
    }

    /// Composite subscription: follows the selected sub-object and fires
    /// on any of its own property changes, across identity replacements.
    pub fn subscribe_all<F>(
        &mut self,
        target: NodeId,
        selector: impl FnOnce(&PathProbe),
        callback: F,
    ) -> Result<Subscription, StoreError>
    where
        F: FnMut(&Store) + Send + Sync + 'static,
    {
        self.store.node(target)?;
        let record = record_path(selector).with_any_leaves();
        Ok(self
            .subs
            .subscribe(&self.store, target, &record, Box::new(callback)))
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) {
        self.subs.unsubscribe(subscription);
    }

    pub fn tracker(&self) -> &SubscriptionTracker {
        &self.subs
    }

    // ── History ───────────────────────────────────────────────────────

    /// Captures the redo patch for `patch` against current state.
    pub fn reverse_patch(&self, patch: &Patch) -> Result<Patch, PatchError> {
        create_reverse_patch(&self.store, patch)
    }

    /// Replays a patch inside a mutation epoch, so the rollback itself
    /// is captured (yielding a redo patch) and published to subscribers.
    pub fn apply_patch(&mut self, patch: &Patch) -> Result<(), StoreError> {
        let patch = patch.clone();
        self.mutate(patch.target, move |h| h.scope().apply_patch(&patch))
    }

    /// Builds a `PathRecord` without subscribing; exposed for callers
    /// that cache selector recordings.
    pub fn record(selector: impl FnOnce(&PathProbe)) -> PathRecord {
        record_path(selector)
    }
}
