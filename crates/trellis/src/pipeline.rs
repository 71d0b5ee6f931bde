//! The dispatch pipeline: an ordered middleware chain run around every
//! top-level mutator invocation.
//!
//! Stages receive the dispatch context and a continuation; a stage must
//! invoke its continuation at most once — a second call is a contract
//! violation that would duplicate harvesting and publishing, and panics
//! immediately. Re-entrancy depth lives in the context so any stage can
//! observe whether it is running the top-level call.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

use trellis_core::{CaptureScope, Epoch, NodeId, Patch, PatchBatch, Store};

use crate::subs::SubscriptionTracker;

/// Mutable state threaded through the stage chain.
pub struct DispatchCtx<'a> {
    pub store: &'a mut Store,
    pub epoch: &'a mut Epoch,
    pub subs: &'a mut SubscriptionTracker,
    pub target: NodeId,
    /// Re-entrancy depth; 1 inside the outermost dispatch.
    pub depth: u32,
    /// Patch batches harvested so far in this dispatch.
    pub batches: Vec<PatchBatch>,
    /// Result of the mutator body, type-erased so stages stay object
    /// safe; the dispatching caller downcasts it back.
    pub result: Option<Box<dyn Any>>,
    /// Set when the mutator body returned an error; dependent stages
    /// (the patch handler) skip their work.
    pub failed: bool,
}

/// The innermost "stage": the mutator body itself.
pub type DispatchBody<'a, 'b> = &'b mut dyn FnMut(&mut DispatchCtx<'a>);

/// One pipeline stage.
pub trait Middleware {
    fn run<'a>(&self, ctx: &mut DispatchCtx<'a>, next: &mut Next<'a, '_>);
}

/// Guarded continuation handed to each stage.
pub struct Next<'a, 'b> {
    stages: &'b [Rc<dyn Middleware>],
    body: DispatchBody<'a, 'b>,
    fired: bool,
}

impl<'a, 'b> Next<'a, 'b> {
    /// Proceeds to the rest of the chain. Calling this twice from the
    /// same stage is a fatal contract violation.
    pub fn call(&mut self, ctx: &mut DispatchCtx<'a>) {
        if self.fired {
            panic!("pipeline stage invoked its continuation twice");
        }
        self.fired = true;
        match self.stages.split_first() {
            None => (self.body)(ctx),
            Some((stage, rest)) => {
                let mut next = Next {
                    stages: rest,
                    body: &mut *self.body,
                    fired: false,
                };
                stage.run(ctx, &mut next);
            }
        }
    }
}

/// Runs `body` under the given stage chain.
pub fn dispatch<'a>(
    stages: &[Rc<dyn Middleware>],
    ctx: &mut DispatchCtx<'a>,
    body: DispatchBody<'a, '_>,
) {
    let mut next = Next {
        stages,
        body,
        fired: false,
    };
    next.call(ctx);
}

// ── Built-in stages ───────────────────────────────────────────────────────

/// Outermost stage: tracks re-entrancy depth around the chain.
pub struct DepthStage;

impl Middleware for DepthStage {
    fn run<'a>(&self, ctx: &mut DispatchCtx<'a>, next: &mut Next<'a, '_>) {
        ctx.depth += 1;
        next.call(ctx);
        ctx.depth -= 1;
    }
}

/// Publishes every harvested batch once the top-level chain unwinds.
pub struct PublishStage;

impl Middleware for PublishStage {
    fn run<'a>(&self, ctx: &mut DispatchCtx<'a>, next: &mut Next<'a, '_>) {
        next.call(ctx);
        if ctx.depth == 1 && !ctx.batches.is_empty() {
            ctx.subs.publish(ctx.store, &ctx.batches);
        }
    }
}

/// Innermost fixed stage: defines the recording epoch around the mutator
/// and harvests its patches.
pub struct EpochStage;

impl Middleware for EpochStage {
    fn run<'a>(&self, ctx: &mut DispatchCtx<'a>, next: &mut Next<'a, '_>) {
        if ctx.depth == 1 {
            ctx.epoch.begin();
            next.call(ctx);
            let patches = ctx.epoch.harvest();
            debug!(
                target_id = ctx.target.index(),
                patches = patches.len(),
                "epoch harvested"
            );
            ctx.batches.push(PatchBatch::new(patches));
        } else {
            // Nested dispatch: patches fold into the enclosing epoch.
            next.call(ctx);
        }
    }
}

/// Per-call dynamic stage for `mutate_with_patches`: runs the patch
/// handler as its own capture pass inside the same top-level dispatch,
/// after the mutator's harvest and before publish.
pub struct PatchHandlerStage {
    handler: RefCell<Option<HandlerFn>>,
}

type HandlerFn = Box<dyn FnOnce(&mut CaptureScope<'_>, &[Patch], &dyn Any)>;

impl PatchHandlerStage {
    pub fn new(handler: HandlerFn) -> Self {
        Self {
            handler: RefCell::new(Some(handler)),
        }
    }
}

impl Middleware for PatchHandlerStage {
    fn run<'a>(&self, ctx: &mut DispatchCtx<'a>, next: &mut Next<'a, '_>) {
        next.call(ctx);
        if ctx.depth != 1 {
            // Patch handlers are only meaningful on the outermost call;
            // report and skip rather than crash. The mutator's own work
            // stands.
            warn!("patch handler requested inside a nested epoch; skipping handler");
            return;
        }
        if ctx.failed {
            return;
        }
        let Some(handler) = self.handler.borrow_mut().take() else {
            return;
        };
        let patches: Vec<Patch> = ctx
            .batches
            .last()
            .map(|b| b.patches.clone())
            .unwrap_or_default();
        let result = ctx.result.take();
        ctx.epoch.begin();
        {
            let mut scope = CaptureScope::new(ctx.store, ctx.epoch);
            let result_ref: &dyn Any = match &result {
                Some(boxed) => boxed.as_ref(),
                None => &(),
            };
            handler(&mut scope, &patches, result_ref);
        }
        ctx.result = result;
        let follow_up = ctx.epoch.harvest();
        if !follow_up.is_empty() {
            ctx.batches.push(PatchBatch::new(follow_up));
        }
    }
}
