//! Dispatch contract, nested epochs, patch handlers, and publish-aware
//! undo through the session surface.

use serde_json::json;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use trellis::pipeline::{dispatch, DispatchCtx, Middleware, Next};
use trellis::{Epoch, Patch, Session, Store, SubscriptionTracker};

struct DoubleNextStage;

impl Middleware for DoubleNextStage {
    fn run<'a>(&self, ctx: &mut DispatchCtx<'a>, next: &mut Next<'a, '_>) {
        next.call(ctx);
        next.call(ctx);
    }
}

#[test]
#[should_panic(expected = "continuation twice")]
fn stage_calling_next_twice_panics() {
    let mut store = Store::new();
    let target = store.wrap_json(&json!({})).unwrap();
    let mut epoch = Epoch::new();
    let mut subs = SubscriptionTracker::new();
    let mut ctx = DispatchCtx {
        store: &mut store,
        epoch: &mut epoch,
        subs: &mut subs,
        target,
        depth: 0,
        batches: Vec::new(),
        result: None,
        failed: false,
    };
    let stages: Vec<Rc<dyn Middleware>> = vec![Rc::new(DoubleNextStage)];
    dispatch(&stages, &mut ctx, &mut |_| {});
}

#[test]
fn nested_mutation_folds_into_one_publish() {
    let mut session = Session::new();
    let state = session
        .wrap_json(&json!({"left": {"n": 0}, "right": {"n": 0}}))
        .unwrap();
    let hits = Arc::new(Mutex::new(0usize));
    let clone = Arc::clone(&hits);
    session
        .subscribe(state, |s| {
            s.field("left").field("n");
            s.field("right").field("n");
        }, move |_| {
            *clone.lock().unwrap() += 1;
        })
        .unwrap();

    // One top-level epoch touching both sub-objects through re-entrant
    // scope access: a single publish, a single fire.
    session
        .mutate(state, |h| {
            let left = h.get_ref("left")?.unwrap().id();
            let right = h.get_ref("right")?.unwrap().id();
            let scope = h.scope();
            scope.enter(left, |l| l.set("n", 1))?;
            scope.enter(right, |r| r.set("n", 2))?;
            Ok(())
        })
        .unwrap();

    assert_eq!(*hits.lock().unwrap(), 1);
    assert_eq!(session.version(), 1);
}

#[test]
fn patch_handler_sees_patches_and_extends_the_batch() {
    let mut session = Session::new();
    let state = session.wrap_json(&json!({"count": 0})).unwrap();
    let journal = session.wrap_json(&json!({"entries": 0})).unwrap();
    let seen: Arc<Mutex<Vec<Patch>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);

    let journal_hits = Arc::new(Mutex::new(0usize));
    let clone = Arc::clone(&journal_hits);
    session
        .subscribe(journal, |s| {
            s.field("entries");
        }, move |_| {
            *clone.lock().unwrap() += 1;
        })
        .unwrap();

    let result = session
        .mutate_with_patches(
            state,
            |h| {
                h.set("count", 5)?;
                Ok("done")
            },
            journal,
            move |journal, patches, result| {
                assert_eq!(*result, "done");
                seen_clone.lock().unwrap().extend(patches.iter().cloned());
                let entries = match journal.get("entries").unwrap() {
                    Some(trellis::Value::Int(n)) => n,
                    _ => 0,
                };
                journal.set("entries", entries + 1).unwrap();
            },
        )
        .unwrap();

    assert_eq!(result, "done");
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(seen.lock().unwrap()[0].target, state);
    // The handler's own writes were published in the same cycle.
    assert_eq!(*journal_hits.lock().unwrap(), 1);
    assert_eq!(session.version(), 1);
    assert_eq!(
        session.view_json(journal).unwrap(),
        json!({"entries": 1})
    );
}

#[test]
fn undo_through_session_publishes_and_yields_redo() {
    let mut session = Session::new();
    let state = session.wrap_json(&json!({"count": 0})).unwrap();
    let undo: Arc<Mutex<Vec<Patch>>> = Arc::new(Mutex::new(Vec::new()));
    let undo_clone = Arc::clone(&undo);

    session
        .mutate_with_patches(
            state,
            |h| h.set("count", 1),
            state,
            move |_, patches, _| {
                undo_clone.lock().unwrap().extend(patches.iter().cloned());
            },
        )
        .unwrap();
    assert_eq!(session.view_json(state).unwrap(), json!({"count": 1}));

    let hits = Arc::new(Mutex::new(0usize));
    let clone = Arc::clone(&hits);
    session
        .subscribe(state, |s| {
            s.field("count");
        }, move |_| {
            *clone.lock().unwrap() += 1;
        })
        .unwrap();

    let patch = undo.lock().unwrap().pop().unwrap();
    let redo = session.reverse_patch(&patch).unwrap();
    session.apply_patch(&patch).unwrap();
    assert_eq!(session.view_json(state).unwrap(), json!({"count": 0}));
    assert_eq!(*hits.lock().unwrap(), 1);

    session.apply_patch(&redo).unwrap();
    assert_eq!(session.view_json(state).unwrap(), json!({"count": 1}));
    assert_eq!(*hits.lock().unwrap(), 2);
}

#[test]
fn failed_mutator_still_publishes_committed_writes() {
    let mut session = Session::new();
    let state = session.wrap_json(&json!({"count": 0})).unwrap();
    let hits = Arc::new(Mutex::new(0usize));
    let clone = Arc::clone(&hits);
    session
        .subscribe(state, |s| {
            s.field("count");
        }, move |_| {
            *clone.lock().unwrap() += 1;
        })
        .unwrap();

    let err = session.mutate(state, |h| {
        h.set("count", 7)?;
        h.at(0).map(|_| ()) // records are not sequences
    });
    assert!(err.is_err());
    assert_eq!(session.view_json(state).unwrap(), json!({"count": 7}));
    assert_eq!(*hits.lock().unwrap(), 1);
}
