//! Fine-grained notification scenarios: minimal firing, coalescing,
//! rebinding across identity replacement, and reverse-index hygiene.

use serde_json::json;
use std::sync::{Arc, Mutex};
use trellis::{NodeId, Session};

fn counter() -> (Arc<Mutex<usize>>, impl FnMut(&trellis::Store) + Send + Sync + 'static) {
    let hits = Arc::new(Mutex::new(0usize));
    let clone = Arc::clone(&hits);
    (hits, move |_: &trellis::Store| {
        *clone.lock().unwrap() += 1;
    })
}

#[test]
fn count_increment_fires_once_and_applies() {
    let mut session = Session::new();
    let state = session.wrap_json(&json!({"count": 0})).unwrap();
    let (hits, cb) = counter();
    session
        .subscribe(state, |s| {
            s.field("count");
        }, cb)
        .unwrap();

    session.mutate(state, |h| h.set("count", 1)).unwrap();

    assert_eq!(*hits.lock().unwrap(), 1);
    assert_eq!(session.view_json(state).unwrap(), json!({"count": 1}));
}

#[test]
fn sibling_field_changes_do_not_fire() {
    let mut session = Session::new();
    let state = session
        .wrap_json(&json!({"person": {"name": "Bob", "age": 40}}))
        .unwrap();
    let (hits, cb) = counter();
    session
        .subscribe(state, |s| {
            s.field("person").field("name");
        }, cb)
        .unwrap();

    session
        .mutate(state, |h| {
            let mut person = h.get_ref("person")?.unwrap();
            person.set("age", 41)
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 0);

    session
        .mutate(state, |h| {
            let mut person = h.get_ref("person")?.unwrap();
            person.set("name", "Sally")
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn indexed_subscription_ignores_other_elements() {
    let mut session = Session::new();
    let state = session
        .wrap_json(&json!({"people": [{"name": "Bob"}, {"name": "Sally"}]}))
        .unwrap();
    let (hits, cb) = counter();
    session
        .subscribe(state, |s| {
            s.field("people").index(0).field("name");
        }, cb)
        .unwrap();

    session
        .mutate(state, |h| {
            let mut people = h.get_ref("people")?.unwrap();
            let mut second = people.ref_at(1)?.unwrap();
            second.set("name", "X")
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 0);

    session
        .mutate(state, |h| {
            let mut people = h.get_ref("people")?.unwrap();
            let mut first = people.ref_at(0)?.unwrap();
            first.set("name", "Y")
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn wholesale_replacement_rebinds_and_fires() {
    let mut session = Session::new();
    let state = session
        .wrap_json(&json!({"person": {"name": "Bob"}}))
        .unwrap();
    let (hits, cb) = counter();
    session
        .subscribe(state, |s| {
            s.field("person").field("name");
        }, cb)
        .unwrap();

    session
        .mutate(state, |h| h.set_json("person", &json!({"name": "Carol"})))
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 1);

    // The subscription survived the identity change: mutating the new
    // person's name keeps firing.
    session
        .mutate(state, |h| {
            let mut person = h.get_ref("person")?.unwrap();
            person.set("name", "Dana")
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 2);
}

#[test]
fn replacement_drops_old_identity_from_reverse_index() {
    let mut session = Session::new();
    let state = session
        .wrap_json(&json!({"person": {"name": "Bob"}}))
        .unwrap();
    let old_person: NodeId = session
        .mutate(state, |h| Ok(h.get_ref("person")?.unwrap().id()))
        .unwrap();
    let (_hits, cb) = counter();
    session
        .subscribe(state, |s| {
            s.field("person").field("name");
        }, cb)
        .unwrap();
    assert!(session.tracker().observes(old_person));

    session
        .mutate(state, |h| h.set_json("person", &json!({"name": "Eve"})))
        .unwrap();
    let new_person: NodeId = session
        .mutate(state, |h| Ok(h.get_ref("person")?.unwrap().id()))
        .unwrap();

    assert!(!session.tracker().observes(old_person));
    assert!(session.tracker().observes(new_person));
}

#[test]
fn shared_callback_across_two_paths_fires_once_per_batch() {
    let mut session = Session::new();
    let state = session.wrap_json(&json!({"a": 1, "b": 2})).unwrap();
    let (hits, cb) = counter();
    let first = session
        .subscribe(state, |s| {
            s.field("a");
        }, cb)
        .unwrap();
    session
        .subscribe_shared(state, |s| {
            s.field("b");
        }, first.callback_id())
        .unwrap()
        .expect("callback is registered");

    session
        .mutate(state, |h| {
            h.set("a", 10)?;
            h.set("b", 20)
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn unsubscribe_prunes_and_stops_firing() {
    let mut session = Session::new();
    let state = session.wrap_json(&json!({"count": 0})).unwrap();
    let (hits, cb) = counter();
    let sub = session
        .subscribe(state, |s| {
            s.field("count");
        }, cb)
        .unwrap();

    session.mutate(state, |h| h.set("count", 1)).unwrap();
    session.unsubscribe(sub);
    session.mutate(state, |h| h.set("count", 2)).unwrap();

    assert_eq!(*hits.lock().unwrap(), 1);
    assert_eq!(session.tracker().callback_count(), 0);
    assert!(!session.tracker().observes(state));
}

#[test]
fn iterate_subscription_fires_on_collection_growth() {
    let mut session = Session::new();
    let state = session.wrap_json(&json!({"items": [1, 2]})).unwrap();
    let (hits, cb) = counter();
    session
        .subscribe(state, |s| {
            s.field("items").each();
        }, cb)
        .unwrap();

    session
        .mutate(state, |h| {
            let mut items = h.get_ref("items")?.unwrap();
            items.push(3)
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn map_key_subscription_fires_only_for_that_key() {
    let mut session = Session::new();
    let state = session.wrap_json(&json!({})).unwrap();
    let lookup = session.alloc_map();
    session
        .mutate(state, move |h| h.set("lookup", lookup))
        .unwrap();
    let (hits, cb) = counter();
    session
        .subscribe(state, |s| {
            s.field("lookup").entry("foo");
        }, cb)
        .unwrap();

    session
        .mutate(state, |h| {
            let mut lookup = h.get_ref("lookup")?.unwrap();
            lookup.put("bar", 1).map(|_| ())
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 0);

    session
        .mutate(state, |h| {
            let mut lookup = h.get_ref("lookup")?.unwrap();
            lookup.put("foo", 2).map(|_| ())
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn any_subscription_fires_on_real_changes_only() {
    let mut session = Session::new();
    let state = session.wrap_json(&json!({"person": {"name": "Bob"}})).unwrap();
    let (hits, cb) = counter();
    session
        .subscribe_all(state, |s| {
            s.field("person");
        }, cb)
        .unwrap();

    // Writing the same value back records a patch but changes nothing.
    session
        .mutate(state, |h| {
            let mut person = h.get_ref("person")?.unwrap();
            person.set("name", "Bob")
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 0);

    session
        .mutate(state, |h| {
            let mut person = h.get_ref("person")?.unwrap();
            person.set("nickname", "Bobby")
        })
        .unwrap();
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn version_bumps_once_per_published_batch() {
    let mut session = Session::new();
    let state = session.wrap_json(&json!({"count": 0})).unwrap();
    assert_eq!(session.version(), 0);

    session.mutate(state, |h| h.set("count", 1)).unwrap();
    assert_eq!(session.version(), 1);

    // A read-only mutator publishes nothing.
    session
        .mutate(state, |h| h.get("count").map(|_| ()))
        .unwrap();
    assert_eq!(session.version(), 1);

    session.mutate(state, |h| h.set("count", 2)).unwrap();
    assert_eq!(session.version(), 2);
}
