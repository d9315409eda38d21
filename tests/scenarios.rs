//! The concrete walkthroughs from this crate's testable-properties list,
//! each as its own scenario test.

use chronicle::testing::ManualClock;
use chronicle::{Chronicle, ListenerOptions, Mode, OptionsBuilder, Path, Resolution, ScalarKey, Segment, Value};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

fn key(name: &str) -> Path {
    Path::root().child(Segment::Key(name.into()))
}

fn record(fields: &[(&str, Value)]) -> Value {
    let mut m = IndexMap::new();
    for (k, v) in fields {
        m.insert(k.to_string(), v.clone());
    }
    Value::Record(m)
}

#[test]
fn scenario_1_set_then_delete_undo_all() {
    let root = record(&[("a", Value::Number(1.0)), ("b", record(&[("c", Value::Number(2.0))]))]);
    let c = Chronicle::wrap(root);

    c.set(&key("a"), Value::Number(5.0));
    let bc = key("b").child(Segment::Key("c".into()));
    c.set(&bc, Value::Number(7.0));
    c.delete(&bc);

    assert_eq!(c.history().len(), 3);
    assert_eq!(c.undo(3), 3);
    assert!(c.history().is_empty());

    assert!(matches!(c.get(&key("a")), Some(Value::Number(n)) if n == 1.0));
    let b = c.get(&key("b")).unwrap();
    assert!(matches!(b.as_record().unwrap().get("c"), Some(Value::Number(n)) if *n == 2.0));
}

#[test]
fn scenario_2_push_then_undo_leaves_no_hole() {
    let root = record(&[("arr", Value::Sequence(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]))]);
    let c = Chronicle::wrap(root);
    c.push(&key("arr"), Value::Number(4.0));
    c.undo(1);

    let arr = c.get(&key("arr")).unwrap();
    let seq = arr.as_sequence().unwrap();
    assert_eq!(seq.len(), 3);
    assert!(matches!(seq[2], Value::Number(n) if n == 3.0));
}

#[test]
fn scenario_3_map_batch_then_layered_undo() {
    let root = record(&[("m", Value::map())]);
    let c = Chronicle::wrap(root);
    let m = key("m");
    let a = ScalarKey::String("a".into());
    let b = ScalarKey::String("b".into());

    let result: Result<(), ()> = c.batch(|| {
        c.map_set(&m, a.clone(), Value::Number(1.0));
        c.map_set(&m, b.clone(), Value::Number(2.0));
        Ok(())
    });
    result.unwrap();
    c.map_delete(&m, &a);
    let result: Result<(), ()> = c.batch(|| {
        c.map_clear(&m);
        Ok(())
    });
    result.unwrap();

    fn map_of(c: &Chronicle, m: &Path) -> indexmap::IndexMap<ScalarKey, Value> {
        c.get(m).unwrap().as_map().cloned().unwrap_or_default()
    }

    assert!(map_of(&c, &m).is_empty());

    c.undo_groups(1);
    let after_one = map_of(&c, &m);
    assert_eq!(after_one.len(), 1);
    assert!(after_one.contains_key(&b));

    c.undo(1);
    let after_two = map_of(&c, &m);
    assert_eq!(after_two.len(), 2);
    assert!(after_two.contains_key(&a) && after_two.contains_key(&b));

    c.undo_groups(1);
    assert!(map_of(&c, &m).is_empty());
}

#[test]
fn scenario_4_merge_window_separates_distant_mutations_into_groups() {
    let clock = Rc::new(ManualClock::new());
    let options = OptionsBuilder::new().merge_window(Duration::from_millis(50)).build();
    let root = record(&[("a", Value::Number(1.0)), ("arr", Value::sequence())]);

    struct ForwardingClock(Rc<ManualClock>);
    impl std::fmt::Debug for ForwardingClock {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }
    impl chronicle::Clock for ForwardingClock {
        fn now(&self) -> std::time::Instant {
            self.0.now()
        }
    }

    let c = Chronicle::wrap_for_testing(root, options, Box::new(ForwardingClock(clock.clone())), Box::new(chronicle::ImmediateScheduler));

    c.set(&key("a"), Value::Number(2.0));
    clock.advance(Duration::from_millis(100));
    c.push(&key("arr"), Value::Number(1.0));

    assert_eq!(c.undo_groups(1), 1);
    let arr = c.get(&key("arr")).unwrap();
    assert!(arr.as_sequence().unwrap().is_empty());
    assert!(matches!(c.get(&key("a")), Some(Value::Number(n)) if n == 2.0));
}

#[test]
fn scenario_5_merge_reports_conflict_then_resolves() {
    let pristine = record(&[("a", Value::Number(1.0)), ("b", Value::Number(2.0)), ("c", Value::Number(3.0))]);
    let c = Chronicle::wrap(pristine);
    c.set(&key("a"), Value::Number(10.0));

    let incoming = record(&[("a", Value::Number(100.0)), ("b", Value::Number(20.0)), ("c", Value::Number(30.0))]);
    let outcome = c.merge(&incoming, &HashMap::new()).unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].path, key("a"));
    assert_eq!(outcome.applied, 2);
    assert!(matches!(c.get(&key("a")), Some(Value::Number(n)) if n == 10.0));
    assert!(matches!(c.get(&key("b")), Some(Value::Number(n)) if n == 20.0));
    assert!(matches!(c.get(&key("c")), Some(Value::Number(n)) if n == 30.0));

    let mut resolutions = HashMap::new();
    resolutions.insert(key("a"), Resolution::Theirs);
    let outcome2 = c.merge(&incoming, &resolutions).unwrap();
    assert!(outcome2.success);
    assert!(outcome2.conflicts.is_empty());
    assert!(matches!(c.get(&key("a")), Some(Value::Number(n)) if n == 100.0));
}

#[test]
fn scenario_6_pause_then_resume_delivers_in_assignment_order() {
    let c = Chronicle::wrap(record(&[("x", Value::Number(0.0))]));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    let _sub = c.listen(&key("x"), Mode::Exact, ListenerOptions::default(), move |_, new, _, _| {
        if let Some(Value::Number(n)) = new {
            seen2.borrow_mut().push(*n);
        }
    });

    c.pause();
    c.set(&key("x"), Value::Number(1.0));
    c.set(&key("x"), Value::Number(2.0));
    c.set(&key("x"), Value::Number(3.0));
    assert!(seen.borrow().is_empty());

    c.resume();
    assert_eq!(*seen.borrow(), vec![1.0, 2.0, 3.0]);
}
