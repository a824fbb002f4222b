//! Handle ownership and lifecycle through the public bridge surface

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use loopbind::{Bridge, Config};
use loopbind_sdk::{NativeError, Value};
use loopbind_testkit::MockRuntime;

fn counter(rt: &MockRuntime, hits: &Rc<Cell<u32>>) -> Value {
    let hits = hits.clone();
    rt.function(move |_, _| {
        hits.set(hits.get() + 1);
        Ok(vec![])
    })
}

#[test]
fn test_many_timers_release_everything() {
    let rt = MockRuntime::new();
    let bridge = Bridge::new(rt.clone(), Config::new());
    let fired = Rc::new(Cell::new(0));
    let closed = Rc::new(Cell::new(0));

    for i in 0..16 {
        let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
        let on_close = counter(&rt, &closed);
        let cb = {
            let fired = fired.clone();
            let weak = Rc::downgrade(&bridge);
            let timer = timer.clone();
            rt.function(move |_, _| {
                fired.set(fired.get() + 1);
                let bridge = weak.upgrade().expect("bridge alive");
                bridge.call("close", &[timer.clone(), on_close.clone()])?;
                Ok(vec![])
            })
        };
        bridge
            .call("timer_start", &[timer, Value::Integer(i % 3), Value::Integer(0), cb])
            .unwrap();
    }

    assert_eq!(bridge.call("run", &[]).unwrap(), vec![Value::Boolean(false)]);
    assert_eq!(fired.get(), 16);
    assert_eq!(closed.get(), 16);
    assert_eq!(bridge.native().handle_count(), 0);
    assert_eq!(rt.live_refs(), 0);
}

#[test]
fn test_closed_handle_rejects_further_use() {
    let rt = MockRuntime::new();
    let bridge = Bridge::new(rt.clone(), Config::new());
    let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
    bridge.call("close", &[timer.clone()]).unwrap();

    // closing twice is refused while the first close is pending
    assert!(matches!(
        bridge.call("close", &[timer.clone()]),
        Err(NativeError::Lifecycle(_))
    ));
    bridge.call("run", &[]).unwrap();

    let cb = rt.function(|_, _| Ok(vec![]));
    let err = bridge
        .call("timer_start", &[timer.clone(), Value::Integer(1), Value::Integer(0), cb])
        .unwrap_err();
    assert!(matches!(err, NativeError::Lifecycle(_)), "got {:?}", err);
    assert!(matches!(
        bridge.call("is_active", &[timer]),
        Err(NativeError::Lifecycle(_))
    ));
    assert_eq!(rt.live_refs(), 0);
}

#[test]
fn test_stopping_twice_releases_once() {
    let rt = MockRuntime::new();
    let bridge = Bridge::new(rt.clone(), Config::new());
    let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
    let cb = rt.function(|_, _| Ok(vec![]));
    bridge
        .call("timer_start", &[timer.clone(), Value::Integer(50), Value::Integer(0), cb])
        .unwrap();
    // the handle's own pin plus the callback
    assert_eq!(rt.live_refs(), 2);

    bridge.call("timer_stop", &[timer.clone()]).unwrap();
    assert_eq!(rt.live_refs(), 1);
    bridge.call("timer_stop", &[timer.clone()]).unwrap();
    assert_eq!(rt.live_refs(), 1);

    bridge.call("close", &[timer]).unwrap();
    bridge.call("run", &[]).unwrap();
    assert_eq!(rt.live_refs(), 0);
}

#[test]
fn test_repeating_timer_stopped_from_its_callback() {
    let rt = MockRuntime::new();
    let bridge = Bridge::new(rt.clone(), Config::new());
    let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
    let fired = Rc::new(Cell::new(0));
    let cb = {
        let fired = fired.clone();
        let weak = Rc::downgrade(&bridge);
        let timer = timer.clone();
        rt.function(move |_, _| {
            fired.set(fired.get() + 1);
            let bridge = weak.upgrade().expect("bridge alive");
            bridge.call("timer_stop", &[timer.clone()])?;
            bridge.call("close", &[timer.clone()])?;
            Ok(vec![])
        })
    };
    bridge
        .call("timer_start", &[timer, Value::Integer(1), Value::Integer(1), cb])
        .unwrap();
    bridge.call("run", &[]).unwrap();
    assert_eq!(fired.get(), 1);
    assert_eq!(rt.live_refs(), 0);
}

#[test]
fn test_failure_shape_is_stable() {
    let rt = MockRuntime::new();
    let bridge = Bridge::new(rt.clone(), Config::new());
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    let path = Value::from(missing.to_string_lossy().into_owned());

    let expected = vec![
        Value::Nil,
        Value::from(format!("ENOENT: no such file or directory: {}", missing.display())),
        Value::from("ENOENT"),
    ];
    assert_eq!(bridge.call("fs_stat", &[path.clone()]).unwrap(), expected);
    assert_eq!(bridge.call("fs_stat", &[path]).unwrap(), expected);
}

#[test]
fn test_callback_errors_do_not_stop_the_loop() {
    let rt = MockRuntime::new();
    let bridge = Bridge::new(rt.clone(), Config::new());
    let seen = Rc::new(RefCell::new(Vec::new()));

    let failing = rt.function(|_, _| Err(NativeError::Runtime("callback blew up".to_string())));
    let first = bridge.call("new_timer", &[]).unwrap().remove(0);
    bridge
        .call("timer_start", &[first.clone(), Value::Integer(0), Value::Integer(0), failing])
        .unwrap();

    let second = bridge.call("new_timer", &[]).unwrap().remove(0);
    let ok = {
        let seen = seen.clone();
        rt.function(move |_, _| {
            seen.borrow_mut().push("second");
            Ok(vec![])
        })
    };
    bridge
        .call("timer_start", &[second.clone(), Value::Integer(1), Value::Integer(0), ok])
        .unwrap();

    bridge.call("run", &[]).unwrap();
    assert_eq!(*seen.borrow(), vec!["second"]);
    assert_eq!(rt.reported_errors(), vec!["callback blew up".to_string()]);

    bridge.call("close", &[first]).unwrap();
    bridge.call("close", &[second]).unwrap();
    bridge.call("run", &[]).unwrap();
    assert_eq!(rt.live_refs(), 0);
}

#[test]
fn test_runtime_shutdown_collects_active_handle() {
    let rt = MockRuntime::new();
    let bridge = Bridge::new(rt.clone(), Config::new());
    let hits = Rc::new(Cell::new(0));
    let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
    bridge
        .call("timer_start", &[timer, Value::Integer(1), Value::Integer(1), counter(&rt, &hits)])
        .unwrap();
    assert_eq!(rt.live_refs(), 2);

    // the finalizer sees an active handle and closes it without a callback
    rt.close();
    assert_eq!(rt.live_refs(), 0);
    assert_eq!(bridge.call("run", &[]).unwrap(), vec![Value::Boolean(false)]);
    assert_eq!(hits.get(), 0);
    assert_eq!(bridge.native().handle_count(), 0);

    bridge.teardown();
    assert_eq!(rt.live_refs(), 0);
}

#[test]
fn test_collection_while_closing_waits_for_close_callback() {
    let rt = MockRuntime::new();
    let bridge = Bridge::new(rt.clone(), Config::new());
    let hits = Rc::new(Cell::new(0));
    let closed = Rc::new(Cell::new(0));
    let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
    bridge
        .call("timer_start", &[timer.clone(), Value::Integer(1), Value::Integer(1), counter(&rt, &hits)])
        .unwrap();
    bridge.call("close", &[timer.clone(), counter(&rt, &closed)]).unwrap();

    // a closing handle is still pinned by its own reference
    rt.collect();
    assert_eq!(rt.type_name(&timer), "uv_timer");

    bridge.call("run", &[]).unwrap();
    assert_eq!(hits.get(), 0);
    assert_eq!(closed.get(), 1);
    assert_eq!(bridge.native().handle_count(), 0);
    assert_eq!(rt.live_refs(), 0);

    // released wrappers finalize as a no-op
    assert!(rt.collect() >= 1);
    assert_eq!(rt.object_count(), 0);
    assert_eq!(closed.get(), 1);
}
