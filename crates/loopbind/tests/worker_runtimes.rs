//! Each pool thread runs work in its own runtime, and every runtime is
//! handed back exactly once when the bridge goes away.
//!
//! Kept alone in this binary: it asserts on the process-wide acquire and
//! release counters.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Barrier;

use loopbind::{Bridge, Config};
use loopbind_sdk::{ThreadValue, Value};
use loopbind_testkit::{acquire_vm, acquired, register_worker_fn, release_vm, released, MockRuntime};
use once_cell::sync::Lazy;

static RENDEZVOUS: Lazy<Barrier> = Lazy::new(|| Barrier::new(2));

#[test]
fn test_pool_threads_get_distinct_runtimes() {
    loopbind::set_thread_hooks(acquire_vm, release_vm);
    // both jobs must be running at once, so they sit on different threads
    register_worker_fn("rendezvous", |vm, _| {
        RENDEZVOUS.wait();
        Ok(vec![
            ThreadValue::Integer(vm.id() as i64),
            vm.global("_THREAD").unwrap_or(ThreadValue::Nil),
        ])
    });

    let rt = MockRuntime::new();
    let bridge = Bridge::new(rt.clone(), Config::new().with_threadpool_size(2));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let after = {
        let seen = seen.clone();
        rt.function(move |_, args| {
            seen.borrow_mut().push(args);
            Ok(vec![])
        })
    };
    let work = bridge
        .call("new_work", &[rt.named_function("rendezvous"), after])
        .unwrap()
        .remove(0);
    bridge.call("queue_work", &[work.clone()]).unwrap();
    bridge.call("queue_work", &[work]).unwrap();
    bridge.call("run", &[]).unwrap();

    let seen = seen.borrow().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|args| args[1] == Value::Boolean(true)));
    assert_ne!(seen[0][0], seen[1][0]);

    drop(bridge);
    assert_eq!(acquired(), 2);
    assert_eq!(released(), 2);
}
