//! Signal delivery through the process-wide forwarder

use std::cell::RefCell;

use loopbind_uv::{HandleId, Loop, RunMode};

thread_local! {
    static DELIVERED: RefCell<Vec<i32>> = RefCell::new(Vec::new());
}

fn on_signal(lp: &Loop, id: HandleId, signum: i32) {
    DELIVERED.with(|d| d.borrow_mut().push(signum));
    lp.close_handle(id, None).unwrap();
}

#[test]
fn test_raise_reaches_watching_loop() {
    let lp = Loop::with_pool_size(1);
    let sig = lp.signal_init();
    lp.signal_start_oneshot(sig, on_signal, libc::SIGUSR1).unwrap();
    assert_eq!(lp.signal_signum(sig), Ok(libc::SIGUSR1));

    // SAFETY: a handler for SIGUSR1 is installed above.
    unsafe {
        libc::raise(libc::SIGUSR1);
    }
    lp.run(RunMode::Default);

    DELIVERED.with(|d| assert_eq!(*d.borrow(), vec![libc::SIGUSR1]));
    assert_eq!(lp.handle_count(), 0);
}
