//! Timer handles

use loopbind_sdk::{AbiResult, Value};
use loopbind_uv::{HandleId, HandleType, Loop};

use crate::args::Args;
use crate::bridge::Bridge;
use crate::handle::{self, check_open, CB_EVENT};
use crate::result;

fn timer_cb(lp: &Loop, id: HandleId) {
    handle::dispatch(lp, id, CB_EVENT, |_| Vec::new());
}

/// `new_timer()`
pub fn new_timer(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    let id = bridge.native().timer_init();
    let (_, value) = handle::create_handle(bridge, id)?;
    Ok(vec![value])
}

/// `timer_start(timer, timeout, repeat, callback)`
pub fn start(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::Timer))?;
    let timeout = args.integer(2)?;
    if timeout < 0 {
        return Err(args.error(2, "timeout must be non-negative"));
    }
    let repeat = args.integer(3)?;
    if repeat < 0 {
        return Err(args.error(3, "repeat must be non-negative"));
    }
    let callback = args.callable(4)?;
    wrapper.callback_set(args.ctx(), CB_EVENT, callback)?;
    Ok(result::status(bridge.native().timer_start(
        wrapper.id(),
        timer_cb,
        timeout as u64,
        repeat as u64,
    )))
}

/// `timer_stop(timer)`
pub fn stop(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::Timer))?;
    let status = bridge.native().timer_stop(wrapper.id());
    wrapper.callback_unset(args.ctx(), CB_EVENT);
    Ok(result::status(status))
}

/// `timer_again(timer)`
pub fn again(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::Timer))?;
    Ok(result::status(bridge.native().timer_again(wrapper.id())))
}

/// `timer_set_repeat(timer, repeat)`
pub fn set_repeat(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::Timer))?;
    let repeat = args.integer(2)?;
    if repeat < 0 {
        return Err(args.error(2, "repeat must be non-negative"));
    }
    match bridge.native().timer_set_repeat(wrapper.id(), repeat as u64) {
        Ok(()) => Ok(Vec::new()),
        Err(err) => Ok(result::fail(err)),
    }
}

/// `timer_get_repeat(timer)`
pub fn get_repeat(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::Timer))?;
    Ok(result::count(bridge.native().timer_get_repeat(wrapper.id())))
}

/// `timer_get_due_in(timer)`
pub fn get_due_in(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::Timer))?;
    Ok(result::count(bridge.native().timer_get_due_in(wrapper.id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use loopbind_testkit::MockRuntime;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_negative_timeouts_raise() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
        let cb = rt.function(|_, _| Ok(vec![]));
        let err = bridge
            .call("timer_start", &[timer.clone(), Value::Integer(-1), Value::Integer(0), cb.clone()])
            .unwrap_err();
        assert_eq!(err.to_string(), "bad argument #2 (timeout must be non-negative)");
        let err = bridge
            .call("timer_start", &[timer, Value::Integer(0), Value::Integer(-5), cb])
            .unwrap_err();
        assert_eq!(err.to_string(), "bad argument #3 (repeat must be non-negative)");
    }

    #[test]
    fn test_repeat_until_stopped_from_callback() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
        let fired = Rc::new(Cell::new(0));
        let weak = Rc::downgrade(&bridge);
        let cb = {
            let fired = fired.clone();
            let timer = timer.clone();
            rt.function(move |_, args| {
                assert!(args.is_empty());
                fired.set(fired.get() + 1);
                if fired.get() == 3 {
                    let bridge = weak.upgrade().unwrap();
                    bridge.call("timer_stop", &[timer.clone()])?;
                    bridge.call("close", &[timer.clone()])?;
                }
                Ok(vec![])
            })
        };
        let started = bridge
            .call("timer_start", &[timer.clone(), Value::Integer(1), Value::Integer(1), cb])
            .unwrap();
        assert_eq!(started, vec![Value::Boolean(true)]);
        assert_eq!(bridge.call("timer_get_repeat", &[timer]).unwrap(), vec![Value::Integer(1)]);

        bridge.call("run", &[]).unwrap();
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn test_again_without_start_fails() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
        let out = bridge.call("timer_again", &[timer]).unwrap();
        assert_eq!(out[0], Value::Nil);
        assert_eq!(out[2], Value::from("EINVAL"));
    }
}
