//! Loop control, time, walking and error helpers

use loopbind_sdk::{AbiResult, Value};
use loopbind_uv::{hrtime as uv_hrtime, Errno, RunMode};

use crate::args::Args;
use crate::bridge::Bridge;
use crate::handle::wrapper_of;
use crate::result;

/// `run([mode])` with mode `"default"`, `"once"` or `"nowait"`. Returns
/// whether the loop is still alive. A nested call fails with a message.
pub fn run(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let mode = match args.opt_string(1)? {
        None => RunMode::Default,
        Some(name) => RunMode::from_name(&name).ok_or_else(|| args.error(1, format!("invalid option '{}'", name)))?,
    };
    if bridge.mode().is_some() {
        return Ok(vec![Value::Nil, Value::from("loop already running")]);
    }
    tracing::trace!(mode = mode.name(), "run");
    bridge.set_mode(Some(mode));
    let alive = bridge.native().run(mode);
    bridge.set_mode(None);
    Ok(vec![Value::Boolean(alive)])
}

/// `stop()`
pub fn stop(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    bridge.native().stop();
    Ok(Vec::new())
}

/// `loop_alive()`
pub fn alive(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(vec![Value::Boolean(bridge.native().alive())])
}

/// `loop_mode()` names the mode of the run in progress, or nil.
pub fn mode(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(vec![bridge.mode().map(|m| Value::from(m.name())).unwrap_or(Value::Nil)])
}

/// `loop_close()` fails with `EBUSY` while handles or requests remain.
pub fn close(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(result::status(bridge.native().close()))
}

/// `now()` in milliseconds.
pub fn now(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(vec![Value::Integer(bridge.native().now() as i64)])
}

/// `hrtime()` in nanoseconds.
pub fn hrtime(_bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(vec![Value::Integer(uv_hrtime() as i64)])
}

/// `update_time()`
pub fn update_time(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    bridge.native().update_time();
    Ok(Vec::new())
}

/// `backend_timeout()`; -1 means no timeout.
pub fn backend_timeout(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(vec![Value::Integer(bridge.native().backend_timeout())])
}

/// `walk(callback)` calls back with every handle that still has a
/// scripting object.
pub fn walk(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let callback = args.callable(1)?;
    let lp = bridge.native();
    let mut ids = Vec::new();
    lp.walk(|id, _| ids.push(id));
    // collected first; the callback may close handles
    for id in ids {
        let Some(value) = wrapper_of(lp, id).and_then(|w| w.script_value(args.ctx())) else {
            continue;
        };
        args.ctx().call(callback, vec![value])?;
    }
    Ok(Vec::new())
}

/// `metrics_idle_time()` in nanoseconds.
pub fn metrics_idle_time(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(vec![Value::Integer(bridge.native().idle_time().as_nanos() as i64)])
}

/// `metrics_info()`
pub fn metrics_info(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    let metrics = bridge.native().metrics();
    Ok(vec![Value::Table(vec![
        ("loop_count".to_string(), Value::Integer(metrics.loop_count as i64)),
        ("events".to_string(), Value::Integer(metrics.events as i64)),
        ("events_waiting".to_string(), Value::Integer(metrics.events_waiting as i64)),
    ])])
}

fn check_errno(args: &Args<'_>, index: usize) -> AbiResult<Errno> {
    Ok(Errno::from_raw(args.integer_as(index, "error code")?))
}

/// `err_name(code)`
pub fn err_name(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    Ok(vec![Value::from(check_errno(&args, 1)?.name().into_owned())])
}

/// `strerror(code)`
pub fn strerror(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    Ok(vec![Value::from(check_errno(&args, 1)?.message().into_owned())])
}

/// `translate_sys_error(errno)` returns the status code and its name.
pub fn translate_sys_error(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let err = Errno::translate_sys_error(args.integer_as(1, "errno")?);
    Ok(vec![Value::Integer(err.code() as i64), Value::from(err.name().into_owned())])
}

/// `available_parallelism()`
pub fn available_parallelism(_bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(vec![Value::Integer(num_cpus::get() as i64)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use loopbind_testkit::MockRuntime;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_invalid_mode_raises() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let err = bridge.call("run", &[Value::from("sometimes")]).unwrap_err();
        assert_eq!(err.to_string(), "bad argument #1 (invalid option 'sometimes')");
    }

    #[test]
    fn test_nested_run_and_mode() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let weak = Rc::downgrade(&bridge);
        let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
        let cb = {
            let seen = seen.clone();
            let timer = timer.clone();
            rt.function(move |_, _| {
                let bridge = weak.upgrade().unwrap();
                seen.borrow_mut().push(bridge.call("loop_mode", &[])?);
                seen.borrow_mut().push(bridge.call("run", &[])?);
                bridge.call("close", &[timer.clone()])?;
                Ok(vec![])
            })
        };
        bridge
            .call("timer_start", &[timer, Value::Integer(0), Value::Integer(0), cb])
            .unwrap();
        assert_eq!(bridge.call("run", &[Value::from("default")]).unwrap(), vec![Value::Boolean(false)]);
        assert_eq!(
            *seen.borrow(),
            vec![
                vec![Value::from("default")],
                vec![Value::Nil, Value::from("loop already running")]
            ]
        );
        assert_eq!(bridge.call("loop_mode", &[]).unwrap(), vec![Value::Nil]);
    }

    #[test]
    fn test_walk_and_close_busy() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
        let idle = bridge.call("new_idle", &[]).unwrap().remove(0);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let cb = {
            let seen = seen.clone();
            rt.function(move |_, args| {
                seen.borrow_mut().extend(args);
                Ok(vec![])
            })
        };
        bridge.call("walk", &[cb]).unwrap();
        assert_eq!(seen.borrow().len(), 2);
        assert!(seen.borrow().contains(&timer));
        assert!(seen.borrow().contains(&idle));

        assert_eq!(bridge.call("loop_close", &[]).unwrap()[2], Value::from("EBUSY"));
    }

    #[test]
    fn test_error_helpers() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let code = Value::Integer(Errno::ENOENT.code() as i64);
        assert_eq!(bridge.call("err_name", &[code.clone()]).unwrap(), vec![Value::from("ENOENT")]);
        assert_eq!(
            bridge.call("strerror", &[code]).unwrap(),
            vec![Value::from("no such file or directory")]
        );
        assert_eq!(
            bridge.call("translate_sys_error", &[Value::Integer(libc::EACCES as i64)]).unwrap(),
            vec![Value::Integer(Errno::EACCES.code() as i64), Value::from("EACCES")]
        );
        let n = bridge.call("available_parallelism", &[]).unwrap()[0].as_integer().unwrap();
        assert!(n >= 1);
    }
}
