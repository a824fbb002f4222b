//! Signal handles

use loopbind_sdk::{AbiResult, Value};
use loopbind_uv::{HandleId, HandleType, Loop, SignalCb, UvResult};

use crate::args::Args;
use crate::bridge::Bridge;
use crate::constants;
use crate::handle::{self, check_open, CB_EVENT};
use crate::result;

fn signal_cb(lp: &Loop, id: HandleId, signum: i32) {
    handle::dispatch(lp, id, CB_EVENT, |_| {
        let name = constants::signal_int2str(signum)
            .map(Value::from)
            .unwrap_or(Value::Integer(signum as i64));
        vec![name]
    });
}

/// Signal argument: a number or a name such as `"sigint"`.
fn check_signal(args: &Args<'_>, index: usize) -> AbiResult<i32> {
    match args.get(index) {
        Value::String(_) => {
            let name = args.string(index)?;
            constants::signal_str2int(&name).ok_or_else(|| args.error(index, "invalid signal"))
        }
        _ => args.integer_as(index, "signal"),
    }
}

/// `new_signal()`
pub fn new_signal(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    let id = bridge.native().signal_init();
    let (_, value) = handle::create_handle(bridge, id)?;
    Ok(vec![value])
}

type NativeStart = fn(&Loop, HandleId, SignalCb, i32) -> UvResult<()>;

fn start_with(bridge: &Bridge, values: &[Value], native: NativeStart) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::Signal))?;
    let signum = check_signal(&args, 2)?;
    if let Some(callback) = args.opt_callable(3)? {
        wrapper.callback_set(args.ctx(), CB_EVENT, callback)?;
    }
    Ok(result::status(native(bridge.native(), wrapper.id(), signal_cb, signum)))
}

/// `signal_start(signal, signum, [callback])`
pub fn start(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    start_with(bridge, values, Loop::signal_start)
}

/// `signal_start_oneshot(signal, signum, [callback])`
pub fn start_oneshot(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    start_with(bridge, values, Loop::signal_start_oneshot)
}

/// `signal_stop(signal)`
pub fn stop(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::Signal))?;
    let status = bridge.native().signal_stop(wrapper.id());
    wrapper.callback_unset(args.ctx(), CB_EVENT);
    Ok(result::status(status))
}
