//! Stat-polling handles

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use loopbind_sdk::{AbiResult, Value};
use loopbind_uv::{HandleId, HandleType, Loop, Stat, UvResult};

use crate::args::Args;
use crate::bridge::Bridge;
use crate::fs::stat_table;
use crate::handle::{self, check_open, CB_EVENT};
use crate::result;

fn fs_poll_cb(lp: &Loop, id: HandleId, status: UvResult<()>, prev: &Stat, curr: &Stat) {
    handle::dispatch(lp, id, CB_EVENT, |_| {
        vec![result::event_status(status), stat_table(prev), stat_table(curr)]
    });
}

/// `new_fs_poll()`
pub fn new_fs_poll(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    let id = bridge.native().fs_poll_init();
    let (_, value) = handle::create_handle(bridge, id)?;
    Ok(vec![value])
}

/// `fs_poll_start(handle, path, interval, callback)`
pub fn start(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::FsPoll))?;
    let path = PathBuf::from(OsString::from_vec(args.bytes(2)?));
    let interval = args.integer(3)?;
    if interval < 0 {
        return Err(args.error(3, "interval must be non-negative"));
    }
    let callback = args.callable(4)?;
    wrapper.callback_set(args.ctx(), CB_EVENT, callback)?;
    Ok(result::status(bridge.native().fs_poll_start(
        wrapper.id(),
        fs_poll_cb,
        path,
        interval as u64,
    )))
}

/// `fs_poll_stop(handle)`
pub fn stop(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::FsPoll))?;
    let status = bridge.native().fs_poll_stop(wrapper.id());
    wrapper.callback_unset(args.ctx(), CB_EVENT);
    Ok(result::status(status))
}

/// `fs_poll_getpath(handle)`
pub fn getpath(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::FsPoll))?;
    Ok(match bridge.native().fs_poll_getpath(wrapper.id()) {
        Ok(path) => vec![Value::String(path.into_os_string().into_vec())],
        Err(err) => result::fail(err),
    })
}
