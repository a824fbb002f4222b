//! Change-notification handles
//!
//! The callback receives `err, filename, {change = bool, rename = bool}`.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use loopbind_sdk::{AbiResult, Value};
use loopbind_uv::fs_event::{CHANGE, FS_EVENT_RECURSIVE, FS_EVENT_STAT, FS_EVENT_WATCH_ENTRY, RENAME};
use loopbind_uv::{HandleId, HandleType, Loop, UvResult};

use crate::args::Args;
use crate::bridge::Bridge;
use crate::handle::{self, check_open, CB_EVENT};
use crate::result;

fn fs_event_cb(lp: &Loop, id: HandleId, status: UvResult<()>, name: Option<&Path>, events: u32) {
    handle::dispatch(lp, id, CB_EVENT, |_| {
        let name = name
            .map(|n| Value::String(n.as_os_str().to_os_string().into_vec()))
            .unwrap_or(Value::Nil);
        let events = Value::Table(vec![
            ("rename".to_string(), Value::Boolean(events & RENAME != 0)),
            ("change".to_string(), Value::Boolean(events & CHANGE != 0)),
        ]);
        vec![result::event_status(status), name, events]
    });
}

fn check_flags(args: &Args<'_>, index: usize) -> AbiResult<u32> {
    let Some(table) = args.opt_table(index)? else {
        return Ok(0);
    };
    let set = |key: &str| table.get(key).is_some_and(Value::truthy);
    Ok([
        ("watch_entry", FS_EVENT_WATCH_ENTRY),
        ("stat", FS_EVENT_STAT),
        ("recursive", FS_EVENT_RECURSIVE),
    ]
    .iter()
    .filter(|(key, _)| set(key))
    .fold(0, |acc, &(_, bit)| acc | bit))
}

/// `new_fs_event()`
pub fn new_fs_event(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    let id = bridge.native().fs_event_init();
    let (_, value) = handle::create_handle(bridge, id)?;
    Ok(vec![value])
}

/// `fs_event_start(handle, path, [flags], callback)`
pub fn start(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::FsEvent))?;
    let path = PathBuf::from(OsString::from_vec(args.bytes(2)?));
    let flags = check_flags(&args, 3)?;
    let callback = args.callable(4)?;
    wrapper.callback_set(args.ctx(), CB_EVENT, callback)?;
    Ok(result::status(bridge.native().fs_event_start(wrapper.id(), fs_event_cb, path, flags)))
}

/// `fs_event_stop(handle)`
pub fn stop(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::FsEvent))?;
    let status = bridge.native().fs_event_stop(wrapper.id());
    wrapper.callback_unset(args.ctx(), CB_EVENT);
    Ok(result::status(status))
}

/// `fs_event_getpath(handle)`
pub fn getpath(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::FsEvent))?;
    Ok(match bridge.native().fs_event_getpath(wrapper.id()) {
        Ok(path) => vec![Value::String(path.into_os_string().into_vec())],
        Err(err) => result::fail(err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use loopbind_testkit::MockRuntime;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_created_file_reaches_callback() {
        let dir = tempfile::tempdir().unwrap();
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let watcher = bridge.call("new_fs_event", &[]).unwrap().remove(0);
        assert_eq!(rt.type_name(&watcher), "uv_fs_event");

        let seen = Rc::new(RefCell::new(Vec::new()));
        let weak = Rc::downgrade(&bridge);
        let cb = {
            let seen = seen.clone();
            let watcher = watcher.clone();
            rt.function(move |_, args| {
                seen.borrow_mut().push(args);
                let bridge = weak.upgrade().unwrap();
                if bridge.call("is_closing", &[watcher.clone()])? == vec![Value::Boolean(false)] {
                    bridge.call("close", &[watcher.clone()])?;
                }
                Ok(vec![])
            })
        };
        let dir_value = Value::from(dir.path().to_str().unwrap());
        let started = bridge
            .call("fs_event_start", &[watcher.clone(), dir_value.clone(), Value::Nil, cb])
            .unwrap();
        assert_eq!(started, vec![Value::Boolean(true)]);
        assert_eq!(bridge.call("fs_event_getpath", &[watcher]).unwrap(), vec![dir_value]);

        std::fs::write(dir.path().join("fresh.txt"), b"hello").unwrap();
        bridge.call("run", &[]).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0], Value::Nil);
        assert_eq!(seen[0][1], Value::from("fresh.txt"));
        let events = &seen[0][2];
        assert!(events.get("rename").is_some_and(Value::truthy) || events.get("change").is_some_and(Value::truthy));
        assert_eq!(rt.live_refs(), 0);
    }

    #[test]
    fn test_start_on_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let watcher = bridge.call("new_fs_event", &[]).unwrap().remove(0);
        let cb = rt.function(|_, _| Ok(vec![]));
        let missing = Value::from(dir.path().join("absent").to_str().unwrap());
        let out = bridge
            .call("fs_event_start", &[watcher.clone(), missing, Value::Nil, cb])
            .unwrap();
        assert_eq!(out[0], Value::Nil);
        assert_eq!(out[2], Value::from("ENOENT"));
        assert_eq!(bridge.call("fs_event_getpath", &[watcher.clone()]).unwrap()[2], Value::from("EINVAL"));
        assert_eq!(bridge.call("fs_event_stop", &[watcher]).unwrap(), vec![Value::Boolean(true)]);
    }

    #[test]
    fn test_flag_table() {
        let rt = MockRuntime::new();
        let values = [Value::Table(vec![
            ("recursive".to_string(), Value::Boolean(true)),
            ("stat".to_string(), Value::Boolean(false)),
        ])];
        let args = Args::new(&*rt, &values);
        assert_eq!(check_flags(&args, 1).unwrap(), FS_EVENT_RECURSIVE);
        assert_eq!(check_flags(&args, 2).unwrap(), 0);
        let bad = [Value::Integer(1)];
        assert!(check_flags(&Args::new(&*rt, &bad), 1).is_err());
    }
}
