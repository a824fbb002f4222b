//! Script threads
//!
//! `new_thread` runs a function on a fresh OS thread inside a runtime of
//! its own, acquired through the installed hooks and released when the
//! entry function returns.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use loopbind_sdk::{userdata_of, AbiResult, NativeError, ThreadValue, Userdata, Value};
use loopbind_uv::{thread as uv_thread, Errno, Thread, ThreadOptions, ThreadRef};

use crate::args::Args;
use crate::bridge::Bridge;
use crate::config::{require_thread_hooks, ThreadHooks};
use crate::result;
use crate::work::entry_chunk;

pub(crate) struct ThreadUserdata {
    id: ThreadRef,
    // None for references obtained through `thread_self` and after detach.
    thread: RefCell<Option<Thread>>,
}

impl Userdata for ThreadUserdata {
    fn type_name(&self) -> &'static str {
        "uv_thread"
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

fn check_thread(args: &Args<'_>, index: usize) -> AbiResult<Rc<ThreadUserdata>> {
    userdata_of::<ThreadUserdata>(args.ctx(), args.get(index)).ok_or_else(|| args.expected(index, "uv_thread"))
}

fn thread_value(args: &Args<'_>, id: ThreadRef, thread: Option<Thread>) -> AbiResult<Value> {
    args.ctx().new_userdata(Rc::new(ThreadUserdata {
        id,
        thread: RefCell::new(thread),
    }))
}

fn check_options(args: &Args<'_>, index: usize) -> AbiResult<ThreadOptions> {
    let table = args.get(index);
    let stack_size = match table.get("stack_size") {
        None | Some(Value::Nil) => None,
        Some(v) => Some(
            v.as_integer()
                .filter(|n| *n >= 0)
                .ok_or_else(|| args.error(index, "stack_size option must be a number if set"))?
                as usize,
        ),
    };
    Ok(ThreadOptions { stack_size })
}

fn thread_main(hooks: ThreadHooks, chunk: Vec<u8>, args: Vec<ThreadValue>) {
    let Some(mut vm) = (hooks.acquire)() else {
        tracing::error!("no runtime available for thread");
        return;
    };
    vm.set_global("_THREAD", ThreadValue::Boolean(true));
    if let Err(err) = vm.execute(&chunk, "=thread", args) {
        tracing::error!(%err, "Uncaught Error in thread");
    }
    (hooks.release)(vm);
}

/// `new_thread([options], entry, ...)`
pub fn new_thread(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let (options, entry) = match args.get(1) {
        Value::Table(_) => (check_options(&args, 1)?, 2),
        _ => (ThreadOptions::default(), 1),
    };
    let chunk = entry_chunk(&args, entry)?;
    let payload = args.thread_values(entry + 1)?;
    let hooks = require_thread_hooks()?;

    match Thread::spawn(options, move || thread_main(hooks, chunk, payload)) {
        Ok(thread) => {
            tracing::debug!(stack_size = ?options.stack_size, "thread spawned");
            Ok(vec![thread_value(&args, thread.thread_ref(), Some(thread))?])
        }
        Err(err) => Ok(result::fail(err)),
    }
}

/// `thread_join(thread)`
pub fn join(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let ud = check_thread(&args, 1)?;
    let mut slot = ud.thread.borrow_mut();
    let Some(thread) = slot.as_mut() else {
        return Ok(result::fail(Errno::EINVAL));
    };
    if thread.is_joined() {
        return Err(NativeError::Lifecycle("thread already joined".to_string()));
    }
    Ok(result::status(thread.join()))
}

/// `thread_detach(thread)`
pub fn detach(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let ud = check_thread(&args, 1)?;
    let taken = ud.thread.borrow_mut().take();
    Ok(match taken {
        Some(mut thread) if !thread.is_joined() => result::status(thread.detach()),
        _ => result::fail(Errno::EINVAL),
    })
}

/// `thread_self()`
pub fn thread_self(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    Ok(vec![thread_value(&args, ThreadRef::current(), None)?])
}

/// `thread_equal(a, b)`
pub fn equal(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let a = check_thread(&args, 1)?;
    let b = check_thread(&args, 2)?;
    Ok(vec![Value::Boolean(a.id.equal(&b.id))])
}

/// `thread_setname(name)` names the calling thread.
pub fn setname(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let name = args.string(1)?;
    Ok(result::status(uv_thread::setname(&name)))
}

/// `thread_getcpu()` returns the current CPU, counted from 1.
pub fn getcpu(_bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(match uv_thread::getcpu() {
        Ok(cpu) => vec![Value::Integer(cpu as i64 + 1)],
        Err(err) => result::fail(err),
    })
}

fn mask_value(mask: Vec<bool>) -> Value {
    Value::List(mask.into_iter().map(Value::Boolean).collect())
}

/// `thread_getaffinity(thread, [mask_size])`
pub fn getaffinity(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let ud = check_thread(&args, 1)?;
    let size = args.opt_integer(2)?;
    Ok(match ud.id.getaffinity() {
        Ok(mut mask) => {
            if let Some(size) = size {
                mask.resize(size.max(0) as usize, false);
            }
            vec![mask_value(mask)]
        }
        Err(err) => result::fail(err),
    })
}

/// `thread_setaffinity(thread, mask, [get_old])`
pub fn setaffinity(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let ud = check_thread(&args, 1)?;
    let Value::List(entries) = args.table(2)? else {
        return Err(args.error(2, "list of booleans expected"));
    };
    let mask: Vec<bool> = entries.iter().map(Value::truthy).collect();
    let get_old = args.boolean(3);
    Ok(match ud.id.setaffinity(&mask) {
        Ok(previous) if get_old => vec![mask_value(previous)],
        Ok(_) => vec![Value::Boolean(true)],
        Err(err) => result::fail(err),
    })
}

/// `cpumask_size()`
pub fn cpumask_size(_bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
    Ok(result::count(uv_thread::cpumask_size().map(|n| n as u64)))
}
