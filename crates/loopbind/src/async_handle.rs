//! Async handles
//!
//! The scripting object can be passed to worker threads, where it arrives
//! as a [`ThreadPort`]. Sending through it stores the arguments and wakes
//! the loop; the callback receives the most recent arguments (sends that
//! arrive before the loop gets around to it coalesce).

use std::any::Any;
use std::rc::Rc;
use std::sync::Arc;

use loopbind_sdk::{userdata_of, AbiResult, NativeError, ScriptContext, ThreadPort, ThreadValue, Value};
use loopbind_uv::{AsyncSender, HandleId, HandleType, Loop, UvResult};
use parking_lot::Mutex;

use crate::args::{Args, MAX_THREAD_ARGS};
use crate::bridge::Bridge;
use crate::handle::{self, check_open, wrapper_of, HandleUserdata, CB_EVENT};
use crate::result;

/// Cross-thread face of an async handle.
pub struct AsyncPort {
    sender: AsyncSender,
    pending: Mutex<Option<Vec<ThreadValue>>>,
}

impl AsyncPort {
    fn post(&self, args: Vec<ThreadValue>) -> UvResult<()> {
        *self.pending.lock() = Some(args);
        self.sender.send()
    }

    fn take(&self) -> Vec<ThreadValue> {
        self.pending.lock().take().unwrap_or_default()
    }

    pub fn handle(&self) -> HandleId {
        self.sender.handle()
    }
}

impl ThreadPort for AsyncPort {
    fn type_name(&self) -> &str {
        "uv_async"
    }

    fn send(&self, args: Vec<ThreadValue>) -> AbiResult<()> {
        if args.len() > MAX_THREAD_ARGS {
            return Err(NativeError::Runtime(format!(
                "too many thread arguments, max {}",
                MAX_THREAD_ARGS
            )));
        }
        self.post(args)
            .map_err(|err| NativeError::AbiError(result::error_message(err)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn port_for(lp: &Loop, id: HandleId) -> Option<Arc<AsyncPort>> {
    let port = wrapper_of(lp, id)?.extra::<Arc<AsyncPort>>()?;
    Some(Arc::clone(&port))
}

/// Thread port behind an async handle value.
pub(crate) fn port_of(ctx: &dyn ScriptContext, value: &Value) -> Option<Arc<dyn ThreadPort>> {
    let ud = userdata_of::<HandleUserdata>(ctx, value)?;
    if ud.wrapper.kind() != HandleType::Async {
        return None;
    }
    let port = ud.wrapper.extra::<Arc<AsyncPort>>()?;
    let port: Arc<AsyncPort> = Arc::clone(&port);
    let port: Arc<dyn ThreadPort> = port;
    Some(port)
}

/// Bring values back from another thread. Ports of this loop's async
/// handles become their scripting objects again; anything else is nil.
pub(crate) fn from_thread_values(lp: &Loop, ctx: &dyn ScriptContext, values: Vec<ThreadValue>) -> Vec<Value> {
    values
        .into_iter()
        .map(|value| match value {
            ThreadValue::Port(port) => port
                .as_any()
                .downcast_ref::<AsyncPort>()
                .and_then(|theirs| {
                    let ours = port_for(lp, theirs.handle())?;
                    if !std::ptr::eq(Arc::as_ptr(&ours), theirs) {
                        return None;
                    }
                    wrapper_of(lp, theirs.handle())?.script_value(ctx)
                })
                .unwrap_or(Value::Nil),
            other => other.into_value().unwrap_or(Value::Nil),
        })
        .collect()
}

fn async_cb(lp: &Loop, id: HandleId) {
    let Some(port) = port_for(lp, id) else {
        return;
    };
    let values = port.take();
    handle::dispatch(lp, id, CB_EVENT, |ctx| from_thread_values(lp, ctx, values));
}

/// `new_async(callback)`
pub fn new_async(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let callback = args.callable(1)?;
    let lp = bridge.native();
    let id = lp.async_init(async_cb);
    let sender = match lp.async_sender(id) {
        Ok(sender) => sender,
        Err(err) => {
            let _ = lp.close_handle(id, None);
            return Ok(result::fail(err));
        }
    };
    let (wrapper, value) = handle::create_handle(bridge, id)?;
    let port = Arc::new(AsyncPort {
        sender,
        pending: Mutex::new(None),
    });
    wrapper.set_extra(Rc::new(port));
    wrapper.callback_set(args.ctx(), CB_EVENT, callback)?;
    Ok(vec![value])
}

/// `async_send(async, ...)`
pub fn send(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, Some(HandleType::Async))?;
    let payload = args.thread_values(2)?;
    let Some(port) = wrapper.extra::<Arc<AsyncPort>>() else {
        return Ok(result::fail(loopbind_uv::Errno::EINVAL));
    };
    Ok(result::status(port.post(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use loopbind_testkit::MockRuntime;
    use std::cell::RefCell;

    #[test]
    fn test_send_from_another_thread() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let weak = Rc::downgrade(&bridge);
        let cb = {
            let seen = seen.clone();
            rt.function(move |_, args| {
                seen.borrow_mut().push(args);
                Ok(vec![])
            })
        };
        let handle = bridge.call("new_async", &[cb]).unwrap().remove(0);
        let port = port_of(&*rt, &handle).unwrap();
        assert_eq!(port.type_name(), "uv_async");

        let worker = std::thread::spawn(move || {
            port.send(vec![ThreadValue::Integer(42), ThreadValue::String(b"hi".to_vec())])
        });
        worker.join().unwrap().unwrap();

        bridge.call("run", &[Value::from("once")]).unwrap();
        assert_eq!(*seen.borrow(), vec![vec![Value::Integer(42), Value::from("hi")]]);
        weak.upgrade().unwrap().call("close", &[handle]).unwrap();
        bridge.call("run", &[]).unwrap();
    }

    #[test]
    fn test_ports_come_back_as_their_handle() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let cb = rt.function(|_, _| Ok(vec![]));
        let handle = bridge.call("new_async", &[cb]).unwrap().remove(0);
        let port = port_of(&*rt, &handle).unwrap();
        let back = from_thread_values(bridge.native(), &*rt, vec![ThreadValue::Port(port), ThreadValue::Nil]);
        assert_eq!(back, vec![handle, Value::Nil]);
    }

    #[test]
    fn test_send_after_close_fails() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let cb = rt.function(|_, _| Ok(vec![]));
        let handle = bridge.call("new_async", &[cb]).unwrap().remove(0);
        let port = port_of(&*rt, &handle).unwrap();
        bridge.call("close", &[handle]).unwrap();
        assert!(port.send(vec![]).is_err());
    }
}
