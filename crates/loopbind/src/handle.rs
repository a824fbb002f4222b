//! Handle wrappers
//!
//! Every handle the scripting side sees is a [`HandleWrapper`] owned twice:
//! by the native handle's user-data slot and by a userdata object in the
//! runtime. The wrapper pins its own userdata through a strong reference
//! while the native handle is open, so the collector cannot finalize it out
//! from under a pending callback. Closing walks the wrapper through
//! `Active -> Closing -> Released`; only the loop's close callback moves it
//! to `Released`, after which the native handle no longer exists.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use loopbind_sdk::{userdata_of, AbiResult, NativeError, ScriptContext, StrongRef, Userdata, Value};
use loopbind_uv::{HandleId, HandleType, Loop};

use crate::args::Args;
use crate::bridge::{shared_of, Bridge};

/// Slot invoked once the handle has finished closing.
pub(crate) const CB_CLOSE: usize = 0;
/// Slot invoked for the handle's events (timer expiry, signal, ...).
pub(crate) const CB_EVENT: usize = 1;
const CB_SLOTS: usize = 2;

/// Where a wrapper is in its shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Closing,
    Released,
}

/// Userdata type name for a handle type (`"uv_timer"`, ...).
pub fn userdata_type(kind: HandleType) -> &'static str {
    match kind {
        HandleType::Async => "uv_async",
        HandleType::Check => "uv_check",
        HandleType::FsEvent => "uv_fs_event",
        HandleType::FsPoll => "uv_fs_poll",
        HandleType::Idle => "uv_idle",
        HandleType::Prepare => "uv_prepare",
        HandleType::Signal => "uv_signal",
        HandleType::Timer => "uv_timer",
    }
}

// ============================================================================
// Wrapper
// ============================================================================

pub struct HandleWrapper {
    id: HandleId,
    kind: HandleType,
    state: Cell<Lifecycle>,
    script_ref: RefCell<Option<StrongRef>>,
    callbacks: RefCell<[Option<StrongRef>; CB_SLOTS]>,
    extra: RefCell<Option<Rc<dyn Any>>>,
}

impl HandleWrapper {
    fn new(id: HandleId, kind: HandleType) -> Self {
        Self {
            id,
            kind,
            state: Cell::new(Lifecycle::Active),
            script_ref: RefCell::new(None),
            callbacks: RefCell::new([None, None]),
            extra: RefCell::new(None),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn kind(&self) -> HandleType {
        self.kind
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.get()
    }

    /// The scripting object, while the wrapper still pins it.
    pub fn script_value(&self, ctx: &dyn ScriptContext) -> Option<Value> {
        self.script_ref.borrow().as_ref().map(|r| ctx.resolve(r))
    }

    pub(crate) fn ensure_open(&self) -> AbiResult<()> {
        match self.state.get() {
            Lifecycle::Released => Err(NativeError::Lifecycle(format!(
                "handle {} has been closed",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    /// Store `callback` in `slot`, releasing whatever was there.
    pub(crate) fn callback_set(&self, ctx: &dyn ScriptContext, slot: usize, callback: &Value) -> AbiResult<()> {
        if !ctx.is_callable(callback) {
            return Err(NativeError::TypeMismatch {
                expected: "callable".to_string(),
                got: ctx.type_name(callback),
            });
        }
        let strong = ctx.reference(callback);
        let previous = self.callbacks.borrow_mut()[slot].replace(strong);
        if let Some(previous) = previous {
            ctx.release(previous);
        }
        Ok(())
    }

    /// Clear `slot`. Clearing an empty slot does nothing.
    pub(crate) fn callback_unset(&self, ctx: &dyn ScriptContext, slot: usize) {
        let previous = self.callbacks.borrow_mut()[slot].take();
        if let Some(previous) = previous {
            ctx.release(previous);
        }
    }

    /// Invoke the callback in `slot` with `args`. An empty slot drops the
    /// arguments. Script errors go to the embedding's error channel.
    pub(crate) fn send(&self, ctx: &dyn ScriptContext, slot: usize, args: Vec<Value>) {
        let callable = match &self.callbacks.borrow()[slot] {
            Some(strong) => ctx.resolve(strong),
            None => return,
        };
        tracing::trace!(handle = %self.id, kind = self.kind.name(), slot, "dispatching callback");
        if let Err(err) = ctx.call(&callable, args) {
            tracing::warn!(handle = %self.id, kind = self.kind.name(), %err, "handle callback failed");
            ctx.report_error(&err.to_string());
        }
    }

    /// Drop every strong reference and mark the wrapper released.
    pub(crate) fn release(&self, ctx: &dyn ScriptContext) {
        let callbacks: Vec<StrongRef> = self.callbacks.borrow_mut().iter_mut().filter_map(Option::take).collect();
        for strong in callbacks {
            ctx.release(strong);
        }
        let own = self.script_ref.borrow_mut().take();
        if let Some(own) = own {
            ctx.release(own);
        }
        self.extra.borrow_mut().take();
        self.state.set(Lifecycle::Released);
    }

    pub(crate) fn set_extra(&self, extra: Rc<dyn Any>) {
        *self.extra.borrow_mut() = Some(extra);
    }

    pub(crate) fn extra<T: 'static>(&self) -> Option<Rc<T>> {
        self.extra.borrow().clone()?.downcast::<T>().ok()
    }
}

// ============================================================================
// Userdata
// ============================================================================

pub(crate) struct HandleUserdata {
    pub(crate) wrapper: Rc<HandleWrapper>,
    bridge: Weak<Bridge>,
}

impl Userdata for HandleUserdata {
    fn type_name(&self) -> &'static str {
        userdata_type(self.wrapper.kind)
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn finalize(&self, ctx: &dyn ScriptContext) {
        let wrapper = &self.wrapper;
        match wrapper.lifecycle() {
            Lifecycle::Active => {
                tracing::debug!(handle = %wrapper.id, kind = wrapper.kind.name(), "collecting open handle");
                wrapper.release(ctx);
                if let Some(bridge) = self.bridge.upgrade() {
                    let lp = bridge.native();
                    if !lp.is_closing(wrapper.id) {
                        if let Err(err) = lp.close_handle(wrapper.id, None) {
                            tracing::warn!(handle = %wrapper.id, %err, "close on collection failed");
                        }
                    }
                }
            }
            Lifecycle::Closing => wrapper.release(ctx),
            Lifecycle::Released => {}
        }
    }
}

/// Wrap a freshly initialised native handle. On failure the native handle
/// is closed again.
pub(crate) fn create_handle(bridge: &Bridge, id: HandleId) -> AbiResult<(Rc<HandleWrapper>, Value)> {
    let lp = bridge.native();
    let kind = lp
        .handle_type(id)
        .ok_or_else(|| NativeError::AbiError(format!("handle {} does not exist", id)))?;
    let wrapper = Rc::new(HandleWrapper::new(id, kind));
    let userdata = Rc::new(HandleUserdata {
        wrapper: wrapper.clone(),
        bridge: bridge.weak(),
    });

    let ctx = bridge.ctx();
    let value = match ctx.new_userdata(userdata) {
        Ok(value) => value,
        Err(err) => {
            let _ = lp.close_handle(id, None);
            return Err(err);
        }
    };
    *wrapper.script_ref.borrow_mut() = Some(ctx.reference(&value));
    let data: Rc<dyn Any> = wrapper.clone();
    if let Err(err) = lp.set_handle_data(id, Some(data)) {
        wrapper.release(ctx);
        return Err(NativeError::AbiError(format!("handle {}: {}", id, err)));
    }
    tracing::debug!(handle = %id, kind = kind.name(), "handle created");
    Ok((wrapper, value))
}

/// Wrapper stored in a native handle's user-data slot.
pub(crate) fn wrapper_of(lp: &Loop, id: HandleId) -> Option<Rc<HandleWrapper>> {
    lp.handle_data(id)?.downcast::<HandleWrapper>().ok()
}

/// Deliver an event from a loop callback to the handle's `slot`.
pub(crate) fn dispatch(lp: &Loop, id: HandleId, slot: usize, build: impl FnOnce(&dyn ScriptContext) -> Vec<Value>) {
    let (Some(shared), Some(wrapper)) = (shared_of(lp), wrapper_of(lp, id)) else {
        tracing::warn!(handle = %id, "event for a handle without a wrapper");
        return;
    };
    if wrapper.lifecycle() == Lifecycle::Released {
        return;
    }
    let ctx = shared.ctx();
    let args = build(ctx);
    wrapper.send(ctx, slot, args);
}

fn close_cb(lp: &Loop, id: HandleId) {
    let (Some(shared), Some(wrapper)) = (shared_of(lp), wrapper_of(lp, id)) else {
        return;
    };
    if wrapper.lifecycle() == Lifecycle::Released {
        return;
    }
    let ctx = shared.ctx();
    wrapper.send(ctx, CB_CLOSE, Vec::new());
    wrapper.release(ctx);
    tracing::debug!(handle = %id, kind = wrapper.kind.name(), "handle released");
}

// ============================================================================
// Argument checks
// ============================================================================

/// Handle argument of type `kind` (any handle type for `None`).
pub(crate) fn check_handle(args: &Args<'_>, index: usize, kind: Option<HandleType>) -> AbiResult<Rc<HandleWrapper>> {
    match userdata_of::<HandleUserdata>(args.ctx(), args.get(index)) {
        Some(ud) if kind.map_or(true, |k| k == ud.wrapper.kind) => Ok(ud.wrapper.clone()),
        _ => Err(args.expected(index, kind.map_or("uv_handle", userdata_type))),
    }
}

/// Like [`check_handle`], but a handle that finished closing is a
/// lifecycle error.
pub(crate) fn check_open(args: &Args<'_>, index: usize, kind: Option<HandleType>) -> AbiResult<Rc<HandleWrapper>> {
    let wrapper = check_handle(args, index, kind)?;
    wrapper.ensure_open()?;
    Ok(wrapper)
}

// ============================================================================
// Lifecycle operations
// ============================================================================

/// `close(handle[, callback])`
pub fn close(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_handle(&args, 1, None)?;
    if wrapper.lifecycle() != Lifecycle::Active {
        return Err(NativeError::Lifecycle(format!(
            "handle {} is already closing",
            wrapper.id
        )));
    }
    if let Some(callback) = args.opt_callable(2)? {
        wrapper.callback_set(args.ctx(), CB_CLOSE, callback)?;
    }
    bridge
        .native()
        .close_handle(wrapper.id, Some(close_cb))
        .map_err(|err| NativeError::Lifecycle(format!("handle {}: {}", wrapper.id, err)))?;
    wrapper.state.set(Lifecycle::Closing);
    Ok(Vec::new())
}

/// `is_active(handle)`
pub fn is_active(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, None)?;
    Ok(vec![Value::Boolean(bridge.native().is_active(wrapper.id))])
}

/// `is_closing(handle)`
pub fn is_closing(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, None)?;
    Ok(vec![Value::Boolean(bridge.native().is_closing(wrapper.id))])
}

/// `ref(handle)`
pub fn ref_handle(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, None)?;
    bridge.native().ref_handle(wrapper.id);
    Ok(Vec::new())
}

/// `unref(handle)`
pub fn unref_handle(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, None)?;
    bridge.native().unref_handle(wrapper.id);
    Ok(Vec::new())
}

/// `has_ref(handle)`
pub fn has_ref(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, None)?;
    Ok(vec![Value::Boolean(bridge.native().has_ref(wrapper.id))])
}

/// `handle_get_type(handle)` returns the type name and its numeric tag.
pub fn get_type(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_open(&args, 1, None)?;
    Ok(vec![
        Value::from(wrapper.kind.name()),
        Value::Integer(wrapper.kind.code() as i64),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use loopbind_testkit::MockRuntime;

    #[test]
    fn test_callback_slots() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
        let wrapper = userdata_of::<HandleUserdata>(&*rt, &timer).unwrap().wrapper.clone();

        let f = rt.function(|_, _| Ok(vec![]));
        let baseline = rt.live_refs();
        wrapper.callback_set(&*rt, CB_EVENT, &f).unwrap();
        assert_eq!(rt.live_refs(), baseline + 1);

        // Replacing releases the previous reference.
        wrapper.callback_set(&*rt, CB_EVENT, &f).unwrap();
        assert_eq!(rt.live_refs(), baseline + 1);

        wrapper.callback_unset(&*rt, CB_EVENT);
        wrapper.callback_unset(&*rt, CB_EVENT);
        assert_eq!(rt.live_refs(), baseline);

        let err = wrapper.callback_set(&*rt, CB_EVENT, &Value::Integer(1)).unwrap_err();
        assert_eq!(err.to_string(), "expected callable, got number");
        bridge.teardown();
    }

    #[test]
    fn test_close_walks_the_lifecycle() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
        let closed = Rc::new(Cell::new(0));
        let on_close = {
            let closed = closed.clone();
            rt.function(move |_, args| {
                assert!(args.is_empty());
                closed.set(closed.get() + 1);
                Ok(vec![])
            })
        };

        assert_eq!(bridge.call("is_closing", &[timer.clone()]).unwrap(), vec![Value::Boolean(false)]);
        bridge.call("close", &[timer.clone(), on_close]).unwrap();
        assert_eq!(bridge.call("is_closing", &[timer.clone()]).unwrap(), vec![Value::Boolean(true)]);
        let again = bridge.call("close", &[timer.clone()]).unwrap_err();
        assert!(again.to_string().ends_with("is already closing"));

        bridge.call("run", &[Value::from("default")]).unwrap();
        assert_eq!(closed.get(), 1);
        for op in ["is_active", "is_closing", "ref", "unref", "has_ref", "handle_get_type", "close"] {
            let err = bridge.call(op, &[timer.clone()]).unwrap_err();
            assert!(matches!(err, NativeError::Lifecycle(_)), "{} gave {:?}", op, err);
        }
        assert!(!bridge.native().alive());
        bridge.teardown();
    }

    #[test]
    fn test_wrong_handle_type() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let idle = bridge.call("new_idle", &[]).unwrap().remove(0);
        let err = bridge.call("timer_stop", &[idle]).unwrap_err();
        assert_eq!(err.to_string(), "bad argument #1 (uv_timer expected, got uv_idle)");
        let err = bridge.call("is_active", &[Value::Integer(3)]).unwrap_err();
        assert_eq!(err.to_string(), "bad argument #1 (uv_handle expected, got number)");
        bridge.teardown();
    }

    #[test]
    fn test_get_type() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let check = bridge.call("new_check", &[]).unwrap().remove(0);
        assert_eq!(
            bridge.call("handle_get_type", &[check]).unwrap(),
            vec![Value::from("check"), Value::Integer(2)]
        );
        bridge.teardown();
    }
}
