//! Request wrappers
//!
//! A request pins its userdata, its completion callback and any values the
//! native side still borrows (paths, write buffers) until the loop reports
//! completion. Completion runs at most once; afterwards every reference is
//! gone and the request is inert.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use loopbind_sdk::{userdata_of, AbiResult, ScriptContext, StrongRef, Userdata, Value};
use loopbind_uv::{Done, Errno, Loop, ReqId, ReqType, UvResult};

use crate::args::Args;
use crate::bridge::{shared_of, Bridge};
use crate::result;

pub struct RequestWrapper {
    req: Cell<Option<ReqId>>,
    kind: ReqType,
    script_ref: RefCell<Option<StrongRef>>,
    callback: RefCell<Option<StrongRef>>,
    retained: RefCell<Vec<StrongRef>>,
    fulfilled: Cell<bool>,
    extra: RefCell<Option<Rc<dyn Any>>>,
}

impl RequestWrapper {
    pub fn kind(&self) -> ReqType {
        self.kind
    }

    pub fn is_fulfilled(&self) -> bool {
        self.fulfilled.get()
    }

    /// Native request id once submitted.
    pub fn req(&self) -> Option<ReqId> {
        self.req.get()
    }

    pub(crate) fn submitted(&self, req: ReqId) {
        self.req.set(Some(req));
    }

    /// Module-specific state kept until completion.
    pub(crate) fn set_extra(&self, extra: Rc<dyn Any>) {
        *self.extra.borrow_mut() = Some(extra);
    }

    pub(crate) fn extra<T: 'static>(&self) -> Option<Rc<T>> {
        self.extra.borrow().clone()?.downcast::<T>().ok()
    }

    /// Call the completion callback with `args` and drop every reference.
    /// Later calls do nothing.
    pub(crate) fn finish(&self, ctx: &dyn ScriptContext, args: Vec<Value>) {
        if self.fulfilled.replace(true) {
            tracing::warn!(kind = self.kind.name(), "request completed twice");
            return;
        }
        let callable = self.callback.borrow().as_ref().map(|r| ctx.resolve(r));
        if let Some(callable) = callable {
            tracing::trace!(kind = self.kind.name(), "fulfilling request");
            if let Err(err) = ctx.call(&callable, args) {
                tracing::warn!(kind = self.kind.name(), %err, "request callback failed");
                ctx.report_error(&err.to_string());
            }
        }
        self.release_refs(ctx);
    }

    /// Drop every reference without calling back.
    pub(crate) fn discard(&self, ctx: &dyn ScriptContext) {
        self.fulfilled.set(true);
        self.release_refs(ctx);
    }

    fn release_refs(&self, ctx: &dyn ScriptContext) {
        let callback = self.callback.borrow_mut().take();
        let retained: Vec<StrongRef> = self.retained.borrow_mut().drain(..).collect();
        let own = self.script_ref.borrow_mut().take();
        self.extra.borrow_mut().take();
        for strong in callback.into_iter().chain(retained).chain(own) {
            ctx.release(strong);
        }
    }
}

pub(crate) struct RequestUserdata {
    pub(crate) wrapper: Rc<RequestWrapper>,
}

impl Userdata for RequestUserdata {
    fn type_name(&self) -> &'static str {
        match self.wrapper.kind {
            ReqType::Fs => "uv_fs",
            _ => "uv_req",
        }
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn finalize(&self, ctx: &dyn ScriptContext) {
        if !self.wrapper.is_fulfilled() {
            tracing::debug!(kind = self.wrapper.kind.name(), "collecting pending request");
            self.wrapper.discard(ctx);
        }
    }
}

/// Allocate a request wrapper with its userdata, pinning `callback` and
/// every value in `retained`.
pub(crate) fn new_request(
    bridge: &Bridge,
    kind: ReqType,
    callback: Option<&Value>,
    retained: &[&Value],
) -> AbiResult<(Rc<RequestWrapper>, Value)> {
    let ctx = bridge.ctx();
    let wrapper = Rc::new(RequestWrapper {
        req: Cell::new(None),
        kind,
        script_ref: RefCell::new(None),
        callback: RefCell::new(None),
        retained: RefCell::new(Vec::new()),
        fulfilled: Cell::new(false),
        extra: RefCell::new(None),
    });
    let value = ctx.new_userdata(Rc::new(RequestUserdata { wrapper: wrapper.clone() }))?;
    *wrapper.script_ref.borrow_mut() = Some(ctx.reference(&value));
    *wrapper.callback.borrow_mut() = callback.map(|cb| ctx.reference(cb));
    *wrapper.retained.borrow_mut() = retained.iter().map(|v| ctx.reference(v)).collect();
    Ok((wrapper, value))
}

/// Finish the request carried by `done` with the arguments `build` makes
/// from its result.
pub(crate) fn complete<T>(
    lp: &Loop,
    done: Done<T>,
    build: impl FnOnce(&dyn ScriptContext, &RequestWrapper, UvResult<T>) -> Vec<Value>,
) {
    let Done { req, data, result } = done;
    let wrapper = data.and_then(|data| data.downcast::<RequestWrapper>().ok());
    let (Some(shared), Some(wrapper)) = (shared_of(lp), wrapper) else {
        tracing::warn!(req = req.as_u64(), "completion without a request wrapper");
        return;
    };
    if wrapper.is_fulfilled() {
        tracing::debug!(req = req.as_u64(), "completion for a collected request");
        return;
    }
    let ctx = shared.ctx();
    let args = build(ctx, &wrapper, result);
    wrapper.finish(ctx, args);
}

/// Request data to attach at submission.
pub(crate) fn data_of(wrapper: &Rc<RequestWrapper>) -> Option<Rc<dyn Any>> {
    let data: Rc<dyn Any> = wrapper.clone();
    Some(data)
}

fn check_request(args: &Args<'_>, index: usize) -> AbiResult<Rc<RequestWrapper>> {
    userdata_of::<RequestUserdata>(args.ctx(), args.get(index))
        .map(|ud| ud.wrapper.clone())
        .ok_or_else(|| args.expected(index, "uv_req"))
}

/// `cancel(req)`
pub fn cancel(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_request(&args, 1)?;
    match wrapper.req.get() {
        Some(req) if !wrapper.is_fulfilled() => Ok(result::status(bridge.native().cancel(req))),
        _ => Ok(result::fail(Errno::EINVAL)),
    }
}

/// `req_get_type(req)` returns the type name and its numeric tag.
pub fn get_type(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let wrapper = check_request(&args, 1)?;
    Ok(vec![
        Value::from(wrapper.kind.name()),
        Value::Integer(wrapper.kind.code() as i64),
    ])
}
