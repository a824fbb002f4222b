//! Work requests on the blocking pool
//!
//! `new_work` captures a function as a chunk that worker runtimes can load.
//! `queue_work` runs it on a pool thread inside that thread's own runtime
//! and hands the returned values to the after-work callback on the loop
//! thread.
//!
//! A pool thread acquires its runtime on first use and keeps it for the
//! life of the loop; [`WorkerVms::release_all`] hands every one back
//! exactly once when the bridge is torn down.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use loopbind_sdk::{userdata_of, AbiResult, ScriptContext, ScriptRuntime, StrongRef, ThreadValue, Userdata, Value};
use loopbind_uv::{Done, Loop, ReqType};
use parking_lot::Mutex;

use crate::args::Args;
use crate::async_handle::from_thread_values;
use crate::bridge::Bridge;
use crate::config::{require_thread_hooks, ThreadHooks};
use crate::request::{self, RequestWrapper};
use crate::result;

// ============================================================================
// Worker runtimes
// ============================================================================

type VmSlot = Mutex<Option<Box<dyn ScriptRuntime>>>;

static NEXT_REGISTRY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Runtimes this OS thread holds, by registry id.
    static LOCAL_VMS: RefCell<Vec<(u64, Arc<VmSlot>)>> = const { RefCell::new(Vec::new()) };
}

/// Runtimes handed to the pool threads of one loop.
pub struct WorkerVms {
    id: u64,
    slots: Mutex<Vec<Arc<VmSlot>>>,
}

impl WorkerVms {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_REGISTRY.fetch_add(1, Ordering::Relaxed),
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Runtimes acquired so far.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn local_slot(&self, hooks: ThreadHooks) -> Option<Arc<VmSlot>> {
        let found = LOCAL_VMS.with(|local| {
            local
                .borrow()
                .iter()
                .find(|(id, _)| *id == self.id)
                .map(|(_, slot)| slot.clone())
        });
        if found.is_some() {
            return found;
        }

        let mut vm = (hooks.acquire)()?;
        vm.set_global("_THREAD", ThreadValue::Boolean(true));
        let slot = Arc::new(Mutex::new(Some(vm)));
        self.slots.lock().push(slot.clone());
        LOCAL_VMS.with(|local| local.borrow_mut().push((self.id, slot.clone())));
        tracing::debug!(registry = self.id, "worker runtime acquired");
        Some(slot)
    }

    /// Run `f` with the calling thread's runtime, acquiring it on first
    /// use. `None` if no runtime is available.
    pub(crate) fn with_runtime<R>(
        &self,
        hooks: ThreadHooks,
        f: impl FnOnce(&mut dyn ScriptRuntime) -> R,
    ) -> Option<R> {
        let slot = self.local_slot(hooks)?;
        let mut guard = slot.lock();
        let vm = guard.as_mut()?;
        Some(f(vm.as_mut()))
    }

    /// Release every runtime through the installed hook. Returns how many
    /// were released; a second call releases nothing.
    pub fn release_all(&self) -> usize {
        let slots: Vec<Arc<VmSlot>> = self.slots.lock().drain(..).collect();
        let Some(hooks) = crate::config::thread_hooks() else {
            return 0;
        };
        let mut released = 0;
        for slot in slots {
            if let Some(vm) = slot.lock().take() {
                (hooks.release)(vm);
                released += 1;
            }
        }
        released
    }
}

// ============================================================================
// Work context
// ============================================================================

/// Load `entry` as a chunk: strings are taken as-is, functions are dumped.
pub(crate) fn entry_chunk(args: &Args<'_>, index: usize) -> AbiResult<Vec<u8>> {
    match args.get(index) {
        Value::String(bytes) => Ok(bytes.clone()),
        value if args.ctx().is_callable(value) => args.ctx().dump_function(value),
        _ => Err(args.expected(index, "function")),
    }
}

pub(crate) struct WorkCtx {
    chunk: Arc<Vec<u8>>,
    after_work: RefCell<Option<StrongRef>>,
}

impl Userdata for WorkCtx {
    fn type_name(&self) -> &'static str {
        "luv_work_ctx"
    }

    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn finalize(&self, ctx: &dyn ScriptContext) {
        if let Some(after_work) = self.after_work.borrow_mut().take() {
            ctx.release(after_work);
        }
    }
}

/// Values a worker returned, carried back to the loop thread.
type Returned = Arc<Mutex<Option<Vec<ThreadValue>>>>;

fn run_work(workers: &WorkerVms, hooks: ThreadHooks, chunk: &[u8], args: Vec<ThreadValue>) -> Vec<ThreadValue> {
    let outcome = workers.with_runtime(hooks, |vm| vm.execute(chunk, "=work", args));
    match outcome {
        Some(Ok(values)) => values,
        Some(Err(err)) => {
            tracing::error!(%err, "Uncaught Error in work callback");
            Vec::new()
        }
        None => {
            tracing::error!("no runtime available for work callback");
            Vec::new()
        }
    }
}

fn after_work_cb(lp: &Loop, done: Done<()>) {
    request::complete(lp, done, |ctx, wrapper: &RequestWrapper, result| {
        let returned = match result {
            Ok(()) => wrapper
                .extra::<Returned>()
                .and_then(|slot| slot.lock().take())
                .unwrap_or_default(),
            Err(err) => {
                tracing::debug!(%err, "work request did not run");
                Vec::new()
            }
        };
        from_thread_values(lp, ctx, returned)
    });
}

/// `new_work(work, [after_work])`
pub fn new_work(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let chunk = entry_chunk(&args, 1)?;
    let after_work = args.opt_callable(2)?.map(|cb| args.ctx().reference(cb));
    let work = Rc::new(WorkCtx {
        chunk: Arc::new(chunk),
        after_work: RefCell::new(after_work),
    });
    Ok(vec![args.ctx().new_userdata(work)?])
}

/// `queue_work(work_ctx, ...)` runs the work function with the remaining
/// arguments (at most nine, deep-copied).
pub fn queue_work(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
    let args = Args::new(bridge.ctx(), values);
    let work = userdata_of::<WorkCtx>(args.ctx(), args.get(1)).ok_or_else(|| args.expected(1, "luv_work_ctx"))?;
    let payload = args.thread_values(2)?;
    let hooks = require_thread_hooks()?;

    let after_work = work.after_work.borrow().as_ref().map(|r| args.ctx().resolve(r));
    let (wrapper, _) = request::new_request(bridge, ReqType::Work, after_work.as_ref(), &[args.get(1)])?;
    let returned: Returned = Arc::new(Mutex::new(None));
    wrapper.set_extra(Rc::new(returned.clone()));

    let workers = bridge.shared().workers().clone();
    let chunk = work.chunk.clone();
    let job = move || {
        let values = run_work(&workers, hooks, &chunk, payload);
        *returned.lock() = Some(values);
    };
    match bridge.native().queue_work(request::data_of(&wrapper), job, after_work_cb) {
        Ok(req) => {
            wrapper.submitted(req);
            Ok(vec![Value::Boolean(true)])
        }
        Err(err) => {
            wrapper.discard(args.ctx());
            Ok(result::fail(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use loopbind_testkit::{acquire_vm, release_vm, MockRuntime};

    #[test]
    fn test_entry_must_be_function_or_chunk() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let err = bridge.call("new_work", &[Value::Integer(1)]).unwrap_err();
        assert_eq!(err.to_string(), "bad argument #1 (function expected, got number)");
        let ctx = bridge.call("new_work", &[Value::from("fn:echo")]).unwrap().remove(0);
        assert_eq!(rt.type_name(&ctx), "luv_work_ctx");
    }

    #[test]
    fn test_work_results_reach_after_work() {
        crate::set_thread_hooks(acquire_vm, release_vm);
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new().with_threadpool_size(2));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let after = {
            let seen = seen.clone();
            rt.function(move |_, args| {
                seen.borrow_mut().push(args);
                Ok(vec![])
            })
        };
        let work = rt.named_function("echo");
        let ctx = bridge.call("new_work", &[work, after]).unwrap().remove(0);
        for i in 0..3 {
            let out = bridge
                .call("queue_work", &[ctx.clone(), Value::Integer(i), Value::from("x")])
                .unwrap();
            assert_eq!(out, vec![Value::Boolean(true)]);
        }
        bridge.call("run", &[]).unwrap();

        let mut seen = seen.borrow().clone();
        seen.sort_by_key(|args| args[0].as_integer());
        assert_eq!(
            seen,
            (0..3)
                .map(|i| vec![Value::Integer(i), Value::from("x")])
                .collect::<Vec<_>>()
        );
        assert!(bridge.shared().workers().len() <= 2);
    }

    #[test]
    fn test_worker_errors_yield_no_values() {
        crate::set_thread_hooks(acquire_vm, release_vm);
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new().with_threadpool_size(1));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let after = {
            let seen = seen.clone();
            rt.function(move |_, args| {
                seen.borrow_mut().push(args);
                Ok(vec![])
            })
        };
        let ctx = bridge
            .call("new_work", &[rt.named_function("fail"), after])
            .unwrap()
            .remove(0);
        bridge.call("queue_work", &[ctx]).unwrap();
        bridge.call("run", &[]).unwrap();
        assert_eq!(*seen.borrow(), vec![Vec::<Value>::new()]);
    }
}
