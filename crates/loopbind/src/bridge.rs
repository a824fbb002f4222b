//! The bridge: one native loop bound to one scripting runtime

use std::any::Any;
use std::cell::Cell;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use loopbind_sdk::{AbiResult, NativeError, ScriptContext, Value};
use loopbind_uv::{Loop, RunMode};

use crate::config::Config;
use crate::handle::wrapper_of;
use crate::module::{self, FunctionRegistry};
use crate::work::WorkerVms;

// Closing the last handles can complete requests whose callbacks queue
// more work; give up after this many drain passes.
const MAX_DRAIN_PASSES: usize = 4;

/// State reachable from loop callbacks through the loop's user-data slot.
pub(crate) struct Shared {
    ctx: Rc<dyn ScriptContext>,
    workers: Arc<WorkerVms>,
}

impl Shared {
    pub(crate) fn ctx(&self) -> &dyn ScriptContext {
        &*self.ctx
    }

    pub(crate) fn workers(&self) -> &Arc<WorkerVms> {
        &self.workers
    }
}

pub(crate) fn shared_of(lp: &Loop) -> Option<Rc<Shared>> {
    lp.data()?.downcast::<Shared>().ok()
}

/// A native loop plus the bound functions that drive it from script code.
///
/// Create one per scripting runtime with [`Bridge::new`], expose the
/// functions in [`Bridge::functions`] to the runtime and route calls through
/// [`Bridge::call`]. Dropping the bridge (or calling [`Bridge::teardown`])
/// closes every handle, drains outstanding requests and releases worker
/// runtimes.
pub struct Bridge {
    me: Weak<Bridge>,
    shared: Rc<Shared>,
    native: Loop,
    functions: FunctionRegistry,
    mode: Cell<Option<RunMode>>,
    torn_down: Cell<bool>,
}

impl Bridge {
    pub fn new(ctx: Rc<dyn ScriptContext>, config: Config) -> Rc<Bridge> {
        let native = config.make_loop();
        let shared = Rc::new(Shared {
            ctx,
            workers: Arc::new(WorkerVms::new()),
        });
        let data: Rc<dyn Any> = shared.clone();
        native.set_data(Some(data));

        let mut functions = FunctionRegistry::new();
        module::register_all(&mut functions);
        tracing::debug!(
            pool_size = native.pool_size(),
            functions = functions.len(),
            "bridge created"
        );

        Rc::new_cyclic(|me| Bridge {
            me: me.clone(),
            shared,
            native,
            functions,
            mode: Cell::new(None),
            torn_down: Cell::new(false),
        })
    }

    /// Call a bound function by name.
    pub fn call(&self, name: &str, args: &[Value]) -> AbiResult<Vec<Value>> {
        if self.torn_down.get() {
            return Err(NativeError::Lifecycle("loop has been closed".to_string()));
        }
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| NativeError::AbiError(format!("unknown function '{}'", name)))?;
        function(self, args)
    }

    /// Every bound function, by name.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// The constants table.
    pub fn constants(&self) -> Value {
        crate::constants::table()
    }

    pub fn ctx(&self) -> &dyn ScriptContext {
        self.shared.ctx()
    }

    /// The underlying native loop.
    pub fn native(&self) -> &Loop {
        &self.native
    }

    pub(crate) fn weak(&self) -> Weak<Bridge> {
        self.me.clone()
    }

    pub(crate) fn shared(&self) -> &Rc<Shared> {
        &self.shared
    }

    /// Mode of the `run` currently in progress.
    pub fn mode(&self) -> Option<RunMode> {
        self.mode.get()
    }

    pub(crate) fn set_mode(&self, mode: Option<RunMode>) -> Option<RunMode> {
        self.mode.replace(mode)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.get()
    }

    /// Shut the loop down. Handles are closed without calling back into
    /// script code; requests still in flight complete normally. Runs once.
    pub fn teardown(&self) {
        if self.torn_down.replace(true) {
            return;
        }
        tracing::debug!(
            handles = self.native.handle_count(),
            requests = self.native.pending_requests(),
            "tearing down bridge"
        );

        let ctx = self.ctx();
        for _ in 0..MAX_DRAIN_PASSES {
            let mut open = Vec::new();
            self.native.walk(|id, _| open.push(id));
            for id in open {
                if let Some(wrapper) = wrapper_of(&self.native, id) {
                    wrapper.release(ctx);
                }
                if !self.native.is_closing(id) {
                    if let Err(err) = self.native.close_handle(id, None) {
                        tracing::warn!(handle = %id, %err, "close during teardown failed");
                    }
                }
            }
            self.native.run(RunMode::Default);
            if self.native.handle_count() == 0 && self.native.pending_requests() == 0 {
                break;
            }
        }

        if let Err(err) = self.native.close() {
            tracing::warn!(
                %err,
                handles = self.native.handle_count(),
                requests = self.native.pending_requests(),
                "loop still busy after teardown"
            );
        }
        self.native.shutdown_pool();
        let released = self.shared.workers().release_all();
        self.native.set_data(None);
        tracing::debug!(worker_runtimes = released, "bridge torn down");
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopbind_testkit::MockRuntime;

    #[test]
    fn test_unknown_function() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let err = bridge.call("no_such_function", &[]).unwrap_err();
        assert_eq!(err.to_string(), "unknown function 'no_such_function'");
    }

    #[test]
    fn test_teardown_closes_handles_without_calling_script() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let calls = Rc::new(Cell::new(0));
        let cb = {
            let calls = calls.clone();
            rt.function(move |_, _| {
                calls.set(calls.get() + 1);
                Ok(vec![])
            })
        };
        let timer = bridge.call("new_timer", &[]).unwrap().remove(0);
        bridge
            .call("timer_start", &[timer.clone(), Value::Integer(0), Value::Integer(0), cb.clone()])
            .unwrap();
        let idle = bridge.call("new_idle", &[]).unwrap().remove(0);
        bridge.call("close", &[idle, cb]).unwrap();

        bridge.teardown();
        assert_eq!(calls.get(), 0);
        assert_eq!(bridge.native().handle_count(), 0);
        assert_eq!(rt.live_refs(), 0);
        assert!(bridge.is_torn_down());
        assert!(matches!(
            bridge.call("new_timer", &[]),
            Err(NativeError::Lifecycle(_))
        ));
        // A second teardown is a no-op.
        bridge.teardown();
    }
}
